//! Receive side: one decode stream per (source, line).
//!
//! Every frame that decodes is played, in arrival order. Sequence numbers
//! only feed [`StreamStats`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use proxvoice_protocol::tcp::SourceAudioEnd;
use proxvoice_protocol::udp::SourceAudio;
use tracing::debug;
use uuid::Uuid;

use crate::codec::{AudioDecoder, CodecError};

/// A stream with no packets for this long is treated as ended even if its
/// end marker was lost.
pub const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Closed streams idle for this long are forgotten.
pub const EVICT_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub received: u64,
    /// Sequence numbers skipped over. Late arrivals are subtracted again.
    pub lost: u64,
    /// Frames at or below the highest sequence seen.
    pub reordered: u64,
    pub decode_errors: u64,
    pub bursts: u64,
}

pub struct SourceStream {
    decoder: Box<dyn AudioDecoder>,
    highest: Option<u64>,
    last_packet: Instant,
    open: bool,
    stats: StreamStats,
}

impl SourceStream {
    pub fn new(decoder: Box<dyn AudioDecoder>, now: Instant) -> Self {
        Self {
            decoder,
            highest: None,
            last_packet: now,
            open: false,
            stats: StreamStats::default(),
        }
    }

    /// Decode one frame.
    pub fn push(&mut self, sequence: u64, data: &[u8], now: Instant) -> Result<Vec<f32>, CodecError> {
        self.last_packet = now;
        self.open = true;
        self.stats.received += 1;
        match self.highest {
            Some(highest) if sequence <= highest => {
                self.stats.reordered += 1;
                self.stats.lost = self.stats.lost.saturating_sub(1);
            }
            Some(highest) => {
                self.stats.lost += sequence - highest - 1;
                self.highest = Some(sequence);
            }
            None => self.highest = Some(sequence),
        }

        self.decoder.decode(data).inspect_err(|_| self.stats.decode_errors += 1)
    }

    /// End of burst: flush decoder state. `sequence` is the sender's last.
    pub fn end(&mut self, sequence: u64) -> Result<(), CodecError> {
        if let Some(highest) = self.highest {
            if sequence > highest {
                self.stats.lost += sequence - highest;
                self.highest = Some(sequence);
            }
        }
        self.close()
    }

    /// Close the stream if it has been silent for [`CLOSE_TIMEOUT`].
    /// Returns whether it was closed by this call.
    pub fn expire(&mut self, now: Instant) -> Result<bool, CodecError> {
        if self.open && now.saturating_duration_since(self.last_packet) >= CLOSE_TIMEOUT {
            self.close()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    fn close(&mut self) -> Result<(), CodecError> {
        if self.open {
            self.open = false;
            self.stats.bursts += 1;
        }
        self.decoder.reset()
    }
}

pub type DecoderFactory = Box<dyn Fn() -> Result<Box<dyn AudioDecoder>, CodecError> + Send + Sync>;

/// All remote sources heard by this client.
pub struct SourceStreams {
    streams: HashMap<(Uuid, String), SourceStream>,
    factory: DecoderFactory,
}

impl SourceStreams {
    pub fn new(factory: DecoderFactory) -> Self {
        Self {
            streams: HashMap::new(),
            factory,
        }
    }

    /// Replace the decoder factory (new capture parameters). Existing
    /// streams are dropped.
    pub fn set_factory(&mut self, factory: DecoderFactory) {
        self.factory = factory;
        self.streams.clear();
    }

    pub fn push(&mut self, audio: &SourceAudio, now: Instant) -> Result<Vec<f32>, CodecError> {
        let key = (audio.source_id, audio.line.clone());
        let stream = match self.streams.entry(key) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                debug!(source = %audio.source_id, line = %audio.line, "new source stream");
                entry.insert(SourceStream::new((self.factory)()?, now))
            }
        };
        stream.push(audio.sequence, &audio.data, now)
    }

    /// Returns `false` for an end marker of a stream never heard.
    pub fn end(&mut self, end: &SourceAudioEnd) -> Result<bool, CodecError> {
        match self.streams.get_mut(&(end.source_id, end.line.clone())) {
            Some(stream) => {
                stream.end(end.sequence)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close silent streams and forget long idle ones. Returns the streams
    /// closed by timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<(Uuid, String)> {
        let mut closed = Vec::new();
        self.streams.retain(|key, stream| {
            match stream.expire(now) {
                Ok(true) => closed.push(key.clone()),
                Ok(false) => {}
                Err(e) => debug!(source = %key.0, line = %key.1, "decoder reset failed: {e}"),
            }
            stream.is_open() || now.saturating_duration_since(stream.last_packet) < EVICT_AFTER
        });
        closed
    }

    pub fn remove_source(&mut self, source_id: &Uuid) {
        self.streams.retain(|(id, _), _| id != source_id);
    }

    pub fn stats(&self, source_id: &Uuid, line: &str) -> Option<StreamStats> {
        self.streams.get(&(*source_id, line.to_string())).map(SourceStream::stats)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
