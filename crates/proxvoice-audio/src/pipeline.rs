//! Capture side: activation decisions in, wire packets out.

use std::collections::HashMap;

use proxvoice_protocol::tcp::PlayerAudioEnd;
use proxvoice_protocol::udp::PlayerAudio;

use crate::activation::{ActivationEngine, FrameDecision};
use crate::codec::{check_frame, AudioEncoder, CodecError};

/// Sequence numbers for one activation. Never reset between bursts.
#[derive(Debug, Default, Clone)]
pub struct Sequencer {
    next: u64,
    last: Option<u64>,
}

impl Sequencer {
    pub fn next(&mut self) -> u64 {
        let sequence = self.next;
        self.next = self.next.saturating_add(1);
        self.last = Some(sequence);
        sequence
    }

    /// The last number handed out.
    pub fn last(&self) -> Option<u64> {
        self.last
    }
}

/// What the capture loop sends for a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Sent over UDP.
    Audio(PlayerAudio),
    /// Sent over TCP.
    End(PlayerAudioEnd),
}

pub struct CapturePipeline {
    engine: ActivationEngine,
    encoder: Box<dyn AudioEncoder>,
    sequencers: HashMap<String, Sequencer>,
    speaking: bool,
}

impl CapturePipeline {
    pub fn new(engine: ActivationEngine, encoder: Box<dyn AudioEncoder>) -> Self {
        Self {
            engine,
            encoder,
            sequencers: HashMap::new(),
            speaking: false,
        }
    }

    pub fn engine(&self) -> &ActivationEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ActivationEngine {
        &mut self.engine
    }

    /// Swap the encoder after the server changed capture parameters.
    pub fn set_encoder(&mut self, encoder: Box<dyn AudioEncoder>) {
        self.encoder = encoder;
        self.speaking = false;
    }

    pub fn frame_size(&self) -> usize {
        self.encoder.frame_size()
    }

    /// Run one captured frame through the engine and encoder.
    ///
    /// The frame is encoded at most once and shared by every active
    /// activation. The encoder is reset when the last burst ends.
    pub fn process(&mut self, pcm: &[f32]) -> Result<Vec<Outgoing>, CodecError> {
        check_frame(pcm, self.encoder.frame_size())?;
        let decisions = self.engine.process(pcm);

        let mut encoded: Option<Vec<u8>> = None;
        let mut out = Vec::new();
        for decision in &decisions {
            if decision.active {
                let data = match &encoded {
                    Some(data) => data.clone(),
                    None => {
                        let data = self.encoder.encode(pcm)?;
                        encoded = Some(data.clone());
                        data
                    }
                };
                let sequence = self.sequencers.entry(decision.activation.clone()).or_default().next();
                out.push(Outgoing::Audio(PlayerAudio {
                    sequence,
                    activation: decision.activation.clone(),
                    distance: decision.distance,
                    data,
                }));
            } else if decision.burst_ended {
                out.push(self.end_marker(decision));
            }
        }

        let speaking = decisions.iter().any(|d| d.active);
        if self.speaking && !speaking {
            self.encoder.reset()?;
        }
        self.speaking = speaking;
        Ok(out)
    }

    /// End markers for activations removed by a config update.
    pub fn ended(&self, decisions: &[FrameDecision]) -> Vec<Outgoing> {
        decisions
            .iter()
            .filter(|d| d.burst_ended)
            .map(|d| self.end_marker(d))
            .collect()
    }

    /// Close every running burst, e.g. before disconnecting.
    pub fn end_all(&mut self) -> Result<Vec<Outgoing>, CodecError> {
        let decisions = self.engine.release_all();
        if self.speaking {
            self.encoder.reset()?;
            self.speaking = false;
        }
        Ok(self.ended(&decisions))
    }

    fn end_marker(&self, decision: &FrameDecision) -> Outgoing {
        let sequence = self
            .sequencers
            .get(&decision.activation)
            .and_then(Sequencer::last)
            .unwrap_or(0);
        Outgoing::End(PlayerAudioEnd {
            activation: decision.activation.clone(),
            sequence,
            distance: decision.distance,
        })
    }
}
