use audiopus::coder::{Decoder as RawDecoder, Encoder as RawEncoder};
use audiopus::packet::Packet;
use audiopus::{Application, Bitrate, Channels, MutSignals, SampleRate, Signal};
use proxvoice_protocol::types::CaptureInfo;

use crate::codec::{check_frame, AudioDecoder, AudioEncoder, CodecError};

/// Opus output buffer. Frames larger than the MTU are rejected by the
/// encoder instead of being fragmented.
const MAX_PACKET: usize = 1275;

fn sample_rate(hz: u32) -> Result<SampleRate, CodecError> {
    match hz {
        8_000 => Ok(SampleRate::Hz8000),
        12_000 => Ok(SampleRate::Hz12000),
        16_000 => Ok(SampleRate::Hz16000),
        24_000 => Ok(SampleRate::Hz24000),
        48_000 => Ok(SampleRate::Hz48000),
        other => Err(CodecError::UnsupportedSampleRate(other)),
    }
}

fn application(mode: &str) -> Result<Application, CodecError> {
    match mode.to_ascii_uppercase().as_str() {
        "VOIP" => Ok(Application::Voip),
        "AUDIO" => Ok(Application::Audio),
        "RESTRICTED_LOWDELAY" | "LOWDELAY" => Ok(Application::LowDelay),
        _ => Err(CodecError::UnsupportedMode(mode.to_string())),
    }
}

/// `-1000` is auto, `-1` is max, anything else is bits per second.
fn bitrate(value: i32) -> Bitrate {
    match value {
        -1000 => Bitrate::Auto,
        -1 => Bitrate::Max,
        bps => Bitrate::BitsPerSecond(bps),
    }
}

/// Mono Opus encoder configured from the server's capture parameters.
pub struct OpusEncoder {
    inner: RawEncoder,
    frame_size: usize,
    max_packet: usize,
}

impl OpusEncoder {
    pub fn new(info: &CaptureInfo) -> Result<Self, CodecError> {
        let mut inner = RawEncoder::new(
            sample_rate(info.sample_rate)?,
            Channels::Mono,
            application(&info.opus_mode)?,
        )?;
        inner.set_bitrate(bitrate(info.bitrate))?;
        inner.set_inband_fec(true)?;
        inner.set_packet_loss_perc(15)?;
        inner.set_signal(Signal::Voice)?;

        Ok(Self {
            inner,
            frame_size: info.frame_size as usize,
            max_packet: (info.mtu_size as usize).clamp(64, MAX_PACKET),
        })
    }
}

impl AudioEncoder for OpusEncoder {
    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>, CodecError> {
        check_frame(pcm, self.frame_size)?;
        let mut output = vec![0u8; self.max_packet];
        let len = self.inner.encode_float(pcm, &mut output)?;
        output.truncate(len);
        Ok(output)
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        self.inner.reset_state()?;
        Ok(())
    }
}

/// One decoder per remote source.
pub struct OpusDecoder {
    inner: RawDecoder,
    frame_size: usize,
}

impl OpusDecoder {
    pub fn new(info: &CaptureInfo) -> Result<Self, CodecError> {
        Ok(Self {
            inner: RawDecoder::new(sample_rate(info.sample_rate)?, Channels::Mono)?,
            frame_size: info.frame_size as usize,
        })
    }
}

impl AudioDecoder for OpusDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError> {
        let mut output = vec![0.0f32; self.frame_size];
        let packet = Packet::try_from(data)?;
        let signals = MutSignals::try_from(&mut output)?;
        let samples = self.inner.decode_float(Some(packet), signals, false)?;
        output.truncate(samples);
        Ok(output)
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        self.inner.reset_state()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> CaptureInfo {
        CaptureInfo {
            sample_rate: 48_000,
            frame_size: 960,
            mtu_size: 1024,
            opus_mode: "VOIP".into(),
            bitrate: 48_000,
        }
    }

    #[test]
    fn encode_decode_frame() {
        let mut encoder = OpusEncoder::new(&info()).unwrap();
        let mut decoder = OpusDecoder::new(&info()).unwrap();
        let frame: Vec<f32> = (0..960).map(|i| ((i as f32) * 0.05).sin() * 0.3).collect();

        let bytes = encoder.encode(&frame).unwrap();
        assert!(!bytes.is_empty());
        assert!(bytes.len() <= 1024);
        assert_eq!(decoder.decode(&bytes).unwrap().len(), 960);
    }

    #[test]
    fn rejects_unknown_parameters() {
        let mut bad_rate = info();
        bad_rate.sample_rate = 44_100;
        assert!(matches!(
            OpusEncoder::new(&bad_rate),
            Err(CodecError::UnsupportedSampleRate(44_100))
        ));

        let mut bad_mode = info();
        bad_mode.opus_mode = "KARAOKE".into();
        assert!(matches!(OpusEncoder::new(&bad_mode), Err(CodecError::UnsupportedMode(_))));
    }

    #[test]
    fn bitrate_presets() {
        assert!(matches!(bitrate(-1000), Bitrate::Auto));
        assert!(matches!(bitrate(-1), Bitrate::Max));
        assert!(matches!(bitrate(32_000), Bitrate::BitsPerSecond(32_000)));
    }
}
