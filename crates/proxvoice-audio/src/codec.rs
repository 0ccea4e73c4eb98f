//! Codec boundary.
//!
//! The transport only needs "PCM frame in, bytes out" and back. Frames are
//! mono f32 samples in `[-1.0, 1.0]`, exactly `frame_size` long.

use proxvoice_protocol::types::CaptureInfo;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame must be exactly {expected} samples, got {got}")]
    FrameSize { expected: usize, got: usize },

    #[error("unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),

    #[error("unsupported codec mode: {0}")]
    UnsupportedMode(String),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[cfg(feature = "opus")]
    #[error("opus error: {0}")]
    Opus(#[from] audiopus::Error),
}

pub trait AudioEncoder: Send {
    /// Samples per input frame.
    fn frame_size(&self) -> usize;

    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>, CodecError>;

    /// Drop inter-frame state before a new talk burst.
    fn reset(&mut self) -> Result<(), CodecError>;
}

pub trait AudioDecoder: Send {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError>;

    fn reset(&mut self) -> Result<(), CodecError>;
}

/// Uncompressed 16-bit big-endian PCM.
pub struct PcmEncoder {
    frame_size: usize,
}

impl PcmEncoder {
    pub fn new(frame_size: usize) -> Self {
        Self { frame_size }
    }
}

impl AudioEncoder for PcmEncoder {
    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>, CodecError> {
        check_frame(pcm, self.frame_size)?;
        let mut out = Vec::with_capacity(pcm.len() * 2);
        for sample in pcm {
            let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            out.extend_from_slice(&value.to_be_bytes());
        }
        Ok(out)
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct PcmDecoder;

impl AudioDecoder for PcmDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError> {
        if data.len() % 2 != 0 {
            return Err(CodecError::Malformed("odd PCM byte count"));
        }
        Ok(data
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_be_bytes([pair[0], pair[1]])) / f32::from(i16::MAX))
            .collect())
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
}

pub(crate) fn check_frame(pcm: &[f32], frame_size: usize) -> Result<(), CodecError> {
    if pcm.len() != frame_size {
        return Err(CodecError::FrameSize {
            expected: frame_size,
            got: pcm.len(),
        });
    }
    Ok(())
}

/// Codec choice for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Pcm,
    #[cfg(feature = "opus")]
    Opus,
}

impl CodecKind {
    /// Opus when it is compiled in.
    pub fn preferred() -> Self {
        #[cfg(feature = "opus")]
        {
            Self::Opus
        }
        #[cfg(not(feature = "opus"))]
        {
            Self::Pcm
        }
    }
}

pub fn create_encoder(kind: CodecKind, info: &CaptureInfo) -> Result<Box<dyn AudioEncoder>, CodecError> {
    match kind {
        CodecKind::Pcm => Ok(Box::new(PcmEncoder::new(info.frame_size as usize))),
        #[cfg(feature = "opus")]
        CodecKind::Opus => Ok(Box::new(crate::opus::OpusEncoder::new(info)?)),
    }
}

#[cfg_attr(not(feature = "opus"), allow(unused_variables))]
pub fn create_decoder(kind: CodecKind, info: &CaptureInfo) -> Result<Box<dyn AudioDecoder>, CodecError> {
    match kind {
        CodecKind::Pcm => Ok(Box::new(PcmDecoder)),
        #[cfg(feature = "opus")]
        CodecKind::Opus => Ok(Box::new(crate::opus::OpusDecoder::new(info)?)),
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
            bitrate: -1000,
        }
    }

    #[test]
    fn pcm_roundtrip_is_close() {
        let mut encoder = create_encoder(CodecKind::Pcm, &info()).unwrap();
        let mut decoder = create_decoder(CodecKind::Pcm, &info()).unwrap();
        let frame: Vec<f32> = (0..960).map(|i| ((i as f32) * 0.01).sin() * 0.5).collect();

        let bytes = encoder.encode(&frame).unwrap();
        assert_eq!(bytes.len(), 960 * 2);
        let decoded = decoder.decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 960);
        for (a, b) in frame.iter().zip(&decoded) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn wrong_frame_size_is_an_error() {
        let mut encoder = PcmEncoder::new(960);
        assert!(matches!(
            encoder.encode(&[0.0; 480]),
            Err(CodecError::FrameSize { expected: 960, got: 480 })
        ));
    }

    #[test]
    fn pcm_clamps_out_of_range() {
        let mut encoder = PcmEncoder::new(2);
        let bytes = encoder.encode(&[4.0, -4.0]).unwrap();
        assert_eq!(&bytes[..2], &i16::MAX.to_be_bytes());
        assert_eq!(&bytes[2..], &(-i16::MAX).to_be_bytes());
    }

    #[test]
    fn odd_pcm_is_malformed() {
        assert!(PcmDecoder.decode(&[1, 2, 3]).is_err());
    }
}
