//! Audio side of the proxvoice transport.
//!
//! - [`codec`]: the encoder/decoder boundary (raw PCM, or Opus behind the
//!   `opus` feature)
//! - [`vad`]: level-based voice activity detection
//! - [`activation`]: decides per captured frame which activations are active
//! - [`pipeline`]: sequencing, encoding and end-of-burst markers
//! - [`source`]: receive-side per-source decode state

pub mod activation;
pub mod codec;
#[cfg(feature = "opus")]
pub mod opus;
pub mod pipeline;
pub mod source;
pub mod vad;

pub use activation::{ActivationEngine, ActivationOverride, FrameDecision, KeyState};
pub use codec::{AudioDecoder, AudioEncoder, CodecError};
pub use pipeline::{CapturePipeline, Outgoing, Sequencer};
pub use source::{SourceStream, SourceStreams, StreamStats};
