//! Proximity voice client transport.
//!
//! [`VoiceClient::connect`] performs the TCP handshake, derives the UDP
//! cipher from the returned `ServerInfo` and spawns the background tasks.
//! Captured frames go in through [`VoiceClient::capture_frame`]; decoded
//! audio and control changes come out as [`ClientEvent`]s.

pub mod config;
pub mod connection;
pub mod error;

pub use config::ClientConfig;
pub use connection::{ClientEvent, ConnectOptions, TlsMode, VoiceClient};
pub use error::ClientError;
