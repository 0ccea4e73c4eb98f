//! Proximity voice server.
//!
//! Embed it by implementing [`hooks::PlayerLookup`] (and optionally
//! [`hooks::ServerHooks`] / [`hooks::PermissionSupplier`]), then drive a
//! [`VoiceServer`] through `initialize`, `load_config` and `shutdown`.

pub mod config;
pub mod debug;
pub mod error;
pub mod hooks;
pub mod mute;
pub mod routing;
pub mod server;
pub mod session;
pub mod state;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use config::{ConfigSnapshot, ServerConfig};
pub use error::ServerError;
pub use hooks::{Collaborators, MemoryLookup, PermissionSupplier, PlayerLookup, ServerHooks, VoicePlayer};
pub use server::VoiceServer;
pub use udp::UdpServer;
