use std::path::PathBuf;

use proxvoice_crypto::EncryptionError;
use proxvoice_protocol::activation::ActivationError;
use proxvoice_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to access {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to write default config: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("invalid config value: {0}")]
    InvalidConfig(String),

    #[error("invalid activation config: {0}")]
    Activation(#[from] ActivationError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("failed to bind {what} on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS setup failed: {0:#}")]
    Tls(anyhow::Error),

    #[error("mute storage failed: {0:#}")]
    MuteStorage(anyhow::Error),

    #[error("player {0} already has a session")]
    DuplicateSession(uuid::Uuid),

    #[error("session channel closed")]
    ChannelClosed,

    #[error("session channel full, client is not reading")]
    ChannelFull,

    #[error("voice server has no config loaded")]
    NotReady,
}
