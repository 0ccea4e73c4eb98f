use proxvoice_audio::CodecError;
use proxvoice_crypto::EncryptionError;
use proxvoice_protocol::activation::ActivationError;
use proxvoice_protocol::types::RejectReason;
use proxvoice_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid address {0:?}, expected host:port")]
    InvalidAddress(String),

    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Tls(std::io::Error),

    #[error("invalid server name: {0}")]
    ServerName(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("server sent invalid activations: {0}")]
    Activation(#[from] ActivationError),

    #[error("connection rejected ({reason:?}): {message}")]
    Rejected { reason: RejectReason, message: String },

    #[error("server did not answer the handshake in time")]
    HandshakeTimeout,

    #[error("server closed the connection")]
    ConnectionClosed,

    #[error("unexpected packet during handshake: opcode 0x{0:02x}")]
    UnexpectedPacket(u8),

    #[error("failed to {action} {path}: {reason}")]
    Config {
        action: &'static str,
        path: String,
        reason: String,
    },
}
