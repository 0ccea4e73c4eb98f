use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet too short: expected at least {expected} bytes, got {got}")]
    PacketTooShort { expected: usize, got: usize },

    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("message too large: {0} bytes (max 65536)")]
    MessageTooLarge(usize),

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("invalid length prefix: {0}")]
    InvalidLength(i64),

    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u64 },

    #[error("{0} trailing bytes after packet body")]
    TrailingBytes(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the error breaks the byte stream itself.
    ///
    /// Everything else is confined to one message and the caller can drop
    /// that message and keep reading.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MessageTooLarge(_) | Self::Io(_))
    }
}
