//! Length-prefixed framing for the TCP control channel.

use bytes::{Buf, BytesMut};

use crate::error::ProtocolError;

/// Maximum TCP message size: 64 KiB.
pub const MAX_MSG_SIZE: u32 = 65_536;

/// Application version, read from Cargo.toml at compile time.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix an encoded message with its 4-byte big-endian length.
pub fn encode_frame(message: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if message.len() > MAX_MSG_SIZE as usize {
        return Err(ProtocolError::MessageTooLarge(message.len()));
    }
    let mut buf = Vec::with_capacity(4 + message.len());
    buf.extend_from_slice(&(message.len() as u32).to_be_bytes());
    buf.extend_from_slice(message);
    Ok(buf)
}

/// Attempt to extract one complete length-prefixed frame from a byte buffer.
///
/// Returns `Ok(Some(payload))` if a complete message is available,
/// `Ok(None)` if more data is needed, or `Err` if the message is too large.
///
/// Advances the buffer past the consumed frame.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_MSG_SIZE as usize {
        return Err(ProtocolError::MessageTooLarge(length));
    }

    if buf.len() < 4 + length {
        return Ok(None);
    }

    buf.advance(4);
    let payload = buf.split_to(length).to_vec();
    Ok(Some(payload))
}
