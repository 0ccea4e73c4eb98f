//! Media channel datagrams.
//!
//! A datagram is `[session secret: 16 bytes][ciphertext]`. The secret is sent
//! in the clear and only selects the session; the ciphertext decrypts to an
//! encoded [`UdpPacket`].

use uuid::Uuid;

use crate::error::ProtocolError;
use crate::io::{Reader, Wire, Writer};
pub use crate::tcp::{Ping, Pong};

/// Length of the cleartext session secret prefix.
pub const SECRET_LEN: usize = 16;

/// Largest datagram the receive loops accept.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// One encoded frame from a speaking client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerAudio {
    /// Monotonic per (session, activation). Diagnostic only.
    pub sequence: u64,
    pub activation: String,
    /// `0` when the activation has no distance.
    pub distance: u16,
    pub data: Vec<u8>,
}

impl Wire for PlayerAudio {
    fn write(&self, w: &mut Writer) {
        w.write_u64(self.sequence);
        w.write_string(&self.activation);
        w.write_u16(self.distance);
        w.write_byte_array(&self.data);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            sequence: r.read_u64()?,
            activation: r.read_string()?,
            distance: r.read_u16()?,
            data: r.read_byte_array()?,
        })
    }
}

/// A routed frame as delivered to a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAudio {
    pub sequence: u64,
    pub source_id: Uuid,
    pub line: String,
    pub distance: u16,
    pub data: Vec<u8>,
}

impl Wire for SourceAudio {
    fn write(&self, w: &mut Writer) {
        w.write_u64(self.sequence);
        w.write_uuid(&self.source_id);
        w.write_string(&self.line);
        w.write_u16(self.distance);
        w.write_byte_array(&self.data);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            sequence: r.read_u64()?,
            source_id: r.read_uuid()?,
            line: r.read_string()?,
            distance: r.read_u16()?,
            data: r.read_byte_array()?,
        })
    }
}

packet_registry! {
    /// Decrypted UDP payloads, both directions.
    pub enum UdpPacket {
        PlayerAudio = 0x40,
        SourceAudio = 0x41,
        Ping = 0x42,
        Pong = 0x43,
    }
}

/// Split a datagram into its session secret and encrypted payload.
pub fn split_datagram(datagram: &[u8]) -> Result<(Uuid, &[u8]), ProtocolError> {
    if datagram.len() < SECRET_LEN {
        return Err(ProtocolError::PacketTooShort {
            expected: SECRET_LEN,
            got: datagram.len(),
        });
    }
    let mut r = Reader::new(datagram);
    let secret = r.read_uuid()?;
    Ok((secret, r.remaining()))
}

/// Prefix an encrypted payload with the session secret.
pub fn build_datagram(secret: &Uuid, encrypted: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(SECRET_LEN + encrypted.len());
    w.write_uuid(secret);
    let mut out = w.into_vec();
    out.extend_from_slice(encrypted);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_layout() {
        let secret = Uuid::new_v4();
        let datagram = build_datagram(&secret, &[9, 8, 7]);
        assert_eq!(datagram.len(), SECRET_LEN + 3);
        assert_eq!(&datagram[..SECRET_LEN], secret.as_bytes());

        let (parsed, payload) = split_datagram(&datagram).unwrap();
        assert_eq!(parsed, secret);
        assert_eq!(payload, &[9, 8, 7]);
    }

    #[test]
    fn short_datagram_is_rejected() {
        assert!(split_datagram(&[0u8; SECRET_LEN - 1]).is_err());
        let (_, payload) = split_datagram(&[0u8; SECRET_LEN]).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn audio_roundtrip() {
        let packet = UdpPacket::PlayerAudio(PlayerAudio {
            sequence: u64::MAX - 1,
            activation: "proximity".into(),
            distance: 16,
            data: vec![0xAA; 120],
        });
        assert_eq!(UdpPacket::decode(&packet.encode()).unwrap(), packet);

        let routed = UdpPacket::SourceAudio(SourceAudio {
            sequence: 3,
            source_id: Uuid::new_v4(),
            line: "proximity".into(),
            distance: 0,
            data: Vec::new(),
        });
        assert_eq!(UdpPacket::decode(&routed.encode()).unwrap(), routed);
    }

    #[test]
    fn keepalive_opcodes() {
        assert_eq!(UdpPacket::Ping(Ping { timestamp: 1 }).opcode(), 0x42);
        assert_eq!(UdpPacket::Pong(Pong { timestamp: 1 }).opcode(), 0x43);
    }

    #[test]
    fn audio_length_prefix_is_bounded_by_body() {
        let mut bytes = UdpPacket::PlayerAudio(PlayerAudio {
            sequence: 1,
            activation: "a".into(),
            distance: 0,
            data: vec![1, 2, 3],
        })
        .encode();
        // Claim a larger payload than present.
        let len_pos = bytes.len() - 3 - 4;
        bytes[len_pos..len_pos + 4].copy_from_slice(&1000u32.to_be_bytes());
        assert!(matches!(
            UdpPacket::decode(&bytes),
            Err(ProtocolError::PacketTooShort { .. })
        ));
    }
}
