//! Control channel messages.
//!
//! Every TCP frame carries `[opcode u8][body]`. Serverbound opcodes live in
//! `0x01..0x1F`, clientbound ones in `0x20..0x3F`.

use uuid::Uuid;

use crate::codec::encode_frame;
use crate::error::ProtocolError;
use crate::io::{Reader, Wire, Writer};
use crate::types::{Activation, CaptureInfo, EncryptionInfo, MuteInfo, RejectReason, SourceLine};

/// First message on every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerHandshake {
    pub protocol_version: u32,
    pub player_id: Uuid,
    pub player_name: String,
    pub capabilities: u32,
    /// Present when the player was forwarded by a proxy.
    pub forwarding_secret: Option<Uuid>,
}

impl Wire for PlayerHandshake {
    fn write(&self, w: &mut Writer) {
        w.write_u32(self.protocol_version);
        w.write_uuid(&self.player_id);
        w.write_string(&self.player_name);
        w.write_u32(self.capabilities);
        w.write_optional(self.forwarding_secret.as_ref(), |w, s| w.write_uuid(s));
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            protocol_version: r.read_u32()?,
            player_id: r.read_uuid()?,
            player_name: r.read_string()?,
            capabilities: r.read_u32()?,
            forwarding_secret: r.read_optional(|r| r.read_uuid())?,
        })
    }
}

/// Answer to [`PlayerInfoRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerInfo {
    pub protocol_version: u32,
    pub capabilities: u32,
}

impl Wire for PlayerInfo {
    fn write(&self, w: &mut Writer) {
        w.write_u32(self.protocol_version);
        w.write_u32(self.capabilities);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            protocol_version: r.read_u32()?,
            capabilities: r.read_u32()?,
        })
    }
}

/// End of a talk burst. Carries the last sequence number sent on `activation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerAudioEnd {
    pub activation: String,
    pub sequence: u64,
    pub distance: u16,
}

impl Wire for PlayerAudioEnd {
    fn write(&self, w: &mut Writer) {
        w.write_string(&self.activation);
        w.write_u64(self.sequence);
        w.write_u16(self.distance);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            activation: r.read_string()?,
            sequence: r.read_u64()?,
            distance: r.read_u16()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub timestamp: u64,
}

impl Wire for Ping {
    fn write(&self, w: &mut Writer) {
        w.write_u64(self.timestamp);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            timestamp: r.read_u64()?,
        })
    }
}

/// Echoes the timestamp of a [`Ping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub timestamp: u64,
}

impl Wire for Pong {
    fn write(&self, w: &mut Writer) {
        w.write_u64(self.timestamp);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            timestamp: r.read_u64()?,
        })
    }
}

/// Subscribe to or leave a source line. All lines start subscribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSubscription {
    pub line: String,
    pub subscribed: bool,
}

impl Wire for LineSubscription {
    fn write(&self, w: &mut Writer) {
        w.write_string(&self.line);
        w.write_bool(self.subscribed);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            line: r.read_string()?,
            subscribed: r.read_bool()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnect;

impl Wire for Disconnect {
    fn write(&self, _w: &mut Writer) {}

    fn read(_r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRejected {
    pub reason: RejectReason,
    pub message: String,
}

impl Wire for ConnectionRejected {
    fn write(&self, w: &mut Writer) {
        w.write_u8(self.reason.as_u8());
        w.write_string(&self.message);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            reason: RejectReason::try_from(r.read_u8()?)?,
            message: r.read_string()?,
        })
    }
}

/// Everything a client needs to open its UDP session.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    pub server_id: Uuid,
    pub player_id: Uuid,
    /// Session secret; the sole authenticator of UDP datagrams.
    pub secret: Uuid,
    /// Empty means "same host as the control connection".
    pub udp_host: String,
    pub udp_port: u16,
    pub keep_alive_timeout_ms: u32,
    pub encryption: EncryptionInfo,
    pub capture: CaptureInfo,
    pub activations: Vec<Activation>,
    pub source_lines: Vec<SourceLine>,
    pub mute: Option<MuteInfo>,
}

impl Wire for ServerInfo {
    fn write(&self, w: &mut Writer) {
        w.write_uuid(&self.server_id);
        w.write_uuid(&self.player_id);
        w.write_uuid(&self.secret);
        w.write_string(&self.udp_host);
        w.write_u16(self.udp_port);
        w.write_u32(self.keep_alive_timeout_ms);
        self.encryption.write(w);
        self.capture.write(w);
        w.write_list(&self.activations);
        w.write_list(&self.source_lines);
        w.write_optional(self.mute.as_ref(), |w, m| m.write(w));
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            server_id: r.read_uuid()?,
            player_id: r.read_uuid()?,
            secret: r.read_uuid()?,
            udp_host: r.read_string()?,
            udp_port: r.read_u16()?,
            keep_alive_timeout_ms: r.read_u32()?,
            encryption: EncryptionInfo::read(r)?,
            capture: CaptureInfo::read(r)?,
            activations: r.read_list()?,
            source_lines: r.read_list()?,
            mute: r.read_optional(MuteInfo::read)?,
        })
    }
}

/// Pushed to every session after a config reload.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationsUpdate {
    pub activations: Vec<Activation>,
    pub source_lines: Vec<SourceLine>,
}

impl Wire for ActivationsUpdate {
    fn write(&self, w: &mut Writer) {
        w.write_list(&self.activations);
        w.write_list(&self.source_lines);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            activations: r.read_list()?,
            source_lines: r.read_list()?,
        })
    }
}

/// Asks the client to resend its [`PlayerInfo`], e.g. after the UDP socket
/// moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerInfoRequest;

impl Wire for PlayerInfoRequest {
    fn write(&self, _w: &mut Writer) {}

    fn read(_r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuteState {
    /// `None` when the player is not muted.
    pub mute: Option<MuteInfo>,
}

impl Wire for MuteState {
    fn write(&self, w: &mut Writer) {
        w.write_optional(self.mute.as_ref(), |w, m| m.write(w));
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            mute: r.read_optional(MuteInfo::read)?,
        })
    }
}

/// Relayed end of a talk burst from `source_id` on `line`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAudioEnd {
    pub source_id: Uuid,
    pub line: String,
    pub sequence: u64,
}

impl Wire for SourceAudioEnd {
    fn write(&self, w: &mut Writer) {
        w.write_uuid(&self.source_id);
        w.write_string(&self.line);
        w.write_u64(self.sequence);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            source_id: r.read_uuid()?,
            line: r.read_string()?,
            sequence: r.read_u64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    pub reason: String,
}

impl Wire for Disconnected {
    fn write(&self, w: &mut Writer) {
        w.write_string(&self.reason);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            reason: r.read_string()?,
        })
    }
}

packet_registry! {
    /// Client to server control messages.
    pub enum ServerboundPacket {
        PlayerHandshake = 0x01,
        PlayerInfo = 0x02,
        PlayerAudioEnd = 0x03,
        Ping = 0x04,
        LineSubscription = 0x05,
        Disconnect = 0x06,
    }
}

packet_registry! {
    /// Server to client control messages.
    pub enum ClientboundPacket {
        ConnectionRejected = 0x20,
        ServerInfo = 0x21,
        ActivationsUpdate = 0x22,
        PlayerInfoRequest = 0x23,
        MuteState = 0x24,
        SourceAudioEnd = 0x25,
        Pong = 0x26,
        Disconnected = 0x27,
    }
}

impl ServerboundPacket {
    /// Encode and length-prefix for the wire.
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(&self.encode())
    }
}

impl ClientboundPacket {
    /// Encode and length-prefix for the wire.
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(&self.encode())
    }
}
