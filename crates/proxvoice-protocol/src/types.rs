use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::io::{Reader, Wire, Writer};

/// Current protocol version. Handshakes with any other version are rejected.
pub const PROTOCOL_VERSION: u32 = 2;

/// Reserved id of the mandatory proximity activation (and its source line).
pub const PROXIMITY_ID: &str = "proximity";

/// Client capability bits sent in the handshake.
pub mod capabilities {
    /// The client can capture and send stereo frames.
    pub const STEREO_CAPTURE: u32 = 1 << 0;
    /// The client decodes Opus (otherwise the server must not advertise it).
    pub const OPUS: u32 = 1 << 1;
}

/// How an activation decides that a captured frame is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    PushToTalk,
    #[default]
    VoiceActivation,
    /// Uses the trigger of the parent activation.
    Inherit,
}

impl ActivationKind {
    fn as_u8(self) -> u8 {
        match self {
            Self::PushToTalk => 0,
            Self::VoiceActivation => 1,
            Self::Inherit => 2,
        }
    }
}

impl TryFrom<u8> for ActivationKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::PushToTalk),
            1 => Ok(Self::VoiceActivation),
            2 => Ok(Self::Inherit),
            other => Err(ProtocolError::InvalidValue {
                field: "activation kind",
                value: u64::from(other),
            }),
        }
    }
}

/// Where a frame sent with a given distance can be heard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audibility {
    /// No distance applies; every listener subscribed to the line hears it.
    Everywhere,
    /// Listeners within this many blocks.
    Within(u16),
}

/// A server-defined way of speaking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Activation {
    pub id: String,
    pub translation: String,
    pub source_line: String,
    pub kind: ActivationKind,
    pub parent: Option<String>,
    /// Ordered audible distances. Empty means no distance UI and no range
    /// limit.
    pub distances: Vec<i32>,
    pub default_distance: i32,
    /// `-1` selects free-form entry bounded by `max_distance`.
    pub min_distance: i32,
    pub max_distance: i32,
    /// Higher weights are evaluated first.
    pub weight: i32,
    /// Whether lower-weight activations may still send while this one is
    /// active.
    pub transitive: bool,
}

impl Default for Activation {
    fn default() -> Self {
        Self {
            id: String::new(),
            translation: String::new(),
            source_line: String::new(),
            kind: ActivationKind::default(),
            parent: None,
            distances: Vec::new(),
            default_distance: 0,
            min_distance: 0,
            max_distance: 0,
            weight: 0,
            transitive: true,
        }
    }
}

impl Activation {
    /// The proximity activation with the given distances.
    pub fn proximity(distances: Vec<i32>, default_distance: i32) -> Self {
        Self {
            id: PROXIMITY_ID.to_string(),
            translation: "activation.proximity".to_string(),
            source_line: PROXIMITY_ID.to_string(),
            kind: ActivationKind::VoiceActivation,
            distances,
            default_distance,
            ..Self::default()
        }
    }

    pub fn is_proximity(&self) -> bool {
        self.id == PROXIMITY_ID
    }

    pub fn has_distance(&self) -> bool {
        !self.distances.is_empty()
    }

    pub fn is_free_form(&self) -> bool {
        self.min_distance == -1
    }

    /// The wire distance a client sends when the user has not picked one.
    pub fn default_wire_distance(&self) -> u16 {
        if self.has_distance() {
            clamp_u16(self.default_distance)
        } else {
            0
        }
    }

    /// Check a distance received from a client.
    ///
    /// `0` selects the default distance. Returns `None` when the distance is
    /// not one this activation allows.
    pub fn resolve_distance(&self, requested: u16) -> Option<Audibility> {
        if !self.has_distance() {
            return Some(Audibility::Everywhere);
        }

        let distance = if requested == 0 {
            clamp_u16(self.default_distance)
        } else {
            requested
        };
        if distance == 0 {
            return None;
        }

        let allowed = if self.is_free_form() {
            i32::from(distance) <= self.max_distance
        } else {
            self.distances.contains(&i32::from(distance))
        };
        allowed.then_some(Audibility::Within(distance))
    }
}

fn clamp_u16(value: i32) -> u16 {
    value.clamp(0, i32::from(u16::MAX)) as u16
}

impl Wire for Activation {
    fn write(&self, w: &mut Writer) {
        w.write_string(&self.id);
        w.write_string(&self.translation);
        w.write_string(&self.source_line);
        w.write_u8(self.kind.as_u8());
        w.write_optional(self.parent.as_ref(), |w, p| w.write_string(p));
        w.write_int_list(&self.distances);
        w.write_i32(self.default_distance);
        w.write_i32(self.min_distance);
        w.write_i32(self.max_distance);
        w.write_i32(self.weight);
        w.write_bool(self.transitive);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: r.read_string()?,
            translation: r.read_string()?,
            source_line: r.read_string()?,
            kind: ActivationKind::try_from(r.read_u8()?)?,
            parent: r.read_optional(|r| r.read_string())?,
            distances: r.read_int_list()?,
            default_distance: r.read_i32()?,
            min_distance: r.read_i32()?,
            max_distance: r.read_i32()?,
            weight: r.read_i32()?,
            transitive: r.read_bool()?,
        })
    }
}

/// A named audio channel. Listeners adjust volume per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceLine {
    pub name: String,
    pub translation: String,
    pub weight: i32,
    pub default_volume: f32,
}

impl Default for SourceLine {
    fn default() -> Self {
        Self {
            name: String::new(),
            translation: String::new(),
            weight: 0,
            default_volume: 1.0,
        }
    }
}

impl SourceLine {
    pub fn proximity() -> Self {
        Self {
            name: PROXIMITY_ID.to_string(),
            translation: "source_line.proximity".to_string(),
            ..Self::default()
        }
    }
}

impl Wire for SourceLine {
    fn write(&self, w: &mut Writer) {
        w.write_string(&self.name);
        w.write_string(&self.translation);
        w.write_i32(self.weight);
        w.write_f32(self.default_volume);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: r.read_string()?,
            translation: r.read_string()?,
            weight: r.read_i32()?,
            default_volume: r.read_f32()?,
        })
    }
}

/// Capture and codec parameters every client must use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureInfo {
    pub sample_rate: u32,
    /// Samples per 20 ms frame.
    pub frame_size: u32,
    pub mtu_size: u32,
    pub opus_mode: String,
    /// Opus bitrate in bit/s; negative values are the codec's auto/max
    /// presets.
    pub bitrate: i32,
}

impl CaptureInfo {
    pub fn frame_size_for(sample_rate: u32) -> u32 {
        sample_rate / 1000 * 20
    }
}

impl Wire for CaptureInfo {
    fn write(&self, w: &mut Writer) {
        w.write_u32(self.sample_rate);
        w.write_u32(self.frame_size);
        w.write_u32(self.mtu_size);
        w.write_string(&self.opus_mode);
        w.write_i32(self.bitrate);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            sample_rate: r.read_u32()?,
            frame_size: r.read_u32()?,
            mtu_size: r.read_u32()?,
            opus_mode: r.read_string()?,
            bitrate: r.read_i32()?,
        })
    }
}

/// Cipher selection and the session key for the UDP channel.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionInfo {
    pub algorithm: String,
    pub key: Vec<u8>,
}

impl fmt::Debug for EncryptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionInfo")
            .field("algorithm", &self.algorithm)
            .field("key", &format_args!("[{} bytes]", self.key.len()))
            .finish()
    }
}

impl Wire for EncryptionInfo {
    fn write(&self, w: &mut Writer) {
        w.write_string(&self.algorithm);
        w.write_byte_array(&self.key);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            algorithm: r.read_string()?,
            key: r.read_byte_array()?,
        })
    }
}

/// An active server mute as seen by the muted player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuteInfo {
    /// Unix milliseconds; `None` is permanent.
    pub until_ms: Option<u64>,
    pub reason: Option<String>,
}

impl Wire for MuteInfo {
    fn write(&self, w: &mut Writer) {
        w.write_optional(self.until_ms.as_ref(), |w, v| w.write_u64(*v));
        w.write_optional(self.reason.as_ref(), |w, v| w.write_string(v));
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            until_ms: r.read_optional(|r| r.read_u64())?,
            reason: r.read_optional(|r| r.read_string())?,
        })
    }
}

/// Why a handshake was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    VersionMismatch,
    DuplicateConnection,
    UnknownPlayer,
    ForwardingSecret,
    ServerFull,
    NotReady,
    Malformed,
}

impl RejectReason {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::VersionMismatch => 1,
            Self::DuplicateConnection => 2,
            Self::UnknownPlayer => 3,
            Self::ForwardingSecret => 4,
            Self::ServerFull => 5,
            Self::NotReady => 6,
            Self::Malformed => 7,
        }
    }
}

impl TryFrom<u8> for RejectReason {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::VersionMismatch),
            2 => Ok(Self::DuplicateConnection),
            3 => Ok(Self::UnknownPlayer),
            4 => Ok(Self::ForwardingSecret),
            5 => Ok(Self::ServerFull),
            6 => Ok(Self::NotReady),
            7 => Ok(Self::Malformed),
            other => Err(ProtocolError::InvalidValue {
                field: "reject reason",
                value: u64::from(other),
            }),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::VersionMismatch => "protocol version mismatch",
            Self::DuplicateConnection => "already connected",
            Self::UnknownPlayer => "unknown player",
            Self::ForwardingSecret => "forwarding secret mismatch",
            Self::ServerFull => "server is full",
            Self::NotReady => "voice server is not ready",
            Self::Malformed => "malformed handshake",
        };
        f.write_str(text)
    }
}
