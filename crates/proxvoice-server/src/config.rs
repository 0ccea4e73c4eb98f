use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use proxvoice_crypto::{ServerKey, DEFAULT_ALGORITHM};
use proxvoice_protocol::activation::ActivationSet;
use proxvoice_protocol::types::{Activation, CaptureInfo, SourceLine, PROXIMITY_ID};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ServerError;

pub const CONFIG_FILE: &str = "config.toml";
pub const FORWARDING_SECRET_FILE: &str = "forwarding-secret";
pub const FORWARDING_SECRET_ENV: &str = "PROXVOICE_FORWARDING_SECRET";
pub const DEBUG_ENV: &str = "PROXVOICE_DEBUG";

const SAMPLE_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

/// Server configuration, loaded from `config.toml` in the config directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Promote per-packet diagnostics to `info`.
    pub debug: bool,
    pub host: HostConfig,
    pub tcp: TcpConfig,
    pub voice: VoiceConfig,
    /// Extra source lines. The proximity line always exists.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub source_lines: Vec<SourceLine>,
    /// Extra activations. The proximity activation is built from
    /// `[voice.proximity]`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub activations: Vec<Activation>,
}

/// Where the UDP media socket binds. A change restarts the UDP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub ip: String,
    /// `0` uses the game server's port when known, else any free port.
    pub port: u16,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".into(),
            port: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub ip: String,
    pub port: u16,
    pub max_players: u32,
    /// PEM certificate; TLS is enabled when both paths are set.
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".into(),
            port: 7475,
            max_players: 100,
            cert_path: None,
            key_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub sample_rate: u32,
    pub mtu_size: u32,
    pub keep_alive_timeout_ms: u32,
    pub encryption: String,
    /// Base64 AES key. Generated (and kept across reloads) when unset.
    pub aes_encryption_key: Option<String>,
    pub opus: OpusConfig,
    pub proximity: ProximityConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            mtu_size: 1024,
            keep_alive_timeout_ms: 15_000,
            encryption: DEFAULT_ALGORITHM.to_string(),
            aes_encryption_key: None,
            opus: OpusConfig::default(),
            proximity: ProximityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusConfig {
    /// `VOIP`, `AUDIO` or `RESTRICTED_LOWDELAY`.
    pub mode: String,
    /// Bits per second; `-1000` is auto, `-1` is max.
    pub bitrate: i32,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            mode: "VOIP".into(),
            bitrate: -1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    pub distances: Vec<i32>,
    pub default_distance: i32,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            distances: vec![8, 16, 32],
            default_distance: 16,
        }
    }
}

impl ServerConfig {
    /// Read `config.toml` from `dir`, writing the defaults if it is missing.
    pub fn load(dir: &Path) -> Result<Self, ServerError> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            let config = Self::default();
            config.save(&path)?;
            info!(path = %path.display(), "wrote default config");
            return Ok(config);
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ServerError::ConfigIo {
            path: path.clone(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ServerError> {
        let io_err = |source| ServerError::ConfigIo {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?).map_err(io_err)
    }

    /// Apply the `PROXVOICE_DEBUG` override.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(DEBUG_ENV) {
            if !matches!(value.trim(), "" | "0" | "false") {
                self.debug = true;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        let voice = &self.voice;
        if !SAMPLE_RATES.contains(&voice.sample_rate) {
            return Err(ServerError::InvalidConfig(format!(
                "voice.sample_rate {} is not one of {:?}",
                voice.sample_rate, SAMPLE_RATES
            )));
        }
        if !(64..=1275).contains(&voice.mtu_size) {
            return Err(ServerError::InvalidConfig(format!(
                "voice.mtu_size {} must be within 64..=1275",
                voice.mtu_size
            )));
        }
        if voice.keep_alive_timeout_ms < 1000 {
            return Err(ServerError::InvalidConfig(
                "voice.keep_alive_timeout_ms must be at least 1000".into(),
            ));
        }
        if self.host.ip.parse::<IpAddr>().is_err() {
            return Err(ServerError::InvalidConfig(format!("host.ip {:?} is not an IP address", self.host.ip)));
        }
        if self.tcp.ip.parse::<IpAddr>().is_err() {
            return Err(ServerError::InvalidConfig(format!("tcp.ip {:?} is not an IP address", self.tcp.ip)));
        }
        Ok(())
    }
}

/// The forwarding secret: environment first, then the `forwarding-secret`
/// file in `dir`.
pub fn load_forwarding_secret(dir: &Path) -> Result<Option<Uuid>, ServerError> {
    if let Ok(value) = std::env::var(FORWARDING_SECRET_ENV) {
        return parse_secret(&value, FORWARDING_SECRET_ENV).map(Some);
    }
    let path = dir.join(FORWARDING_SECRET_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|source| ServerError::ConfigIo {
        path: path.clone(),
        source,
    })?;
    parse_secret(&content, FORWARDING_SECRET_FILE).map(Some)
}

fn parse_secret(value: &str, origin: &str) -> Result<Uuid, ServerError> {
    Uuid::parse_str(value.trim())
        .map_err(|e| ServerError::InvalidConfig(format!("{origin} is not a UUID: {e}")))
}

/// An immutable view of one successfully loaded config. Reloads build a new
/// snapshot and swap it in.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub config: ServerConfig,
    pub activations: ActivationSet,
    pub server_key: ServerKey,
    pub forwarding_secret: Option<Uuid>,
    pub capture: CaptureInfo,
    pub config_dir: PathBuf,
}

impl ConfigSnapshot {
    /// Validate `config` and derive everything the server needs from it.
    ///
    /// The AES key is the configured one, else the previous snapshot's, else
    /// a fresh one.
    pub fn build(
        config: ServerConfig,
        previous: Option<&ConfigSnapshot>,
        forwarding_secret: Option<Uuid>,
        config_dir: PathBuf,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        proxvoice_crypto::create(&config.voice.encryption, ServerKey::generate().as_bytes())?;

        let server_key = match &config.voice.aes_encryption_key {
            Some(encoded) => {
                let bytes = BASE64
                    .decode(encoded.trim())
                    .map_err(|e| ServerError::InvalidConfig(format!("voice.aes_encryption_key: {e}")))?;
                ServerKey::from_bytes(&bytes)?
            }
            None => match previous {
                Some(previous) => previous.server_key.clone(),
                None => {
                    warn!("no AES key configured, generated a new one");
                    ServerKey::generate()
                }
            },
        };

        let proximity = &config.voice.proximity;
        let mut activations = vec![Activation::proximity(
            proximity.distances.clone(),
            proximity.default_distance,
        )];
        activations.extend(config.activations.iter().cloned());
        let mut source_lines = vec![SourceLine::proximity()];
        source_lines.extend(config.source_lines.iter().filter(|l| l.name != PROXIMITY_ID).cloned());
        let activations = ActivationSet::new(activations, source_lines)?;

        let capture = CaptureInfo {
            sample_rate: config.voice.sample_rate,
            frame_size: CaptureInfo::frame_size_for(config.voice.sample_rate),
            mtu_size: config.voice.mtu_size,
            opus_mode: config.voice.opus.mode.clone(),
            bitrate: config.voice.opus.bitrate,
        };

        Ok(Self {
            config,
            activations,
            server_key,
            forwarding_secret,
            capture,
            config_dir,
        })
    }

    /// The UDP bind address; port `0` falls back to `game_port`.
    pub fn udp_bind_addr(&self, game_port: Option<u16>) -> Result<SocketAddr, ServerError> {
        let ip: IpAddr = self
            .config
            .host
            .ip
            .parse()
            .map_err(|_| ServerError::InvalidConfig(format!("host.ip {:?}", self.config.host.ip)))?;
        let port = match self.config.host.port {
            0 => game_port.unwrap_or(0),
            port => port,
        };
        Ok(SocketAddr::new(ip, port))
    }

    pub fn tcp_bind_addr(&self) -> Result<SocketAddr, ServerError> {
        let ip: IpAddr = self
            .config
            .tcp
            .ip
            .parse()
            .map_err(|_| ServerError::InvalidConfig(format!("tcp.ip {:?}", self.config.tcp.ip)))?;
        Ok(SocketAddr::new(ip, self.config.tcp.port))
    }

    /// Whether clients must refresh their session cipher or capture setup.
    pub fn needs_resync(&self, previous: &ConfigSnapshot) -> bool {
        self.server_key != previous.server_key
            || self.capture != previous.capture
            || self.config.voice.encryption != previous.config.voice.encryption
    }
}

#[cfg(test)]
mod tests {
    use proxvoice_protocol::activation::ActivationError;
    use proxvoice_protocol::types::ActivationKind;

    use super::*;

    fn build(config: ServerConfig) -> Result<ConfigSnapshot, ServerError> {
        ConfigSnapshot::build(config, None, None, PathBuf::from("."))
    }

    #[test]
    fn default_config_values() {
        let config = ServerConfig::default();
        assert_eq!(config.host.port, 0);
        assert_eq!(config.voice.sample_rate, 48_000);
        assert_eq!(config.voice.mtu_size, 1024);
        assert_eq!(config.voice.encryption, "AES/CBC/PKCS5Padding");
        assert_eq!(config.voice.proximity.distances, vec![8, 16, 32]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            debug = true

            [host]
            ip = "127.0.0.1"
            port = 25565

            [voice]
            sample_rate = 24000

            [voice.opus]
            bitrate = 32000

            [[source_lines]]
            name = "radio"
            weight = 5

            [[activations]]
            id = "radio"
            source_line = "radio"
            kind = "push_to_talk"
            weight = 10
        "#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        assert!(config.debug);
        assert_eq!(config.host.port, 25565);
        assert_eq!(config.voice.opus.mode, "VOIP");
        assert_eq!(config.voice.opus.bitrate, 32_000);
        assert_eq!(config.activations[0].kind, ActivationKind::PushToTalk);
        assert!(config.activations[0].transitive);

        let snapshot = build(config).unwrap();
        assert_eq!(snapshot.capture.frame_size, 480);
        assert_eq!(snapshot.activations.activations()[0].id, "radio");
        assert!(snapshot.activations.get(PROXIMITY_ID).is_some());
        assert!(snapshot.activations.has_source_line(PROXIMITY_ID));
    }

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load(dir.path()).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
        // The written file parses back to the same config.
        assert_eq!(ServerConfig::load(dir.path()).unwrap(), config);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[host\nip=").unwrap();
        assert!(matches!(ServerConfig::load(dir.path()), Err(ServerError::ConfigParse(_))));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = ServerConfig::default();
        config.voice.sample_rate = 44_100;
        assert!(matches!(build(config), Err(ServerError::InvalidConfig(_))));

        let mut config = ServerConfig::default();
        config.voice.encryption = "ROT13".into();
        assert!(matches!(build(config), Err(ServerError::Encryption(_))));

        let mut config = ServerConfig::default();
        config.activations.push(Activation {
            id: "loop".into(),
            source_line: PROXIMITY_ID.into(),
            kind: ActivationKind::Inherit,
            parent: Some("loop".into()),
            ..Activation::default()
        });
        assert!(matches!(
            build(config),
            Err(ServerError::Activation(ActivationError::Cycle(_)))
        ));
    }

    #[test]
    fn aes_key_is_retained_across_reloads() {
        let first = build(ServerConfig::default()).unwrap();
        let second = ConfigSnapshot::build(ServerConfig::default(), Some(&first), None, PathBuf::from(".")).unwrap();
        assert_eq!(first.server_key, second.server_key);
        assert!(!second.needs_resync(&first));

        let mut configured = ServerConfig::default();
        configured.voice.aes_encryption_key = Some(BASE64.encode([7u8; 16]));
        let third = ConfigSnapshot::build(configured, Some(&second), None, PathBuf::from(".")).unwrap();
        assert_eq!(third.server_key.as_bytes(), &[7u8; 16]);
        assert!(third.needs_resync(&second));
    }

    #[test]
    fn bad_aes_key_is_rejected() {
        let mut config = ServerConfig::default();
        config.voice.aes_encryption_key = Some(BASE64.encode([1u8; 5]));
        assert!(matches!(build(config), Err(ServerError::Encryption(_))));

        let mut config = ServerConfig::default();
        config.voice.aes_encryption_key = Some("not base64!".into());
        assert!(matches!(build(config), Err(ServerError::InvalidConfig(_))));
    }

    #[test]
    fn udp_port_zero_uses_game_port() {
        let snapshot = build(ServerConfig::default()).unwrap();
        assert_eq!(snapshot.udp_bind_addr(Some(25565)).unwrap().port(), 25565);
        assert_eq!(snapshot.udp_bind_addr(None).unwrap().port(), 0);

        let mut config = ServerConfig::default();
        config.host.port = 30000;
        let snapshot = build(config).unwrap();
        assert_eq!(snapshot.udp_bind_addr(Some(25565)).unwrap().port(), 30000);
    }

    #[test]
    fn forwarding_secret_from_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_forwarding_secret(dir.path()).unwrap(), None);

        let secret = Uuid::new_v4();
        std::fs::write(dir.path().join(FORWARDING_SECRET_FILE), format!("{secret}\n")).unwrap();
        assert_eq!(load_forwarding_secret(dir.path()).unwrap(), Some(secret));

        std::fs::write(dir.path().join(FORWARDING_SECRET_FILE), "nope").unwrap();
        assert!(load_forwarding_secret(dir.path()).is_err());
    }
}
