use std::collections::HashMap;
use std::path::Path;

use proxvoice_audio::ActivationOverride;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Persistent client settings, saved as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local settings per activation id.
    pub activations: HashMap<String, ActivationOverride>,

    // Voice activation
    pub vad_threshold_db: f32,
    pub vad_hold_ms: u32,

    /// Start with the microphone muted.
    pub muted: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            activations: HashMap::new(),
            vad_threshold_db: -40.0,
            vad_hold_ms: 300,
            muted: false,
        }
    }
}

impl ClientConfig {
    /// Load from `path`. Returns defaults on any error (missing file, parse error).
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("failed to parse {}: {e}, using defaults", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Save atomically (write to .tmp, then rename).
    pub fn save(&self, path: &Path) -> Result<(), ClientError> {
        let err = |action: &'static str, reason: String| ClientError::Config {
            action,
            path: path.display().to_string(),
            reason,
        };
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self).map_err(|e| err("serialize", e.to_string()))?;
        std::fs::write(&tmp_path, json).map_err(|e| err("write", e.to_string()))?;
        std::fs::rename(&tmp_path, path).map_err(|e| err("replace", e.to_string()))?;
        Ok(())
    }

    /// Bind push-to-talk for `activation` to `key`.
    pub fn set_key(&mut self, activation: &str, key: impl Into<String>) {
        self.activations.entry(activation.to_string()).or_default().key = Some(key.into());
    }
}

#[cfg(test)]
mod tests {
    use proxvoice_protocol::types::ActivationKind;

    use super::*;

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");

        let mut config = ClientConfig::default();
        config.set_key("proximity", "KEY_V");
        config.activations.get_mut("proximity").unwrap().kind = Some(ActivationKind::PushToTalk);
        config.vad_threshold_db = -30.0;
        config.save(&path).unwrap();

        assert_eq!(ClientConfig::load(&path), config);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn broken_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(&path, "{\"vad_threshold_db\": \"loud\"}").unwrap();
        assert_eq!(ClientConfig::load(&path), ClientConfig::default());
        assert_eq!(ClientConfig::load(&dir.path().join("missing.json")), ClientConfig::default());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: ClientConfig = serde_json::from_str(r#"{"muted": true}"#).unwrap();
        assert!(config.muted);
        assert_eq!(config.vad_hold_ms, 300);
    }
}
