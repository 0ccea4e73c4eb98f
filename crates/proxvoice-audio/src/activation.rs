//! Client-side activation engine.
//!
//! For each captured frame the engine decides, per activation, whether the
//! frame is sent: push-to-talk activations follow their key, voice
//! activations follow the detector, inherit activations follow their
//! trigger ancestor.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use proxvoice_protocol::activation::{ActivationError, ActivationSet};
use proxvoice_protocol::types::{Activation, ActivationKind};
use serde::{Deserialize, Serialize};

use crate::vad::VoiceActivityDetector;

/// Keys currently held, by name (e.g. `KEY_V`). Shared with the input thread.
#[derive(Debug, Default)]
pub struct KeyState {
    pressed: Mutex<HashSet<String>>,
}

impl KeyState {
    fn keys(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pressed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn press(&self, key: &str) {
        self.keys().insert(key.to_string());
    }

    pub fn release(&self, key: &str) {
        self.keys().remove(key);
    }

    pub fn is_pressed(&self, key: &str) -> bool {
        self.keys().contains(key)
    }

    pub fn release_all(&self) {
        self.keys().clear();
    }
}

/// Local settings for one activation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationOverride {
    pub kind: Option<ActivationKind>,
    pub parent: Option<String>,
    /// Push-to-talk key name.
    pub key: Option<String>,
    /// Chosen distance; ignored when the activation does not allow it.
    pub distance: Option<u16>,
    pub disabled: bool,
}

/// The engine's verdict for one activation on one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDecision {
    pub activation: String,
    pub source_line: String,
    pub distance: u16,
    pub active: bool,
    /// Active on the previous frame, not on this one.
    pub burst_ended: bool,
}

pub struct ActivationEngine {
    /// Server definitions before local overrides.
    server: ActivationSet,
    set: ActivationSet,
    overrides: HashMap<String, ActivationOverride>,
    keys: Arc<KeyState>,
    vad: VoiceActivityDetector,
    active: HashSet<String>,
    muted: bool,
}

impl ActivationEngine {
    /// Fails when the local overrides produce an invalid inheritance graph.
    pub fn new(
        server: &ActivationSet,
        overrides: HashMap<String, ActivationOverride>,
        keys: Arc<KeyState>,
        vad: VoiceActivityDetector,
    ) -> Result<Self, ActivationError> {
        let set = apply_overrides(server, &overrides)?;
        Ok(Self {
            server: server.clone(),
            set,
            overrides,
            keys,
            vad,
            active: HashSet::new(),
            muted: false,
        })
    }

    /// Replace the server activations (config reload). Bursts of
    /// activations that disappeared are ended.
    pub fn set_activations(&mut self, server: &ActivationSet) -> Result<Vec<FrameDecision>, ActivationError> {
        let set = apply_overrides(server, &self.overrides)?;
        let ended = self.end_where(|id| set.get(id).is_none());
        self.server = server.clone();
        self.set = set;
        Ok(ended)
    }

    pub fn set_override(&mut self, id: &str, value: ActivationOverride) -> Result<(), ActivationError> {
        let mut overrides = self.overrides.clone();
        overrides.insert(id.to_string(), value);
        self.set = apply_overrides(&self.server, &overrides)?;
        self.overrides = overrides;
        Ok(())
    }

    /// A muted engine produces no active frames.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn activations(&self) -> &ActivationSet {
        &self.set
    }

    pub fn vad_mut(&mut self) -> &mut VoiceActivityDetector {
        &mut self.vad
    }

    pub fn level_db(&self) -> f32 {
        self.vad.level_db()
    }

    /// Evaluate every activation, highest weight first, for one frame.
    pub fn process(&mut self, pcm: &[f32]) -> Vec<FrameDecision> {
        let voice = self.vad.process(pcm);
        let mut blocked = self.muted;
        let mut decisions = Vec::with_capacity(self.set.activations().len());

        for activation in self.set.activations() {
            let disabled = self.overrides.get(&activation.id).is_some_and(|o| o.disabled);
            let wants = !blocked && !disabled && self.triggered(activation, voice);
            let was_active = if wants {
                !self.active.insert(activation.id.clone())
            } else {
                self.active.remove(&activation.id)
            };
            if wants && !activation.transitive {
                blocked = true;
            }
            decisions.push(FrameDecision {
                activation: activation.id.clone(),
                source_line: activation.source_line.clone(),
                distance: self.distance_for(activation),
                active: wants,
                burst_ended: was_active && !wants,
            });
        }
        decisions
    }

    /// End every running burst, e.g. before disconnecting.
    pub fn release_all(&mut self) -> Vec<FrameDecision> {
        self.vad.reset();
        self.end_where(|_| true)
    }

    fn end_where(&mut self, mut predicate: impl FnMut(&str) -> bool) -> Vec<FrameDecision> {
        let ended: Vec<String> = self.active.iter().filter(|id| predicate(id.as_str())).cloned().collect();
        ended
            .into_iter()
            .map(|id| {
                self.active.remove(&id);
                let (source_line, distance) = match self.set.get(&id) {
                    Some(a) => (a.source_line.clone(), self.distance_for(a)),
                    None => (String::new(), 0),
                };
                FrameDecision {
                    activation: id,
                    source_line,
                    distance,
                    active: false,
                    burst_ended: true,
                }
            })
            .collect()
    }

    fn triggered(&self, activation: &Activation, voice: bool) -> bool {
        let Some(trigger) = self.set.trigger_of(&activation.id) else {
            return false;
        };
        match trigger.kind {
            ActivationKind::PushToTalk => self
                .overrides
                .get(&trigger.id)
                .and_then(|o| o.key.as_deref())
                .is_some_and(|key| self.keys.is_pressed(key)),
            ActivationKind::VoiceActivation => voice,
            ActivationKind::Inherit => false,
        }
    }

    fn distance_for(&self, activation: &Activation) -> u16 {
        match self.overrides.get(&activation.id).and_then(|o| o.distance) {
            Some(d) if activation.has_distance() && activation.resolve_distance(d).is_some() => d,
            _ => activation.default_wire_distance(),
        }
    }
}

fn apply_overrides(
    server: &ActivationSet,
    overrides: &HashMap<String, ActivationOverride>,
) -> Result<ActivationSet, ActivationError> {
    let activations = server
        .activations()
        .iter()
        .map(|activation| {
            let mut activation = activation.clone();
            if let Some(local) = overrides.get(&activation.id) {
                if let Some(kind) = local.kind {
                    activation.kind = kind;
                }
                if local.parent.is_some() {
                    activation.parent = local.parent.clone();
                }
            }
            activation
        })
        .collect();
    ActivationSet::new(activations, server.source_lines().to_vec())
}

#[cfg(test)]
mod tests {
    use proxvoice_protocol::types::{SourceLine, PROXIMITY_ID};

    use super::*;

    const LOUD: [f32; 960] = [0.2; 960];
    const QUIET: [f32; 960] = [0.0; 960];

    fn server_set() -> ActivationSet {
        ActivationSet::new(
            vec![
                Activation::proximity(vec![8, 16, 32], 16),
                Activation {
                    id: "group".into(),
                    source_line: "group".into(),
                    kind: ActivationKind::PushToTalk,
                    weight: 10,
                    ..Activation::default()
                },
                Activation {
                    id: "team".into(),
                    source_line: "group".into(),
                    kind: ActivationKind::Inherit,
                    parent: Some("group".into()),
                    weight: 5,
                    ..Activation::default()
                },
            ],
            vec![
                SourceLine::proximity(),
                SourceLine {
                    name: "group".into(),
                    ..SourceLine::default()
                },
            ],
        )
        .unwrap()
    }

    fn engine(overrides: &[(&str, ActivationOverride)]) -> (ActivationEngine, Arc<KeyState>) {
        let keys = Arc::new(KeyState::default());
        let overrides = overrides
            .iter()
            .map(|(id, o)| (id.to_string(), o.clone()))
            .collect();
        let engine = ActivationEngine::new(
            &server_set(),
            overrides,
            keys.clone(),
            VoiceActivityDetector::new(-40.0, 0, 20),
        )
        .unwrap();
        (engine, keys)
    }

    fn decision<'a>(decisions: &'a [FrameDecision], id: &str) -> &'a FrameDecision {
        decisions.iter().find(|d| d.activation == id).unwrap()
    }

    fn ptt(key: &str) -> ActivationOverride {
        ActivationOverride {
            key: Some(key.into()),
            ..ActivationOverride::default()
        }
    }

    #[test]
    fn push_to_talk_follows_key() {
        let (mut engine, keys) = engine(&[("group", ptt("KEY_V"))]);

        let d = engine.process(&QUIET);
        assert!(!decision(&d, "group").active);

        keys.press("KEY_V");
        let d = engine.process(&QUIET);
        let group = decision(&d, "group");
        assert!(group.active);
        assert_eq!(group.source_line, "group");
        assert_eq!(group.distance, 0);

        keys.release("KEY_V");
        let d = engine.process(&QUIET);
        let group = decision(&d, "group");
        assert!(!group.active);
        assert!(group.burst_ended);

        let d = engine.process(&QUIET);
        assert!(!decision(&d, "group").burst_ended);
    }

    #[test]
    fn voice_activation_follows_detector() {
        let (mut engine, _) = engine(&[]);
        let d = engine.process(&LOUD);
        let proximity = decision(&d, PROXIMITY_ID);
        assert!(proximity.active);
        assert_eq!(proximity.distance, 16);

        let d = engine.process(&QUIET);
        assert!(decision(&d, PROXIMITY_ID).burst_ended);
    }

    #[test]
    fn proximity_can_be_switched_to_push_to_talk() {
        let (mut engine, keys) = engine(&[(
            PROXIMITY_ID,
            ActivationOverride {
                kind: Some(ActivationKind::PushToTalk),
                key: Some("KEY_B".into()),
                distance: Some(32),
                ..ActivationOverride::default()
            },
        )]);
        assert!(!decision(&engine.process(&LOUD), PROXIMITY_ID).active);
        keys.press("KEY_B");
        let d = engine.process(&QUIET);
        assert!(decision(&d, PROXIMITY_ID).active);
        assert_eq!(decision(&d, PROXIMITY_ID).distance, 32);
    }

    #[test]
    fn invalid_distance_override_falls_back_to_default() {
        let (mut engine, _) = engine(&[(
            PROXIMITY_ID,
            ActivationOverride {
                distance: Some(17),
                ..ActivationOverride::default()
            },
        )]);
        assert_eq!(decision(&engine.process(&LOUD), PROXIMITY_ID).distance, 16);
    }

    #[test]
    fn inherit_uses_parent_key() {
        let (mut engine, keys) = engine(&[("group", ptt("KEY_G"))]);
        assert!(!decision(&engine.process(&LOUD), "team").active);

        keys.press("KEY_G");
        let d = engine.process(&QUIET);
        assert!(decision(&d, "group").active);
        assert!(decision(&d, "team").active);
        assert!(!decision(&d, PROXIMITY_ID).active);
    }

    #[test]
    fn invalid_override_is_rejected_and_kept_out() {
        let (mut engine, keys) = engine(&[("group", ptt("KEY_G"))]);
        let result = engine.set_override(
            "group",
            ActivationOverride {
                kind: Some(ActivationKind::Inherit),
                parent: Some(PROXIMITY_ID.into()),
                ..ActivationOverride::default()
            },
        );
        assert!(matches!(result, Err(ActivationError::ProximityInheritance(_))));

        keys.press("KEY_G");
        assert!(decision(&engine.process(&QUIET), "group").active);
    }

    #[test]
    fn cleared_override_restores_server_kind() {
        let (mut engine, keys) = engine(&[]);
        engine
            .set_override(
                PROXIMITY_ID,
                ActivationOverride {
                    kind: Some(ActivationKind::PushToTalk),
                    key: Some("KEY_B".into()),
                    ..ActivationOverride::default()
                },
            )
            .unwrap();
        assert!(!decision(&engine.process(&LOUD), PROXIMITY_ID).active);
        keys.press("KEY_B");
        assert!(decision(&engine.process(&QUIET), PROXIMITY_ID).active);

        engine.set_override(PROXIMITY_ID, ActivationOverride::default()).unwrap();
        assert_eq!(
            engine.activations().get(PROXIMITY_ID).unwrap().kind,
            ActivationKind::VoiceActivation
        );
    }

    #[test]
    fn non_transitive_activation_blocks_lower_weights() {
        let mut set = server_set().activations().to_vec();
        for activation in &mut set {
            if activation.id == "group" {
                activation.transitive = false;
            }
        }
        let server = ActivationSet::new(set, server_set().source_lines().to_vec()).unwrap();
        let keys = Arc::new(KeyState::default());
        let mut engine = ActivationEngine::new(
            &server,
            [("group".to_string(), ptt("KEY_V"))].into_iter().collect(),
            keys.clone(),
            VoiceActivityDetector::new(-40.0, 0, 20),
        )
        .unwrap();

        assert!(decision(&engine.process(&LOUD), PROXIMITY_ID).active);
        keys.press("KEY_V");
        let d = engine.process(&LOUD);
        assert!(decision(&d, "group").active);
        let proximity = decision(&d, PROXIMITY_ID);
        assert!(!proximity.active);
        assert!(proximity.burst_ended);
    }

    #[test]
    fn mute_ends_bursts() {
        let (mut engine, _) = engine(&[]);
        assert!(decision(&engine.process(&LOUD), PROXIMITY_ID).active);
        engine.set_muted(true);
        let d = engine.process(&LOUD);
        assert!(!decision(&d, PROXIMITY_ID).active);
        assert!(decision(&d, PROXIMITY_ID).burst_ended);
    }

    #[test]
    fn disabled_activation_never_sends() {
        let (mut engine, _) = engine(&[(
            PROXIMITY_ID,
            ActivationOverride {
                disabled: true,
                ..ActivationOverride::default()
            },
        )]);
        assert!(!decision(&engine.process(&LOUD), PROXIMITY_ID).active);
    }

    #[test]
    fn removed_activation_ends_its_burst() {
        let (mut engine, keys) = engine(&[("group", ptt("KEY_V"))]);
        keys.press("KEY_V");
        engine.process(&QUIET);

        let proximity_only = ActivationSet::proximity_only(vec![8, 16, 32], 16).unwrap();
        let mut ended = engine.set_activations(&proximity_only).unwrap();
        ended.sort_by(|a, b| a.activation.cmp(&b.activation));
        let ids: Vec<_> = ended.iter().map(|d| d.activation.as_str()).collect();
        assert_eq!(ids, ["group", "team"]);
        assert!(ended.iter().all(|d| d.burst_ended && !d.active));
        assert!(engine.activations().get("group").is_none());
    }

    #[test]
    fn release_all_ends_everything() {
        let (mut engine, _) = engine(&[]);
        engine.process(&LOUD);
        let ended = engine.release_all();
        assert_eq!(ended.len(), 1);
        assert!(engine.release_all().is_empty());
    }

    #[test]
    fn key_state_is_shared() {
        let keys = KeyState::default();
        keys.press("KEY_V");
        assert!(keys.is_pressed("KEY_V"));
        keys.release_all();
        assert!(!keys.is_pressed("KEY_V"));
    }
}
