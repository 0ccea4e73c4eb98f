//! Validated activation and source line configuration.
//!
//! Both the server (when loading its config) and the client (after applying
//! local overrides) build an [`ActivationSet`]; an invalid inheritance graph
//! never reaches the audio path.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::types::{Activation, ActivationKind, SourceLine, PROXIMITY_ID};

/// Longest allowed parent chain for an inherit activation.
pub const MAX_INHERIT_DEPTH: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActivationError {
    #[error("activation id must not be empty")]
    EmptyId,

    #[error("duplicate activation id: {0}")]
    DuplicateActivation(String),

    #[error("duplicate source line: {0}")]
    DuplicateSourceLine(String),

    #[error("the proximity activation is missing")]
    MissingProximity,

    #[error("the proximity source line is missing")]
    MissingProximityLine,

    #[error("activation {activation} targets unknown source line {line}")]
    UnknownSourceLine { activation: String, line: String },

    #[error("activation {0}: proximity can be neither a parent nor a child")]
    ProximityInheritance(String),

    #[error("inherit activation {0} has no parent")]
    MissingParent(String),

    #[error("activation {activation} inherits from unknown activation {parent}")]
    UnknownParent { activation: String, parent: String },

    #[error("inheritance cycle through activation {0}")]
    Cycle(String),

    #[error("inheritance chain of {activation} is deeper than {max}")]
    TooDeep { activation: String, max: usize },

    #[error("activation {activation}: {reason}")]
    InvalidDistances { activation: String, reason: &'static str },
}

/// Activations ordered by weight (highest first) plus their source lines.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationSet {
    activations: Vec<Activation>,
    source_lines: Vec<SourceLine>,
    index: HashMap<String, usize>,
}

impl ActivationSet {
    pub fn new(
        mut activations: Vec<Activation>,
        mut source_lines: Vec<SourceLine>,
    ) -> Result<Self, ActivationError> {
        let mut line_names = HashSet::new();
        for line in &source_lines {
            if !line_names.insert(line.name.as_str()) {
                return Err(ActivationError::DuplicateSourceLine(line.name.clone()));
            }
        }
        if !line_names.contains(PROXIMITY_ID) {
            return Err(ActivationError::MissingProximityLine);
        }

        let mut seen = HashSet::new();
        for activation in &activations {
            if activation.id.is_empty() {
                return Err(ActivationError::EmptyId);
            }
            if !seen.insert(activation.id.as_str()) {
                return Err(ActivationError::DuplicateActivation(activation.id.clone()));
            }
            if !line_names.contains(activation.source_line.as_str()) {
                return Err(ActivationError::UnknownSourceLine {
                    activation: activation.id.clone(),
                    line: activation.source_line.clone(),
                });
            }
            check_distances(activation)?;
        }
        if !seen.contains(PROXIMITY_ID) {
            return Err(ActivationError::MissingProximity);
        }

        // Stable sort keeps config order between equal weights.
        activations.sort_by(|a, b| b.weight.cmp(&a.weight));
        source_lines.sort_by(|a, b| b.weight.cmp(&a.weight));
        let index = activations
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.clone(), i))
            .collect();

        let set = Self {
            activations,
            source_lines,
            index,
        };
        for activation in &set.activations {
            set.check_inheritance(activation)?;
        }
        Ok(set)
    }

    /// A set holding only the proximity activation.
    pub fn proximity_only(distances: Vec<i32>, default_distance: i32) -> Result<Self, ActivationError> {
        Self::new(
            vec![Activation::proximity(distances, default_distance)],
            vec![SourceLine::proximity()],
        )
    }

    fn check_inheritance(&self, activation: &Activation) -> Result<(), ActivationError> {
        if activation.is_proximity() {
            if activation.kind == ActivationKind::Inherit || activation.parent.is_some() {
                return Err(ActivationError::ProximityInheritance(activation.id.clone()));
            }
            return Ok(());
        }
        if activation.kind != ActivationKind::Inherit {
            return Ok(());
        }

        let mut visited = HashSet::new();
        visited.insert(activation.id.as_str());
        let mut current = activation;
        let mut depth = 0;
        while current.kind == ActivationKind::Inherit {
            let parent_id = current
                .parent
                .as_deref()
                .ok_or_else(|| ActivationError::MissingParent(current.id.clone()))?;
            if parent_id == PROXIMITY_ID {
                return Err(ActivationError::ProximityInheritance(current.id.clone()));
            }
            let parent = self.get(parent_id).ok_or_else(|| ActivationError::UnknownParent {
                activation: current.id.clone(),
                parent: parent_id.to_string(),
            })?;
            if !visited.insert(parent.id.as_str()) {
                return Err(ActivationError::Cycle(activation.id.clone()));
            }
            depth += 1;
            if depth > MAX_INHERIT_DEPTH {
                return Err(ActivationError::TooDeep {
                    activation: activation.id.clone(),
                    max: MAX_INHERIT_DEPTH,
                });
            }
            current = parent;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Activation> {
        self.index.get(id).map(|&i| &self.activations[i])
    }

    /// Activations in evaluation order (highest weight first).
    pub fn activations(&self) -> &[Activation] {
        &self.activations
    }

    pub fn source_lines(&self) -> &[SourceLine] {
        &self.source_lines
    }

    pub fn has_source_line(&self, name: &str) -> bool {
        self.source_lines.iter().any(|line| line.name == name)
    }

    /// The activation whose trigger `id` uses: itself, or the first
    /// non-inherit ancestor.
    pub fn trigger_of(&self, id: &str) -> Option<&Activation> {
        let mut current = self.get(id)?;
        for _ in 0..=MAX_INHERIT_DEPTH {
            if current.kind != ActivationKind::Inherit {
                return Some(current);
            }
            current = self.get(current.parent.as_deref()?)?;
        }
        None
    }

    /// The concrete kind (`PushToTalk` or `VoiceActivation`) of `id`.
    pub fn resolve_kind(&self, id: &str) -> Option<ActivationKind> {
        self.trigger_of(id).map(|a| a.kind)
    }
}

fn check_distances(activation: &Activation) -> Result<(), ActivationError> {
    if !activation.has_distance() {
        return Ok(());
    }
    let fail = |reason| {
        Err(ActivationError::InvalidDistances {
            activation: activation.id.clone(),
            reason,
        })
    };
    let max_wire = i32::from(u16::MAX);

    if activation.is_free_form() {
        if activation.max_distance <= 0 || activation.max_distance > max_wire {
            return fail("free-form max_distance must be in 1..=65535");
        }
        if activation.default_distance < 1 || activation.default_distance > activation.max_distance {
            return fail("default_distance must be within 1..=max_distance");
        }
        return Ok(());
    }

    if activation.distances.iter().any(|&d| d <= 0 || d > max_wire) {
        return fail("distances must be in 1..=65535");
    }
    if !activation.distances.windows(2).all(|w| w[0] < w[1]) {
        return fail("distances must be strictly ascending");
    }
    if !activation.distances.contains(&activation.default_distance) {
        return fail("default_distance must be one of the distances");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines() -> Vec<SourceLine> {
        vec![
            SourceLine::proximity(),
            SourceLine {
                name: "group".into(),
                ..SourceLine::default()
            },
        ]
    }

    fn activation(id: &str, kind: ActivationKind, parent: Option<&str>) -> Activation {
        Activation {
            id: id.into(),
            source_line: "group".into(),
            kind,
            parent: parent.map(str::to_string),
            ..Activation::default()
        }
    }

    fn proximity() -> Activation {
        Activation::proximity(vec![8, 16, 32], 16)
    }

    #[test]
    fn proximity_only_is_valid() {
        let set = ActivationSet::proximity_only(vec![8, 16, 32], 16).unwrap();
        assert_eq!(set.activations().len(), 1);
        assert!(set.get(PROXIMITY_ID).is_some());
        assert!(set.has_source_line(PROXIMITY_ID));
    }

    #[test]
    fn proximity_is_mandatory() {
        let err = ActivationSet::new(
            vec![activation("group", ActivationKind::PushToTalk, None)],
            lines(),
        )
        .unwrap_err();
        assert_eq!(err, ActivationError::MissingProximity);
    }

    #[test]
    fn inherit_resolves_through_parents() {
        let set = ActivationSet::new(
            vec![
                proximity(),
                activation("group", ActivationKind::PushToTalk, None),
                activation("whisper", ActivationKind::Inherit, Some("group")),
                activation("murmur", ActivationKind::Inherit, Some("whisper")),
            ],
            lines(),
        )
        .unwrap();
        assert_eq!(set.resolve_kind("murmur"), Some(ActivationKind::PushToTalk));
        assert_eq!(set.trigger_of("murmur").map(|a| a.id.as_str()), Some("group"));
        assert_eq!(set.resolve_kind("missing"), None);
    }

    #[test]
    fn cycles_are_rejected() {
        let err = ActivationSet::new(
            vec![
                proximity(),
                activation("a", ActivationKind::Inherit, Some("b")),
                activation("b", ActivationKind::Inherit, Some("a")),
            ],
            lines(),
        )
        .unwrap_err();
        assert!(matches!(err, ActivationError::Cycle(_)));
    }

    #[test]
    fn self_inheritance_is_a_cycle() {
        let err = ActivationSet::new(
            vec![proximity(), activation("a", ActivationKind::Inherit, Some("a"))],
            lines(),
        )
        .unwrap_err();
        assert_eq!(err, ActivationError::Cycle("a".into()));
    }

    #[test]
    fn over_deep_chains_are_rejected() {
        let mut activations = vec![proximity(), activation("a0", ActivationKind::VoiceActivation, None)];
        for i in 1..=MAX_INHERIT_DEPTH + 1 {
            let parent = format!("a{}", i - 1);
            activations.push(activation(&format!("a{}", i), ActivationKind::Inherit, Some(&parent)));
        }
        let err = ActivationSet::new(activations, lines()).unwrap_err();
        assert!(matches!(err, ActivationError::TooDeep { max: MAX_INHERIT_DEPTH, .. }));
    }

    #[test]
    fn max_depth_chain_is_accepted() {
        let mut activations = vec![proximity(), activation("a0", ActivationKind::VoiceActivation, None)];
        for i in 1..=MAX_INHERIT_DEPTH {
            let parent = format!("a{}", i - 1);
            activations.push(activation(&format!("a{}", i), ActivationKind::Inherit, Some(&parent)));
        }
        let set = ActivationSet::new(activations, lines()).unwrap();
        let last = format!("a{}", MAX_INHERIT_DEPTH);
        assert_eq!(set.resolve_kind(&last), Some(ActivationKind::VoiceActivation));
    }

    #[test]
    fn proximity_cannot_be_parent_or_child() {
        let err = ActivationSet::new(
            vec![proximity(), activation("a", ActivationKind::Inherit, Some(PROXIMITY_ID))],
            lines(),
        )
        .unwrap_err();
        assert!(matches!(err, ActivationError::ProximityInheritance(_)));

        let mut child = proximity();
        child.kind = ActivationKind::Inherit;
        child.parent = Some("group".into());
        let err = ActivationSet::new(
            vec![child, activation("group", ActivationKind::PushToTalk, None)],
            lines(),
        )
        .unwrap_err();
        assert!(matches!(err, ActivationError::ProximityInheritance(_)));
    }

    #[test]
    fn unknown_parent_and_missing_parent() {
        let err = ActivationSet::new(
            vec![proximity(), activation("a", ActivationKind::Inherit, Some("nope"))],
            lines(),
        )
        .unwrap_err();
        assert!(matches!(err, ActivationError::UnknownParent { .. }));

        let err = ActivationSet::new(
            vec![proximity(), activation("a", ActivationKind::Inherit, None)],
            lines(),
        )
        .unwrap_err();
        assert_eq!(err, ActivationError::MissingParent("a".into()));
    }

    #[test]
    fn unknown_line_and_duplicates() {
        let mut stray = activation("a", ActivationKind::PushToTalk, None);
        stray.source_line = "radio".into();
        let err = ActivationSet::new(vec![proximity(), stray], lines()).unwrap_err();
        assert!(matches!(err, ActivationError::UnknownSourceLine { .. }));

        let err = ActivationSet::new(vec![proximity(), proximity()], lines()).unwrap_err();
        assert_eq!(err, ActivationError::DuplicateActivation(PROXIMITY_ID.into()));

        let mut doubled = lines();
        doubled.push(SourceLine::proximity());
        let err = ActivationSet::new(vec![proximity()], doubled).unwrap_err();
        assert!(matches!(err, ActivationError::DuplicateSourceLine(_)));
    }

    #[test]
    fn distance_validation() {
        let bad_default = Activation::proximity(vec![8, 16], 12);
        assert!(matches!(
            ActivationSet::new(vec![bad_default], lines()),
            Err(ActivationError::InvalidDistances { .. })
        ));

        let unordered = Activation::proximity(vec![16, 8], 8);
        assert!(ActivationSet::new(vec![unordered], lines()).is_err());

        let mut free_form = Activation::proximity(vec![1], 24);
        free_form.min_distance = -1;
        free_form.max_distance = 96;
        assert!(ActivationSet::new(vec![free_form.clone()], lines()).is_ok());

        free_form.max_distance = 0;
        assert!(ActivationSet::new(vec![free_form], lines()).is_err());
    }

    #[test]
    fn ordered_by_weight() {
        let mut loud = activation("loud", ActivationKind::PushToTalk, None);
        loud.weight = 10;
        let set = ActivationSet::new(vec![proximity(), loud], lines()).unwrap();
        assert_eq!(set.activations()[0].id, "loud");
        assert_eq!(set.get(PROXIMITY_ID).map(|a| a.weight), Some(0));
    }
}
