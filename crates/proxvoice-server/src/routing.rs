//! Who hears a frame.
//!
//! A frame is checked once per sender (mute, activation, distance,
//! permission) into a [`RouteDecision`]; the decision is then evaluated for
//! every other session.

use std::sync::Arc;

use proxvoice_protocol::tcp::{ClientboundPacket, PlayerAudioEnd, SourceAudioEnd};
use proxvoice_protocol::types::Audibility;
use proxvoice_protocol::udp::{PlayerAudio, SourceAudio, UdpPacket};
use tracing::debug;
use uuid::Uuid;

use crate::config::ConfigSnapshot;
use crate::hooks::VoicePlayer;
use crate::session::Session;
use crate::state::{ServerState, UdpStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteRejection {
    Muted,
    UnknownActivation,
    UnknownPlayer,
    Forbidden,
    InvalidDistance,
}

/// Where one sender's frame on one activation goes.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub sender: Uuid,
    pub activation: String,
    pub source_line: String,
    pub audibility: Audibility,
    pub origin: VoicePlayer,
}

impl RouteDecision {
    /// Wire distance for listeners; `0` when there is none.
    pub fn wire_distance(&self) -> u16 {
        match self.audibility {
            Audibility::Everywhere => 0,
            Audibility::Within(distance) => distance,
        }
    }

    /// Whether `listener` should receive the frame. A listener whose
    /// position (or the sender's) is unknown counts as in range.
    pub fn is_eligible(&self, listener: &Session, player: Option<&VoicePlayer>) -> bool {
        if listener.player_id == self.sender || !listener.is_subscribed(&self.source_line) {
            return false;
        }
        let Audibility::Within(distance) = self.audibility else {
            return true;
        };
        let Some(player) = player else {
            return true;
        };
        match (&self.origin.position, &player.position) {
            (Some(from), Some(to)) => {
                if self.origin.world.is_some() && player.world.is_some() && self.origin.world != player.world {
                    return false;
                }
                let range = f64::from(distance);
                from.distance_squared(to) <= range * range
            }
            _ => true,
        }
    }
}

/// Check a frame from `sender` on `activation` at `distance`.
pub fn decide(
    state: &ServerState,
    snapshot: &ConfigSnapshot,
    sender: &Session,
    activation: &str,
    distance: u16,
) -> Result<RouteDecision, RouteRejection> {
    if state.mutes.is_muted(&sender.player_id) {
        return Err(RouteRejection::Muted);
    }
    let decision = resolve(state, snapshot, sender, activation, distance)?;
    if let Some(permissions) = &state.permissions {
        if !permissions.can_activate(&decision.origin, &decision.activation) {
            return Err(RouteRejection::Forbidden);
        }
    }
    Ok(decision)
}

/// Activation, line and range for a frame, without mute or permission
/// checks. End markers use this so a burst cut off by a mute still closes.
pub fn resolve(
    state: &ServerState,
    snapshot: &ConfigSnapshot,
    sender: &Session,
    activation: &str,
    distance: u16,
) -> Result<RouteDecision, RouteRejection> {
    let activation = snapshot
        .activations
        .get(activation)
        .ok_or(RouteRejection::UnknownActivation)?;
    let origin = state
        .players
        .by_id(&sender.player_id)
        .ok_or(RouteRejection::UnknownPlayer)?;
    let audibility = activation
        .resolve_distance(distance)
        .ok_or(RouteRejection::InvalidDistance)?;

    Ok(RouteDecision {
        sender: sender.player_id,
        activation: activation.id.clone(),
        source_line: activation.source_line.clone(),
        audibility,
        origin,
    })
}

/// Forward a frame to every eligible listener. Returns how many got it.
pub async fn route_audio(
    state: &ServerState,
    snapshot: &ConfigSnapshot,
    sender: &Arc<Session>,
    audio: PlayerAudio,
) -> usize {
    let decision = match decide(state, snapshot, sender, &audio.activation, audio.distance) {
        Ok(decision) => decision,
        Err(reason) => {
            UdpStats::incr(&state.stats.dropped);
            state.debug.log(format_args!(
                "dropped audio from {} on {}: {:?}",
                sender.player_id, audio.activation, reason
            ));
            return 0;
        }
    };

    let packet = UdpPacket::SourceAudio(SourceAudio {
        sequence: audio.sequence,
        source_id: decision.sender,
        line: decision.source_line.clone(),
        distance: decision.wire_distance(),
        data: audio.data,
    });

    let mut delivered = 0;
    for listener in state.sessions.all() {
        let player = state.players.by_id(&listener.player_id);
        if decision.is_eligible(&listener, player.as_ref()) && state.send_udp(&listener, &packet).await {
            delivered += 1;
        }
    }
    UdpStats::incr(&state.stats.routed);
    state.debug.log(format_args!(
        "routed #{} from {} on {} to {} listeners",
        audio.sequence, sender.player_id, decision.source_line, delivered
    ));
    delivered
}

/// Relay an end-of-burst marker over the control channel.
///
/// Listeners are never waited for: a listener with a full queue is closed
/// and skipped.
pub fn route_audio_end(
    state: &ServerState,
    snapshot: &ConfigSnapshot,
    sender: &Arc<Session>,
    end: PlayerAudioEnd,
) -> usize {
    let decision = match resolve(state, snapshot, sender, &end.activation, end.distance) {
        Ok(decision) => decision,
        Err(reason) => {
            debug!(player = %sender.player_id, activation = %end.activation, ?reason, "dropped audio end");
            return 0;
        }
    };
    let packet = ClientboundPacket::SourceAudioEnd(SourceAudioEnd {
        source_id: decision.sender,
        line: decision.source_line.clone(),
        sequence: end.sequence,
    });

    let mut delivered = 0;
    for listener in state.sessions.all() {
        let player = state.players.by_id(&listener.player_id);
        if !decision.is_eligible(&listener, player.as_ref()) {
            continue;
        }
        match listener.try_send(&packet) {
            Ok(()) => delivered += 1,
            Err(e) => debug!(player = %listener.player_id, "audio end not delivered: {}", e),
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use proxvoice_protocol::types::{Activation, SourceLine};
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::ServerConfig;
    use crate::hooks::{Collaborators, MemoryLookup, PermissionSupplier, PlayerLookup, Position};
    use crate::mute::ServerMute;

    struct DenyRadio;

    impl PermissionSupplier for DenyRadio {
        fn can_activate(&self, _player: &VoicePlayer, activation: &str) -> bool {
            activation != "radio"
        }
    }

    fn snapshot() -> ConfigSnapshot {
        let mut config = ServerConfig::default();
        config.source_lines.push(SourceLine {
            name: "radio".into(),
            ..SourceLine::default()
        });
        config.activations.push(Activation {
            id: "radio".into(),
            source_line: "radio".into(),
            ..Activation::default()
        });
        ConfigSnapshot::build(config, None, None, PathBuf::from(".")).unwrap()
    }

    struct Fixture {
        state: ServerState,
        lookup: Arc<MemoryLookup>,
        snapshot: ConfigSnapshot,
        _receivers: Vec<mpsc::Receiver<Vec<u8>>>,
    }

    impl Fixture {
        fn new(permissions: Option<Arc<dyn PermissionSupplier>>) -> Self {
            let lookup = Arc::new(MemoryLookup::closed());
            let mut collaborators = Collaborators::new(lookup.clone());
            collaborators.permissions = permissions;
            Self {
                state: ServerState::new(&collaborators),
                lookup,
                snapshot: snapshot(),
                _receivers: Vec::new(),
            }
        }

        fn join(&mut self, name: &str, at: Option<Position>) -> Arc<Session> {
            let id = Uuid::new_v4();
            self.lookup.insert(VoicePlayer::new(id, name));
            if let Some(position) = at {
                self.lookup.set_position(&id, "overworld", position);
            }
            let (tx, rx) = mpsc::channel(8);
            self._receivers.push(rx);
            let snapshot = &self.snapshot;
            self.state
                .sessions
                .create(id, name.into(), 0, tx, |secret| ServerState::session_crypto(snapshot, secret))
                .unwrap()
        }

        fn decide(&self, sender: &Session, activation: &str, distance: u16) -> Result<RouteDecision, RouteRejection> {
            decide(&self.state, &self.snapshot, sender, activation, distance)
        }
    }

    #[test]
    fn proximity_range_uses_distance() {
        let mut f = Fixture::new(None);
        let alex = f.join("Alex", Some(Position::new(0.0, 64.0, 0.0)));
        let near = f.join("Near", Some(Position::new(10.0, 64.0, 0.0)));
        let far = f.join("Far", Some(Position::new(40.0, 64.0, 0.0)));

        let decision = f.decide(&alex, "proximity", 16).unwrap();
        assert_eq!(decision.audibility, Audibility::Within(16));
        let near_player = f.lookup.by_id(&near.player_id);
        let far_player = f.lookup.by_id(&far.player_id);
        assert!(decision.is_eligible(&near, near_player.as_ref()));
        assert!(!decision.is_eligible(&far, far_player.as_ref()));
        // Never back to the sender.
        assert!(!decision.is_eligible(&alex, f.lookup.by_id(&alex.player_id).as_ref()));
    }

    #[test]
    fn zero_distance_selects_default() {
        let mut f = Fixture::new(None);
        let alex = f.join("Alex", None);
        assert_eq!(f.decide(&alex, "proximity", 0).unwrap().wire_distance(), 16);
        assert_eq!(f.decide(&alex, "proximity", 20), Err(RouteRejection::InvalidDistance));
    }

    #[test]
    fn activation_without_distances_is_always_in_range() {
        let mut f = Fixture::new(None);
        let alex = f.join("Alex", Some(Position::new(0.0, 0.0, 0.0)));
        let far = f.join("Far", Some(Position::new(10_000.0, 0.0, 0.0)));

        let decision = f.decide(&alex, "radio", 0).unwrap();
        assert_eq!(decision.audibility, Audibility::Everywhere);
        assert_eq!(decision.wire_distance(), 0);
        assert!(decision.is_eligible(&far, f.lookup.by_id(&far.player_id).as_ref()));
    }

    #[test]
    fn unknown_position_counts_as_in_range() {
        let mut f = Fixture::new(None);
        let alex = f.join("Alex", Some(Position::new(0.0, 0.0, 0.0)));
        let nowhere = f.join("Nowhere", None);
        let decision = f.decide(&alex, "proximity", 8).unwrap();
        assert!(decision.is_eligible(&nowhere, f.lookup.by_id(&nowhere.player_id).as_ref()));
        assert!(decision.is_eligible(&nowhere, None));
    }

    #[test]
    fn other_world_is_out_of_range() {
        let mut f = Fixture::new(None);
        let alex = f.join("Alex", Some(Position::new(0.0, 0.0, 0.0)));
        let nether = f.join("Nether", None);
        f.lookup.set_position(&nether.player_id, "nether", Position::new(1.0, 0.0, 0.0));
        let decision = f.decide(&alex, "proximity", 8).unwrap();
        assert!(!decision.is_eligible(&nether, f.lookup.by_id(&nether.player_id).as_ref()));
    }

    #[test]
    fn unsubscribed_listener_is_skipped() {
        let mut f = Fixture::new(None);
        let alex = f.join("Alex", None);
        let bob = f.join("Bob", None);
        bob.subscribe("radio", false);
        let decision = f.decide(&alex, "radio", 0).unwrap();
        assert!(!decision.is_eligible(&bob, None));
        assert!(f.decide(&alex, "proximity", 0).unwrap().is_eligible(&bob, None));
    }

    #[tokio::test]
    async fn muted_sender_is_rejected() {
        let mut f = Fixture::new(None);
        let alex = f.join("Alex", None);
        f.state
            .mutes
            .mute(ServerMute::new(alex.player_id, None, None))
            .await
            .unwrap();
        assert_eq!(f.decide(&alex, "proximity", 0), Err(RouteRejection::Muted));
    }

    #[test]
    fn permission_supplier_is_consulted() {
        let mut f = Fixture::new(Some(Arc::new(DenyRadio)));
        let alex = f.join("Alex", None);
        assert_eq!(f.decide(&alex, "radio", 0), Err(RouteRejection::Forbidden));
        assert!(f.decide(&alex, "proximity", 0).is_ok());
        assert_eq!(f.decide(&alex, "shout", 0), Err(RouteRejection::UnknownActivation));
    }

    #[tokio::test]
    async fn audio_end_is_relayed_over_tcp() {
        let mut f = Fixture::new(None);
        let alex = f.join("Alex", None);
        let _bob = f.join("Bob", None);
        let delivered = route_audio_end(
            &f.state,
            &f.snapshot,
            &alex,
            PlayerAudioEnd {
                activation: "radio".into(),
                sequence: 41,
                distance: 0,
            },
        );
        assert_eq!(delivered, 1);

        let frame = f._receivers[1].try_recv().unwrap();
        let packet = ClientboundPacket::decode(&frame[4..]).unwrap();
        assert_eq!(
            packet,
            ClientboundPacket::SourceAudioEnd(SourceAudioEnd {
                source_id: alex.player_id,
                line: "radio".into(),
                sequence: 41,
            })
        );
        assert!(f._receivers[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn audio_without_udp_socket_counts_as_routed_but_undelivered() {
        let mut f = Fixture::new(None);
        let alex = f.join("Alex", None);
        f.join("Bob", None);
        let audio = PlayerAudio {
            sequence: 0,
            activation: "proximity".into(),
            distance: 0,
            data: vec![1, 2, 3],
        };
        assert_eq!(route_audio(&f.state, &f.snapshot, &alex, audio).await, 0);
        assert_eq!(f.state.stats.snapshot().routed, 1);
    }

    #[tokio::test]
    async fn audio_end_reaches_listeners_after_mute() {
        let mut f = Fixture::new(None);
        let alex = f.join("Alex", None);
        let _bob = f.join("Bob", None);
        f.state
            .mutes
            .mute(ServerMute::new(alex.player_id, None, None))
            .await
            .unwrap();

        let end = PlayerAudioEnd {
            activation: "proximity".into(),
            sequence: 7,
            distance: 0,
        };
        assert_eq!(route_audio_end(&f.state, &f.snapshot, &alex, end), 1);
        let frame = f._receivers[1].try_recv().unwrap();
        assert!(matches!(
            ClientboundPacket::decode(&frame[4..]).unwrap(),
            ClientboundPacket::SourceAudioEnd(SourceAudioEnd { sequence: 7, .. })
        ));
    }

    #[tokio::test]
    async fn stalled_listener_is_closed_not_waited_for() {
        let mut f = Fixture::new(None);
        let alex = f.join("Alex", None);
        let bob = f.join("Bob", None);
        f.join("Carol", None);
        let filler = ClientboundPacket::PlayerInfoRequest(proxvoice_protocol::tcp::PlayerInfoRequest);
        while bob.try_send(&filler).is_ok() {}
        // Filling the queue already asked Bob's connection to close; consume that.
        tokio::time::timeout(std::time::Duration::from_secs(1), bob.closed())
            .await
            .unwrap();

        let end = PlayerAudioEnd {
            activation: "radio".into(),
            sequence: 3,
            distance: 0,
        };
        assert_eq!(route_audio_end(&f.state, &f.snapshot, &alex, end), 1);
        tokio::time::timeout(std::time::Duration::from_secs(1), bob.closed())
            .await
            .unwrap();
        let frame = f._receivers[2].try_recv().unwrap();
        assert!(matches!(
            ClientboundPacket::decode(&frame[4..]).unwrap(),
            ClientboundPacket::SourceAudioEnd(SourceAudioEnd { sequence: 3, .. })
        ));
    }
}
