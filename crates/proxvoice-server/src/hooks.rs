//! Collaborators the embedding game server provides.
//!
//! The voice server owns references to these instead of reaching into global
//! registries. Every hook has a no-op default.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::mute::MuteStorage;
use crate::udp::UdpServer;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance_squared(&self, other: &Position) -> f64 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        dx * dx + dy * dy + dz * dz
    }
}

/// A game player as the voice server sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct VoicePlayer {
    pub id: Uuid,
    pub name: String,
    pub world: Option<String>,
    pub position: Option<Position>,
}

impl VoicePlayer {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            world: None,
            position: None,
        }
    }
}

/// Resolves players by id or by the game's native player handle.
pub trait PlayerLookup: Send + Sync {
    fn by_id(&self, id: &Uuid) -> Option<VoicePlayer>;

    /// The default accepts a `Uuid` handle.
    fn by_handle(&self, handle: &dyn Any) -> Option<VoicePlayer> {
        handle.downcast_ref::<Uuid>().and_then(|id| self.by_id(id))
    }
}

/// Decides whether a player may speak through an activation.
pub trait PermissionSupplier: Send + Sync {
    fn can_activate(&self, player: &VoicePlayer, activation: &str) -> bool;
}

/// Lifecycle callbacks. Hooks that receive an object may replace it.
pub trait ServerHooks: Send + Sync {
    fn on_initialize(&self) {}

    fn on_shutdown(&self) {}

    /// Called after `config.toml` is parsed, before it is validated.
    fn on_config_loaded(&self, _config: &mut ServerConfig) {}

    fn udp_server_create(&self, server: UdpServer) -> UdpServer {
        server
    }

    fn on_udp_server_started(&self, _addr: SocketAddr) {}

    fn on_udp_server_stopped(&self) {}

    fn mute_storage_create(&self, storage: Arc<dyn MuteStorage>) -> Arc<dyn MuteStorage> {
        storage
    }
}

pub struct NoHooks;

impl ServerHooks for NoHooks {}

/// Everything the voice server needs from its host.
#[derive(Clone)]
pub struct Collaborators {
    pub players: Arc<dyn PlayerLookup>,
    pub hooks: Arc<dyn ServerHooks>,
    pub permissions: Option<Arc<dyn PermissionSupplier>>,
    /// The game server's own port, used when `host.port` is `0`.
    pub game_port: Option<u16>,
}

impl Collaborators {
    pub fn new(players: Arc<dyn PlayerLookup>) -> Self {
        Self {
            players,
            hooks: Arc::new(NoHooks),
            permissions: None,
            game_port: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ServerHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionSupplier>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_game_port(mut self, port: u16) -> Self {
        self.game_port = Some(port);
        self
    }
}

/// In-memory player directory.
///
/// An open directory also admits players it has never seen, which is what
/// the standalone binary uses.
#[derive(Default)]
pub struct MemoryLookup {
    players: DashMap<Uuid, VoicePlayer>,
    open: bool,
}

impl MemoryLookup {
    pub fn open() -> Self {
        Self {
            players: DashMap::new(),
            open: true,
        }
    }

    pub fn closed() -> Self {
        Self::default()
    }

    pub fn insert(&self, player: VoicePlayer) {
        self.players.insert(player.id, player);
    }

    pub fn remove(&self, id: &Uuid) {
        self.players.remove(id);
    }

    pub fn set_position(&self, id: &Uuid, world: &str, position: Position) {
        if let Some(mut player) = self.players.get_mut(id) {
            player.world = Some(world.to_string());
            player.position = Some(position);
        }
    }
}

impl PlayerLookup for MemoryLookup {
    fn by_id(&self, id: &Uuid) -> Option<VoicePlayer> {
        match self.players.get(id) {
            Some(player) => Some(player.clone()),
            None if self.open => Some(VoicePlayer::new(*id, String::new())),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_lookup_only_knows_inserted_players() {
        let lookup = MemoryLookup::closed();
        let id = Uuid::new_v4();
        assert!(lookup.by_id(&id).is_none());

        lookup.insert(VoicePlayer::new(id, "Alex"));
        lookup.set_position(&id, "overworld", Position::new(1.0, 2.0, 3.0));
        let player = lookup.by_handle(&id).unwrap();
        assert_eq!(player.name, "Alex");
        assert_eq!(player.world.as_deref(), Some("overworld"));

        assert!(lookup.by_handle(&"not a uuid").is_none());
    }

    #[test]
    fn open_lookup_admits_anyone() {
        let lookup = MemoryLookup::open();
        assert!(lookup.by_id(&Uuid::new_v4()).is_some());
    }

    #[test]
    fn distance() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert_eq!(a.distance_squared(&b), 25.0);
    }
}
