use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwapOption;
use proxvoice_crypto::EncryptionError;
use proxvoice_protocol::tcp::{ClientboundPacket, ServerInfo};
use proxvoice_protocol::types::EncryptionInfo;
use proxvoice_protocol::udp::{build_datagram, UdpPacket};
use tokio::net::UdpSocket;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::ConfigSnapshot;
use crate::debug::DebugLogger;
use crate::hooks::{Collaborators, PermissionSupplier, PlayerLookup};
use crate::mute::{MemoryMuteStorage, MuteManager};
use crate::session::{Session, SessionCrypto, SessionTable};

/// UDP diagnostics.
#[derive(Debug, Default)]
pub struct UdpStats {
    pub received: AtomicU64,
    pub unknown_session: AtomicU64,
    pub decrypt_failures: AtomicU64,
    pub decode_failures: AtomicU64,
    pub routed: AtomicU64,
    pub dropped: AtomicU64,
    pub sent: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UdpStatsSnapshot {
    pub received: u64,
    pub unknown_session: u64,
    pub decrypt_failures: u64,
    pub decode_failures: u64,
    pub routed: u64,
    pub dropped: u64,
    pub sent: u64,
}

impl UdpStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UdpStatsSnapshot {
        UdpStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            unknown_session: self.unknown_session.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
        }
    }
}

/// The shared server state, designed for concurrent access.
pub struct ServerState {
    /// Identifies this server instance to clients.
    pub server_id: Uuid,
    pub sessions: SessionTable,
    pub mutes: MuteManager,
    /// Current config; `None` until the first successful load.
    pub config: ArcSwapOption<ConfigSnapshot>,
    pub players: Arc<dyn PlayerLookup>,
    pub permissions: Option<Arc<dyn PermissionSupplier>>,
    pub game_port: Option<u16>,
    pub debug: DebugLogger,
    pub stats: UdpStats,
    udp_socket: RwLock<Option<Arc<UdpSocket>>>,
}

impl ServerState {
    pub fn new(collaborators: &Collaborators) -> Self {
        Self {
            server_id: Uuid::new_v4(),
            sessions: SessionTable::default(),
            mutes: MuteManager::new(Arc::new(MemoryMuteStorage::default())),
            config: ArcSwapOption::empty(),
            players: collaborators.players.clone(),
            permissions: collaborators.permissions.clone(),
            game_port: collaborators.game_port,
            debug: DebugLogger::default(),
            stats: UdpStats::default(),
            udp_socket: RwLock::new(None),
        }
    }

    pub fn snapshot(&self) -> Option<Arc<ConfigSnapshot>> {
        self.config.load_full()
    }

    pub fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.udp_socket.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn set_udp_socket(&self, socket: Option<Arc<UdpSocket>>) {
        *self.udp_socket.write().unwrap_or_else(|p| p.into_inner()) = socket;
    }

    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.udp_socket()?.local_addr().ok()
    }

    /// Build the cipher for the session identified by `secret`.
    pub fn session_crypto(snapshot: &ConfigSnapshot, secret: &Uuid) -> Result<SessionCrypto, EncryptionError> {
        let key = snapshot.server_key.derive_session_key(secret)?;
        let cipher = proxvoice_crypto::create(&snapshot.config.voice.encryption, key.as_bytes())?;
        Ok(SessionCrypto { cipher, key })
    }

    /// Everything a client needs to start talking.
    ///
    /// An empty `udp_host` tells the client to use the control channel's
    /// host.
    pub fn server_info(&self, session: &Session, snapshot: &ConfigSnapshot) -> ServerInfo {
        let host = &snapshot.config.host.ip;
        let udp_host = if host == "0.0.0.0" || host == "::" {
            String::new()
        } else {
            host.clone()
        };
        ServerInfo {
            server_id: self.server_id,
            player_id: session.player_id,
            secret: session.secret,
            udp_host,
            udp_port: self.udp_local_addr().map(|a| a.port()).unwrap_or(0),
            keep_alive_timeout_ms: snapshot.config.voice.keep_alive_timeout_ms,
            encryption: EncryptionInfo {
                algorithm: snapshot.config.voice.encryption.clone(),
                key: session.session_key().as_bytes().to_vec(),
            },
            capture: snapshot.capture.clone(),
            activations: snapshot.activations.activations().to_vec(),
            source_lines: snapshot.activations.source_lines().to_vec(),
            mute: self.mutes.get(&session.player_id).map(|m| m.to_info()),
        }
    }

    /// Encrypt and send a packet to the session's learned UDP address.
    /// Returns `false` when it could not be sent.
    pub async fn send_udp(&self, session: &Session, packet: &UdpPacket) -> bool {
        let Some(addr) = session.udp_addr() else {
            trace!(player = %session.player_id, "no UDP address learned yet, dropping");
            return false;
        };
        let Some(socket) = self.udp_socket() else {
            return false;
        };
        let encrypted = match session.cipher().encrypt(&packet.encode()) {
            Ok(encrypted) => encrypted,
            Err(e) => {
                debug!(player = %session.player_id, "failed to encrypt UDP packet: {}", e);
                return false;
            }
        };
        let datagram = build_datagram(&session.secret, &encrypted);
        match socket.send_to(&datagram, addr).await {
            Ok(_) => {
                UdpStats::incr(&self.stats.sent);
                true
            }
            Err(e) => {
                debug!(player = %session.player_id, %addr, "UDP send failed: {}", e);
                false
            }
        }
    }

    /// Send a control message to every session. Sessions whose queue is
    /// full are closed instead of waited for.
    pub fn broadcast(&self, packet: &ClientboundPacket) {
        for session in self.sessions.all() {
            if let Err(e) = session.try_send(packet) {
                debug!(player = %session.player_id, "broadcast failed: {}", e);
            }
        }
    }
}
