//! Voice server lifecycle: startup, config reload, maintenance and shutdown.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use proxvoice_protocol::tcp::{ActivationsUpdate, ClientboundPacket, MuteState, PlayerInfoRequest};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{load_forwarding_secret, ConfigSnapshot, ServerConfig};
use crate::error::ServerError;
use crate::hooks::{Collaborators, ServerHooks};
use crate::mute::{now_ms, JsonMuteStorage, MuteStorage, ServerMute};
use crate::state::ServerState;
use crate::udp::UdpServer;
use crate::{tcp, tls, udp};

/// Mute storage file inside the config directory.
pub const MUTES_FILE: &str = "mutes.json";

const PING_INTERVAL: Duration = Duration::from_secs(1);
const MUTE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct VoiceServer {
    config_dir: PathBuf,
    hooks: Arc<dyn ServerHooks>,
    state: Arc<ServerState>,
    udp: tokio::sync::Mutex<Option<UdpServer>>,
    tcp_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VoiceServer {
    pub fn new(config_dir: impl Into<PathBuf>, collaborators: Collaborators) -> Self {
        Self {
            config_dir: config_dir.into(),
            hooks: collaborators.hooks.clone(),
            state: Arc::new(ServerState::new(&collaborators)),
            udp: tokio::sync::Mutex::new(None),
            tcp_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Start everything: mute storage, config, UDP, the TCP listener and the
    /// maintenance task.
    pub async fn initialize(&self) -> Result<(), ServerError> {
        self.hooks.on_initialize();

        let storage: Arc<dyn MuteStorage> = Arc::new(JsonMuteStorage::new(self.config_dir.join(MUTES_FILE)));
        self.state.mutes.set_storage(self.hooks.mute_storage_create(storage));
        self.state.mutes.init().await.map_err(ServerError::MuteStorage)?;

        self.load_config().await?;
        self.start_tcp().await?;

        let state = self.state.clone();
        lock(&self.tasks).push(tokio::spawn(maintenance_loop(state)));

        info!(config_dir = %self.config_dir.display(), "voice server initialized");
        Ok(())
    }

    /// Load `config.toml` and apply it. On failure the previous config stays
    /// in effect.
    pub async fn load_config(&self) -> Result<(), ServerError> {
        let mut config = ServerConfig::load(&self.config_dir)?;
        config.apply_env();
        self.hooks.on_config_loaded(&mut config);
        let forwarding_secret = load_forwarding_secret(&self.config_dir)?;

        let previous = self.state.snapshot();
        let snapshot = Arc::new(ConfigSnapshot::build(
            config,
            previous.as_deref(),
            forwarding_secret,
            self.config_dir.clone(),
        )?);
        let udp_addr = snapshot.udp_bind_addr(self.state.game_port)?;

        self.state.debug.set_enabled(snapshot.config.debug);
        self.state.config.store(Some(snapshot.clone()));
        info!(
            activations = snapshot.activations.activations().len(),
            source_lines = snapshot.activations.source_lines().len(),
            debug = snapshot.config.debug,
            "config loaded"
        );

        let udp_changed = match &previous {
            None => true,
            Some(previous) => previous.udp_bind_addr(self.state.game_port)? != udp_addr || self.udp_addr().await.is_none(),
        };
        let udp_result = if udp_changed {
            self.restart_udp(udp_addr).await.map(|_| ())
        } else {
            Ok(())
        };

        if let Some(previous) = previous {
            self.state
                .broadcast(&ClientboundPacket::ActivationsUpdate(ActivationsUpdate {
                    activations: snapshot.activations.activations().to_vec(),
                    source_lines: snapshot.activations.source_lines().to_vec(),
                }));
            if udp_changed || snapshot.needs_resync(&previous) {
                self.state
                    .broadcast(&ClientboundPacket::PlayerInfoRequest(PlayerInfoRequest));
            }
        }
        udp_result
    }

    /// Replace the UDP server with a fresh one bound to `addr`. On failure
    /// no UDP server is left running.
    pub async fn restart_udp(&self, addr: SocketAddr) -> Result<SocketAddr, ServerError> {
        let mut guard = self.udp.lock().await;
        if let Some(mut old) = guard.take() {
            old.stop(&self.state);
            self.hooks.on_udp_server_stopped();
        }

        let mut server = self.hooks.udp_server_create(UdpServer::new());
        match server.start(self.state.clone(), addr).await {
            Ok(bound) => {
                self.hooks.on_udp_server_started(bound);
                *guard = Some(server);
                Ok(bound)
            }
            Err(e) => {
                error!(%addr, "failed to start UDP server: {}", e);
                Err(e)
            }
        }
    }

    async fn start_tcp(&self) -> Result<(), ServerError> {
        let snapshot = self.state.snapshot().ok_or(ServerError::NotReady)?;
        let addr = snapshot.tcp_bind_addr()?;
        let tls = match (&snapshot.config.tcp.cert_path, &snapshot.config.tcp.key_path) {
            (Some(cert), Some(key)) => {
                Some(tls::acceptor(&self.config_dir, cert, key).map_err(ServerError::Tls)?)
            }
            (None, None) => None,
            _ => {
                return Err(ServerError::InvalidConfig(
                    "tcp.cert_path and tcp.key_path must be set together".into(),
                ))
            }
        };

        let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            what: "TCP",
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            what: "TCP",
            addr: addr.to_string(),
            source,
        })?;
        info!(addr = %local_addr, tls = tls.is_some(), "TCP listener bound");

        *lock(&self.tcp_addr) = Some(local_addr);
        lock(&self.tasks).push(tokio::spawn(tcp::accept_loop(listener, tls, self.state.clone())));
        Ok(())
    }

    /// Stop everything. Connected players receive `Disconnected`.
    pub async fn shutdown(&self) {
        self.hooks.on_shutdown();

        if let Err(e) = self.state.mutes.close().await {
            error!("failed to close mute storage: {:#}", e);
        }

        if let Some(mut server) = self.udp.lock().await.take() {
            server.stop(&self.state);
            self.hooks.on_udp_server_stopped();
        }

        for session in self.state.sessions.all() {
            tcp::disconnect(&self.state, &session, "server shutting down");
        }

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        *lock(&self.tcp_addr) = None;
        info!("voice server stopped");
    }

    /// Mute a player and tell their client.
    pub async fn mute_player(
        &self,
        player_id: Uuid,
        muted_by: Option<Uuid>,
        until_ms: Option<u64>,
        reason: Option<String>,
    ) -> Result<ServerMute, ServerError> {
        let mut mute = ServerMute::new(player_id, until_ms, reason);
        mute.muted_by = muted_by;
        self.state
            .mutes
            .mute(mute.clone())
            .await
            .map_err(ServerError::MuteStorage)?;
        info!(player = %player_id, until_ms = ?mute.until_ms, "player muted");
        push_mute_state(&self.state, &player_id, Some(&mute));
        Ok(mute)
    }

    /// Returns whether the player was muted.
    pub async fn unmute_player(&self, player_id: &Uuid) -> Result<bool, ServerError> {
        let removed = self
            .state
            .mutes
            .unmute(player_id)
            .await
            .map_err(ServerError::MuteStorage)?;
        if removed.is_some() {
            info!(player = %player_id, "player unmuted");
            push_mute_state(&self.state, player_id, None);
        }
        Ok(removed.is_some())
    }

    /// Returns whether the player had a session. The session is gone from
    /// both lookups when this returns.
    pub fn disconnect(&self, player_id: &Uuid, reason: &str) -> bool {
        match self.state.sessions.get(player_id) {
            Some(session) => {
                tcp::disconnect(&self.state, &session, reason);
                true
            }
            None => false,
        }
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        *lock(&self.tcp_addr)
    }

    pub async fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.lock().await.as_ref().and_then(UdpServer::local_addr)
    }
}

fn push_mute_state(state: &ServerState, player_id: &Uuid, mute: Option<&ServerMute>) {
    let Some(session) = state.sessions.get(player_id) else {
        return;
    };
    let packet = ClientboundPacket::MuteState(MuteState {
        mute: mute.map(ServerMute::to_info),
    });
    if let Err(e) = session.try_send(&packet) {
        warn!(player = %player_id, "failed to push mute state: {}", e);
    }
}

/// Idle timeouts and UDP pings every second, mute expiry every five.
async fn maintenance_loop(state: Arc<ServerState>) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    let mut mute_interval = tokio::time::interval(MUTE_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                let Some(snapshot) = state.snapshot() else {
                    continue;
                };
                let timeout = Duration::from_millis(u64::from(snapshot.config.voice.keep_alive_timeout_ms));
                for session in state.sessions.idle(timeout, Instant::now()) {
                    info!(player = %session.player_id, "session timed out");
                    tcp::disconnect(&state, &session, "timed out");
                }
                udp::ping_all(&state).await;
            }
            _ = mute_interval.tick() => {
                for player_id in state.mutes.expire(now_ms()).await {
                    info!(player = %player_id, "mute expired");
                    push_mute_state(&state, &player_id, None);
                }
            }
        }
    }
}
