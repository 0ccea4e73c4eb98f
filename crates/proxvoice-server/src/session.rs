use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use proxvoice_crypto::{Encryption, EncryptionError, SessionKey};
use proxvoice_protocol::tcp::ClientboundPacket;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::error::ServerError;

/// Simple token-bucket rate limiter.
pub struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume one token. Returns true if allowed, false if rate-limited.
    pub fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The cipher a session's UDP traffic uses, and the key it was built from.
#[derive(Clone)]
pub struct SessionCrypto {
    pub cipher: Arc<dyn Encryption>,
    pub key: SessionKey,
}

/// One connected voice client.
pub struct Session {
    pub player_id: Uuid,
    pub name: String,
    /// Selects this session in every UDP datagram.
    pub secret: Uuid,
    capabilities: AtomicU32,
    tcp_tx: mpsc::Sender<Vec<u8>>,
    crypto: RwLock<SessionCrypto>,
    udp_addr: Mutex<Option<SocketAddr>>,
    last_seen: Mutex<Instant>,
    rtt_ms: AtomicU64,
    /// Lines the client asked not to receive.
    unsubscribed: Mutex<HashSet<String>>,
    control_rate: Mutex<RateLimiter>,
    closed: Notify,
}

impl Session {
    pub fn new(
        player_id: Uuid,
        name: String,
        secret: Uuid,
        capabilities: u32,
        tcp_tx: mpsc::Sender<Vec<u8>>,
        crypto: SessionCrypto,
    ) -> Self {
        Self {
            player_id,
            name,
            secret,
            capabilities: AtomicU32::new(capabilities),
            tcp_tx,
            crypto: RwLock::new(crypto),
            udp_addr: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
            rtt_ms: AtomicU64::new(0),
            unsubscribed: Mutex::new(HashSet::new()),
            control_rate: Mutex::new(RateLimiter::new(40.0, 20.0)),
            closed: Notify::new(),
        }
    }

    /// Queue a control message for this session's writer task.
    pub async fn send(&self, packet: &ClientboundPacket) -> Result<(), ServerError> {
        let frame = packet.to_frame()?;
        self.tcp_tx.send(frame).await.map_err(|_| ServerError::ChannelClosed)
    }

    /// Queue a message from another task without waiting.
    ///
    /// A full queue means the client stopped reading: the message is dropped
    /// and the link is closed.
    pub fn try_send(&self, packet: &ClientboundPacket) -> Result<(), ServerError> {
        let frame = packet.to_frame()?;
        match self.tcp_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.close();
                Err(ServerError::ChannelFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ServerError::ChannelClosed),
        }
    }

    pub fn cipher(&self) -> Arc<dyn Encryption> {
        self.crypto.read().unwrap_or_else(|p| p.into_inner()).cipher.clone()
    }

    pub fn session_key(&self) -> SessionKey {
        self.crypto.read().unwrap_or_else(|p| p.into_inner()).key.clone()
    }

    pub fn set_crypto(&self, crypto: SessionCrypto) {
        *self.crypto.write().unwrap_or_else(|p| p.into_inner()) = crypto;
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities.load(Ordering::Relaxed)
    }

    pub fn set_capabilities(&self, capabilities: u32) {
        self.capabilities.store(capabilities, Ordering::Relaxed);
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        *lock(&self.udp_addr)
    }

    /// Returns whether the address changed.
    pub fn set_udp_addr(&self, addr: SocketAddr) -> bool {
        lock(&self.udp_addr).replace(addr) != Some(addr)
    }

    pub fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*lock(&self.last_seen))
    }

    pub fn rtt_ms(&self) -> u64 {
        self.rtt_ms.load(Ordering::Relaxed)
    }

    pub fn set_rtt_ms(&self, rtt: u64) {
        self.rtt_ms.store(rtt, Ordering::Relaxed);
    }

    /// Lines are subscribed by default.
    pub fn subscribe(&self, line: &str, subscribed: bool) {
        let mut unsubscribed = lock(&self.unsubscribed);
        if subscribed {
            unsubscribed.remove(line);
        } else {
            unsubscribed.insert(line.to_string());
        }
    }

    pub fn is_subscribed(&self, line: &str) -> bool {
        !lock(&self.unsubscribed).contains(line)
    }

    pub fn allow_control_message(&self) -> bool {
        lock(&self.control_rate).try_consume()
    }

    /// Ask the connection task to close the link.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    pub async fn closed(&self) {
        self.closed.notified().await;
    }
}

#[derive(Default)]
struct Indices {
    by_player: HashMap<Uuid, Arc<Session>>,
    by_secret: HashMap<Uuid, Arc<Session>>,
}

/// Live sessions, indexed by player and by UDP secret.
///
/// Both indices sit behind one lock, so they are updated together.
#[derive(Default)]
pub struct SessionTable {
    indices: RwLock<Indices>,
}

impl SessionTable {
    fn read(&self) -> RwLockReadGuard<'_, Indices> {
        self.indices.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indices> {
        self.indices.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a session under a fresh secret. `crypto` builds the session
    /// cipher for that secret.
    pub fn create(
        &self,
        player_id: Uuid,
        name: String,
        capabilities: u32,
        tcp_tx: mpsc::Sender<Vec<u8>>,
        crypto: impl FnOnce(&Uuid) -> Result<SessionCrypto, EncryptionError>,
    ) -> Result<Arc<Session>, ServerError> {
        let mut indices = self.write();
        if indices.by_player.contains_key(&player_id) {
            return Err(ServerError::DuplicateSession(player_id));
        }
        let mut secret = Uuid::new_v4();
        while indices.by_secret.contains_key(&secret) {
            secret = Uuid::new_v4();
        }
        let session = Arc::new(Session::new(
            player_id,
            name,
            secret,
            capabilities,
            tcp_tx,
            crypto(&secret)?,
        ));
        indices.by_player.insert(player_id, session.clone());
        indices.by_secret.insert(secret, session.clone());
        Ok(session)
    }

    pub fn get(&self, player_id: &Uuid) -> Option<Arc<Session>> {
        self.read().by_player.get(player_id).cloned()
    }

    pub fn get_by_secret(&self, secret: &Uuid) -> Option<Arc<Session>> {
        self.read().by_secret.get(secret).cloned()
    }

    pub fn remove(&self, player_id: &Uuid) -> Option<Arc<Session>> {
        let mut indices = self.write();
        let session = indices.by_player.remove(player_id)?;
        indices.by_secret.remove(&session.secret);
        Some(session)
    }

    /// Remove `session` only if it is still the registered one.
    pub fn remove_if_same(&self, session: &Arc<Session>) -> bool {
        let mut indices = self.write();
        match indices.by_player.get(&session.player_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                indices.by_player.remove(&session.player_id);
                indices.by_secret.remove(&session.secret);
                true
            }
            _ => false,
        }
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.read().by_player.values().cloned().collect()
    }

    /// Sessions that have not been heard from for `timeout`.
    pub fn idle(&self, timeout: Duration, now: Instant) -> Vec<Arc<Session>> {
        self.read()
            .by_player
            .values()
            .filter(|s| s.idle_for(now) >= timeout)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().by_player.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
