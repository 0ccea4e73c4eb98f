use std::net::SocketAddr;
use std::sync::Arc;

use proxvoice_protocol::udp::{split_datagram, Ping, Pong, UdpPacket, MAX_DATAGRAM_SIZE};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::ServerError;
use crate::mute::now_ms;
use crate::routing;
use crate::state::{ServerState, UdpStats};

/// Socket buffer size, sized to absorb bursts from many speakers.
pub const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// The UDP voice endpoint. Hooks may replace it before it starts.
pub struct UdpServer {
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl Default for UdpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpServer {
    pub fn new() -> Self {
        Self {
            local_addr: None,
            task: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Bind `addr` and start receiving. Returns the bound address.
    pub async fn start(&mut self, state: Arc<ServerState>, addr: SocketAddr) -> Result<SocketAddr, ServerError> {
        let socket = Arc::new(self.bind_socket(addr)?);
        let local_addr = socket.local_addr().map_err(|source| ServerError::Bind {
            what: "UDP",
            addr: addr.to_string(),
            source,
        })?;
        state.set_udp_socket(Some(socket.clone()));
        self.local_addr = Some(local_addr);
        self.task = Some(tokio::spawn(run_udp_loop(socket, state)));
        info!(%local_addr, "UDP voice server started");
        Ok(local_addr)
    }

    pub fn stop(&mut self, state: &ServerState) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        state.set_udp_socket(None);
        if let Some(addr) = self.local_addr.take() {
            info!(%addr, "UDP voice server stopped");
        }
    }

    fn bind_socket(&self, addr: SocketAddr) -> Result<UdpSocket, ServerError> {
        let bind_err = |source| ServerError::Bind {
            what: "UDP",
            addr: addr.to_string(),
            source,
        };
        let sock = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .map_err(bind_err)?;
        if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
            warn!("failed to set UDP receive buffer: {}", e);
        }
        if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
            warn!("failed to set UDP send buffer: {}", e);
        }
        sock.bind(&addr.into()).map_err(bind_err)?;
        sock.set_nonblocking(true).map_err(bind_err)?;
        let std_sock: std::net::UdpSocket = sock.into();
        UdpSocket::from_std(std_sock).map_err(bind_err)
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_udp_loop(socket: Arc<UdpSocket>, state: Arc<ServerState>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, src_addr) = match socket.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(e) => {
                // ICMP port unreachable surfaces here on some platforms.
                debug!("UDP recv error: {}", e);
                continue;
            }
        };
        handle_datagram(&state, &buf[..len], src_addr).await;
    }
}

/// Authenticate, decrypt and dispatch one datagram.
pub async fn handle_datagram(state: &ServerState, datagram: &[u8], from: SocketAddr) {
    UdpStats::incr(&state.stats.received);

    let (secret, payload) = match split_datagram(datagram) {
        Ok(parts) => parts,
        Err(e) => {
            trace!(src = %from, "malformed datagram: {}", e);
            UdpStats::incr(&state.stats.decode_failures);
            return;
        }
    };
    let Some(session) = state.sessions.get_by_secret(&secret) else {
        trace!(src = %from, "datagram for unknown session");
        UdpStats::incr(&state.stats.unknown_session);
        return;
    };
    let plaintext = match session.cipher().decrypt(payload) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            trace!(player = %session.player_id, src = %from, "failed to decrypt datagram: {}", e);
            UdpStats::incr(&state.stats.decrypt_failures);
            return;
        }
    };
    let packet = match UdpPacket::decode(&plaintext) {
        Ok(packet) => packet,
        Err(e) => {
            debug!(player = %session.player_id, "invalid UDP packet: {}", e);
            UdpStats::incr(&state.stats.decode_failures);
            return;
        }
    };

    session.touch();
    if session.set_udp_addr(from) {
        debug!(player = %session.player_id, addr = %from, "learned UDP address");
    }

    match packet {
        UdpPacket::Ping(Ping { timestamp }) => {
            state
                .send_udp(&session, &UdpPacket::Pong(Pong { timestamp }))
                .await;
        }
        UdpPacket::Pong(Pong { timestamp }) => {
            let rtt = now_ms().saturating_sub(timestamp);
            session.set_rtt_ms(rtt);
            trace!(player = %session.player_id, rtt, "UDP pong");
        }
        UdpPacket::PlayerAudio(audio) => {
            let Some(snapshot) = state.snapshot() else {
                return;
            };
            routing::route_audio(state, &snapshot, &session, audio).await;
        }
        UdpPacket::SourceAudio(_) => {
            debug!(player = %session.player_id, "client sent a clientbound packet, ignoring");
        }
    }
}

/// Ping every session that has a UDP address, for RTT and NAT keep-alive.
pub async fn ping_all(state: &ServerState) {
    let ping = UdpPacket::Ping(Ping { timestamp: now_ms() });
    for session in state.sessions.all() {
        if session.udp_addr().is_some() {
            state.send_udp(&session, &ping).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use proxvoice_protocol::udp::{build_datagram, PlayerAudio, SourceAudio};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::config::{ConfigSnapshot, ServerConfig};
    use crate::hooks::{Collaborators, MemoryLookup};
    use crate::session::Session;

    async fn setup() -> (Arc<ServerState>, UdpServer, SocketAddr) {
        let state = Arc::new(ServerState::new(&Collaborators::new(Arc::new(MemoryLookup::open()))));
        let snapshot = ConfigSnapshot::build(ServerConfig::default(), None, None, PathBuf::from(".")).unwrap();
        state.config.store(Some(Arc::new(snapshot)));
        let mut server = UdpServer::new();
        let addr = server.start(state.clone(), "127.0.0.1:0".parse().unwrap()).await.unwrap();
        (state, server, addr)
    }

    fn join(state: &ServerState, tx: mpsc::Sender<Vec<u8>>) -> Arc<Session> {
        let snapshot = state.snapshot().unwrap();
        state
            .sessions
            .create(Uuid::new_v4(), "p".into(), 0, tx, |secret| {
                ServerState::session_crypto(&snapshot, secret)
            })
            .unwrap()
    }

    fn seal(session: &Session, packet: &UdpPacket) -> Vec<u8> {
        build_datagram(&session.secret, &session.cipher().encrypt(&packet.encode()).unwrap())
    }

    async fn recv(socket: &UdpSocket, session: &Session) -> UdpPacket {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = tokio::time::timeout(std::time::Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (secret, payload) = split_datagram(&buf[..len]).unwrap();
        assert_eq!(secret, session.secret);
        UdpPacket::decode(&session.cipher().decrypt(payload).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn unknown_secret_is_dropped() {
        let (state, mut server, _) = setup().await;
        let (tx, _rx) = mpsc::channel(8);
        let existing = join(&state, tx);
        assert_eq!(state.sessions.len(), 1);

        let datagram = build_datagram(&Uuid::new_v4(), &[0u8; 32]);
        handle_datagram(&state, &datagram, "127.0.0.1:9".parse().unwrap()).await;
        let stats = state.stats.snapshot();
        assert_eq!(stats.unknown_session, 1);
        assert_eq!(stats.routed, 0);
        // No session is created or touched by a stray datagram.
        assert_eq!(state.sessions.len(), 1);
        assert!(existing.udp_addr().is_none());
        server.stop(&state);
    }

    #[tokio::test]
    async fn bad_ciphertext_does_not_learn_address() {
        let (state, mut server, _) = setup().await;
        let (tx, _rx) = mpsc::channel(8);
        let session = join(&state, tx);
        let datagram = build_datagram(&session.secret, &[7u8; 32]);
        handle_datagram(&state, &datagram, "127.0.0.1:9".parse().unwrap()).await;
        assert_eq!(state.stats.snapshot().decrypt_failures, 1);
        assert!(session.udp_addr().is_none());
        server.stop(&state);
    }

    #[tokio::test]
    async fn ping_is_answered() {
        let (state, mut server, addr) = setup().await;
        let (tx, _rx) = mpsc::channel(8);
        let session = join(&state, tx);
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&seal(&session, &UdpPacket::Ping(Ping { timestamp: 77 })), addr)
            .await
            .unwrap();
        assert_eq!(recv(&client, &session).await, UdpPacket::Pong(Pong { timestamp: 77 }));
        assert_eq!(session.udp_addr(), Some(client.local_addr().unwrap()));
        server.stop(&state);
    }

    #[tokio::test]
    async fn audio_reaches_other_players() {
        let (state, mut server, addr) = setup().await;
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, _rx_b) = mpsc::channel(8);
        let alex = join(&state, tx_a);
        let bob = join(&state, tx_b);
        let alex_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bob_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Bob announces its address first.
        bob_sock
            .send_to(&seal(&bob, &UdpPacket::Ping(Ping { timestamp: 1 })), addr)
            .await
            .unwrap();
        recv(&bob_sock, &bob).await;

        let audio = PlayerAudio {
            sequence: 5,
            activation: "proximity".into(),
            distance: 0,
            data: vec![0xAB; 40],
        };
        alex_sock
            .send_to(&seal(&alex, &UdpPacket::PlayerAudio(audio)), addr)
            .await
            .unwrap();

        let got = recv(&bob_sock, &bob).await;
        assert_eq!(
            got,
            UdpPacket::SourceAudio(SourceAudio {
                sequence: 5,
                source_id: alex.player_id,
                line: "proximity".into(),
                distance: 16,
                data: vec![0xAB; 40],
            })
        );
        server.stop(&state);
        assert!(!server.is_running());
    }
}
