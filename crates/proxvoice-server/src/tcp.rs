use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::BytesMut;
use proxvoice_protocol::codec::try_decode_frame;
use proxvoice_protocol::tcp::{
    ClientboundPacket, ConnectionRejected, Disconnected, PlayerHandshake, Pong, ServerboundPacket,
};
use proxvoice_protocol::types::{RejectReason, PROTOCOL_VERSION};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::error::ServerError;
use crate::routing;
use crate::session::Session;
use crate::state::ServerState;

/// How long a new connection has to complete its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames processed per read before yielding.
const MAX_MSGS_PER_READ: u32 = 20;

/// How long the writer may take to flush after the session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Accept control connections until the task is aborted.
pub async fn accept_loop(listener: TcpListener, tls: Option<TlsAcceptor>, state: Arc<ServerState>) {
    loop {
        let (tcp_stream, peer_addr) = match listener.accept().await {
            Ok(result) => result,
            Err(e) => {
                error!("TCP accept error: {}", e);
                continue;
            }
        };
        if let Err(e) = tcp_stream.set_nodelay(true) {
            debug!(peer = %peer_addr, "failed to set TCP_NODELAY: {}", e);
        }

        let tls = tls.clone();
        let state = state.clone();
        tokio::spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(tcp_stream).await {
                    Ok(tls_stream) => handle_connection(tls_stream, peer_addr, state).await,
                    Err(e) => warn!(peer = %peer_addr, "TLS handshake failed: {}", e),
                },
                None => handle_connection(tcp_stream, peer_addr, state).await,
            }
        });
    }
}

/// Handle a single control connection, plaintext or TLS.
pub async fn handle_connection<S>(mut stream: S, peer_addr: SocketAddr, state: Arc<ServerState>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!(peer = %peer_addr, "new TCP connection");

    // --- Handshake phase (with timeout) ---
    let mut buf = BytesMut::with_capacity(4096);
    let handshake = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut stream, &mut buf)).await {
        Ok(Ok(Some(handshake))) => handshake,
        Ok(Ok(None)) => {
            reject(&mut stream, RejectReason::Malformed, "expected a handshake".into()).await;
            return;
        }
        Ok(Err(e)) => {
            warn!(peer = %peer_addr, "handshake failed: {:#}", e);
            return;
        }
        Err(_) => {
            warn!(peer = %peer_addr, "handshake timed out");
            return;
        }
    };

    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
    let session = match accept(&state, &handshake, tx) {
        Ok(session) => session,
        Err((reason, message)) => {
            info!(peer = %peer_addr, player = %handshake.player_id, ?reason, "connection rejected: {}", message);
            reject(&mut stream, reason, message).await;
            return;
        }
    };

    info!(
        peer = %peer_addr,
        player = %session.player_id,
        name = %session.name,
        "player connected"
    );

    // --- Split into reader/writer ---
    let (read_half, write_half) = tokio::io::split(stream);
    let writer_handle = tokio::spawn(write_loop(write_half, rx));

    if let Some(snapshot) = state.snapshot() {
        let info = state.server_info(&session, &snapshot);
        if let Err(e) = session.send(&ClientboundPacket::ServerInfo(info)).await {
            warn!(player = %session.player_id, "failed to queue server info: {}", e);
        }
    }

    // --- Message loop ---
    tokio::select! {
        reason = read_loop(read_half, buf, &state, &session) => {
            info!(player = %session.player_id, "player disconnected: {}", reason);
        }
        _ = session.closed() => {
            info!(player = %session.player_id, "session closed by server");
        }
    }

    // --- Cleanup ---
    state.sessions.remove_if_same(&session);
    let player_id = session.player_id;
    drop(session);
    let abort = writer_handle.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_handle).await.is_err() {
        abort.abort();
    }
    debug!(player = %player_id, "connection cleaned up");
}

/// Deregister the session, queue `Disconnected` and close the connection.
///
/// Once this returns, neither index finds the session, so its UDP traffic
/// falls to the unknown-session path.
pub fn disconnect(state: &ServerState, session: &Arc<Session>, reason: &str) {
    state.sessions.remove_if_same(session);
    let packet = ClientboundPacket::Disconnected(Disconnected {
        reason: reason.to_string(),
    });
    if let Err(e) = session.try_send(&packet) {
        debug!(player = %session.player_id, "failed to queue disconnect: {}", e);
    }
    session.close();
}

async fn write_loop<W: AsyncWrite + Unpin>(mut write_half: W, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = write_half.write_all(&data).await {
            debug!("TCP write error: {}", e);
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Read frames until a complete packet arrives. `None` when the first
/// packet is not a handshake.
async fn read_handshake<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut BytesMut) -> Result<Option<PlayerHandshake>> {
    loop {
        if let Some(payload) = try_decode_frame(buf)? {
            return match ServerboundPacket::decode(&payload) {
                Ok(ServerboundPacket::PlayerHandshake(handshake)) => Ok(Some(handshake)),
                Ok(other) => {
                    debug!(opcode = other.opcode(), "expected a handshake");
                    Ok(None)
                }
                Err(e) => {
                    debug!("undecodable handshake: {}", e);
                    Ok(None)
                }
            };
        }
        if stream.read_buf(buf).await? == 0 {
            anyhow::bail!("connection closed during handshake");
        }
    }
}

async fn reject<S: AsyncWrite + Unpin>(stream: &mut S, reason: RejectReason, message: String) {
    let packet = ClientboundPacket::ConnectionRejected(ConnectionRejected { reason, message });
    let Ok(frame) = packet.to_frame() else {
        return;
    };
    if stream.write_all(&frame).await.is_ok() {
        let _ = stream.shutdown().await;
    }
}

/// Validate a handshake and register the session.
fn accept(
    state: &ServerState,
    handshake: &PlayerHandshake,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<Arc<Session>, (RejectReason, String)> {
    let Some(snapshot) = state.snapshot() else {
        return Err((RejectReason::NotReady, "voice server is starting".into()));
    };

    if handshake.protocol_version != PROTOCOL_VERSION {
        return Err((
            RejectReason::VersionMismatch,
            format!(
                "protocol version mismatch: client={}, server={}",
                handshake.protocol_version, PROTOCOL_VERSION
            ),
        ));
    }

    if !forwarding_secret_matches(snapshot.forwarding_secret.as_ref(), handshake.forwarding_secret.as_ref()) {
        return Err((RejectReason::ForwardingSecret, "forwarding secret mismatch".into()));
    }

    let Some(player) = state.players.by_id(&handshake.player_id) else {
        return Err((RejectReason::UnknownPlayer, "player is not on the game server".into()));
    };

    if state.sessions.len() >= snapshot.config.tcp.max_players as usize {
        return Err((RejectReason::ServerFull, "server is full".into()));
    }

    let name = match handshake.player_name.trim() {
        "" => player.name,
        name => name.to_string(),
    };

    state
        .sessions
        .create(handshake.player_id, name, handshake.capabilities, tx, |secret| {
            ServerState::session_crypto(&snapshot, secret)
        })
        .map_err(|e| match e {
            ServerError::DuplicateSession(_) => {
                (RejectReason::DuplicateConnection, "already connected".into())
            }
            other => {
                error!(player = %handshake.player_id, "failed to create session: {}", other);
                (RejectReason::NotReady, "failed to create session".into())
            }
        })
}

/// A configured secret must be presented, and a presented secret must be
/// configured.
fn forwarding_secret_matches(configured: Option<&uuid::Uuid>, presented: Option<&uuid::Uuid>) -> bool {
    match (configured, presented) {
        (None, None) => true,
        (Some(expected), Some(given)) => bool::from(expected.as_bytes().ct_eq(given.as_bytes())),
        _ => false,
    }
}

/// Runs until the peer goes away. Returns why.
async fn read_loop<R: AsyncRead + Unpin>(
    mut read_half: R,
    mut buf: BytesMut,
    state: &ServerState,
    session: &Arc<Session>,
) -> String {
    // Frames that arrived together with the handshake.
    if let ControlFlow::Break(reason) = drain_frames(&mut buf, state, session).await {
        return reason;
    }
    loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => return "EOF".into(),
            Ok(_) => {}
            Err(e) => return format!("read error: {e}"),
        }
        if let ControlFlow::Break(reason) = drain_frames(&mut buf, state, session).await {
            return reason;
        }
    }
}

async fn drain_frames(buf: &mut BytesMut, state: &ServerState, session: &Arc<Session>) -> ControlFlow<String> {
    // Process complete messages (max 20 per batch to prevent burst DoS)
    let mut msgs_this_read = 0u32;
    loop {
        if msgs_this_read >= MAX_MSGS_PER_READ {
            tokio::task::yield_now().await;
            msgs_this_read = 0;
        }
        match try_decode_frame(buf) {
            Ok(Some(payload)) => {
                msgs_this_read += 1;
                match ServerboundPacket::decode(&payload) {
                    Ok(packet) => {
                        if let ControlFlow::Break(reason) = handle_message(packet, state, session).await {
                            return ControlFlow::Break(reason);
                        }
                    }
                    Err(e) => warn!(player = %session.player_id, "failed to decode control message: {}", e),
                }
            }
            Ok(None) => return ControlFlow::Continue(()),
            Err(e) => return ControlFlow::Break(format!("frame error: {e}")),
        }
    }
}

/// Handle a control message on an established session.
async fn handle_message(packet: ServerboundPacket, state: &ServerState, session: &Arc<Session>) -> ControlFlow<String> {
    session.touch();
    if matches!(packet, ServerboundPacket::Disconnect(_)) {
        return ControlFlow::Break("client sent disconnect".into());
    }
    if !session.allow_control_message() {
        debug!(player = %session.player_id, opcode = packet.opcode(), "control message rate limited");
        return ControlFlow::Continue(());
    }

    let result = match packet {
        ServerboundPacket::PlayerInfo(info) => {
            if info.protocol_version != PROTOCOL_VERSION {
                disconnect(state, session, "protocol version changed");
                return ControlFlow::Break("protocol version mismatch".into());
            }
            session.set_capabilities(info.capabilities);
            refresh_session(state, session).await
        }
        ServerboundPacket::PlayerAudioEnd(end) => {
            if let Some(snapshot) = state.snapshot() {
                routing::route_audio_end(state, &snapshot, session, end);
            }
            Ok(())
        }
        ServerboundPacket::Ping(ping) => {
            session
                .send(&ClientboundPacket::Pong(Pong {
                    timestamp: ping.timestamp,
                }))
                .await
        }
        ServerboundPacket::LineSubscription(sub) => {
            session.subscribe(&sub.line, sub.subscribed);
            Ok(())
        }
        ServerboundPacket::PlayerHandshake(_) => {
            debug!(player = %session.player_id, "ignoring repeated handshake");
            Ok(())
        }
        ServerboundPacket::Disconnect(_) => Ok(()),
    };
    if let Err(e) = result {
        warn!(player = %session.player_id, "error handling message: {}", e);
    }
    ControlFlow::Continue(())
}

/// Re-derive the session cipher from the current config and resend
/// `ServerInfo`.
pub async fn refresh_session(state: &ServerState, session: &Session) -> Result<(), ServerError> {
    let snapshot = state.snapshot().ok_or(ServerError::NotReady)?;
    session.set_crypto(ServerState::session_crypto(&snapshot, &session.secret)?);
    let info = state.server_info(session, &snapshot);
    session.send(&ClientboundPacket::ServerInfo(info)).await
}
