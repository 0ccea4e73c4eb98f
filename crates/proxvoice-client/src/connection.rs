use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use proxvoice_audio::codec::{create_decoder, create_encoder, CodecKind};
use proxvoice_audio::source::DecoderFactory;
use proxvoice_audio::vad::VoiceActivityDetector;
use proxvoice_audio::{ActivationEngine, ActivationOverride, CapturePipeline, KeyState, Outgoing, SourceStreams, StreamStats};
use proxvoice_crypto::Encryption;
use proxvoice_protocol::activation::ActivationSet;
use proxvoice_protocol::codec::try_decode_frame;
use proxvoice_protocol::tcp::{
    ClientboundPacket, Disconnect, LineSubscription, Ping, PlayerHandshake, PlayerInfo, ServerInfo,
    ServerboundPacket,
};
use proxvoice_protocol::types::{CaptureInfo, MuteInfo, PROTOCOL_VERSION};
use proxvoice_protocol::udp::{build_datagram, split_datagram, Pong, UdpPacket, MAX_DATAGRAM_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::ClientError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(1);
const EXPIRE_INTERVAL: Duration = Duration::from_millis(100);
const EVENT_QUEUE: usize = 256;

/// How the control connection is secured.
#[derive(Clone)]
pub enum TlsMode {
    Plain,
    /// Verify against the bundled web PKI roots.
    WebPki,
    Custom(Arc<rustls::ClientConfig>),
}

#[derive(Clone)]
pub struct ConnectOptions {
    /// `host:port` of the TCP control channel.
    pub address: String,
    pub player_id: Uuid,
    pub player_name: String,
    pub capabilities: u32,
    pub forwarding_secret: Option<Uuid>,
    pub tls: TlsMode,
    pub codec: CodecKind,
}

impl ConnectOptions {
    pub fn new(address: impl Into<String>, player_id: Uuid, player_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            player_id,
            player_name: player_name.into(),
            capabilities: 0,
            forwarding_secret: None,
            tls: TlsMode::Plain,
            codec: CodecKind::preferred(),
        }
    }
}

/// What the connection reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A decoded frame from another player.
    Audio {
        source_id: Uuid,
        line: String,
        distance: u16,
        sequence: u64,
        pcm: Vec<f32>,
    },
    /// A source stopped talking on a line.
    SourceEnded { source_id: Uuid, line: String },
    /// Fresh session parameters after a player info request.
    ServerInfo(Box<ServerInfo>),
    ActivationsUpdated,
    /// `None` when the server lifted the mute.
    MuteChanged(Option<MuteInfo>),
    Disconnected { reason: String },
}

trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ControlStream for T {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
}

fn write<T>(lock: &RwLock<T>, value: T) {
    *lock.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// State shared between the client handle and its tasks.
struct Inner {
    host: String,
    codec: CodecKind,
    capabilities: u32,
    info: RwLock<ServerInfo>,
    cipher: RwLock<Arc<dyn Encryption>>,
    udp_socket: Arc<UdpSocket>,
    udp_target: RwLock<SocketAddr>,
    tcp_tx: mpsc::Sender<Vec<u8>>,
    events: mpsc::Sender<ClientEvent>,
    capture: Mutex<CapturePipeline>,
    streams: Mutex<SourceStreams>,
    local_muted: AtomicBool,
    server_muted: AtomicBool,
    rtt_ms: AtomicU64,
}

impl Inner {
    async fn send_tcp(&self, packet: ServerboundPacket) -> Result<(), ClientError> {
        let frame = packet.to_frame()?;
        self.tcp_tx.send(frame).await.map_err(|_| ClientError::ConnectionClosed)
    }

    async fn send_udp(&self, packet: &UdpPacket) -> Result<(), ClientError> {
        let secret = self.info.read().unwrap_or_else(|p| p.into_inner()).secret;
        let encrypted = read(&self.cipher).encrypt(&packet.encode())?;
        let target = read(&self.udp_target);
        self.udp_socket.send_to(&build_datagram(&secret, &encrypted), target).await?;
        Ok(())
    }

    /// Send what the capture pipeline produced. Returns how many packets.
    async fn dispatch(&self, outgoing: Vec<Outgoing>) -> Result<usize, ClientError> {
        let count = outgoing.len();
        for item in outgoing {
            match item {
                Outgoing::Audio(audio) => self.send_udp(&UdpPacket::PlayerAudio(audio)).await?,
                Outgoing::End(end) => self.send_tcp(end.into()).await?,
            }
        }
        Ok(count)
    }

    async fn capture_frame(&self, pcm: &[f32]) -> Result<usize, ClientError> {
        let outgoing = lock(&self.capture).process(pcm)?;
        self.dispatch(outgoing).await
    }

    fn apply_mute(&self) -> Result<Vec<Outgoing>, ClientError> {
        let muted = self.local_muted.load(Ordering::Relaxed) || self.server_muted.load(Ordering::Relaxed);
        let mut capture = lock(&self.capture);
        capture.engine_mut().set_muted(muted);
        if muted {
            Ok(capture.end_all()?)
        } else {
            Ok(Vec::new())
        }
    }

    async fn set_activations(&self, set: &ActivationSet) -> Result<(), ClientError> {
        let ended = {
            let mut capture = lock(&self.capture);
            let decisions = capture.engine_mut().set_activations(set)?;
            capture.ended(&decisions)
        };
        self.dispatch(ended).await?;
        Ok(())
    }

    /// Adopt a refreshed `ServerInfo`: cipher, codec, activations, mute and
    /// UDP target may all have changed.
    async fn apply_server_info(&self, info: ServerInfo) -> Result<(), ClientError> {
        write(
            &self.cipher,
            proxvoice_crypto::create(&info.encryption.algorithm, &info.encryption.key)?,
        );

        let previous = read(&self.info);
        if previous.capture != info.capture {
            info!(sample_rate = info.capture.sample_rate, "capture parameters changed");
            lock(&self.capture).set_encoder(create_encoder(self.codec, &info.capture)?);
            lock(&self.streams).set_factory(decoder_factory(self.codec, info.capture.clone()));
        }
        if previous.udp_host != info.udp_host || previous.udp_port != info.udp_port {
            let target = resolve_udp(&self.host, &info).await?;
            info!(%target, "UDP target changed");
            write(&self.udp_target, target);
        }

        let set = ActivationSet::new(info.activations.clone(), info.source_lines.clone())?;
        self.set_activations(&set).await?;

        self.server_muted.store(info.mute.is_some(), Ordering::Relaxed);
        let ended = self.apply_mute()?;
        self.dispatch(ended).await?;

        write(&self.info, info.clone());
        let _ = self.events.send(ClientEvent::ServerInfo(Box::new(info))).await;
        Ok(())
    }

    /// Returns `false` once the server has said goodbye.
    async fn handle_server_message(&self, packet: ClientboundPacket) -> bool {
        let result = match packet {
            ClientboundPacket::ServerInfo(info) => self.apply_server_info(info).await,
            ClientboundPacket::ActivationsUpdate(update) => {
                match ActivationSet::new(update.activations, update.source_lines) {
                    Ok(set) => {
                        let result = self.set_activations(&set).await;
                        let _ = self.events.send(ClientEvent::ActivationsUpdated).await;
                        result
                    }
                    Err(e) => Err(e.into()),
                }
            }
            ClientboundPacket::PlayerInfoRequest(_) => {
                self.send_tcp(
                    PlayerInfo {
                        protocol_version: PROTOCOL_VERSION,
                        capabilities: self.capabilities,
                    }
                    .into(),
                )
                .await
            }
            ClientboundPacket::MuteState(state) => {
                self.server_muted.store(state.mute.is_some(), Ordering::Relaxed);
                let result = match self.apply_mute() {
                    Ok(ended) => self.dispatch(ended).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                let _ = self.events.send(ClientEvent::MuteChanged(state.mute)).await;
                result
            }
            ClientboundPacket::SourceAudioEnd(end) => {
                let ended = lock(&self.streams).end(&end);
                match ended {
                    Ok(true) => {
                        let _ = self
                            .events
                            .send(ClientEvent::SourceEnded {
                                source_id: end.source_id,
                                line: end.line,
                            })
                            .await;
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            ClientboundPacket::Pong(pong) => {
                self.rtt_ms.store(now_ms().saturating_sub(pong.timestamp), Ordering::Relaxed);
                Ok(())
            }
            ClientboundPacket::Disconnected(disconnected) => {
                info!(reason = %disconnected.reason, "disconnected by server");
                let _ = self
                    .events
                    .send(ClientEvent::Disconnected {
                        reason: disconnected.reason,
                    })
                    .await;
                return false;
            }
            ClientboundPacket::ConnectionRejected(rejected) => {
                warn!(reason = ?rejected.reason, "unexpected rejection on an established session");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("error handling server message: {}", e);
        }
        true
    }

    fn handle_datagram(&self, datagram: &[u8]) -> Option<UdpPacket> {
        let (secret, payload) = split_datagram(datagram).ok()?;
        if secret != self.info.read().unwrap_or_else(|p| p.into_inner()).secret {
            trace!("datagram for another session");
            return None;
        }
        let plaintext = match read(&self.cipher).decrypt(payload) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!("failed to decrypt datagram: {}", e);
                return None;
            }
        };
        match UdpPacket::decode(&plaintext) {
            Ok(packet) => Some(packet),
            Err(e) => {
                debug!("invalid UDP packet: {}", e);
                None
            }
        }
    }
}

/// A connected voice client.
///
/// Dropping it tears the connection down without notifying the server; use
/// [`VoiceClient::disconnect`] for a clean exit.
pub struct VoiceClient {
    inner: Arc<Inner>,
    keys: Arc<KeyState>,
    tasks: Vec<JoinHandle<()>>,
}

impl VoiceClient {
    /// Connect, handshake and open the UDP session.
    pub async fn connect(
        options: ConnectOptions,
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), ClientError> {
        let (host, port) = parse_address(&options.address)?;

        let tcp_stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|source| ClientError::Connect {
                addr: options.address.clone(),
                source,
            })?;
        if let Err(e) = tcp_stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY: {}", e);
        }
        info!("TCP connected to {}", options.address);

        let mut stream: Box<dyn ControlStream> = match &options.tls {
            TlsMode::Plain => Box::new(tcp_stream),
            TlsMode::WebPki => {
                let mut root_store = rustls::RootCertStore::empty();
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                let config = rustls::ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth();
                Box::new(tls_connect(Arc::new(config), &host, tcp_stream).await?)
            }
            TlsMode::Custom(config) => Box::new(tls_connect(config.clone(), &host, tcp_stream).await?),
        };

        let handshake = PlayerHandshake {
            protocol_version: PROTOCOL_VERSION,
            player_id: options.player_id,
            player_name: options.player_name.clone(),
            capabilities: options.capabilities,
            forwarding_secret: options.forwarding_secret,
        };
        stream
            .write_all(&ServerboundPacket::PlayerHandshake(handshake).to_frame()?)
            .await?;

        let mut buf = BytesMut::with_capacity(4096);
        let info = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_server_info(&mut stream, &mut buf))
            .await
            .map_err(|_| ClientError::HandshakeTimeout)??;
        info!(
            player = %info.player_id,
            udp_port = info.udp_port,
            activations = info.activations.len(),
            "handshake complete"
        );

        let cipher = proxvoice_crypto::create(&info.encryption.algorithm, &info.encryption.key)?;
        let udp_target = resolve_udp(&host, &info).await?;
        let udp_socket = Arc::new(bind_udp(udp_target)?);
        info!("UDP target resolved to {}", udp_target);

        let keys = Arc::new(KeyState::default());
        let set = ActivationSet::new(info.activations.clone(), info.source_lines.clone())?;
        let frame_ms = info.capture.frame_size.saturating_mul(1000).checked_div(info.capture.sample_rate).unwrap_or(20);
        let vad = VoiceActivityDetector::new(config.vad_threshold_db, config.vad_hold_ms, frame_ms);
        let mut engine = ActivationEngine::new(&set, config.activations.clone(), keys.clone(), vad)?;
        engine.set_muted(config.muted || info.mute.is_some());
        let capture = CapturePipeline::new(engine, create_encoder(options.codec, &info.capture)?);
        let streams = SourceStreams::new(decoder_factory(options.codec, info.capture.clone()));

        let (read_half, write_half) = tokio::io::split(stream);
        let (tcp_tx, tcp_rx) = mpsc::channel::<Vec<u8>>(64);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

        let inner = Arc::new(Inner {
            host,
            codec: options.codec,
            capabilities: options.capabilities,
            server_muted: AtomicBool::new(info.mute.is_some()),
            info: RwLock::new(info),
            cipher: RwLock::new(cipher),
            udp_socket: udp_socket.clone(),
            udp_target: RwLock::new(udp_target),
            tcp_tx,
            events: events_tx,
            capture: Mutex::new(capture),
            streams: Mutex::new(streams),
            local_muted: AtomicBool::new(config.muted),
            rtt_ms: AtomicU64::new(0),
        });

        // Send an initial UDP ping so the server learns our UDP address
        if let Err(e) = inner.send_udp(&UdpPacket::Ping(Ping { timestamp: now_ms() })).await {
            error!("UDP ping send failed: {}", e);
        }

        let tasks = vec![
            tokio::spawn(tcp_writer_task(write_half, tcp_rx)),
            tokio::spawn(tcp_reader_task(read_half, buf, inner.clone())),
            tokio::spawn(udp_receiver_task(udp_socket, inner.clone())),
            tokio::spawn(ping_task(inner.clone())),
        ];

        Ok((Self { inner, keys, tasks }, events_rx))
    }

    pub fn server_info(&self) -> ServerInfo {
        read(&self.inner.info)
    }

    /// Push-to-talk key state; press and release keys here.
    pub fn keys(&self) -> &Arc<KeyState> {
        &self.keys
    }

    /// Last measured control channel round trip.
    pub fn rtt_ms(&self) -> u64 {
        self.inner.rtt_ms.load(Ordering::Relaxed)
    }

    /// Samples per captured frame.
    pub fn frame_size(&self) -> usize {
        lock(&self.inner.capture).frame_size()
    }

    /// Feed one captured frame. Returns how many packets went out.
    pub async fn capture_frame(&self, pcm: &[f32]) -> Result<usize, ClientError> {
        self.inner.capture_frame(pcm).await
    }

    /// Feed frames from `frames` until the sender is dropped.
    pub fn spawn_capture(&self, mut frames: mpsc::Receiver<Vec<f32>>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            info!("capture task started");
            while let Some(frame) = frames.recv().await {
                if let Err(e) = inner.capture_frame(&frame).await {
                    match e {
                        ClientError::ConnectionClosed => break,
                        e => warn!("capture frame dropped: {}", e),
                    }
                }
            }
            let ended = lock(&inner.capture).end_all();
            match ended {
                Ok(ended) => {
                    if let Err(e) = inner.dispatch(ended).await {
                        debug!("failed to end bursts: {}", e);
                    }
                }
                Err(e) => warn!("failed to reset encoder: {}", e),
            }
            info!("capture task ended");
        })
    }

    pub fn set_override(&self, activation: &str, value: ActivationOverride) -> Result<(), ClientError> {
        lock(&self.inner.capture).engine_mut().set_override(activation, value)?;
        Ok(())
    }

    pub fn set_vad_threshold_db(&self, db: f32) {
        lock(&self.inner.capture).engine_mut().vad_mut().set_threshold_db(db);
    }

    /// Level of the last captured frame in dBFS.
    pub fn level_db(&self) -> f32 {
        lock(&self.inner.capture).engine().level_db()
    }

    /// Local microphone mute. Running bursts end immediately.
    pub async fn set_muted(&self, muted: bool) -> Result<(), ClientError> {
        self.inner.local_muted.store(muted, Ordering::Relaxed);
        let ended = self.inner.apply_mute()?;
        self.inner.dispatch(ended).await?;
        Ok(())
    }

    pub fn is_server_muted(&self) -> bool {
        self.inner.server_muted.load(Ordering::Relaxed)
    }

    pub async fn subscribe(&self, line: &str, subscribed: bool) -> Result<(), ClientError> {
        self.inner
            .send_tcp(
                LineSubscription {
                    line: line.to_string(),
                    subscribed,
                }
                .into(),
            )
            .await
    }

    pub fn stream_stats(&self, source_id: &Uuid, line: &str) -> Option<StreamStats> {
        lock(&self.inner.streams).stats(source_id, line)
    }

    /// End running bursts, tell the server and close.
    pub async fn disconnect(mut self) {
        let ended = lock(&self.inner.capture).end_all();
        match ended {
            Ok(ended) => {
                if let Err(e) = self.inner.dispatch(ended).await {
                    debug!("failed to end bursts: {}", e);
                }
            }
            Err(e) => warn!("failed to reset encoder: {}", e),
        }
        let _ = self.inner.send_tcp(Disconnect.into()).await;
        // Let the writer flush before the tasks go away.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("disconnected");
    }
}

impl Drop for VoiceClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn tls_connect(
    config: Arc<rustls::ClientConfig>,
    host: &str,
    tcp_stream: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ClientError> {
    let connector = TlsConnector::from(config);
    let server_name = if let Ok(ip) = host.parse::<IpAddr>() {
        rustls::pki_types::ServerName::IpAddress(ip.into())
    } else {
        rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| ClientError::ServerName(format!("{host}: {e}")))?
    };
    let stream = connector.connect(server_name, tcp_stream).await.map_err(ClientError::Tls)?;
    info!("TLS handshake complete");
    Ok(stream)
}

async fn read_server_info<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut BytesMut) -> Result<ServerInfo, ClientError> {
    loop {
        if let Some(payload) = try_decode_frame(buf)? {
            return match ClientboundPacket::decode(&payload)? {
                ClientboundPacket::ServerInfo(info) => Ok(info),
                ClientboundPacket::ConnectionRejected(rejected) => Err(ClientError::Rejected {
                    reason: rejected.reason,
                    message: rejected.message,
                }),
                other => Err(ClientError::UnexpectedPacket(other.opcode())),
            };
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(ClientError::ConnectionClosed);
        }
    }
}

fn decoder_factory(codec: CodecKind, capture: CaptureInfo) -> DecoderFactory {
    Box::new(move || create_decoder(codec, &capture))
}

/// The server's UDP endpoint; an empty host means the control host.
async fn resolve_udp(control_host: &str, info: &ServerInfo) -> Result<SocketAddr, ClientError> {
    let host = if info.udp_host.is_empty() {
        control_host
    } else {
        info.udp_host.as_str()
    };
    let target = tokio::net::lookup_host((host, info.udp_port))
        .await?
        .next()
        .ok_or_else(|| ClientError::InvalidAddress(format!("{host}:{}", info.udp_port)))?;
    Ok(target)
}

fn bind_udp(target: SocketAddr) -> Result<UdpSocket, ClientError> {
    let sock = socket2::Socket::new(
        socket2::Domain::for_address(target),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    let _ = sock.set_recv_buffer_size(1024 * 1024);
    let local: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    sock.bind(&local.into())?;
    sock.set_nonblocking(true)?;
    let std_sock: std::net::UdpSocket = sock.into();
    Ok(UdpSocket::from_std(std_sock)?)
}

fn parse_address(address: &str) -> Result<(String, u16), ClientError> {
    let invalid = || ClientError::InvalidAddress(address.to_string());
    let (host, port_str) = if let Some(rest) = address.strip_prefix('[') {
        // IPv6: [::1]:7475
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        (host, port)
    } else {
        address.rsplit_once(':').ok_or_else(invalid)?
    };
    let port: u16 = port_str.parse().map_err(|_| invalid())?;
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// TCP writer task: sends encoded messages from the channel to the stream.
async fn tcp_writer_task<W: AsyncWrite + Unpin>(mut write_half: W, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = write_half.write_all(&data).await {
            error!("TCP write error: {}", e);
            break;
        }
    }
    debug!("TCP writer task ended");
}

/// TCP reader task: reads server messages until the link goes away.
async fn tcp_reader_task<R: AsyncRead + Unpin>(mut read_half: R, mut buf: BytesMut, inner: Arc<Inner>) {
    let reason = 'read: loop {
        loop {
            match try_decode_frame(&mut buf) {
                Ok(Some(payload)) => match ClientboundPacket::decode(&payload) {
                    Ok(packet) => {
                        if !inner.handle_server_message(packet).await {
                            return;
                        }
                    }
                    Err(e) => warn!("failed to decode server message: {}", e),
                },
                Ok(None) => break,
                Err(e) => break 'read format!("frame error: {e}"),
            }
        }
        match read_half.read_buf(&mut buf).await {
            Ok(0) => break "server closed connection".to_string(),
            Ok(_) => {}
            Err(e) => break format!("read error: {e}"),
        }
    };
    info!(%reason, "connection lost");
    let _ = inner.events.send(ClientEvent::Disconnected { reason }).await;
}

/// UDP receiver task: decrypts, decodes and reports source audio.
async fn udp_receiver_task(socket: Arc<UdpSocket>, inner: Arc<Inner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut expire = tokio::time::interval(EXPIRE_INTERVAL);
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let len = match received {
                    Ok((len, _)) => len,
                    Err(e) => {
                        debug!("UDP recv error: {}", e);
                        continue;
                    }
                };
                let Some(packet) = inner.handle_datagram(&buf[..len]) else {
                    continue;
                };
                handle_udp_packet(&inner, packet).await;
            }
            _ = expire.tick() => {
                let closed = lock(&inner.streams).expire(Instant::now());
                for (source_id, line) in closed {
                    let _ = inner.events.send(ClientEvent::SourceEnded { source_id, line }).await;
                }
            }
        }
    }
}

async fn handle_udp_packet(inner: &Inner, packet: UdpPacket) {
    match packet {
        UdpPacket::SourceAudio(audio) => {
            let decoded = lock(&inner.streams).push(&audio, Instant::now());
            match decoded {
                Ok(pcm) => {
                    let event = ClientEvent::Audio {
                        source_id: audio.source_id,
                        line: audio.line,
                        distance: audio.distance,
                        sequence: audio.sequence,
                        pcm,
                    };
                    if inner.events.try_send(event).is_err() {
                        trace!("event queue full, dropping audio frame");
                    }
                }
                Err(e) => debug!(source = %audio.source_id, "failed to decode frame: {}", e),
            }
        }
        UdpPacket::Ping(ping) => {
            if let Err(e) = inner
                .send_udp(&UdpPacket::Pong(Pong {
                    timestamp: ping.timestamp,
                }))
                .await
            {
                debug!("UDP pong send failed: {}", e);
            }
        }
        UdpPacket::Pong(_) => {}
        UdpPacket::PlayerAudio(_) => debug!("server sent a serverbound packet, ignoring"),
    }
}

/// Keeps both channels alive: TCP ping for RTT, UDP ping for the NAT mapping.
async fn ping_task(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    loop {
        interval.tick().await;
        let timestamp = now_ms();
        if inner.send_tcp(Ping { timestamp }.into()).await.is_err() {
            return;
        }
        if let Err(e) = inner.send_udp(&UdpPacket::Ping(Ping { timestamp })).await {
            debug!("UDP ping send failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses() {
        assert_eq!(parse_address("127.0.0.1:7475").unwrap(), ("127.0.0.1".into(), 7475));
        assert_eq!(parse_address("[::1]:7475").unwrap(), ("::1".into(), 7475));
        assert_eq!(parse_address("voice.example.com:1").unwrap(), ("voice.example.com".into(), 1));
        assert!(parse_address("no-port").is_err());
        assert!(parse_address(":7475").is_err());
        assert!(parse_address("host:99999").is_err());
    }
}
