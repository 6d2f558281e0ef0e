//! The client endpoint: drives the handshake against the server's public
//!  port, then migrates to the per-session worker port and runs the encrypted
//!  transport with its tick duties (retransmission, MTU probing, time sync,
//!  keep-alive, timeout detection).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, trace, warn};

use crate::buffers::buffer_pool::PacketBufferPool;
use crate::config::ClientConfig;
use crate::crypto::envelope::SessionCrypto;
use crate::crypto::keys::KeyAgreementInitiator;
use crate::error::{ConnectError, HandshakeError};
use crate::message_dispatcher::MessageDispatcher;
use crate::send_pipeline::SealingPipeline;
use crate::time_sync::ClockSync;
use crate::transport::{elapsed_ms, ControlEvents, Transport};
use crate::wire::handshake::{peek_type, Answer, Challenge, Cookie, ErrorPacket, Hello, ANSWER_LEN, COOKIE_LEN, ERROR_LEN};
use crate::wire::{
    HandshakeType, StreamMode, CONNECT_TIMEOUT_MS, ENVELOPE_OVERHEAD, INITIAL_HELLO_POST_INTERVAL_MS, IPV4_HEADER_BYTES,
    IPV6_HEADER_BYTES, MAXIMUM_MTU, MEDIUM_MTU, MTU_PROBE_INTERVAL_MS, SILENCE_LIMIT_MS, TICK_RATE_MS,
    TIMEOUT_DISCONNECT_MS, TIME_SYNC_FAST_COUNT, TIME_SYNC_FAST_MS, TIME_SYNC_INTERVAL_MS, UDP_HEADER_BYTES,
};

/// Probe payload that would saturate the given MTU on this address family.
fn probe_payload_for_mtu(mtu: u32, ipv6: bool) -> usize {
    let ip_header = if ipv6 { IPV6_HEADER_BYTES } else { IPV4_HEADER_BYTES };
    (mtu - ip_header - UDP_HEADER_BYTES - ENVELOPE_OVERHEAD as u32) as usize
}

struct ClientShared {
    destroyed: AtomicBool,
    kill_tx: watch::Sender<bool>,
    last_recv_ms: AtomicU32,
}

impl ClientShared {
    fn begin_destroy(&self) -> bool {
        self.destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn kill(&self) {
        let _ = self.kill_tx.send(true);
    }
}

/// Transport control hook: pongs feed the clock synchronizer, a server DISCO
///  runs the one-shot disconnect path without notifying back.
struct ClientEvents {
    clock: Arc<ClockSync>,
    shared: Arc<ClientShared>,
    dispatcher: Arc<dyn MessageDispatcher>,
    session_addr: SocketAddr,
}

#[async_trait]
impl ControlEvents for ClientEvents {
    async fn on_peer_disconnect(&self, reason: u8) {
        if self.shared.begin_destroy() {
            debug!("server posted DISCO, reason {}", reason);
            self.dispatcher.on_disconnect(self.session_addr, reason).await;
            self.shared.kill();
        }
    }

    fn on_time_pong(&self, echoed_local_ms: u32, server_recv_ms: u32, now_ms: u32) {
        self.clock.on_pong(echoed_local_ms, server_recv_ms, now_ms);
    }
}

struct ClientInner {
    transport: Arc<Transport>,
    pipeline: Arc<SealingPipeline>,
    crypto: Arc<SessionCrypto>,
    clock: Arc<ClockSync>,
    dispatcher: Arc<dyn MessageDispatcher>,
    shared: Arc<ClientShared>,
    socket: Arc<UdpSocket>,
    session_addr: SocketAddr,
    support_ipv6: bool,
    epoch: Instant,
}

impl ClientInner {
    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    async fn local_disconnect(&self, reason: u8, notify: bool) {
        if !self.shared.begin_destroy() {
            return;
        }
        if notify {
            self.transport.post_disco(reason, self.now_ms()).await;
        }
        self.dispatcher.on_disconnect(self.session_addr, reason).await;
        self.shared.kill();
    }
}

/// A connected session. Dropping the client aborts its background tasks;
///  [Client::disconnect] tells the server first.
pub struct Client {
    inner: Arc<ClientInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Client {
    /// Run the handshake and establish the session. Resolution of the server
    ///  hostname happens before this call; `config.server_addr` is the public
    ///  handshake address.
    pub async fn connect(config: ClientConfig, dispatcher: Arc<dyn MessageDispatcher>) -> Result<Client, ConnectError> {
        if config.validate().is_err() {
            return Err(ConnectError::InvalidConfig);
        }
        let initiator = KeyAgreementInitiator::new(&config.server_public_key)
            .map_err(|_| ConnectError::InvalidConfig)?;

        let wildcard = if config.support_ipv6 { "[::]:0" } else { "0.0.0.0:0" };
        let socket = Arc::new(UdpSocket::bind(wildcard).await.map_err(|_| ConnectError::BrokenPipe)?);

        let epoch = Instant::now();
        let now_ms = || epoch.elapsed().as_millis() as u32;

        let mut hello = Vec::new();
        Hello { public_key_echo: config.server_public_key }.ser(&mut hello);

        Self::post_hello(&socket, &hello, config.server_addr).await?;
        let mut last_hello_ms = 0u32;
        let mut hello_interval_ms = INITIAL_HELLO_POST_INTERVAL_MS;
        let mut seen_server_packet = false;

        let mut buf = [0u8; 2048];
        let (session_port, keys) = loop {
            match timeout(Duration::from_millis(TICK_RATE_MS as u64), socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    if from.ip() != config.server_addr.ip() {
                        trace!("handshake packet from foreign address {:?} - ignoring", from);
                    } else {
                        match peek_type(&buf[..len]) {
                            Some(HandshakeType::S2cCookie) if len == COOKIE_LEN => {
                                seen_server_packet = true;
                                let cookie = Cookie::deser(&mut &buf[..len]).expect("length checked").cookie;

                                let mut challenge = Vec::new();
                                Challenge { cookie, challenge: *initiator.challenge() }.ser(&mut challenge);
                                if socket.send_to(&challenge, config.server_addr).await.is_err() {
                                    return Err(ConnectError::BrokenPipe);
                                }
                                trace!("accepted cookie and posted challenge");
                            }
                            Some(HandshakeType::S2cAnswer) if len == ANSWER_LEN => {
                                seen_server_packet = true;
                                let answer = Answer::deser(&mut &buf[..len]).expect("length checked");

                                if answer.session_port == 0 {
                                    debug!("answer with a zero session port - ignoring");
                                } else if let Some(keys) = initiator.process_answer(&answer.answer, &config.session_key) {
                                    break (answer.session_port, keys);
                                } else {
                                    debug!("answer failed key confirmation - ignoring");
                                }
                            }
                            Some(HandshakeType::S2cError) if len == ERROR_LEN => {
                                seen_server_packet = true;
                                let packet = ErrorPacket::deser(&mut &buf[..len]).expect("length checked");
                                match HandshakeError::try_from(packet.code) {
                                    Ok(code) => return Err(ConnectError::Server(code)),
                                    // out-of-range server codes are not actionable
                                    Err(_) => debug!("server error with unknown code {} - ignoring", packet.code),
                                }
                            }
                            _ => trace!("unexpected packet during handshake - ignoring"),
                        }
                    }
                }
                Ok(Err(e)) => {
                    // an ICMP unreachable surfaces as a refused receive; it
                    //  only fails the connect before the server was ever heard
                    if e.kind() == std::io::ErrorKind::ConnectionRefused && !seen_server_packet {
                        return Err(ConnectError::Icmp);
                    }
                    debug!("socket error during handshake: {}", e);
                }
                Err(_elapsed) => {}
            }

            let now = now_ms();
            if now >= CONNECT_TIMEOUT_MS {
                return Err(ConnectError::Timeout);
            }
            if now.wrapping_sub(last_hello_ms) >= hello_interval_ms {
                Self::post_hello(&socket, &hello, config.server_addr).await?;
                last_hello_ms = now;
                hello_interval_ms = hello_interval_ms.saturating_mul(2);
            }
        };

        let session_addr = SocketAddr::new(config.server_addr.ip(), session_port);
        info!("connected, session migrated to {:?}", session_addr);

        let crypto = Arc::new(SessionCrypto::new(keys.for_client()));
        let buffer_pool = Arc::new(PacketBufferPool::new(MAXIMUM_MTU as usize, config.buffer_pool_size));
        let pipeline = Arc::new(SealingPipeline::new(
            Arc::new(socket.clone()),
            crypto.clone(),
            buffer_pool,
            session_addr,
        ));

        let (kill_tx, _) = watch::channel(false);
        let shared = Arc::new(ClientShared {
            destroyed: AtomicBool::new(false),
            kill_tx,
            last_recv_ms: AtomicU32::new(now_ms()),
        });
        let clock = Arc::new(ClockSync::new());
        let events = Arc::new(ClientEvents {
            clock: clock.clone(),
            shared: shared.clone(),
            dispatcher: dispatcher.clone(),
            session_addr,
        });

        let transport = Arc::new(Transport::new(pipeline.clone(), dispatcher.clone(), events, config.support_ipv6));

        let inner = Arc::new(ClientInner {
            transport,
            pipeline,
            crypto,
            clock,
            dispatcher: dispatcher.clone(),
            shared,
            socket,
            session_addr,
            support_ipv6: config.support_ipv6,
            epoch,
        });

        dispatcher.on_connect(session_addr).await;

        let tasks = vec![
            tokio::spawn(Self::recv_loop(inner.clone())),
            tokio::spawn(Self::tick_loop(inner.clone())),
        ];

        Ok(Client { inner, tasks })
    }

    async fn post_hello(socket: &UdpSocket, hello: &[u8], server_addr: SocketAddr) -> Result<(), ConnectError> {
        socket
            .send_to(hello, server_addr)
            .await
            .map(|_| ())
            .map_err(|_| ConnectError::BrokenPipe)
    }

    async fn recv_loop(inner: Arc<ClientInner>) {
        let mut kill_rx = inner.shared.kill_tx.subscribe();
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                _ = kill_rx.changed() => return,
                recv_result = inner.socket.recv_from(&mut buf) => {
                    let (len, from) = match recv_result {
                        Ok(x) => x,
                        Err(e) => {
                            debug!("socket error: {}", e);
                            continue;
                        }
                    };
                    if from != inner.session_addr {
                        trace!("datagram from foreign address {:?} - ignoring", from);
                        continue;
                    }
                    let now = inner.now_ms();
                    let Some(plaintext_len) = inner.crypto.open(&mut buf[..len]) else {
                        trace!("unauthentic datagram - ignoring");
                        continue;
                    };
                    inner.shared.last_recv_ms.store(now, Ordering::Relaxed);
                    inner.transport.on_datagram(&buf[..plaintext_len], now).await;
                }
            }
        }
    }

    async fn tick_loop(inner: Arc<ClientInner>) {
        let mut kill_rx = inner.shared.kill_tx.subscribe();

        let max_probe = probe_payload_for_mtu(MAXIMUM_MTU, inner.support_ipv6);
        let medium_probe = probe_payload_for_mtu(MEDIUM_MTU, inner.support_ipv6);

        // MTU discovery starts right after connect, with don't-fragment set
        let now = inner.now_ms();
        inner.pipeline.set_dont_fragment(true);
        inner.transport.post_mtu_probe(max_probe, now).await;
        inner.transport.post_mtu_probe(medium_probe, now).await;
        let mut mtu_attempts = 2u32;
        let mut mtu_probe_ms = now;

        // time sync starts with a fast burst
        let mut next_sync_ms = now;
        let mut sync_attempts = 0u32;

        let mut tick = interval(Duration::from_millis(TICK_RATE_MS as u64));
        loop {
            tokio::select! {
                _ = kill_rx.changed() => return,
                _ = tick.tick() => {}
            }
            let now = inner.now_ms();

            inner.transport.tick(now).await;

            if elapsed_ms(next_sync_ms, now).is_some() {
                if let Err(e) = inner.transport.post_time_ping(now).await {
                    warn!("could not post time ping: {}", e);
                }
                if sync_attempts >= TIME_SYNC_FAST_COUNT {
                    next_sync_ms = now.wrapping_add(TIME_SYNC_INTERVAL_MS);
                } else {
                    next_sync_ms = now.wrapping_add(TIME_SYNC_FAST_MS);
                    sync_attempts += 1;
                }
            }

            if mtu_attempts > 0 && elapsed_ms(mtu_probe_ms, now).map(|ms| ms >= MTU_PROBE_INTERVAL_MS).unwrap_or(false) {
                if inner.transport.max_payload_bytes() >= max_probe {
                    mtu_attempts = 0;
                    inner.pipeline.set_dont_fragment(false);
                } else if mtu_attempts > 1 {
                    inner.transport.post_mtu_probe(max_probe, now).await;
                    inner.transport.post_mtu_probe(medium_probe, now).await;
                    mtu_probe_ms = now;
                    mtu_attempts -= 1;
                } else {
                    // last round runs without don't-fragment so at least one
                    //  probe size gets through a fragmenting path
                    mtu_attempts = 0;
                    inner.pipeline.set_dont_fragment(false);
                }
            }

            let last_recv = inner.shared.last_recv_ms.load(Ordering::Relaxed);
            if elapsed_ms(last_recv, now).map(|ms| ms >= TIMEOUT_DISCONNECT_MS).unwrap_or(false) {
                info!("server silent for {} ms - disconnecting", TIMEOUT_DISCONNECT_MS);
                inner.local_disconnect(crate::wire::DISCO_TIMEOUT, true).await;
                return;
            }

            if elapsed_ms(inner.transport.last_send_ms(), now).map(|ms| ms >= SILENCE_LIMIT_MS).unwrap_or(false) {
                // keep-alive doubles as a sync sample
                let _ = inner.transport.post_time_ping(now).await;
                next_sync_ms = now.wrapping_add(TIME_SYNC_INTERVAL_MS);
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.shared.destroyed.load(Ordering::Acquire)
    }

    pub fn session_addr(&self) -> SocketAddr {
        self.inner.session_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.socket.local_addr().expect("bound in connect()")
    }

    /// Milliseconds of local connection time, the domain of the time
    ///  conversion functions.
    pub fn now_ms(&self) -> u32 {
        self.inner.now_ms()
    }

    pub async fn rtt_ms(&self) -> u32 {
        self.inner.transport.rtt_ms().await
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.inner.transport.max_payload_bytes()
    }

    /// Convert local connection time to the server's clock.
    pub fn server_time(&self, local_ms: u32) -> u32 {
        self.inner.clock.server_time(local_ms)
    }

    /// Convert a server timestamp to local connection time.
    pub fn local_time(&self, server_ms: u32) -> u32 {
        self.inner.clock.local_time(server_ms, self.inner.now_ms())
    }

    pub async fn send_reliable(&self, stream: StreamMode, data: &[u8]) -> anyhow::Result<()> {
        if !self.is_connected() {
            anyhow::bail!("connection is closed");
        }
        self.inner.transport.write_reliable(stream, data, self.inner.now_ms()).await
    }

    pub async fn send_unreliable(&self, data: &[u8]) -> anyhow::Result<()> {
        if !self.is_connected() {
            anyhow::bail!("connection is closed");
        }
        self.inner.transport.write_unreliable(data, self.inner.now_ms()).await
    }

    /// Tell the server goodbye and tear the session down. One-shot; later
    ///  calls are no-ops.
    pub async fn disconnect(&self, reason: u8) {
        self.inner.local_disconnect(reason, true).await;
    }
}
