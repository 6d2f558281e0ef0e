//! The server endpoint: a public socket that speaks only the cleartext
//!  handshake, a farm of per-session worker sockets carrying the encrypted
//!  tunnels, and a tick task driving retransmission, ACK flushing and timeout
//!  detection for every connection.
//!
//! The handshake allocates nothing until a cookie-carrying CHALLENGE
//!  verifies, and caches the computed answer per peer address so replays cost
//!  no CPU. [ServerCore] holds all protocol state behind the [SendSocket]
//!  seam, so the logic runs against mocks in tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info, trace, warn};

use crate::buffers::buffer_pool::PacketBufferPool;
use crate::config::ServerConfig;
use crate::conn_map::{ConnectionMap, InsertOutcome};
use crate::connection::{Connection, ConnectionEvents, Lifecycle, FLAG_DELETE, FLAG_POST_HANDSHAKE, FLAG_TIMED};
use crate::crypto::cookie::CookieJar;
use crate::crypto::envelope::SessionCrypto;
use crate::crypto::keys::ServerIdentity;
use crate::error::HandshakeError;
use crate::message_dispatcher::MessageDispatcher;
use crate::send_pipeline::{SealingPipeline, SendSocket};
use crate::transport::{elapsed_ms, Transport};
use crate::wire::handshake::{Answer, Challenge, Cookie, ErrorPacket, Hello, ANSWER_LEN, CHALLENGE_LEN, HELLO_LEN};
use crate::wire::{
    HandshakeType, StreamMode, DISCO_TIMEOUT, MAXIMUM_MTU, PUBLIC_KEY_BYTES, TICK_RATE_MS, TIMEOUT_DISCONNECT_MS,
};

/// One session-carrying worker socket, behind the mockable send seam.
pub(crate) struct WorkerHandle {
    pub send_socket: Arc<dyn SendSocket>,
    pub port: u16,
    pub session_count: AtomicUsize,
}

/// All server protocol state, independent of the concrete sockets.
pub(crate) struct ServerCore {
    config: ServerConfig,
    identity: ServerIdentity,
    cookie_jar: CookieJar,
    map: ConnectionMap,
    dispatcher: Arc<dyn MessageDispatcher>,
    buffer_pool: Arc<PacketBufferPool>,
    workers: Vec<WorkerHandle>,
    epoch: Instant,
}

impl ServerCore {
    pub(crate) fn new(
        config: ServerConfig,
        dispatcher: Arc<dyn MessageDispatcher>,
        workers: Vec<WorkerHandle>,
    ) -> ServerCore {
        let identity = ServerIdentity::from_private_key(&config.private_key);
        let buffer_pool = Arc::new(PacketBufferPool::new(MAXIMUM_MTU as usize, config.buffer_pool_size));

        ServerCore {
            config,
            identity,
            cookie_jar: CookieJar::new(),
            map: ConnectionMap::new(),
            dispatcher,
            buffer_pool,
            workers,
            epoch: Instant::now(),
        }
    }

    pub(crate) fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    pub(crate) fn public_key_blob(&self) -> &[u8; PUBLIC_KEY_BYTES] {
        self.identity.public_blob()
    }

    /// Process one cleartext packet from the public socket; the returned
    ///  bytes, if any, go back to the peer. No state is created before a
    ///  valid cookie round trip, and every reply is no larger than the
    ///  request, so the public port cannot amplify.
    pub(crate) fn handle_handshake_packet(&self, data: &[u8], peer: SocketAddr, now: u32) -> Option<Vec<u8>> {
        match crate::wire::handshake::peek_type(data) {
            Some(HandshakeType::C2sHello) if data.len() == HELLO_LEN => self.handle_hello(data, peer),
            Some(HandshakeType::C2sChallenge) if data.len() == CHALLENGE_LEN => self.handle_challenge(data, peer, now),
            _ => {
                trace!("unrecognized packet on the public port from {:?} - dropping", peer);
                None
            }
        }
    }

    fn handle_hello(&self, data: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
        let mut read = data;
        let hello = Hello::deser(&mut read).ok()?;

        if &hello.public_key_echo != self.identity.public_blob() {
            debug!("HELLO from {:?} echoes a foreign public key - dropping", peer);
            return None;
        }

        let mut reply = Vec::with_capacity(8);
        Cookie { cookie: self.cookie_jar.generate(peer) }.ser(&mut reply);
        Some(reply)
    }

    fn handle_challenge(&self, data: &[u8], peer: SocketAddr, now: u32) -> Option<Vec<u8>> {
        let mut read = data;
        let challenge = Challenge::deser(&mut read).ok()?;

        if !self.cookie_jar.verify(peer, challenge.cookie) {
            debug!("CHALLENGE from {:?} with a stale or forged cookie - dropping", peer);
            return None;
        }

        if let Some(conn) = self.map.get(peer) {
            if conn.first_challenge == challenge.challenge {
                trace!("replayed challenge from {:?} - answering from cache", peer);
                return Some(conn.cached_answer_packet.to_vec());
            }
            debug!("{:?} presented a second, different challenge - dropping", peer);
            return None;
        }

        if self.map.is_full() {
            let mut reply = Vec::with_capacity(2);
            ErrorPacket { code: HandshakeError::ServerFull.into() }.ser(&mut reply);
            return Some(reply);
        }

        let (keys, answer) = self.identity.respond(&challenge.challenge, &self.config.session_key)?;

        let worker_index = self.least_populated_worker();
        let worker = &self.workers[worker_index];

        let mut answer_packet = Vec::with_capacity(ANSWER_LEN);
        Answer { session_port: worker.port, answer }.ser(&mut answer_packet);
        let cached_answer_packet: [u8; ANSWER_LEN] =
            answer_packet.clone().try_into().expect("answer packet has a fixed size");

        let crypto = Arc::new(SessionCrypto::new(keys.for_server()));
        let lifecycle = Arc::new(Lifecycle::new());
        let pipeline = Arc::new(SealingPipeline::new(
            worker.send_socket.clone(),
            crypto.clone(),
            self.buffer_pool.clone(),
            peer,
        ));
        let transport = Transport::new(
            pipeline,
            self.dispatcher.clone(),
            Arc::new(ConnectionEvents::new(lifecycle.clone())),
            self.config.support_ipv6,
        );

        let outcome = self.map.insert(peer, move |slot_key| {
            Arc::new(Connection {
                peer_addr: peer,
                slot_key,
                worker_index,
                transport,
                crypto,
                lifecycle,
                last_recv_ms: AtomicU32::new(now),
                first_challenge: challenge.challenge,
                cached_answer_packet,
            })
        });

        match outcome {
            InsertOutcome::Inserted(_) => {
                worker.session_count.fetch_add(1, Ordering::Relaxed);
                info!("session assigned: {:?} on worker port {}", peer, worker.port);
                Some(answer_packet)
            }
            InsertOutcome::Existing(_) => None,
            InsertOutcome::Full => {
                let mut reply = Vec::with_capacity(2);
                ErrorPacket { code: HandshakeError::ServerFull.into() }.ser(&mut reply);
                Some(reply)
            }
        }
    }

    fn least_populated_worker(&self) -> usize {
        self.workers
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.session_count.load(Ordering::Relaxed))
            .map(|(i, _)| i)
            .expect("config validation guarantees at least one worker")
    }

    /// One datagram from any worker socket: authenticate, then hand the
    ///  plaintext to the connection's transport.
    pub(crate) async fn on_session_datagram(&self, buf: &mut [u8], peer: SocketAddr, now: u32) {
        let Some(conn) = self.map.get(peer) else {
            trace!("session datagram from unknown peer {:?} - dropping", peer);
            return;
        };
        if conn.lifecycle.is_destroyed() {
            return;
        }

        let Some(plaintext_len) = conn.crypto.open(buf) else {
            trace!("unauthentic session datagram from {:?} - dropping", peer);
            return;
        };

        conn.note_recv(now);
        if conn.lifecycle.set_flag(FLAG_POST_HANDSHAKE) {
            self.dispatcher.on_connect(peer).await;
        }
        conn.transport.on_datagram(&buf[..plaintext_len], now).await;
    }

    /// One pass of the tick task over every timed connection: drain fresh
    ///  insertions, tear down deleted ones, detect timeouts, drive transports.
    pub(crate) async fn tick(&self, timed: &mut Vec<Arc<Connection>>, now: u32) {
        self.cookie_jar.rotate_if_due();

        for conn in self.map.drain_inserted() {
            conn.lifecycle.set_flag(FLAG_TIMED);
            timed.push(conn);
        }

        let mut i = 0;
        while i < timed.len() {
            let conn = timed[i].clone();

            if conn.lifecycle.is_flag_set(FLAG_DELETE) {
                self.map.free_slot(conn.slot_key);
                self.workers[conn.worker_index].session_count.fetch_sub(1, Ordering::Relaxed);
                self.dispatcher
                    .on_disconnect(conn.peer_addr, conn.lifecycle.disco_reason())
                    .await;
                timed.swap_remove(i);
                continue;
            }

            let silent_for = elapsed_ms(conn.last_recv_ms(), now).unwrap_or(0);
            if silent_for >= TIMEOUT_DISCONNECT_MS {
                if conn.lifecycle.begin_destroy() {
                    debug!("{:?} silent for {} ms - disconnecting", conn.peer_addr, silent_for);
                    conn.transport.post_disco(DISCO_TIMEOUT, now).await;
                    conn.lifecycle.schedule_delete(DISCO_TIMEOUT);
                }
                i += 1;
                continue;
            }

            conn.transport.tick(now).await;
            i += 1;
        }
    }

    pub(crate) async fn send_reliable(&self, peer: SocketAddr, stream: StreamMode, data: &[u8]) -> anyhow::Result<()> {
        let Some(conn) = self.map.get(peer) else {
            anyhow::bail!("no session for {:?}", peer);
        };
        conn.transport.write_reliable(stream, data, self.now_ms()).await
    }

    pub(crate) async fn send_unreliable(&self, peer: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        let Some(conn) = self.map.get(peer) else {
            anyhow::bail!("no session for {:?}", peer);
        };
        conn.transport.write_unreliable(data, self.now_ms()).await
    }

    #[cfg(test)]
    pub(crate) fn map(&self) -> &ConnectionMap {
        &self.map
    }

    #[cfg(test)]
    pub(crate) fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }
}

/// The running server: binds the public socket and the worker farm, then
///  drives the receive loops and the tick task.
pub struct Server {
    core: Arc<ServerCore>,
    public_socket: Arc<UdpSocket>,
    worker_sockets: Vec<Arc<UdpSocket>>,
    kill_tx: watch::Sender<bool>,
    kill_rx: watch::Receiver<bool>,
}

impl Server {
    pub async fn new(config: ServerConfig, dispatcher: Arc<dyn MessageDispatcher>) -> anyhow::Result<Server> {
        config.validate()?;

        let wildcard = if config.support_ipv6 { "[::]" } else { "0.0.0.0" };
        let public_socket = Arc::new(UdpSocket::bind(format!("{}:{}", wildcard, config.listen_port)).await?);
        info!("public handshake socket bound to {:?}", public_socket.local_addr());

        let mut worker_sockets = Vec::with_capacity(config.worker_socket_count);
        let mut workers = Vec::with_capacity(config.worker_socket_count);
        for _ in 0..config.worker_socket_count {
            let socket = Arc::new(UdpSocket::bind(format!("{}:0", wildcard)).await?);
            let port = socket.local_addr().port();
            debug!("worker socket bound to port {}", port);

            workers.push(WorkerHandle {
                send_socket: Arc::new(socket.clone()) as Arc<dyn SendSocket>,
                port,
                session_count: AtomicUsize::new(0),
            });
            worker_sockets.push(socket);
        }

        let core = Arc::new(ServerCore::new(config, dispatcher, workers));
        let (kill_tx, kill_rx) = watch::channel(false);

        Ok(Server { core, public_socket, worker_sockets, kill_tx, kill_rx })
    }

    pub fn public_key_blob(&self) -> &[u8; PUBLIC_KEY_BYTES] {
        self.core.public_key_blob()
    }

    pub fn public_addr(&self) -> SocketAddr {
        self.public_socket.local_addr()
    }

    /// Signal every loop in [Server::run] to stop.
    pub fn shutdown(&self) {
        let _ = self.kill_tx.send(true);
    }

    /// Send an application message on a reliable stream of an established
    ///  session.
    pub async fn send_reliable(&self, peer: SocketAddr, stream: StreamMode, data: &[u8]) -> anyhow::Result<()> {
        self.core.send_reliable(peer, stream, data).await
    }

    /// Send an unreliable application message to an established session.
    pub async fn send_unreliable(&self, peer: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        self.core.send_unreliable(peer, data).await
    }

    /// Drive the server until [Server::shutdown]. Spawns the worker receive
    ///  loops and the tick task, and runs the public handshake loop inline.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut tasks = Vec::new();

        for socket in &self.worker_sockets {
            tasks.push(tokio::spawn(Self::worker_loop(
                self.core.clone(),
                socket.clone(),
                self.kill_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(Self::tick_loop(self.core.clone(), self.kill_rx.clone())));

        let mut kill_rx = self.kill_rx.clone();
        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                _ = kill_rx.changed() => break,
                recv_result = self.public_socket.recv_from(&mut buf) => {
                    let (len, peer) = match recv_result {
                        Ok(x) => x,
                        Err(e) => {
                            warn!("public socket error: {}", e);
                            continue;
                        }
                    };
                    let now = self.core.now_ms();
                    if let Some(reply) = self.core.handle_handshake_packet(&buf[..len], peer, now) {
                        if let Err(e) = self.public_socket.send_to(&reply, peer).await {
                            warn!("error replying to handshake from {:?}: {}", peer, e);
                        }
                    }
                }
            }
        }

        for task in tasks {
            task.abort();
        }
        info!("server shut down");
        Ok(())
    }

    async fn worker_loop(core: Arc<ServerCore>, socket: Arc<UdpSocket>, mut kill_rx: watch::Receiver<bool>) {
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                _ = kill_rx.changed() => return,
                recv_result = socket.recv_from(&mut buf) => {
                    let (len, peer) = match recv_result {
                        Ok(x) => x,
                        Err(e) => {
                            warn!("worker socket error: {}", e);
                            continue;
                        }
                    };
                    let now = core.now_ms();
                    core.on_session_datagram(&mut buf[..len], peer, now).await;
                }
            }
        }
    }

    async fn tick_loop(core: Arc<ServerCore>, mut kill_rx: watch::Receiver<bool>) {
        let mut timed = Vec::new();
        let mut tick = interval(Duration::from_millis(TICK_RATE_MS as u64));
        loop {
            tokio::select! {
                _ = kill_rx.changed() => return,
                _ = tick.tick() => {
                    let now = core.now_ms();
                    core.tick(&mut timed, now).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::KeyAgreementInitiator;
    use crate::message_dispatcher::MockMessageDispatcher;
    use crate::send_pipeline::MockSendSocket;
    use crate::wire::handshake::COOKIE_LEN;

    fn mock_worker(port: u16) -> WorkerHandle {
        let mut socket = MockSendSocket::new();
        socket.expect_local_addr().return_const(SocketAddr::from(([127, 0, 0, 1], port)));
        socket.expect_send_packet().returning(|_, _| ());
        WorkerHandle {
            send_socket: Arc::new(socket),
            port,
            session_count: AtomicUsize::new(0),
        }
    }

    fn test_core(worker_count: usize) -> ServerCore {
        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_message().returning(|_, _, _| ());
        dispatcher.expect_on_connect().returning(|_| ());
        dispatcher.expect_on_disconnect().returning(|_, _| ());

        let workers = (0..worker_count).map(|i| mock_worker(40_000 + i as u16)).collect();
        ServerCore::new(
            ServerConfig::new(22_000, [9u8; 32], "session"),
            Arc::new(dispatcher),
            workers,
        )
    }

    fn peer(n: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], 5_000 + n))
    }

    fn hello_packet(core: &ServerCore) -> Vec<u8> {
        let mut buf = Vec::new();
        Hello { public_key_echo: *core.public_key_blob() }.ser(&mut buf);
        buf
    }

    fn challenge_packet(core: &ServerCore, peer: SocketAddr, initiator: &KeyAgreementInitiator) -> Vec<u8> {
        let cookie = match core.handle_handshake_packet(&hello_packet(core), peer, 0) {
            Some(reply) => Cookie::deser(&mut reply.as_slice()).unwrap().cookie,
            None => panic!("hello must produce a cookie"),
        };

        let mut buf = Vec::new();
        Challenge { cookie, challenge: *initiator.challenge() }.ser(&mut buf);
        buf
    }

    #[test]
    fn test_hello_yields_stateless_cookie() {
        let core = test_core(1);

        let reply = core.handle_handshake_packet(&hello_packet(&core), peer(1), 0).unwrap();
        assert_eq!(reply.len(), COOKIE_LEN);
        assert_eq!(core.map().population(), 0);
    }

    #[test]
    fn test_hello_with_foreign_key_dropped() {
        let core = test_core(1);

        let mut buf = Vec::new();
        Hello { public_key_echo: [0xAB; PUBLIC_KEY_BYTES] }.ser(&mut buf);
        assert!(core.handle_handshake_packet(&buf, peer(1), 0).is_none());
    }

    #[test]
    fn test_challenge_without_cookie_dropped() {
        let core = test_core(1);
        let initiator = KeyAgreementInitiator::new(core.public_key_blob()).unwrap();

        let mut buf = Vec::new();
        Challenge { cookie: 0xBAD, challenge: *initiator.challenge() }.ser(&mut buf);
        assert!(core.handle_handshake_packet(&buf, peer(1), 0).is_none());
        assert_eq!(core.map().population(), 0);
    }

    #[test]
    fn test_valid_challenge_creates_session() {
        let core = test_core(2);
        let initiator = KeyAgreementInitiator::new(core.public_key_blob()).unwrap();

        let packet = challenge_packet(&core, peer(1), &initiator);
        let reply = core.handle_handshake_packet(&packet, peer(1), 0).unwrap();

        let answer = Answer::deser(&mut reply.as_slice()).unwrap();
        assert!([40_000, 40_001].contains(&answer.session_port));
        assert!(initiator.process_answer(&answer.answer, "session").is_some());

        assert_eq!(core.map().population(), 1);
        let total: usize = core.workers().iter().map(|w| w.session_count.load(Ordering::Relaxed)).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_replayed_challenge_answered_from_cache() {
        let core = test_core(1);
        let initiator = KeyAgreementInitiator::new(core.public_key_blob()).unwrap();

        let packet = challenge_packet(&core, peer(1), &initiator);
        let first = core.handle_handshake_packet(&packet, peer(1), 0).unwrap();
        let second = core.handle_handshake_packet(&packet, peer(1), 5).unwrap();

        // byte-identical answer, still exactly one session
        assert_eq!(first, second);
        assert_eq!(core.map().population(), 1);
    }

    #[test]
    fn test_different_challenge_from_same_address_dropped() {
        let core = test_core(1);
        let initiator = KeyAgreementInitiator::new(core.public_key_blob()).unwrap();
        let other = KeyAgreementInitiator::new(core.public_key_blob()).unwrap();

        let packet = challenge_packet(&core, peer(1), &initiator);
        core.handle_handshake_packet(&packet, peer(1), 0).unwrap();

        let packet = challenge_packet(&core, peer(1), &other);
        assert!(core.handle_handshake_packet(&packet, peer(1), 1).is_none());
    }

    #[test]
    fn test_sessions_balance_across_workers() {
        let core = test_core(2);

        for i in 0..4 {
            let initiator = KeyAgreementInitiator::new(core.public_key_blob()).unwrap();
            let packet = challenge_packet(&core, peer(i), &initiator);
            core.handle_handshake_packet(&packet, peer(i), 0).unwrap();
        }

        assert_eq!(core.workers()[0].session_count.load(Ordering::Relaxed), 2);
        assert_eq!(core.workers()[1].session_count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_amplification_bound() {
        let core = test_core(1);

        // a flood of HELLOs creates no state and no oversized replies
        for i in 0..100u16 {
            let reply = core.handle_handshake_packet(&hello_packet(&core), peer(i), 0).unwrap();
            assert!(reply.len() <= HELLO_LEN);
        }
        assert_eq!(core.map().population(), 0);
    }

    #[tokio::test]
    async fn test_session_datagram_roundtrip_and_timeout_teardown() {
        let core = test_core(1);
        let initiator = KeyAgreementInitiator::new(core.public_key_blob()).unwrap();

        let packet = challenge_packet(&core, peer(1), &initiator);
        let reply = core.handle_handshake_packet(&packet, peer(1), 0).unwrap();
        let answer = Answer::deser(&mut reply.as_slice()).unwrap();
        let client_keys = initiator.process_answer(&answer.answer, "session").unwrap().for_client();
        let client_crypto = SessionCrypto::new(client_keys);

        // client sends one reliable message through the tunnel
        let mut plain = Vec::new();
        crate::wire::message_header::MessageHeader::new(4, true, true, crate::wire::SuperOpcode::Data)
            .ser(&mut plain);
        crate::wire::ack_field::ser_ack_id(&mut plain, 1, 0, None);
        plain.extend_from_slice(b"ping");

        let mut buf = crate::buffers::fixed_buffer::FixedBuf::new(MAXIMUM_MTU as usize);
        bytes::BufMut::put_slice(&mut buf, &plain);
        client_crypto.seal(&mut buf);

        let mut wire = buf.as_ref().to_vec();
        core.on_session_datagram(&mut wire, peer(1), 10).await;

        let conn = core.map().get(peer(1)).unwrap();
        assert!(conn.lifecycle.is_flag_set(FLAG_POST_HANDSHAKE));
        assert_eq!(conn.last_recv_ms(), 10);

        // tick sweep: first pass adopts the connection, a silent period
        //  schedules the timeout disconnect, the next pass frees the slot
        let mut timed = Vec::new();
        core.tick(&mut timed, 20).await;
        assert_eq!(timed.len(), 1);

        core.tick(&mut timed, 10 + TIMEOUT_DISCONNECT_MS).await;
        assert!(conn.lifecycle.is_flag_set(FLAG_DELETE));

        core.tick(&mut timed, 10 + TIMEOUT_DISCONNECT_MS + TICK_RATE_MS).await;
        assert!(timed.is_empty());
        assert_eq!(core.map().population(), 0);
    }
}
