//! The per-connection transport: everything between the AEAD envelope and the
//!  application. One instance serves exactly one peer; the server owns one per
//!  connection, the client owns one.
//!
//! Two entry points drive it: [Transport::on_datagram] from the I/O completion
//!  path with decrypted plaintext, and [Transport::tick] from the endpoint's
//!  tick task. Both coalesce outbound work into the shared staging buffer.

pub mod recv;
pub mod send;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut};
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::message_dispatcher::MessageDispatcher;
use crate::send_pipeline::SealingPipeline;
use crate::transport::recv::{Delivery, RecvState};
use crate::transport::send::SendState;
use crate::wire::ack_field::{deser_ack_id, reconstruct_id};
use crate::wire::message_header::MessageHeader;
use crate::wire::{
    StreamMode, SuperOpcode, ENVELOPE_OVERHEAD, IPV4_HEADER_BYTES, IPV6_HEADER_BYTES, MAXIMUM_MTU, MINIMUM_MTU,
    UDP_HEADER_BYTES,
};

/// Wrapping millisecond-timestamp difference; `None` when `now` is before
///  `since` (a stale sample, not an elapsed interval).
pub fn elapsed_ms(since: u32, now: u32) -> Option<u32> {
    let diff = now.wrapping_sub(since);
    (diff < 0x8000_0000).then_some(diff)
}

/// UDP payload bytes available to the transport at the dial-up-safe minimum
///  MTU, before any discovery has run. Headers are assumed worst-case.
pub fn initial_payload_bytes(ipv6: bool) -> u32 {
    let ip_header = if ipv6 { IPV6_HEADER_BYTES } else { IPV4_HEADER_BYTES };
    MINIMUM_MTU - ip_header - UDP_HEADER_BYTES - ENVELOPE_OVERHEAD as u32
}

/// Control-plane callbacks out of the transport. The client wires these to
///  its clock synchronizer and disconnect path; the server marks the
///  connection for teardown.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlEvents: Send + Sync + 'static {
    /// The peer posted a DISCO with the given reason.
    async fn on_peer_disconnect(&self, reason: u8);

    /// A TIME_PONG arrived: the echoed local send time and the peer's receive
    ///  timestamp, plus the local receive time.
    fn on_time_pong(&self, echoed_local_ms: u32, server_recv_ms: u32, now_ms: u32);
}

pub struct Transport {
    pipeline: Arc<SealingPipeline>,
    dispatcher: Arc<dyn MessageDispatcher>,
    events: Arc<dyn ControlEvents>,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    max_payload_bytes: AtomicU32,
    last_send_ms: AtomicU32,
}

impl Transport {
    pub fn new(
        pipeline: Arc<SealingPipeline>,
        dispatcher: Arc<dyn MessageDispatcher>,
        events: Arc<dyn ControlEvents>,
        ipv6: bool,
    ) -> Transport {
        Transport {
            pipeline,
            dispatcher,
            events,
            send: Mutex::new(SendState::new()),
            recv: Mutex::new(RecvState::new()),
            max_payload_bytes: AtomicU32::new(initial_payload_bytes(ipv6)),
            last_send_ms: AtomicU32::new(0),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.pipeline.peer_addr()
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes.load(Ordering::Relaxed) as usize
    }

    /// Monotone: discovery only ever raises the budget. The raise is clamped
    ///  so a forged probe or MTU_SET can never push the budget past the
    ///  staging buffers' capacity.
    pub fn raise_max_payload_bytes(&self, new_max: u32) {
        let ceiling = MAXIMUM_MTU - ENVELOPE_OVERHEAD as u32;
        self.max_payload_bytes.fetch_max(new_max.min(ceiling), Ordering::Relaxed);
    }

    pub fn last_send_ms(&self) -> u32 {
        self.last_send_ms.load(Ordering::Relaxed)
    }

    pub async fn rtt_ms(&self) -> u32 {
        self.send.lock().await.rtt_ms()
    }

    /// Queue an application message on a reliable stream and push it towards
    ///  the wire. A partial datagram stays staged for coalescing.
    pub async fn write_reliable(&self, stream: StreamMode, data: &[u8], now: u32) -> anyhow::Result<()> {
        self.write_reliable_sop(stream, SuperOpcode::Data, data, now).await
    }

    async fn write_reliable_sop(&self, stream: StreamMode, sop: SuperOpcode, data: &[u8], now: u32) -> anyhow::Result<()> {
        let max_payload = self.max_payload_bytes();
        let mut send = self.send.lock().await;
        send.push_reliable(stream.into(), sop, data.to_vec())?;
        if send.transmit_queued(&self.pipeline, max_payload, now).await {
            self.note_send(now);
        }
        Ok(())
    }

    /// Append an unreliable application message to the staging buffer.
    pub async fn write_unreliable(&self, data: &[u8], now: u32) -> anyhow::Result<()> {
        let max_payload = self.max_payload_bytes();
        let mut send = self.send.lock().await;
        send.append_unreliable(&self.pipeline, max_payload, SuperOpcode::Data, data, now).await?;
        self.note_send(now);
        Ok(())
    }

    /// Post a TIME_PING carrying the local clock; flushed immediately so the
    ///  measured round trip does not include a coalescing delay.
    pub async fn post_time_ping(&self, now: u32) -> anyhow::Result<()> {
        let max_payload = self.max_payload_bytes();
        let mut send = self.send.lock().await;
        send.append_unreliable(&self.pipeline, max_payload, SuperOpcode::TimePing, &now.to_le_bytes(), now).await?;
        send.flush(&self.pipeline, now).await;
        self.note_send(now);
        Ok(())
    }

    /// Post a DISCO with a reason code, flushing everything staged.
    pub async fn post_disco(&self, reason: u8, now: u32) {
        let max_payload = self.max_payload_bytes();
        let mut send = self.send.lock().await;
        let _ = send.append_unreliable(&self.pipeline, max_payload, SuperOpcode::Disco, &[reason], now).await;
        send.flush(&self.pipeline, now).await;
        self.note_send(now);
    }

    /// Post an MTU probe: an unreliable message padding the plaintext
    ///  datagram to exactly `target_payload` bytes, bypassing the coalescer
    ///  (the probe is intentionally larger than the current budget).
    pub async fn post_mtu_probe(&self, target_payload: usize, now: u32) {
        let data_len = target_payload.saturating_sub(MessageHeader::SERIALIZED_LEN);

        let mut buf = self.pipeline.get_buffer();
        if buf.capacity() < target_payload + ENVELOPE_OVERHEAD {
            debug!("probe of {} bytes exceeds the buffer capacity - skipping", target_payload);
            self.pipeline.return_buffer(buf);
            return;
        }
        MessageHeader::new(data_len.min(crate::wire::MAX_DATALEN), false, false, SuperOpcode::MtuProbe).ser(&mut buf);
        buf.put_bytes(0, data_len.min(crate::wire::MAX_DATALEN));

        self.pipeline.seal_and_send(buf).await;
        self.note_send(now);
    }

    /// Drive retransmission, ACK emission and the staged datagram. Called
    ///  every TICK_RATE.
    pub async fn tick(&self, now: u32) {
        let ack_payload = self.recv.lock().await.build_ack_payload();

        let max_payload = self.max_payload_bytes();
        let mut send = self.send.lock().await;

        if let Some(ack) = ack_payload {
            if let Err(e) = send.append_unreliable(&self.pipeline, max_payload, SuperOpcode::Ack, &ack, now).await {
                debug!("could not stage ACK message: {}", e);
            }
        }

        let mut posted = send.retransmit_due(&self.pipeline, max_payload, now).await;
        posted |= send.transmit_queued(&self.pipeline, max_payload, now).await;
        posted |= send.flush(&self.pipeline, now).await;

        if posted {
            self.note_send(now);
        }
    }

    /// Dispatch one decrypted datagram. Framing violations discard the rest
    ///  of the datagram but never the connection.
    pub async fn on_datagram(&self, plaintext: &[u8], now: u32) {
        let datagram_len = plaintext.len();

        let mut deliveries: Vec<Delivery> = Vec::new();
        let mut unreliable: Vec<Vec<u8>> = Vec::new();
        let mut acks: Vec<Vec<u8>> = Vec::new();
        let mut ping: Option<u32> = None;
        let mut pong: Option<(u32, u32)> = None;
        let mut probe_observed: Option<usize> = None;
        let mut disco: Option<u8> = None;

        {
            let mut recv = self.recv.lock().await;
            let mut buf = plaintext;
            // the ACK-ID anchor is per datagram: it applies to this and every
            //  following reliable message until a new one is seen
            let mut anchor: Option<(u8, u32)> = None;

            while buf.has_remaining() {
                let header = match MessageHeader::deser(&mut buf) {
                    Ok(header) => header,
                    Err(_) => {
                        trace!("framing ran past the datagram - dropping the rest");
                        break;
                    }
                };

                if header.has_ack_id {
                    let field = match deser_ack_id(&mut buf) {
                        Ok(field) => field,
                        Err(_) => {
                            trace!("truncated ACK-ID field - dropping the rest");
                            break;
                        }
                    };
                    let base = recv.next_expected(field.stream);
                    anchor = Some((field.stream, reconstruct_id(base, field.partial, field.bits)));
                }

                let data_len = header.data_len as usize;
                if buf.remaining() < data_len {
                    trace!("DATALEN past the end of the datagram - dropping the rest");
                    break;
                }
                let data = &buf.chunk()[..data_len];

                if header.reliable {
                    let valid_sop = matches!(header.sop, SuperOpcode::Data | SuperOpcode::Frag | SuperOpcode::MtuSet);
                    if !valid_sop || (header.sop == SuperOpcode::Frag && data_len == 0) {
                        trace!("invalid reliable message ({:?}, {} bytes) - dropping the rest", header.sop, data_len);
                        break;
                    }
                    let Some((stream, id)) = anchor else {
                        trace!("reliable message without an ACK-ID anchor - dropping the rest");
                        break;
                    };
                    recv.on_reliable(stream, id, header.sop, header.sop == SuperOpcode::Frag, data, &mut deliveries);
                    anchor = Some((stream, id + 1));
                } else {
                    match header.sop {
                        SuperOpcode::Data => unreliable.push(data.to_vec()),
                        SuperOpcode::Ack => acks.push(data.to_vec()),
                        SuperOpcode::MtuProbe => {
                            probe_observed = Some(probe_observed.unwrap_or(0).max(datagram_len));
                        }
                        SuperOpcode::TimePing if data_len == 4 => {
                            ping = Some(u32::from_le_bytes(data[..4].try_into().expect("length checked")));
                        }
                        SuperOpcode::TimePong if data_len == 8 => {
                            pong = Some((
                                u32::from_le_bytes(data[..4].try_into().expect("length checked")),
                                u32::from_le_bytes(data[4..8].try_into().expect("length checked")),
                            ));
                        }
                        SuperOpcode::Disco if data_len == 1 => {
                            disco = Some(data[0]);
                        }
                        other => {
                            trace!("ignoring unreliable message with super-opcode {:?}", other);
                        }
                    }
                }

                buf.advance(data_len);
            }
        }

        for ack in acks {
            self.send.lock().await.process_ack(&ack, now);
        }

        if let Some((echoed, server_recv)) = pong {
            self.events.on_time_pong(echoed, server_recv, now);
        }

        if let Some(t0) = ping {
            self.post_time_pong(t0, now).await;
        }

        if let Some(observed) = probe_observed {
            self.on_mtu_probe(observed, now).await;
        }

        for delivery in deliveries {
            match delivery.sop {
                SuperOpcode::MtuSet => self.handle_mtu_set(&delivery.data),
                _ => {
                    let stream = StreamMode::try_from(delivery.stream).expect("stream selector is 2 bits");
                    self.dispatcher
                        .on_message(self.peer_addr(), Some(stream), delivery.data)
                        .await;
                }
            }
        }
        for data in unreliable {
            self.dispatcher.on_message(self.peer_addr(), None, data).await;
        }

        if let Some(reason) = disco {
            self.events.on_peer_disconnect(reason).await;
        }
    }

    /// Echo a TIME_PING; flushed immediately so the peer's RTT sample stays
    ///  honest.
    async fn post_time_pong(&self, echoed: u32, now: u32) {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&echoed.to_le_bytes());
        payload[4..].copy_from_slice(&now.to_le_bytes());

        let max_payload = self.max_payload_bytes();
        let mut send = self.send.lock().await;
        if send
            .append_unreliable(&self.pipeline, max_payload, SuperOpcode::TimePong, &payload, now)
            .await
            .is_ok()
        {
            send.flush(&self.pipeline, now).await;
            self.note_send(now);
        }
    }

    /// A probe datagram of `observed` plaintext bytes made it through the
    ///  path, so the path supports that payload in both directions. Tell the
    ///  peer (reliable, unordered) and raise our own budget.
    async fn on_mtu_probe(&self, observed: usize, now: u32) {
        debug!("MTU probe observed: {} plaintext bytes", observed);
        self.raise_max_payload_bytes(observed as u32);

        let cap: u16 = observed.min(u16::MAX as usize) as u16;
        let _ = self
            .write_reliable_sop(StreamMode::Unordered, SuperOpcode::MtuSet, &cap.to_le_bytes(), now)
            .await;
    }

    fn handle_mtu_set(&self, data: &[u8]) {
        if data.len() != 2 {
            trace!("malformed MTU_SET - ignoring");
            return;
        }
        let cap = u16::from_le_bytes([data[0], data[1]]) as u32;
        debug!("MTU_SET: payload cap {}", cap);
        self.raise_max_payload_bytes(cap);
    }

    fn note_send(&self, now: u32) {
        self.last_send_ms.store(now, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::buffer_pool::PacketBufferPool;
    use crate::crypto::envelope::{DirectionKeys, SessionCrypto, SessionKeys};
    use crate::message_dispatcher::MockMessageDispatcher;
    use crate::send_pipeline::MockSendSocket;
    use crate::wire::TICK_RATE_MS;
    use parking_lot::Mutex as SyncMutex;

    fn direction() -> DirectionKeys {
        DirectionKeys { cipher_key: [5u8; 32], mac_key: [6u8; 32] }
    }

    struct Harness {
        transport: Transport,
        sent: Arc<SyncMutex<Vec<Vec<u8>>>>,
        messages: Arc<SyncMutex<Vec<(Option<StreamMode>, Vec<u8>)>>>,
        disconnects: Arc<SyncMutex<Vec<u8>>>,
        pongs: Arc<SyncMutex<Vec<(u32, u32, u32)>>>,
    }

    fn harness() -> Harness {
        let sent: Arc<SyncMutex<Vec<Vec<u8>>>> = Arc::new(SyncMutex::new(Vec::new()));
        let sent_in_mock = sent.clone();

        let opener = SessionCrypto::new(SessionKeys { send: direction(), recv: direction() });
        let mut socket = MockSendSocket::new();
        socket.expect_local_addr().return_const(SocketAddr::from(([1, 2, 3, 4], 8)));
        socket.expect_send_packet().returning(move |_, buf| {
            let mut data = buf.to_vec();
            let len = opener.open(&mut data).expect("transport output must authenticate");
            sent_in_mock.lock().push(data[..len].to_vec());
        });

        let messages: Arc<SyncMutex<Vec<(Option<StreamMode>, Vec<u8>)>>> = Arc::new(SyncMutex::new(Vec::new()));
        let messages_in_mock = messages.clone();
        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_message().returning(move |_, stream, msg| {
            messages_in_mock.lock().push((stream, msg));
        });

        let disconnects: Arc<SyncMutex<Vec<u8>>> = Arc::new(SyncMutex::new(Vec::new()));
        let disconnects_in_mock = disconnects.clone();
        let pongs: Arc<SyncMutex<Vec<(u32, u32, u32)>>> = Arc::new(SyncMutex::new(Vec::new()));
        let pongs_in_mock = pongs.clone();

        let mut events = MockControlEvents::new();
        events.expect_on_peer_disconnect().returning(move |reason| {
            disconnects_in_mock.lock().push(reason);
        });
        events.expect_on_time_pong().returning(move |a, b, c| {
            pongs_in_mock.lock().push((a, b, c));
        });

        let crypto = Arc::new(SessionCrypto::new(SessionKeys { send: direction(), recv: direction() }));
        let pool = Arc::new(PacketBufferPool::new(1500, 8));
        let pipeline = Arc::new(SealingPipeline::new(
            Arc::new(socket),
            crypto,
            pool,
            SocketAddr::from(([1, 2, 3, 4], 9)),
        ));

        let transport = Transport::new(pipeline, Arc::new(dispatcher), Arc::new(events), false);
        Harness { transport, sent, messages, disconnects, pongs }
    }

    /// plaintext datagram carrying one reliable DATA message with a full ACK-ID
    fn reliable_datagram(stream: u8, id: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        MessageHeader::new(payload.len(), true, true, SuperOpcode::Data).ser(&mut buf);
        crate::wire::ack_field::ser_ack_id(&mut buf, stream, id, None);
        buf.extend_from_slice(payload);
        buf
    }

    #[tokio::test]
    async fn test_reliable_message_is_dispatched() {
        let h = harness();

        h.transport.on_datagram(&reliable_datagram(1, 0, b"hello"), 5).await;

        assert_eq!(
            h.messages.lock().clone(),
            vec![(Some(StreamMode::Stream1), b"hello".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_out_of_order_datagrams_reorder() {
        let h = harness();

        for (id, byte) in [(4u32, b'4'), (2, b'2'), (3, b'3'), (0, b'0'), (1, b'1')] {
            h.transport.on_datagram(&reliable_datagram(2, id, &[byte]), 5).await;
        }

        let observed: Vec<u8> = h.messages.lock().iter().map(|(_, m)| m[0]).collect();
        assert_eq!(observed, b"01234");
    }

    #[tokio::test]
    async fn test_implicit_follow_on_ids() {
        let h = harness();

        // one datagram, two reliable messages, one ACK-ID field
        let mut buf = Vec::new();
        MessageHeader::new(1, true, true, SuperOpcode::Data).ser(&mut buf);
        crate::wire::ack_field::ser_ack_id(&mut buf, 1, 0, None);
        buf.push(b'a');
        MessageHeader::new(1, false, true, SuperOpcode::Data).ser(&mut buf);
        buf.push(b'b');

        h.transport.on_datagram(&buf, 5).await;

        let observed: Vec<u8> = h.messages.lock().iter().map(|(_, m)| m[0]).collect();
        assert_eq!(observed, b"ab");
    }

    #[tokio::test]
    async fn test_reliable_without_anchor_discards_rest() {
        let h = harness();

        let mut buf = Vec::new();
        MessageHeader::new(1, false, true, SuperOpcode::Data).ser(&mut buf);
        buf.push(b'x');

        h.transport.on_datagram(&buf, 5).await;
        assert!(h.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unreliable_message_has_no_stream() {
        let h = harness();

        let mut buf = Vec::new();
        MessageHeader::new(3, false, false, SuperOpcode::Data).ser(&mut buf);
        buf.extend_from_slice(b"rtm");

        h.transport.on_datagram(&buf, 5).await;
        assert_eq!(h.messages.lock().clone(), vec![(None, b"rtm".to_vec())]);
    }

    #[tokio::test]
    async fn test_time_ping_echoed_as_pong() {
        let h = harness();

        let mut buf = Vec::new();
        MessageHeader::new(4, false, false, SuperOpcode::TimePing).ser(&mut buf);
        buf.extend_from_slice(&1000u32.to_le_bytes());

        h.transport.on_datagram(&buf, 1234).await;

        let sent = h.sent.lock();
        assert_eq!(sent.len(), 1);
        let mut expected = Vec::new();
        MessageHeader::new(8, false, false, SuperOpcode::TimePong).ser(&mut expected);
        expected.extend_from_slice(&1000u32.to_le_bytes());
        expected.extend_from_slice(&1234u32.to_le_bytes());
        assert_eq!(sent[0], expected);
    }

    #[tokio::test]
    async fn test_time_pong_reaches_events() {
        let h = harness();

        let mut buf = Vec::new();
        MessageHeader::new(8, false, false, SuperOpcode::TimePong).ser(&mut buf);
        buf.extend_from_slice(&7u32.to_le_bytes());
        buf.extend_from_slice(&99u32.to_le_bytes());

        h.transport.on_datagram(&buf, 42).await;
        assert_eq!(h.pongs.lock().clone(), vec![(7, 99, 42)]);
    }

    #[tokio::test]
    async fn test_disco_reaches_events() {
        let h = harness();

        let mut buf = Vec::new();
        MessageHeader::new(1, false, false, SuperOpcode::Disco).ser(&mut buf);
        buf.push(3);

        h.transport.on_datagram(&buf, 42).await;
        assert_eq!(h.disconnects.lock().clone(), vec![3]);
    }

    #[tokio::test]
    async fn test_mtu_probe_raises_budget_and_replies() {
        let h = harness();
        let before = h.transport.max_payload_bytes();

        let mut buf = Vec::new();
        MessageHeader::new(1398, false, false, SuperOpcode::MtuProbe).ser(&mut buf);
        buf.resize(1400, 0);

        h.transport.on_datagram(&buf, 42).await;
        h.transport.tick(42).await;

        assert!(h.transport.max_payload_bytes() > before);
        assert_eq!(h.transport.max_payload_bytes(), 1400);

        // the reply is a reliable unordered MTU_SET carrying the cap
        let sent = h.sent.lock();
        assert!(!sent.is_empty());
        let datagram = sent.last().unwrap();
        let mut read: &[u8] = datagram;
        let header = MessageHeader::deser(&mut read).unwrap();
        assert_eq!(header.sop, SuperOpcode::MtuSet);
        assert!(header.reliable);
    }

    #[tokio::test]
    async fn test_mtu_set_is_monotone() {
        let h = harness();
        let initial = h.transport.max_payload_bytes();

        let mut buf = Vec::new();
        MessageHeader::new(2, true, true, SuperOpcode::MtuSet).ser(&mut buf);
        crate::wire::ack_field::ser_ack_id(&mut buf, 0, 0, None);
        buf.extend_from_slice(&1400u16.to_le_bytes());
        h.transport.on_datagram(&buf, 1).await;
        assert_eq!(h.transport.max_payload_bytes(), 1400);

        // a lower cap never shrinks the budget
        let mut buf = Vec::new();
        MessageHeader::new(2, true, true, SuperOpcode::MtuSet).ser(&mut buf);
        crate::wire::ack_field::ser_ack_id(&mut buf, 0, 1, None);
        buf.extend_from_slice(&(initial as u16).to_le_bytes());
        h.transport.on_datagram(&buf, 2).await;
        assert_eq!(h.transport.max_payload_bytes(), 1400);
    }

    #[tokio::test]
    async fn test_tick_emits_ack_for_received_traffic() {
        let h = harness();

        h.transport.on_datagram(&reliable_datagram(1, 0, b"x"), 5).await;
        h.transport.tick(TICK_RATE_MS).await;

        let sent = h.sent.lock();
        assert_eq!(sent.len(), 1);
        let mut read: &[u8] = &sent[0];
        let header = MessageHeader::deser(&mut read).unwrap();
        assert_eq!(header.sop, SuperOpcode::Ack);
        assert!(!header.reliable);

        match crate::wire::ack_field::deser_ack_element(&mut read).unwrap() {
            crate::wire::ack_field::AckElement::Rollup { stream, partial } => {
                assert_eq!(stream, 1);
                assert_eq!(partial, 1);
            }
            other => panic!("expected rollup, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_ack_without_traffic() {
        let h = harness();
        h.transport.tick(TICK_RATE_MS).await;
        assert!(h.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_framing_is_not_fatal() {
        let h = harness();

        // DATALEN pointing past the end
        let mut buf = Vec::new();
        MessageHeader::new(200, false, false, SuperOpcode::Data).ser(&mut buf);
        buf.extend_from_slice(b"short");
        h.transport.on_datagram(&buf, 5).await;
        assert!(h.messages.lock().is_empty());

        // the connection still works
        h.transport.on_datagram(&reliable_datagram(1, 0, b"ok"), 6).await;
        assert_eq!(h.messages.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_write_reliable_roundtrip_through_ack() {
        let h = harness();

        h.transport.write_reliable(StreamMode::Stream1, b"payload", 0).await.unwrap();
        h.transport.tick(0).await;
        assert_eq!(h.sent.lock().len(), 1);

        // retransmission happens while unacknowledged
        h.transport.tick(2 * TICK_RATE_MS).await;
        assert_eq!(h.sent.lock().len(), 2);

        // after an ACK the sent list is empty and nothing retransmits
        let mut ack = Vec::new();
        MessageHeader::new(3, false, false, SuperOpcode::Ack).ser(&mut ack);
        crate::wire::ack_field::ser_rollup(&mut ack, 1, 1);
        h.transport.on_datagram(&ack, 3 * TICK_RATE_MS).await;

        h.transport.tick(10 * TICK_RATE_MS).await;
        assert_eq!(h.sent.lock().len(), 2);
    }

    #[test]
    fn test_initial_payload_bytes() {
        assert_eq!(initial_payload_bytes(false), 576 - 60 - 8 - 11);
        assert_eq!(initial_payload_bytes(true), 576 - 80 - 8 - 11);
    }

    #[test]
    fn test_elapsed_ms() {
        assert_eq!(elapsed_ms(10, 30), Some(20));
        assert_eq!(elapsed_ms(30, 10), None);
        assert_eq!(elapsed_ms(u32::MAX - 5, 10), Some(16));
    }
}
