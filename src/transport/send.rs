//! Send side of the reliable transport: per-stream send queues, the shared
//!  coalescing buffer, fragmentation, retransmission and ACK processing.
//!
//! Ids are assigned at transmit time so they stay dense per stream. A large
//!  message turns into a run of FRAG messages, each with its own id, which is
//!  what lets a selective ACK recover one lost fragment without resending the
//!  rest.

use std::cmp::min;
use std::collections::{BTreeMap, VecDeque};
use std::mem;

use anyhow::bail;
use bytes::{Buf, BufMut};
use tracing::{trace, warn};

use crate::buffers::fixed_buffer::FixedBuf;
use crate::safe_converter::PrecheckedCast;
use crate::send_pipeline::SealingPipeline;
use crate::transport::elapsed_ms;
use crate::wire::ack_field::{deser_ack_element, reconstruct_id, ser_ack_id, AckElement, ROLLUP_BITS};
use crate::wire::message_header::MessageHeader;
use crate::wire::{SuperOpcode, FRAG_THRESHOLD, MAX_DATALEN, MAX_MESSAGE_DATALEN, MIN_RTO_MS, NUM_STREAMS};

/// Sizing always reserves the full three-byte ACK-ID form so a retransmission
///  (which cannot compress) is guaranteed to fit the same payload budget.
const MSG_OVERHEAD: usize = MessageHeader::SERIALIZED_LEN + 3;

struct PendingMessage {
    sop: SuperOpcode,
    data: Vec<u8>,
    /// bytes already emitted as fragments
    offset: usize,
    /// once true, every remaining piece goes out as FRAG
    fragmented: bool,
}

struct SentMessage {
    sop: SuperOpcode,
    /// the exact DATA field as transmitted (including the fragment header on
    ///  a first fragment)
    data: Vec<u8>,
    ts_firstsend: u32,
    ts_lastsend: u32,
    retransmitted: bool,
}

struct StreamSend {
    next_send_id: u32,
    /// highest rollup advertised by the remote receiver
    remote_expected: u32,
    pending: VecDeque<PendingMessage>,
    sent: BTreeMap<u32, SentMessage>,
}

impl StreamSend {
    fn new() -> StreamSend {
        StreamSend {
            next_send_id: 0,
            remote_expected: 0,
            pending: VecDeque::new(),
            sent: BTreeMap::new(),
        }
    }
}

pub struct SendState {
    streams: [StreamSend; NUM_STREAMS],
    wip: Option<FixedBuf>,
    /// the (stream, id) a reliable message appended next would carry without
    ///  a fresh ACK-ID field
    wip_anchor: Option<(u8, u32)>,
    rtt_ms: u32,
}

impl Default for SendState {
    fn default() -> Self {
        SendState::new()
    }
}

impl SendState {
    pub fn new() -> SendState {
        SendState {
            streams: [StreamSend::new(), StreamSend::new(), StreamSend::new(), StreamSend::new()],
            wip: None,
            wip_anchor: None,
            rtt_ms: 0,
        }
    }

    pub fn rtt_ms(&self) -> u32 {
        self.rtt_ms
    }

    /// Queue a reliable message for transmission on a stream.
    pub fn push_reliable(&mut self, stream: u8, sop: SuperOpcode, data: Vec<u8>) -> anyhow::Result<()> {
        if data.len() > MAX_MESSAGE_DATALEN {
            bail!("reliable message of {} bytes exceeds the maximum of {}", data.len(), MAX_MESSAGE_DATALEN);
        }

        self.streams[stream as usize].pending.push_back(PendingMessage {
            sop,
            data,
            offset: 0,
            fragmented: false,
        });
        Ok(())
    }

    /// Move queued messages into the coalescing buffer, fragmenting where
    ///  necessary and posting every datagram that fills up. A final partial
    ///  datagram stays staged for piggybacking until the next flush. Returns
    ///  true if any datagram hit the wire.
    pub async fn transmit_queued(&mut self, pipeline: &SealingPipeline, max_payload: usize, now: u32) -> bool {
        let mut posted = false;
        for s in 0..NUM_STREAMS {
            loop {
                let (remaining, fragmented, total_len) = match self.streams[s].pending.front() {
                    None => break,
                    Some(m) => (m.data.len() - m.offset, m.fragmented, m.data.len()),
                };

                let wip_len = self.wip.as_ref().map(|w| w.len()).unwrap_or(0);
                let room = max_payload.saturating_sub(wip_len);

                if !fragmented && remaining <= MAX_DATALEN && MSG_OVERHEAD + remaining <= room {
                    let msg = self.streams[s].pending.pop_front().expect("peeked above");
                    self.emit_reliable(pipeline, s, msg.sop, msg.data, now);
                    continue;
                }

                // fragment: the first piece carries a 16-bit total-length header
                let frag_hdr_len = if fragmented { 0 } else { 2 };
                let head_space = min(
                    room.saturating_sub(MSG_OVERHEAD + frag_hdr_len),
                    MAX_DATALEN - frag_hdr_len,
                );

                // don't split if the head piece would be tiny, or if flushing
                //  lets the message go out whole instead of leaving a runt
                //  final fragment
                let fits_fresh_whole =
                    !fragmented && remaining <= MAX_DATALEN && MSG_OVERHEAD + remaining <= max_payload;
                let tail = remaining.saturating_sub(head_space);
                if head_space < FRAG_THRESHOLD || (wip_len > 0 && fits_fresh_whole && tail < FRAG_THRESHOLD) {
                    if wip_len == 0 {
                        warn!("payload budget of {} cannot carry a fragment - leaving message queued", max_payload);
                        break;
                    }
                    posted |= self.flush(pipeline, now).await;
                    continue;
                }

                let chunk = min(head_space, remaining);
                let mut data_field = Vec::with_capacity(frag_hdr_len + chunk);
                if !fragmented {
                    let total: u16 = total_len.prechecked_cast();
                    data_field.put_u16_le(total);
                }
                {
                    let msg = self.streams[s].pending.front_mut().expect("peeked above");
                    data_field.extend_from_slice(&msg.data[msg.offset..msg.offset + chunk]);
                    msg.offset += chunk;
                    msg.fragmented = true;
                    if msg.offset == msg.data.len() {
                        self.streams[s].pending.pop_front();
                    }
                }
                self.emit_reliable(pipeline, s, SuperOpcode::Frag, data_field, now);
            }
        }
        posted
    }

    /// Emit one reliable message into the coalescing buffer, assigning the
    ///  next id on the stream and recording it in the sent list. The caller
    ///  has verified that it fits.
    fn emit_reliable(&mut self, pipeline: &SealingPipeline, s: usize, sop: SuperOpcode, data_field: Vec<u8>, now: u32) {
        let id = self.streams[s].next_send_id;
        let base = self.streams[s].remote_expected;
        let needs_anchor = self.wip_anchor != Some((s as u8, id));

        let wip = ensure_wip(&mut self.wip, pipeline);
        MessageHeader::new(data_field.len(), needs_anchor, true, sop).ser(wip);
        if needs_anchor {
            ser_ack_id(wip, s as u8, id, Some(base));
        }
        wip.put_slice(&data_field);

        trace!("stream {}: emitted reliable id {} ({:?}, {} bytes)", s, id, sop, data_field.len());

        self.streams[s].next_send_id += 1;
        self.wip_anchor = Some((s as u8, id + 1));
        self.streams[s].sent.insert(id, SentMessage {
            sop,
            data: data_field,
            ts_firstsend: now,
            ts_lastsend: now,
            retransmitted: false,
        });
    }

    /// Append an unreliable message (DATA, ACK, probes, pings, DISCO) to the
    ///  coalescing buffer, flushing first if it does not fit.
    pub async fn append_unreliable(
        &mut self,
        pipeline: &SealingPipeline,
        max_payload: usize,
        sop: SuperOpcode,
        data: &[u8],
        now: u32,
    ) -> anyhow::Result<()> {
        let needed = MessageHeader::SERIALIZED_LEN + data.len();
        if needed > max_payload || data.len() > MAX_DATALEN {
            bail!("unreliable message of {} bytes does not fit the payload budget of {}", data.len(), max_payload);
        }

        let wip_len = self.wip.as_ref().map(|w| w.len()).unwrap_or(0);
        if wip_len + needed > max_payload {
            self.flush(pipeline, now).await;
        }

        let wip = ensure_wip(&mut self.wip, pipeline);
        MessageHeader::new(data.len(), false, false, sop).ser(wip);
        wip.put_slice(data);
        Ok(())
    }

    /// Seal and post the coalescing buffer, if it holds anything. Returns
    ///  true if a datagram was posted.
    pub async fn flush(&mut self, pipeline: &SealingPipeline, _now: u32) -> bool {
        self.wip_anchor = None;
        match self.wip.take() {
            Some(wip) if !wip.is_empty() => {
                pipeline.seal_and_send(wip).await;
                true
            }
            Some(wip) => {
                pipeline.return_buffer(wip);
                false
            }
            None => false,
        }
    }

    /// Retransmit every sent-list entry whose timeout elapsed. Retransmissions
    ///  carry the full ACK-ID form and never share a datagram with fresh
    ///  writes; several due entries may share one. Returns true if any
    ///  datagram hit the wire.
    pub async fn retransmit_due(&mut self, pipeline: &SealingPipeline, max_payload: usize, now: u32) -> bool {
        let rto = self.rtt_ms.saturating_mul(2).max(MIN_RTO_MS);
        let mut posted = false;

        for s in 0..NUM_STREAMS {
            let due: Vec<u32> = self.streams[s]
                .sent
                .iter()
                .filter(|(_, node)| {
                    let since_last = elapsed_ms(node.ts_lastsend, now);
                    since_last.map(|ms| ms >= rto).unwrap_or(false)
                })
                .map(|(&id, _)| id)
                .collect();

            if due.is_empty() {
                continue;
            }

            let mut buf: Option<FixedBuf> = None;
            for id in due {
                let node = self.streams[s].sent.get_mut(&id).expect("id collected above");
                let needed = MSG_OVERHEAD + node.data.len();

                if buf.as_ref().map(|b| b.len() + needed > max_payload).unwrap_or(false) {
                    pipeline.seal_and_send(buf.take().expect("checked above")).await;
                    posted = true;
                }
                let out = ensure_wip(&mut buf, pipeline);

                MessageHeader::new(node.data.len(), true, true, node.sop).ser(out);
                ser_ack_id(out, s as u8, id, None);
                out.put_slice(&node.data);

                trace!("stream {}: retransmitting id {}", s, id);
                node.ts_lastsend = now;
                node.retransmitted = true;
            }
            if let Some(buf) = buf {
                pipeline.seal_and_send(buf).await;
                posted = true;
            }
        }
        posted
    }

    /// Apply a received ACK payload: advance rollups, prune the sent lists,
    ///  and refresh the RTT estimate from the newest never-retransmitted
    ///  acknowledgment.
    pub fn process_ack(&mut self, payload: &[u8], now: u32) {
        let mut buf = payload;
        let mut block: Option<usize> = None;
        let mut block_valid = false;
        let mut last_id = 0u32;
        let mut rtt_candidate: Option<(u32, u32)> = None;

        while buf.has_remaining() {
            let element = match deser_ack_element(&mut buf) {
                Ok(element) => element,
                Err(_) => {
                    trace!("malformed ACK payload - dropping the rest");
                    break;
                }
            };

            match element {
                AckElement::Rollup { stream, partial } => {
                    let st = &mut self.streams[stream as usize];
                    let rollup = reconstruct_id(st.remote_expected, partial, ROLLUP_BITS);

                    block = Some(stream as usize);
                    last_id = rollup;

                    // rollups only ever advance; anything else is stale or forged
                    if rollup < st.remote_expected || rollup > st.next_send_id {
                        trace!("stream {}: ignoring rollup {} outside [{}, {}]", stream, rollup, st.remote_expected, st.next_send_id);
                        block_valid = false;
                        continue;
                    }
                    block_valid = true;
                    st.remote_expected = rollup;

                    let keep = st.sent.split_off(&rollup);
                    let acked = mem::replace(&mut st.sent, keep);
                    for (id, node) in acked {
                        track_rtt_candidate(&mut rtt_candidate, id, &node);
                    }
                }
                AckElement::Range { start_delta, end_delta } => {
                    let Some(stream) = block else {
                        trace!("ACK range before any rollup - dropping the rest");
                        break;
                    };
                    let start = last_id.wrapping_add(start_delta);
                    let end = start.wrapping_add(end_delta.unwrap_or(0));
                    last_id = end;

                    if !block_valid {
                        continue;
                    }
                    let st = &mut self.streams[stream];
                    let end = min(end, st.next_send_id);
                    for id in start..=end {
                        if let Some(node) = st.sent.remove(&id) {
                            track_rtt_candidate(&mut rtt_candidate, id, &node);
                        }
                    }
                }
            }
        }

        if let Some((_, ts_firstsend)) = rtt_candidate {
            if let Some(sample) = elapsed_ms(ts_firstsend, now) {
                self.rtt_ms = if self.rtt_ms == 0 {
                    sample
                } else {
                    (3 * self.rtt_ms + sample) / 4
                };
            }
        }
    }

    #[cfg(test)]
    fn sent_ids(&self, stream: usize) -> Vec<u32> {
        self.streams[stream].sent.keys().cloned().collect()
    }
}

fn ensure_wip<'a>(wip: &'a mut Option<FixedBuf>, pipeline: &SealingPipeline) -> &'a mut FixedBuf {
    if wip.is_none() {
        *wip = Some(pipeline.get_buffer());
    }
    wip.as_mut().expect("just initialized")
}

fn track_rtt_candidate(candidate: &mut Option<(u32, u32)>, id: u32, node: &SentMessage) {
    if node.retransmitted {
        return;
    }
    if candidate.map(|(best_id, _)| id > best_id).unwrap_or(true) {
        *candidate = Some((id, node.ts_firstsend));
    }
}
