//! Receive side of the reliable transport: per-stream in-order gating,
//!  fragment reassembly and ACK payload generation.
//!
//! Ordered streams buffer out-of-order messages in an id-keyed map and drain
//!  contiguous runs as gaps fill. The unordered stream delivers immediately
//!  and only remembers which ids above the contiguous prefix it has seen, so
//!  duplicate suppression and ACK range math work the same way on every
//!  stream.

use std::collections::{BTreeMap, BTreeSet};

use bytes::BufMut;
use tracing::{trace, warn};

use crate::safe_converter::SafeCast;
use crate::wire::ack_field::{ser_range, ser_rollup};
use crate::wire::{SuperOpcode, NUM_STREAMS};

/// A message handed up by the receive path once ordering and reassembly are
///  done. `MtuSet` deliveries are consumed by the transport itself.
#[derive(Debug, PartialEq, Eq)]
pub struct Delivery {
    pub stream: u8,
    pub sop: SuperOpcode,
    pub data: Vec<u8>,
}

/// Ids further than this ahead of the contiguous prefix are dropped; loss
///  recovery never needs more, and it caps queue memory per stream.
const RECV_WINDOW: u32 = 4096;

struct QueuedMessage {
    sop: SuperOpcode,
    is_frag: bool,
    data: Vec<u8>,
}

struct FragmentAssembly {
    total: usize,
    buf: Vec<u8>,
}

struct StreamRecv {
    unordered: bool,
    next_expected: u32,
    got_reliable: bool,
    /// out-of-order messages above `next_expected` awaiting their gap; on the
    ///  unordered stream only fragments are held back
    queue: BTreeMap<u32, QueuedMessage>,
    /// unordered stream only: ids already delivered above `next_expected`
    delivered_ahead: BTreeSet<u32>,
    frag: Option<FragmentAssembly>,
}

impl StreamRecv {
    fn new(unordered: bool) -> StreamRecv {
        StreamRecv {
            unordered,
            next_expected: 0,
            got_reliable: false,
            queue: BTreeMap::new(),
            delivered_ahead: BTreeSet::new(),
            frag: None,
        }
    }

    fn on_reliable(&mut self, stream: u8, id: u32, sop: SuperOpcode, is_frag: bool, data: &[u8], out: &mut Vec<Delivery>) {
        // any reliable traffic schedules an ACK, including duplicates (the
        //  remote is retransmitting because our previous ACK got lost)
        self.got_reliable = true;

        if id < self.next_expected {
            trace!("stream {}: dropping already-delivered id {}", stream, id);
            return;
        }
        if id - self.next_expected >= RECV_WINDOW {
            // bounds queue memory against a hostile or broken sender
            warn!("stream {}: id {} is {} ahead of the window - dropping", stream, id, id - self.next_expected);
            return;
        }

        if self.unordered && !is_frag {
            if id == self.next_expected {
                self.next_expected += 1;
                out.push(Delivery { stream, sop, data: data.to_vec() });
                self.drain(stream, out);
            } else if self.delivered_ahead.insert(id) {
                out.push(Delivery { stream, sop, data: data.to_vec() });
            } else {
                trace!("stream {}: dropping duplicate out-of-order id {}", stream, id);
            }
            return;
        }

        if id == self.next_expected {
            self.next_expected += 1;
            self.handle_in_order(stream, sop, is_frag, data, out);
            self.drain(stream, out);
        } else {
            self.queue.entry(id).or_insert_with(|| QueuedMessage {
                sop,
                is_frag,
                data: data.to_vec(),
            });
        }
    }

    /// advance `next_expected` over everything that became contiguous
    fn drain(&mut self, stream: u8, out: &mut Vec<Delivery>) {
        loop {
            if self.delivered_ahead.remove(&self.next_expected) {
                self.next_expected += 1;
                continue;
            }
            match self.queue.remove(&self.next_expected) {
                Some(msg) => {
                    self.next_expected += 1;
                    self.handle_in_order(stream, msg.sop, msg.is_frag, &msg.data, out);
                }
                None => return,
            }
        }
    }

    fn handle_in_order(&mut self, stream: u8, sop: SuperOpcode, is_frag: bool, data: &[u8], out: &mut Vec<Delivery>) {
        if !is_frag {
            out.push(Delivery { stream, sop, data: data.to_vec() });
            return;
        }
        self.feed_fragment(stream, data, out);
    }

    fn feed_fragment(&mut self, stream: u8, data: &[u8], out: &mut Vec<Delivery>) {
        match &mut self.frag {
            None => {
                // first fragment carries the 16-bit total length of the
                //  reassembled message
                if data.len() < 2 {
                    warn!("stream {}: first fragment shorter than its header - discarding", stream);
                    return;
                }
                let total = u16::from_le_bytes([data[0], data[1]]).safe_cast();
                let rest = &data[2..];

                if rest.len() >= total {
                    out.push(Delivery { stream, sop: SuperOpcode::Data, data: rest[..total].to_vec() });
                } else {
                    let mut buf = Vec::with_capacity(total);
                    buf.extend_from_slice(rest);
                    self.frag = Some(FragmentAssembly { total, buf });
                }
            }
            Some(assembly) => {
                if assembly.buf.len() + data.len() > assembly.total {
                    // a fresh first-fragment supersedes the unfinished assembly
                    warn!("stream {}: fragment exceeds declared total - discarding partial assembly", stream);
                    self.frag = None;
                    self.feed_fragment(stream, data, out);
                    return;
                }

                assembly.buf.extend_from_slice(data);
                if assembly.buf.len() == assembly.total {
                    let assembly = self.frag.take().expect("assembly is present");
                    out.push(Delivery { stream, sop: SuperOpcode::Data, data: assembly.buf });
                }
            }
        }
    }

    /// ids above `next_expected` that have arrived, in order
    fn ids_ahead(&self) -> impl Iterator<Item = u32> + '_ {
        let queued = self.queue.keys().cloned();
        let delivered = self.delivered_ahead.iter().cloned();

        let mut merged: Vec<u32> = queued.chain(delivered).collect();
        merged.sort_unstable();
        merged.into_iter()
    }
}

pub struct RecvState {
    streams: [StreamRecv; NUM_STREAMS],
}

/// Keep ACK messages comfortably inside a single minimum-MTU datagram.
const MAX_ACK_PAYLOAD_BYTES: usize = 400;

impl Default for RecvState {
    fn default() -> Self {
        RecvState::new()
    }
}

impl RecvState {
    pub fn new() -> RecvState {
        RecvState {
            streams: [
                StreamRecv::new(true),
                StreamRecv::new(false),
                StreamRecv::new(false),
                StreamRecv::new(false),
            ],
        }
    }

    pub fn next_expected(&self, stream: u8) -> u32 {
        self.streams[stream as usize].next_expected
    }

    pub fn on_reliable(&mut self, stream: u8, id: u32, sop: SuperOpcode, is_frag: bool, data: &[u8], out: &mut Vec<Delivery>) {
        self.streams[stream as usize].on_reliable(stream, id, sop, is_frag, data, out);
    }

    /// True if reliable traffic arrived since the last ACK was emitted.
    pub fn ack_pending(&self) -> bool {
        self.streams.iter().any(|s| s.got_reliable)
    }

    /// Build the data part of an ACK message: per touched stream a ROLLUP
    ///  followed by delta-compressed ranges for the out-of-order ids, then
    ///  clear the pending flags.
    pub fn build_ack_payload(&mut self) -> Option<Vec<u8>> {
        if !self.ack_pending() {
            return None;
        }

        let mut payload: Vec<u8> = Vec::new();
        for stream_index in 0..NUM_STREAMS {
            let stream = &mut self.streams[stream_index];
            if !stream.got_reliable {
                continue;
            }
            stream.got_reliable = false;

            ser_rollup(&mut payload, stream_index as u8, stream.next_expected);

            let mut last_id = stream.next_expected;
            let mut run: Option<(u32, u32)> = None;
            for id in stream.ids_ahead() {
                match &mut run {
                    Some((_, end)) if id == *end + 1 => *end = id,
                    Some((start, end)) => {
                        Self::emit_range(&mut payload, &mut last_id, *start, *end);
                        run = Some((id, id));
                    }
                    None => run = Some((id, id)),
                }
                if payload.len() > MAX_ACK_PAYLOAD_BYTES {
                    break;
                }
            }
            if let Some((start, end)) = run {
                Self::emit_range(&mut payload, &mut last_id, start, end);
            }
        }

        Some(payload)
    }

    fn emit_range(payload: &mut impl BufMut, last_id: &mut u32, start: u32, end: u32) {
        let start_delta = start - *last_id;
        let end_delta = (end > start).then(|| end - start);
        ser_range(payload, start_delta, end_delta);
        *last_id = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ack_field::{deser_ack_element, AckElement};
    use rstest::rstest;

    fn data_of(out: &[Delivery]) -> Vec<(u8, Vec<u8>)> {
        out.iter().map(|d| (d.stream, d.data.clone())).collect()
    }

    fn reliable(state: &mut RecvState, stream: u8, id: u32, data: &[u8], out: &mut Vec<Delivery>) {
        state.on_reliable(stream, id, SuperOpcode::Data, false, data, out);
    }

    fn frag(state: &mut RecvState, stream: u8, id: u32, data: &[u8], out: &mut Vec<Delivery>) {
        state.on_reliable(stream, id, SuperOpcode::Frag, true, data, out);
    }

    #[test]
    fn test_in_order_delivery() {
        let mut state = RecvState::new();
        let mut out = Vec::new();

        reliable(&mut state, 1, 0, b"a", &mut out);
        reliable(&mut state, 1, 1, b"b", &mut out);

        assert_eq!(data_of(&out), vec![(1, b"a".to_vec()), (1, b"b".to_vec())]);
        assert_eq!(state.next_expected(1), 2);
    }

    #[test]
    fn test_out_of_order_is_reordered() {
        let mut state = RecvState::new();
        let mut out = Vec::new();

        // ids 5,3,4,1,2 after 0; application must observe 0..=5 in order
        for (id, byte) in [(0u32, b'0'), (5, b'5'), (3, b'3'), (4, b'4'), (1, b'1'), (2, b'2')] {
            reliable(&mut state, 2, id, &[byte], &mut out);
        }

        let observed: Vec<u8> = out.iter().map(|d| d.data[0]).collect();
        assert_eq!(observed, b"012345");
        assert_eq!(state.next_expected(2), 6);
    }

    #[test]
    fn test_duplicates_are_suppressed() {
        let mut state = RecvState::new();
        let mut out = Vec::new();

        reliable(&mut state, 1, 0, b"x", &mut out);
        reliable(&mut state, 1, 0, b"x", &mut out);
        reliable(&mut state, 1, 2, b"z", &mut out);
        reliable(&mut state, 1, 2, b"z", &mut out);
        reliable(&mut state, 1, 1, b"y", &mut out);

        let observed: Vec<u8> = out.iter().map(|d| d.data[0]).collect();
        assert_eq!(observed, b"xyz");
    }

    #[test]
    fn test_unordered_stream_delivers_immediately() {
        let mut state = RecvState::new();
        let mut out = Vec::new();

        reliable(&mut state, 0, 3, b"late", &mut out);
        assert_eq!(data_of(&out), vec![(0, b"late".to_vec())]);

        // duplicates of the out-of-order id are still suppressed
        reliable(&mut state, 0, 3, b"late", &mut out);
        assert_eq!(out.len(), 1);

        // rollup math advances once the gap closes
        reliable(&mut state, 0, 0, b"a", &mut out);
        reliable(&mut state, 0, 1, b"b", &mut out);
        reliable(&mut state, 0, 2, b"c", &mut out);
        assert_eq!(state.next_expected(0), 4);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_fragment_reassembly() {
        let mut state = RecvState::new();
        let mut out = Vec::new();

        let total = 10u16.to_le_bytes();
        let mut first = total.to_vec();
        first.extend_from_slice(b"abcd");

        frag(&mut state, 1, 0, &first, &mut out);
        assert!(out.is_empty());

        frag(&mut state, 1, 1, b"efgh", &mut out);
        assert!(out.is_empty());

        frag(&mut state, 1, 2, b"ij", &mut out);
        assert_eq!(data_of(&out), vec![(1, b"abcdefghij".to_vec())]);
        assert_eq!(state.next_expected(1), 3);
    }

    #[test]
    fn test_fragments_reassemble_out_of_order_arrival() {
        let mut state = RecvState::new();
        let mut out = Vec::new();

        let mut first = 6u16.to_le_bytes().to_vec();
        first.extend_from_slice(b"ab");

        frag(&mut state, 2, 1, b"cd", &mut out);
        frag(&mut state, 2, 2, b"ef", &mut out);
        assert!(out.is_empty());

        frag(&mut state, 2, 0, &first, &mut out);
        assert_eq!(data_of(&out), vec![(2, b"abcdef".to_vec())]);
    }

    #[test]
    fn test_unordered_fragments_wait_for_order() {
        let mut state = RecvState::new();
        let mut out = Vec::new();

        // stream 0 fragments still reassemble in id order
        frag(&mut state, 0, 1, b"cd", &mut out);
        assert!(out.is_empty());

        let mut first = 4u16.to_le_bytes().to_vec();
        first.extend_from_slice(b"ab");
        frag(&mut state, 0, 0, &first, &mut out);

        assert_eq!(data_of(&out), vec![(0, b"abcd".to_vec())]);
    }

    #[test]
    fn test_oversized_fragment_discards_partial() {
        let mut state = RecvState::new();
        let mut out = Vec::new();

        let mut first = 4u16.to_le_bytes().to_vec();
        first.extend_from_slice(b"ab");
        frag(&mut state, 1, 0, &first, &mut out);

        // a second first-fragment (too big to continue the assembly) replaces it
        let mut second = 3u16.to_le_bytes().to_vec();
        second.extend_from_slice(b"xyz");
        frag(&mut state, 1, 1, &second, &mut out);

        assert_eq!(data_of(&out), vec![(1, b"xyz".to_vec())]);
    }

    #[test]
    fn test_far_ahead_ids_are_dropped() {
        let mut state = RecvState::new();
        let mut out = Vec::new();

        reliable(&mut state, 1, RECV_WINDOW + 10, b"too far", &mut out);
        assert!(out.is_empty());

        // the drop still schedules an ACK so the sender re-learns the rollup
        assert!(state.ack_pending());

        reliable(&mut state, 1, 0, b"in window", &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_zero_length_message_roundtrips() {
        let mut state = RecvState::new();
        let mut out = Vec::new();

        reliable(&mut state, 1, 0, b"", &mut out);
        assert_eq!(data_of(&out), vec![(1, vec![])]);
    }

    #[rstest]
    #[case::no_traffic(false)]
    #[case::with_traffic(true)]
    fn test_ack_pending(#[case] with_traffic: bool) {
        let mut state = RecvState::new();
        if with_traffic {
            reliable(&mut state, 1, 0, b"x", &mut Vec::new());
        }
        assert_eq!(state.ack_pending(), with_traffic);
    }

    #[test]
    fn test_ack_payload_rollup_only() {
        let mut state = RecvState::new();
        reliable(&mut state, 1, 0, b"a", &mut Vec::new());
        reliable(&mut state, 1, 1, b"b", &mut Vec::new());

        let payload = state.build_ack_payload().unwrap();
        let mut read: &[u8] = &payload;
        assert_eq!(deser_ack_element(&mut read).unwrap(), AckElement::Rollup { stream: 1, partial: 2 });
        assert!(read.is_empty());

        // flags were cleared
        assert!(state.build_ack_payload().is_none());
    }

    #[test]
    fn test_ack_payload_with_ranges() {
        let mut state = RecvState::new();
        let mut out = Vec::new();

        reliable(&mut state, 2, 0, b"a", &mut out);
        reliable(&mut state, 2, 3, b"d", &mut out);
        reliable(&mut state, 2, 4, b"e", &mut out);
        reliable(&mut state, 2, 7, b"h", &mut out);

        let payload = state.build_ack_payload().unwrap();
        let mut read: &[u8] = &payload;

        assert_eq!(deser_ack_element(&mut read).unwrap(), AckElement::Rollup { stream: 2, partial: 1 });
        // run 3..=4 relative to rollup id 1, then lone 7 relative to 4
        assert_eq!(deser_ack_element(&mut read).unwrap(), AckElement::Range { start_delta: 2, end_delta: Some(1) });
        assert_eq!(deser_ack_element(&mut read).unwrap(), AckElement::Range { start_delta: 3, end_delta: None });
        assert!(read.is_empty());
    }

    #[test]
    fn test_ack_payload_covers_multiple_streams() {
        let mut state = RecvState::new();
        let mut out = Vec::new();

        reliable(&mut state, 0, 0, b"a", &mut out);
        reliable(&mut state, 3, 1, b"b", &mut out);

        let payload = state.build_ack_payload().unwrap();
        let mut read: &[u8] = &payload;

        assert_eq!(deser_ack_element(&mut read).unwrap(), AckElement::Rollup { stream: 0, partial: 1 });
        assert_eq!(deser_ack_element(&mut read).unwrap(), AckElement::Rollup { stream: 3, partial: 0 });
        assert_eq!(deser_ack_element(&mut read).unwrap(), AckElement::Range { start_delta: 1, end_delta: None });
        assert!(read.is_empty());
    }

    #[test]
    fn test_unordered_acks_cover_delivered_ahead_ids() {
        let mut state = RecvState::new();
        let mut out = Vec::new();

        reliable(&mut state, 0, 2, b"x", &mut out);
        reliable(&mut state, 0, 3, b"y", &mut out);

        let payload = state.build_ack_payload().unwrap();
        let mut read: &[u8] = &payload;
        assert_eq!(deser_ack_element(&mut read).unwrap(), AckElement::Rollup { stream: 0, partial: 0 });
        assert_eq!(deser_ack_element(&mut read).unwrap(), AckElement::Range { start_delta: 2, end_delta: Some(1) });
    }
}
