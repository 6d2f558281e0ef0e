//! Wire-level constants and codecs. The bit layouts documented in `lib.rs` are
//!  normative; all multi-byte integers on the wire are little-endian regardless
//!  of host order.

pub mod ack_field;
pub mod handshake;
pub mod message_header;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Magic constant carried by every handshake packet, little-endian on the wire.
pub const PROTOCOL_MAGIC: u32 = 0xC47D0001;

pub const PUBLIC_KEY_BYTES: usize = 64;
pub const PRIVATE_KEY_BYTES: usize = 32;
pub const CHALLENGE_BYTES: usize = 64;
pub const ANSWER_BYTES: usize = 128;
pub const COOKIE_BYTES: usize = 4;

/// Number of reliable streams (stream 0 is the unordered one).
pub const NUM_STREAMS: usize = 4;

pub const TICK_RATE_MS: u32 = 20;
pub const TIMEOUT_DISCONNECT_MS: u32 = 15_000;

/// Retransmit timeout floor.
pub const MIN_RTO_MS: u32 = 2 * TICK_RATE_MS;

pub const MINIMUM_MTU: u32 = 576;
pub const MEDIUM_MTU: u32 = 1400;
pub const MAXIMUM_MTU: u32 = 1500;

/// IP headers are assumed worst-case (with options) so that the minimum-MTU
///  payload estimate never overshoots the actual path.
pub const IPV4_HEADER_BYTES: u32 = 20 + 40;
pub const IPV6_HEADER_BYTES: u32 = 40 + 40;
pub const UDP_HEADER_BYTES: u32 = 8;

/// Split a message into fragments only if each fragment carries at least this
///  many bytes; otherwise the coalescing buffer is flushed first.
pub const FRAG_THRESHOLD: usize = 32;

/// Upper bound for the data part of a single logical message (the fragment
///  header's total-length field is 16 bits).
pub const MAX_MESSAGE_DATALEN: usize = 65_535;

/// Largest value of the DATALEN header field (11 bits).
pub const MAX_DATALEN: usize = 0x7FF;

pub const TIME_SYNC_FAST_MS: u32 = 5_000;
pub const TIME_SYNC_FAST_COUNT: u32 = 8;
pub const TIME_SYNC_INTERVAL_MS: u32 = 20_000;

pub const MTU_PROBE_INTERVAL_MS: u32 = 5_000;

pub const INITIAL_HELLO_POST_INTERVAL_MS: u32 = 200;
pub const CONNECT_TIMEOUT_MS: u32 = 6_000;

/// A time ping doubles as keep-alive once the connection has been silent for
///  this long.
pub const SILENCE_LIMIT_MS: u32 = 4_111;

pub const MAX_TS_SAMPLES: usize = 16;
pub const MIN_TS_SAMPLES: usize = 3;
pub const MIN_DRIFT_SAMPLES: usize = 4;

pub const HASH_TABLE_SIZE: u32 = 32_768;
pub const MAX_POPULATION: usize = (HASH_TABLE_SIZE / 2) as usize;

// Linear-congruential probe constants ((multiplier - 1) is divisible by all
//  prime factors of the table size and by 4, so the probe sequence visits
//  every slot exactly once).
pub const COLLISION_MULTIPLIER: u32 = 71 * 5861 * 4 + 1;
pub const COLLISION_INCREMENTER: u32 = 1_013_904_223;

/// MAC(8) || IV(3) trailer appended to every sealed datagram.
pub const ENVELOPE_MAC_BYTES: usize = 8;
pub const ENVELOPE_IV_BYTES: usize = 3;
pub const ENVELOPE_OVERHEAD: usize = ENVELOPE_MAC_BYTES + ENVELOPE_IV_BYTES;

/// Disconnect reason posted when the peer went silent past the timeout.
pub const DISCO_TIMEOUT: u8 = 0xFF;

/// The 3-bit classifier in the message header.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SuperOpcode {
    Data = 0,
    Frag = 1,
    Ack = 2,
    MtuProbe = 3,
    MtuSet = 4,
    TimePing = 5,
    TimePong = 6,
    Disco = 7,
}

/// One of four logical reliable channels sharing a single encrypted tunnel.
///  Stream 0 delivers out of order; streams 1-3 deliver in send order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum StreamMode {
    Unordered = 0,
    Stream1 = 1,
    Stream2 = 2,
    Stream3 = 3,
}

/// Handshake packet discriminator (first byte of every handshake packet).
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HandshakeType {
    C2sHello = 0,
    S2cCookie = 1,
    C2sChallenge = 2,
    S2cAnswer = 3,
    S2cError = 4,
}
