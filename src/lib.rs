//! Sphynx is a secure, connection-oriented transport on top of UDP for small,
//!  latency-sensitive workloads. A single socket pair carries an encrypted
//!  handshake, four multiplexed reliable streams plus unreliable messages,
//!  MTU discovery, RTT estimation and clock synchronization.
//!
//! ## Design goals
//!
//! * Replace TLS-over-TCP where head-of-line blocking across unrelated
//!   messages is unacceptable (games, realtime interactive applications)
//! * At-most-once reliable delivery with in-stream ordering; no ordering
//!   across streams, no congestion control beyond retransmission
//! * Bounded memory and O(1) state on every unauthenticated code path, so a
//!   spoofed flood cannot allocate or amplify
//! * Minimal allocation on the per-datagram hot path (pooled fixed buffers,
//!   one coalescing buffer per connection)
//! * Sessions migrate from the public handshake port to a per-session worker
//!   port, keeping the public port cheap and stateless
//!
//! ## Packet format on top of the UDP payload
//!
//! ```ascii
//! E { HDR(2 bytes)|DATA || HDR(2 bytes)|DATA || ... } || MAC(8 bytes) || IV(3 bytes)
//!
//! E: ChaCha12 stream cipher, keyed per direction.
//! MAC: truncated HMAC-MD5 over the ciphertext.
//! IV: low 24 bits of a monotonically increasing per-direction counter;
//!     the receiver reconstructs the high bits against a sliding replay
//!     window.
//! ```
//!
//! Each message inside the plaintext:
//!
//! ```ascii
//! --- Message Header  (16 bits LE) ---
//!  0 1 2 3 4 5 6 7 8 9 a b c d e f
//! <-- LSB ----------------- MSB -->
//! |   DATA_BYTES(11)    |I|R| SOP |
//! ---------------------------------
//!
//! DATA_BYTES: bytes in the data part (includes the fragment header when
//!             present, never the ACK-ID field).
//! I: 1 = an ACK-ID field precedes the data; it applies to this and every
//!        following reliable message until a new ACK-ID is seen.
//! R: 1 = reliable.
//! SOP: 0=DATA 1=FRAG 2=ACK 3=MTU_PROBE 4=MTU_SET 5=TIME_PING 6=TIME_PONG
//!      7=DISCO
//!
//! ------------- ACK-ID Field (1-3 bytes) ----------
//!  0 1 2 3 4 5 6 7 8 9 a b c d e f 0 1 2 3 4 5 6 7
//! <-- LSB --------------------------------- MSB -->
//! |  IDA(5) | S |C|    IDB(7)   |C|    IDC(8)     |
//! --------------------------------------------------
//!
//! C: 1 = continues into the next byte.
//! S: stream selector; 0 = unordered, 1-3 = ordered.
//! ID: IDC|IDB|IDA, up to 20 transmitted bits; the receiver reconstructs the
//!     full id nearest to its decompression base. Retransmissions always use
//!     the full three-byte form because the remote base is unknown.
//!
//! --- Fragment Header (16 bits LE) ---
//! |        TOTAL_BYTES(16)        |
//! ------------------------------------
//!
//! Present only on the first fragment of a message; every fragment consumes
//! its own ACK-ID so selective ACKs can recover a single lost piece.
//! ```
//!
//! ACK message data (super-opcode ACK, unreliable):
//!
//! ```ascii
//! ROLLUP(3) [ || RANGE_START(1-3) [ || RANGE_END(1-3) ] ]*  per touched stream
//!
//! ROLLUP: the next expected id on a stream; acknowledges every lower id.
//!         Byte 0 carries a 1 in bit 0 (distinguishing it from a RANGE
//!         start), the stream in bits 1-2, id bits 0-4 in bits 3-7; bytes
//!         1-2 carry id bits 5-20.
//! RANGE_START: delta to the last id emitted in this message; bit 1 of byte
//!         0 flags a following RANGE_END (delta to the range start).
//!         Negative acknowledgment is inferred from the holes.
//! ```
//!
//! ## Handshake
//!
//! ```ascii
//! C2S_HELLO     { magic, server public key echo (64) }
//! S2C_COOKIE    { cookie(4) }                      -- no server state
//! C2S_CHALLENGE { magic, cookie(4), challenge(64) }
//! S2C_ANSWER    { session port(2 LE), answer(128) }
//! S2C_ERROR     { code(1) }
//! ```
//!
//! The cookie proves the client owns its source address before the server
//!  spends memory or elliptic-curve CPU; the answer to the first challenge
//!  per address is cached so replays are free. The answer reveals the worker
//!  port the session migrates to.
//!
//! ## Concurrency model
//!
//! Each endpoint runs an I/O completion path (one task per socket, driving
//!  AEAD verification, framing and dispatch) and a tick task waking every
//!  [wire::TICK_RATE_MS] to retransmit, flush ACKs, schedule MTU probes and
//!  time pings, and detect the 15-second silence timeout. Per-connection
//!  send and receive state sit behind separate async mutexes; the published
//!  clock-sync triple and the cookie salts use plain mutexes.

pub mod buffers;
pub mod client;
pub mod config;
pub mod conn_map;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod message_dispatcher;
pub mod safe_converter;
pub mod send_pipeline;
pub mod server;
pub mod time_sync;
pub mod transport;
pub mod wire;

pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use error::{ConnectError, HandshakeError};
pub use message_dispatcher::MessageDispatcher;
pub use server::Server;
pub use wire::StreamMode;
