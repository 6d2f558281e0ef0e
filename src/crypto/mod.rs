//! The cryptographic boundary of the protocol: the per-datagram envelope with
//!  its replay filter, the stateless handshake cookie, and the key agreement
//!  that turns a challenge/answer exchange into per-direction session keys.
//!
//! The primitives themselves (ChaCha12, HMAC-MD5, HMAC-SHA-256, X25519) are
//!  opaque to the rest of the crate; everything above this module sees only
//!  sealed/opened buffers and derived key material.

pub mod cookie;
pub mod envelope;
pub mod keys;
pub mod replay;
