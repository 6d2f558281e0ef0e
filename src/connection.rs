//! Server-side per-peer state. A [Connection] is created when a valid
//!  CHALLENGE arrives and lives in the connection map until the tick task
//!  observes its DELETE flag.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::crypto::envelope::SessionCrypto;
use crate::transport::{ControlEvents, Transport};
use crate::wire::handshake::ANSWER_LEN;
use crate::wire::CHALLENGE_BYTES;

/// Recognized by the tick task, part of its sweep list.
pub const FLAG_TIMED: u32 = 1 << 0;
/// Scheduled for teardown; the tick task performs the actual free.
pub const FLAG_DELETE: u32 = 1 << 1;
/// The first authenticated session datagram has been seen.
pub const FLAG_POST_HANDSHAKE: u32 = 1 << 2;

/// Lifecycle state shared between a connection and its transport event hook.
///  The `destroyed` word makes the disconnect path one-shot: whoever wins the
///  CAS performs notification, everyone else backs off.
pub struct Lifecycle {
    flags: AtomicU32,
    destroyed: AtomicBool,
    /// reason code for the eventual on_disconnect notification
    disco_reason: AtomicU32,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::new()
    }
}

impl Lifecycle {
    pub fn new() -> Lifecycle {
        Lifecycle {
            flags: AtomicU32::new(0),
            destroyed: AtomicBool::new(false),
            disco_reason: AtomicU32::new(0),
        }
    }

    /// Returns true iff the flag was not set before.
    pub fn set_flag(&self, flag: u32) -> bool {
        self.flags.fetch_or(flag, Ordering::AcqRel) & flag == 0
    }

    pub fn is_flag_set(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    /// One-shot gate for the disconnect path.
    pub fn begin_destroy(&self) -> bool {
        self.destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Mark for teardown with the reason later reported to the application.
    pub fn schedule_delete(&self, reason: u8) {
        self.disco_reason.store(reason as u32, Ordering::Release);
        self.set_flag(FLAG_DELETE);
    }

    pub fn disco_reason(&self) -> u8 {
        self.disco_reason.load(Ordering::Acquire) as u8
    }
}

pub struct Connection {
    pub peer_addr: SocketAddr,
    /// index of this connection's slot in the connection map
    pub slot_key: u32,
    /// index of the worker socket serving this session
    pub worker_index: usize,
    pub transport: Transport,
    pub crypto: Arc<SessionCrypto>,
    pub lifecycle: Arc<Lifecycle>,
    pub last_recv_ms: AtomicU32,
    /// first challenge seen from this peer address, with the cached ANSWER
    ///  packet; replayed challenges are answered without key agreement
    pub first_challenge: [u8; CHALLENGE_BYTES],
    pub cached_answer_packet: [u8; ANSWER_LEN],
}

impl Connection {
    pub fn note_recv(&self, now: u32) {
        self.last_recv_ms.store(now, Ordering::Relaxed);
    }

    pub fn last_recv_ms(&self) -> u32 {
        self.last_recv_ms.load(Ordering::Relaxed)
    }
}

/// Transport control hook for a server connection: a remote DISCO (or
///  anything terminal) schedules teardown; pongs are a client concern and are
///  ignored here.
pub struct ConnectionEvents {
    lifecycle: Arc<Lifecycle>,
}

impl ConnectionEvents {
    pub fn new(lifecycle: Arc<Lifecycle>) -> ConnectionEvents {
        ConnectionEvents { lifecycle }
    }
}

#[async_trait]
impl ControlEvents for ConnectionEvents {
    async fn on_peer_disconnect(&self, reason: u8) {
        if self.lifecycle.begin_destroy() {
            self.lifecycle.schedule_delete(reason);
        }
    }

    fn on_time_pong(&self, _echoed_local_ms: u32, _server_recv_ms: u32, _now_ms: u32) {
        // the server does not synchronize to its clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_flag_reports_first_setter() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.set_flag(FLAG_TIMED));
        assert!(!lifecycle.set_flag(FLAG_TIMED));
        assert!(lifecycle.is_flag_set(FLAG_TIMED));
        assert!(!lifecycle.is_flag_set(FLAG_DELETE));
    }

    #[test]
    fn test_begin_destroy_is_one_shot() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_destroy());
        assert!(!lifecycle.begin_destroy());
        assert!(lifecycle.is_destroyed());
    }

    #[test]
    fn test_schedule_delete_records_reason() {
        let lifecycle = Lifecycle::new();
        lifecycle.schedule_delete(0xFF);
        assert!(lifecycle.is_flag_set(FLAG_DELETE));
        assert_eq!(lifecycle.disco_reason(), 0xFF);
    }

    #[tokio::test]
    async fn test_events_schedule_teardown_once() {
        let lifecycle = Arc::new(Lifecycle::new());
        let events = ConnectionEvents::new(lifecycle.clone());

        events.on_peer_disconnect(7).await;
        assert!(lifecycle.is_flag_set(FLAG_DELETE));
        assert_eq!(lifecycle.disco_reason(), 7);

        // a second disco must not overwrite the reason
        events.on_peer_disconnect(9).await;
        assert_eq!(lifecycle.disco_reason(), 7);
    }
}
