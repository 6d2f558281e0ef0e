//! The server's connection table: open addressing over a power-of-two slot
//!  array, keyed by peer address with a salted hash. The probe sequence is a
//!  full-period linear-congruential walk, so a lookup terminates at the first
//!  never-collided slot. Slots keep their COLLISION bit after removal so a
//!  probe chain never breaks; the bits are cleared lazily when a freed slot's
//!  successor is observed empty.
//!
//! Freshly inserted connections are additionally chained onto a lock-free
//!  singly linked list (the head CAS word stores `slot_key + 1` so zero can
//!  mean empty) which the tick task drains to learn about new sessions.

use std::hash::Hasher;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHasher;
use tracing::debug;

use crate::connection::Connection;
use crate::wire::{COLLISION_INCREMENTER, COLLISION_MULTIPLIER, HASH_TABLE_SIZE, MAX_POPULATION};

const SLOT_USED: u32 = 1 << 0;
const SLOT_COLLISION: u32 = 1 << 1;

struct Slot {
    flags: AtomicU32,
    /// next element of the insertion list, as `slot_key + 1`; 0 = end
    next_inserted_key1: AtomicU32,
    conn: RwLock<Option<Arc<Connection>>>,
}

pub struct ConnectionMap {
    hash_salt: u64,
    slots: Vec<Slot>,
    population: AtomicUsize,
    /// head of the insertion list, as `slot_key + 1`; 0 = empty
    insert_head_key1: AtomicU32,
}

pub enum InsertOutcome {
    Inserted(Arc<Connection>),
    /// the address already holds a live connection
    Existing(Arc<Connection>),
    /// MAX_POPULATION reached
    Full,
}

impl Default for ConnectionMap {
    fn default() -> Self {
        ConnectionMap::new()
    }
}

impl ConnectionMap {
    pub fn new() -> ConnectionMap {
        let mut slots = Vec::with_capacity(HASH_TABLE_SIZE as usize);
        for _ in 0..HASH_TABLE_SIZE {
            slots.push(Slot {
                flags: AtomicU32::new(0),
                next_inserted_key1: AtomicU32::new(0),
                conn: RwLock::new(None),
            });
        }

        ConnectionMap {
            hash_salt: rand::random(),
            slots,
            population: AtomicUsize::new(0),
            insert_head_key1: AtomicU32::new(0),
        }
    }

    pub fn population(&self) -> usize {
        self.population.load(Ordering::Relaxed)
    }

    pub fn is_full(&self) -> bool {
        self.population() >= MAX_POPULATION
    }

    fn hash_addr(&self, addr: SocketAddr) -> u32 {
        let mut hasher = FxHasher::default();
        hasher.write_u64(self.hash_salt);
        match addr.ip().to_canonical() {
            std::net::IpAddr::V4(ip) => hasher.write(&ip.octets()),
            std::net::IpAddr::V6(ip) => hasher.write(&ip.octets()),
        }
        hasher.write_u16(addr.port());
        (hasher.finish() as u32) & (HASH_TABLE_SIZE - 1)
    }

    fn next_collision_key(key: u32) -> u32 {
        key.wrapping_mul(COLLISION_MULTIPLIER)
            .wrapping_add(COLLISION_INCREMENTER)
            & (HASH_TABLE_SIZE - 1)
    }

    pub fn get(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        let mut key = self.hash_addr(addr);
        loop {
            let slot = &self.slots[key as usize];
            let flags = slot.flags.load(Ordering::Acquire);

            if flags & SLOT_USED != 0 {
                if let Some(conn) = slot.conn.read().as_ref() {
                    if conn.peer_addr == addr {
                        return Some(conn.clone());
                    }
                }
            }
            if flags & SLOT_COLLISION == 0 {
                return None;
            }
            key = Self::next_collision_key(key);
        }
    }

    /// Insert a connection for `addr`, constructing it only once a slot key
    ///  is claimed. Insertions happen on the single handshake task; lookups
    ///  and removals may run concurrently.
    pub fn insert(
        &self,
        addr: SocketAddr,
        make_conn: impl FnOnce(u32) -> Arc<Connection>,
    ) -> InsertOutcome {
        if self.is_full() {
            return InsertOutcome::Full;
        }

        let mut probe_path = Vec::new();
        let mut key = self.hash_addr(addr);

        let claimed_key = loop {
            let slot = &self.slots[key as usize];
            let flags = slot.flags.load(Ordering::Acquire);

            if flags & SLOT_USED != 0 {
                if let Some(conn) = slot.conn.read().as_ref() {
                    if conn.peer_addr == addr {
                        return InsertOutcome::Existing(conn.clone());
                    }
                }
                probe_path.push(key);
                key = Self::next_collision_key(key);
                continue;
            }
            break key;
        };

        let conn = make_conn(claimed_key);
        let slot = &self.slots[claimed_key as usize];
        *slot.conn.write() = Some(conn.clone());
        slot.flags.fetch_or(SLOT_USED, Ordering::AcqRel);

        // every slot the probe passed over must remember that a chain runs
        //  through it, or a removal there would cut this entry off
        for passed in probe_path {
            self.slots[passed as usize].flags.fetch_or(SLOT_COLLISION, Ordering::AcqRel);
        }

        self.population.fetch_add(1, Ordering::Relaxed);
        self.push_inserted(claimed_key);

        InsertOutcome::Inserted(conn)
    }

    fn push_inserted(&self, key: u32) {
        let slot = &self.slots[key as usize];
        loop {
            let head = self.insert_head_key1.load(Ordering::Acquire);
            slot.next_inserted_key1.store(head, Ordering::Release);
            if self
                .insert_head_key1
                .compare_exchange(head, key + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Unlink and return everything inserted since the last drain. Called by
    ///  the tick task.
    pub fn drain_inserted(&self) -> Vec<Arc<Connection>> {
        let mut result = Vec::new();
        let mut key1 = self.insert_head_key1.swap(0, Ordering::AcqRel);

        while key1 != 0 {
            let slot = &self.slots[(key1 - 1) as usize];
            if let Some(conn) = slot.conn.read().as_ref() {
                result.push(conn.clone());
            }
            key1 = slot.next_inserted_key1.swap(0, Ordering::AcqRel);
        }
        result
    }

    /// Free a slot whose connection was torn down. COLLISION is cleared only
    ///  when the probe successor shows no chain can run through here.
    pub fn free_slot(&self, key: u32) {
        let slot = &self.slots[key as usize];
        *slot.conn.write() = None;
        slot.flags.fetch_and(!SLOT_USED, Ordering::AcqRel);
        self.population.fetch_sub(1, Ordering::Relaxed);

        let successor = &self.slots[Self::next_collision_key(key) as usize];
        if successor.flags.load(Ordering::Acquire) & (SLOT_USED | SLOT_COLLISION) == 0 {
            slot.flags.fetch_and(!SLOT_COLLISION, Ordering::AcqRel);
        }

        debug!("freed connection slot {}", key);
    }

    /// The probe walk visits every slot exactly once before repeating.
    #[cfg(test)]
    fn probe_is_full_period() -> bool {
        let mut seen = vec![false; HASH_TABLE_SIZE as usize];
        let mut key = 0u32;
        for _ in 0..HASH_TABLE_SIZE {
            if seen[key as usize] {
                return false;
            }
            seen[key as usize] = true;
            key = Self::next_collision_key(key);
        }
        true
    }
}
