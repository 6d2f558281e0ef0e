//! The authenticated-encryption envelope around every session datagram:
//!
//! ```ascii
//! ciphertext || MAC(8 bytes) || IV(3 bytes)
//! ```
//!
//! The cipher is ChaCha12 keyed per direction, the MAC is HMAC-MD5 over the
//!  ciphertext truncated to 8 bytes, and the IV is the low 24 bits of a
//!  monotonically increasing per-direction counter. Verification failures are
//!  silent: the caller gets `None` and the datagram vanishes.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BufMut;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha12;
use hmac::{Hmac, Mac};
use md5::Md5;
use parking_lot::Mutex;
use tracing::trace;

use crate::buffers::fixed_buffer::FixedBuf;
use crate::crypto::replay::ReplayWindow;
use crate::wire::{ENVELOPE_IV_BYTES, ENVELOPE_MAC_BYTES, ENVELOPE_OVERHEAD};

type HmacMd5 = Hmac<Md5>;

/// Key material for one direction of the tunnel.
#[derive(Clone)]
pub struct DirectionKeys {
    pub cipher_key: [u8; 32],
    pub mac_key: [u8; 32],
}

/// Both directions as seen from one endpoint.
pub struct SessionKeys {
    pub send: DirectionKeys,
    pub recv: DirectionKeys,
}

/// Per-connection envelope state: the send IV counter is single-writer, the
///  receive side guards its replay window with a mutex because the I/O path
///  and shutdown can race.
pub struct SessionCrypto {
    send_keys: DirectionKeys,
    next_send_iv: AtomicU64,
    recv_keys: DirectionKeys,
    replay: Mutex<ReplayWindow>,
}

impl SessionCrypto {
    pub fn new(keys: SessionKeys) -> SessionCrypto {
        SessionCrypto {
            send_keys: keys.send,
            // IV 0 is reserved so that a virgin replay window accepts the first datagram
            next_send_iv: AtomicU64::new(1),
            recv_keys: keys.recv,
            replay: Mutex::new(ReplayWindow::new()),
        }
    }

    /// Encrypt the buffer contents in place and append the MAC and IV trailer.
    ///  The buffer must have [ENVELOPE_OVERHEAD] bytes of spare capacity.
    pub fn seal(&self, buf: &mut FixedBuf) {
        let iv = self.next_send_iv.fetch_add(1, Ordering::Relaxed);

        self.apply_cipher(&self.send_keys, iv, buf.as_mut());

        let mut mac = HmacMd5::new_from_slice(&self.send_keys.mac_key)
            .expect("HMAC accepts keys of any length");
        mac.update(buf.as_ref());
        let tag = mac.finalize().into_bytes();

        buf.put_slice(&tag[..ENVELOPE_MAC_BYTES]);
        buf.put_slice(&iv.to_le_bytes()[..ENVELOPE_IV_BYTES]);
    }

    /// Verify and decrypt a received datagram in place. Returns the plaintext
    ///  length, or `None` for anything unauthentic, replayed or malformed.
    pub fn open(&self, data: &mut [u8]) -> Option<usize> {
        if data.len() <= ENVELOPE_OVERHEAD {
            trace!("datagram shorter than envelope overhead - dropping");
            return None;
        }
        let ct_len = data.len() - ENVELOPE_OVERHEAD;

        let iv_low = u32::from_le_bytes([
            data[ct_len + ENVELOPE_MAC_BYTES],
            data[ct_len + ENVELOPE_MAC_BYTES + 1],
            data[ct_len + ENVELOPE_MAC_BYTES + 2],
            0,
        ]);

        let mut replay = self.replay.lock();
        let iv = replay.reconstruct(iv_low);
        if !replay.check(iv) {
            trace!("replayed or out-of-window IV {} - dropping", iv);
            return None;
        }

        let mut mac = HmacMd5::new_from_slice(&self.recv_keys.mac_key)
            .expect("HMAC accepts keys of any length");
        mac.update(&data[..ct_len]);
        if mac
            .verify_truncated_left(&data[ct_len..ct_len + ENVELOPE_MAC_BYTES])
            .is_err()
        {
            trace!("MAC mismatch - dropping");
            return None;
        }

        self.apply_cipher(&self.recv_keys, iv, &mut data[..ct_len]);
        replay.accept(iv);

        Some(ct_len)
    }

    fn apply_cipher(&self, keys: &DirectionKeys, iv: u64, data: &mut [u8]) {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&iv.to_le_bytes());

        let mut cipher = ChaCha12::new((&keys.cipher_key).into(), (&nonce).into());
        cipher.apply_keystream(data);
    }
}
