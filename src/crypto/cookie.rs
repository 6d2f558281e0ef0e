//! Stateless handshake cookies. A cookie is a keyed hash of the peer address
//!  under a server-wide salt; verifying one later proves the peer saw our
//!  reply at that address, without the server storing anything per peer.
//!
//! The salt rotates every [COOKIE_EPOCH]; the previous epoch's salt stays
//!  valid so a client racing a rotation is not penalized. Two epochs is also
//!  the upper bound: a cookie minted before the previous rotation never
//!  verifies again.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;

pub const COOKIE_EPOCH: Duration = Duration::from_secs(60);

struct JarInner {
    current_salt: u128,
    previous_salt: u128,
    rotated_at: Instant,
}

pub struct CookieJar {
    inner: Mutex<JarInner>,
}

impl Default for CookieJar {
    fn default() -> Self {
        CookieJar::new()
    }
}

impl CookieJar {
    pub fn new() -> CookieJar {
        CookieJar {
            inner: Mutex::new(JarInner {
                current_salt: rand::random(),
                previous_salt: rand::random(),
                rotated_at: Instant::now(),
            }),
        }
    }

    /// Called from the server tick; rotates at most one epoch per call, which
    ///  is fine at a 20 ms tick against a 60 s epoch.
    pub fn rotate_if_due(&self) {
        let mut inner = self.inner.lock();
        if inner.rotated_at.elapsed() >= COOKIE_EPOCH {
            self.rotate_locked(&mut inner);
        }
    }

    pub fn generate(&self, addr: SocketAddr) -> u32 {
        let inner = self.inner.lock();
        Self::mac(inner.current_salt, addr)
    }

    pub fn verify(&self, addr: SocketAddr, cookie: u32) -> bool {
        let inner = self.inner.lock();
        cookie == Self::mac(inner.current_salt, addr) || cookie == Self::mac(inner.previous_salt, addr)
    }

    fn rotate_locked(&self, inner: &mut JarInner) {
        inner.previous_salt = inner.current_salt;
        inner.current_salt = rand::random();
        inner.rotated_at = Instant::now();
    }

    #[cfg(test)]
    fn force_rotate(&self) {
        let mut inner = self.inner.lock();
        self.rotate_locked(&mut inner);
    }

    fn mac(salt: u128, addr: SocketAddr) -> u32 {
        let mut mac = Hmac::<Sha256>::new_from_slice(&salt.to_le_bytes())
            .expect("HMAC accepts keys of any length");

        // canonical form so a V4 peer hashes the same through a V6 socket
        match addr.ip().to_canonical() {
            std::net::IpAddr::V4(ip) => mac.update(&ip.octets()),
            std::net::IpAddr::V6(ip) => mac.update(&ip.octets()),
        }
        mac.update(&addr.port().to_le_bytes());

        let tag = mac.finalize().into_bytes();
        u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn addr(s: &str) -> SocketAddr {
        SocketAddr::from_str(s).unwrap()
    }

    #[test]
    fn test_cookie_verifies_for_same_address() {
        let jar = CookieJar::new();
        let peer = addr("10.1.2.3:5555");

        let cookie = jar.generate(peer);
        assert!(jar.verify(peer, cookie));
    }

    #[test]
    fn test_cookie_bound_to_address_and_port() {
        let jar = CookieJar::new();
        let cookie = jar.generate(addr("10.1.2.3:5555"));

        assert!(!jar.verify(addr("10.1.2.4:5555"), cookie));
        assert!(!jar.verify(addr("10.1.2.3:5556"), cookie));
    }

    #[test]
    fn test_cookie_survives_one_rotation() {
        let jar = CookieJar::new();
        let peer = addr("192.168.0.17:40000");

        let cookie = jar.generate(peer);
        jar.force_rotate();
        assert!(jar.verify(peer, cookie));
    }

    #[test]
    fn test_cookie_expires_after_two_rotations() {
        let jar = CookieJar::new();
        let peer = addr("192.168.0.17:40000");

        let cookie = jar.generate(peer);
        jar.force_rotate();
        jar.force_rotate();
        assert!(!jar.verify(peer, cookie));
    }

    #[test]
    fn test_v4_and_mapped_v6_agree() {
        let jar = CookieJar::new();

        let v4 = addr("10.0.0.1:9999");
        let mapped = addr("[::ffff:10.0.0.1]:9999");

        assert_eq!(jar.generate(v4), jar.generate(mapped));
    }

    #[test]
    fn test_forged_cookie_rejected() {
        let jar = CookieJar::new();
        let peer = addr("10.1.2.3:5555");

        let cookie = jar.generate(peer);
        assert!(!jar.verify(peer, cookie.wrapping_add(1)));
    }
}
