//! Elliptic-curve key agreement behind the handshake.
//!
//! The client's CHALLENGE carries an ephemeral X25519 public key and a nonce;
//!  the server's ANSWER carries its own ephemeral public key, a nonce and two
//!  key-confirmation tags. Both sides mix the ephemeral-ephemeral and the
//!  ephemeral-static Diffie-Hellman outputs, both nonces and the configured
//!  session key string into a master secret, then expand per-direction cipher
//!  and MAC keys from it. The confirmation tags let the client reject a forged
//!  answer before any session state is created.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::envelope::{DirectionKeys, SessionKeys};
use crate::wire::{ANSWER_BYTES, CHALLENGE_BYTES, PRIVATE_KEY_BYTES, PUBLIC_KEY_BYTES};

type HmacSha256 = Hmac<Sha256>;

const NONCE_BYTES: usize = 32;
const CONFIRM_BYTES: usize = 32;

/// Session keys for both directions, oriented by protocol role rather than by
///  endpoint. Callers pick their send/recv sides via [Self::for_client] /
///  [Self::for_server].
pub struct DirectionalKeyPair {
    c2s: DirectionKeys,
    s2c: DirectionKeys,
}

impl DirectionalKeyPair {
    pub fn for_client(self) -> SessionKeys {
        SessionKeys { send: self.c2s, recv: self.s2c }
    }

    pub fn for_server(self) -> SessionKeys {
        SessionKeys { send: self.s2c, recv: self.c2s }
    }
}

/// The server's long-term identity: an X25519 static key plus the public blob
///  advertised to clients (public key || SHA-256 key id).
pub struct ServerIdentity {
    secret: StaticSecret,
    public_blob: [u8; PUBLIC_KEY_BYTES],
}

impl ServerIdentity {
    pub fn from_private_key(private_key: &[u8; PRIVATE_KEY_BYTES]) -> ServerIdentity {
        let secret = StaticSecret::from(*private_key);
        let public = PublicKey::from(&secret);

        let mut public_blob = [0u8; PUBLIC_KEY_BYTES];
        public_blob[..32].copy_from_slice(public.as_bytes());
        public_blob[32..].copy_from_slice(&Sha256::digest(public.as_bytes()));

        ServerIdentity { secret, public_blob }
    }

    pub fn generate() -> ServerIdentity {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_private_key(secret.as_bytes())
    }

    pub fn public_blob(&self) -> &[u8; PUBLIC_KEY_BYTES] {
        &self.public_blob
    }

    /// Key-agreement responder: consume a challenge, produce the session keys
    ///  and the 128-byte answer for the wire. Returns `None` for a challenge
    ///  with a degenerate public key; the caller drops the handshake silently.
    pub fn respond(
        &self,
        challenge: &[u8; CHALLENGE_BYTES],
        session_key: &str,
    ) -> Option<(DirectionalKeyPair, [u8; ANSWER_BYTES])> {
        let client_eph_public = PublicKey::from(first_32(&challenge[..32]));
        let client_nonce = &challenge[32..];

        let server_eph_secret = StaticSecret::random_from_rng(OsRng);
        let server_eph_public = PublicKey::from(&server_eph_secret);
        let server_nonce: [u8; NONCE_BYTES] = rand::random();

        let dh_ee = server_eph_secret.diffie_hellman(&client_eph_public);
        let dh_es = self.secret.diffie_hellman(&client_eph_public);
        if !dh_ee.was_contributory() || !dh_es.was_contributory() {
            return None;
        }

        let keys = derive_keys(
            dh_ee.as_bytes(),
            dh_es.as_bytes(),
            client_nonce,
            &server_nonce,
            session_key,
        );

        let mut answer = [0u8; ANSWER_BYTES];
        answer[..32].copy_from_slice(server_eph_public.as_bytes());
        answer[32..64].copy_from_slice(&server_nonce);
        answer[64..96].copy_from_slice(&confirm_tag(&keys.c2s, b"confirm c2s", challenge));
        let s2c_tag = confirm_tag(&keys.s2c, b"confirm s2c", &answer[..64]);
        answer[96..128].copy_from_slice(&s2c_tag);

        Some((keys, answer))
    }
}

/// Key-agreement initiator (client side). Construction validates the server's
///  public blob and fixes the challenge; processing the answer yields the
///  session keys iff both confirmation tags check out.
pub struct KeyAgreementInitiator {
    server_public: PublicKey,
    eph_secret: StaticSecret,
    challenge: [u8; CHALLENGE_BYTES],
}

impl KeyAgreementInitiator {
    pub fn new(server_blob: &[u8; PUBLIC_KEY_BYTES]) -> anyhow::Result<KeyAgreementInitiator> {
        let (public, key_id) = server_blob.split_at(32);
        if Sha256::digest(public).as_slice() != key_id {
            anyhow::bail!("server public key blob has a mismatched key id");
        }

        let eph_secret = StaticSecret::random_from_rng(OsRng);
        let nonce: [u8; NONCE_BYTES] = rand::random();

        let mut challenge = [0u8; CHALLENGE_BYTES];
        challenge[..32].copy_from_slice(PublicKey::from(&eph_secret).as_bytes());
        challenge[32..].copy_from_slice(&nonce);

        Ok(KeyAgreementInitiator {
            server_public: PublicKey::from(first_32(public)),
            eph_secret,
            challenge,
        })
    }

    pub fn challenge(&self) -> &[u8; CHALLENGE_BYTES] {
        &self.challenge
    }

    pub fn process_answer(
        &self,
        answer: &[u8; ANSWER_BYTES],
        session_key: &str,
    ) -> Option<DirectionalKeyPair> {
        let server_eph_public = PublicKey::from(first_32(&answer[..32]));
        let server_nonce = &answer[32..64];

        let dh_ee = self.eph_secret.diffie_hellman(&server_eph_public);
        let dh_es = self.eph_secret.diffie_hellman(&self.server_public);
        if !dh_ee.was_contributory() || !dh_es.was_contributory() {
            return None;
        }

        let keys = derive_keys(
            dh_ee.as_bytes(),
            dh_es.as_bytes(),
            &self.challenge[32..],
            server_nonce,
            session_key,
        );

        let c2s_ok = verify_confirm_tag(&keys.c2s, b"confirm c2s", &self.challenge, &answer[64..96]);
        let s2c_ok = verify_confirm_tag(&keys.s2c, b"confirm s2c", &answer[..64], &answer[96..128]);
        if !(c2s_ok && s2c_ok) {
            return None;
        }

        Some(keys)
    }
}

fn derive_keys(
    dh_ee: &[u8; 32],
    dh_es: &[u8; 32],
    client_nonce: &[u8],
    server_nonce: &[u8],
    session_key: &str,
) -> DirectionalKeyPair {
    let mut hasher = Sha512::new();
    hasher.update(dh_ee);
    hasher.update(dh_es);
    hasher.update(client_nonce);
    hasher.update(server_nonce);
    hasher.update(session_key.as_bytes());
    let master = hasher.finalize();

    DirectionalKeyPair {
        c2s: expand_direction(b"sphynx c2s", &master),
        s2c: expand_direction(b"sphynx s2c", &master),
    }
}

fn expand_direction(label: &[u8], master: &[u8]) -> DirectionKeys {
    let mut hasher = Sha512::new();
    hasher.update(label);
    hasher.update(master);
    let block = hasher.finalize();

    let mut cipher_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    cipher_key.copy_from_slice(&block[..32]);
    mac_key.copy_from_slice(&block[32..]);
    DirectionKeys { cipher_key, mac_key }
}

fn confirm_tag(keys: &DirectionKeys, label: &[u8], transcript: &[u8]) -> [u8; CONFIRM_BYTES] {
    let mut mac = HmacSha256::new_from_slice(&keys.mac_key).expect("HMAC accepts keys of any length");
    mac.update(label);
    mac.update(transcript);
    mac.finalize().into_bytes().into()
}

fn verify_confirm_tag(keys: &DirectionKeys, label: &[u8], transcript: &[u8], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(&keys.mac_key).expect("HMAC accepts keys of any length");
    mac.update(label);
    mac.update(transcript);
    mac.verify_slice(tag).is_ok()
}

fn first_32(slice: &[u8]) -> [u8; 32] {
    slice[..32].try_into().expect("slice is at least 32 bytes")
}
