//! Codecs for the five cleartext handshake packets. Every packet starts with a
//!  one-byte [HandshakeType]; HELLO and CHALLENGE additionally carry the
//!  protocol magic. Packets that fail to parse are dropped by the caller
//!  without a reply.

use anyhow::bail;
use bytes::{Buf, BufMut};

use crate::wire::{HandshakeType, ANSWER_BYTES, CHALLENGE_BYTES, PROTOCOL_MAGIC, PUBLIC_KEY_BYTES};

pub const HELLO_LEN: usize = 1 + 4 + PUBLIC_KEY_BYTES;
pub const COOKIE_LEN: usize = 1 + 4;
pub const CHALLENGE_LEN: usize = 1 + 4 + 4 + CHALLENGE_BYTES;
pub const ANSWER_LEN: usize = 1 + 2 + ANSWER_BYTES;
pub const ERROR_LEN: usize = 1 + 1;

/// C2S_HELLO: the client opens by echoing the server's public key blob so a
///  server with rotated keys can drop stale clients silently.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub public_key_echo: [u8; PUBLIC_KEY_BYTES],
}
impl Hello {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(HandshakeType::C2sHello.into());
        buf.put_u32_le(PROTOCOL_MAGIC);
        buf.put_slice(&self.public_key_echo);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Hello> {
        expect_type_and_magic(buf, HandshakeType::C2sHello)?;
        let mut public_key_echo = [0u8; PUBLIC_KEY_BYTES];
        try_copy(buf, &mut public_key_echo)?;
        Ok(Hello { public_key_echo })
    }
}

/// S2C_COOKIE: a stateless proof-of-address. The server keeps no per-peer
///  state at this point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cookie {
    pub cookie: u32,
}
impl Cookie {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(HandshakeType::S2cCookie.into());
        buf.put_u32_le(self.cookie);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Cookie> {
        expect_type(buf, HandshakeType::S2cCookie)?;
        Ok(Cookie { cookie: buf.try_get_u32_le()? })
    }
}

/// C2S_CHALLENGE: the echoed cookie plus the client's key-agreement challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    pub cookie: u32,
    pub challenge: [u8; CHALLENGE_BYTES],
}
impl Challenge {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(HandshakeType::C2sChallenge.into());
        buf.put_u32_le(PROTOCOL_MAGIC);
        buf.put_u32_le(self.cookie);
        buf.put_slice(&self.challenge);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Challenge> {
        expect_type_and_magic(buf, HandshakeType::C2sChallenge)?;
        let cookie = buf.try_get_u32_le()?;
        let mut challenge = [0u8; CHALLENGE_BYTES];
        try_copy(buf, &mut challenge)?;
        Ok(Challenge { cookie, challenge })
    }
}

/// S2C_ANSWER: the key-agreement answer plus the per-session port the client
///  must switch to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Answer {
    pub session_port: u16,
    pub answer: [u8; ANSWER_BYTES],
}
impl Answer {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(HandshakeType::S2cAnswer.into());
        buf.put_u16_le(self.session_port);
        buf.put_slice(&self.answer);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Answer> {
        expect_type(buf, HandshakeType::S2cAnswer)?;
        let session_port = buf.try_get_u16_le()?;
        let mut answer = [0u8; ANSWER_BYTES];
        try_copy(buf, &mut answer)?;
        Ok(Answer { session_port, answer })
    }
}

/// S2C_ERROR: a handshake rejection code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorPacket {
    pub code: u8,
}
impl ErrorPacket {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(HandshakeType::S2cError.into());
        buf.put_u8(self.code);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ErrorPacket> {
        expect_type(buf, HandshakeType::S2cError)?;
        Ok(ErrorPacket { code: buf.try_get_u8()? })
    }
}

/// Cheap dispatch on the first byte without consuming the buffer.
pub fn peek_type(buf: &[u8]) -> Option<HandshakeType> {
    buf.first().and_then(|&b| HandshakeType::try_from(b).ok())
}

fn try_copy(buf: &mut impl Buf, target: &mut [u8]) -> anyhow::Result<()> {
    if buf.remaining() < target.len() {
        bail!("handshake packet too short");
    }
    buf.copy_to_slice(target);
    Ok(())
}

fn expect_type(buf: &mut impl Buf, expected: HandshakeType) -> anyhow::Result<()> {
    let raw = buf.try_get_u8()?;
    if HandshakeType::try_from(raw) != Ok(expected) {
        bail!("unexpected handshake type {}", raw);
    }
    Ok(())
}

fn expect_type_and_magic(buf: &mut impl Buf, expected: HandshakeType) -> anyhow::Result<()> {
    expect_type(buf, expected)?;
    if buf.try_get_u32_le()? != PROTOCOL_MAGIC {
        bail!("bad protocol magic");
    }
    Ok(())
}
