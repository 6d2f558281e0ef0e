use std::fmt::{Display, Formatter};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Rejection codes a server reports in S2C_ERROR.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HandshakeError {
    ServerFull = 0,
}

impl Display for HandshakeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::ServerFull => write!(f, "server is at maximum population"),
        }
    }
}

/// Why a connect attempt failed. Server-reported codes are numbered strictly
///  above the client-side kinds (see [ConnectError::code]) so an accidental
///  value collision between the two spaces is impossible.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectError {
    /// ICMP unreachable before the first packet from the server arrived.
    Icmp,
    /// A buffer could not be allocated.
    OutOfMemory,
    /// The local socket failed to bind or post.
    BrokenPipe,
    /// CONNECT_TIMEOUT elapsed without completing the handshake.
    Timeout,
    /// The server public key blob or configuration did not validate.
    InvalidConfig,
    /// The server rejected the handshake explicitly.
    Server(HandshakeError),
}

/// Number of purely client-side failure kinds; server codes map above this.
const NUM_CLIENT_ERROR_KINDS: u8 = 5;

impl ConnectError {
    pub fn code(&self) -> u8 {
        match self {
            ConnectError::Icmp => 0,
            ConnectError::OutOfMemory => 1,
            ConnectError::BrokenPipe => 2,
            ConnectError::Timeout => 3,
            ConnectError::InvalidConfig => 4,
            ConnectError::Server(e) => NUM_CLIENT_ERROR_KINDS + u8::from(*e),
        }
    }
}

impl Display for ConnectError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Icmp => write!(f, "ICMP unreachable from the server address"),
            ConnectError::OutOfMemory => write!(f, "buffer allocation failed"),
            ConnectError::BrokenPipe => write!(f, "local socket failure"),
            ConnectError::Timeout => write!(f, "handshake timed out"),
            ConnectError::InvalidConfig => write!(f, "invalid configuration or server public key"),
            ConnectError::Server(e) => write!(f, "server rejected the handshake: {}", e),
        }
    }
}

impl std::error::Error for ConnectError {}
