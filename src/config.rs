use anyhow::bail;

use crate::wire::{PRIVATE_KEY_BYTES, PUBLIC_KEY_BYTES};

/// Server-side configuration.
pub struct ServerConfig {
    /// The public UDP port clients dial for the handshake. Established
    ///  sessions migrate to a per-session worker port.
    pub listen_port: u16,

    /// Number of worker sockets the established sessions are balanced
    ///  across. Each worker binds an ephemeral port that is revealed to its
    ///  clients in the handshake answer.
    pub worker_socket_count: usize,

    /// Accept IPv6 peers (binds the sockets on the v6 wildcard).
    pub support_ipv6: bool,

    /// Requested kernel receive buffer size. The crate does not touch socket
    ///  options itself; deployments apply this when constructing the sockets
    ///  handed to the transport.
    pub kernel_receive_buffer_bytes: usize,

    /// The long-term X25519 identity key. The corresponding public blob is
    ///  what clients must be configured with.
    pub private_key: [u8; PRIVATE_KEY_BYTES],

    /// Shared session key string mixed into key derivation; both sides must
    ///  agree on it.
    pub session_key: String,

    /// Number of pooled packet buffers shared by all connections.
    pub buffer_pool_size: usize,
}

impl ServerConfig {
    pub fn new(listen_port: u16, private_key: [u8; PRIVATE_KEY_BYTES], session_key: impl Into<String>) -> ServerConfig {
        ServerConfig {
            listen_port,
            worker_socket_count: 4,
            support_ipv6: false,
            kernel_receive_buffer_bytes: 1_000_000,
            private_key,
            session_key: session_key.into(),
            buffer_pool_size: 4096,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen_port == 0 {
            bail!("a fixed public listen port is required");
        }
        if self.worker_socket_count == 0 {
            bail!("at least one worker socket is required");
        }
        if self.worker_socket_count > 256 {
            bail!("more than 256 worker sockets is almost certainly a configuration error");
        }
        if self.buffer_pool_size == 0 {
            bail!("the buffer pool must hold at least one buffer");
        }
        Ok(())
    }
}

/// Client-side configuration. Hostname resolution happens outside this crate;
///  the server address arrives resolved.
pub struct ClientConfig {
    pub server_addr: std::net::SocketAddr,

    /// The server's public key blob, distributed out of band.
    pub server_public_key: [u8; PUBLIC_KEY_BYTES],

    /// Shared session key string mixed into key derivation.
    pub session_key: String,

    /// Bind the local socket on the v6 wildcard.
    pub support_ipv6: bool,

    /// See [ServerConfig::kernel_receive_buffer_bytes].
    pub kernel_receive_buffer_bytes: usize,

    /// Number of pooled packet buffers for this connection.
    pub buffer_pool_size: usize,
}

impl ClientConfig {
    pub fn new(
        server_addr: std::net::SocketAddr,
        server_public_key: [u8; PUBLIC_KEY_BYTES],
        session_key: impl Into<String>,
    ) -> ClientConfig {
        ClientConfig {
            server_addr,
            server_public_key,
            session_key: session_key.into(),
            support_ipv6: false,
            kernel_receive_buffer_bytes: 1_000_000,
            buffer_pool_size: 64,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_addr.port() == 0 {
            bail!("the server port must be non-zero");
        }
        if self.buffer_pool_size == 0 {
            bail!("the buffer pool must hold at least one buffer");
        }
        Ok(())
    }
}
