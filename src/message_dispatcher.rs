use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::wire::StreamMode;

/// This trait decouples the transport from the handling of a message once it
///  is received. It is passed around as an `Arc<dyn ...>` so that server and
///  client share one delivery seam.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    /// A fully reassembled application message. `stream` is `None` for
    ///  unreliable messages, which have no stream affiliation.
    async fn on_message(&self, sender_addr: SocketAddr, stream: Option<StreamMode>, msg_buf: Vec<u8>);

    /// A session completed its handshake.
    async fn on_connect(&self, peer_addr: SocketAddr);

    /// A session ended. `reason` is the 1-byte disconnect code; DISCO_TIMEOUT
    ///  means the peer went silent.
    async fn on_disconnect(&self, peer_addr: SocketAddr, reason: u8);
}
