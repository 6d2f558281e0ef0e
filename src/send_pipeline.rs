use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace};

use crate::buffers::buffer_pool::PacketBufferPool;
use crate::buffers::fixed_buffer::FixedBuf;
use crate::crypto::envelope::SessionCrypto;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to
///  facilitate mocking the I/O part away for testing. The don't-fragment bit
///  belongs to the socket collaborator; implementations without access to it
///  may ignore the call.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;

    fn set_dont_fragment(&self, dont_fragment: bool);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet of {} bytes to {:?}", packet_buf.len(), to);

        // a failed send is not an error at this level: the sent list keeps the
        //  message and retransmission re-posts it
        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }

    fn set_dont_fragment(&self, dont_fragment: bool) {
        // setting IP_DONTFRAG / IP_MTU_DISCOVER is left to the embedding
        //  socket layer; tokio's UdpSocket does not expose it portably
        debug!("don't-fragment bit requested: {}", dont_fragment);
    }
}

/// The outbound half of a session: seals each staged datagram with the
///  connection's envelope state and posts it, recycling buffers through the
///  pool.
pub struct SealingPipeline {
    socket: Arc<dyn SendSocket>,
    crypto: Arc<SessionCrypto>,
    buffer_pool: Arc<PacketBufferPool>,
    peer_addr: SocketAddr,
}

impl SealingPipeline {
    pub fn new(
        socket: Arc<dyn SendSocket>,
        crypto: Arc<SessionCrypto>,
        buffer_pool: Arc<PacketBufferPool>,
        peer_addr: SocketAddr,
    ) -> SealingPipeline {
        SealingPipeline {
            socket,
            crypto,
            buffer_pool,
            peer_addr,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn set_dont_fragment(&self, dont_fragment: bool) {
        self.socket.set_dont_fragment(dont_fragment);
    }

    pub fn get_buffer(&self) -> FixedBuf {
        self.buffer_pool.get()
    }

    /// Hand an unused staging buffer back to the pool.
    pub fn return_buffer(&self, buf: FixedBuf) {
        self.buffer_pool.put_back(buf);
    }

    /// Seal the staged plaintext in place and post it. The buffer is returned
    ///  to the pool afterwards.
    pub async fn seal_and_send(&self, mut buf: FixedBuf) {
        self.crypto.seal(&mut buf);
        self.socket.send_packet(self.peer_addr, buf.as_ref()).await;
        self.buffer_pool.put_back(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::envelope::{DirectionKeys, SessionKeys};
    use crate::wire::ENVELOPE_OVERHEAD;
    use bytes::BufMut;

    fn test_crypto() -> (Arc<SessionCrypto>, SessionCrypto) {
        let c2s = DirectionKeys { cipher_key: [1u8; 32], mac_key: [2u8; 32] };
        let s2c = DirectionKeys { cipher_key: [3u8; 32], mac_key: [4u8; 32] };
        let sender = Arc::new(SessionCrypto::new(SessionKeys { send: c2s.clone(), recv: s2c.clone() }));
        let receiver = SessionCrypto::new(SessionKeys { send: s2c, recv: c2s });
        (sender, receiver)
    }

    #[tokio::test]
    async fn test_seal_and_send_posts_sealed_packet() {
        let (sender_crypto, receiver_crypto) = test_crypto();
        let peer = SocketAddr::from(([1, 2, 3, 4], 9));

        let mut socket = MockSendSocket::new();
        socket
            .expect_send_packet()
            .once()
            .withf(move |addr, buf| {
                let mut data = buf.to_vec();
                let len = receiver_crypto.open(&mut data).expect("must authenticate");
                *addr == peer && &data[..len] == b"payload"
            })
            .returning(|_, _| ());

        let pool = Arc::new(PacketBufferPool::new(100 + ENVELOPE_OVERHEAD, 4));
        let pipeline = SealingPipeline::new(Arc::new(socket), sender_crypto, pool, peer);

        let mut buf = pipeline.get_buffer();
        buf.put_slice(b"payload");
        pipeline.seal_and_send(buf).await;
    }
}
