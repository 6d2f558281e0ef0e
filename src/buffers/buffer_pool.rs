use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::buffers::fixed_buffer::FixedBuf;

/// A bounded pool of uniformly sized [FixedBuf]s. Buffers in excess of the
///  bound are dropped when returned, so a burst cannot pin memory forever.
pub struct PacketBufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<FixedBuf>>,
}

impl PacketBufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> PacketBufferPool {
        PacketBufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get(&self) -> FixedBuf {
        if let Some(buffer) = self.buffers.lock().pop() {
            trace!("returning buffer from pool");
            return buffer;
        }

        debug!("no buffer in pool: creating new buffer");
        FixedBuf::new(self.buf_size)
    }

    pub fn put_back(&self, mut buffer: FixedBuf) {
        assert_eq!(
            buffer.capacity(),
            self.buf_size,
            "returned buffer does not have the pool's capacity of {} bytes",
            self.buf_size
        );

        buffer.clear();

        let mut buffers = self.buffers.lock();
        if buffers.capacity() > buffers.len() {
            buffers.push(buffer);
        } else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_returned_buffer_is_cleared() {
        let pool = PacketBufferPool::new(10, 4);

        let mut buf = pool.get();
        buf.put_slice(&[1, 2, 3]);
        pool.put_back(buf);

        assert!(pool.get().is_empty());
    }

    #[test]
    fn test_pool_bound() {
        let pool = PacketBufferPool::new(10, 1);
        pool.put_back(FixedBuf::new(10));
        pool.put_back(FixedBuf::new(10));

        // both gets succeed regardless of how many buffers were retained
        let a = pool.get();
        let b = pool.get();
        assert_eq!(a.capacity(), 10);
        assert_eq!(b.capacity(), 10);
    }

    #[test]
    #[should_panic]
    fn test_wrong_capacity_rejected() {
        let pool = PacketBufferPool::new(10, 4);
        pool.put_back(FixedBuf::new(11));
    }
}
