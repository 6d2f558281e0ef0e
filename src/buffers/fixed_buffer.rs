use std::fmt::{Debug, Formatter};

use bytes::buf::UninitSlice;

/// A fixed-capacity, pre-allocated byte buffer that implements `BufMut` to fit
///  into the `bytes` ecosystem. The capacity never changes after construction;
///  sealing a datagram appends the MAC and IV trailer in place, so the buffer
///  is always allocated with the envelope overhead on top of the payload room.
#[derive(Eq)]
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}

impl FixedBuf {
    pub fn new(capacity: usize) -> FixedBuf {
        // buffers are reused aggressively, so eager zero-initialization is a
        //  one-time cost per pool entry
        FixedBuf {
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.buf.len() - self.len
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// make the entire underlying buffer available through as_mut(), for use
    ///  as a receive target
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    /// Test convenience: capacity and content from a slice.
    #[cfg(test)]
    pub fn from_slice(capacity: usize, data: &[u8]) -> FixedBuf {
        let mut result = FixedBuf::new(capacity);
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

impl PartialEq for FixedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_put_and_read_back() {
        let mut buf = FixedBuf::new(8);
        assert!(buf.is_empty());
        assert_eq!(buf.remaining_capacity(), 8);

        buf.put_u16_le(0x1234);
        buf.put_u8(9);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.as_ref(), &[0x34, 0x12, 9]);
        assert_eq!(buf.remaining_capacity(), 5);
    }

    #[test]
    fn test_clear_retains_capacity() {
        let mut buf = FixedBuf::from_slice(4, &[1, 2, 3]);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 4);
    }

    #[test]
    fn test_truncate() {
        let mut buf = FixedBuf::from_slice(16, &[1, 2, 3, 4, 5]);
        buf.truncate(2);
        assert_eq!(buf.as_ref(), &[1, 2]);
    }

    #[test]
    fn test_maximize_len() {
        let mut buf = FixedBuf::new(4);
        buf.maximize_len();
        assert_eq!(buf.as_mut().len(), 4);
    }

    #[test]
    #[should_panic]
    fn test_overflow_panics() {
        let mut buf = FixedBuf::new(2);
        buf.put_slice(&[1, 2, 3]);
    }
}
