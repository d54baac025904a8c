//! Directional reassembly buffer.
//!
//! An append-only byte queue with a consumed-offset cursor. Parsers peek at
//! the contiguous unconsumed bytes, then advance the cursor once a whole
//! message has been extracted; consumed bytes are no longer addressable.

use byteorder::{ByteOrder, NetworkEndian};

#[derive(Debug)]
pub struct StreamBuf {
    buf: Vec<u8>,
    /// Total bytes consumed over the buffer's lifetime.
    consumed: u64,
    /// Maximum bytes retained; exceeding it is a flow-level error.
    cap: usize,
}

impl StreamBuf {
    pub fn new(cap: usize) -> Self {
        StreamBuf {
            buf: Vec::new(),
            consumed: 0,
            cap,
        }
    }

    /// Appends `data`; returns false when the buffer would exceed its cap
    /// (the caller is expected to drop the flow).
    #[must_use]
    pub fn push(&mut self, data: &[u8]) -> bool {
        if self.buf.len() + data.len() > self.cap {
            return false;
        }
        self.buf.extend_from_slice(data);
        true
    }

    /// The unconsumed bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total bytes ever consumed.
    #[inline]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Advances the read cursor by `n` bytes.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len());
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
        self.consumed += n as u64;
    }

    /// Drops everything currently buffered.
    pub fn clear(&mut self) {
        self.consumed += self.buf.len() as u64;
        self.buf.clear();
    }

    #[inline]
    pub fn peek_u8(&self, offset: usize) -> Option<u8> {
        self.buf.get(offset).copied()
    }

    #[inline]
    pub fn read_u16_be(&self, offset: usize) -> Option<u16> {
        self.buf
            .get(offset..offset + 2)
            .map(NetworkEndian::read_u16)
    }

    #[inline]
    pub fn read_u32_be(&self, offset: usize) -> Option<u32> {
        self.buf
            .get(offset..offset + 4)
            .map(NetworkEndian::read_u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_stream_buf_append_consume() {
        let mut b = StreamBuf::new(16);
        assert!(b.push(b"hello "));
        assert!(b.push(b"world"));
        assert_eq!(b.data(), b"hello world");
        b.consume(6);
        assert_eq!(b.data(), b"world");
        assert_eq!(b.consumed(), 6);
        b.consume(5);
        assert!(b.is_empty());
        assert_eq!(b.consumed(), 11);
    }

    #[test]
    fn core_stream_buf_cap() {
        let mut b = StreamBuf::new(4);
        assert!(b.push(b"abcd"));
        assert!(!b.push(b"e"));
        // a rejected push leaves the buffer unchanged
        assert_eq!(b.data(), b"abcd");
    }

    #[test]
    fn core_stream_buf_integer_reads() {
        let mut b = StreamBuf::new(16);
        assert!(b.push(&[0x12, 0x34, 0x56, 0x78, 0x9a]));
        assert_eq!(b.peek_u8(0), Some(0x12));
        assert_eq!(b.read_u16_be(0), Some(0x1234));
        assert_eq!(b.read_u32_be(1), Some(0x3456789a));
        assert_eq!(b.read_u32_be(2), None);
    }

    #[test]
    fn core_stream_buf_clear_counts_consumed() {
        let mut b = StreamBuf::new(16);
        assert!(b.push(b"abc"));
        b.clear();
        assert_eq!(b.consumed(), 3);
        assert!(b.is_empty());
    }
}
