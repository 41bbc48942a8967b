//! Packet buffer.
//!
//! Every frame flowing through the engine lives in an [`Mbuf`]: one
//! contiguous allocation with reserved leading space so lower-layer headers
//! can be prepended without copying the payload. An `Mbuf` has exactly one
//! owner; handing it to the next stage moves it.

/// Leading space reserved for Ethernet + IPv4 + TCP headers with options.
pub const MAX_HEADROOM: usize = 14 + 60 + 60;

#[derive(Clone)]
pub struct Mbuf {
    buf: Vec<u8>,
    start: usize,
    len: usize,
}

impl Mbuf {
    /// Empty buffer with `headroom` bytes of leading space and room for
    /// `capacity` bytes of data after it.
    pub fn with_headroom(headroom: usize, capacity: usize) -> Self {
        Mbuf {
            buf: vec![0u8; headroom + capacity],
            start: headroom,
            len: 0,
        }
    }

    /// Buffer holding a copy of `data`, preceded by `headroom` bytes.
    pub fn from_slice(headroom: usize, data: &[u8]) -> Self {
        let mut m = Self::with_headroom(headroom, data.len());
        m.append(data);
        m
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes available in front of the data.
    pub fn headroom(&self) -> usize {
        self.start
    }

    /// Bytes available after the data without reallocating.
    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.start - self.len
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..self.start + self.len]
    }

    /// Grow the data region by `n` bytes at the front and return them.
    /// Uses the leading space when available, otherwise reallocates with
    /// fresh headroom.
    pub fn prepend(&mut self, n: usize) -> &mut [u8] {
        if n > self.start {
            let headroom = n + MAX_HEADROOM;
            let mut buf = vec![0u8; headroom + self.len + self.tailroom()];
            buf[headroom..headroom + self.len].copy_from_slice(self.data());
            self.buf = buf;
            self.start = headroom;
        }
        self.start -= n;
        self.len += n;
        let start = self.start;
        &mut self.buf[start..start + n]
    }

    /// Append `data` after the current contents.
    pub fn append(&mut self, data: &[u8]) {
        let end = self.start + self.len;
        if data.len() > self.tailroom() {
            self.buf.resize(end + data.len(), 0);
        }
        self.buf[end..end + data.len()].copy_from_slice(data);
        self.len += data.len();
    }

    /// Drop `n` bytes from the front. The bytes become leading space.
    pub fn trim_front(&mut self, n: usize) {
        let n = n.min(self.len);
        self.start += n;
        self.len -= n;
    }

    /// Drop `n` bytes from the back.
    pub fn trim_back(&mut self, n: usize) {
        self.len -= n.min(self.len);
    }

    /// Shorten the data to at most `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    /// Consume the buffer, returning exactly its data bytes.
    pub fn into_vec(mut self) -> Vec<u8> {
        if self.start == 0 {
            self.buf.truncate(self.len);
            self.buf
        } else {
            self.data().to_vec()
        }
    }
}

impl std::fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mbuf")
            .field("len", &self.len)
            .field("headroom", &self.start)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepend_uses_headroom() {
        let mut m = Mbuf::from_slice(20, b"payload");
        m.prepend(4).copy_from_slice(b"hdr:");
        assert_eq!(m.data(), b"hdr:payload");
        assert_eq!(m.headroom(), 16);
    }

    #[test]
    fn test_prepend_reallocates_when_short() {
        let mut m = Mbuf::from_slice(2, b"abc");
        m.prepend(8).copy_from_slice(b"12345678");
        assert_eq!(m.data(), b"12345678abc");
        assert!(m.headroom() >= MAX_HEADROOM);
    }

    #[test]
    fn test_trim_both_ends() {
        let mut m = Mbuf::from_slice(0, b"0123456789");
        m.trim_front(2);
        m.trim_back(3);
        assert_eq!(m.data(), b"23456");
        m.truncate(2);
        assert_eq!(m.data(), b"23");
        m.trim_front(100);
        assert!(m.is_empty());
    }

    #[test]
    fn test_append_grows() {
        let mut m = Mbuf::with_headroom(4, 2);
        m.append(b"ab");
        m.append(b"cdef");
        assert_eq!(m.clone().into_vec(), b"abcdef");
        assert_eq!(m.len(), 6);
    }
}
