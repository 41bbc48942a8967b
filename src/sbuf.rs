//! Socket ring buffer.
//!
//! Holds the bytes a Virtual Socket has accepted but not yet passed on:
//! data read from the host waiting to be segmented towards the guest, or
//! data received from the guest waiting to be written to the host.

use std::io;

pub struct SockBuf {
    data: Vec<u8>,
    /// Offset of the oldest byte.
    head: usize,
    len: usize,
}

impl SockBuf {
    pub fn new(capacity: usize) -> Self {
        SockBuf {
            data: vec![0u8; capacity],
            head: 0,
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
        self.data.len()
    }

    /// Free space.
    pub fn space(&self) -> usize {
        self.data.len() - self.len
    }

    /// Append as much of `bytes` as fits; returns the number accepted.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.space());
        let cap = self.data.len();
        let tail = (self.head + self.len) % cap.max(1);
        let first = n.min(cap - tail);
        self.data[tail..tail + first].copy_from_slice(&bytes[..first]);
        self.data[..n - first].copy_from_slice(&bytes[first..n]);
        self.len += n;
        n
    }

    /// Copy `out.len()` bytes starting `offset` bytes past the oldest byte,
    /// without consuming them. Returns the number copied.
    pub fn peek(&self, offset: usize, out: &mut [u8]) -> usize {
        if offset >= self.len {
            return 0;
        }
        let n = out.len().min(self.len - offset);
        let cap = self.data.len();
        let pos = (self.head + offset) % cap;
        let first = n.min(cap - pos);
        out[..first].copy_from_slice(&self.data[pos..pos + first]);
        out[first..n].copy_from_slice(&self.data[..n - first]);
        n
    }

    /// Discard the `n` oldest bytes.
    pub fn drop_front(&mut self, n: usize) {
        let n = n.min(self.len);
        if n == self.len {
            self.head = 0;
            self.len = 0;
        } else {
            self.head = (self.head + n) % self.data.len();
            self.len -= n;
        }
    }

    /// Fill free space from `read`, which is handed up to two contiguous
    /// regions. Stops at the first short read. Returns bytes added; a zero
    /// result with free space means end of stream.
    pub fn fill_from<F>(&mut self, mut read: F) -> io::Result<usize>
    where
        F: FnMut(&mut [u8]) -> io::Result<usize>,
    {
        let mut total = 0;
        while self.space() > 0 {
            let cap = self.data.len();
            let tail = (self.head + self.len) % cap;
            let end = if tail >= self.head { cap } else { self.head };
            let want = end - tail;
            match read(&mut self.data[tail..end]) {
                Ok(0) => break,
                Ok(n) => {
                    self.len += n;
                    total += n;
                    if n < want {
                        break;
                    }
                }
                Err(e) if total > 0 && e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Hand the oldest bytes (at most `limit`) to `write` as a contiguous
    /// slice and consume what it accepted.
    pub fn drain_into<F>(&mut self, limit: usize, mut write: F) -> io::Result<usize>
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        let mut total = 0;
        while self.len > 0 && total < limit {
            let cap = self.data.len();
            let run = (self.len.min(cap - self.head)).min(limit - total);
            match write(&self.data[self.head..self.head + run]) {
                Ok(0) => break,
                Ok(n) => {
                    self.drop_front(n);
                    total += n;
                    if n < run {
                        break;
                    }
                }
                Err(e) if total > 0 && e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraparound_write_and_peek() {
        let mut sb = SockBuf::new(8);
        assert_eq!(sb.write(b"abcdef"), 6);
        sb.drop_front(4);
        assert_eq!(sb.write(b"ghijkl"), 6);
        assert_eq!(sb.len(), 8);
        assert_eq!(sb.write(b"x"), 0);

        let mut out = [0u8; 8];
        assert_eq!(sb.peek(0, &mut out), 8);
        assert_eq!(&out, b"efghijkl");

        let mut out = [0u8; 3];
        assert_eq!(sb.peek(5, &mut out), 3);
        assert_eq!(&out, b"jkl");
        assert_eq!(sb.peek(8, &mut out), 0);
    }

    #[test]
    fn test_fill_from_splits_at_wrap() {
        let mut sb = SockBuf::new(8);
        sb.write(b"123456");
        sb.drop_front(4);
        let mut src: &[u8] = b"ABCDEFGHIJ";
        let n = sb
            .fill_from(|buf| {
                let n = buf.len().min(src.len());
                buf[..n].copy_from_slice(&src[..n]);
                src = &src[n..];
                Ok(n)
            })
            .unwrap();
        assert_eq!(n, 6);
        let mut out = [0u8; 8];
        sb.peek(0, &mut out);
        assert_eq!(&out, b"56ABCDEF");
    }

    #[test]
    fn test_drain_into_partial_write() {
        let mut sb = SockBuf::new(8);
        sb.write(b"abcdef");
        let mut sink = Vec::new();
        let n = sb
            .drain_into(usize::MAX, |chunk| {
                let n = chunk.len().min(4);
                sink.extend_from_slice(&chunk[..n]);
                Ok(n)
            })
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(sink, b"abcd");
        assert_eq!(sb.len(), 2);

        let err = sb.drain_into(usize::MAX, |_| Err(io::ErrorKind::WouldBlock.into()));
        assert!(err.is_err());
        assert_eq!(sb.len(), 2);
    }
}
