//! IP fragment reassembly.
//!
//! Datagrams under reassembly are bucketed by `(source, id)` and matched
//! on the full `{source, destination, id, protocol}` key. Each holds its
//! fragments sorted by offset with overlaps trimmed away, so completeness
//! is a single walk checking for gaps.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use log::trace;

use crate::mbuf::{Mbuf, MAX_HEADROOM};
use crate::stats::IpStats;
use crate::wire::ipv4::refresh_checksum;
use crate::wire::Ipv4Header;

const IP_MAXPACKET: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    id: u16,
    proto: u8,
}

#[derive(Debug)]
struct Fragment {
    off: usize,
    data: Vec<u8>,
}

impl Fragment {
    fn end(&self) -> usize {
        self.off + self.data.len()
    }
}

#[derive(Debug)]
struct Datagram {
    key: FragKey,
    /// Header of the offset-zero fragment, options included.
    header: Option<Vec<u8>>,
    frags: Vec<Fragment>,
    /// Payload length, known once the last fragment arrived.
    total: Option<usize>,
    ttl: u8,
    /// Creation order, for oldest-first eviction.
    born: u64,
}

impl Datagram {
    /// Insert with BSD-style overlap trimming. Returns `false` when the
    /// fragment added nothing new.
    fn insert(&mut self, mut off: usize, data: &[u8]) -> bool {
        let pos = self.frags.iter().position(|q| q.off > off).unwrap_or(self.frags.len());
        let mut data = data;

        if pos > 0 {
            let overlap = self.frags[pos - 1].end() as isize - off as isize;
            if overlap > 0 {
                let overlap = overlap as usize;
                if overlap >= data.len() {
                    return false;
                }
                data = &data[overlap..];
                off += overlap;
            }
        }

        let end = off + data.len();
        while pos < self.frags.len() && self.frags[pos].off < end {
            let covered = end - self.frags[pos].off;
            let q = &mut self.frags[pos];
            if covered < q.data.len() {
                q.off += covered;
                q.data.drain(..covered);
                break;
            }
            self.frags.remove(pos);
        }

        self.frags.insert(
            pos,
            Fragment {
                off,
                data: data.to_vec(),
            },
        );
        true
    }

    fn is_complete(&self) -> bool {
        let (Some(total), Some(_)) = (self.total, &self.header) else {
            return false;
        };
        let mut next = 0;
        for q in &self.frags {
            if q.off != next {
                return false;
            }
            next = q.end();
        }
        next == total
    }

    fn assemble(self) -> Option<Mbuf> {
        let header = self.header?;
        let hlen = header.len();
        let total = hlen + self.total?;
        if total > IP_MAXPACKET {
            return None;
        }
        let mut m = Mbuf::with_headroom(MAX_HEADROOM, total);
        m.append(&header);
        for q in &self.frags {
            m.append(&q.data);
        }
        let buf = m.data_mut();
        buf[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        buf[6..8].copy_from_slice(&0u16.to_be_bytes());
        refresh_checksum(buf, hlen);
        Some(m)
    }
}

pub struct ReassQueue {
    buckets: HashMap<(Ipv4Addr, u16), Vec<Datagram>>,
    count: usize,
    max_packets: usize,
    max_frags: usize,
    ttl: u8,
    clock: u64,
}

impl ReassQueue {
    pub fn new(max_packets: usize, max_frags: usize, ttl: u8) -> Self {
        ReassQueue {
            buckets: HashMap::new(),
            count: 0,
            max_packets,
            max_frags,
            ttl,
            clock: 0,
        }
    }

    /// Datagrams under reassembly.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Add the fragment `m` (a whole IP datagram described by `hdr`).
    /// Returns the reassembled datagram once every piece is present.
    pub fn insert(&mut self, hdr: &Ipv4Header, m: Mbuf, stats: &mut IpStats) -> Option<Mbuf> {
        let key = FragKey {
            src: hdr.src,
            dst: hdr.dst,
            id: hdr.id,
            proto: hdr.proto,
        };
        let off = hdr.frag_offset();
        let data = &m.data()[hdr.hlen..];
        if off + data.len() > IP_MAXPACKET - hdr.hlen {
            stats.frag_dropped += 1;
            return None;
        }

        if !self.contains(key) {
            if self.count >= self.max_packets {
                self.evict_oldest();
                stats.frag_dropped += 1;
            }
            self.clock += 1;
            self.buckets.entry((key.src, key.id)).or_default().push(Datagram {
                key,
                header: None,
                frags: Vec::new(),
                total: None,
                ttl: self.ttl,
                born: self.clock,
            });
            self.count += 1;
        }

        let max_frags = self.max_frags;
        let bucket = self.buckets.get_mut(&(key.src, key.id))?;
        let idx = bucket.iter().position(|d| d.key == key)?;
        let dg = &mut bucket[idx];

        if dg.frags.len() >= max_frags {
            trace!("too many fragments for {:?}, dropping datagram", key);
            bucket.swap_remove(idx);
            self.remove_bucket_if_empty(key);
            self.count -= 1;
            stats.frag_dropped += 1;
            return None;
        }

        if off == 0 {
            dg.header = Some(m.data()[..hdr.hlen].to_vec());
        }
        if !hdr.more_fragments() {
            let total = off + data.len();
            if dg.total.is_some_and(|t| t != total) {
                stats.frag_dropped += 1;
                return None;
            }
            dg.total = Some(total);
        }
        if !dg.insert(off, data) {
            stats.frag_dropped += 1;
        }
        if !dg.is_complete() {
            return None;
        }

        let dg = bucket.swap_remove(idx);
        self.remove_bucket_if_empty(key);
        self.count -= 1;
        let out = dg.assemble();
        match out {
            Some(_) => stats.reassembled += 1,
            None => stats.frag_dropped += 1,
        }
        out
    }

    /// Age every entry by one slow tick. Returns how many expired.
    pub fn slow_tick(&mut self) -> usize {
        let mut expired = 0;
        self.buckets.retain(|_, bucket| {
            bucket.retain_mut(|dg| {
                dg.ttl = dg.ttl.saturating_sub(1);
                if dg.ttl == 0 {
                    expired += 1;
                    false
                } else {
                    true
                }
            });
            !bucket.is_empty()
        });
        self.count -= expired;
        expired
    }

    fn contains(&self, key: FragKey) -> bool {
        self.buckets
            .get(&(key.src, key.id))
            .is_some_and(|b| b.iter().any(|d| d.key == key))
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .buckets
            .values()
            .flatten()
            .min_by_key(|d| d.born)
            .map(|d| d.key);
        if let Some(key) = oldest {
            if let Some(bucket) = self.buckets.get_mut(&(key.src, key.id)) {
                bucket.retain(|d| d.key != key);
            }
            self.remove_bucket_if_empty(key);
            self.count -= 1;
            trace!("fragment queue full, evicted {:?}", key);
        }
    }

    fn remove_bucket_if_empty(&mut self, key: FragKey) {
        if self.buckets.get(&(key.src, key.id)).is_some_and(|b| b.is_empty()) {
            self.buckets.remove(&(key.src, key.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{internet_checksum, IPV4_HEADER_LEN, IP_MF};

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 256) as u8).collect()
    }

    fn fragment(id: u16, data: &[u8], off: usize, len: usize, last: bool) -> (Ipv4Header, Mbuf) {
        let mut h = Ipv4Header::new(Ipv4Addr::new(10, 0, 2, 15), Ipv4Addr::new(1, 2, 3, 4), 17, 64, len);
        h.id = id;
        h.frag = (off / 8) as u16 | if last { 0 } else { IP_MF };
        let mut buf = vec![0u8; IPV4_HEADER_LEN + len];
        h.write(&mut buf);
        buf[IPV4_HEADER_LEN..].copy_from_slice(&data[off..off + len]);
        let parsed = Ipv4Header::parse(&buf).unwrap();
        (parsed, Mbuf::from_slice(0, &buf))
    }

    fn three_pieces(id: u16, data: &[u8]) -> Vec<(Ipv4Header, Mbuf)> {
        vec![
            fragment(id, data, 0, 1000, false),
            fragment(id, data, 1000, 1000, false),
            fragment(id, data, 2000, 1000, true),
        ]
    }

    #[test]
    fn test_every_arrival_order_reassembles() {
        let data = payload(3000);
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let mut q = ReassQueue::new(64, 16, 60);
            let mut stats = IpStats::default();
            let mut pieces: Vec<Option<(Ipv4Header, Mbuf)>> =
                three_pieces(7, &data).into_iter().map(Some).collect();
            let mut out = None;
            for (n, &i) in order.iter().enumerate() {
                let (h, m) = pieces[i].take().unwrap();
                let r = q.insert(&h, m, &mut stats);
                if n < 2 {
                    assert!(r.is_none(), "partial set delivered for {order:?}");
                } else {
                    out = r;
                }
            }
            let m = out.expect("complete datagram");
            let d = m.data();
            assert_eq!(d.len(), IPV4_HEADER_LEN + 3000);
            assert_eq!(&d[IPV4_HEADER_LEN..], &data[..]);
            assert_eq!(internet_checksum(&d[..IPV4_HEADER_LEN]), 0);
            let h = Ipv4Header::parse(d).unwrap();
            assert!(!h.is_fragment());
            assert_eq!(h.total_len as usize, 3020);
            assert!(q.is_empty());
            assert_eq!(stats.reassembled, 1);
        }
    }

    #[test]
    fn test_overlapping_fragments_keep_first_bytes() {
        let data = payload(48);
        let mut q = ReassQueue::new(64, 16, 60);
        let mut stats = IpStats::default();
        let (h, m) = fragment(1, &data, 0, 24, false);
        assert!(q.insert(&h, m, &mut stats).is_none());
        // Overlaps bytes 16..24 and is trimmed.
        let (h, m) = fragment(1, &data, 16, 16, false);
        assert!(q.insert(&h, m, &mut stats).is_none());
        let (h, m) = fragment(1, &data, 32, 16, true);
        let m = q.insert(&h, m, &mut stats).unwrap();
        assert_eq!(&m.data()[IPV4_HEADER_LEN..], &data[..]);
    }

    #[test]
    fn test_fragment_limit_drops_datagram() {
        let data = payload(64);
        let mut q = ReassQueue::new(64, 2, 60);
        let mut stats = IpStats::default();
        for off in [0, 16, 32] {
            let (h, m) = fragment(3, &data, off, 8, false);
            q.insert(&h, m, &mut stats);
        }
        assert!(q.is_empty());
        assert_eq!(stats.frag_dropped, 1);
    }

    #[test]
    fn test_queue_limit_evicts_oldest() {
        let data = payload(64);
        let mut q = ReassQueue::new(2, 16, 60);
        let mut stats = IpStats::default();
        for id in 1..=3 {
            let (h, m) = fragment(id, &data, 0, 8, false);
            q.insert(&h, m, &mut stats);
        }
        assert_eq!(q.len(), 2);
        assert_eq!(stats.frag_dropped, 1);
        // Datagram 1 was evicted; its tail alone cannot complete it.
        let (h, m) = fragment(1, &data, 8, 8, true);
        assert!(q.insert(&h, m, &mut stats).is_none());
        // Datagram 3 survived.
        let (h, m) = fragment(3, &data, 8, 8, true);
        assert!(q.insert(&h, m, &mut stats).is_some());
    }

    #[test]
    fn test_entries_expire() {
        let data = payload(16);
        let mut q = ReassQueue::new(64, 16, 2);
        let mut stats = IpStats::default();
        let (h, m) = fragment(9, &data, 0, 8, false);
        q.insert(&h, m, &mut stats);
        assert_eq!(q.slow_tick(), 0);
        assert_eq!(q.slow_tick(), 1);
        assert!(q.is_empty());
    }
}
