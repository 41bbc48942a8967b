//! Out-of-order segment queue.
//!
//! Holds data that arrived ahead of `rcv_nxt`. Entries are sorted by
//! starting sequence number and never overlap: each insert trims itself
//! against its predecessor and trims (or evicts) whatever it supersedes.

use std::collections::VecDeque;

use super::seq::{seq_diff, seq_gt, seq_leq};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seg {
    pub seq: u32,
    pub data: Vec<u8>,
    pub fin: bool,
}

impl Seg {
    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.data.len() as u32)
    }
}

#[derive(Debug, Default)]
pub struct SegQueue {
    segs: VecDeque<Seg>,
}

impl SegQueue {
    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segs.len()
    }

    pub fn clear(&mut self) {
        self.segs.clear();
    }

    /// Queue `data` starting at `seq`. Returns `false` when every byte was
    /// already queued and the segment was discarded.
    pub fn insert(&mut self, seq: u32, data: &[u8], fin: bool) -> bool {
        let pos = self
            .segs
            .iter()
            .position(|q| seq_gt(q.seq, seq))
            .unwrap_or(self.segs.len());

        let mut seq = seq;
        let mut data = data;

        if pos > 0 {
            let prev = &self.segs[pos - 1];
            let overlap = seq_diff(prev.end(), seq);
            if overlap > 0 {
                let overlap = overlap as usize;
                if overlap >= data.len() && !(fin && overlap == data.len() && !prev.fin) {
                    return false;
                }
                let overlap = overlap.min(data.len());
                data = &data[overlap..];
                seq = seq.wrapping_add(overlap as u32);
            }
        }

        let end = seq.wrapping_add(data.len() as u32);
        let mut fin = fin;
        while pos < self.segs.len() {
            let q = &mut self.segs[pos];
            let covered = seq_diff(end, q.seq);
            if covered <= 0 {
                break;
            }
            let covered = covered as usize;
            if covered < q.data.len() {
                q.seq = q.seq.wrapping_add(covered as u32);
                q.data.drain(..covered);
                break;
            }
            if q.fin && q.end() == end {
                fin = true;
            }
            self.segs.remove(pos);
        }

        self.segs.insert(
            pos,
            Seg {
                seq,
                data: data.to_vec(),
                fin,
            },
        );
        true
    }

    /// Remove and return the head segment if it starts at or before
    /// `rcv_nxt`, with any bytes before `rcv_nxt` cut off.
    pub fn pop_ready(&mut self, rcv_nxt: u32) -> Option<Seg> {
        let head = self.segs.front()?;
        if seq_gt(head.seq, rcv_nxt) {
            return None;
        }
        let mut seg = self.segs.pop_front()?;
        let stale = seq_diff(rcv_nxt, seg.seq) as usize;
        if stale > 0 {
            if stale > seg.data.len() || (stale == seg.data.len() && !seg.fin) {
                return self.pop_ready(rcv_nxt);
            }
            seg.data.drain(..stale);
            seg.seq = rcv_nxt;
        }
        debug_assert!(seq_leq(seg.seq, rcv_nxt));
        Some(seg)
    }

    /// Sorted and non-overlapping.
    #[cfg(test)]
    fn is_well_formed(&self) -> bool {
        self.segs
            .iter()
            .zip(self.segs.iter().skip(1))
            .all(|(a, b)| seq_leq(a.end(), b.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(q: &mut SegQueue, mut rcv_nxt: u32) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        let mut fin = false;
        while let Some(seg) = q.pop_ready(rcv_nxt) {
            rcv_nxt = rcv_nxt.wrapping_add(seg.data.len() as u32);
            out.extend_from_slice(&seg.data);
            if seg.fin {
                fin = true;
                break;
            }
        }
        (out, fin)
    }

    #[test]
    fn test_out_of_order_assembles() {
        let mut q = SegQueue::default();
        q.insert(110, b"klmno", false);
        q.insert(105, b"fghij", false);
        assert!(q.pop_ready(100).is_none());
        q.insert(100, b"abcde", false);
        assert!(q.is_well_formed());
        assert_eq!(drain(&mut q, 100), (b"abcdefghijklmno".to_vec(), false));
        assert!(q.is_empty());
    }

    #[test]
    fn test_overlap_is_trimmed_not_duplicated() {
        let mut q = SegQueue::default();
        q.insert(100, b"abcdef", false);
        // Overlaps the tail of the first and the head of the third.
        q.insert(110, b"klmn", false);
        q.insert(104, b"efghijkl", false);
        assert!(q.is_well_formed());
        assert_eq!(drain(&mut q, 100).0, b"abcdefghijklmn");
    }

    #[test]
    fn test_duplicate_is_discarded() {
        let mut q = SegQueue::default();
        assert!(q.insert(100, b"abcdef", false));
        assert!(!q.insert(102, b"cd", false));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_superseded_segments_are_evicted() {
        let mut q = SegQueue::default();
        q.insert(102, b"c", false);
        q.insert(104, b"e", false);
        q.insert(100, b"abcdefg", false);
        assert_eq!(q.len(), 1);
        assert_eq!(drain(&mut q, 100).0, b"abcdefg");
    }

    #[test]
    fn test_fin_survives_and_wraps() {
        let mut q = SegQueue::default();
        let base = u32::MAX - 2;
        q.insert(base.wrapping_add(5), b"fg", true);
        q.insert(base, b"abcde", false);
        assert!(q.is_well_formed());
        assert_eq!(drain(&mut q, base), (b"abcdefg".to_vec(), true));
    }

    #[test]
    fn test_stale_head_is_cut() {
        let mut q = SegQueue::default();
        q.insert(100, b"abcdef", false);
        let seg = q.pop_ready(103).unwrap();
        assert_eq!(seg.seq, 103);
        assert_eq!(seg.data, b"def");
    }
}
