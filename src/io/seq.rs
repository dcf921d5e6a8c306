//! Byte-range sequence lists for vectored transfers.

use crate::error::{Result, StorageError};
use crate::utils::NumCastExt;
use std::collections::VecDeque;

/// Ordered `(offset, len)` byte ranges with a consuming front.
///
/// Vectored reads and writes take one list for the dataset side and one for
/// the memory side and may stop early; whatever is left (including a partly
/// consumed front entry) is where the next call resumes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct SeqList {
    seqs: VecDeque<(u64, u64)>,
}

/// One matched piece of a dataset range and a memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Piece {
    pub dset_off: u64,
    pub mem_off: u64,
    pub len: u64,
}

impl SeqList {
    pub(crate) fn single(off: u64, len: u64) -> Self {
        let mut list = Self::default();
        list.push(off, len);
        list
    }

    /// Append a range, merging it into the last one when contiguous.
    pub(crate) fn push(&mut self, off: u64, len: u64) {
        if len == 0 {
            return;
        }
        if let Some(last) = self.seqs.back_mut()
            && last.0 + last.1 == off
        {
            last.1 += len;
            return;
        }
        self.seqs.push_back((off, len));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.seqs.len()
    }

    pub(crate) fn total(&self) -> u64 {
        self.seqs.iter().map(|s| s.1).sum()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.seqs.iter().copied()
    }

    /// Consume `n` bytes from the front.
    pub(crate) fn advance(&mut self, mut n: u64) {
        while n > 0 {
            let Some(front) = self.seqs.front_mut() else {
                return;
            };
            if front.1 > n {
                front.0 += n;
                front.1 -= n;
                return;
            }
            n -= front.1;
            self.seqs.pop_front();
        }
    }
}

/// Match the two lists piece by piece until either runs out, consuming what
/// was matched from both.
pub(crate) fn pair_vv(dset: &mut SeqList, mem: &mut SeqList) -> Vec<Piece> {
    let mut pieces = Vec::with_capacity(dset.len().max(mem.len()));
    while let (Some(&(d_off, d_len)), Some(&(m_off, m_len))) =
        (dset.seqs.front(), mem.seqs.front())
    {
        let len = d_len.min(m_len);
        pieces.push(Piece {
            dset_off: d_off,
            mem_off: m_off,
            len,
        });
        dset.advance(len);
        mem.advance(len);
    }
    pieces
}

/// Turns a lazy element-span iterator into byte sequences on demand.
pub(crate) struct SeqFeed<I> {
    spans: I,
    pending: Option<(u64, u64)>,
    elem_size: u64,
}

impl<I: Iterator<Item = (u64, u64)>> SeqFeed<I> {
    pub(crate) fn new(spans: I, elem_size: usize) -> Self {
        Self {
            spans,
            pending: None,
            elem_size: elem_size as u64,
        }
    }

    /// Move at most `max_seqs` ranges totalling at most `max_bytes` into
    /// `list`, splitting a range if the byte limit falls inside it.
    /// Returns the number of bytes added.
    pub(crate) fn fill(&mut self, list: &mut SeqList, max_seqs: usize, max_bytes: u64) -> u64 {
        let mut added = 0;
        let mut taken = 0;
        while taken < max_seqs && added < max_bytes {
            let next = self.pending.take().or_else(|| {
                self.spans
                    .next()
                    .map(|(off, len)| (off * self.elem_size, len * self.elem_size))
            });
            let Some((off, len)) = next else {
                break;
            };
            let take = len.min(max_bytes - added);
            list.push(off, take);
            if take < len {
                self.pending = Some((off + take, len - take));
            }
            added += take;
            taken += 1;
        }
        added
    }
}

/// Copy the ranges of `seqs` out of `src`, packed, into `out`.
pub(crate) fn gather_mem(src: &[u8], seqs: &SeqList, out: &mut [u8]) -> Result<()> {
    let mut pos = 0;
    for (off, len) in seqs.iter() {
        let (off, len) = (off.as_usize(), len.as_usize());
        let range = src.get(off..off + len).ok_or_else(|| out_of_buffer(off + len, src.len()))?;
        out[pos..pos + len].copy_from_slice(range);
        pos += len;
    }
    Ok(())
}

/// Inverse of [`gather_mem`].
pub(crate) fn scatter_mem(packed: &[u8], seqs: &SeqList, dst: &mut [u8]) -> Result<()> {
    let mut pos = 0;
    let dst_len = dst.len();
    for (off, len) in seqs.iter() {
        let (off, len) = (off.as_usize(), len.as_usize());
        let range = dst
            .get_mut(off..off + len)
            .ok_or_else(|| out_of_buffer(off + len, dst_len))?;
        range.copy_from_slice(&packed[pos..pos + len]);
        pos += len;
    }
    Ok(())
}

pub(crate) fn out_of_buffer(end: usize, len: usize) -> StorageError {
    StorageError::invalid(format!(
        "selection reaches byte {end} of a {len}-byte buffer"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_leaves_partial_remainder() {
        let mut d = SeqList::default();
        d.push(0, 10);
        d.push(20, 10);
        let mut m = SeqList::single(100, 15);

        let pieces = pair_vv(&mut d, &mut m);
        assert_eq!(
            pieces,
            vec![
                Piece {
                    dset_off: 0,
                    mem_off: 100,
                    len: 10
                },
                Piece {
                    dset_off: 20,
                    mem_off: 110,
                    len: 5
                },
            ]
        );
        assert!(m.is_empty());
        assert_eq!(d.iter().collect::<Vec<_>>(), vec![(25, 5)]);
    }

    #[test]
    fn test_push_merges_contiguous() {
        let mut l = SeqList::default();
        l.push(0, 4);
        l.push(4, 4);
        l.push(16, 0);
        l.push(20, 4);
        assert_eq!(l.len(), 2);
        assert_eq!(l.total(), 12);
    }

    #[test]
    fn test_feed_respects_limits() {
        let spans = vec![(0u64, 3u64), (10, 3)];
        let mut feed = SeqFeed::new(spans.into_iter(), 4);
        let mut l = SeqList::default();
        assert_eq!(feed.fill(&mut l, 8, 16), 16);
        assert_eq!(l.iter().collect::<Vec<_>>(), vec![(0, 12), (40, 4)]);

        let mut rest = SeqList::default();
        assert_eq!(feed.fill(&mut rest, 8, u64::MAX), 8);
        assert_eq!(rest.iter().collect::<Vec<_>>(), vec![(44, 8)]);
        assert_eq!(feed.fill(&mut rest, 8, u64::MAX), 0);
    }

    #[test]
    fn test_feed_respects_seq_count() {
        let spans = vec![(0u64, 1u64), (5, 1), (9, 1)];
        let mut feed = SeqFeed::new(spans.into_iter(), 1);
        let mut l = SeqList::default();
        assert_eq!(feed.fill(&mut l, 2, u64::MAX), 2);
        assert_eq!(l.len(), 2);
    }

    #[test]
    fn test_gather_scatter() {
        let src: Vec<u8> = (0..10).collect();
        let mut seqs = SeqList::single(1, 2);
        seqs.push(6, 3);
        let mut packed = [0u8; 5];
        gather_mem(&src, &seqs, &mut packed).unwrap();
        assert_eq!(packed, [1, 2, 6, 7, 8]);

        let mut dst = [0u8; 10];
        scatter_mem(&packed, &seqs, &mut dst).unwrap();
        assert_eq!(dst, [0, 1, 2, 0, 0, 0, 6, 7, 8, 0]);

        let too_far = SeqList::single(8, 4);
        assert!(gather_mem(&src, &too_far, &mut packed).is_err());
    }
}
