//! Byte ranges of a chunk not yet accounted for by a set of writes.

/// Uncovered parts of `[0, size)`, kept sorted and disjoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gaps(Vec<(u64, u64)>);

impl Gaps {
    pub fn new(size: u64) -> Self {
        if size == 0 {
            return Gaps(Vec::new());
        }
        Gaps(vec![(0, size)])
    }

    /// Mark `len` bytes at `offset` as covered. Bytes past the end are ignored.
    pub fn cover(&mut self, offset: u64, len: u64) {
        let end = offset.saturating_add(len);
        if len == 0 || self.0.is_empty() {
            return;
        }
        let mut next = Vec::with_capacity(self.0.len() + 1);
        for &(l, r) in &self.0 {
            if r <= offset || l >= end {
                next.push((l, r));
                continue;
            }
            if l < offset {
                next.push((l, offset));
            }
            if end < r {
                next.push((end, r));
            }
        }
        self.0 = next;
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total uncovered bytes.
    pub fn len(&self) -> u64 {
        self.0.iter().map(|(l, r)| r - l).sum()
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cover_until_empty() {
        let mut g = Gaps::new(16);
        g.cover(4, 4);
        g.cover(20, 10);
        assert_eq!(g.ranges(), &[(0, 4), (8, 16)]);
        g.cover(0, 4);
        g.cover(8, 8);
        assert!(g.is_empty());
    }

    #[test]
    fn test_overlapping_writes_leave_gap() {
        let mut g = Gaps::new(10);
        g.cover(0, 3);
        g.cover(2, 1);
        g.cover(5, 100);
        assert_eq!(g.ranges(), &[(3, 5)]);
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn test_empty_chunk_has_no_gaps() {
        assert!(Gaps::new(0).is_empty());
    }
}
