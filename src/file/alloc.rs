//! File-space allocation: first-fit over a coalescing free list, falling back
//! to extending the end of file.

use std::collections::BTreeMap;
use tracing::trace;

#[derive(Debug, Default)]
pub(crate) struct FileSpace {
    eoa: u64,
    /// addr -> len, never adjacent (always coalesced).
    free: BTreeMap<u64, u64>,
}

impl FileSpace {
    pub(crate) fn new(eoa: u64) -> Self {
        Self {
            eoa,
            free: BTreeMap::new(),
        }
    }

    /// End of allocated space.
    pub(crate) fn eoa(&self) -> u64 {
        self.eoa
    }

    pub(crate) fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    pub(crate) fn alloc(&mut self, size: u64) -> u64 {
        if size == 0 {
            return self.eoa;
        }
        let hit = self
            .free
            .iter()
            .find(|&(_, &len)| len >= size)
            .map(|(&addr, &len)| (addr, len));
        if let Some((addr, len)) = hit {
            self.free.remove(&addr);
            if len > size {
                self.free.insert(addr + size, len - size);
            }
            trace!(addr, size, "alloc from free list");
            return addr;
        }
        let addr = self.eoa;
        self.eoa += size;
        trace!(addr, size, "alloc at end of file");
        addr
    }

    pub(crate) fn free(&mut self, addr: u64, size: u64) {
        if size == 0 {
            return;
        }
        debug_assert!(addr + size <= self.eoa, "free beyond end of allocation");
        let mut start = addr;
        let mut len = size;

        if let Some((&prev, &prev_len)) = self.free.range(..addr).next_back()
            && prev + prev_len == addr
        {
            self.free.remove(&prev);
            start = prev;
            len += prev_len;
        }
        if let Some(&next_len) = self.free.get(&(addr + size)) {
            self.free.remove(&(addr + size));
            len += next_len;
        }

        if start + len == self.eoa {
            self.eoa = start;
        } else {
            self.free.insert(start, len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_reuse() {
        let mut fs = FileSpace::new(0);
        let a = fs.alloc(100);
        let b = fs.alloc(50);
        let c = fs.alloc(10);
        assert_eq!((a, b, c), (0, 100, 150));

        fs.free(a, 100);
        assert_eq!(fs.alloc(40), 0);
        assert_eq!(fs.alloc(60), 40);
        assert_eq!(fs.free_bytes(), 0);
        assert_eq!(fs.eoa(), 160);
    }

    #[test]
    fn test_coalesce_and_shrink_eoa() {
        let mut fs = FileSpace::new(8);
        let a = fs.alloc(10);
        let b = fs.alloc(10);
        let c = fs.alloc(10);
        fs.free(a, 10);
        fs.free(b, 10);
        assert_eq!(fs.free_bytes(), 20);
        fs.free(c, 10);
        assert_eq!(fs.free_bytes(), 0);
        assert_eq!(fs.eoa(), 8);
    }
}
