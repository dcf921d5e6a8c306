use super::{copy_pieces_in, copy_pieces_out};
use crate::error::Result;
use crate::io::{SeqList, pair_vv};

/// Raw data held inline with the dataset's metadata.
pub(crate) struct CompactStorage {
    buf: Vec<u8>,
    dirty: bool,
}

impl CompactStorage {
    pub(crate) fn new(buf: Vec<u8>) -> Self {
        Self { buf, dirty: false }
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The metadata layer has taken a copy of the buffer.
    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn readvv(&self, dset: &mut SeqList, mem: &mut SeqList, buf: &mut [u8]) -> Result<u64> {
        let pieces = pair_vv(dset, mem);
        copy_pieces_out(&self.buf, &pieces, buf)
    }

    pub(crate) fn writevv(&mut self, dset: &mut SeqList, mem: &mut SeqList, buf: &[u8]) -> Result<u64> {
        let pieces = pair_vv(dset, mem);
        let n = copy_pieces_in(buf, &pieces, &mut self.buf)?;
        self.dirty |= n > 0;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_marks_dirty() {
        let mut c = CompactStorage::new(vec![0; 8]);
        let mut dset = SeqList::single(4, 2);
        let mut mem = SeqList::single(1, 2);
        assert_eq!(c.writevv(&mut dset, &mut mem, &[0, 7, 8]).unwrap(), 2);
        assert!(c.is_dirty());
        assert_eq!(c.data(), &[0, 0, 0, 0, 7, 8, 0, 0]);

        let mut out = [0u8; 2];
        let mut dset = SeqList::single(4, 2);
        let mut mem = SeqList::single(0, 2);
        c.readvv(&mut dset, &mut mem, &mut out).unwrap();
        assert_eq!(out, [7, 8]);
        c.mark_clean();
        assert!(!c.is_dirty());
    }

    #[test]
    fn test_range_past_buffer() {
        let mut c = CompactStorage::new(vec![0; 4]);
        let mut dset = SeqList::single(3, 2);
        let mut mem = SeqList::single(0, 2);
        assert!(c.writevv(&mut dset, &mut mem, &[1, 2]).is_err());
        assert!(!c.is_dirty());
    }
}
