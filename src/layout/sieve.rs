//! Sieve buffer: one read-ahead, write-behind window over contiguous storage.

use crate::error::Result;
use crate::file::StorageFile;
use crate::utils::NumCastExt;
use tracing::trace;

#[derive(Debug, Default)]
pub(crate) struct Sieve {
    cap: usize,
    /// File address of `buf[0]`; `buf` holds only valid bytes.
    loc: u64,
    buf: Vec<u8>,
    dirty: bool,
}

impl Sieve {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            cap,
            ..Default::default()
        }
    }

    fn end(&self) -> u64 {
        self.loc + self.buf.len() as u64
    }

    fn contains(&self, addr: u64, len: u64) -> bool {
        !self.buf.is_empty() && addr >= self.loc && addr + len <= self.end()
    }

    fn overlaps(&self, addr: u64, len: u64) -> bool {
        !self.buf.is_empty() && addr < self.end() && self.loc < addr + len
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Read `dst.len()` bytes at `addr`. `limit` is the end of the storage
    /// block, which the window never reads past.
    pub(crate) async fn read(
        &mut self,
        file: &StorageFile,
        limit: u64,
        addr: u64,
        dst: &mut [u8],
    ) -> Result<()> {
        let len = dst.len() as u64;
        if self.contains(addr, len) {
            let at = (addr - self.loc).as_usize();
            dst.copy_from_slice(&self.buf[at..at + dst.len()]);
            return Ok(());
        }
        if len > self.cap as u64 {
            if self.dirty && self.overlaps(addr, len) {
                self.flush(file).await?;
            }
            return file.read_exact_at(addr, dst).await;
        }

        self.flush(file).await?;
        let n = (self.cap as u64).min(limit.saturating_sub(addr)).max(len);
        self.buf.resize(n.as_usize(), 0);
        self.loc = addr;
        file.read_exact_at(addr, &mut self.buf).await?;
        trace!(addr, len = n, "sieve refilled");
        dst.copy_from_slice(&self.buf[..dst.len()]);
        Ok(())
    }

    pub(crate) async fn write(&mut self, file: &StorageFile, addr: u64, src: &[u8]) -> Result<()> {
        let len = src.len() as u64;
        if self.contains(addr, len) {
            let at = (addr - self.loc).as_usize();
            self.buf[at..at + src.len()].copy_from_slice(src);
            self.dirty = true;
            return Ok(());
        }
        if len > self.cap as u64 {
            file.write_at(addr, src).await?;
            if self.overlaps(addr, len) {
                // keep the window coherent with what just went to disk
                let lo = addr.max(self.loc);
                let hi = (addr + len).min(self.end());
                let (b, s) = ((lo - self.loc).as_usize(), (lo - addr).as_usize());
                let n = (hi - lo).as_usize();
                self.buf[b..b + n].copy_from_slice(&src[s..s + n]);
            }
            return Ok(());
        }
        // Appending to a dirty window batches sequential writes.
        if self.dirty && addr == self.end() && self.buf.len() + src.len() <= self.cap {
            self.buf.extend_from_slice(src);
            return Ok(());
        }

        self.flush(file).await?;
        self.buf.clear();
        self.buf.extend_from_slice(src);
        self.loc = addr;
        self.dirty = true;
        Ok(())
    }

    pub(crate) async fn flush(&mut self, file: &StorageFile) -> Result<()> {
        if self.dirty {
            trace!(addr = self.loc, len = self.buf.len(), "sieve flushed");
            file.write_at(self.loc, &self.buf).await?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Forget the window without writing it back.
    pub(crate) fn invalidate(&mut self) {
        self.buf.clear();
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::file::{MemFile, RawFile};
    use std::sync::Arc;

    async fn file_with(data: &[u8]) -> (Arc<MemFile>, StorageFile) {
        let raw = Arc::new(MemFile::new());
        raw.write_at(0, data).await.unwrap();
        let file = StorageFile::open(raw.clone(), EngineConfig::default())
            .await
            .unwrap();
        (raw, file)
    }

    #[tokio::test]
    async fn test_small_reads_share_one_fill() {
        let data: Vec<u8> = (0..64).collect();
        let (raw, file) = file_with(&data).await;
        let reads = raw.read_count();
        let mut s = Sieve::new(16);
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        s.read(&file, 64, 8, &mut a).await.unwrap();
        s.read(&file, 64, 16, &mut b).await.unwrap();
        assert_eq!(a, [8, 9, 10, 11]);
        assert_eq!(b, [16, 17, 18, 19]);
        assert_eq!(raw.read_count(), reads + 1);
    }

    #[tokio::test]
    async fn test_window_stops_at_limit() {
        let (_raw, file) = file_with(&[1; 32]).await;
        let mut s = Sieve::new(64);
        let mut a = [0u8; 2];
        s.read(&file, 10, 4, &mut a).await.unwrap();
        assert_eq!(s.buf.len(), 6);
    }

    #[tokio::test]
    async fn test_sequential_writes_batch() {
        let (raw, file) = file_with(&[0; 32]).await;
        let writes = raw.write_count();
        let mut s = Sieve::new(16);
        s.write(&file, 0, &[1; 4]).await.unwrap();
        s.write(&file, 4, &[2; 4]).await.unwrap();
        assert_eq!(raw.write_count(), writes);
        s.flush(&file).await.unwrap();
        assert_eq!(raw.write_count(), writes + 1);
        assert!(!s.is_dirty());
        let snap = raw.snapshot().await;
        assert_eq!(&snap[..8], &[1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[tokio::test]
    async fn test_large_write_updates_window() {
        let (_raw, file) = file_with(&[0; 64]).await;
        let mut s = Sieve::new(8);
        let mut a = [0u8; 2];
        s.read(&file, 64, 4, &mut a).await.unwrap();
        s.write(&file, 0, &[7; 16]).await.unwrap();
        s.read(&file, 64, 6, &mut a).await.unwrap();
        assert_eq!(a, [7, 7]);
    }

    #[tokio::test]
    async fn test_disabled_sieve_goes_direct() {
        let (raw, file) = file_with(&[3; 8]).await;
        let mut s = Sieve::new(0);
        s.write(&file, 0, &[4; 2]).await.unwrap();
        assert!(!s.is_dirty());
        let mut a = [0u8; 3];
        s.read(&file, 8, 1, &mut a).await.unwrap();
        assert_eq!(a, [4, 3, 3]);
        assert_eq!(raw.snapshot().await[..2], [4, 4]);
    }
}
