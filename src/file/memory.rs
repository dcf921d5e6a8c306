//! In-memory backing file for tests and scratch datasets.

use super::RawFile;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

const UNLIMITED: u64 = u64::MAX;

/// A growable byte vector behind the `RawFile` seam.
///
/// Counts every read and write so callers can observe cache behaviour, and can
/// be told to start failing writes after a number of successful ones.
pub struct MemFile {
    data: RwLock<Vec<u8>>,
    reads: AtomicU64,
    writes: AtomicU64,
    writes_left: AtomicU64,
}

impl Default for MemFile {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFile {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            writes_left: AtomicU64::new(UNLIMITED),
        }
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Allow `n` more writes to succeed, then fail every write after that.
    pub fn fail_writes_after(&self, n: u64) {
        self.writes_left.store(n, Ordering::Relaxed);
    }

    pub fn clear_failures(&self) {
        self.writes_left.store(UNLIMITED, Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> Vec<u8> {
        self.data.read().await.clone()
    }
}

#[async_trait]
impl RawFile for MemFile {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<usize> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let guard = self.data.read().await;
        let start = (offset as usize).min(guard.len());
        let end = (start + buf.len()).min(guard.len());
        let n = end - start;
        buf[..n].copy_from_slice(&guard[start..end]);
        Ok(n)
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let left = self.writes_left.load(Ordering::Relaxed);
        if left == 0 {
            anyhow::bail!("injected write failure at offset {offset}");
        }
        if left != UNLIMITED {
            self.writes_left.store(left - 1, Ordering::Relaxed);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);

        let mut guard = self.data.write().await;
        let start = offset as usize;
        let end = start + data.len();
        if guard.len() < end {
            guard.resize(end, 0);
        }
        guard[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn len(&self) -> anyhow::Result<u64> {
        Ok(self.data.read().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_short_read_past_eof() {
        let f = MemFile::new();
        f.write_at(4, &[1, 2, 3]).await.unwrap();
        assert_eq!(f.len().await.unwrap(), 7);

        let mut buf = [9u8; 6];
        let n = f.read_at(3, &mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &[0, 1, 2, 3]);

        let n = f.read_at(100, &mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(f.read_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let f = MemFile::new();
        f.fail_writes_after(1);
        f.write_at(0, &[1]).await.unwrap();
        assert!(f.write_at(1, &[2]).await.is_err());
        f.clear_failures();
        f.write_at(1, &[2]).await.unwrap();
        assert_eq!(f.write_count(), 2);
        assert_eq!(f.snapshot().await, vec![1, 2]);
    }
}
