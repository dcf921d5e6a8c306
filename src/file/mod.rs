//! Backing-file abstraction.
//!
//! `RawFile` is the async byte-addressed seam (local disk, memory, anything
//! else). `StorageFile` wraps one with the engine's per-file state: the
//! file-space allocator, the file-access configuration, the external-file
//! resolver and the registry of open dataset instances.

mod alloc;
mod external;
mod local;
mod memory;

pub use external::{DirResolver, ExternalResolver, MemResolver};
pub use local::LocalFile;
pub use memory::MemFile;

use crate::config::EngineConfig;
use crate::dataset::{DatasetInstance, SharedInstance};
use crate::error::{Result, StorageError};
use alloc::FileSpace;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

#[async_trait]
pub trait RawFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns fewer at end of file.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<usize>;

    async fn write_at(&self, offset: u64, data: &[u8]) -> anyhow::Result<()>;

    async fn len(&self) -> anyhow::Result<u64>;

    async fn sync(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct StorageFile {
    raw: Arc<dyn RawFile>,
    config: EngineConfig,
    space: Mutex<FileSpace>,
    resolver: Option<Arc<dyn ExternalResolver>>,
    open: Mutex<HashMap<u64, Weak<DatasetInstance>>>,
}

impl StorageFile {
    /// Wrap a backing file. Allocation starts at its current end.
    pub async fn open(raw: Arc<dyn RawFile>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let eoa = raw.len().await.map_err(StorageError::Io)?;
        debug!(eoa, "storage file opened");
        Ok(Self {
            raw,
            config,
            space: Mutex::new(FileSpace::new(eoa)),
            resolver: None,
            open: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_resolver(self, resolver: Arc<dyn ExternalResolver>) -> Self {
        Self {
            resolver: Some(resolver),
            ..self
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn raw(&self) -> &Arc<dyn RawFile> {
        &self.raw
    }

    pub(crate) fn resolver(&self) -> Option<&Arc<dyn ExternalResolver>> {
        self.resolver.as_ref()
    }

    /// End of allocated space.
    pub fn eoa(&self) -> u64 {
        self.space.lock().eoa()
    }

    pub fn free_bytes(&self) -> u64 {
        self.space.lock().free_bytes()
    }

    pub(crate) fn alloc(&self, size: u64) -> u64 {
        self.space.lock().alloc(size)
    }

    pub(crate) fn free(&self, addr: u64, size: u64) {
        self.space.lock().free(addr, size)
    }

    /// Fill `buf` from `addr`. Bytes past the physical end of file read as zero.
    pub(crate) async fn read_exact_at(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        trace!(addr, len = buf.len(), "raw read");
        let n = self
            .raw
            .read_at(addr, buf)
            .await
            .map_err(StorageError::Io)?;
        buf[n..].fill(0);
        Ok(())
    }

    pub(crate) async fn write_at(&self, addr: u64, data: &[u8]) -> Result<()> {
        trace!(addr, len = data.len(), "raw write");
        self.raw
            .write_at(addr, data)
            .await
            .map_err(StorageError::Io)
    }

    pub async fn sync(&self) -> Result<()> {
        self.raw.sync().await.map_err(StorageError::Io)
    }

    pub(crate) fn register(&self, addr: u64, instance: &SharedInstance) {
        self.open.lock().insert(addr, Arc::downgrade(instance));
    }

    /// Live instance for the dataset whose object header is at `addr`.
    pub(crate) fn lookup(&self, addr: u64) -> Option<SharedInstance> {
        let mut open = self.open.lock();
        match open.get(&addr).and_then(Weak::upgrade) {
            Some(instance) => Some(instance),
            None => {
                open.remove(&addr);
                None
            }
        }
    }

    pub(crate) fn unregister(&self, addr: u64) {
        self.open.lock().remove(&addr);
    }

    pub fn open_instances(&self) -> usize {
        self.open
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_zero_fills_past_eof() {
        let raw = Arc::new(MemFile::new());
        raw.write_at(0, &[5; 4]).await.unwrap();
        let file = StorageFile::open(raw, EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(file.eoa(), 4);

        let mut buf = [1u8; 8];
        file.read_exact_at(2, &mut buf).await.unwrap();
        assert_eq!(buf, [5, 5, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_write_failure_is_io_error() {
        let raw = Arc::new(MemFile::new());
        raw.fail_writes_after(0);
        let file = StorageFile::open(raw, EngineConfig::default())
            .await
            .unwrap();
        let err = file.write_at(0, &[1]).await.unwrap_err();
        assert!(err.is_io());
    }

    #[tokio::test]
    async fn test_alloc_starts_at_existing_end() {
        let raw = Arc::new(MemFile::new());
        raw.write_at(0, &[0; 32]).await.unwrap();
        let file = StorageFile::open(raw, EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(file.alloc(16), 32);
        file.free(32, 16);
        assert_eq!(file.eoa(), 32);
    }
}
