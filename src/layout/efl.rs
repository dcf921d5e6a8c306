//! External file list: the dataset's bytes are the concatenation of segments
//! of other files.

use super::SpaceStatus;
use crate::error::{Result, StorageError};
use crate::file::{RawFile, StorageFile};
use crate::io::{SeqList, out_of_buffer, pair_vv};
use crate::utils::NumCastExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One segment: `size` bytes of file `name` starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEntry {
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

impl ExternalEntry {
    pub fn new(name: impl Into<String>, offset: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            offset,
            size,
        }
    }
}

pub(crate) struct ExternalStorage {
    entries: Vec<ExternalEntry>,
    /// Dataset byte offset at which each entry starts.
    starts: Vec<u64>,
    total: u64,
    files: HashMap<String, Arc<dyn RawFile>>,
}

impl ExternalStorage {
    pub(crate) fn new(entries: Vec<ExternalEntry>) -> Self {
        let mut starts = Vec::with_capacity(entries.len());
        let mut total = 0;
        for e in &entries {
            starts.push(total);
            total += e.size;
        }
        Self {
            entries,
            starts,
            total,
            files: HashMap::new(),
        }
    }

    pub(crate) fn entries(&self) -> &[ExternalEntry] {
        &self.entries
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.total
    }

    pub(crate) fn allocation_status(&self) -> SpaceStatus {
        SpaceStatus::Allocated
    }

    async fn resolve(&mut self, file: &StorageFile, name: &str) -> Result<Arc<dyn RawFile>> {
        if let Some(f) = self.files.get(name) {
            return Ok(f.clone());
        }
        let resolver = file.resolver().ok_or_else(|| {
            StorageError::unsupported("external storage needs a file resolver")
        })?;
        let f = resolver.resolve(name).await.map_err(StorageError::Io)?;
        debug!(name, "external file resolved");
        self.files.insert(name.to_string(), f.clone());
        Ok(f)
    }

    /// Split `[off, off + len)` of the dataset into per-entry parts:
    /// `(entry, offset within entry, position within the range, len)`.
    fn segments(&self, off: u64, len: u64) -> Result<Vec<(usize, u64, u64, u64)>> {
        if off + len > self.total {
            return Err(StorageError::InvalidSelection(format!(
                "range {off}+{len} runs past {} bytes of external storage",
                self.total
            )));
        }
        let mut out = Vec::new();
        let mut i = self.starts.partition_point(|&s| s <= off).saturating_sub(1);
        let (mut at, end) = (off, off + len);
        while at < end {
            let seg_end = self.starts[i] + self.entries[i].size;
            let n = seg_end.min(end) - at;
            if n > 0 {
                out.push((i, at - self.starts[i], at - off, n));
            }
            at += n;
            i += 1;
        }
        Ok(out)
    }

    pub(crate) async fn readvv(
        &mut self,
        file: &StorageFile,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &mut [u8],
    ) -> Result<u64> {
        let pieces = pair_vv(dset, mem);
        let mut total = 0;
        for p in &pieces {
            for (i, within, pos, n) in self.segments(p.dset_off, p.len)? {
                let name = self.entries[i].name.clone();
                let raw = self.resolve(file, &name).await?;
                let m = (p.mem_off + pos).as_usize();
                let buf_len = buf.len();
                let dst = buf
                    .get_mut(m..m + n.as_usize())
                    .ok_or_else(|| out_of_buffer(m + n.as_usize(), buf_len))?;
                let got = raw
                    .read_at(self.entries[i].offset + within, dst)
                    .await
                    .map_err(StorageError::Io)?;
                // short external files read as zeros
                dst[got..].fill(0);
            }
            total += p.len;
        }
        Ok(total)
    }

    pub(crate) async fn writevv(
        &mut self,
        file: &StorageFile,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &[u8],
    ) -> Result<u64> {
        let pieces = pair_vv(dset, mem);
        let mut total = 0;
        for p in &pieces {
            for (i, within, pos, n) in self.segments(p.dset_off, p.len)? {
                let name = self.entries[i].name.clone();
                let raw = self.resolve(file, &name).await?;
                let m = (p.mem_off + pos).as_usize();
                let src = buf
                    .get(m..m + n.as_usize())
                    .ok_or_else(|| out_of_buffer(m + n.as_usize(), buf.len()))?;
                raw.write_at(self.entries[i].offset + within, src)
                    .await
                    .map_err(StorageError::Io)?;
            }
            total += p.len;
        }
        Ok(total)
    }

    pub(crate) async fn flush(&self) -> Result<()> {
        for f in self.files.values() {
            f.sync().await.map_err(StorageError::Io)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::file::{MemFile, MemResolver};

    #[test]
    fn test_segments_cross_entries() {
        let s = ExternalStorage::new(vec![
            ExternalEntry::new("a", 100, 4),
            ExternalEntry::new("b", 0, 4),
            ExternalEntry::new("a", 0, 8),
        ]);
        assert_eq!(s.total_size(), 16);
        let segs = s.segments(2, 10).unwrap();
        assert_eq!(segs, vec![(0, 2, 0, 2), (1, 0, 2, 4), (2, 0, 6, 4)]);
        assert!(s.segments(12, 5).is_err());
    }

    #[tokio::test]
    async fn test_write_then_read_across_files() {
        let resolver = Arc::new(MemResolver::new());
        let a = resolver.file("a.bin");
        let file = StorageFile::open(Arc::new(MemFile::new()), EngineConfig::default())
            .await
            .unwrap()
            .with_resolver(resolver.clone());
        let mut s = ExternalStorage::new(vec![
            ExternalEntry::new("a.bin", 10, 3),
            ExternalEntry::new("b.bin", 0, 5),
        ]);

        let mut dset = SeqList::single(1, 4);
        let mut mem = SeqList::single(0, 4);
        s.writevv(&file, &mut dset, &mut mem, &[1, 2, 3, 4]).await.unwrap();
        assert_eq!(a.snapshot().await[11..13], [1, 2]);

        let mut out = [9u8; 8];
        let mut dset = SeqList::single(0, 8);
        let mut mem = SeqList::single(0, 8);
        s.readvv(&file, &mut dset, &mut mem, &mut out).await.unwrap();
        assert_eq!(out, [0, 1, 2, 3, 4, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_missing_resolver() {
        let file = StorageFile::open(Arc::new(MemFile::new()), EngineConfig::default())
            .await
            .unwrap();
        let mut s = ExternalStorage::new(vec![ExternalEntry::new("x", 0, 4)]);
        let mut out = [0u8; 4];
        let mut dset = SeqList::single(0, 4);
        let mut mem = SeqList::single(0, 4);
        let err = s.readvv(&file, &mut dset, &mut mem, &mut out).await.unwrap_err();
        assert!(matches!(err, StorageError::Unsupported(_)));
    }
}
