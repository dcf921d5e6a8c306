//! Chunk cache: bounded, LRU-ordered, write-back cache of unfiltered chunks.
//!
//! Entries live in a hash map keyed by flat chunk index and are threaded on an
//! intrusive recency list (head = most recently used). The most recently
//! locked chunk is remembered so that a sequential scan hitting the same chunk
//! again skips the list update.
//!
//! Eviction is strict LRU over unlocked entries. Locked entries are skipped;
//! when every resident entry is locked the cache grows past its budget rather
//! than failing. A chunk bigger than the whole byte budget is never inserted:
//! its lock handle owns the buffer and a dirty unlock writes it straight back.

use super::index::{ChunkIndex, ChunkRecord};
use super::map::ChunkGeometry;
use crate::config::ChunkCacheConfig;
use crate::dataset::FillValue;
use crate::error::{Result, StorageError};
use crate::file::StorageFile;
use crate::filter::FilterPipeline;
use crate::utils::Gaps;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Everything a fault-in or a flush touches outside the cache itself.
pub struct ChunkBackend<'a> {
    pub file: &'a StorageFile,
    pub index: &'a mut ChunkIndex,
    pub pipeline: &'a FilterPipeline,
    pub fill: &'a FillValue,
    pub geom: &'a ChunkGeometry,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Chunks synthesised from the fill value instead of read.
    pub inits: u64,
    pub flushes: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum LockMode<'r> {
    /// Bring the chunk's current contents in.
    Fault,
    /// The caller will overwrite these byte ranges of the chunk. When they
    /// cover the whole chunk the read is skipped; otherwise this behaves
    /// like `Fault`.
    Overwrite(&'r [(u64, u64)]),
}

/// A pinned chunk.
#[derive(Debug)]
pub enum ChunkHandle {
    Cached(u64),
    Uncached(UncachedChunk),
}

#[derive(Debug)]
pub struct UncachedChunk {
    index: u64,
    origin: Vec<u64>,
    buf: Vec<u8>,
}

struct Entry {
    origin: Vec<u64>,
    buf: Vec<u8>,
    locked: u32,
    dirty: bool,
    /// Bytes read and written through this entry since it was faulted in.
    rd_bytes: u64,
    wr_bytes: u64,
    prev: Option<u64>,
    next: Option<u64>,
}

pub struct ChunkCache {
    config: ChunkCacheConfig,
    entries: HashMap<u64, Entry>,
    head: Option<u64>,
    tail: Option<u64>,
    nbytes_used: usize,
    last: Option<u64>,
    stats: CacheStats,
}

fn uncovered(ranges: &[(u64, u64)], size: u64) -> Gaps {
    let mut gaps = Gaps::new(size);
    for &(off, len) in ranges {
        gaps.cover(off, len);
    }
    gaps
}

/// Filter and store one chunk, moving it if its stored size changed.
///
/// The index is only updated once the data is on disk.
pub(crate) async fn write_chunk(
    backend: &mut ChunkBackend<'_>,
    origin: &[u64],
    data: &[u8],
) -> Result<()> {
    let (stored, filter_mask): (Cow<'_, [u8]>, u32) = if backend.pipeline.is_empty() {
        (Cow::Borrowed(data), 0)
    } else {
        let (out, mask) = backend.pipeline.apply(data)?;
        (Cow::Owned(out), mask)
    };
    let nbytes = u32::try_from(stored.len())
        .map_err(|_| StorageError::invalid("filtered chunk exceeds 4 GiB"))?;
    let size = nbytes as u64;

    let old = backend.index.get(origin).cloned();
    let (addr, fresh) = match &old {
        Some(rec) if rec.nbytes == nbytes => (rec.addr, false),
        _ => (backend.file.alloc(size), true),
    };
    if let Err(e) = backend.file.write_at(addr, &stored).await {
        if fresh {
            backend.file.free(addr, size);
        }
        return Err(e);
    }
    if fresh && let Some(rec) = &old {
        backend.file.free(rec.addr, rec.nbytes as u64);
    }
    trace!(?origin, addr, nbytes, filter_mask, "chunk stored");
    backend.index.insert(ChunkRecord {
        offset: origin.to_vec(),
        nbytes,
        filter_mask,
        addr,
    });
    Ok(())
}

impl ChunkCache {
    pub fn new(config: ChunkCacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::with_capacity(config.nslots.min(1024)),
            head: None,
            tail: None,
            nbytes_used: 0,
            last: None,
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resident_bytes(&self) -> usize {
        self.nbytes_used
    }

    pub fn is_cached(&self, index: u64) -> bool {
        self.entries.contains_key(&index)
    }

    pub fn is_dirty(&self, index: u64) -> bool {
        self.entries.get(&index).is_some_and(|e| e.dirty)
    }

    /// Chunk indices from most to least recently used.
    pub fn recency(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.entries.len());
        let mut cur = self.head;
        while let Some(idx) = cur {
            out.push(idx);
            cur = self.entries.get(&idx).and_then(|e| e.next);
        }
        out
    }

    /// Origins of every resident chunk.
    pub fn origins(&self) -> Vec<Vec<u64>> {
        self.entries.values().map(|e| e.origin.clone()).collect()
    }

    fn unlink(&mut self, idx: u64) {
        let Some((prev, next)) = self.entries.get(&idx).map(|e| (e.prev, e.next)) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(e) = self.entries.get_mut(&p) {
                    e.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(e) = self.entries.get_mut(&n) {
                    e.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(e) = self.entries.get_mut(&idx) {
            e.prev = None;
            e.next = None;
        }
    }

    fn push_front(&mut self, idx: u64) {
        let old_head = self.head;
        if let Some(e) = self.entries.get_mut(&idx) {
            e.prev = None;
            e.next = old_head;
        }
        if let Some(h) = old_head
            && let Some(e) = self.entries.get_mut(&h)
        {
            e.prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    /// Hit test; a hit becomes the most recently used entry.
    pub fn lookup(&mut self, index: u64) -> bool {
        if self.last == Some(index) {
            self.stats.hits += 1;
            return true;
        }
        if !self.entries.contains_key(&index) {
            self.stats.misses += 1;
            return false;
        }
        if self.head != Some(index) {
            self.unlink(index);
            self.push_front(index);
        }
        self.last = Some(index);
        self.stats.hits += 1;
        true
    }

    /// Pin a chunk, faulting it in on a miss.
    pub async fn lock(
        &mut self,
        backend: &mut ChunkBackend<'_>,
        index: u64,
        origin: &[u64],
        mode: LockMode<'_>,
    ) -> Result<ChunkHandle> {
        if self.lookup(index) {
            if let Some(e) = self.entries.get_mut(&index) {
                e.locked += 1;
            }
            trace!(chunk = index, "cache hit");
            return Ok(ChunkHandle::Cached(index));
        }

        let chunk_size = backend.geom.chunk_size();
        let overwrite = match mode {
            LockMode::Fault => false,
            LockMode::Overwrite(ranges) => {
                let gaps = uncovered(ranges, chunk_size as u64);
                if !gaps.is_empty() {
                    trace!(
                        chunk = index,
                        missing = gaps.len(),
                        first = ?gaps.ranges().first(),
                        "overwrite ranges leave gaps, faulting in"
                    );
                }
                gaps.is_empty()
            }
        };
        let buf = self.fault_in(backend, origin, overwrite).await?;

        if chunk_size > self.config.nbytes {
            debug!(
                chunk = index,
                chunk_size,
                budget = self.config.nbytes,
                "chunk exceeds cache budget, bypassing cache"
            );
            return Ok(ChunkHandle::Uncached(UncachedChunk {
                index,
                origin: origin.to_vec(),
                buf,
            }));
        }

        self.make_room(backend, chunk_size).await?;
        self.entries.insert(
            index,
            Entry {
                origin: origin.to_vec(),
                buf,
                locked: 1,
                dirty: false,
                rd_bytes: 0,
                wr_bytes: 0,
                prev: None,
                next: None,
            },
        );
        self.push_front(index);
        self.nbytes_used += chunk_size;
        self.last = Some(index);
        trace!(chunk = index, resident = self.entries.len(), "cache miss, chunk inserted");
        Ok(ChunkHandle::Cached(index))
    }

    /// Release a pin. `naccessed` is the number of bytes the caller touched.
    pub async fn unlock(
        &mut self,
        backend: &mut ChunkBackend<'_>,
        handle: ChunkHandle,
        dirty: bool,
        naccessed: u64,
    ) -> Result<()> {
        match handle {
            ChunkHandle::Cached(index) => {
                if let Some(e) = self.entries.get_mut(&index) {
                    e.locked = e.locked.saturating_sub(1);
                    if dirty {
                        e.dirty = true;
                        e.wr_bytes += naccessed;
                    } else {
                        e.rd_bytes += naccessed;
                    }
                }
                Ok(())
            }
            ChunkHandle::Uncached(chunk) => {
                if dirty {
                    write_chunk(backend, &chunk.origin, &chunk.buf).await?;
                    self.stats.flushes += 1;
                    trace!(chunk = chunk.index, "uncached chunk written through");
                }
                Ok(())
            }
        }
    }

    pub fn buf<'h>(&'h self, handle: &'h ChunkHandle) -> Result<&'h [u8]> {
        match handle {
            ChunkHandle::Cached(index) => self
                .entries
                .get(index)
                .map(|e| e.buf.as_slice())
                .ok_or_else(|| missing(*index)),
            ChunkHandle::Uncached(chunk) => Ok(&chunk.buf),
        }
    }

    pub fn buf_mut<'h>(&'h mut self, handle: &'h mut ChunkHandle) -> Result<&'h mut [u8]> {
        match handle {
            ChunkHandle::Cached(index) => self
                .entries
                .get_mut(index)
                .map(|e| e.buf.as_mut_slice())
                .ok_or_else(|| missing(*index)),
            ChunkHandle::Uncached(chunk) => Ok(&mut chunk.buf),
        }
    }

    async fn fault_in(
        &mut self,
        backend: &mut ChunkBackend<'_>,
        origin: &[u64],
        overwrite: bool,
    ) -> Result<Vec<u8>> {
        let size = backend.geom.chunk_size();
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| StorageError::Alloc { bytes: size })?;
        if overwrite {
            buf.resize(size, 0);
            return Ok(buf);
        }

        match backend.index.get(origin).cloned() {
            Some(rec) if backend.pipeline.is_empty() => {
                if rec.nbytes as usize != size {
                    return Err(StorageError::CorruptIndex(format!(
                        "unfiltered chunk {origin:?} stored with {} bytes, expected {size}",
                        rec.nbytes
                    )));
                }
                buf.resize(size, 0);
                backend.file.read_exact_at(rec.addr, &mut buf).await?;
            }
            Some(rec) => {
                let mut raw = vec![0u8; rec.nbytes as usize];
                backend.file.read_exact_at(rec.addr, &mut raw).await?;
                let out = backend.pipeline.reverse(&raw, rec.filter_mask)?;
                if out.len() != size {
                    return Err(StorageError::CorruptIndex(format!(
                        "chunk {origin:?} decoded to {} bytes, expected {size}",
                        out.len()
                    )));
                }
                buf.extend_from_slice(&out);
            }
            None => {
                buf.resize(size, 0);
                backend.fill.fill_at(&mut buf, 0);
                self.stats.inits += 1;
            }
        }
        Ok(buf)
    }

    async fn make_room(&mut self, backend: &mut ChunkBackend<'_>, need: usize) -> Result<()> {
        let mut cur = self.tail;
        while self.entries.len() >= self.config.nslots
            || self.nbytes_used + need > self.config.nbytes
        {
            let Some(idx) = cur else {
                debug!(
                    resident = self.entries.len(),
                    bytes = self.nbytes_used,
                    "every resident chunk is locked, exceeding cache budget"
                );
                break;
            };
            let (prev, locked) = match self.entries.get(&idx) {
                Some(e) => (e.prev, e.locked > 0),
                None => break,
            };
            if !locked {
                self.evict(backend, idx).await?;
            }
            cur = prev;
        }
        Ok(())
    }

    /// Write back one dirty, unlocked entry. Returns whether anything was written.
    pub async fn flush_one(&mut self, backend: &mut ChunkBackend<'_>, index: u64) -> Result<bool> {
        let Some(e) = self.entries.get(&index) else {
            return Ok(false);
        };
        if !e.dirty || e.locked > 0 {
            return Ok(false);
        }
        write_chunk(backend, &e.origin, &e.buf).await?;
        if let Some(e) = self.entries.get_mut(&index) {
            e.dirty = false;
        }
        self.stats.flushes += 1;
        Ok(true)
    }

    /// Write back every dirty entry in chunk order. Stops at the first failure;
    /// chunks already written stay written.
    pub async fn flush(&mut self, backend: &mut ChunkBackend<'_>) -> Result<()> {
        let mut dirty: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(&i, _)| i)
            .collect();
        dirty.sort_unstable();
        let mut flushed = 0;
        for index in dirty {
            if self.flush_one(backend, index).await? {
                flushed += 1;
            }
        }
        if flushed > 0 {
            debug!(flushed, "chunk cache flushed");
        }
        Ok(())
    }

    /// Flush if dirty, then drop the entry.
    pub async fn evict(&mut self, backend: &mut ChunkBackend<'_>, index: u64) -> Result<()> {
        self.flush_one(backend, index).await?;
        let Some(e) = self.entries.get(&index) else {
            return Ok(());
        };
        if e.locked > 0 || e.dirty {
            return Err(StorageError::invalid(format!(
                "chunk {index} is pinned and cannot be evicted"
            )));
        }
        debug!(
            chunk = index,
            read = e.rd_bytes,
            written = e.wr_bytes,
            "evicting chunk"
        );
        self.remove(index);
        self.stats.evictions += 1;
        Ok(())
    }

    fn remove(&mut self, index: u64) -> Option<Entry> {
        self.unlink(index);
        let e = self.entries.remove(&index)?;
        self.nbytes_used -= e.buf.len();
        if self.last == Some(index) {
            self.last = None;
        }
        Some(e)
    }

    /// Drop an entry without writing it back.
    pub fn invalidate(&mut self, index: u64) -> bool {
        self.remove(index).is_some()
    }

    /// Drop, without writing back, every entry whose origin matches.
    pub fn invalidate_where<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&[u64]) -> bool,
    {
        let doomed: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| pred(&e.origin))
            .map(|(&i, _)| i)
            .collect();
        for &index in &doomed {
            trace!(chunk = index, "chunk invalidated");
            self.remove(index);
        }
        doomed.len()
    }

    /// Flush everything and empty the cache.
    pub async fn destroy(&mut self, backend: &mut ChunkBackend<'_>) -> Result<()> {
        self.flush(backend).await?;
        self.entries.clear();
        self.head = None;
        self.tail = None;
        self.last = None;
        self.nbytes_used = 0;
        Ok(())
    }

    /// Recompute every key after the chunk grid changed, keeping recency order.
    pub fn rekey(&mut self, geom: &ChunkGeometry) {
        let order = self.recency();
        let mut old = std::mem::take(&mut self.entries);
        self.head = None;
        self.tail = None;
        self.last = None;
        for &index in order.iter().rev() {
            let Some(e) = old.remove(&index) else {
                continue;
            };
            let new_index = geom.index_of_origin(&e.origin);
            self.entries.insert(new_index, e);
            self.push_front(new_index);
        }
    }
}

fn missing(index: u64) -> StorageError {
    StorageError::invalid(format!("chunk {index} is not resident"))
}
