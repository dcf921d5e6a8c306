//! Chunked storage: fixed-size tiles located through the chunk index and
//! staged through the chunk cache.

pub mod cache;
pub mod index;
pub mod map;

pub use cache::{CacheStats, ChunkBackend, ChunkCache, ChunkHandle, LockMode};
pub use index::{ChunkIndex, ChunkRecord, IndexAddr};
pub use map::{ChunkGeometry, ChunkInfo, ChunkMap};

use super::{SpaceStatus, copy_pieces_in, copy_pieces_out};
use crate::config::ChunkCacheConfig;
use crate::dataset::FillValue;
use crate::error::{Result, StorageError};
use crate::file::StorageFile;
use crate::filter::FilterPipeline;
use crate::io::{IoOp, SeqList, out_of_buffer, pair_vv};
use crate::utils::{NumCastExt, unravel};
use cache::write_chunk;
use std::collections::BTreeSet;
use tracing::{debug, trace};

pub(crate) struct ChunkedStorage {
    geom: ChunkGeometry,
    index: ChunkIndex,
    cache: ChunkCache,
    pipeline: FilterPipeline,
    fill: FillValue,
    index_addr: Option<IndexAddr>,
    /// Index generation last written to `index_addr`.
    persisted: u64,
}

impl ChunkedStorage {
    pub(crate) fn create(
        geom: ChunkGeometry,
        pipeline: FilterPipeline,
        fill: FillValue,
        cache: ChunkCacheConfig,
    ) -> Self {
        Self {
            index: ChunkIndex::new(geom.rank()),
            geom,
            cache: ChunkCache::new(cache),
            pipeline,
            fill,
            index_addr: None,
            persisted: 0,
        }
    }

    pub(crate) async fn open(
        file: &StorageFile,
        geom: ChunkGeometry,
        pipeline: FilterPipeline,
        fill: FillValue,
        index_addr: Option<IndexAddr>,
    ) -> Result<Self> {
        let index = match index_addr {
            Some(at) => ChunkIndex::load(file, at).await?,
            None => ChunkIndex::new(geom.rank()),
        };
        if !index.is_empty() && index.rank() != geom.rank() {
            return Err(StorageError::CorruptIndex(format!(
                "index rank {} does not match dataset rank {}",
                index.rank(),
                geom.rank()
            )));
        }
        let persisted = index.generation();
        Ok(Self {
            index,
            geom,
            cache: ChunkCache::new(file.config().chunk_cache),
            pipeline,
            fill,
            index_addr,
            persisted,
        })
    }

    fn split<'s>(&'s mut self, file: &'s StorageFile) -> (&'s mut ChunkCache, ChunkBackend<'s>) {
        (
            &mut self.cache,
            ChunkBackend {
                file,
                index: &mut self.index,
                pipeline: &self.pipeline,
                fill: &self.fill,
                geom: &self.geom,
            },
        )
    }

    pub(crate) fn geom(&self) -> &ChunkGeometry {
        &self.geom
    }

    pub(crate) fn index(&self) -> &ChunkIndex {
        &self.index
    }

    pub(crate) fn cache(&self) -> &ChunkCache {
        &self.cache
    }

    pub(crate) fn pipeline(&self) -> &FilterPipeline {
        &self.pipeline
    }

    pub(crate) fn index_addr(&self) -> Option<IndexAddr> {
        self.index_addr
    }

    pub(crate) async fn readvv(
        &mut self,
        file: &StorageFile,
        chunk: &ChunkInfo,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &mut [u8],
    ) -> Result<u64> {
        let pieces = pair_vv(dset, mem);
        let chunk_size = self.geom.chunk_size() as u64;
        if let Some(p) = pieces.iter().find(|p| p.dset_off + p.len > chunk_size) {
            return Err(StorageError::InvalidSelection(format!(
                "range {}+{} runs past a {chunk_size}-byte chunk",
                p.dset_off, p.len
            )));
        }

        // Never written and not resident: synthesise straight into the buffer.
        if !self.cache.is_cached(chunk.index) && self.index.get(&chunk.origin).is_none() {
            let mut total = 0;
            let buf_len = buf.len();
            for p in &pieces {
                let m = p.mem_off.as_usize();
                let dst = buf
                    .get_mut(m..m + p.len.as_usize())
                    .ok_or_else(|| out_of_buffer(m + p.len.as_usize(), buf_len))?;
                self.fill.fill_at(dst, p.dset_off);
                total += p.len;
            }
            trace!(chunk = chunk.index, total, "read of unwritten chunk served from fill");
            return Ok(total);
        }

        let (cache, mut backend) = self.split(file);
        let handle = cache
            .lock(&mut backend, chunk.index, &chunk.origin, LockMode::Fault)
            .await?;
        let copied = cache
            .buf(&handle)
            .and_then(|data| copy_pieces_out(data, &pieces, buf));
        let naccessed = *copied.as_ref().unwrap_or(&0);
        cache.unlock(&mut backend, handle, false, naccessed).await?;
        copied
    }

    pub(crate) async fn writevv(
        &mut self,
        file: &StorageFile,
        chunk: &ChunkInfo,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &[u8],
    ) -> Result<u64> {
        let pieces = pair_vv(dset, mem);
        let chunk_size = self.geom.chunk_size() as u64;
        if let Some(p) = pieces.iter().find(|p| p.dset_off + p.len > chunk_size) {
            return Err(StorageError::InvalidSelection(format!(
                "range {}+{} runs past a {chunk_size}-byte chunk",
                p.dset_off, p.len
            )));
        }
        let ranges: Vec<(u64, u64)> = pieces.iter().map(|p| (p.dset_off, p.len)).collect();

        let (cache, mut backend) = self.split(file);
        let mut handle = cache
            .lock(
                &mut backend,
                chunk.index,
                &chunk.origin,
                LockMode::Overwrite(&ranges),
            )
            .await?;
        let copied = cache
            .buf_mut(&mut handle)
            .and_then(|data| copy_pieces_in(buf, &pieces, data));
        match copied {
            Ok(n) => {
                cache.unlock(&mut backend, handle, true, n).await?;
                Ok(n)
            }
            Err(e) => {
                cache.unlock(&mut backend, handle, false, 0).await?;
                Err(e)
            }
        }
    }

    /// Write back dirty chunks without touching the persisted index.
    pub(crate) async fn flush_cache(&mut self, file: &StorageFile) -> Result<()> {
        let (cache, mut backend) = self.split(file);
        cache.flush(&mut backend).await
    }

    /// Write back dirty chunks, then persist the index if it changed.
    pub(crate) async fn flush(&mut self, file: &StorageFile) -> Result<()> {
        self.flush_cache(file).await?;
        self.persist_index(file).await
    }

    async fn persist_index(&mut self, file: &StorageFile) -> Result<()> {
        let generation = self.index.generation();
        if generation == self.persisted {
            return Ok(());
        }
        let at = self.index.persist(file, self.index_addr).await?;
        self.index_addr = Some(at);
        self.persisted = generation;
        Ok(())
    }

    /// Tear down the cache, writing everything back first.
    pub(crate) async fn destroy(&mut self, file: &StorageFile) -> Result<()> {
        let (cache, mut backend) = self.split(file);
        cache.destroy(&mut backend).await?;
        self.persist_index(file).await
    }

    pub(crate) fn storage_size(&self) -> u64 {
        self.index.allocated_bytes()
    }

    pub(crate) fn allocation_status(&self) -> SpaceStatus {
        let total = self.geom.total_chunks();
        match self.index.len() as u64 {
            0 if total > 0 => SpaceStatus::NotAllocated,
            n if n >= total => SpaceStatus::Allocated,
            _ => SpaceStatus::PartAllocated,
        }
    }

    /// Store every chunk that has no record yet, filled with the fill value.
    pub(crate) async fn allocate(&mut self, file: &StorageFile) -> Result<()> {
        self.flush_cache(file).await?;
        let mut fill_chunk = vec![0u8; self.geom.chunk_size()];
        self.fill.fill_at(&mut fill_chunk, 0);

        let mut allocated = 0u64;
        for index in 0..self.geom.total_chunks() {
            let origin = self.geom.origin_of(index);
            if self.index.get(&origin).is_some() {
                continue;
            }
            let (_, mut backend) = self.split(file);
            write_chunk(&mut backend, &origin, &fill_chunk).await?;
            allocated += 1;
        }
        if allocated > 0 {
            debug!(allocated, "chunks allocated early");
        }
        Ok(())
    }

    /// Flush before a direct transfer; a direct write also drops the chunks it
    /// will overwrite so stale copies are not served afterwards.
    pub(crate) async fn prepare_direct(
        &mut self,
        file: &StorageFile,
        map: &ChunkMap,
        op: IoOp,
    ) -> Result<()> {
        self.flush_cache(file).await?;
        if op == IoOp::Write {
            for chunk in map.iter() {
                self.cache.invalidate(chunk.index);
            }
        }
        Ok(())
    }

    /// Address of every chunk in `map`, `None` where no storage exists yet.
    pub(crate) fn chunk_addrs(&self, map: &ChunkMap) -> Vec<(u64, Option<u64>)> {
        map.iter()
            .map(|c| (c.index, self.index.get(&c.origin).map(|r| r.addr)))
            .collect()
    }

    /// Resize to `dims`. The new geometry is committed before straddling chunks
    /// are reset, so on a reset failure `geom()` already reports `dims`.
    pub(crate) async fn change_extent(&mut self, file: &StorageFile, dims: &[u64]) -> Result<()> {
        let old_dims = self.geom.dims().to_vec();
        let geom = self.geom.resized(dims)?;

        // Chunks now wholly outside: drop without writing back.
        let dropped = self
            .cache
            .invalidate_where(|origin| ChunkGeometry::outside(origin, dims));
        let outside = self.index.outside_extent(dims);
        for rec in &outside {
            self.index.remove(&rec.offset);
            file.free(rec.addr, rec.nbytes as u64);
        }

        self.geom = geom;
        self.cache.rekey(&self.geom);
        debug!(
            ?old_dims,
            new_dims = ?dims,
            dropped_cached = dropped,
            dropped_stored = outside.len(),
            "chunked extent changed"
        );

        let shrunk = dims.iter().zip(&old_dims).any(|(n, o)| n < o);
        if !shrunk {
            return Ok(());
        }
        let mut straddling: BTreeSet<Vec<u64>> = self
            .index
            .iter()
            .filter(|r| self.geom.straddles(&r.offset, dims))
            .map(|r| r.offset.clone())
            .collect();
        straddling.extend(
            self.cache
                .origins()
                .into_iter()
                .filter(|o| self.geom.straddles(o, dims)),
        );
        for origin in straddling {
            self.reset_outside(file, &origin, dims).await?;
        }
        Ok(())
    }

    /// Set the elements of one chunk that fall outside `dims` back to fill.
    async fn reset_outside(&mut self, file: &StorageFile, origin: &[u64], dims: &[u64]) -> Result<()> {
        let index = self.geom.index_of_origin(origin);
        let elem_size = self.geom.elem_size();
        let chunk_dims = self.geom.chunk_dims().to_vec();
        let nelmts = self.geom.chunk_nelmts();

        let (cache, mut backend) = self.split(file);
        let mut handle = cache
            .lock(&mut backend, index, origin, LockMode::Fault)
            .await?;
        let fill = backend.fill;
        let reset = cache.buf_mut(&mut handle).map(|data| {
            let mut within = vec![0u64; chunk_dims.len()];
            let mut n = 0u64;
            for k in 0..nelmts {
                unravel(k, &chunk_dims, &mut within);
                let outside = within
                    .iter()
                    .zip(origin)
                    .zip(dims)
                    .any(|((&w, &o), &d)| o + w >= d);
                if outside {
                    let at = k.as_usize() * elem_size;
                    fill.fill_at(&mut data[at..at + elem_size], at as u64);
                    n += elem_size as u64;
                }
            }
            n
        });
        match reset {
            Ok(n) => {
                trace!(chunk = index, bytes = n, "out-of-extent elements reset");
                cache.unlock(&mut backend, handle, true, n).await
            }
            Err(e) => {
                cache.unlock(&mut backend, handle, false, 0).await?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::file::MemFile;
    use crate::space::{Dataspace, Hyperslab};
    use std::sync::Arc;

    async fn storage(dims: &[u64], chunk: &[u64]) -> (Arc<MemFile>, StorageFile, ChunkedStorage) {
        let raw = Arc::new(MemFile::new());
        let file = StorageFile::open(raw.clone(), EngineConfig::default())
            .await
            .unwrap();
        let geom = ChunkGeometry::new(dims, chunk, 1).unwrap();
        let s = ChunkedStorage::create(
            geom,
            FilterPipeline::new(),
            FillValue::zero(),
            ChunkCacheConfig::default(),
        );
        (raw, file, s)
    }

    async fn write_block(s: &mut ChunkedStorage, file: &StorageFile, start: &[u64], size: &[u64], byte: u8) {
        let mut fs = Dataspace::new(s.geom().dims());
        fs.select_hyperslab(Hyperslab::block(start, size)).unwrap();
        let n = fs.npoints();
        let ms = Dataspace::new(&[n]);
        let map = ChunkMap::build(s.geom(), &fs, &ms).unwrap();
        let data = vec![byte; n as usize];
        for chunk in map.iter() {
            let mut dset = SeqList::default();
            chunk.file_spans.iter().for_each(|&(o, l)| dset.push(o, l));
            let mut mem = SeqList::default();
            chunk.mem_spans.iter().for_each(|&(o, l)| mem.push(o, l));
            s.writevv(file, chunk, &mut dset, &mut mem, &data).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unwritten_read_does_not_cache() {
        let (raw, file, mut s) = storage(&[8], &[4]).await;
        let map = ChunkMap::build(s.geom(), &Dataspace::new(&[8]), &Dataspace::new(&[8])).unwrap();
        let mut buf = [7u8; 8];
        for chunk in map.iter() {
            let mut dset = SeqList::single(0, 4);
            let mut mem = SeqList::single(chunk.origin[0], 4);
            assert_eq!(s.readvv(&file, chunk, &mut dset, &mut mem, &mut buf).await.unwrap(), 4);
        }
        assert_eq!(buf, [0; 8]);
        assert!(s.cache().is_empty());
        assert_eq!(raw.read_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_persists_index_once() {
        let (raw, file, mut s) = storage(&[8], &[4]).await;
        write_block(&mut s, &file, &[2], &[4], 5).await;
        s.flush(&file).await.unwrap();
        assert_eq!(s.index().len(), 2);
        let at = s.index_addr().unwrap();

        let writes = raw.write_count();
        s.flush(&file).await.unwrap();
        assert_eq!(raw.write_count(), writes);
        assert_eq!(s.index_addr(), Some(at));
        assert_eq!(s.allocation_status(), SpaceStatus::Allocated);
    }

    #[tokio::test]
    async fn test_shrink_resets_straddling_chunk() {
        let (_raw, file, mut s) = storage(&[8], &[4]).await;
        write_block(&mut s, &file, &[0], &[8], 9).await;
        s.flush(&file).await.unwrap();

        s.change_extent(&file, &[3]).await.unwrap();
        assert_eq!(s.index().len(), 1);
        s.change_extent(&file, &[8]).await.unwrap();

        let fs = Dataspace::new(&[8]);
        let map = ChunkMap::build(s.geom(), &fs, &fs).unwrap();
        let mut buf = [1u8; 8];
        for chunk in map.iter() {
            let mut dset = SeqList::single(0, 4);
            let mut mem = SeqList::single(chunk.origin[0], 4);
            s.readvv(&file, chunk, &mut dset, &mut mem, &mut buf).await.unwrap();
        }
        assert_eq!(buf, [9, 9, 9, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_early_allocation() {
        let (_raw, file, mut s) = storage(&[10, 10], &[4, 4]).await;
        assert_eq!(s.allocation_status(), SpaceStatus::NotAllocated);
        write_block(&mut s, &file, &[0, 0], &[1, 1], 1).await;
        s.allocate(&file).await.unwrap();
        assert_eq!(s.index().len(), 9);
        assert_eq!(s.storage_size(), 9 * 16);
        assert_eq!(s.allocation_status(), SpaceStatus::Allocated);
    }
}
