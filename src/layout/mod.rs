//! Layout dispatch.
//!
//! The set of storage layouts is closed, so dispatch is a `match` over
//! [`Layout`]. Every layout provides vectored reads and writes over byte
//! sequence lists; the serial paths drive those through the scatter/gather
//! engine, the parallel paths go straight to the file at known addresses.

pub mod chunk;
mod compact;
mod contig;
mod efl;
mod sieve;

pub use efl::ExternalEntry;

use crate::dataset::FillValue;
use crate::error::{Result, StorageError};
use crate::file::StorageFile;
use crate::filter::FilterPipeline;
use crate::io::{IoInfo, IoOp, Piece, SeqFeed, SeqList, out_of_buffer, pair_vv, scatgath};
use crate::parallel::ChunkAddrMap;
use crate::utils::{NumCastExt, product};
use chunk::{ChunkGeometry, ChunkInfo, ChunkMap, ChunkedStorage, IndexAddr};
use compact::CompactStorage;
use contig::ContigStorage;
use efl::ExternalStorage;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    Contiguous,
    Chunked,
    Compact,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceStatus {
    NotAllocated,
    PartAllocated,
    Allocated,
}

/// Persisted description of where a dataset's raw data lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayoutDescriptor {
    Contiguous {
        addr: Option<u64>,
        size: u64,
    },
    Chunked {
        chunk_dims: Vec<u64>,
        index: Option<IndexAddr>,
    },
    Compact {
        #[serde(default)]
        data: Vec<u8>,
    },
    External {
        entries: Vec<ExternalEntry>,
    },
}

impl LayoutDescriptor {
    pub fn kind(&self) -> LayoutKind {
        match self {
            LayoutDescriptor::Contiguous { .. } => LayoutKind::Contiguous,
            LayoutDescriptor::Chunked { .. } => LayoutKind::Chunked,
            LayoutDescriptor::Compact { .. } => LayoutKind::Compact,
            LayoutDescriptor::External { .. } => LayoutKind::External,
        }
    }
}

pub(crate) enum Layout {
    Contiguous(ContigStorage),
    Chunked(ChunkedStorage),
    Compact(CompactStorage),
    External(ExternalStorage),
}

pub(crate) fn checked_mem_range(buf: &mut [u8], off: u64, len: u64) -> Result<&mut [u8]> {
    let (off, len) = (off.as_usize(), len.as_usize());
    let buf_len = buf.len();
    buf.get_mut(off..off + len)
        .ok_or_else(|| out_of_buffer(off + len, buf_len))
}

pub(crate) fn checked_src_range(buf: &[u8], off: u64, len: u64) -> Result<&[u8]> {
    let (off, len) = (off.as_usize(), len.as_usize());
    buf.get(off..off + len)
        .ok_or_else(|| out_of_buffer(off + len, buf.len()))
}

/// Copy matched pieces from storage bytes `src` into the memory buffer.
pub(crate) fn copy_pieces_out(src: &[u8], pieces: &[Piece], buf: &mut [u8]) -> Result<u64> {
    let mut n = 0;
    for p in pieces {
        let from = checked_src_range(src, p.dset_off, p.len)?;
        checked_mem_range(buf, p.mem_off, p.len)?.copy_from_slice(from);
        n += p.len;
    }
    Ok(n)
}

/// Copy matched pieces from the memory buffer into storage bytes `dst`.
pub(crate) fn copy_pieces_in(buf: &[u8], pieces: &[Piece], dst: &mut [u8]) -> Result<u64> {
    // validate first so a bad piece leaves `dst` untouched
    for p in pieces {
        checked_src_range(buf, p.mem_off, p.len)?;
        checked_src_range(dst, p.dset_off, p.len)?;
    }
    let mut n = 0;
    for p in pieces {
        let from = checked_src_range(buf, p.mem_off, p.len)?;
        checked_mem_range(dst, p.dset_off, p.len)?.copy_from_slice(from);
        n += p.len;
    }
    Ok(n)
}

fn no_map() -> StorageError {
    StorageError::invalid("chunked transfer started without a chunk map")
}

fn only_chunked(op: &str) -> StorageError {
    StorageError::unsupported(format!("{op} requires chunked storage"))
}

/// Build both sequence lists up front and move the bytes straight between
/// the file at `base` and the buffer.
async fn direct_read<I, J>(
    file: &StorageFile,
    base: u64,
    file_spans: I,
    mem_spans: J,
    elem_size: usize,
    buf: &mut [u8],
) -> Result<()>
where
    I: Iterator<Item = (u64, u64)>,
    J: Iterator<Item = (u64, u64)>,
{
    let (mut dset, mut mem) = direct_lists(file_spans, mem_spans, elem_size)?;
    for p in pair_vv(&mut dset, &mut mem) {
        let dst = checked_mem_range(buf, p.mem_off, p.len)?;
        file.read_exact_at(base + p.dset_off, dst).await?;
    }
    Ok(())
}

async fn direct_write<I, J>(
    file: &StorageFile,
    base: u64,
    file_spans: I,
    mem_spans: J,
    elem_size: usize,
    buf: &[u8],
) -> Result<()>
where
    I: Iterator<Item = (u64, u64)>,
    J: Iterator<Item = (u64, u64)>,
{
    let (mut dset, mut mem) = direct_lists(file_spans, mem_spans, elem_size)?;
    for p in pair_vv(&mut dset, &mut mem) {
        let src = checked_src_range(buf, p.mem_off, p.len)?;
        file.write_at(base + p.dset_off, src).await?;
    }
    Ok(())
}

fn direct_lists<I, J>(file_spans: I, mem_spans: J, elem_size: usize) -> Result<(SeqList, SeqList)>
where
    I: Iterator<Item = (u64, u64)>,
    J: Iterator<Item = (u64, u64)>,
{
    let mut dset = SeqList::default();
    let mut mem = SeqList::default();
    SeqFeed::new(file_spans, elem_size).fill(&mut dset, usize::MAX, u64::MAX);
    SeqFeed::new(mem_spans, elem_size).fill(&mut mem, usize::MAX, u64::MAX);
    if dset.total() != mem.total() {
        return Err(StorageError::InvalidSelection(
            "file and memory selections diverged".to_string(),
        ));
    }
    Ok((dset, mem))
}

impl Layout {
    /// Fresh storage for a new dataset. `template` picks the layout; any
    /// addresses or data in it are ignored.
    pub(crate) fn create(
        file: &StorageFile,
        template: &LayoutDescriptor,
        elem_size: usize,
        dims: &[u64],
        fill: &FillValue,
        pipeline: &FilterPipeline,
    ) -> Result<Self> {
        let size = product(dims) * elem_size as u64;
        if !pipeline.is_empty() && template.kind() != LayoutKind::Chunked {
            return Err(only_chunked("a filter pipeline"));
        }
        let layout = match template {
            LayoutDescriptor::Contiguous { .. } => Layout::Contiguous(ContigStorage::new(
                None,
                size,
                file.config().sieve_buf_size,
                fill.clone(),
            )),
            LayoutDescriptor::Chunked { chunk_dims, .. } => {
                let geom = ChunkGeometry::new(dims, chunk_dims, elem_size)?;
                Layout::Chunked(ChunkedStorage::create(
                    geom,
                    pipeline.clone(),
                    fill.clone(),
                    file.config().chunk_cache,
                ))
            }
            LayoutDescriptor::Compact { .. } => {
                let max = file.config().max_compact_size;
                if size > max as u64 {
                    return Err(StorageError::invalid(format!(
                        "{size} bytes of raw data exceed the {max}-byte compact limit"
                    )));
                }
                let mut data = vec![0u8; size.as_usize()];
                fill.fill_at(&mut data, 0);
                Layout::Compact(CompactStorage::new(data))
            }
            LayoutDescriptor::External { entries } => {
                let ext = ExternalStorage::new(entries.clone());
                if ext.total_size() < size {
                    return Err(StorageError::invalid(format!(
                        "external segments hold {} bytes, dataset needs {size}",
                        ext.total_size()
                    )));
                }
                Layout::External(ext)
            }
        };
        debug!(kind = ?layout.kind(), size, "layout created");
        Ok(layout)
    }

    /// Storage for an existing dataset, as recorded in `desc`.
    pub(crate) async fn open(
        file: &StorageFile,
        desc: &LayoutDescriptor,
        elem_size: usize,
        dims: &[u64],
        fill: &FillValue,
        pipeline: &FilterPipeline,
    ) -> Result<Self> {
        let size = product(dims) * elem_size as u64;
        let layout = match desc {
            LayoutDescriptor::Contiguous { addr, size: stored } => {
                if *stored != size {
                    return Err(StorageError::invalid(format!(
                        "contiguous storage of {stored} bytes, dataset needs {size}"
                    )));
                }
                Layout::Contiguous(ContigStorage::new(
                    *addr,
                    size,
                    file.config().sieve_buf_size,
                    fill.clone(),
                ))
            }
            LayoutDescriptor::Chunked { chunk_dims, index } => {
                let geom = ChunkGeometry::new(dims, chunk_dims, elem_size)?;
                Layout::Chunked(
                    ChunkedStorage::open(file, geom, pipeline.clone(), fill.clone(), *index)
                        .await?,
                )
            }
            LayoutDescriptor::Compact { data } => {
                if data.len() as u64 != size {
                    return Err(StorageError::invalid(format!(
                        "compact buffer of {} bytes, dataset needs {size}",
                        data.len()
                    )));
                }
                Layout::Compact(CompactStorage::new(data.clone()))
            }
            LayoutDescriptor::External { entries } => {
                Layout::External(ExternalStorage::new(entries.clone()))
            }
        };
        Ok(layout)
    }

    pub(crate) fn kind(&self) -> LayoutKind {
        match self {
            Layout::Contiguous(_) => LayoutKind::Contiguous,
            Layout::Chunked(_) => LayoutKind::Chunked,
            Layout::Compact(_) => LayoutKind::Compact,
            Layout::External(_) => LayoutKind::External,
        }
    }

    pub(crate) fn chunked(&self) -> Option<&ChunkedStorage> {
        match self {
            Layout::Chunked(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn descriptor(&self) -> LayoutDescriptor {
        match self {
            Layout::Contiguous(c) => LayoutDescriptor::Contiguous {
                addr: c.addr(),
                size: c.size(),
            },
            Layout::Chunked(c) => LayoutDescriptor::Chunked {
                chunk_dims: c.geom().chunk_dims().to_vec(),
                index: c.index_addr(),
            },
            Layout::Compact(c) => LayoutDescriptor::Compact {
                data: c.data().to_vec(),
            },
            Layout::External(e) => LayoutDescriptor::External {
                entries: e.entries().to_vec(),
            },
        }
    }

    /// Per-call setup: chunked storage partitions the selections by chunk.
    pub(crate) fn init(&self, io: &IoInfo<'_>) -> Result<Option<ChunkMap>> {
        match self {
            Layout::Chunked(c) => {
                let map = ChunkMap::build(c.geom(), io.file_space, io.mem_space)?;
                trace!(chunks = map.len(), single = map.is_single(), "chunk map ready");
                Ok(Some(map))
            }
            _ => Ok(None),
        }
    }

    /// Per-call teardown.
    pub(crate) fn term(&mut self, map: Option<ChunkMap>) {
        if let Some(map) = map {
            trace!(chunks = map.len(), nelmts = map.nelmts(), "chunk map released");
        }
    }

    #[instrument(level = "debug", skip_all, fields(kind = ?self.kind(), nelmts = io.nelmts))]
    pub(crate) async fn ser_read(
        &mut self,
        io: &mut IoInfo<'_>,
        map: Option<&ChunkMap>,
        buf: &mut [u8],
    ) -> Result<()> {
        if matches!(self, Layout::Chunked(_)) {
            let map = map.ok_or_else(no_map)?;
            for chunk in map.iter() {
                scatgath::read(
                    self,
                    io,
                    Some(chunk),
                    chunk.file_spans.iter().copied(),
                    chunk.mem_spans.iter().copied(),
                    chunk.npoints,
                    buf,
                )
                .await?;
            }
            return Ok(());
        }
        let (fs, ms, nelmts) = (io.file_space, io.mem_space, io.nelmts);
        scatgath::read(self, io, None, fs.spans(), ms.spans(), nelmts, buf).await
    }

    #[instrument(level = "debug", skip_all, fields(kind = ?self.kind(), nelmts = io.nelmts))]
    pub(crate) async fn ser_write(
        &mut self,
        io: &mut IoInfo<'_>,
        map: Option<&ChunkMap>,
        buf: &[u8],
    ) -> Result<()> {
        if matches!(self, Layout::Chunked(_)) {
            let map = map.ok_or_else(no_map)?;
            for chunk in map.iter() {
                scatgath::write(
                    self,
                    io,
                    Some(chunk),
                    chunk.file_spans.iter().copied(),
                    chunk.mem_spans.iter().copied(),
                    chunk.npoints,
                    buf,
                )
                .await?;
            }
            return Ok(());
        }
        let (fs, ms, nelmts) = (io.file_space, io.mem_space, io.nelmts);
        scatgath::write(self, io, None, fs.spans(), ms.spans(), nelmts, buf).await
    }

    /// Collective-mode read: no conversion, no cache, addresses known.
    #[instrument(level = "debug", skip_all, fields(kind = ?self.kind(), nelmts = io.nelmts))]
    pub(crate) async fn par_read(
        &mut self,
        io: &IoInfo<'_>,
        map: Option<&ChunkMap>,
        addrs: &ChunkAddrMap,
        buf: &mut [u8],
    ) -> Result<()> {
        let file = io.file;
        let elem_size = io.type_info.src_size;
        match self {
            Layout::Contiguous(c) => {
                c.prepare_direct(file, IoOp::Read).await?;
                let base = c.addr().ok_or_else(unallocated)?;
                direct_read(file, base, io.file_space.spans(), io.mem_space.spans(), elem_size, buf)
                    .await
            }
            Layout::Chunked(c) => {
                let map = map.ok_or_else(no_map)?;
                c.prepare_direct(file, map, IoOp::Read).await?;
                for chunk in map.iter() {
                    let base = chunk_base(addrs, chunk)?;
                    direct_read(
                        file,
                        base,
                        chunk.file_spans.iter().copied(),
                        chunk.mem_spans.iter().copied(),
                        elem_size,
                        buf,
                    )
                    .await?;
                }
                Ok(())
            }
            _ => Err(StorageError::unsupported(
                "collective transfer needs contiguous or chunked storage",
            )),
        }
    }

    #[instrument(level = "debug", skip_all, fields(kind = ?self.kind(), nelmts = io.nelmts))]
    pub(crate) async fn par_write(
        &mut self,
        io: &IoInfo<'_>,
        map: Option<&ChunkMap>,
        addrs: &ChunkAddrMap,
        buf: &[u8],
    ) -> Result<()> {
        let file = io.file;
        let elem_size = io.type_info.src_size;
        match self {
            Layout::Contiguous(c) => {
                c.prepare_direct(file, IoOp::Write).await?;
                let base = c.addr().ok_or_else(unallocated)?;
                direct_write(file, base, io.file_space.spans(), io.mem_space.spans(), elem_size, buf)
                    .await
            }
            Layout::Chunked(c) => {
                let map = map.ok_or_else(no_map)?;
                c.prepare_direct(file, map, IoOp::Write).await?;
                for chunk in map.iter() {
                    let base = chunk_base(addrs, chunk)?;
                    direct_write(
                        file,
                        base,
                        chunk.file_spans.iter().copied(),
                        chunk.mem_spans.iter().copied(),
                        elem_size,
                        buf,
                    )
                    .await?;
                }
                Ok(())
            }
            _ => Err(StorageError::unsupported(
                "collective transfer needs contiguous or chunked storage",
            )),
        }
    }

    /// Vectored read. `chunk` names the chunk for chunked storage, whose
    /// dataset-side offsets are then relative to that chunk.
    pub(crate) async fn readvv(
        &mut self,
        file: &StorageFile,
        chunk: Option<&ChunkInfo>,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &mut [u8],
    ) -> Result<u64> {
        match self {
            Layout::Contiguous(c) => c.readvv(file, dset, mem, buf).await,
            Layout::Chunked(c) => {
                let chunk = chunk.ok_or_else(no_map)?;
                c.readvv(file, chunk, dset, mem, buf).await
            }
            Layout::Compact(c) => c.readvv(dset, mem, buf),
            Layout::External(e) => e.readvv(file, dset, mem, buf).await,
        }
    }

    pub(crate) async fn writevv(
        &mut self,
        file: &StorageFile,
        chunk: Option<&ChunkInfo>,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &[u8],
    ) -> Result<u64> {
        match self {
            Layout::Contiguous(c) => c.writevv(file, dset, mem, buf).await,
            Layout::Chunked(c) => {
                let chunk = chunk.ok_or_else(no_map)?;
                c.writevv(file, chunk, dset, mem, buf).await
            }
            Layout::Compact(c) => c.writevv(dset, mem, buf),
            Layout::External(e) => e.writevv(file, dset, mem, buf).await,
        }
    }

    pub(crate) async fn flush(&mut self, file: &StorageFile) -> Result<()> {
        match self {
            Layout::Contiguous(c) => c.flush(file).await,
            Layout::Chunked(c) => c.flush(file).await,
            Layout::Compact(c) => {
                c.mark_clean();
                Ok(())
            }
            Layout::External(e) => e.flush().await,
        }
    }

    /// Final teardown of the shared instance.
    pub(crate) async fn destroy(&mut self, file: &StorageFile) -> Result<()> {
        match self {
            Layout::Chunked(c) => c.destroy(file).await,
            _ => self.flush(file).await,
        }
    }

    pub(crate) fn storage_size(&self) -> u64 {
        match self {
            Layout::Contiguous(c) => c.storage_size(),
            Layout::Chunked(c) => c.storage_size(),
            Layout::Compact(c) => c.data().len() as u64,
            Layout::External(e) => e.total_size(),
        }
    }

    pub(crate) fn allocation_status(&self) -> SpaceStatus {
        match self {
            Layout::Contiguous(c) => c.allocation_status(),
            Layout::Chunked(c) => c.allocation_status(),
            Layout::Compact(_) => SpaceStatus::Allocated,
            Layout::External(e) => e.allocation_status(),
        }
    }

    pub(crate) async fn allocate(&mut self, file: &StorageFile) -> Result<()> {
        match self {
            Layout::Contiguous(c) => c.allocate(file).await.map(|_| ()),
            Layout::Chunked(c) => c.allocate(file).await,
            Layout::Compact(_) | Layout::External(_) => Ok(()),
        }
    }

    pub(crate) async fn change_extent(&mut self, file: &StorageFile, dims: &[u64]) -> Result<()> {
        match self {
            Layout::Chunked(c) => c.change_extent(file, dims).await,
            _ => Err(only_chunked("changing the extent")),
        }
    }
}

fn unallocated() -> StorageError {
    StorageError::Collective(anyhow::anyhow!("storage is not allocated"))
}

fn chunk_base(addrs: &ChunkAddrMap, chunk: &ChunkInfo) -> Result<u64> {
    addrs.get(&chunk.index).copied().ok_or_else(|| {
        StorageError::Collective(anyhow::anyhow!(
            "chunk {} missing from the collective address map",
            chunk.index
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(dset_off: u64, mem_off: u64, len: u64) -> Piece {
        Piece {
            dset_off,
            mem_off,
            len,
        }
    }

    #[test]
    fn test_copy_pieces_in_is_all_or_nothing() {
        let mut dst = [0u8; 4];
        let pieces = [piece(0, 0, 2), piece(3, 2, 2)];
        assert!(copy_pieces_in(&[1, 2, 3, 4], &pieces, &mut dst).is_err());
        assert_eq!(dst, [0; 4]);

        let pieces = [piece(2, 0, 2), piece(0, 2, 1)];
        assert_eq!(copy_pieces_in(&[1, 2, 3], &pieces, &mut dst).unwrap(), 3);
        assert_eq!(dst, [3, 0, 1, 2]);
    }

    #[test]
    fn test_copy_pieces_out() {
        let mut buf = [0u8; 3];
        let pieces = [piece(1, 0, 2), piece(0, 2, 1)];
        copy_pieces_out(&[7, 8, 9], &pieces, &mut buf).unwrap();
        assert_eq!(buf, [8, 9, 7]);
    }

    #[test]
    fn test_descriptor_yaml_shape() {
        let d = LayoutDescriptor::Chunked {
            chunk_dims: vec![4, 4],
            index: None,
        };
        let yaml = serde_yaml::to_string(&d).unwrap();
        assert!(yaml.contains("kind: chunked"));
        let back: LayoutDescriptor = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, d);
        assert_eq!(back.kind(), LayoutKind::Chunked);
    }
}
