//! Dataset handles and the shared open-dataset instance.
//!
//! Opening the same dataset twice through one `StorageFile` yields two handles
//! onto one `DatasetShared`, so both see the same chunk cache and index. The
//! instance is torn down (cache flushed, index persisted) by the last `close`.

mod descriptor;
mod fill;

pub use descriptor::{DatasetCreate, DatasetDescriptor};
pub use fill::{AllocTime, FillValue};

use crate::config::XferConfig;
use crate::error::{Result, StorageError};
use crate::file::StorageFile;
use crate::filter::FilterPipeline;
use crate::io::{IoInfo, IoOp, TypeInfo};
use crate::layout::chunk::{CacheStats, ChunkMap, ChunkRecord};
use crate::layout::{Layout, LayoutKind, SpaceStatus};
use crate::parallel::{ChunkAddrMap, Communicator, build_chunk_addr_map, local_eligibility};
use crate::space::Dataspace;
use crate::types::Datatype;
use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

const HEADER_MAGIC: &[u8; 4] = b"DSET";
const HEADER_LEN: u64 = 8;

pub(crate) struct DatasetShared {
    dtype: Datatype,
    /// Current extent, everything selected.
    space: Dataspace,
    layout: Layout,
    fill: FillValue,
    pipeline: FilterPipeline,
    alloc_time: AllocTime,
}

/// One open dataset. The handle count lives outside the lock so a handle can
/// be released from `Drop` while another task holds the state.
pub(crate) struct DatasetInstance {
    handles: AtomicUsize,
    state: Mutex<DatasetShared>,
}

impl DatasetInstance {
    fn new(state: DatasetShared) -> Self {
        Self {
            handles: AtomicUsize::new(1),
            state: Mutex::new(state),
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, DatasetShared> {
        self.state.lock().await
    }

    /// Take another handle unless the instance has already been torn down.
    fn acquire(&self) -> bool {
        self.handles
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .is_ok()
    }

    /// Drop one handle; true when it was the last.
    fn release(&self) -> bool {
        self.handles.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

pub(crate) type SharedInstance = Arc<DatasetInstance>;

pub struct Dataset {
    file: Arc<StorageFile>,
    shared: SharedInstance,
    addr: u64,
    closed: bool,
}

/// Byte count the memory dataspace spans in a buffer of `mem_type` elements.
fn mem_extent_bytes(mem_type: &Datatype, mem_space: &Dataspace) -> u64 {
    mem_space.extent_nelmts() * mem_type.size() as u64
}

fn check_transfer(
    shared: &DatasetShared,
    mem_type: &Datatype,
    mem_space: &Dataspace,
    file_space: &Dataspace,
    buf_len: usize,
) -> Result<u64> {
    mem_type.validate()?;
    if file_space.dims() != shared.space.dims() {
        return Err(StorageError::InvalidSelection(format!(
            "file dataspace {:?} does not match dataset extent {:?}",
            file_space.dims(),
            shared.space.dims()
        )));
    }
    let nelmts = file_space.npoints();
    if nelmts != mem_space.npoints() {
        return Err(StorageError::SelectionMismatch {
            file: nelmts,
            mem: mem_space.npoints(),
        });
    }
    let needed = mem_extent_bytes(mem_type, mem_space);
    if (buf_len as u64) < needed {
        return Err(StorageError::invalid(format!(
            "buffer holds {buf_len} bytes, memory dataspace spans {needed}"
        )));
    }
    Ok(nelmts)
}

async fn write_header(file: &StorageFile, rank: usize) -> Result<u64> {
    let mut header = BytesMut::with_capacity(HEADER_LEN as usize);
    header.put_slice(HEADER_MAGIC);
    header.put_u32_le(rank as u32);
    let addr = file.alloc(HEADER_LEN);
    if let Err(e) = file.write_at(addr, &header).await {
        file.free(addr, HEADER_LEN);
        return Err(e);
    }
    Ok(addr)
}

async fn check_header(file: &StorageFile, addr: u64, rank: usize) -> Result<()> {
    let mut header = [0u8; HEADER_LEN as usize];
    file.read_exact_at(addr, &mut header).await?;
    let stored_rank = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if &header[..4] != HEADER_MAGIC || stored_rank != rank {
        return Err(StorageError::invalid(format!(
            "no rank-{rank} dataset header at address {addr}"
        )));
    }
    Ok(())
}

/// Chunk addresses for a collective transfer, or an empty map for contiguous
/// storage. `None` means the group fell back to independent I/O.
async fn collective_addrs(
    comm: &dyn Communicator,
    layout: &Layout,
    map: Option<&ChunkMap>,
) -> Result<Option<ChunkAddrMap>> {
    match (layout.chunked(), map) {
        (Some(c), Some(map)) => build_chunk_addr_map(comm, &c.chunk_addrs(map)).await,
        _ => Ok(Some(ChunkAddrMap::new())),
    }
}

impl Dataset {
    #[instrument(level = "debug", skip_all, fields(dims = ?req.dims))]
    pub async fn create(file: &Arc<StorageFile>, req: DatasetCreate) -> Result<Self> {
        let DatasetCreate {
            dtype,
            dims,
            maxdims,
            layout,
            fill,
            filters,
            alloc_time,
        } = req;
        dtype.validate()?;
        fill.validate(dtype.size())?;
        filters.validate()?;
        let space = match &maxdims {
            Some(m) => Dataspace::with_maxdims(&dims, m)?,
            None => Dataspace::new(&dims),
        };
        let extendible = space
            .maxdims()
            .iter()
            .zip(&dims)
            .any(|(m, &d)| m.is_none_or(|m| m != d));
        if extendible && layout.kind() != LayoutKind::Chunked {
            return Err(StorageError::unsupported(
                "only chunked datasets can have a changeable extent",
            ));
        }

        let mut layout = Layout::create(file, &layout, dtype.size(), &dims, &fill, &filters)?;
        let addr = write_header(file, dims.len()).await?;
        if alloc_time == AllocTime::Early {
            layout.allocate(file).await?;
        }
        let shared = Arc::new(DatasetInstance::new(DatasetShared {
            dtype,
            space,
            layout,
            fill,
            pipeline: filters,
            alloc_time,
        }));
        file.register(addr, &shared);
        info!(addr, "dataset created");
        Ok(Self {
            file: file.clone(),
            shared,
            addr,
            closed: false,
        })
    }

    /// Open from a persisted descriptor, sharing the live instance if the
    /// dataset is already open in this file.
    #[instrument(level = "debug", skip_all, fields(addr = desc.addr))]
    pub async fn open(file: &Arc<StorageFile>, desc: &DatasetDescriptor) -> Result<Self> {
        if let Some(shared) = file.lookup(desc.addr) {
            // Serialise with a concurrent last close before joining.
            let joined = {
                let _state = shared.lock().await;
                shared.acquire()
            };
            if joined {
                debug!("sharing open dataset instance");
                return Ok(Self {
                    file: file.clone(),
                    shared,
                    addr: desc.addr,
                    closed: false,
                });
            }
        }

        desc.dtype.validate()?;
        desc.fill.validate(desc.dtype.size())?;
        desc.filters.validate()?;
        check_header(file, desc.addr, desc.dims.len()).await?;
        let space = Dataspace::with_maxdims(&desc.dims, &desc.maxdims)?;
        let layout = Layout::open(
            file,
            &desc.layout,
            desc.dtype.size(),
            &desc.dims,
            &desc.fill,
            &desc.filters,
        )
        .await?;
        let shared = Arc::new(DatasetInstance::new(DatasetShared {
            dtype: desc.dtype.clone(),
            space,
            layout,
            fill: desc.fill.clone(),
            pipeline: desc.filters.clone(),
            alloc_time: desc.alloc_time,
        }));
        file.register(desc.addr, &shared);
        debug!("dataset opened");
        Ok(Self {
            file: file.clone(),
            shared,
            addr: desc.addr,
            closed: false,
        })
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn file(&self) -> &Arc<StorageFile> {
        &self.file
    }

    pub async fn dtype(&self) -> Datatype {
        self.shared.lock().await.dtype.clone()
    }

    /// The current extent with everything selected.
    pub async fn space(&self) -> Dataspace {
        self.shared.lock().await.space.clone()
    }

    /// Read the elements selected by `file_space` (default: all) into the
    /// elements of `buf` selected by `mem_space`, converting to `mem_type`.
    #[instrument(level = "debug", skip_all, fields(addr = self.addr))]
    pub async fn read(
        &self,
        buf: &mut [u8],
        mem_type: &Datatype,
        mem_space: &Dataspace,
        file_space: Option<&Dataspace>,
        xfer: &XferConfig,
    ) -> Result<()> {
        let mut guard = self.shared.lock().await;
        let shared = &mut *guard;
        let whole;
        let file_space = match file_space {
            Some(s) => s,
            None => {
                whole = shared.space.clone();
                &whole
            }
        };
        let nelmts = check_transfer(shared, mem_type, mem_space, file_space, buf.len())?;
        let type_info = TypeInfo::new(mem_type, &shared.dtype, IoOp::Read, xfer)?;
        let eligibility = local_eligibility(&type_info, &shared.layout, file_space, mem_space);
        let comm = xfer.strategy.negotiate(eligibility).await?;
        if nelmts == 0 && comm.is_none() {
            return Ok(());
        }

        let mut io = IoInfo {
            file: &self.file,
            xfer,
            op: IoOp::Read,
            type_info,
            file_space,
            mem_space,
            nelmts,
        };
        let map = shared.layout.init(&io)?;
        let result = match comm {
            Some(comm) => match collective_addrs(comm.as_ref(), &shared.layout, map.as_ref()).await? {
                Some(addrs) => {
                    let moved = shared.layout.par_read(&io, map.as_ref(), &addrs, buf).await;
                    let synced = comm.barrier().await.map_err(StorageError::Collective);
                    moved.and(synced)
                }
                None => shared.layout.ser_read(&mut io, map.as_ref(), buf).await,
            },
            None => shared.layout.ser_read(&mut io, map.as_ref(), buf).await,
        };
        shared.layout.term(map);
        result
    }

    /// Write the elements of `buf` selected by `mem_space` to the elements
    /// selected by `file_space` (default: all), converting from `mem_type`.
    ///
    /// A failure part-way leaves earlier chunks written; the index only ever
    /// records chunks whose data reached the file.
    #[instrument(level = "debug", skip_all, fields(addr = self.addr))]
    pub async fn write(
        &self,
        buf: &[u8],
        mem_type: &Datatype,
        mem_space: &Dataspace,
        file_space: Option<&Dataspace>,
        xfer: &XferConfig,
    ) -> Result<()> {
        let mut guard = self.shared.lock().await;
        let shared = &mut *guard;
        let whole;
        let file_space = match file_space {
            Some(s) => s,
            None => {
                whole = shared.space.clone();
                &whole
            }
        };
        let nelmts = check_transfer(shared, mem_type, mem_space, file_space, buf.len())?;
        let type_info = TypeInfo::new(mem_type, &shared.dtype, IoOp::Write, xfer)?;
        let eligibility = local_eligibility(&type_info, &shared.layout, file_space, mem_space);
        let comm = xfer.strategy.negotiate(eligibility).await?;
        if nelmts == 0 && comm.is_none() {
            return Ok(());
        }

        let mut io = IoInfo {
            file: &self.file,
            xfer,
            op: IoOp::Write,
            type_info,
            file_space,
            mem_space,
            nelmts,
        };
        let map = shared.layout.init(&io)?;
        let result = match comm {
            Some(comm) => match collective_addrs(comm.as_ref(), &shared.layout, map.as_ref()).await? {
                Some(addrs) => {
                    let moved = shared.layout.par_write(&io, map.as_ref(), &addrs, buf).await;
                    let synced = comm.barrier().await.map_err(StorageError::Collective);
                    moved.and(synced)
                }
                None => shared.layout.ser_write(&mut io, map.as_ref(), buf).await,
            },
            None => shared.layout.ser_write(&mut io, map.as_ref(), buf).await,
        };
        shared.layout.term(map);
        result
    }

    /// Bytes of file space holding raw data.
    pub async fn get_storage_size(&self) -> u64 {
        self.shared.lock().await.layout.storage_size()
    }

    pub async fn get_allocation_status(&self) -> SpaceStatus {
        self.shared.lock().await.layout.allocation_status()
    }

    /// Grow or shrink the dataset. Chunks left wholly outside the new extent
    /// are discarded without being written back.
    #[instrument(level = "debug", skip_all, fields(addr = self.addr, dims = ?dims))]
    pub async fn change_extent(&self, dims: &[u64]) -> Result<()> {
        let mut guard = self.shared.lock().await;
        let shared = &mut *guard;
        if dims == shared.space.dims() {
            return Ok(());
        }
        let mut space = shared.space.clone();
        space.set_extent(dims)?;
        let resized = shared.layout.change_extent(&self.file, dims).await;
        // Stale chunks are gone once the geometry moves, so the extent follows
        // it even when resetting a straddling chunk failed.
        if shared
            .layout
            .chunked()
            .is_some_and(|c| c.geom().dims() == dims)
        {
            shared.space = space;
        }
        resized?;
        if shared.alloc_time == AllocTime::Early {
            shared.layout.allocate(&self.file).await?;
        }
        info!(addr = self.addr, ?dims, "extent changed");
        Ok(())
    }

    /// Allocate all raw-data storage now, writing the fill value.
    pub async fn allocate(&self) -> Result<()> {
        let mut shared = self.shared.lock().await;
        shared.layout.allocate(&self.file).await
    }

    /// Write back cached raw data and persist the chunk index.
    pub async fn flush(&self) -> Result<()> {
        let mut shared = self.shared.lock().await;
        shared.layout.flush(&self.file).await
    }

    pub async fn descriptor(&self) -> DatasetDescriptor {
        let shared = self.shared.lock().await;
        DatasetDescriptor {
            addr: self.addr,
            dtype: shared.dtype.clone(),
            dims: shared.space.dims().to_vec(),
            maxdims: shared.space.maxdims().to_vec(),
            layout: shared.layout.descriptor(),
            fill: shared.fill.clone(),
            filters: shared.pipeline.clone(),
            alloc_time: shared.alloc_time,
        }
    }

    pub async fn cache_stats(&self) -> Option<CacheStats> {
        let shared = self.shared.lock().await;
        shared.layout.chunked().map(|c| c.cache().stats())
    }

    /// Chunk index records in persisted order. Empty for other layouts.
    pub async fn chunk_records(&self) -> Vec<ChunkRecord> {
        let shared = self.shared.lock().await;
        shared
            .layout
            .chunked()
            .map(|c| c.index().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the chunk whose first element is at `origin` is resident.
    pub async fn is_chunk_cached(&self, origin: &[u64]) -> bool {
        let shared = self.shared.lock().await;
        shared
            .layout
            .chunked()
            .is_some_and(|c| c.cache().is_cached(c.geom().index_of_origin(origin)))
    }

    /// Release this handle. The last handle flushes and tears down the shared
    /// instance; the returned descriptor reflects the final on-disk state.
    pub async fn close(mut self) -> Result<DatasetDescriptor> {
        self.closed = true;
        let last = {
            let mut shared = self.shared.lock().await;
            let last = self.shared.release();
            if last {
                self.file.unregister(self.addr);
                shared.layout.destroy(&self.file).await?;
            }
            last
        };
        if last {
            debug!(addr = self.addr, "dataset instance torn down");
        }
        Ok(self.descriptor().await)
    }
}

impl Drop for Dataset {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.shared.release();
        warn!(addr = self.addr, "dataset handle dropped without close");
    }
}
