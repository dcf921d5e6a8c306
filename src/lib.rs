// Library crate for arraystore: raw-data storage for N-dimensional datasets.

pub mod config;
pub mod dataset;
pub mod error;
pub mod file;
pub mod filter;
pub(crate) mod io;
pub mod layout;
pub mod parallel;
pub mod space;
pub mod types;

pub(crate) mod utils;

pub use crate::config::{ChunkCacheConfig, ConfigError, EngineConfig, XferConfig};
pub use crate::dataset::{AllocTime, Dataset, DatasetCreate, DatasetDescriptor, FillValue};
pub use crate::error::{Result, StorageError};
pub use crate::file::{
    DirResolver, ExternalResolver, LocalFile, MemFile, MemResolver, RawFile, StorageFile,
};
pub use crate::filter::{Filter, FilterError, FilterPipeline};
pub use crate::io::IoOp;
pub use crate::layout::chunk::{CacheStats, ChunkRecord, IndexAddr};
pub use crate::layout::{ExternalEntry, LayoutDescriptor, LayoutKind, SpaceStatus};
pub use crate::parallel::{
    ChunkAddrMap, Communicator, Eligibility, LocalComm, LocalGroup, SoloComm, TransferStrategy,
};
pub use crate::space::{Dataspace, Hyperslab, Selection};
pub use crate::types::{ByteOrder, Datatype, Member};
