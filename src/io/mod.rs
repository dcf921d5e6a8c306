//! Per-transfer I/O context and the strip-mined scatter/gather engine that
//! every layout plugs into through its vectored read/write.

pub(crate) mod scatgath;
pub(crate) mod seq;
pub(crate) mod type_info;

use crate::config::XferConfig;
use crate::file::StorageFile;
use crate::space::Dataspace;
pub(crate) use seq::{Piece, SeqFeed, SeqList, out_of_buffer, pair_vv};
pub(crate) use type_info::TypeInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

/// Everything one read or write call needs besides the layout and the user
/// buffer. Owned by the call and dropped when it returns.
pub(crate) struct IoInfo<'a> {
    pub file: &'a StorageFile,
    pub xfer: &'a XferConfig,
    pub op: IoOp,
    pub type_info: TypeInfo,
    pub file_space: &'a Dataspace,
    pub mem_space: &'a Dataspace,
    /// Selected element count, identical on both sides.
    pub nelmts: u64,
}
