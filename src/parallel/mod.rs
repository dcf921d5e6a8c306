//! Independent vs. collective transfers.
//!
//! A collective transfer is only taken when every rank of the communicator
//! judges itself eligible. The vote is an all-gather, so a single dissenting
//! rank sends the whole group down the independent path for that call.

mod chunkmap;

pub use chunkmap::ChunkAddrMap;
pub(crate) use chunkmap::build_chunk_addr_map;

use crate::error::{Result, StorageError};
use crate::io::TypeInfo;
use crate::layout::{Layout, LayoutKind, SpaceStatus};
use crate::space::Dataspace;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Barrier;
use tracing::debug;

/// A group of cooperating ranks. Every rank must make the same calls in the
/// same order; nothing here detects a mismatch.
#[async_trait]
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Contribute `data` and receive every rank's contribution, in rank order.
    async fn all_gather(&self, data: Vec<u8>) -> anyhow::Result<Vec<Vec<u8>>>;

    async fn barrier(&self) -> anyhow::Result<()>;

    /// True only if every rank votes true.
    async fn all_agree(&self, vote: bool) -> anyhow::Result<bool> {
        let votes = self.all_gather(vec![vote as u8]).await?;
        Ok(votes.iter().all(|v| v.first() == Some(&1)))
    }
}

/// Single-rank communicator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoloComm;

#[async_trait]
impl Communicator for SoloComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    async fn all_gather(&self, data: Vec<u8>) -> anyhow::Result<Vec<Vec<u8>>> {
        Ok(vec![data])
    }

    async fn barrier(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-process group: ranks are tasks sharing one barrier and one slot per rank.
pub struct LocalGroup {
    size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Option<Vec<u8>>>>,
}

impl LocalGroup {
    /// One communicator handle per rank.
    pub fn ranks(size: usize) -> Vec<LocalComm> {
        let group = Arc::new(LocalGroup {
            size,
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![None; size]),
        });
        (0..size)
            .map(|rank| LocalComm {
                rank,
                group: group.clone(),
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    group: Arc<LocalGroup>,
}

#[async_trait]
impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.size
    }

    async fn all_gather(&self, data: Vec<u8>) -> anyhow::Result<Vec<Vec<u8>>> {
        self.group.slots.lock()[self.rank] = Some(data);
        self.group.barrier.wait().await;
        let gathered: Option<Vec<Vec<u8>>> = self.group.slots.lock().iter().cloned().collect();
        // nobody refills a slot until every rank has read them all
        self.group.barrier.wait().await;
        gathered.ok_or_else(|| anyhow::anyhow!("rank {} saw an empty gather slot", self.rank))
    }

    async fn barrier(&self) -> anyhow::Result<()> {
        self.group.barrier.wait().await;
        Ok(())
    }
}

/// How a transfer moves its bytes. Chosen per transfer through `XferConfig`.
#[derive(Clone, Default)]
pub enum TransferStrategy {
    #[default]
    Independent,
    Collective(Arc<dyn Communicator>),
}

impl fmt::Debug for TransferStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStrategy::Independent => f.write_str("Independent"),
            TransferStrategy::Collective(comm) => f
                .debug_struct("Collective")
                .field("rank", &comm.rank())
                .field("size", &comm.size())
                .finish(),
        }
    }
}

impl TransferStrategy {
    pub fn collective<C: Communicator + 'static>(comm: C) -> Self {
        TransferStrategy::Collective(Arc::new(comm))
    }

    /// Agree with the rest of the group on whether this transfer runs
    /// collectively. Returns the communicator when it does.
    pub(crate) async fn negotiate(
        &self,
        local: Eligibility,
    ) -> Result<Option<Arc<dyn Communicator>>> {
        let TransferStrategy::Collective(comm) = self else {
            return Ok(None);
        };
        let all = comm
            .all_agree(local.is_eligible())
            .await
            .map_err(StorageError::Collective)?;
        if all {
            debug!(rank = comm.rank(), "transfer runs collectively");
            Ok(Some(comm.clone()))
        } else {
            debug!(
                rank = comm.rank(),
                local = ?local.blocker(),
                "collective transfer downgraded to independent"
            );
            Ok(None)
        }
    }
}

/// This rank's view of whether a transfer can run collectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eligibility {
    pub conv_noop: bool,
    pub layout_ok: bool,
    pub regular: bool,
    pub unfiltered: bool,
    pub allocated: bool,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        self.blocker().is_none()
    }

    /// First reason this rank cannot take part, if any.
    pub fn blocker(&self) -> Option<&'static str> {
        if !self.conv_noop {
            Some("type conversion required")
        } else if !self.layout_ok {
            Some("layout is neither contiguous nor chunked")
        } else if !self.regular {
            Some("irregular selection")
        } else if !self.unfiltered {
            Some("filtered chunks")
        } else if !self.allocated {
            Some("storage not fully allocated")
        } else {
            None
        }
    }
}

pub(crate) fn local_eligibility(
    type_info: &TypeInfo,
    layout: &Layout,
    file_space: &Dataspace,
    mem_space: &Dataspace,
) -> Eligibility {
    Eligibility {
        conv_noop: type_info.is_conv_noop,
        layout_ok: matches!(layout.kind(), LayoutKind::Contiguous | LayoutKind::Chunked),
        regular: file_space.is_regular() && mem_space.is_regular(),
        unfiltered: layout.chunked().is_none_or(|c| c.pipeline().is_empty()),
        allocated: layout.allocation_status() == SpaceStatus::Allocated,
    }
}
