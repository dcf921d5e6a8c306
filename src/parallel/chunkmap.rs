//! Global chunk-address map for collective chunked transfers.
//!
//! Each rank only maps the chunks its own selection touches, but the direct
//! transfer needs an address for every chunk. Ranks exchange
//! `(chunk index, file address)` pairs and merge them.

use super::Communicator;
use crate::error::{Result, StorageError};
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;
use tracing::debug;

/// Flat chunk index to file address.
pub type ChunkAddrMap = BTreeMap<u64, u64>;

const RECORD_LEN: usize = 16;

fn encode(local: &[(u64, Option<u64>)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(local.len() * RECORD_LEN);
    for &(index, addr) in local {
        if let Some(addr) = addr {
            buf.put_u64_le(index);
            buf.put_u64_le(addr);
        }
    }
    buf
}

/// Merge every rank's pairs. `None` if two ranks disagree on an address.
fn merge(parts: &[Vec<u8>]) -> anyhow::Result<Option<ChunkAddrMap>> {
    let mut map = ChunkAddrMap::new();
    for part in parts {
        if part.len() % RECORD_LEN != 0 {
            anyhow::bail!("chunk address record of {} bytes is malformed", part.len());
        }
        let mut cur = part.as_slice();
        while cur.has_remaining() {
            let index = cur.get_u64_le();
            let addr = cur.get_u64_le();
            if let Some(prev) = map.insert(index, addr)
                && prev != addr
            {
                debug!(chunk = index, prev, addr, "ranks disagree on a chunk address");
                return Ok(None);
            }
        }
    }
    Ok(Some(map))
}

/// Exchange chunk addresses. Returns `None`, on every rank alike, when some
/// rank touches a chunk nobody has an address for; the caller then falls back
/// to independent transfers.
pub(crate) async fn build_chunk_addr_map(
    comm: &dyn Communicator,
    local: &[(u64, Option<u64>)],
) -> Result<Option<ChunkAddrMap>> {
    let parts = comm
        .all_gather(encode(local))
        .await
        .map_err(StorageError::Collective)?;
    let merged = merge(&parts).map_err(StorageError::Collective)?;
    let complete = merged
        .as_ref()
        .is_some_and(|m| local.iter().all(|(index, _)| m.contains_key(index)));
    let all_complete = comm
        .all_agree(complete)
        .await
        .map_err(StorageError::Collective)?;
    if !all_complete {
        debug!(rank = comm.rank(), "chunk address map incomplete");
        return Ok(None);
    }
    let map = merged.unwrap_or_default();
    debug!(rank = comm.rank(), chunks = map.len(), "chunk address map built");
    Ok(Some(map))
}
