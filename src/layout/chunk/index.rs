//! Chunk index: where each written chunk lives in the file.
//!
//! Records are kept in an ordered map keyed by chunk offset, which gives the
//! persisted order (offset-major, then stored size) for free since a chunk has
//! at most one record. The whole index is persisted as a single node:
//!
//! ```text
//! "TREE" | version u8 | rank u8 | reserved u16 | count u32
//! count x { nbytes u32 | filter_mask u32 | offset[rank] u64 | addr u64 }
//! crc32 u32
//! ```
//!
//! All integers little-endian.

use crate::error::{Result, StorageError};
use crate::file::StorageFile;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use tracing::debug;

const MAGIC: &[u8; 4] = b"TREE";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 12;
const TRAILER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Element coordinates of the chunk's first element.
    pub offset: Vec<u64>,
    /// Stored (post-filter) size.
    pub nbytes: u32,
    /// Bit `i` set: filter `i` was skipped for this chunk.
    pub filter_mask: u32,
    pub addr: u64,
}

impl ChunkRecord {
    fn encoded_len(rank: usize) -> usize {
        4 + 4 + rank * 8 + 8
    }
}

/// Location of a persisted index node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexAddr {
    pub addr: u64,
    pub size: u64,
}

#[derive(Debug, Default, Clone)]
pub struct ChunkIndex {
    rank: usize,
    records: BTreeMap<Vec<u64>, ChunkRecord>,
    /// Bumped on every insert and remove.
    generation: u64,
}

impl ChunkIndex {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            records: BTreeMap::new(),
            generation: 0,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, offset: &[u64]) -> Option<&ChunkRecord> {
        self.records.get(offset)
    }

    /// Insert or replace; returns the replaced record.
    pub fn insert(&mut self, record: ChunkRecord) -> Option<ChunkRecord> {
        debug_assert_eq!(record.offset.len(), self.rank);
        self.generation += 1;
        self.records.insert(record.offset.clone(), record)
    }

    pub fn remove(&mut self, offset: &[u64]) -> Option<ChunkRecord> {
        let old = self.records.remove(offset);
        if old.is_some() {
            self.generation += 1;
        }
        old
    }

    /// Records in persisted order.
    pub fn iter(&self) -> impl Iterator<Item = &ChunkRecord> {
        self.records.values()
    }

    /// Records with `lo <= offset < hi`, lexicographically.
    pub fn range<'a>(
        &'a self,
        lo: &[u64],
        hi: &[u64],
    ) -> impl Iterator<Item = &'a ChunkRecord> + 'a {
        let lo = if lo <= hi { lo } else { hi };
        self.records
            .range::<Vec<u64>, _>((Bound::Included(lo.to_vec()), Bound::Excluded(hi.to_vec())))
            .map(|(_, r)| r)
    }

    /// Records of chunks that lie entirely outside `dims`.
    pub fn outside_extent(&self, dims: &[u64]) -> Vec<ChunkRecord> {
        self.records
            .values()
            .filter(|r| r.offset.iter().zip(dims).any(|(&o, &d)| o >= d))
            .cloned()
            .collect()
    }

    /// Total stored bytes of all chunks.
    pub fn allocated_bytes(&self) -> u64 {
        self.records.values().map(|r| r.nbytes as u64).sum()
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.records.len() * ChunkRecord::encoded_len(self.rank);
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body + TRAILER_LEN);
        buf.put_slice(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.rank as u8);
        buf.put_u16_le(0);
        buf.put_u32_le(self.records.len() as u32);
        for r in self.records.values() {
            buf.put_u32_le(r.nbytes);
            buf.put_u32_le(r.filter_mask);
            for &o in &r.offset {
                buf.put_u64_le(o);
            }
            buf.put_u64_le(r.addr);
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + TRAILER_LEN {
            return Err(corrupt(format!("node of {} bytes is too short", data.len())));
        }
        let (body, trailer) = data.split_at(data.len() - TRAILER_LEN);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(corrupt(format!(
                "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }

        let mut cur = body;
        if &cur[..4] != MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }
        cur.advance(4);
        let version = cur.get_u8();
        if version != VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }
        let rank = cur.get_u8() as usize;
        cur.advance(2);
        let count = cur.get_u32_le() as usize;
        if cur.remaining() != count * ChunkRecord::encoded_len(rank) {
            return Err(corrupt(format!(
                "{count} records of rank {rank} do not fit {} bytes",
                cur.remaining()
            )));
        }

        let mut index = ChunkIndex::new(rank);
        let mut prev: Option<Vec<u64>> = None;
        for _ in 0..count {
            let nbytes = cur.get_u32_le();
            let filter_mask = cur.get_u32_le();
            let offset: Vec<u64> = (0..rank).map(|_| cur.get_u64_le()).collect();
            let addr = cur.get_u64_le();
            if prev.as_ref().is_some_and(|p| *p >= offset) {
                return Err(corrupt(format!("record {offset:?} out of order")));
            }
            prev = Some(offset.clone());
            index.insert(ChunkRecord {
                offset,
                nbytes,
                filter_mask,
                addr,
            });
        }
        Ok(index)
    }

    /// Write the index to freshly allocated space, releasing `old`.
    pub async fn persist(&self, file: &StorageFile, old: Option<IndexAddr>) -> Result<IndexAddr> {
        let node = self.encode();
        let size = node.len() as u64;
        let addr = file.alloc(size);
        if let Err(e) = file.write_at(addr, &node).await {
            file.free(addr, size);
            return Err(e);
        }
        if let Some(old) = old {
            file.free(old.addr, old.size);
        }
        debug!(addr, size, records = self.len(), "chunk index persisted");
        Ok(IndexAddr { addr, size })
    }

    pub async fn load(file: &StorageFile, at: IndexAddr) -> Result<Self> {
        let mut node = vec![0u8; at.size as usize];
        file.read_exact_at(at.addr, &mut node).await?;
        let index = Self::decode(&node)?;
        debug!(addr = at.addr, records = index.len(), "chunk index loaded");
        Ok(index)
    }
}

fn corrupt(msg: String) -> StorageError {
    StorageError::CorruptIndex(msg)
}
