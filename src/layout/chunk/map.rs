//! Chunk geometry and the per-call chunk map.

use crate::error::{Result, StorageError};
use crate::space::Dataspace;
use crate::utils::{product, ravel, unravel};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use tracing::trace;

/// Chunk extents over a dataset extent, plus the derived counts and strides
/// used to turn a chunk grid position into a flat index in O(rank).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGeometry {
    dims: Vec<u64>,
    chunk_dims: Vec<u64>,
    elem_size: usize,
    nchunks: Vec<u64>,
    down_chunks: Vec<u64>,
    chunk_nelmts: u64,
}

impl ChunkGeometry {
    pub fn new(dims: &[u64], chunk_dims: &[u64], elem_size: usize) -> Result<Self> {
        if dims.is_empty() {
            return Err(StorageError::invalid("chunked storage needs rank >= 1"));
        }
        if chunk_dims.len() != dims.len() {
            return Err(StorageError::invalid(format!(
                "chunk rank {} differs from dataset rank {}",
                chunk_dims.len(),
                dims.len()
            )));
        }
        if chunk_dims.contains(&0) {
            return Err(StorageError::invalid("chunk dimensions must be non-zero"));
        }
        let chunk_nelmts = product(chunk_dims);
        if chunk_nelmts * elem_size as u64 > u32::MAX as u64 {
            return Err(StorageError::invalid("chunk size must fit in 32 bits"));
        }
        let nchunks: Vec<u64> = dims
            .iter()
            .zip(chunk_dims)
            .map(|(&d, &c)| d.div_ceil(c))
            .collect();
        let mut down_chunks = vec![1u64; dims.len()];
        for d in (0..dims.len() - 1).rev() {
            down_chunks[d] = down_chunks[d + 1] * nchunks[d + 1];
        }
        Ok(Self {
            dims: dims.to_vec(),
            chunk_dims: chunk_dims.to_vec(),
            elem_size,
            nchunks,
            down_chunks,
            chunk_nelmts,
        })
    }

    /// Same chunking over a different extent.
    pub fn resized(&self, dims: &[u64]) -> Result<Self> {
        Self::new(dims, &self.chunk_dims, self.elem_size)
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[inline]
    pub fn dims(&self) -> &[u64] {
        &self.dims
    }

    #[inline]
    pub fn chunk_dims(&self) -> &[u64] {
        &self.chunk_dims
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    #[inline]
    pub fn chunk_nelmts(&self) -> u64 {
        self.chunk_nelmts
    }

    /// Bytes in one (unfiltered) chunk, including edge padding.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_nelmts as usize * self.elem_size
    }

    pub fn nchunks(&self) -> &[u64] {
        &self.nchunks
    }

    pub fn total_chunks(&self) -> u64 {
        product(&self.nchunks)
    }

    #[inline]
    pub fn flat_index(&self, grid: &[u64]) -> u64 {
        grid.iter().zip(&self.down_chunks).map(|(&g, &s)| g * s).sum()
    }

    pub fn index_of_origin(&self, origin: &[u64]) -> u64 {
        origin
            .iter()
            .zip(&self.chunk_dims)
            .zip(&self.down_chunks)
            .map(|((&o, &c), &s)| (o / c) * s)
            .sum()
    }

    pub fn origin_of(&self, mut index: u64) -> Vec<u64> {
        let mut origin = vec![0; self.rank()];
        for d in 0..self.rank() {
            let g = index / self.down_chunks[d];
            index %= self.down_chunks[d];
            origin[d] = g * self.chunk_dims[d];
        }
        origin
    }

    /// Whether a chunk at `origin` is cut by the extent `dims`.
    pub fn straddles(&self, origin: &[u64], dims: &[u64]) -> bool {
        origin
            .iter()
            .zip(&self.chunk_dims)
            .zip(dims)
            .any(|((&o, &c), &d)| o < d && o + c > d)
    }

    /// Whether a chunk at `origin` lies entirely outside the extent `dims`.
    pub fn outside(origin: &[u64], dims: &[u64]) -> bool {
        origin.iter().zip(dims).any(|(&o, &d)| o >= d)
    }
}

/// One chunk's part of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub index: u64,
    pub origin: Vec<u64>,
    pub npoints: u64,
    /// Element spans, relative to the chunk's first element.
    pub file_spans: Vec<(u64, u64)>,
    /// Element spans of the memory buffer, paired in order with `file_spans`.
    pub mem_spans: Vec<(u64, u64)>,
}

impl ChunkInfo {
    fn new(index: u64, origin: Vec<u64>) -> Self {
        Self {
            index,
            origin,
            npoints: 0,
            file_spans: Vec::new(),
            mem_spans: Vec::new(),
        }
    }
}

fn push_span(spans: &mut Vec<(u64, u64)>, off: u64, len: u64) {
    if let Some(last) = spans.last_mut()
        && last.0 + last.1 == off
    {
        last.1 += len;
        return;
    }
    spans.push((off, len));
}

/// Partition of one transfer's selections by chunk, in ascending chunk order.
#[derive(Debug, Default)]
pub struct ChunkMap {
    chunks: BTreeMap<u64, ChunkInfo>,
    nelmts: u64,
    single: bool,
}

impl ChunkMap {
    pub fn build(geom: &ChunkGeometry, file_space: &Dataspace, mem_space: &Dataspace) -> Result<Self> {
        let nelmts = file_space.npoints();
        if nelmts != mem_space.npoints() {
            return Err(StorageError::SelectionMismatch {
                file: nelmts,
                mem: mem_space.npoints(),
            });
        }
        let Some((lo, hi)) = file_space.bounds() else {
            return Ok(Self::default());
        };
        let lo_grid: Vec<u64> = lo.iter().zip(geom.chunk_dims()).map(|(&l, &c)| l / c).collect();
        let hi_grid: Vec<u64> = hi.iter().zip(geom.chunk_dims()).map(|(&h, &c)| h / c).collect();

        if lo_grid == hi_grid {
            let index = geom.flat_index(&lo_grid);
            let origin = lo_grid
                .iter()
                .zip(geom.chunk_dims())
                .map(|(&g, &c)| g * c)
                .collect();
            let mut info = ChunkInfo::new(index, origin);
            for (off, len) in file_space.spans() {
                split_span(geom, off, len, |_, _, chunk_off, n| {
                    push_span(&mut info.file_spans, chunk_off, n);
                });
            }
            info.npoints = nelmts;
            info.mem_spans = mem_space.spans().collect();
            trace!(chunk = index, nelmts, "single-chunk map");
            let mut chunks = BTreeMap::new();
            chunks.insert(index, info);
            return Ok(Self {
                chunks,
                nelmts,
                single: true,
            });
        }

        let mut chunks: BTreeMap<u64, ChunkInfo> = BTreeMap::new();
        // (chunk, element count) in selection order, used to pair memory.
        let mut order: Vec<(u64, u64)> = Vec::new();
        for (off, len) in file_space.spans() {
            split_span(geom, off, len, |index, grid, chunk_off, n| {
                let info = match chunks.entry(index) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(e) => {
                        let origin = grid
                            .iter()
                            .zip(geom.chunk_dims())
                            .map(|(&g, &c)| g * c)
                            .collect();
                        e.insert(ChunkInfo::new(index, origin))
                    }
                };
                push_span(&mut info.file_spans, chunk_off, n);
                info.npoints += n;
                match order.last_mut() {
                    Some((last, count)) if *last == index => *count += n,
                    _ => order.push((index, n)),
                }
            });
        }

        let mut mem = mem_space.spans();
        let mut pending: Option<(u64, u64)> = None;
        for (index, mut n) in order {
            let Some(info) = chunks.get_mut(&index) else {
                continue;
            };
            while n > 0 {
                let (off, len) = pending
                    .take()
                    .or_else(|| mem.next())
                    .ok_or(StorageError::SelectionMismatch {
                        file: nelmts,
                        mem: mem_space.npoints(),
                    })?;
                let take = len.min(n);
                push_span(&mut info.mem_spans, off, take);
                if take < len {
                    pending = Some((off + take, len - take));
                }
                n -= take;
            }
        }
        debug_assert_eq!(chunks.values().map(|c| c.npoints).sum::<u64>(), nelmts);
        trace!(chunks = chunks.len(), nelmts, "chunk map built");

        Ok(Self {
            chunks,
            nelmts,
            single: false,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChunkInfo> {
        self.chunks.values()
    }

    pub fn get(&self, index: u64) -> Option<&ChunkInfo> {
        self.chunks.get(&index)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn nelmts(&self) -> u64 {
        self.nelmts
    }

    /// Whether the single-chunk fast path built this map.
    pub fn is_single(&self) -> bool {
        self.single
    }
}

/// Split a dataset-linear element span at row and chunk boundaries, calling
/// `emit(chunk_index, chunk_grid, offset_in_chunk, len)` per piece.
fn split_span<F>(geom: &ChunkGeometry, mut off: u64, mut len: u64, mut emit: F)
where
    F: FnMut(u64, &[u64], u64, u64),
{
    let rank = geom.rank();
    let last = rank - 1;
    let dims = geom.dims();
    let cdims = geom.chunk_dims();
    let mut coords = vec![0u64; rank];
    let mut grid = vec![0u64; rank];
    let mut within = vec![0u64; rank];
    while len > 0 {
        unravel(off, dims, &mut coords);
        for d in 0..rank {
            grid[d] = coords[d] / cdims[d];
            within[d] = coords[d] % cdims[d];
        }
        let row_left = dims[last] - coords[last];
        let chunk_left = cdims[last] - within[last];
        let n = len.min(row_left).min(chunk_left);
        emit(geom.flat_index(&grid), &grid, ravel(&within, cdims), n);
        off += n;
        len -= n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::Hyperslab;

    fn geom(dims: &[u64], chunk: &[u64]) -> ChunkGeometry {
        ChunkGeometry::new(dims, chunk, 4).unwrap()
    }

    #[test]
    fn test_geometry() {
        let g = geom(&[10, 7], &[4, 3]);
        assert_eq!(g.nchunks(), &[3, 3]);
        assert_eq!(g.total_chunks(), 9);
        assert_eq!(g.chunk_size(), 48);
        assert_eq!(g.flat_index(&[2, 1]), 7);
        assert_eq!(g.index_of_origin(&[8, 3]), 7);
        assert_eq!(g.origin_of(7), vec![8, 3]);
        assert!(g.straddles(&[8, 0], &[10, 7]));
        assert!(!g.straddles(&[4, 3], &[10, 7]));
        assert!(ChunkGeometry::outside(&[12, 0], &[10, 7]));
        assert!(ChunkGeometry::new(&[4], &[0], 4).is_err());
    }

    #[test]
    fn test_block_across_four_chunks() {
        let g = geom(&[4, 4], &[2, 2]);
        let mut fs = Dataspace::new(&[4, 4]);
        fs.select_hyperslab(Hyperslab::block(&[1, 1], &[2, 2])).unwrap();
        let ms = Dataspace::new(&[4]);

        let map = ChunkMap::build(&g, &fs, &ms).unwrap();
        assert!(!map.is_single());
        assert_eq!(map.len(), 4);
        let got: Vec<_> = map
            .iter()
            .map(|c| (c.index, c.npoints, c.file_spans.clone(), c.mem_spans.clone()))
            .collect();
        assert_eq!(
            got,
            vec![
                (0, 1, vec![(3, 1)], vec![(0, 1)]),
                (1, 1, vec![(2, 1)], vec![(1, 1)]),
                (2, 1, vec![(1, 1)], vec![(2, 1)]),
                (3, 1, vec![(0, 1)], vec![(3, 1)]),
            ]
        );
    }

    #[test]
    fn test_single_chunk_fast_path() {
        let g = geom(&[8, 8], &[4, 4]);
        let mut fs = Dataspace::new(&[8, 8]);
        fs.select_hyperslab(Hyperslab::block(&[5, 4], &[2, 3])).unwrap();
        let ms = Dataspace::new(&[6]);
        let map = ChunkMap::build(&g, &fs, &ms).unwrap();
        assert!(map.is_single());
        let info = map.get(3).unwrap();
        assert_eq!(info.origin, vec![4, 4]);
        assert_eq!(info.file_spans, vec![(4, 3), (8, 3)]);
        assert_eq!(info.mem_spans, vec![(0, 6)]);
        assert_eq!(map.nelmts(), 6);
    }

    #[test]
    fn test_memory_follows_selection_order() {
        // Whole rows of a 2x8 dataset with 2x4 chunks: each row alternates chunks.
        let g = geom(&[2, 8], &[2, 4]);
        let fs = Dataspace::new(&[2, 8]);
        let ms = Dataspace::new(&[16]);
        let map = ChunkMap::build(&g, &fs, &ms).unwrap();
        let c0 = map.get(0).unwrap();
        let c1 = map.get(1).unwrap();
        assert_eq!(c0.file_spans, vec![(0, 8)]);
        assert_eq!(c0.mem_spans, vec![(0, 4), (8, 4)]);
        assert_eq!(c1.mem_spans, vec![(4, 4), (12, 4)]);
    }

    #[test]
    fn test_mismatch_rejected() {
        let g = geom(&[4, 4], &[2, 2]);
        let fs = Dataspace::new(&[4, 4]);
        let ms = Dataspace::new(&[15]);
        assert!(matches!(
            ChunkMap::build(&g, &fs, &ms),
            Err(StorageError::SelectionMismatch { file: 16, mem: 15 })
        ));
    }

    #[test]
    fn test_empty_selection() {
        let g = geom(&[4, 4], &[2, 2]);
        let mut fs = Dataspace::new(&[4, 4]);
        fs.select_none();
        let mut ms = Dataspace::new(&[4]);
        ms.select_none();
        let map = ChunkMap::build(&g, &fs, &ms).unwrap();
        assert!(map.is_empty());
    }
}
