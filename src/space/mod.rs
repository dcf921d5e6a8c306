//! Dataspaces and selections.
//!
//! A `Dataspace` is an extent (current and maximum dimensions) plus a
//! selection over it. Selections are walked as lazy, row-major sequences of
//! element-linear `(offset, len)` spans; see [`SpanIter`].

mod iter;

pub use iter::SpanIter;

use crate::error::{Result, StorageError};
use crate::utils::product;
use serde::{Deserialize, Serialize};

/// A regular hyperslab: per dimension, `count` blocks of `block` elements,
/// the first starting at `start` and each subsequent one `stride` further.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hyperslab {
    pub start: Vec<u64>,
    pub stride: Vec<u64>,
    pub count: Vec<u64>,
    pub block: Vec<u64>,
}

impl Hyperslab {
    /// A single contiguous block.
    pub fn block(start: &[u64], size: &[u64]) -> Self {
        Self {
            start: start.to_vec(),
            stride: size.iter().map(|&s| s.max(1)).collect(),
            count: vec![1; start.len()],
            block: size.to_vec(),
        }
    }

    pub(crate) fn nelmts(&self) -> u64 {
        self.count
            .iter()
            .zip(&self.block)
            .map(|(&c, &b)| c * b)
            .product()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    All,
    None,
    Hyperslab(Hyperslab),
    /// Individual elements, visited in the order given.
    Points(Vec<Vec<u64>>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataspace {
    dims: Vec<u64>,
    maxdims: Vec<Option<u64>>,
    selection: Selection,
}

impl Dataspace {
    /// Fixed-size dataspace with everything selected.
    pub fn new(dims: &[u64]) -> Self {
        Self {
            dims: dims.to_vec(),
            maxdims: dims.iter().map(|&d| Some(d)).collect(),
            selection: Selection::All,
        }
    }

    /// `None` in `maxdims` means unlimited.
    pub fn with_maxdims(dims: &[u64], maxdims: &[Option<u64>]) -> Result<Self> {
        if dims.len() != maxdims.len() {
            return Err(StorageError::invalid("dims and maxdims rank differ"));
        }
        if let Some(d) = dims
            .iter()
            .zip(maxdims)
            .position(|(&d, m)| m.is_some_and(|m| d > m))
        {
            return Err(StorageError::invalid(format!(
                "dimension {d} exceeds its maximum"
            )));
        }
        Ok(Self {
            dims: dims.to_vec(),
            maxdims: maxdims.to_vec(),
            selection: Selection::All,
        })
    }

    /// Rank-0 dataspace holding one element.
    pub fn scalar() -> Self {
        Self::new(&[])
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[u64] {
        &self.dims
    }

    pub fn maxdims(&self) -> &[Option<u64>] {
        &self.maxdims
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Number of elements in the extent.
    pub fn extent_nelmts(&self) -> u64 {
        product(&self.dims)
    }

    pub fn select_all(&mut self) {
        self.selection = Selection::All;
    }

    pub fn select_none(&mut self) {
        self.selection = Selection::None;
    }

    pub fn select_hyperslab(&mut self, slab: Hyperslab) -> Result<()> {
        let rank = self.rank();
        if [&slab.start, &slab.stride, &slab.count, &slab.block]
            .iter()
            .any(|v| v.len() != rank)
        {
            return Err(StorageError::InvalidSelection(format!(
                "hyperslab rank does not match dataspace rank {rank}"
            )));
        }
        for d in 0..rank {
            let (start, stride, count, block) =
                (slab.start[d], slab.stride[d], slab.count[d], slab.block[d]);
            if count == 0 || block == 0 {
                continue;
            }
            if count > 1 && stride < block {
                return Err(StorageError::InvalidSelection(format!(
                    "dimension {d}: stride {stride} smaller than block {block}"
                )));
            }
            let end = start + (count - 1) * stride + block;
            if end > self.dims[d] {
                return Err(StorageError::InvalidSelection(format!(
                    "dimension {d}: selection ends at {end}, extent is {}",
                    self.dims[d]
                )));
            }
        }
        self.selection = Selection::Hyperslab(slab);
        Ok(())
    }

    pub fn select_points(&mut self, points: Vec<Vec<u64>>) -> Result<()> {
        for p in &points {
            if p.len() != self.rank() || p.iter().zip(&self.dims).any(|(&c, &d)| c >= d) {
                return Err(StorageError::InvalidSelection(format!(
                    "point {p:?} outside extent {:?}",
                    self.dims
                )));
            }
        }
        self.selection = Selection::Points(points);
        Ok(())
    }

    /// Number of selected elements.
    pub fn npoints(&self) -> u64 {
        match &self.selection {
            Selection::All => self.extent_nelmts(),
            Selection::None => 0,
            Selection::Hyperslab(slab) => slab.nelmts(),
            Selection::Points(points) => points.len() as u64,
        }
    }

    /// Inclusive bounding box of the selection, `None` when nothing is selected.
    pub fn bounds(&self) -> Option<(Vec<u64>, Vec<u64>)> {
        if self.npoints() == 0 {
            return None;
        }
        match &self.selection {
            Selection::None => None,
            Selection::All => Some((
                vec![0; self.rank()],
                self.dims.iter().map(|&d| d - 1).collect(),
            )),
            Selection::Hyperslab(slab) => {
                let hi = (0..self.rank())
                    .map(|d| {
                        slab.start[d] + (slab.count[d] - 1) * slab.stride[d] + slab.block[d] - 1
                    })
                    .collect();
                Some((slab.start.clone(), hi))
            }
            Selection::Points(points) => {
                let mut lo = points[0].clone();
                let mut hi = points[0].clone();
                for p in points {
                    for d in 0..p.len() {
                        lo[d] = lo[d].min(p[d]);
                        hi[d] = hi[d].max(p[d]);
                    }
                }
                Some((lo, hi))
            }
        }
    }

    /// Whether the selection is block-structured. Point lists are not.
    pub fn is_regular(&self) -> bool {
        !matches!(self.selection, Selection::Points(_))
    }

    /// Element-linear spans of the selection, coalesced, in visiting order.
    pub fn spans(&self) -> SpanIter<'_> {
        SpanIter::new(self)
    }

    /// Change the extent, keeping maxdims. The selection resets to all.
    pub(crate) fn set_extent(&mut self, dims: &[u64]) -> Result<()> {
        if dims.len() != self.rank() {
            return Err(StorageError::invalid("new extent has a different rank"));
        }
        if let Some(d) = dims
            .iter()
            .zip(&self.maxdims)
            .position(|(&d, m)| m.is_some_and(|m| d > m))
        {
            return Err(StorageError::invalid(format!(
                "dimension {d} would exceed its maximum"
            )));
        }
        self.dims = dims.to_vec();
        self.selection = Selection::All;
        Ok(())
    }
}
