use super::{Dataspace, Hyperslab, Selection};
use crate::utils::ravel;

/// Lazy iterator over the element-linear `(offset, len)` spans of a selection.
///
/// Hyperslabs are visited in row-major order, point lists in the order the
/// points were given. Adjacent spans are merged. The iterator is finite and
/// cannot be restarted; ask the dataspace for a fresh one instead.
pub struct SpanIter<'a> {
    inner: Inner<'a>,
    pending: Option<(u64, u64)>,
}

enum Inner<'a> {
    Empty,
    Once(Option<(u64, u64)>),
    Slab(SlabWalk<'a>),
    Points {
        dims: &'a [u64],
        points: std::slice::Iter<'a, Vec<u64>>,
    },
}

impl<'a> SpanIter<'a> {
    pub(super) fn new(space: &'a Dataspace) -> Self {
        let inner = match &space.selection {
            _ if space.npoints() == 0 => Inner::Empty,
            Selection::None => Inner::Empty,
            Selection::All => Inner::Once(Some((0, space.extent_nelmts()))),
            Selection::Hyperslab(_) if space.rank() == 0 => Inner::Once(Some((0, 1))),
            Selection::Hyperslab(slab) => Inner::Slab(SlabWalk::new(&space.dims, slab)),
            Selection::Points(points) => Inner::Points {
                dims: &space.dims,
                points: points.iter(),
            },
        };
        Self {
            inner,
            pending: None,
        }
    }

    fn raw_next(&mut self) -> Option<(u64, u64)> {
        match &mut self.inner {
            Inner::Empty => None,
            Inner::Once(span) => span.take(),
            Inner::Slab(walk) => walk.next(),
            Inner::Points { dims, points } => points.next().map(|p| (ravel(p, dims), 1)),
        }
    }
}

impl Iterator for SpanIter<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let mut cur = match self.pending.take() {
            Some(span) => span,
            None => self.raw_next()?,
        };
        while let Some(next) = self.raw_next() {
            if cur.0 + cur.1 == next.0 {
                cur.1 += next.1;
            } else {
                self.pending = Some(next);
                break;
            }
        }
        Some(cur)
    }
}

/// Odometer over the outer dimensions of a hyperslab; each step emits one
/// block of the last dimension.
struct SlabWalk<'a> {
    dims: &'a [u64],
    slab: &'a Hyperslab,
    /// Per outer dimension, position within `count * block` selected indices.
    pos: Vec<u64>,
    /// Block number within the last dimension.
    col: u64,
    coords: Vec<u64>,
    done: bool,
}

impl<'a> SlabWalk<'a> {
    fn new(dims: &'a [u64], slab: &'a Hyperslab) -> Self {
        let rank = dims.len();
        Self {
            dims,
            slab,
            pos: vec![0; rank - 1],
            col: 0,
            coords: vec![0; rank],
            done: false,
        }
    }

    fn next(&mut self) -> Option<(u64, u64)> {
        if self.done {
            return None;
        }
        let last = self.dims.len() - 1;
        let s = self.slab;
        for (d, &k) in self.pos.iter().enumerate() {
            self.coords[d] = s.start[d] + (k / s.block[d]) * s.stride[d] + k % s.block[d];
        }
        self.coords[last] = s.start[last] + self.col * s.stride[last];
        let span = (ravel(&self.coords, self.dims), s.block[last]);

        self.col += 1;
        if self.col == s.count[last] {
            self.col = 0;
            self.done = true;
            for d in (0..last).rev() {
                self.pos[d] += 1;
                if self.pos[d] < s.count[d] * s.block[d] {
                    self.done = false;
                    break;
                }
                self.pos[d] = 0;
            }
        }
        Some(span)
    }
}
