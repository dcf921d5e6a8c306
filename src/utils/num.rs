pub(crate) trait NumCastExt {
    fn as_u32(&self) -> u32;
    fn as_usize(&self) -> usize;
}

impl NumCastExt for u64 {
    #[inline]
    fn as_u32(&self) -> u32 {
        debug_assert!(*self <= u32::MAX as u64);
        *self as u32
    }

    #[inline]
    fn as_usize(&self) -> usize {
        debug_assert!(*self <= usize::MAX as u64);
        *self as usize
    }
}

impl NumCastExt for usize {
    #[inline]
    fn as_u32(&self) -> u32 {
        debug_assert!(*self <= u32::MAX as usize);
        *self as u32
    }

    #[inline]
    fn as_usize(&self) -> usize {
        *self
    }
}

/// Product of a dimension vector; the empty product is 1 (scalar).
#[inline]
pub(crate) fn product(dims: &[u64]) -> u64 {
    dims.iter().product()
}

/// Row-major linear offset of `coords` inside an array of extent `dims`.
#[inline]
pub(crate) fn ravel(coords: &[u64], dims: &[u64]) -> u64 {
    debug_assert_eq!(coords.len(), dims.len());
    coords
        .iter()
        .zip(dims)
        .fold(0u64, |acc, (&c, &d)| acc * d + c)
}

/// Inverse of [`ravel`].
pub(crate) fn unravel(mut linear: u64, dims: &[u64], out: &mut [u64]) {
    debug_assert_eq!(out.len(), dims.len());
    for d in (0..dims.len()).rev() {
        let extent = dims[d].max(1);
        out[d] = linear % extent;
        linear /= extent;
    }
}
