//! Chunk filter pipeline.
//!
//! `apply` runs filters front to back and records, per chunk, which optional
//! filters were skipped; `reverse` undoes exactly the complementary set in the
//! opposite order. Filters only ever see whole chunks.

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;
use tracing::trace;

/// Pipelines are limited by the width of the per-chunk exclusion mask.
pub const MAX_FILTERS: usize = 32;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("fletcher32 checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("deflate failed: {0}")]
    Deflate(#[source] std::io::Error),

    #[error("inflate failed: {0}")]
    Inflate(#[source] std::io::Error),

    #[error("chunk of {0} bytes is too short to carry a checksum")]
    Truncated(usize),

    #[error("invalid filter parameter: {0}")]
    InvalidParam(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Filter {
    /// Byte transposition so that equal-significance bytes of consecutive
    /// elements end up adjacent. Helps deflate on numeric data.
    Shuffle { elem_size: usize },
    Deflate { level: u32 },
    /// Appends a 4-byte Fletcher-32 checksum, verified on reverse.
    Fletcher32,
}

impl Filter {
    fn validate(&self) -> Result<(), FilterError> {
        match self {
            Filter::Shuffle { elem_size } if *elem_size == 0 => Err(FilterError::InvalidParam(
                "shuffle element size must be non-zero".to_string(),
            )),
            Filter::Deflate { level } if *level > 9 => Err(FilterError::InvalidParam(format!(
                "deflate level {level} out of range 0..=9"
            ))),
            _ => Ok(()),
        }
    }

    fn forward(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
        match self {
            Filter::Shuffle { elem_size } => Ok(shuffle(data, *elem_size)),
            Filter::Deflate { level } => {
                let mut enc = ZlibEncoder::new(
                    Vec::with_capacity(data.len() / 2),
                    Compression::new(*level),
                );
                enc.write_all(data).map_err(FilterError::Deflate)?;
                enc.finish().map_err(FilterError::Deflate)
            }
            Filter::Fletcher32 => {
                let sum = fletcher32(data);
                let mut out = Vec::with_capacity(data.len() + 4);
                out.extend_from_slice(data);
                out.extend_from_slice(&sum.to_le_bytes());
                Ok(out)
            }
        }
    }

    fn reverse(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
        match self {
            Filter::Shuffle { elem_size } => Ok(unshuffle(data, *elem_size)),
            Filter::Deflate { .. } => {
                let mut out = Vec::with_capacity(data.len() * 2);
                ZlibDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(FilterError::Inflate)?;
                Ok(out)
            }
            Filter::Fletcher32 => {
                if data.len() < 4 {
                    return Err(FilterError::Truncated(data.len()));
                }
                let (body, tail) = data.split_at(data.len() - 4);
                let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
                let computed = fletcher32(body);
                if stored != computed {
                    return Err(FilterError::ChecksumMismatch { stored, computed });
                }
                Ok(body.to_vec())
            }
        }
    }

    fn is_checksum(&self) -> bool {
        matches!(self, Filter::Fletcher32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterEntry {
    pub filter: Filter,
    /// An optional filter may be skipped for an individual chunk.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPipeline {
    entries: Vec<FilterEntry>,
}

impl FilterPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mandatory filter.
    pub fn with(self, filter: Filter) -> Self {
        self.push(filter, false)
    }

    /// Append a filter that may be skipped when it fails or does not help.
    pub fn with_optional(self, filter: Filter) -> Self {
        self.push(filter, true)
    }

    fn push(mut self, filter: Filter, optional: bool) -> Self {
        self.entries.push(FilterEntry { filter, optional });
        self
    }

    pub fn entries(&self) -> &[FilterEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn validate(&self) -> Result<(), FilterError> {
        if self.entries.len() > MAX_FILTERS {
            return Err(FilterError::InvalidParam(format!(
                "pipeline holds {} filters, at most {MAX_FILTERS} allowed",
                self.entries.len()
            )));
        }
        self.entries.iter().try_for_each(|e| e.filter.validate())
    }

    /// Run the pipeline forward. Returns the stored bytes and the exclusion
    /// mask, where bit `i` set means filter `i` was skipped for this chunk.
    pub fn apply(&self, data: &[u8]) -> Result<(Vec<u8>, u32), FilterError> {
        let mut cur = data.to_vec();
        let mut mask = 0u32;
        for (i, entry) in self.entries.iter().enumerate() {
            match entry.filter.forward(&cur) {
                Ok(out)
                    if entry.optional
                        && !entry.filter.is_checksum()
                        && out.len() > cur.len() =>
                {
                    trace!(
                        filter = i,
                        before = cur.len(),
                        after = out.len(),
                        "optional filter skipped: output grew"
                    );
                    mask |= 1 << i;
                }
                Ok(out) => cur = out,
                Err(e) if entry.optional => {
                    trace!(filter = i, error = %e, "optional filter skipped: failed");
                    mask |= 1 << i;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((cur, mask))
    }

    /// Undo `apply`, honouring the exclusion mask recorded for the chunk.
    pub fn reverse(&self, data: &[u8], mask: u32) -> Result<Vec<u8>, FilterError> {
        let mut cur = data.to_vec();
        for (i, entry) in self.entries.iter().enumerate().rev() {
            if mask & (1 << i) != 0 {
                continue;
            }
            cur = entry.filter.reverse(&cur)?;
        }
        Ok(cur)
    }
}

fn shuffle(data: &[u8], elem_size: usize) -> Vec<u8> {
    if elem_size <= 1 || data.len() < elem_size {
        return data.to_vec();
    }
    let n = data.len() / elem_size;
    let body = n * elem_size;
    let mut out = vec![0u8; data.len()];
    for (i, elem) in data[..body].chunks_exact(elem_size).enumerate() {
        for (j, &b) in elem.iter().enumerate() {
            out[j * n + i] = b;
        }
    }
    out[body..].copy_from_slice(&data[body..]);
    out
}

fn unshuffle(data: &[u8], elem_size: usize) -> Vec<u8> {
    if elem_size <= 1 || data.len() < elem_size {
        return data.to_vec();
    }
    let n = data.len() / elem_size;
    let body = n * elem_size;
    let mut out = vec![0u8; data.len()];
    for (i, elem) in out[..body].chunks_exact_mut(elem_size).enumerate() {
        for (j, b) in elem.iter_mut().enumerate() {
            *b = data[j * n + i];
        }
    }
    out[body..].copy_from_slice(&data[body..]);
    out
}

/// Fletcher-32 over big-endian 16-bit words; a trailing odd byte is padded.
fn fletcher32(data: &[u8]) -> u32 {
    let mut sum1: u64 = 0;
    let mut sum2: u64 = 0;
    for block in data.chunks(720) {
        for word in block.chunks(2) {
            let w = match word {
                [hi, lo] => (u64::from(*hi) << 8) | u64::from(*lo),
                [hi] => u64::from(*hi) << 8,
                _ => 0,
            };
            sum1 += w;
            sum2 += sum1;
        }
        sum1 %= 65535;
        sum2 %= 65535;
    }
    ((sum2 << 16) | sum1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8 % 7).wrapping_add(seed)).collect()
    }

    fn noisy(len: usize) -> Vec<u8> {
        let mut x: u32 = 0x9e37_79b9;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect()
    }

    #[test]
    fn test_shuffle_roundtrip_with_tail() {
        let data = patterned(4 * 9 + 3, 1);
        let f = Filter::Shuffle { elem_size: 4 };
        let shuffled = f.forward(&data).unwrap();
        assert_ne!(shuffled, data);
        assert_eq!(f.reverse(&shuffled).unwrap(), data);
    }

    #[test]
    fn test_deflate_shrinks_regular_data() {
        let data = patterned(4096, 3);
        let pipeline = FilterPipeline::new()
            .with(Filter::Shuffle { elem_size: 4 })
            .with(Filter::Deflate { level: 6 });
        let (stored, mask) = pipeline.apply(&data).unwrap();
        assert_eq!(mask, 0);
        assert!(stored.len() < data.len());
        assert_eq!(pipeline.reverse(&stored, mask).unwrap(), data);
    }

    #[test]
    fn test_optional_deflate_skipped_on_incompressible_chunk() {
        let data = noisy(256);
        let pipeline = FilterPipeline::new()
            .with_optional(Filter::Deflate { level: 9 })
            .with(Filter::Fletcher32);
        let (stored, mask) = pipeline.apply(&data).unwrap();
        assert_eq!(mask, 0b01);
        assert_eq!(stored.len(), data.len() + 4);
        assert_eq!(&stored[..data.len()], &data[..]);
        assert_eq!(pipeline.reverse(&stored, mask).unwrap(), data);
    }

    #[test]
    fn test_fletcher_detects_corruption() {
        let data = patterned(100, 9);
        let pipeline = FilterPipeline::new().with(Filter::Fletcher32);
        let (mut stored, mask) = pipeline.apply(&data).unwrap();
        stored[10] ^= 0xff;
        let err = pipeline.reverse(&stored, mask).unwrap_err();
        assert!(matches!(err, FilterError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_corrupt_deflate_stream() {
        let pipeline = FilterPipeline::new().with(Filter::Deflate { level: 1 });
        let err = pipeline.reverse(&[1, 2, 3, 4, 5], 0).unwrap_err();
        assert!(matches!(err, FilterError::Inflate(_)));
    }

    #[test]
    fn test_validate_rejects_bad_params() {
        assert!(
            FilterPipeline::new()
                .with(Filter::Deflate { level: 12 })
                .validate()
                .is_err()
        );
        assert!(
            FilterPipeline::new()
                .with(Filter::Shuffle { elem_size: 0 })
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_fletcher_odd_length() {
        assert_eq!(fletcher32(&[0xab]), fletcher32(&[0xab, 0x00]));
        assert_ne!(fletcher32(&[1, 2, 3, 4]), fletcher32(&[3, 4, 1, 2]));
    }
}
