use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};

/// Value used for elements that were never written. Unset means all-zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillValue {
    #[serde(default)]
    pattern: Option<Vec<u8>>,
}

impl FillValue {
    pub fn zero() -> Self {
        Self::default()
    }

    /// One element, encoded in the dataset's file datatype.
    pub fn new(pattern: Vec<u8>) -> Self {
        Self {
            pattern: Some(pattern),
        }
    }

    pub fn pattern(&self) -> Option<&[u8]> {
        self.pattern.as_deref()
    }

    pub fn is_zero(&self) -> bool {
        self.pattern
            .as_ref()
            .is_none_or(|p| p.iter().all(|&b| b == 0))
    }

    pub(crate) fn validate(&self, elem_size: usize) -> Result<()> {
        match &self.pattern {
            Some(p) if p.len() != elem_size => Err(StorageError::invalid(format!(
                "fill value has {} bytes, element size is {elem_size}",
                p.len()
            ))),
            _ => Ok(()),
        }
    }

    /// Fill `dst`, whose first byte sits at byte `stream_off` of a packed run
    /// of elements.
    pub(crate) fn fill_at(&self, dst: &mut [u8], stream_off: u64) {
        match &self.pattern {
            Some(p) if !self.is_zero() => {
                let n = p.len() as u64;
                for (i, b) in dst.iter_mut().enumerate() {
                    *b = p[((stream_off + i as u64) % n) as usize];
                }
            }
            _ => dst.fill(0),
        }
    }
}

/// When storage is allocated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocTime {
    /// On first write.
    #[default]
    Late,
    /// At creation (and on growth), filled with the fill value.
    Early,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_at_offset() {
        let f = FillValue::new(vec![1, 2, 3, 4]);
        let mut buf = [0u8; 6];
        f.fill_at(&mut buf, 2);
        assert_eq!(buf, [3, 4, 1, 2, 3, 4]);
        assert!(!f.is_zero());
    }

    #[test]
    fn test_zero_fill() {
        let mut buf = [9u8; 3];
        FillValue::zero().fill_at(&mut buf, 5);
        assert_eq!(buf, [0; 3]);
        assert!(FillValue::new(vec![0, 0]).is_zero());
    }

    #[test]
    fn test_validate_size() {
        assert!(FillValue::new(vec![1, 2]).validate(4).is_err());
        assert!(FillValue::new(vec![1, 2, 3, 4]).validate(4).is_ok());
        assert!(FillValue::zero().validate(8).is_ok());
    }
}
