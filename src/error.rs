//! Error surface for the raw-data storage layer.
//!
//! Backend seams (`RawFile`, `ExternalResolver`, `Communicator`) speak
//! `anyhow::Result`; everything that crosses into the engine is folded into
//! [`StorageError`] so callers can tell raw I/O failures apart from filter
//! failures and from selection mistakes.

use crate::config::ConfigError;
use crate::filter::FilterError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("allocation of {bytes} bytes failed")]
    Alloc { bytes: usize },

    #[error("raw data I/O failed: {0}")]
    Io(#[source] anyhow::Error),

    #[error("filter pipeline failed: {0}")]
    Filter(#[from] FilterError),

    #[error("file selection has {file} elements but memory selection has {mem}")]
    SelectionMismatch { file: u64, mem: u64 },

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("type conversion failed: {0}")]
    Conversion(String),

    #[error("corrupt chunk index: {0}")]
    CorruptIndex(String),

    #[error("collective transfer failed: {0}")]
    Collective(#[source] anyhow::Error),

    #[error("{0}")]
    Config(#[from] ConfigError),
}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        StorageError::Io(value.into())
    }
}

impl StorageError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        StorageError::InvalidArgument(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        StorageError::Unsupported(msg.into())
    }

    /// True for failures that came from the backing file rather than from the caller.
    pub fn is_io(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterError;

    #[test]
    fn test_io_error_maps_to_io_variant() {
        let err: StorageError =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read").into();
        assert!(err.is_io());
        assert!(err.to_string().contains("short read"));
    }

    #[test]
    fn test_filter_error_is_distinct_from_io() {
        let err: StorageError = FilterError::ChecksumMismatch {
            stored: 1,
            computed: 2,
        }
        .into();
        assert!(!err.is_io());
        assert!(matches!(err, StorageError::Filter(_)));
    }

    #[test]
    fn test_selection_mismatch_message() {
        let err = StorageError::SelectionMismatch { file: 4, mem: 6 };
        assert_eq!(
            err.to_string(),
            "file selection has 4 elements but memory selection has 6"
        );
    }
}
