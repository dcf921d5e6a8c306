//! Engine configuration: file-access settings (chunk cache, sieve buffer,
//! compact limit) and per-call transfer settings.

use crate::parallel::TransferStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_CHUNK_CACHE_NSLOTS: usize = 521;
pub const DEFAULT_CHUNK_CACHE_NBYTES: usize = 1024 * 1024; // 1MB
pub const DEFAULT_SIEVE_BUF_SIZE: usize = 64 * 1024; // 64KB
pub const DEFAULT_MAX_COMPACT_SIZE: usize = 64 * 1024; // 64KB
pub const DEFAULT_TCONV_BUF_SIZE: usize = 1024 * 1024; // 1MB
pub const DEFAULT_VECTOR_SIZE: usize = 1024;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCacheConfig {
    /// Maximum number of chunks resident at once.
    #[serde(default = "default_nslots")]
    pub nslots: usize,

    /// Byte budget for resident chunk buffers. Chunks larger than this bypass
    /// the cache entirely. Locked chunks may push residency past the budget.
    #[serde(default = "default_nbytes")]
    pub nbytes: usize,
}

fn default_nslots() -> usize {
    DEFAULT_CHUNK_CACHE_NSLOTS
}

fn default_nbytes() -> usize {
    DEFAULT_CHUNK_CACHE_NBYTES
}

impl Default for ChunkCacheConfig {
    fn default() -> Self {
        Self {
            nslots: DEFAULT_CHUNK_CACHE_NSLOTS,
            nbytes: DEFAULT_CHUNK_CACHE_NBYTES,
        }
    }
}

impl ChunkCacheConfig {
    pub fn nslots(self, nslots: usize) -> Self {
        Self { nslots, ..self }
    }

    pub fn nbytes(self, nbytes: usize) -> Self {
        Self { nbytes, ..self }
    }
}

/// File-access configuration shared by every dataset opened through a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub chunk_cache: ChunkCacheConfig,

    /// Size of the read-ahead/write-behind buffer used by contiguous storage.
    /// Zero disables sieving.
    #[serde(default = "default_sieve_buf_size")]
    pub sieve_buf_size: usize,

    /// Upper bound on the raw size of a compact dataset.
    #[serde(default = "default_max_compact_size")]
    pub max_compact_size: usize,
}

fn default_sieve_buf_size() -> usize {
    DEFAULT_SIEVE_BUF_SIZE
}

fn default_max_compact_size() -> usize {
    DEFAULT_MAX_COMPACT_SIZE
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_cache: ChunkCacheConfig::default(),
            sieve_buf_size: DEFAULT_SIEVE_BUF_SIZE,
            max_compact_size: DEFAULT_MAX_COMPACT_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn chunk_cache(self, chunk_cache: ChunkCacheConfig) -> Self {
        Self {
            chunk_cache,
            ..self
        }
    }

    pub fn sieve_buf_size(self, sieve_buf_size: usize) -> Self {
        Self {
            sieve_buf_size,
            ..self
        }
    }

    pub fn max_compact_size(self, max_compact_size: usize) -> Self {
        Self {
            max_compact_size,
            ..self
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::IoError)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_cache.nslots == 0 {
            return Err(ConfigError::Invalid {
                field: "chunk_cache.nslots",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Per-call transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XferConfig {
    /// Size of the type-conversion scratch buffer; together with the larger of
    /// the two element sizes this fixes the strip-mine element count.
    #[serde(default = "default_tconv_buf_size")]
    pub tconv_buf_size: usize,

    /// Maximum number of (offset, length) sequences handed to one vectored call.
    #[serde(default = "default_vector_size")]
    pub vector_size: usize,

    /// Independent or collective transfer. Not persisted.
    #[serde(skip)]
    pub strategy: TransferStrategy,
}

fn default_tconv_buf_size() -> usize {
    DEFAULT_TCONV_BUF_SIZE
}

fn default_vector_size() -> usize {
    DEFAULT_VECTOR_SIZE
}

impl Default for XferConfig {
    fn default() -> Self {
        Self {
            tconv_buf_size: DEFAULT_TCONV_BUF_SIZE,
            vector_size: DEFAULT_VECTOR_SIZE,
            strategy: TransferStrategy::Independent,
        }
    }
}

impl XferConfig {
    pub fn tconv_buf_size(self, tconv_buf_size: usize) -> Self {
        Self {
            tconv_buf_size,
            ..self
        }
    }

    pub fn vector_size(self, vector_size: usize) -> Self {
        Self {
            vector_size,
            ..self
        }
    }

    pub fn strategy(self, strategy: TransferStrategy) -> Self {
        Self { strategy, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_cache.nslots, 521);
        assert_eq!(config.chunk_cache.nbytes, 1024 * 1024);
        assert_eq!(config.sieve_buf_size, 64 * 1024);

        let xfer = XferConfig::default();
        assert_eq!(xfer.tconv_buf_size, 1024 * 1024);
        assert!(matches!(xfer.strategy, TransferStrategy::Independent));
    }

    #[test]
    fn test_yaml_partial_overrides() {
        let yaml = r#"
chunk_cache:
  nbytes: 4096
sieve_buf_size: 0
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.chunk_cache.nbytes, 4096);
        assert_eq!(config.chunk_cache.nslots, DEFAULT_CHUNK_CACHE_NSLOTS);
        assert_eq!(config.sieve_buf_size, 0);
        assert_eq!(config.max_compact_size, DEFAULT_MAX_COMPACT_SIZE);
    }

    #[test]
    fn test_yaml_rejects_zero_slots() {
        let yaml = "chunk_cache:\n  nslots: 0\n";
        let err = EngineConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arraystore.yml");
        std::fs::write(&path, "max_compact_size: 128\n").unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.max_compact_size, 128);

        let missing = EngineConfig::from_file(dir.path().join("missing.yml"));
        assert!(matches!(missing, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_builder_setters() {
        let config = EngineConfig::default()
            .chunk_cache(ChunkCacheConfig::default().nslots(2).nbytes(128))
            .sieve_buf_size(32);
        assert_eq!(config.chunk_cache.nslots, 2);
        assert_eq!(config.chunk_cache.nbytes, 128);
        assert_eq!(config.sieve_buf_size, 32);

        let xfer = XferConfig::default().tconv_buf_size(64).vector_size(4);
        assert_eq!(xfer.tconv_buf_size, 64);
        assert_eq!(xfer.vector_size, 4);
    }
}
