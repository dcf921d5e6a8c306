//! Resolution of external-file-list names to backing files.

use super::{LocalFile, MemFile, RawFile};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Maps the file names recorded in an external layout to open files.
#[async_trait]
pub trait ExternalResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn RawFile>>;
}

/// Resolves names relative to a directory, creating files on first use.
pub struct DirResolver {
    root: PathBuf,
}

impl DirResolver {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ExternalResolver for DirResolver {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn RawFile>> {
        let path = self.root.join(name);
        let file = LocalFile::create(path).await?;
        Ok(Arc::new(file))
    }
}

/// In-memory resolver; each name maps to its own `MemFile`.
#[derive(Default)]
pub struct MemResolver {
    files: Mutex<HashMap<String, Arc<MemFile>>>,
}

impl MemResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(&self, name: &str) -> Arc<MemFile> {
        self.files
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemFile::new()))
            .clone()
    }
}

#[async_trait]
impl ExternalResolver for MemResolver {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn RawFile>> {
        Ok(self.file(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mem_resolver_shares_files() {
        let r = MemResolver::new();
        let a = r.resolve("a.raw").await.unwrap();
        a.write_at(0, &[7, 7]).await.unwrap();
        assert_eq!(r.file("a.raw").snapshot().await, vec![7, 7]);
        assert_eq!(r.file("b.raw").snapshot().await, Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_dir_resolver_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let r = DirResolver::new(dir.path());
        let f = r.resolve("ext.bin").await.unwrap();
        f.write_at(0, b"abc").await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("ext.bin")).unwrap(), b"abc");
    }
}
