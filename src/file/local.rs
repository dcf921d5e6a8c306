//! Local filesystem backing file.

use super::RawFile;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

pub struct LocalFile {
    path: PathBuf,
    file: Mutex<fs::File>,
}

impl LocalFile {
    /// Open an existing file for read/write.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Open for read/write, creating the file (and its parent directory) if needed.
    pub async fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).await?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .with_context(|| format!("create {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RawFile for LocalFile {
    #[tracing::instrument(level = "trace", skip(self, buf), fields(len = buf.len()))]
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut f = self.file.lock().await;
        f.seek(SeekFrom::Start(offset)).await?;
        let mut done = 0;
        while done < buf.len() {
            let n = f.read(&mut buf[done..]).await?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    #[tracing::instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut f = self.file.lock().await;
        f.seek(SeekFrom::Start(offset)).await?;
        f.write_all(data).await?;
        f.flush().await?;
        Ok(())
    }

    async fn len(&self) -> Result<u64> {
        let f = self.file.lock().await;
        Ok(f.metadata().await?.len())
    }

    async fn sync(&self) -> Result<()> {
        let mut f = self.file.lock().await;
        f.flush().await?;
        f.sync_data().await?;
        Ok(())
    }
}
