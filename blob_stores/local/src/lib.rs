use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use bytes::Bytes;
use chunkdrive_core::store::{StoreError, StoreResult};
use tempfile::NamedTempFile;

#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    pub base_path: String,
}

/// Chunk directory on the local filesystem.
///
/// Publication is atomic and crash-safe: bytes are written to an
/// unlinked-on-drop temporary file in the chunk directory and then
/// hard-linked into the final name, so an interrupted import never
/// leaves a partially written content-addressed file.
#[derive(Debug, Clone)]
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    pub fn create(config: LocalStoreConfig) -> Self {
        LocalStore {
            base_path: config.base_path.into(),
        }
    }

    pub fn open(base_path: impl AsRef<Path>) -> Self {
        LocalStore {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn resolve_path(&self, name: &str) -> StoreResult<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(anyhow!(
                "Invalid chunk name: '{}'. Must be a bare file name.",
                name
            ));
        }
        Ok(self.base_path.join(name))
    }
}

#[async_trait::async_trait]
impl chunkdrive_core::store::BlobStore for LocalStore {
    async fn put(&self, name: &str, bytes: Bytes) -> StoreResult<()> {
        let final_path = self.resolve_path(name)?;
        let base_path = self.base_path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&base_path)?;
            let mut tmp = NamedTempFile::new_in(&base_path)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            match std::fs::hard_link(tmp.path(), &final_path) {
                Ok(()) => Ok(()),
                // Another import published the same content first;
                // the chunk is immutable, so theirs is ours.
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await??;
        Ok(())
    }

    async fn get(&self, name: &str) -> StoreResult<Bytes> {
        let path = self.resolve_path(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes.into()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound.into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        let path = self.resolve_path(name)?;
        tokio::fs::try_exists(&path).await.map_err(Into::into)
    }
}
