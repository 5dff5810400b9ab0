// Durable file storage under MEDIA_ROOT, served back under MEDIA_URL

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::core::errors::{StorageError, StorageResult};

/// Blob storage contract used by the pipeline
#[async_trait]
pub trait Storage: Send + Sync {
    /// Save `bytes` under the relative `name`; never overwrites. Returns the stored path.
    async fn store(&self, name: &str, bytes: &[u8]) -> StorageResult<String>;

    async fn exists(&self, path: &str) -> bool;

    /// Root-relative public URL of a stored path (e.g. `/media/temp/x.png`)
    fn url_for(&self, path: &str) -> String;

    /// Map a caller-supplied dataset reference to a filesystem location inside the root.
    fn resolve_reference(&self, reference: &str) -> StorageResult<PathBuf>;
}

/// Local filesystem storage
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    media_url: String,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>, media_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            media_url: media_url.into(),
        }
    }

    /// Normalise a relative storage path, rejecting anything that could leave the root.
    fn relative_path(&self, raw: &str) -> StorageResult<PathBuf> {
        let trimmed = raw.trim();
        let trimmed = trimmed.strip_prefix(self.media_url.as_str()).unwrap_or(trimmed);

        let mut relative = PathBuf::new();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::OutsideRoot(raw.to_string()));
                }
            }
        }

        if relative.as_os_str().is_empty() {
            return Err(StorageError::OutsideRoot(raw.to_string()));
        }
        Ok(relative)
    }

    fn to_url_path(relative: &Path) -> String {
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn store(&self, name: &str, bytes: &[u8]) -> StorageResult<String> {
        let relative = self.relative_path(name)?;
        let full = self.root.join(&relative);
        let write_err = |source| StorageError::WriteFailed {
            path: full.display().to_string(),
            source,
        };

        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full)
            .await
            .map_err(write_err)?;
        file.write_all(bytes).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;

        debug!("Stored {} bytes at {}", bytes.len(), full.display());
        Ok(Self::to_url_path(&relative))
    }

    async fn exists(&self, path: &str) -> bool {
        match self.relative_path(path) {
            Ok(relative) => tokio::fs::try_exists(self.root.join(relative))
                .await
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.media_url, path.trim_start_matches('/'))
    }

    fn resolve_reference(&self, reference: &str) -> StorageResult<PathBuf> {
        let relative = self.relative_path(reference)?;
        let full = self.root.join(relative);

        // Symlinks inside the root may still point outside it
        if let (Ok(canonical), Ok(root)) = (full.canonicalize(), self.root.canonicalize()) {
            if !canonical.starts_with(&root) {
                return Err(StorageError::OutsideRoot(reference.to_string()));
            }
        }

        Ok(full)
    }
}
