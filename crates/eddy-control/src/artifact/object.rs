//! [`ArtifactStore`] over `object_store`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::debug;

use crate::config::ArtifactConfig;
use crate::error::{ControlError, ControlResult};

use super::ArtifactStore;

/// Artifact store backed by any [`ObjectStore`].
pub struct ObjectArtifactStore {
    store: Arc<dyn ObjectStore>,
}

impl ObjectArtifactStore {
    /// Create an artifact store from configuration.
    ///
    /// Supports `file:///path` and `memory://` URLs.
    pub fn new(config: &ArtifactConfig) -> ControlResult<Self> {
        let url = config.store_url.as_str();
        let store: Arc<dyn ObjectStore> = if let Some(root) = url.strip_prefix("file://") {
            std::fs::create_dir_all(root)?;
            let local = object_store::local::LocalFileSystem::new_with_prefix(root)
                .map_err(|e| ControlError::artifact(format!("failed to create local store: {e}")))?;
            Arc::new(local)
        } else if url.starts_with("memory://") {
            Arc::new(object_store::memory::InMemory::new())
        } else {
            return Err(ControlError::artifact(format!(
                "unsupported store url: {url}"
            )));
        };
        Ok(Self { store })
    }

    /// Create an artifact store with a pre-configured object store.
    #[must_use]
    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Create an in-memory artifact store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(object_store::memory::InMemory::new()))
    }

    async fn keys(&self, path: &str) -> ControlResult<Vec<ObjectPath>> {
        let prefix = ObjectPath::from(path);
        let mut keys: Vec<ObjectPath> = self
            .store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;
        if keys.is_empty() && self.store.head(&prefix).await.is_ok() {
            keys.push(prefix);
        }
        Ok(keys)
    }

    fn relocate(key: &ObjectPath, from: &ObjectPath, to: &str) -> ObjectPath {
        match key.prefix_match(from) {
            Some(parts) => {
                let rest: Vec<String> = parts.map(|p| p.as_ref().to_owned()).collect();
                if rest.is_empty() {
                    ObjectPath::from(to)
                } else {
                    ObjectPath::from(format!("{}/{}", to.trim_end_matches('/'), rest.join("/")))
                }
            }
            None => ObjectPath::from(to),
        }
    }
}

async fn local_files(root: &Path) -> ControlResult<Vec<(PathBuf, String)>> {
    let metadata = tokio::fs::metadata(root).await?;
    if metadata.is_file() {
        return Ok(vec![(root.to_path_buf(), String::new())]);
    }

    let mut files = Vec::new();
    let mut pending = vec![(root.to_path_buf(), String::new())];
    while let Some((dir, relative)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = if relative.is_empty() {
                name
            } else {
                format!("{relative}/{name}")
            };
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), child));
            } else {
                files.push((entry.path(), child));
            }
        }
    }
    Ok(files)
}

#[async_trait]
impl ArtifactStore for ObjectArtifactStore {
    async fn exists(&self, path: &str) -> ControlResult<bool> {
        Ok(!self.keys(path).await?.is_empty())
    }

    async fn delete(&self, path: &str) -> ControlResult<usize> {
        let keys = self.keys(path).await?;
        for key in &keys {
            match self.store.delete(key).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(path, objects = keys.len(), "deleted");
        Ok(keys.len())
    }

    async fn upload(&self, local: &Path, path: &str) -> ControlResult<usize> {
        let files = local_files(local).await?;
        for (file, relative) in &files {
            let key = if relative.is_empty() {
                path.to_owned()
            } else {
                format!("{}/{relative}", path.trim_end_matches('/'))
            };
            let data = tokio::fs::read(file).await?;
            self.store
                .put(&ObjectPath::from(key), Bytes::from(data).into())
                .await?;
        }
        debug!(local = %local.display(), path, objects = files.len(), "uploaded");
        Ok(files.len())
    }

    async fn put(&self, path: &str, body: Bytes) -> ControlResult<()> {
        self.store.put(&ObjectPath::from(path), body.into()).await?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> ControlResult<usize> {
        let source = ObjectPath::from(from);
        let keys = self.keys(from).await?;
        for key in &keys {
            self.store
                .copy(key, &Self::relocate(key, &source, to))
                .await?;
        }
        Ok(keys.len())
    }

    async fn rename(&self, from: &str, to: &str) -> ControlResult<usize> {
        let source = ObjectPath::from(from);
        let keys = self.keys(from).await?;
        for key in &keys {
            self.store
                .rename(key, &Self::relocate(key, &source, to))
                .await?;
        }
        Ok(keys.len())
    }

    async fn list(&self, path: &str) -> ControlResult<Vec<String>> {
        Ok(self
            .keys(path)
            .await?
            .into_iter()
            .map(|k| k.to_string())
            .collect())
    }
}
