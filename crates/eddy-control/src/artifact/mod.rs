//! Staged bundle storage and pre-redeploy backups.

mod object;

pub use object::ObjectArtifactStore;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info};

use crate::error::ControlResult;
use crate::types::Application;

/// Path-namespaced storage for staged job bundles and uploaded jars.
///
/// Paths are `/`-separated keys; operations on a path apply to it and
/// everything below it.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Whether anything exists at or below `path`.
    async fn exists(&self, path: &str) -> ControlResult<bool>;

    /// Delete everything at or below `path`; returns the number of objects removed.
    async fn delete(&self, path: &str) -> ControlResult<usize>;

    /// Upload a local file or directory tree to `path`; returns the number of objects written.
    async fn upload(&self, local: &Path, path: &str) -> ControlResult<usize>;

    /// Write a single object.
    async fn put(&self, path: &str, body: Bytes) -> ControlResult<()>;

    /// Copy everything at or below `from` to `to`; returns the number of objects copied.
    async fn copy(&self, from: &str, to: &str) -> ControlResult<usize>;

    /// Move everything at or below `from` to `to`; returns the number of objects moved.
    async fn rename(&self, from: &str, to: &str) -> ControlResult<usize>;

    /// List object keys at or below `path`.
    async fn list(&self, path: &str) -> ControlResult<Vec<String>>;
}

/// Snapshots an application's staged bundle before it is replaced.
#[async_trait]
pub trait BackupService: Send + Sync {
    /// Take a snapshot; a missing bundle is not an error.
    async fn backup(&self, app: &Application, description: Option<&str>) -> ControlResult<()>;
}

/// Backups kept in the artifact store under `{backups}/{id}/{timestamp}`.
pub struct StoreBackup {
    store: Arc<dyn ArtifactStore>,
    workspace: String,
    backups: String,
}

impl StoreBackup {
    /// Create a backup service copying from `workspace` into `backups`.
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        workspace: impl Into<String>,
        backups: impl Into<String>,
    ) -> Self {
        Self {
            store,
            workspace: workspace.into(),
            backups: backups.into(),
        }
    }
}

#[async_trait]
impl BackupService for StoreBackup {
    async fn backup(&self, app: &Application, description: Option<&str>) -> ControlResult<()> {
        let source = format!("{}/{}", self.workspace, app.id);
        if !self.store.exists(&source).await? {
            debug!(app_id = %app.id, "nothing staged, skipping backup");
            return Ok(());
        }

        let target = format!(
            "{}/{}/{}",
            self.backups,
            app.id,
            Utc::now().format("%Y%m%d%H%M%S%3f")
        );
        let copied = self.store.copy(&source, &target).await?;
        if let Some(description) = description {
            self.store
                .put(
                    &format!("{target}.description"),
                    Bytes::from(description.to_owned()),
                )
                .await?;
        }

        info!(app_id = %app.id, path = %target, objects = copied, "bundle backed up");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{ExecutionMode, JobType};

    #[tokio::test]
    async fn backup_copies_staged_bundle() {
        let store: Arc<dyn ArtifactStore> = Arc::new(ObjectArtifactStore::in_memory());
        let app = Application::new("orders", JobType::CustomCode, ExecutionMode::Application);
        store
            .put(&format!("ws/{}/lib/orders.jar", app.id), Bytes::from_static(b"jar"))
            .await
            .unwrap();

        let backup = StoreBackup::new(store.clone(), "ws", "bak");
        backup.backup(&app, Some("before v2")).await.unwrap();

        let keys = store.list(&format!("bak/{}", app.id)).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().any(|k| k.ends_with("/lib/orders.jar")));
        assert!(keys.iter().any(|k| k.ends_with(".description")));
    }

    #[tokio::test]
    async fn backup_without_bundle_is_noop() {
        let store: Arc<dyn ArtifactStore> = Arc::new(ObjectArtifactStore::in_memory());
        let app = Application::new("orders", JobType::CustomCode, ExecutionMode::Application);

        StoreBackup::new(store.clone(), "ws", "bak")
            .backup(&app, None)
            .await
            .unwrap();
        assert!(!store.exists("bak").await.unwrap());
    }
}
