//! Per-application mutual exclusion.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::ApplicationId;

/// One async mutex per application, created on first use and dropped once
/// nobody holds or waits on it.
#[derive(Default)]
pub(super) struct AppLocks {
    locks: DashMap<ApplicationId, Arc<Mutex<()>>>,
}

impl AppLocks {
    pub(super) async fn lock(&self, app_id: &ApplicationId) -> AppLock<'_> {
        let mutex = Arc::clone(self.locks.entry(app_id.clone()).or_default().value());
        AppLock {
            locks: &self.locks,
            app_id: app_id.clone(),
            guard: Some(mutex.lock_owned().await),
        }
    }

    /// Applications with a live mutex.
    pub(super) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Held while an operation runs on one application.
pub(super) struct AppLock<'a> {
    locks: &'a DashMap<ApplicationId, Arc<Mutex<()>>>,
    app_id: ApplicationId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for AppLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's reference left: no holder, no waiter.
        self.locks
            .remove_if(&self.app_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
