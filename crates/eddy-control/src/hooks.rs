//! Outbound notification collaborators.

use tracing::{debug, trace};

use crate::types::ApplicationId;

/// Publishes text lines to external subscribers.
pub trait Notifier: Send + Sync {
    /// Publish `line` on `topic`.
    fn publish(&self, topic: &str, line: &str);
}

/// Notifier that only writes to the trace log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn publish(&self, topic: &str, line: &str) {
        trace!(topic, line, "publish");
    }
}

/// A cached read model that a mutation may make stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheView {
    /// The single-application view.
    Application,
    /// Paginated application listings.
    ApplicationList,
    /// Dashboard aggregation.
    Dashboard,
}

/// Called by the orchestrator after each state-changing operation.
pub trait InvalidationHook: Send + Sync {
    /// Invalidate `views` for `app_id`.
    fn invalidate(&self, app_id: &ApplicationId, views: &[CacheView]);
}

/// Invalidation hook for deployments without caches.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInvalidation;

impl InvalidationHook for NoopInvalidation {
    fn invalidate(&self, app_id: &ApplicationId, views: &[CacheView]) {
        debug!(app_id = %app_id, ?views, "invalidate");
    }
}
