//! Repository for applications, definition versions, savepoints and logs.
//!
//! Persistence lives outside this crate; the orchestrator only talks to the
//! [`JobStore`] trait. [`MemoryStore`] backs tests and single-node setups.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::state::AppState;
use crate::types::{
    Application, ApplicationId, ApplicationLog, ApplicationPatch, DefinitionKind,
    DefinitionVersion, JobType, SavePoint, VersionId,
};

/// Filter criteria for listing applications.
#[derive(Debug, Clone, Default)]
pub struct ApplicationFilter {
    /// Substring of the job name.
    pub job_name: Option<String>,
    /// Lifecycle state.
    pub state: Option<AppState>,
    /// Development mode.
    pub job_type: Option<JobType>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl ApplicationFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            job_name: None,
            state: None,
            job_type: None,
            limit: None,
            offset: None,
        }
    }

    /// Filter by job name substring.
    #[must_use]
    pub fn with_job_name(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = Some(job_name.into());
        self
    }

    /// Filter by state.
    #[must_use]
    pub const fn with_state(mut self, state: AppState) -> Self {
        self.state = Some(state);
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Backend for storing orchestrator entities.
///
/// Flag updates on definition versions and savepoints must be atomic per
/// application: readers never observe two `effective` or two `latest` rows
/// of the same kind.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new application.
    async fn insert_application(&self, app: &Application) -> ControlResult<()>;

    /// Get an application by ID.
    async fn get_application(&self, id: &ApplicationId) -> ControlResult<Option<Application>>;

    /// Find an application by exact job name.
    async fn find_by_job_name(&self, job_name: &str) -> ControlResult<Option<Application>>;

    /// Write only the fields set in `patch` and return the updated row.
    async fn update_application(
        &self,
        id: &ApplicationId,
        patch: ApplicationPatch,
    ) -> ControlResult<Application>;

    /// Overwrite the user-editable definition of an application.
    ///
    /// Lifecycle state, markers and cluster handles are left untouched.
    async fn update_definition(&self, app: &Application) -> ControlResult<()>;

    /// List applications matching the filter, newest first.
    async fn list_applications(&self, filter: &ApplicationFilter)
        -> ControlResult<Vec<Application>>;

    /// Reset every in-flight marker to none and settle transitional lifecycle
    /// states (see [`AppState::settled`]); returns the number of rows touched.
    async fn reset_option_states(&self) -> ControlResult<usize>;

    /// Insert a definition version.
    ///
    /// A row inserted as `effective` clears `effective` and `latest` on its
    /// siblings of the same kind; a row inserted as `latest` clears `latest`
    /// on its siblings.
    async fn insert_version(&self, version: &DefinitionVersion) -> ControlResult<()>;

    /// Get a definition version by ID.
    async fn get_version(&self, id: &VersionId) -> ControlResult<Option<DefinitionVersion>>;

    /// List versions of one kind for an application, newest first.
    async fn list_versions(
        &self,
        app_id: &ApplicationId,
        kind: DefinitionKind,
    ) -> ControlResult<Vec<DefinitionVersion>>;

    /// Flag a version as the latest candidate, clearing the flag elsewhere.
    async fn set_latest(&self, app_id: &ApplicationId, id: &VersionId) -> ControlResult<()>;

    /// Flag a version as effective.
    ///
    /// Clears `effective` on its siblings and `latest` on every row of the kind.
    async fn set_effective(&self, app_id: &ApplicationId, id: &VersionId) -> ControlResult<()>;

    /// Insert a savepoint; if it is `latest`, siblings lose the flag.
    async fn insert_savepoint(&self, savepoint: &SavePoint) -> ControlResult<()>;

    /// The latest non-obsolete savepoint of an application.
    async fn latest_savepoint(&self, app_id: &ApplicationId) -> ControlResult<Option<SavePoint>>;

    /// Clear `latest` on every savepoint of an application.
    async fn obsolete_savepoints(&self, app_id: &ApplicationId) -> ControlResult<()>;

    /// List savepoints of an application, newest first.
    async fn list_savepoints(&self, app_id: &ApplicationId) -> ControlResult<Vec<SavePoint>>;

    /// Append a submission log record.
    async fn insert_log(&self, log: &ApplicationLog) -> ControlResult<()>;

    /// List submission logs of an application, newest first.
    async fn list_logs(&self, app_id: &ApplicationId) -> ControlResult<Vec<ApplicationLog>>;
}
