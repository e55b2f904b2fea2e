//! Job lifecycle orchestration.
//!
//! [`JobOrchestrator`] owns the tracking registry, the resolution log and the
//! worker pool, and drives applications through deploy, start and cancel.
//!
//! Operations on one application are serialised by a per-application mutex.
//! The in-flight marker ([`OptionState`]) is still checked so that a stop
//! running in the background blocks new deploys, starts and cancels until it
//! completes.

mod cancel;
mod deploy;
mod guard;
mod start;
mod update;

pub use cancel::{CancelOutcome, CancelRequest};
pub use deploy::{DeployOutcome, DeployRequest, DeployStage};
pub use start::{StartOutcome, StartRequest};
pub use update::{CreateRequest, UpdateOutcome, UpdateRequest};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::artifact::{ArtifactStore, BackupService};
use crate::config::ControlConfig;
use crate::dependency::{ArtifactSource, DependencyResolver, ResolutionLog};
use crate::error::{ControlError, ControlResult};
use crate::hooks::{CacheView, InvalidationHook, Notifier};
use crate::pool::WorkerPool;
use crate::state::{AppState, DeployMarker, OptionState};
use crate::store::{ApplicationFilter, JobStore};
use crate::submitter::Submitter;
use crate::tracking::{ApplicationView, Dashboard, TrackedJob, TrackingRegistry};
use crate::types::{
    Application, ApplicationId, ApplicationLog, ApplicationPatch, ConfigDefinition,
    DefinitionKind, DefinitionVersion, SavePoint, SqlDefinition,
};
use crate::version::VersionBook;

use deploy::Stager;
use guard::{AppLock, AppLocks};

/// External collaborators the orchestrator is wired to.
pub struct Collaborators {
    /// Entity repository.
    pub store: Arc<dyn JobStore>,
    /// Staged bundle storage.
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Snapshot-before-redeploy.
    pub backup: Arc<dyn BackupService>,
    /// Cluster submission.
    pub submitter: Arc<dyn Submitter>,
    /// Where build coordinates are fetched from.
    pub source: Arc<dyn ArtifactSource>,
    /// Resolution log subscribers.
    pub notifier: Arc<dyn Notifier>,
    /// Cache invalidation after mutations.
    pub invalidation: Arc<dyn InvalidationHook>,
}

/// Where a job name is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Existence {
    /// Free.
    No,
    /// Another application uses it.
    InRepository,
    /// A job with this name runs in the cluster.
    InCluster,
}

/// An application with its effective definitions and live view.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationDetail {
    /// Stored row.
    pub application: Application,
    /// Effective configuration, or the first candidate before any deploy.
    pub config: Option<ConfigDefinition>,
    /// Effective SQL, or the first candidate before any deploy.
    pub sql: Option<SqlDefinition>,
    /// Live view, if tracked.
    pub live: Option<TrackedJob>,
}

/// Drives applications through their lifecycle.
pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    versions: VersionBook,
    backup: Arc<dyn BackupService>,
    submitter: Arc<dyn Submitter>,
    stager: Stager,
    resolution_log: Arc<ResolutionLog>,
    tracking: Arc<TrackingRegistry>,
    pool: WorkerPool,
    invalidation: Arc<dyn InvalidationHook>,
    config: ControlConfig,
    locks: AppLocks,
}

impl JobOrchestrator {
    /// Create an orchestrator with its own tracking registry and worker pool.
    #[must_use]
    pub fn new(config: ControlConfig, collaborators: Collaborators) -> Self {
        let resolution_log = Arc::new(ResolutionLog::new(
            collaborators.notifier,
            config.notifier.topic.clone(),
        ));
        let resolver = Arc::new(DependencyResolver::new(
            collaborators.source,
            config.resolver.exclusions.clone(),
        ));
        let stager = Stager::new(
            collaborators.artifacts,
            resolver,
            Arc::clone(&resolution_log),
            config.workspace.clone(),
        );

        Self {
            versions: VersionBook::new(Arc::clone(&collaborators.store)),
            store: collaborators.store,
            backup: collaborators.backup,
            submitter: collaborators.submitter,
            stager,
            resolution_log,
            tracking: Arc::new(TrackingRegistry::new()),
            pool: WorkerPool::new(&config.pool),
            invalidation: collaborators.invalidation,
            config,
            locks: AppLocks::default(),
        }
    }

    /// The live tracking registry, for a runtime monitor to feed.
    #[must_use]
    pub fn tracking(&self) -> &Arc<TrackingRegistry> {
        &self.tracking
    }

    /// The worker pool running slow operations.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Stop accepting background work and drain the pool.
    pub async fn shutdown(&self, grace: Duration) {
        info!(queued = self.pool.queued(), "draining worker pool");
        self.pool.shutdown(grace).await;
    }

    async fn lock(&self, app_id: &ApplicationId) -> AppLock<'_> {
        self.locks.lock(app_id).await
    }

    /// Applications with an operation running or waiting.
    #[must_use]
    pub fn busy(&self) -> usize {
        self.locks.len()
    }

    async fn application(&self, app_id: &ApplicationId) -> ControlResult<Application> {
        self.store
            .get_application(app_id)
            .await?
            .ok_or_else(|| ControlError::ApplicationNotFound(app_id.to_string()))
    }

    fn ensure_idle(app: &Application) -> ControlResult<()> {
        if app.option_state.blocks_operations() {
            return Err(ControlError::OperationInProgress {
                application: app.id.to_string(),
                marker: app.option_state.as_str(),
            });
        }
        Ok(())
    }

    fn invalidate(&self, app_id: &ApplicationId, views: &[CacheView]) {
        self.invalidation.invalidate(app_id, views);
    }

    /// Where `job_name` is already in use, if anywhere.
    pub async fn check_exists(&self, job_name: &str) -> ControlResult<Existence> {
        if self.store.find_by_job_name(job_name).await?.is_some() {
            return Ok(Existence::InRepository);
        }
        if self.submitter.job_name_in_use(job_name).await? {
            return Ok(Existence::InCluster);
        }
        Ok(Existence::No)
    }

    /// Bind an application to a job already running in the cluster and track it.
    pub async fn mapping(
        &self,
        app_id: &ApplicationId,
        cluster_app_id: impl Into<String>,
        cluster_job_id: Option<String>,
    ) -> ControlResult<Application> {
        let _guard = self.lock(app_id).await;
        let app = self.application(app_id).await?;
        Self::ensure_idle(&app)?;

        let patch = ApplicationPatch {
            cluster_app_id: Some(Some(cluster_app_id.into())),
            cluster_job_id: Some(cluster_job_id),
            end_time: Some(None),
            ..ApplicationPatch::new()
        }
        .with_state(AppState::Running)
        .with_option_state(OptionState::None);
        let app = self.store.update_application(app_id, patch).await?;
        self.tracking.register(TrackedJob::from_application(&app));

        info!(
            app_id = %app_id,
            cluster_app_id = ?app.cluster_app_id,
            "application mapped to running job"
        );
        self.invalidate(
            app_id,
            &[CacheView::Application, CacheView::ApplicationList, CacheView::Dashboard],
        );
        Ok(app)
    }

    /// Clear the pending remediation marker.
    pub async fn clean(&self, app_id: &ApplicationId) -> ControlResult<Application> {
        let _guard = self.lock(app_id).await;
        let app = self
            .store
            .update_application(app_id, ApplicationPatch::new().with_deploy(DeployMarker::None))
            .await?;
        debug!(app_id = %app_id, "deploy marker cleared");
        self.invalidate(app_id, &[CacheView::Application, CacheView::ApplicationList]);
        Ok(app)
    }

    /// Promote the latest SQL and configuration candidates to effective.
    ///
    /// Returns the number of definition kinds promoted.
    pub async fn to_effective(&self, app_id: &ApplicationId) -> ControlResult<usize> {
        let _guard = self.lock(app_id).await;
        self.application(app_id).await?;
        let promoted = self.versions.promote(app_id).await?;
        self.invalidate(app_id, &[CacheView::Application]);
        Ok(promoted)
    }

    /// An application with its effective definitions merged in.
    pub async fn detail(&self, app_id: &ApplicationId) -> ControlResult<ApplicationDetail> {
        let application = self.application(app_id).await?;
        let config = self
            .versions
            .effective_or_latest(app_id, DefinitionKind::Config)
            .await?
            .and_then(|v| v.as_config().cloned());
        let sql = if application.is_sql_job() {
            self.versions
                .effective_or_latest(app_id, DefinitionKind::Sql)
                .await?
                .and_then(|v| v.as_sql().cloned())
        } else {
            None
        };
        Ok(ApplicationDetail {
            live: self.tracking.get(app_id),
            application,
            config,
            sql,
        })
    }

    /// Definition versions of one kind, newest first.
    pub async fn history(
        &self,
        app_id: &ApplicationId,
        kind: DefinitionKind,
    ) -> ControlResult<Vec<DefinitionVersion>> {
        self.versions.history(app_id, kind).await
    }

    /// Ask for an application's resolution output, replayed from the beginning.
    pub async fn tail_resolution(&self, app_id: &ApplicationId) -> ControlResult<()> {
        self.application(app_id).await?;
        self.resolution_log.tail(app_id);
        Ok(())
    }

    /// Stored applications with their live views overlaid.
    pub async fn list(&self, filter: &ApplicationFilter) -> ControlResult<Vec<ApplicationView>> {
        let applications = self.store.list_applications(filter).await?;
        Ok(self.tracking.overlay(applications))
    }

    /// Aggregate over tracked jobs.
    #[must_use]
    pub fn dashboard(&self) -> Dashboard {
        self.tracking.dashboard()
    }

    /// Live view of one application.
    #[must_use]
    pub fn tracked(&self, app_id: &ApplicationId) -> Option<TrackedJob> {
        self.tracking.get(app_id)
    }

    /// Savepoints of an application, newest first.
    pub async fn savepoints(&self, app_id: &ApplicationId) -> ControlResult<Vec<SavePoint>> {
        self.store.list_savepoints(app_id).await
    }

    /// Submission log of an application, newest first.
    pub async fn logs(&self, app_id: &ApplicationId) -> ControlResult<Vec<ApplicationLog>> {
        self.store.list_logs(app_id).await
    }
}
