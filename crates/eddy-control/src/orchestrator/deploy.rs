//! Artifact staging and the deploy transition.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactStore;
use crate::config::WorkspaceConfig;
use crate::dependency::{Coordinate, DependencyResolver, ResolutionLog};
use crate::error::{ControlError, ControlResult};
use crate::hooks::CacheView;
use crate::state::{AppState, DeployMarker, OptionState};
use crate::types::{Application, ApplicationId, ApplicationPatch, DefinitionKind};

use super::{CancelOutcome, CancelRequest, JobOrchestrator, StartOutcome, StartRequest};

/// Options for a deploy.
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    /// Stop the running job first and start it again once staged.
    pub restart: bool,
    /// Snapshot the current bundle before replacing it.
    pub backup: bool,
    /// Note stored with the backup.
    pub backup_description: Option<String>,
}

/// Step of a deploy that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    /// Stopping the running job.
    Cancel,
    /// Snapshotting the current bundle.
    Backup,
    /// Removing the old bundle and staging the new one.
    Stage,
    /// Starting the job again.
    Start,
}

/// How a deploy ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeployOutcome {
    /// Staged and promoted; nothing was running.
    Deployed,
    /// Staged while the old instance keeps running; a restart picks it up.
    StagedPendingRestart,
    /// Staged and started again.
    Restarted {
        /// Handle of the new run.
        cluster_app_id: String,
    },
    /// A step failed; earlier steps are not undone.
    PartialFailure {
        /// The failing step.
        stage: DeployStage,
        /// Failure detail.
        reason: String,
    },
}

/// Stages an application's bundle in the artifact store.
#[derive(Clone)]
pub(super) struct Stager {
    artifacts: Arc<dyn ArtifactStore>,
    resolver: Arc<DependencyResolver>,
    log: Arc<ResolutionLog>,
    workspace: WorkspaceConfig,
}

impl Stager {
    pub(super) fn new(
        artifacts: Arc<dyn ArtifactStore>,
        resolver: Arc<DependencyResolver>,
        log: Arc<ResolutionLog>,
        workspace: WorkspaceConfig,
    ) -> Self {
        Self {
            artifacts,
            resolver,
            log,
            workspace,
        }
    }

    /// Replace the bundle at `{remote}/{id}`; returns the number of objects staged.
    ///
    /// The new bundle is assembled under `{staging}/{id}` and only moved over
    /// the live one once it is complete, so a failed resolution or upload
    /// leaves the previous bundle in place.
    pub(super) async fn stage(self, app: Application) -> ControlResult<usize> {
        let home = self.home(&app.id);
        let scratch = format!("{}/{}", self.workspace.staging, app.id);
        self.artifacts.delete(&scratch).await?;

        let assembled = if app.is_sql_job() {
            self.stage_sql(&app, &scratch).await
        } else {
            self.stage_custom_code(&app, &scratch).await
        };
        let staged = match assembled {
            Ok(staged) => staged,
            Err(e) => {
                if let Err(cleanup) = self.artifacts.delete(&scratch).await {
                    warn!(
                        app_id = %app.id,
                        path = %scratch,
                        error = %cleanup,
                        "failed to remove partial bundle"
                    );
                }
                return Err(e);
            }
        };

        let removed = self.artifacts.delete(&home).await?;
        if removed > 0 {
            debug!(app_id = %app.id, path = %home, objects = removed, "removed previous bundle");
        }
        self.artifacts.rename(&scratch, &home).await?;
        info!(app_id = %app.id, path = %home, objects = staged, "bundle staged");
        Ok(staged)
    }

    /// Whether a bundle is live for an application.
    pub(super) async fn is_staged(&self, app_id: &ApplicationId) -> ControlResult<bool> {
        self.artifacts.exists(&self.home(app_id)).await
    }

    fn home(&self, app_id: &ApplicationId) -> String {
        format!("{}/{app_id}", self.workspace.remote)
    }

    async fn stage_custom_code(&self, app: &Application, target: &str) -> ControlResult<usize> {
        let base = app.local_base.as_deref().ok_or_else(|| {
            ControlError::configuration(format!("{} has no local build output", app.job_name))
        })?;
        let module = app.module.as_deref().ok_or_else(|| {
            ControlError::configuration(format!("{} has no module", app.job_name))
        })?;
        self.artifacts.upload(&base.join(module), target).await
    }

    async fn stage_sql(&self, app: &Application, target: &str) -> ControlResult<usize> {
        let local_home = self.workspace.local.join(app.id.as_str());
        if tokio::fs::try_exists(&local_home).await? {
            tokio::fs::remove_dir_all(&local_home).await?;
        }
        let lib = local_home.join("lib");
        tokio::fs::create_dir_all(&lib).await?;

        let dependency = &app.dependency;
        if !dependency.pom.is_empty() {
            let jars = self.resolve(&app.id, dependency.pom.as_slice()).await?;
            for jar in jars {
                let name = jar.file_name().ok_or_else(|| {
                    ControlError::resolution(format!("{} is not a file", jar.display()))
                })?;
                tokio::fs::copy(&jar, lib.join(name)).await?;
            }
        }

        let mut staged = self.artifacts.upload(&local_home, target).await?;
        for jar in &dependency.jar {
            let copied = self
                .artifacts
                .copy(
                    &format!("{}/{jar}", self.workspace.uploads),
                    &format!("{target}/lib/{jar}"),
                )
                .await?;
            if copied == 0 {
                return Err(ControlError::artifact(format!(
                    "uploaded jar {jar} not found in {}",
                    self.workspace.uploads
                )));
            }
            staged += copied;
        }
        Ok(staged)
    }

    async fn resolve(
        &self,
        app_id: &ApplicationId,
        coordinates: &[Coordinate],
    ) -> ControlResult<Vec<PathBuf>> {
        let result = self
            .resolver
            .resolve(coordinates, |line| self.log.emit(app_id, line))
            .await;
        self.log.finish(app_id);
        result
    }
}

impl JobOrchestrator {
    /// Stage an application's artifacts and settle its markers.
    ///
    /// Errors are only returned before anything changes (unknown application,
    /// an operation in flight, an illegal transition, a rejected stop). Once
    /// work has begun, failures are logged and reported as
    /// [`DeployOutcome::PartialFailure`].
    pub async fn deploy(
        &self,
        app_id: &ApplicationId,
        request: DeployRequest,
    ) -> ControlResult<DeployOutcome> {
        let _guard = self.lock(app_id).await;
        let outcome = self.deploy_locked(app_id, request).await;
        // A tail lasts for one deploy, whether or not it resolved anything.
        self.resolution_log.finish(app_id);
        outcome
    }

    async fn deploy_locked(
        &self,
        app_id: &ApplicationId,
        request: DeployRequest,
    ) -> ControlResult<DeployOutcome> {
        let mut app = self.application(app_id).await?;
        Self::ensure_idle(&app)?;

        let was_running = app.is_running();
        info!(
            app_id = %app_id,
            restart = request.restart,
            backup = request.backup,
            running = was_running,
            "deploying application"
        );

        // State to restore if staging fails; `None` while the old run keeps going.
        let rollback = if request.restart && was_running {
            let handle = self
                .cancel_locked(&app, CancelRequest::default())
                .await?;
            match handle.join().await {
                Ok(CancelOutcome::Stopped { .. }) => {}
                Ok(CancelOutcome::StopFailed { reason }) => {
                    return Ok(self.fail_deploy(app_id, None, DeployStage::Cancel, reason).await);
                }
                Err(e) => {
                    return Ok(self
                        .fail_deploy(app_id, None, DeployStage::Cancel, e.to_string())
                        .await);
                }
            }
            app = self.application(app_id).await?;
            Some(app.state)
        } else if was_running {
            None
        } else {
            app.state.ensure_transition(AppState::Deploying)?;
            let previous = app.state;
            let patch = ApplicationPatch::new()
                .with_state(AppState::Deploying)
                .with_option_state(OptionState::Deploying);
            app = self.store.update_application(app_id, patch).await?;
            Some(previous)
        };

        if request.backup {
            if let Err(e) = self
                .backup
                .backup(&app, request.backup_description.as_deref())
                .await
            {
                return Ok(self
                    .fail_deploy(app_id, rollback, DeployStage::Backup, e.to_string())
                    .await);
            }
        }

        if let Err(e) = self.stage(&mut app).await {
            let rollback = self.stage_rollback(app_id, rollback).await;
            return Ok(self
                .fail_deploy(app_id, rollback, DeployStage::Stage, e.to_string())
                .await);
        }

        let outcome = if request.restart {
            if !was_running {
                let patch = ApplicationPatch::new()
                    .with_state(AppState::Deployed)
                    .with_option_state(OptionState::None);
                self.store.update_application(app_id, patch).await?;
            }
            let started = self.start_locked(app_id, &StartRequest::default()).await;
            self.store
                .update_application(app_id, ApplicationPatch::new().with_deploy(DeployMarker::None))
                .await?;
            match started {
                Ok(StartOutcome::Submitted { cluster_app_id }) => {
                    DeployOutcome::Restarted { cluster_app_id }
                }
                Ok(StartOutcome::Failed { reason }) => DeployOutcome::PartialFailure {
                    stage: DeployStage::Start,
                    reason,
                },
                Err(e) => {
                    error!(app_id = %app_id, error = %e, "restart after deploy failed");
                    DeployOutcome::PartialFailure {
                        stage: DeployStage::Start,
                        reason: e.to_string(),
                    }
                }
            }
        } else if was_running {
            self.store
                .update_application(
                    app_id,
                    ApplicationPatch::new().with_deploy(DeployMarker::NeedRestartAfterDeploy),
                )
                .await?;
            DeployOutcome::StagedPendingRestart
        } else {
            let patch = ApplicationPatch::new()
                .with_state(AppState::Deployed)
                .with_option_state(OptionState::None)
                .with_deploy(DeployMarker::None);
            self.store.update_application(app_id, patch).await?;
            self.versions.promote(app_id).await?;
            DeployOutcome::Deployed
        };

        info!(app_id = %app_id, outcome = ?outcome, "deploy finished");
        self.invalidate(
            app_id,
            &[CacheView::Application, CacheView::ApplicationList, CacheView::Dashboard],
        );
        Ok(outcome)
    }

    /// Record the dependency set being staged and stage it on the pool.
    async fn stage(&self, app: &mut Application) -> ControlResult<usize> {
        if app.is_sql_job() {
            let version = match self.versions.latest(&app.id, DefinitionKind::Sql).await? {
                Some(latest) => Some(latest),
                None => self.versions.effective(&app.id, DefinitionKind::Sql).await?,
            };
            let sql = version
                .as_ref()
                .and_then(|v| v.as_sql())
                .ok_or_else(|| {
                    ControlError::configuration(format!("{} has no sql version", app.job_name))
                })?;
            let patch = ApplicationPatch {
                dependency: Some(sql.dependency.clone()),
                ..ApplicationPatch::new()
            };
            *app = self.store.update_application(&app.id, patch).await?;
        }

        let task = self.stager.clone().stage(app.clone());
        self.pool
            .submit(format!("stage {}", app.id), task)?
            .join()
            .await
    }

    /// Fall back to `Created` when a failed stage left no bundle to start from.
    async fn stage_rollback(
        &self,
        app_id: &ApplicationId,
        rollback: Option<AppState>,
    ) -> Option<AppState> {
        let state = rollback?;
        if state == AppState::Created {
            return Some(state);
        }
        match self.stager.is_staged(app_id).await {
            Ok(true) => Some(state),
            Ok(false) => {
                warn!(app_id = %app_id, "no bundle left after failed stage");
                Some(AppState::Created)
            }
            Err(e) => {
                warn!(app_id = %app_id, error = %e, "could not check bundle after failed stage");
                Some(AppState::Created)
            }
        }
    }

    async fn fail_deploy(
        &self,
        app_id: &ApplicationId,
        rollback: Option<AppState>,
        stage: DeployStage,
        reason: String,
    ) -> DeployOutcome {
        error!(app_id = %app_id, stage = ?stage, error = %reason, "deploy failed");
        if let Some(state) = rollback {
            let patch = ApplicationPatch::new()
                .with_state(state)
                .with_option_state(OptionState::None);
            if let Err(e) = self.store.update_application(app_id, patch).await {
                warn!(app_id = %app_id, error = %e, "failed to restore state after deploy failure");
            }
        }
        self.invalidate(
            app_id,
            &[CacheView::Application, CacheView::ApplicationList, CacheView::Dashboard],
        );
        DeployOutcome::PartialFailure { stage, reason }
    }
}
