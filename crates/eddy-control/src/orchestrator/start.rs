//! Submitting jobs to the cluster.

use tracing::{debug, error, info, warn};

use crate::error::ControlResult;
use crate::hooks::CacheView;
use crate::state::{AppState, OptionState};
use crate::submitter::{
    find_runner_jar, launch_spec, manifest_main_class, profiling_options, SubmitRequest,
};
use crate::tracking::TrackedJob;
use crate::types::{
    Application, ApplicationId, ApplicationLog, ApplicationPatch, ApplicationType, DefinitionKind,
};

use super::JobOrchestrator;

/// Options for a start.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Resume from a savepoint: `savepoint` if given, else the latest recorded one.
    pub savepointed: bool,
    /// Explicit savepoint path.
    pub savepoint: Option<String>,
    /// Skip state that cannot be mapped to the new job graph.
    pub allow_non_restored: bool,
    /// Attach the profiling reporter.
    pub flame_graph: bool,
}

/// How a submission ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The cluster accepted the job.
    Submitted {
        /// Cluster-assigned application handle.
        cluster_app_id: String,
    },
    /// The cluster rejected the job; the application is now failed.
    Failed {
        /// Failure detail.
        reason: String,
    },
}

impl JobOrchestrator {
    /// Promote the latest definitions and submit the job.
    ///
    /// Missing or ambiguous launch inputs are returned as errors before
    /// anything is submitted. A rejected submission is recorded in the log,
    /// fails the application and is returned as [`StartOutcome::Failed`].
    pub async fn start(
        &self,
        app_id: &ApplicationId,
        request: StartRequest,
    ) -> ControlResult<StartOutcome> {
        let _guard = self.lock(app_id).await;
        let app = self.application(app_id).await?;
        Self::ensure_idle(&app)?;
        self.start_locked(app_id, &request).await
    }

    pub(super) async fn start_locked(
        &self,
        app_id: &ApplicationId,
        request: &StartRequest,
    ) -> ControlResult<StartOutcome> {
        let app = self.application(app_id).await?;
        app.state.ensure_transition(AppState::Starting)?;

        self.versions.promote(app_id).await?;
        let submit = self.submit_request(&app, request).await?;

        self.store
            .update_application(app_id, ApplicationPatch::new().with_state(AppState::Starting))
            .await?;
        info!(
            app_id = %app_id,
            job_name = %submit.job_name,
            execution_mode = %submit.execution_mode,
            savepoint = ?submit.savepoint,
            "submitting job"
        );

        let mut log = ApplicationLog::begin(app_id.clone());
        let outcome = match self.submitter.submit(&submit).await {
            Ok(response) => {
                let patch = ApplicationPatch {
                    cluster_app_id: Some(Some(response.cluster_app_id.clone())),
                    jm_memory_mib: response.jobmanager_mib().map(Some),
                    tm_memory_mib: response.taskmanager_mib().map(Some),
                    flame_graph: Some(request.flame_graph),
                    end_time: Some(None),
                    ..ApplicationPatch::new()
                }
                .with_option_state(OptionState::Starting);
                let app = self.store.update_application(app_id, patch).await?;
                self.tracking.register(TrackedJob::from_application(&app));

                log.cluster_app_id = Some(response.cluster_app_id.clone());
                log.success = true;
                self.store.insert_log(&log).await?;
                self.store.obsolete_savepoints(app_id).await?;

                info!(app_id = %app_id, cluster_app_id = %response.cluster_app_id, "job submitted");
                StartOutcome::Submitted {
                    cluster_app_id: response.cluster_app_id,
                }
            }
            Err(e) => {
                error!(app_id = %app_id, error = %e, "submission failed");
                log.exception = Some(e.to_string());
                self.store.insert_log(&log).await?;

                let patch = ApplicationPatch::new()
                    .with_state(AppState::Failed)
                    .with_option_state(OptionState::None);
                self.store.update_application(app_id, patch).await?;
                self.tracking.deregister(app_id);

                StartOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        self.invalidate(
            app_id,
            &[CacheView::Application, CacheView::ApplicationList, CacheView::Dashboard],
        );
        Ok(outcome)
    }

    async fn submit_request(
        &self,
        app: &Application,
        request: &StartRequest,
    ) -> ControlResult<SubmitRequest> {
        let workspace = &self.config.workspace;
        let config = self
            .versions
            .effective(&app.id, DefinitionKind::Config)
            .await?
            .and_then(|v| v.as_config().cloned());

        let (sql, runner) = if app.is_sql_job() {
            let sql = self
                .versions
                .effective(&app.id, DefinitionKind::Sql)
                .await?
                .and_then(|v| v.as_sql().cloned());
            let runner =
                find_runner_jar(&workspace.local_plugins, &workspace.sql_runner_pattern).await?;
            (sql, Some(runner))
        } else {
            (None, None)
        };
        let discovered;
        let app = if !app.is_sql_job()
            && app.application_type == ApplicationType::Native
            && app.main_class.is_none()
        {
            let mut with_main = app.clone();
            with_main.main_class = manifest_main_class(app).await?;
            if let Some(main) = &with_main.main_class {
                debug!(app_id = %app.id, main_class = %main, "main class read from jar manifest");
            }
            discovered = with_main;
            &discovered
        } else {
            app
        };
        let spec = launch_spec(app, config.as_ref(), sql.as_ref(), runner.as_deref(), workspace)?;

        let savepoint = match (&request.savepoint, request.savepointed) {
            (Some(path), _) => Some(path.clone()),
            (None, true) => self.store.latest_savepoint(&app.id).await?.map(|s| s.path),
            (None, false) => None,
        };

        let profiling = match (request.flame_graph, self.config.profiling.enabled) {
            (true, true) => Some(profiling_options(app, &self.config.profiling)),
            (true, false) => {
                warn!(app_id = %app.id, "profiling requested but disabled, starting without it");
                None
            }
            (false, _) => None,
        };

        let dynamic_options = app
            .dynamic_options
            .as_deref()
            .map(|options| options.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();

        Ok(SubmitRequest {
            spec,
            job_name: app.job_name.clone(),
            execution_mode: app.execution_mode,
            application_type: app.application_type,
            resolve_order: app.resolve_order,
            savepoint,
            allow_non_restored: request.allow_non_restored,
            options: app.options.clone(),
            dynamic_options,
            args: app.args.clone(),
            profiling,
        })
    }
}
