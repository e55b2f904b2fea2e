//! Stopping running jobs on the worker pool.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::hooks::{CacheView, InvalidationHook};
use crate::pool::TaskHandle;
use crate::state::{AppState, OptionState};
use crate::store::JobStore;
use crate::submitter::{StopRequest, Submitter};
use crate::tracking::TrackingRegistry;
use crate::types::{Application, ApplicationId, ApplicationPatch, SavePoint};

use super::JobOrchestrator;

/// Options for a cancel.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancelRequest {
    /// Capture a savepoint before stopping.
    pub savepointed: bool,
    /// Drain in-flight records before stopping.
    pub drain: bool,
}

/// How a background stop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job stopped.
    Stopped {
        /// Savepoint captured on the way down.
        savepoint: Option<String>,
    },
    /// The stop call failed; the job is assumed to be where the cancel found it.
    StopFailed {
        /// Failure detail.
        reason: String,
    },
}

struct StopTask {
    app_id: ApplicationId,
    // Lifecycle state before the cancel, restored when the stop does not land.
    prior: AppState,
    request: StopRequest,
    store: Arc<dyn JobStore>,
    submitter: Arc<dyn Submitter>,
    tracking: Arc<TrackingRegistry>,
    invalidation: Arc<dyn InvalidationHook>,
}

impl StopTask {
    async fn run(self, token: CancellationToken) -> ControlResult<CancelOutcome> {
        let stop = tokio::select! {
            biased;
            () = token.cancelled() => None,
            result = self.submitter.stop(&self.request) => Some(result),
        };

        let outcome = match stop {
            Some(Ok(savepoint)) => self.stopped(savepoint).await,
            Some(Err(e)) => self.failed(&e).await,
            None => {
                warn!(app_id = %self.app_id, "stop abandoned");
                Err(ControlError::TaskCancelled)
            }
        };
        if outcome.is_err() {
            self.release().await;
        }

        self.invalidation.invalidate(
            &self.app_id,
            &[CacheView::Application, CacheView::ApplicationList, CacheView::Dashboard],
        );
        outcome
    }

    async fn stopped(&self, savepoint: Option<String>) -> ControlResult<CancelOutcome> {
        let app_id = &self.app_id;
        if let (true, Some(path)) = (self.request.with_savepoint, &savepoint) {
            self.store.obsolete_savepoints(app_id).await?;
            self.store
                .insert_savepoint(&SavePoint::latest(app_id.clone(), path.clone()))
                .await?;
            info!(app_id = %app_id, savepoint = %path, "savepoint recorded");
        }

        let patch = ApplicationPatch {
            end_time: Some(Some(Utc::now())),
            ..ApplicationPatch::new()
        }
        .with_state(AppState::Canceled)
        .with_option_state(OptionState::None);
        self.store.update_application(app_id, patch).await?;
        self.tracking.deregister(app_id);

        info!(app_id = %app_id, "job stopped");
        Ok(CancelOutcome::Stopped { savepoint })
    }

    async fn failed(&self, error: &ControlError) -> ControlResult<CancelOutcome> {
        let app_id = &self.app_id;
        warn!(
            app_id = %app_id,
            savepoint = self.request.with_savepoint,
            error = %error,
            "stop failed"
        );
        if self.request.with_savepoint {
            self.store.obsolete_savepoints(app_id).await?;
        }

        let patch = ApplicationPatch::new()
            .with_state(self.prior)
            .with_option_state(OptionState::None);
        self.store.update_application(app_id, patch).await?;
        let prior = self.prior;
        self.tracking.update(app_id, |job| job.state = prior);

        Ok(CancelOutcome::StopFailed {
            reason: error.to_string(),
        })
    }

    /// Put the application back the way the cancel found it when the stop
    /// was abandoned or its bookkeeping failed.
    ///
    /// Whether a savepoint was captured is unknown, so existing ones are
    /// obsoleted.
    async fn release(&self) {
        let app_id = &self.app_id;
        if self.request.with_savepoint {
            if let Err(e) = self.store.obsolete_savepoints(app_id).await {
                warn!(app_id = %app_id, error = %e, "failed to obsolete savepoints");
            }
        }

        let patch = ApplicationPatch::new()
            .with_state(self.prior)
            .with_option_state(OptionState::None);
        if let Err(e) = self.store.update_application(app_id, patch).await {
            error!(app_id = %app_id, error = %e, "failed to release cancel markers");
            return;
        }
        let prior = self.prior;
        self.tracking.update(app_id, |job| job.state = prior);
        info!(app_id = %app_id, state = %prior, "cancel markers released");
    }
}

impl JobOrchestrator {
    /// Mark a running job as cancelling and stop it on the worker pool.
    ///
    /// Returns once the stop is queued. The handle yields the outcome; a
    /// failed stop is an outcome, not an error. A full pool is reported as a
    /// retryable error and leaves the job untouched.
    pub async fn cancel(
        &self,
        app_id: &ApplicationId,
        request: CancelRequest,
    ) -> ControlResult<TaskHandle<CancelOutcome>> {
        let _guard = self.lock(app_id).await;
        let app = self.application(app_id).await?;
        Self::ensure_idle(&app)?;
        self.cancel_locked(&app, request).await
    }

    pub(super) async fn cancel_locked(
        &self,
        app: &Application,
        request: CancelRequest,
    ) -> ControlResult<TaskHandle<CancelOutcome>> {
        app.state.ensure_transition(AppState::Cancelling)?;
        let cluster_app_id = app.cluster_app_id.clone().ok_or_else(|| {
            ControlError::configuration(format!("{} has no cluster application id", app.job_name))
        })?;

        let marker = if request.savepointed {
            OptionState::Savepointing
        } else {
            OptionState::Cancelling
        };
        let patch = ApplicationPatch::new()
            .with_state(AppState::Cancelling)
            .with_option_state(marker);
        self.store.update_application(&app.id, patch).await?;
        self.tracking
            .update(&app.id, |job| job.state = AppState::Cancelling);

        let task = StopTask {
            app_id: app.id.clone(),
            prior: app.state,
            request: StopRequest {
                execution_mode: app.execution_mode,
                cluster_app_id,
                cluster_job_id: app.cluster_job_id.clone(),
                with_savepoint: request.savepointed,
                drain: request.drain,
            },
            store: Arc::clone(&self.store),
            submitter: Arc::clone(&self.submitter),
            tracking: Arc::clone(&self.tracking),
            invalidation: Arc::clone(&self.invalidation),
        };

        match self
            .pool
            .submit_with(format!("stop {}", app.id), |token| task.run(token))
        {
            Ok(handle) => {
                info!(
                    app_id = %app.id,
                    savepoint = request.savepointed,
                    drain = request.drain,
                    "stop queued"
                );
                self.invalidate(&app.id, &[CacheView::Application, CacheView::ApplicationList]);
                Ok(handle)
            }
            Err(e) => {
                warn!(app_id = %app.id, error = %e, "stop rejected");
                let patch = ApplicationPatch::new()
                    .with_state(app.state)
                    .with_option_state(app.option_state);
                self.store.update_application(&app.id, patch).await?;
                self.tracking.update(&app.id, |job| job.state = app.state);
                Err(e)
            }
        }
    }
}
