//! Service lifecycle management.
//!
//! Wires the orchestrator to its collaborators, clears markers left by a
//! previous process and drains the worker pool on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::artifact::{ArtifactStore, ObjectArtifactStore, StoreBackup};
use crate::config::ControlConfig;
use crate::dependency::MavenRepository;
use crate::error::ControlResult;
use crate::hooks::{LogNotifier, NoopInvalidation};
use crate::orchestrator::{Collaborators, JobOrchestrator};
use crate::store::{JobStore, MemoryStore};
use crate::submitter::GatewaySubmitter;

/// The control service.
pub struct ControlService {
    config: ControlConfig,
    cancel: CancellationToken,
}

impl ControlService {
    /// Create a new control service with the given configuration.
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Build the orchestrator over `store`.
    ///
    /// In-flight operations cannot survive a restart, so every application's
    /// marker is reset and any half-finished deploy or cancel is settled first.
    pub async fn initialise(&self, store: Arc<dyn JobStore>) -> ControlResult<Arc<JobOrchestrator>> {
        let reset = store.reset_option_states().await?;
        if reset > 0 {
            warn!(applications = reset, "settled operations left in flight by a previous run");
        }

        let artifacts: Arc<dyn ArtifactStore> =
            Arc::new(ObjectArtifactStore::new(&self.config.artifacts)?);
        info!(url = %self.config.artifacts.store_url, "artifact store configured");

        let submitter = GatewaySubmitter::new(&self.config.submitter)?;
        info!(url = %self.config.submitter.url, "submission gateway configured");

        let source = MavenRepository::new(&self.config.resolver)?;
        info!(
            repositories = ?self.config.resolver.repositories,
            local = %self.config.resolver.local_repository.display(),
            "maven repositories configured"
        );

        let collaborators = Collaborators {
            store,
            backup: Arc::new(StoreBackup::new(
                Arc::clone(&artifacts),
                self.config.workspace.remote.clone(),
                self.config.workspace.backups.clone(),
            )),
            artifacts,
            submitter: Arc::new(submitter),
            source: Arc::new(source),
            notifier: Arc::new(LogNotifier),
            invalidation: Arc::new(NoopInvalidation),
        };
        Ok(Arc::new(JobOrchestrator::new(self.config.clone(), collaborators)))
    }

    /// Run until a shutdown signal, then drain background work.
    pub async fn run(&self) -> ControlResult<()> {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        let orchestrator = self.initialise(store).await?;
        info!(
            min_workers = self.config.pool.min_workers,
            max_workers = self.config.pool.max_workers,
            queue_capacity = self.config.pool.queue_capacity,
            "control service ready"
        );

        shutdown_signal(self.cancel.clone()).await;

        orchestrator
            .shutdown(Duration::from_secs(self.config.pool.shutdown_grace_secs))
            .await;
        info!("control service shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::ArtifactConfig;
    use crate::state::{AppState, OptionState};
    use crate::types::{Application, ApplicationPatch, ExecutionMode, JobType};

    fn memory_config() -> ControlConfig {
        ControlConfig {
            artifacts: ArtifactConfig {
                store_url: "memory://".to_owned(),
            },
            ..ControlConfig::default()
        }
    }

    #[test]
    fn service_shutdown() {
        let service = ControlService::new(ControlConfig::default());
        assert!(!service.cancel.is_cancelled());
        service.shutdown();
        assert!(service.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn initialise_settles_in_flight_operations() {
        let store = Arc::new(MemoryStore::new());
        let app = Application::new("orders", JobType::Sql, ExecutionMode::Application);
        store.insert_application(&app).await.unwrap();
        store
            .update_application(
                &app.id,
                ApplicationPatch::new()
                    .with_state(AppState::Cancelling)
                    .with_option_state(OptionState::Savepointing),
            )
            .await
            .unwrap();

        let service = ControlService::new(memory_config());
        let orchestrator = service.initialise(store.clone()).await.unwrap();

        let app = store.get_application(&app.id).await.unwrap().unwrap();
        assert_eq!(app.option_state, OptionState::None);
        assert_eq!(app.state, AppState::Running);
        assert!(orchestrator.tracking().is_empty());
    }

    #[tokio::test]
    async fn run_returns_after_shutdown_request() {
        let service = Arc::new(ControlService::new(memory_config()));
        let runner = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.run().await })
        };
        service.shutdown();
        assert!(runner.await.unwrap().is_ok());
    }
}
