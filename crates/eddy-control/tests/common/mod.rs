//! Common test utilities for orchestrator integration tests.

#![allow(dead_code, clippy::unwrap_used)]

pub mod fixtures;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use eddy_control::artifact::{ArtifactStore, ObjectArtifactStore, StoreBackup};
use eddy_control::config::{PoolConfig, ProfilingConfig, WorkspaceConfig};
use eddy_control::dependency::{ArtifactSource, Coordinate, ResolvedArtifact};
use eddy_control::hooks::{CacheView, InvalidationHook, Notifier};
use eddy_control::submitter::{
    StopRequest, SubmitRequest, SubmitResponse, Submitter, JOBMANAGER_MEMORY_KEY,
    TASKMANAGER_MEMORY_KEY,
};
use eddy_control::types::{Application, ApplicationId};
use eddy_control::{
    Collaborators, ControlConfig, ControlError, ControlResult, DeployOutcome, DeployRequest,
    JobOrchestrator, JobStore, MemoryStore, StartOutcome, StartRequest,
};
use tempfile::TempDir;
use tokio::sync::Notify;

/// Submitter that records calls and answers from scripted results.
#[derive(Default)]
pub struct FakeSubmitter {
    pub submits: Mutex<Vec<SubmitRequest>>,
    pub stops: Mutex<Vec<StopRequest>>,
    pub submit_error: Mutex<Option<String>>,
    pub stop_result: Mutex<Option<Result<Option<String>, String>>>,
    pub stop_gate: Mutex<Option<Arc<Notify>>>,
    pub cluster_jobs: Mutex<HashSet<String>>,
}

impl FakeSubmitter {
    pub fn fail_submissions(&self, reason: &str) {
        *self.submit_error.lock().unwrap() = Some(reason.to_owned());
    }

    pub fn stop_returns(&self, savepoint: Option<&str>) {
        *self.stop_result.lock().unwrap() = Some(Ok(savepoint.map(str::to_owned)));
    }

    pub fn fail_stops(&self, reason: &str) {
        *self.stop_result.lock().unwrap() = Some(Err(reason.to_owned()));
    }

    /// Hold stop calls until the returned gate is notified.
    pub fn hold_stops(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.stop_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn submit_count(&self) -> usize {
        self.submits.lock().unwrap().len()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.lock().unwrap().len()
    }

    pub fn last_submit(&self) -> SubmitRequest {
        self.submits.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Submitter for FakeSubmitter {
    async fn submit(&self, request: &SubmitRequest) -> ControlResult<SubmitResponse> {
        let count = {
            let mut submits = self.submits.lock().unwrap();
            submits.push(request.clone());
            submits.len()
        };
        if let Some(reason) = self.submit_error.lock().unwrap().clone() {
            return Err(ControlError::submission(reason));
        }
        Ok(SubmitResponse {
            cluster_app_id: format!("application_{count}"),
            reported: [
                (JOBMANAGER_MEMORY_KEY.to_owned(), "1600m".to_owned()),
                (TASKMANAGER_MEMORY_KEY.to_owned(), "1728m".to_owned()),
            ]
            .into_iter()
            .collect(),
        })
    }

    async fn stop(&self, request: &StopRequest) -> ControlResult<Option<String>> {
        self.stops.lock().unwrap().push(request.clone());
        let gate = self.stop_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        match self.stop_result.lock().unwrap().clone() {
            Some(Ok(savepoint)) => Ok(savepoint),
            Some(Err(reason)) => Err(ControlError::submission(reason)),
            None => Ok(None),
        }
    }

    async fn job_name_in_use(&self, job_name: &str) -> ControlResult<bool> {
        Ok(self.cluster_jobs.lock().unwrap().contains(job_name))
    }
}

/// Notifier that keeps every published line.
#[derive(Default)]
pub struct RecordingNotifier {
    pub lines: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn lines_for(&self, topic: &str) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, line)| line.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn publish(&self, topic: &str, line: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((topic.to_owned(), line.to_owned()));
    }
}

/// Invalidation hook that keeps every call.
#[derive(Default)]
pub struct RecordingInvalidation {
    pub calls: Mutex<Vec<(ApplicationId, Vec<CacheView>)>>,
}

impl RecordingInvalidation {
    pub fn views_for(&self, app_id: &ApplicationId) -> Vec<CacheView> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == app_id)
            .flat_map(|(_, views)| views.iter().copied())
            .collect()
    }
}

impl InvalidationHook for RecordingInvalidation {
    fn invalidate(&self, app_id: &ApplicationId, views: &[CacheView]) {
        self.calls
            .lock()
            .unwrap()
            .push((app_id.clone(), views.to_vec()));
    }
}

/// Artifact source serving jars written to a temporary directory.
pub struct StaticSource {
    dir: PathBuf,
    artifacts: Mutex<HashMap<String, ResolvedArtifact>>,
    fetches: AtomicUsize,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl StaticSource {
    pub fn new(dir: PathBuf) -> Self {
        std::fs::create_dir_all(&dir).unwrap();
        Self {
            dir,
            artifacts: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }

    /// Hold fetches until the returned gate is notified.
    pub fn hold_fetches(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Serve `coordinate` as a jar with the given direct dependencies.
    pub fn add(&self, coordinate: &str, dependencies: &[&str]) {
        let coordinate: Coordinate = coordinate.parse().unwrap();
        let path = self.dir.join(format!(
            "{}-{}.jar",
            coordinate.artifact_id, coordinate.version
        ));
        std::fs::write(&path, coordinate.to_string()).unwrap();
        let artifact = ResolvedArtifact {
            coordinate: coordinate.clone(),
            path: Some(path),
            dependencies: dependencies.iter().map(|d| d.parse().unwrap()).collect(),
            notes: vec![format!("downloaded {coordinate}")],
        };
        self.artifacts
            .lock()
            .unwrap()
            .insert(coordinate.to_string(), artifact);
    }
}

#[async_trait]
impl ArtifactSource for StaticSource {
    async fn fetch(&self, coordinate: &Coordinate) -> ControlResult<ResolvedArtifact> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.artifacts
            .lock()
            .unwrap()
            .get(&coordinate.to_string())
            .cloned()
            .ok_or_else(|| ControlError::resolution(format!("{coordinate} not found")))
    }
}

/// Orchestrator wired to in-memory and recording collaborators.
pub struct TestControl {
    pub orchestrator: JobOrchestrator,
    pub store: Arc<MemoryStore>,
    pub artifacts: Arc<ObjectArtifactStore>,
    pub submitter: Arc<FakeSubmitter>,
    pub source: Arc<StaticSource>,
    pub notifier: Arc<RecordingNotifier>,
    pub invalidation: Arc<RecordingInvalidation>,
    pub config: ControlConfig,
    pub dir: TempDir,
}

impl TestControl {
    pub fn new() -> Self {
        Self::with_pool(PoolConfig {
            min_workers: 1,
            max_workers: 4,
            queue_capacity: 16,
            keep_alive_secs: 60,
            shutdown_grace_secs: 5,
        })
    }

    pub fn with_pool(pool: PoolConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        std::fs::create_dir_all(&plugins).unwrap();
        std::fs::write(plugins.join("eddy-sqlclient-1.0.jar"), b"runner").unwrap();

        let config = ControlConfig {
            workspace: WorkspaceConfig {
                local: dir.path().join("workspace"),
                local_plugins: plugins,
                ..WorkspaceConfig::default()
            },
            pool,
            profiling: ProfilingConfig {
                enabled: true,
                ..ProfilingConfig::default()
            },
            ..ControlConfig::default()
        };

        let store = Arc::new(MemoryStore::new());
        let artifacts = Arc::new(ObjectArtifactStore::in_memory());
        let submitter = Arc::new(FakeSubmitter::default());
        let source = Arc::new(StaticSource::new(dir.path().join("repository")));
        let notifier = Arc::new(RecordingNotifier::default());
        let invalidation = Arc::new(RecordingInvalidation::default());

        let collaborators = Collaborators {
            store: store.clone(),
            artifacts: artifacts.clone(),
            backup: Arc::new(StoreBackup::new(
                artifacts.clone(),
                config.workspace.remote.clone(),
                config.workspace.backups.clone(),
            )),
            submitter: submitter.clone(),
            source: source.clone(),
            notifier: notifier.clone(),
            invalidation: invalidation.clone(),
        };
        let orchestrator = JobOrchestrator::new(config.clone(), collaborators);

        Self {
            orchestrator,
            store,
            artifacts,
            submitter,
            source,
            notifier,
            invalidation,
            config,
            dir,
        }
    }

    /// A SQL application on `grp:art:1.0`, deployed and idle.
    pub async fn deployed_sql(&self, name: &str) -> Application {
        self.source.add("grp:art:1.0", &[]);
        let app = self
            .orchestrator
            .create(fixtures::sql_app(name, &["grp:art:1.0"]))
            .await
            .unwrap();
        let outcome = self
            .orchestrator
            .deploy(&app.id, DeployRequest::default())
            .await
            .unwrap();
        assert_eq!(outcome, DeployOutcome::Deployed);
        self.application(&app.id).await
    }

    /// A deployed SQL application that has been submitted.
    pub async fn started_sql(&self, name: &str) -> Application {
        let app = self.deployed_sql(name).await;
        let outcome = self
            .orchestrator
            .start(&app.id, StartRequest::default())
            .await
            .unwrap();
        assert!(matches!(outcome, StartOutcome::Submitted { .. }));
        self.application(&app.id).await
    }

    pub async fn application(&self, app_id: &ApplicationId) -> Application {
        self.store.get_application(app_id).await.unwrap().unwrap()
    }

    /// Keys staged for an application.
    pub async fn bundle(&self, app_id: &ApplicationId) -> Vec<String> {
        let mut keys = self
            .artifacts
            .list(&format!("{}/{app_id}", self.config.workspace.remote))
            .await
            .unwrap();
        keys.sort();
        keys
    }
}
