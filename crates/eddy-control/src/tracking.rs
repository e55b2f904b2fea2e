//! Live view of jobs believed to be running in the cluster.
//!
//! Entries exist from a successful submission (or a manual mapping) until the
//! job is stopped or fails. A monitor feeds runtime metrics in through
//! [`TrackingRegistry::update`]; readers aggregate with
//! [`TrackingRegistry::dashboard`] or overlay entries onto stored rows.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::state::AppState;
use crate::types::{Application, ApplicationId};

/// Task counts reported by the cluster for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskOverview {
    /// All tasks.
    pub total: u32,
    /// Tasks being scheduled or deployed.
    pub pending: u32,
    /// Running tasks.
    pub running: u32,
    /// Finished tasks.
    pub finished: u32,
    /// Canceled tasks.
    pub canceled: u32,
    /// Failed tasks.
    pub failed: u32,
}

impl TaskOverview {
    fn accumulate(&mut self, other: &Self) {
        self.total += other.total;
        self.pending += other.pending;
        self.running += other.running;
        self.finished += other.finished;
        self.canceled += other.canceled;
        self.failed += other.failed;
    }
}

/// Transient runtime view of a tracked job.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedJob {
    /// Application identifier.
    pub app_id: ApplicationId,
    /// Job name.
    pub job_name: String,
    /// Last observed lifecycle state.
    pub state: AppState,
    /// Cluster application handle.
    pub cluster_app_id: Option<String>,
    /// Cluster job id.
    pub cluster_job_id: Option<String>,
    /// Job manager memory in MiB.
    pub jm_memory_mib: Option<u32>,
    /// Task manager memory in MiB.
    pub tm_memory_mib: Option<u32>,
    /// Number of task managers.
    pub total_tm: u32,
    /// Total task slots.
    pub total_slot: u32,
    /// Free task slots.
    pub available_slot: u32,
    /// Task counts.
    pub overview: TaskOverview,
    /// When tracking began.
    pub tracked_since: DateTime<Utc>,
}

impl TrackedJob {
    /// Start tracking an application as currently stored.
    #[must_use]
    pub fn from_application(app: &Application) -> Self {
        Self {
            app_id: app.id.clone(),
            job_name: app.job_name.clone(),
            state: app.state,
            cluster_app_id: app.cluster_app_id.clone(),
            cluster_job_id: app.cluster_job_id.clone(),
            jm_memory_mib: app.jm_memory_mib,
            tm_memory_mib: app.tm_memory_mib,
            total_tm: 0,
            total_slot: 0,
            available_slot: 0,
            overview: TaskOverview::default(),
            tracked_since: Utc::now(),
        }
    }
}

/// Aggregate over all tracked jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Dashboard {
    /// Tracked jobs in a running state.
    pub running_jobs: u32,
    /// Task managers across tracked jobs.
    pub total_tm: u32,
    /// Task slots across tracked jobs.
    pub total_slot: u32,
    /// Free task slots across tracked jobs.
    pub available_slot: u32,
    /// Job manager memory in MiB.
    pub jm_memory_mib: u64,
    /// Task manager memory in MiB.
    pub tm_memory_mib: u64,
    /// Summed task counts.
    pub overview: TaskOverview,
}

/// A stored application with its live view, if tracked.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationView {
    /// Stored row, with live fields overlaid.
    pub application: Application,
    /// Live view.
    pub live: Option<TrackedJob>,
}

/// Concurrent registry of tracked jobs keyed by application.
#[derive(Debug, Default)]
pub struct TrackingRegistry {
    jobs: DashMap<ApplicationId, TrackedJob>,
}

impl TrackingRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking a job, replacing any existing entry.
    pub fn register(&self, job: TrackedJob) {
        debug!(app_id = %job.app_id, "tracking job");
        self.jobs.insert(job.app_id.clone(), job);
    }

    /// Stop tracking a job.
    pub fn deregister(&self, app_id: &ApplicationId) -> Option<TrackedJob> {
        let removed = self.jobs.remove(app_id).map(|(_, job)| job);
        if removed.is_some() {
            debug!(app_id = %app_id, "stopped tracking job");
        }
        removed
    }

    /// Whether a job is tracked.
    #[must_use]
    pub fn contains(&self, app_id: &ApplicationId) -> bool {
        self.jobs.contains_key(app_id)
    }

    /// Copy of a tracked job.
    #[must_use]
    pub fn get(&self, app_id: &ApplicationId) -> Option<TrackedJob> {
        self.jobs.get(app_id).map(|job| job.clone())
    }

    /// Apply a monitor observation; returns `false` if the job is not tracked.
    pub fn update(&self, app_id: &ApplicationId, f: impl FnOnce(&mut TrackedJob)) -> bool {
        match self.jobs.get_mut(app_id) {
            Some(mut job) => {
                f(&mut job);
                true
            }
            None => false,
        }
    }

    /// Number of tracked jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Aggregate over the live entries.
    #[must_use]
    pub fn dashboard(&self) -> Dashboard {
        let mut dashboard = Dashboard::default();
        for job in self.jobs.iter() {
            if job.state == AppState::Running {
                dashboard.running_jobs += 1;
            }
            dashboard.total_tm += job.total_tm;
            dashboard.total_slot += job.total_slot;
            dashboard.available_slot += job.available_slot;
            dashboard.jm_memory_mib += u64::from(job.jm_memory_mib.unwrap_or(0));
            dashboard.tm_memory_mib +=
                u64::from(job.tm_memory_mib.unwrap_or(0)) * u64::from(job.total_tm);
            dashboard.overview.accumulate(&job.overview);
        }
        dashboard
    }

    /// Overlay live state onto stored rows.
    #[must_use]
    pub fn overlay(&self, applications: Vec<Application>) -> Vec<ApplicationView> {
        applications
            .into_iter()
            .map(|mut application| {
                let live = self.get(&application.id);
                if let Some(job) = &live {
                    application.job_name.clone_from(&job.job_name);
                    application.state = job.state;
                    if job.cluster_job_id.is_some() {
                        application.cluster_job_id.clone_from(&job.cluster_job_id);
                    }
                    application.jm_memory_mib = job.jm_memory_mib.or(application.jm_memory_mib);
                    application.tm_memory_mib = job.tm_memory_mib.or(application.tm_memory_mib);
                }
                ApplicationView { application, live }
            })
            .collect()
    }
}
