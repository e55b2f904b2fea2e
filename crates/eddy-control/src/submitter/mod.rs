//! Cluster submission collaborator.
//!
//! The orchestrator describes *what* to run with a [`SubmitRequest`]; a
//! [`Submitter`] implementation knows how to get it onto the cluster.

mod client;
mod launch;
mod manifest;

pub use client::GatewaySubmitter;
pub use launch::{find_runner_jar, launch_spec, profiling_options};
pub use manifest::{manifest_main_class, read_main_class};

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ControlResult;
use crate::types::{ApplicationId, ApplicationType, ExecutionMode, ResolveOrder};

/// Reported key for job manager process memory.
pub const JOBMANAGER_MEMORY_KEY: &str = "jobmanager.memory.process.size";
/// Reported key for task manager process memory.
pub const TASKMANAGER_MEMORY_KEY: &str = "taskmanager.memory.process.size";

/// Entry point and classpath layout for one launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchSpec {
    /// Custom code run by the cluster in application mode from the staged bundle.
    ClusterApplication {
        /// Jar key in the artifact store.
        jar: String,
        /// Encoded configuration (`yaml://`, `prop://` or `json://`).
        config: String,
    },
    /// Custom code submitted from this host.
    ClientSubmitted {
        /// Local jar path.
        jar: PathBuf,
        /// Encoded configuration.
        config: String,
    },
    /// SQL executed by the shared runner jar.
    Sql {
        /// Runner jar; an artifact store key in application mode, a local path otherwise.
        jar: String,
        /// Encoded configuration, when the application has one.
        config: Option<String>,
        /// SQL text.
        sql: String,
        /// Owning application.
        application_id: ApplicationId,
    },
}

/// Everything the cluster needs to start a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Launch layout.
    pub spec: LaunchSpec,
    /// Job name.
    pub job_name: String,
    /// Deployment topology.
    pub execution_mode: ExecutionMode,
    /// Custom-code flavour.
    pub application_type: ApplicationType,
    /// Class loading order.
    pub resolve_order: ResolveOrder,
    /// Savepoint to resume from.
    pub savepoint: Option<String>,
    /// Skip state that cannot be mapped to the new job graph (`-n`).
    pub allow_non_restored: bool,
    /// Typed submission options.
    pub options: BTreeMap<String, serde_json::Value>,
    /// `-Dkey=value` style options.
    pub dynamic_options: Vec<String>,
    /// Program arguments.
    pub args: Option<String>,
    /// Profiling reporter settings.
    pub profiling: Option<BTreeMap<String, serde_json::Value>>,
}

/// What the cluster reported back after a submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Cluster-assigned application handle.
    pub cluster_app_id: String,
    /// Effective settings reported by the cluster.
    #[serde(default)]
    pub reported: BTreeMap<String, String>,
}

impl SubmitResponse {
    /// Job manager memory in MiB, if reported.
    #[must_use]
    pub fn jobmanager_mib(&self) -> Option<u32> {
        self.reported
            .get(JOBMANAGER_MEMORY_KEY)
            .and_then(|v| parse_memory_mib(v))
    }

    /// Task manager memory in MiB, if reported.
    #[must_use]
    pub fn taskmanager_mib(&self) -> Option<u32> {
        self.reported
            .get(TASKMANAGER_MEMORY_KEY)
            .and_then(|v| parse_memory_mib(v))
    }
}

/// A request to stop a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    /// Deployment topology.
    pub execution_mode: ExecutionMode,
    /// Cluster application handle.
    pub cluster_app_id: String,
    /// Cluster job id, if known.
    pub cluster_job_id: Option<String>,
    /// Capture a savepoint before stopping.
    pub with_savepoint: bool,
    /// Drain in-flight records before stopping.
    pub drain: bool,
}

/// Talks to the cluster.
#[async_trait]
pub trait Submitter: Send + Sync {
    /// Submit a job.
    async fn submit(&self, request: &SubmitRequest) -> ControlResult<SubmitResponse>;

    /// Stop a job; returns the savepoint path when one was captured.
    async fn stop(&self, request: &StopRequest) -> ControlResult<Option<String>>;

    /// Whether a job with this name is already known to the cluster.
    async fn job_name_in_use(&self, job_name: &str) -> ControlResult<bool>;
}

/// Parse a memory size like `1728m`, `2 gb` or `1073741824` into MiB.
///
/// Values without a unit are bytes.
#[must_use]
pub fn parse_memory_mib(value: &str) -> Option<u32> {
    let value = value.trim().to_ascii_lowercase();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number.parse().ok()?;
    let bytes = match unit.trim() {
        "" | "b" | "bytes" => number,
        "k" | "kb" | "kibibytes" => number.checked_mul(1 << 10)?,
        "m" | "mb" | "mebibytes" => number.checked_mul(1 << 20)?,
        "g" | "gb" | "gibibytes" => number.checked_mul(1 << 30)?,
        "t" | "tb" | "tebibytes" => number.checked_mul(1 << 40)?,
        _ => return None,
    };
    u32::try_from(bytes >> 20).ok()
}
