//! Configuration for eddy-control.

use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::dependency::Exclusion;
use crate::error::{ControlError, ControlResult};

/// Top-level configuration for the control service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// Workspace layout.
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Worker pool sizing.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Dependency resolution.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Artifact storage.
    #[serde(default)]
    pub artifacts: ArtifactConfig,

    /// Profiling reporter settings.
    #[serde(default)]
    pub profiling: ProfilingConfig,

    /// Resolution log publishing.
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Submission gateway client.
    #[serde(default)]
    pub submitter: SubmitterConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `control.toml` in the current directory (if present)
    /// 3. Environment variables with `EDDY_CONTROL_` prefix
    pub fn load() -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file("control.toml"))
            .merge(Env::prefixed("EDDY_CONTROL_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("EDDY_CONTROL_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// Where staged bundles, uploads and runner jars live.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceConfig {
    /// Prefix in the artifact store under which each application gets `{prefix}/{id}`.
    #[serde(default = "default_remote_workspace")]
    pub remote: String,

    /// Prefix of jars uploaded ahead of time.
    #[serde(default = "default_uploads")]
    pub uploads: String,

    /// Prefix of runner jars in the artifact store.
    #[serde(default = "default_plugins")]
    pub plugins: String,

    /// Prefix of bundle snapshots taken before a redeploy.
    #[serde(default = "default_backups")]
    pub backups: String,

    /// Prefix where a new bundle is assembled before it replaces the live one.
    #[serde(default = "default_staging")]
    pub staging: String,

    /// Local root where build output and resolved jars are staged.
    #[serde(default = "default_local_workspace")]
    pub local: PathBuf,

    /// Local directory holding the SQL runner jar.
    #[serde(default = "default_local_plugins")]
    pub local_plugins: PathBuf,

    /// Regex the SQL runner jar file name must match.
    #[serde(default = "default_sql_runner_pattern")]
    pub sql_runner_pattern: String,
}

fn default_remote_workspace() -> String {
    "workspace".to_owned()
}

fn default_uploads() -> String {
    "uploads".to_owned()
}

fn default_plugins() -> String {
    "plugins".to_owned()
}

fn default_backups() -> String {
    "backups".to_owned()
}

fn default_staging() -> String {
    "staging".to_owned()
}

fn default_local_workspace() -> PathBuf {
    PathBuf::from("/var/lib/eddy/workspace")
}

fn default_local_plugins() -> PathBuf {
    PathBuf::from("/opt/eddy/plugins")
}

fn default_sql_runner_pattern() -> String {
    r"^eddy-sqlclient-.*\.jar$".to_owned()
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            remote: default_remote_workspace(),
            uploads: default_uploads(),
            plugins: default_plugins(),
            backups: default_backups(),
            staging: default_staging(),
            local: default_local_workspace(),
            local_plugins: default_local_plugins(),
            sql_runner_pattern: default_sql_runner_pattern(),
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Workers kept alive while idle.
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    /// Upper bound on concurrent workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Pending tasks accepted before submissions are rejected.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Idle time after which workers above the minimum exit.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// How long shutdown waits for queued and running tasks before cancelling them.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_min_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
}

const fn default_max_workers() -> usize {
    200
}

const fn default_queue_capacity() -> usize {
    1024
}

const fn default_keep_alive_secs() -> u64 {
    60
}

const fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            queue_capacity: default_queue_capacity(),
            keep_alive_secs: default_keep_alive_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// Dependency resolution settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Remote repositories, tried in order.
    #[serde(default = "default_repositories")]
    pub repositories: Vec<String>,

    /// Local cache of downloaded poms and jars.
    #[serde(default = "default_local_repository")]
    pub local_repository: PathBuf,

    /// Per-request timeout in seconds.
    #[serde(default = "default_resolver_timeout_secs")]
    pub timeout_secs: u64,

    /// Exclusions added to the built-in denylist.
    #[serde(default)]
    pub exclusions: Vec<Exclusion>,
}

fn default_repositories() -> Vec<String> {
    vec!["https://repo1.maven.org/maven2".to_owned()]
}

fn default_local_repository() -> PathBuf {
    PathBuf::from("/var/cache/eddy/repository")
}

const fn default_resolver_timeout_secs() -> u64 {
    60
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            repositories: default_repositories(),
            local_repository: default_local_repository(),
            timeout_secs: default_resolver_timeout_secs(),
            exclusions: Vec::new(),
        }
    }
}

/// Artifact storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactConfig {
    /// Object store URL (`file:///path` or `memory://`).
    #[serde(default = "default_store_url")]
    pub store_url: String,
}

fn default_store_url() -> String {
    "file:///var/lib/eddy/artifacts".to_owned()
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
        }
    }
}

/// Profiling reporter settings, used when a start requests a flame graph.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfilingConfig {
    /// Whether profiling may be requested at all.
    #[serde(default)]
    pub enabled: bool,

    /// Base URL the reporter posts metrics back to.
    #[serde(default = "default_callback_url")]
    pub callback_url: String,

    /// Stack sampling interval in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub sample_interval_ms: u64,

    /// Metric reporting interval in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub metric_interval_ms: u64,
}

fn default_callback_url() -> String {
    "http://localhost:10000".to_owned()
}

const fn default_interval_ms() -> u64 {
    120_000
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            callback_url: default_callback_url(),
            sample_interval_ms: default_interval_ms(),
            metric_interval_ms: default_interval_ms(),
        }
    }
}

/// Resolution log publishing.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Topic prefix for resolution output.
    #[serde(default = "default_topic")]
    pub topic: String,
}

fn default_topic() -> String {
    "/resp/mvn".to_owned()
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
        }
    }
}

/// Submission gateway client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitterConfig {
    /// Base URL of the submission gateway.
    #[serde(default = "default_submitter_url")]
    pub url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_submitter_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_submitter_url() -> String {
    "http://localhost:8091".to_owned()
}

const fn default_submitter_timeout_secs() -> u64 {
    300
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            url: default_submitter_url(),
            timeout_secs: default_submitter_timeout_secs(),
        }
    }
}
