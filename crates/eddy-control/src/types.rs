//! Core types for eddy-control.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dependency::DependencyDescriptor;
use crate::state::{AppState, DeployMarker, OptionState};

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new unique identifier using ULID.
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new().to_string().to_lowercase())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

ulid_id!(
    /// Unique identifier for a managed application.
    ApplicationId
);
ulid_id!(
    /// Unique identifier for a definition version row.
    VersionId
);
ulid_id!(
    /// Unique identifier for a savepoint row.
    SavePointId
);
ulid_id!(
    /// Unique identifier for a submission log row.
    LogId
);

/// How the job logic is authored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// User-built jar.
    #[default]
    CustomCode,
    /// Declarative SQL executed by the shared runner jar.
    Sql,
}

/// Flavour of a custom-code application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    /// Built on the managed framework; configured through a config file.
    #[default]
    Managed,
    /// Plain job jar with an explicit main class.
    Native,
}

impl ApplicationType {
    /// Name passed to the submitter.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Managed => "managed",
            Self::Native => "native",
        }
    }
}

/// Cluster deployment topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Cluster-managed application mode: the cluster runs the entry point.
    #[default]
    Application,
    /// Client-submitted per-job cluster.
    PerJob,
    /// Long-lived shared session cluster.
    Session,
    /// Remote standalone cluster.
    Remote,
    /// In-process local execution.
    Local,
}

impl ExecutionMode {
    /// Get the mode name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::PerJob => "per_job",
            Self::Session => "session",
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Class loading order for user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveOrder {
    /// Framework classes win.
    ParentFirst,
    /// User classes win.
    #[default]
    ChildFirst,
}

/// Serialisation format of an application config version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigFormat {
    /// YAML document.
    #[default]
    Yaml,
    /// Java-style properties.
    Properties,
}

impl ConfigFormat {
    /// URI scheme used when handing the config to the submitter.
    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Properties => "prop",
        }
    }
}

/// A managed job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    /// Unique identifier.
    pub id: ApplicationId,
    /// Job name shown in the cluster.
    pub job_name: String,
    /// Development mode.
    pub job_type: JobType,
    /// Custom-code flavour; ignored for SQL jobs.
    #[serde(default)]
    pub application_type: ApplicationType,
    /// Deployment topology.
    pub execution_mode: ExecutionMode,
    /// Class loading order.
    #[serde(default)]
    pub resolve_order: ResolveOrder,
    /// Build module name for custom-code jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Jar file name for native custom-code jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jar: Option<String>,
    /// Entry point for native custom-code jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_class: Option<String>,
    /// Local directory holding the project's build output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_base: Option<PathBuf>,
    /// Typed submission options.
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
    /// Whitespace separated `-Dkey=value` style options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_options: Option<String>,
    /// Program arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Dependencies of the last staged SQL version.
    #[serde(default)]
    pub dependency: DependencyDescriptor,
    /// Lifecycle state.
    pub state: AppState,
    /// In-flight operation marker.
    pub option_state: OptionState,
    /// Pending remediation marker.
    pub deploy: DeployMarker,
    /// Cluster-assigned application handle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_app_id: Option<String>,
    /// Cluster-assigned job id, reported by the monitor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_job_id: Option<String>,
    /// Job manager process memory in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jm_memory_mib: Option<u32>,
    /// Task manager process memory in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tm_memory_mib: Option<u32>,
    /// Whether the last start enabled profiling.
    #[serde(default)]
    pub flame_graph: bool,
    /// When the application was created.
    pub created_at: DateTime<Utc>,
    /// When the application was last updated.
    pub updated_at: DateTime<Utc>,
    /// When the last run ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Application {
    /// Build a new application in the [`AppState::Created`] state.
    #[must_use]
    pub fn new(job_name: impl Into<String>, job_type: JobType, execution_mode: ExecutionMode) -> Self {
        let now = Utc::now();
        Self {
            id: ApplicationId::generate(),
            job_name: job_name.into(),
            job_type,
            application_type: ApplicationType::default(),
            execution_mode,
            resolve_order: ResolveOrder::default(),
            module: None,
            jar: None,
            main_class: None,
            local_base: None,
            options: BTreeMap::new(),
            dynamic_options: None,
            args: None,
            description: None,
            dependency: DependencyDescriptor::default(),
            state: AppState::Created,
            option_state: OptionState::None,
            deploy: DeployMarker::None,
            cluster_app_id: None,
            cluster_job_id: None,
            jm_memory_mib: None,
            tm_memory_mib: None,
            flame_graph: false,
            created_at: now,
            updated_at: now,
            end_time: None,
        }
    }

    /// Whether the job is believed to be live in the cluster.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Whether this is a declarative SQL job.
    #[must_use]
    pub fn is_sql_job(&self) -> bool {
        self.job_type == JobType::Sql
    }
}

/// Field-level update of an application row.
///
/// Only `Some` fields are written; nullable columns use a nested `Option`
/// so that `Some(None)` clears them.
#[derive(Debug, Clone, Default)]
pub struct ApplicationPatch {
    /// New lifecycle state.
    pub state: Option<AppState>,
    /// New in-flight marker.
    pub option_state: Option<OptionState>,
    /// New remediation marker.
    pub deploy: Option<DeployMarker>,
    /// New staged dependency set.
    pub dependency: Option<DependencyDescriptor>,
    /// Cluster application handle.
    pub cluster_app_id: Option<Option<String>>,
    /// Cluster job id.
    pub cluster_job_id: Option<Option<String>>,
    /// Job manager memory.
    pub jm_memory_mib: Option<Option<u32>>,
    /// Task manager memory.
    pub tm_memory_mib: Option<Option<u32>>,
    /// Profiling flag.
    pub flame_graph: Option<bool>,
    /// End of the last run.
    pub end_time: Option<Option<DateTime<Utc>>>,
}

impl ApplicationPatch {
    /// Create an empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lifecycle state.
    #[must_use]
    pub const fn with_state(mut self, state: AppState) -> Self {
        self.state = Some(state);
        self
    }

    /// Set the in-flight marker.
    #[must_use]
    pub const fn with_option_state(mut self, option_state: OptionState) -> Self {
        self.option_state = Some(option_state);
        self
    }

    /// Set the remediation marker.
    #[must_use]
    pub const fn with_deploy(mut self, deploy: DeployMarker) -> Self {
        self.deploy = Some(deploy);
        self
    }

    /// Apply the patch to an application in place.
    pub fn apply(self, app: &mut Application) {
        if let Some(state) = self.state {
            app.state = state;
        }
        if let Some(option_state) = self.option_state {
            app.option_state = option_state;
        }
        if let Some(deploy) = self.deploy {
            app.deploy = deploy;
        }
        if let Some(dependency) = self.dependency {
            app.dependency = dependency;
        }
        if let Some(v) = self.cluster_app_id {
            app.cluster_app_id = v;
        }
        if let Some(v) = self.cluster_job_id {
            app.cluster_job_id = v;
        }
        if let Some(v) = self.jm_memory_mib {
            app.jm_memory_mib = v;
        }
        if let Some(v) = self.tm_memory_mib {
            app.tm_memory_mib = v;
        }
        if let Some(v) = self.flame_graph {
            app.flame_graph = v;
        }
        if let Some(v) = self.end_time {
            app.end_time = v;
        }
        app.updated_at = Utc::now();
    }
}

/// Which kind of definition a version row holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    /// SQL text plus its dependency set.
    Sql,
    /// Application configuration document.
    Config,
}

/// SQL job logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlDefinition {
    /// The SQL text.
    pub text: String,
    /// Build coordinates and uploaded jars it needs.
    #[serde(default)]
    pub dependency: DependencyDescriptor,
}

impl SqlDefinition {
    /// Whether the SQL text differs from `other`, ignoring surrounding whitespace.
    #[must_use]
    pub fn text_differs(&self, other: &str) -> bool {
        self.text.trim() != other.trim()
    }
}

/// Application configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDefinition {
    /// Document format.
    pub format: ConfigFormat,
    /// Document body.
    pub content: String,
}

/// The payload of a definition version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DefinitionBody {
    /// SQL job logic.
    Sql(SqlDefinition),
    /// Application configuration.
    Config(ConfigDefinition),
}

impl DefinitionBody {
    /// The kind of this body.
    #[must_use]
    pub const fn kind(&self) -> DefinitionKind {
        match self {
            Self::Sql(_) => DefinitionKind::Sql,
            Self::Config(_) => DefinitionKind::Config,
        }
    }
}

/// Immutable snapshot of job logic or configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionVersion {
    /// Unique identifier.
    pub id: VersionId,
    /// Owning application.
    pub app_id: ApplicationId,
    /// Snapshot payload.
    pub body: DefinitionBody,
    /// Most recent candidate.
    pub latest: bool,
    /// Currently deployed.
    pub effective: bool,
    /// When the version was recorded.
    pub created_at: DateTime<Utc>,
}

impl DefinitionVersion {
    /// Create a new unflagged version.
    #[must_use]
    pub fn new(app_id: ApplicationId, body: DefinitionBody) -> Self {
        Self {
            id: VersionId::generate(),
            app_id,
            body,
            latest: false,
            effective: false,
            created_at: Utc::now(),
        }
    }

    /// The version kind.
    #[must_use]
    pub const fn kind(&self) -> DefinitionKind {
        self.body.kind()
    }

    /// The SQL payload, if this is a SQL version.
    #[must_use]
    pub const fn as_sql(&self) -> Option<&SqlDefinition> {
        match &self.body {
            DefinitionBody::Sql(sql) => Some(sql),
            DefinitionBody::Config(_) => None,
        }
    }

    /// The config payload, if this is a config version.
    #[must_use]
    pub const fn as_config(&self) -> Option<&ConfigDefinition> {
        match &self.body {
            DefinitionBody::Config(config) => Some(config),
            DefinitionBody::Sql(_) => None,
        }
    }
}

/// Resume marker captured at controlled shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavePoint {
    /// Unique identifier.
    pub id: SavePointId,
    /// Owning application.
    pub app_id: ApplicationId,
    /// Location returned by the cluster.
    pub path: String,
    /// Most recent usable savepoint.
    pub latest: bool,
    /// When the savepoint was recorded.
    pub created_at: DateTime<Utc>,
}

impl SavePoint {
    /// Create a savepoint flagged as latest.
    #[must_use]
    pub fn latest(app_id: ApplicationId, path: impl Into<String>) -> Self {
        Self {
            id: SavePointId::generate(),
            app_id,
            path: path.into(),
            latest: true,
            created_at: Utc::now(),
        }
    }
}

/// Append-only record of a submission attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationLog {
    /// Unique identifier.
    pub id: LogId,
    /// Owning application.
    pub app_id: ApplicationId,
    /// Cluster handle, when the submission got that far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_app_id: Option<String>,
    /// When the attempt started.
    pub start_time: DateTime<Utc>,
    /// Whether the cluster accepted the job.
    pub success: bool,
    /// Failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

impl ApplicationLog {
    /// Start a log record for a submission attempt.
    #[must_use]
    pub fn begin(app_id: ApplicationId) -> Self {
        Self {
            id: LogId::generate(),
            app_id,
            cluster_app_id: None,
            start_time: Utc::now(),
            success: false,
            exception: None,
        }
    }
}
