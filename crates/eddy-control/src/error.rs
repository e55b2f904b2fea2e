//! Error types for eddy-control.

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur while orchestrating job lifecycles.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Application not found.
    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    /// Definition version not found.
    #[error("definition version not found: {0}")]
    VersionNotFound(String),

    /// Invalid lifecycle transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// Another operation already holds the application's in-flight marker.
    #[error("operation already in progress for {application}: {marker}")]
    OperationInProgress {
        /// Application identifier.
        application: String,
        /// The marker currently set.
        marker: &'static str,
    },

    /// Ambiguous or missing launch inputs; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A build coordinate could not be resolved.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// The cluster rejected or failed a submit/stop call.
    #[error("submission error: {0}")]
    Submission(String),

    /// Artifact store operation failed.
    #[error("artifact store error: {0}")]
    Artifact(String),

    /// The worker pool queue is full.
    #[error("worker pool saturated ({queued} tasks queued)")]
    PoolSaturated {
        /// Number of queued tasks at rejection time.
        queued: usize,
    },

    /// The worker pool is shut down.
    #[error("worker pool is shut down")]
    PoolClosed,

    /// A pooled task was cancelled before completing.
    #[error("task cancelled")]
    TaskCancelled,

    /// Repository error.
    #[error("store error: {0}")]
    Store(String),

    /// Settings could not be loaded.
    #[error("config error: {0}")]
    Config(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a configuration error.
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a resolution error.
    #[must_use]
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    /// Create a submission error.
    #[must_use]
    pub fn submission(msg: impl Into<String>) -> Self {
        Self::Submission(msg.into())
    }

    /// Create an artifact store error.
    #[must_use]
    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::Artifact(msg.into())
    }

    /// Create a store error.
    #[must_use]
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller may retry the same request later.
    ///
    /// Pool saturation is backpressure, not a failure of the request itself.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolSaturated { .. })
    }
}

impl From<object_store::Error> for ControlError {
    fn from(e: object_store::Error) -> Self {
        Self::Artifact(e.to_string())
    }
}
