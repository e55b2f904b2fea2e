//! Lifecycle states and overlay markers for managed applications.
//!
//! The persisted lifecycle follows:
//!
//! ```text
//! Created ──▶ Deploying ──▶ Deployed ──▶ Starting ──▶ Running ──▶ Cancelling ──▶ Canceled
//!                 ▲                          │           │  │           │
//!                 │                          ▼           ▼  ▼           ▼
//!     (Deployed | Canceled | Failed |      Failed     Failed Finished  Running
//!      Finished) redeploy                                          (stop failed)
//! ```
//!
//! Two overlay markers ride alongside the lifecycle state: [`OptionState`]
//! records an in-flight operation and doubles as an advisory lock, and
//! [`DeployMarker`] records remediation that is pending because the job was
//! running when its definition changed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};

/// Persisted lifecycle state of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    /// Definition saved, nothing staged yet.
    #[default]
    Created,
    /// Artifacts are being staged.
    Deploying,
    /// Artifacts staged, nothing running.
    Deployed,
    /// Submitted to the cluster, not yet confirmed running.
    Starting,
    /// Confirmed running in the cluster.
    Running,
    /// Stop requested.
    Cancelling,
    /// Stopped by request.
    Canceled,
    /// Finished on its own.
    Finished,
    /// Submission or runtime failure.
    Failed,
}

impl AppState {
    /// Get the state name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Deploying => "deploying",
            Self::Deployed => "deployed",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Canceled => "canceled",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    /// Whether the job is believed to be live in the cluster.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// The state to resume from when the operation that set `self` is gone.
    ///
    /// A deploy cut short leaves no trustworthy bundle, so it falls back to
    /// `Created`. A stop cut short leaves the job presumed live; the runtime
    /// monitor corrects `Running` if it is not.
    #[must_use]
    pub const fn settled(&self) -> Self {
        match self {
            Self::Deploying => Self::Created,
            Self::Cancelling => Self::Running,
            other => *other,
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        use AppState::{
            Canceled, Cancelling, Created, Deployed, Deploying, Failed, Finished, Running,
            Starting,
        };
        matches!(
            (*self, next),
            (Created | Deployed | Canceled | Failed | Finished, Deploying)
                | (Deploying, Deployed)
                | (Deployed | Canceled | Failed | Finished, Starting)
                | (Starting, Running | Failed | Cancelling)
                | (Running, Cancelling | Failed | Finished)
                | (Cancelling, Canceled | Running | Failed)
        )
    }

    /// Return an error unless `self -> next` is a legal transition.
    pub fn ensure_transition(&self, next: Self) -> ControlResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(ControlError::InvalidStateTransition {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AppState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "deploying" => Ok(Self::Deploying),
            "deployed" => Ok(Self::Deployed),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "cancelling" => Ok(Self::Cancelling),
            "canceled" => Ok(Self::Canceled),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown application state: {s}")),
        }
    }
}

/// In-flight operation marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionState {
    /// Nothing in flight.
    #[default]
    None,
    /// Artifacts are being staged.
    Deploying,
    /// A submission was accepted and tracking has begun.
    Starting,
    /// A plain stop is in flight.
    Cancelling,
    /// A stop with savepoint capture is in flight.
    Savepointing,
}

impl OptionState {
    /// Get the marker name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Deploying => "deploying",
            Self::Starting => "starting",
            Self::Cancelling => "cancelling",
            Self::Savepointing => "savepointing",
        }
    }

    /// Whether a new deploy, start or cancel must wait for this marker to clear.
    #[must_use]
    pub const fn blocks_operations(&self) -> bool {
        matches!(self, Self::Deploying | Self::Cancelling | Self::Savepointing)
    }
}

impl fmt::Display for OptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pending remediation discovered while the job was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployMarker {
    /// Nothing pending.
    #[default]
    None,
    /// Configuration changed; a restart picks it up.
    NeedRestartAfterConfUpdate,
    /// Dependencies changed relative to what is live; artifacts must be redeployed.
    NeedDeployAfterDependencyUpdate,
    /// SQL changed but artifacts are unaffected; a restart suffices.
    NeedRestartAfterSqlUpdate,
    /// Artifacts were staged while the old instance kept running.
    NeedRestartAfterDeploy,
}

impl DeployMarker {
    /// Get the marker name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::NeedRestartAfterConfUpdate => "need_restart_after_conf_update",
            Self::NeedDeployAfterDependencyUpdate => "need_deploy_after_dependency_update",
            Self::NeedRestartAfterSqlUpdate => "need_restart_after_sql_update",
            Self::NeedRestartAfterDeploy => "need_restart_after_deploy",
        }
    }
}

impl fmt::Display for DeployMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let path = [
            AppState::Created,
            AppState::Deploying,
            AppState::Deployed,
            AppState::Starting,
            AppState::Running,
            AppState::Cancelling,
            AppState::Canceled,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn failed_only_from_live_states() {
        assert!(AppState::Starting.can_transition_to(AppState::Failed));
        assert!(AppState::Running.can_transition_to(AppState::Failed));
        assert!(!AppState::Created.can_transition_to(AppState::Failed));
        assert!(!AppState::Deployed.can_transition_to(AppState::Failed));
    }

    #[test]
    fn cannot_cancel_idle_job() {
        let err = AppState::Deployed
            .ensure_transition(AppState::Cancelling)
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::InvalidStateTransition {
                from: "deployed",
                to: "cancelling"
            }
        ));
    }

    #[test]
    fn redeploy_after_terminal_states() {
        for state in [AppState::Canceled, AppState::Failed, AppState::Finished] {
            assert!(state.can_transition_to(AppState::Deploying));
            assert!(state.can_transition_to(AppState::Starting));
        }
        assert!(!AppState::Running.can_transition_to(AppState::Deploying));
    }

    #[test]
    fn transitional_states_settle() {
        assert_eq!(AppState::Deploying.settled(), AppState::Created);
        assert_eq!(AppState::Cancelling.settled(), AppState::Running);
        assert_eq!(AppState::Starting.settled(), AppState::Starting);
        assert_eq!(AppState::Deployed.settled(), AppState::Deployed);
        assert!(AppState::Deploying
            .settled()
            .can_transition_to(AppState::Deploying));
        assert!(AppState::Cancelling
            .settled()
            .can_transition_to(AppState::Cancelling));
    }

    #[test]
    fn state_string_roundtrip() {
        for state in [
            AppState::Created,
            AppState::Deploying,
            AppState::Deployed,
            AppState::Starting,
            AppState::Running,
            AppState::Cancelling,
            AppState::Canceled,
            AppState::Finished,
            AppState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<AppState>(), Ok(state));
        }
        assert!("bogus".parse::<AppState>().is_err());
    }

    #[test]
    fn blocking_markers() {
        assert!(!OptionState::None.blocks_operations());
        assert!(!OptionState::Starting.blocks_operations());
        assert!(OptionState::Deploying.blocks_operations());
        assert!(OptionState::Cancelling.blocks_operations());
        assert!(OptionState::Savepointing.blocks_operations());
    }

    #[test]
    fn markers_serialise_snake_case() {
        let json = serde_json::to_string(&DeployMarker::NeedDeployAfterDependencyUpdate).unwrap();
        assert_eq!(json, r#""need_deploy_after_dependency_update""#);
    }
}
