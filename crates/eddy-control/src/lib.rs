//! Eddy control plane
//!
//! This crate manages the lifecycle of long-running streaming jobs on a
//! shared compute cluster: creating, deploying, starting and cancelling
//! them, tracking their live state, and reconciling definition changes
//! across versions.
//!
//! # Architecture
//!
//! - **Version diffing** ([`version`]): decides whether an edited SQL
//!   definition needs a new version row, a relabel, a redeploy or only a
//!   restart.
//! - **Dependency resolution** ([`dependency`]): turns build coordinates into
//!   local jars, streaming progress to subscribers with replay for late
//!   joiners.
//! - **Orchestration** ([`orchestrator`]): the deploy, start and cancel
//!   transitions, serialised per application.
//! - **Worker pool** ([`pool`]): bounded queue with a reject policy for
//!   network-bound steps.
//! - **Tracking** ([`tracking`]): concurrent registry of live jobs feeding the
//!   dashboard and listings.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──▶ Deploying ──▶ Deployed ──▶ Starting ──▶ Running ──▶ Cancelling ──▶ Canceled
//!                                           │           │
//!                                           ▼           ▼
//!                                         Failed      Failed
//! ```
//!
//! # Example
//!
//! ```ignore
//! use eddy_control::orchestrator::{CreateRequest, DeployRequest, StartRequest};
//!
//! let app = orchestrator.create(request).await?;
//! orchestrator.deploy(&app.id, DeployRequest::default()).await?;
//! orchestrator.start(&app.id, StartRequest::default()).await?;
//! ```

#![forbid(unsafe_code)]

pub mod artifact;
pub mod config;
pub mod dependency;
pub mod error;
pub mod hooks;
pub mod orchestrator;
pub mod pool;
pub mod service;
pub mod state;
pub mod store;
pub mod submitter;
pub mod tracking;
pub mod types;
pub mod version;

// Re-export commonly used types at the crate root
pub use config::ControlConfig;
pub use error::{ControlError, ControlResult};
pub use orchestrator::{
    CancelOutcome, CancelRequest, Collaborators, CreateRequest, DeployOutcome, DeployRequest,
    JobOrchestrator, StartOutcome, StartRequest, UpdateRequest,
};
pub use pool::{TaskHandle, WorkerPool};
pub use service::ControlService;
pub use state::{AppState, DeployMarker, OptionState};
pub use store::{ApplicationFilter, JobStore, MemoryStore};
pub use tracking::{Dashboard, TrackedJob, TrackingRegistry};
pub use types::{Application, ApplicationId, DefinitionVersion, SavePoint};
