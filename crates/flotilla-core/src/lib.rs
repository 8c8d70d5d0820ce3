//! Convergence core for Flotilla.
//!
//! Ties the resolved project to the engine seam: builds the service
//! dependency graph, schedules lifecycle operations over it with bounded
//! parallelism, reconciles each container instance against its descriptor
//! fingerprint, coordinates signal-driven shutdown, and projects the engine
//! event feed onto typed project events.

pub mod events;
pub mod graph;
pub mod reconcile;
pub mod scheduler;
pub mod signal;

pub use events::{EventProjector, ProjectEvent};
pub use graph::DependencyGraph;
pub use reconcile::{
    container_name, stop_with_grace, ConvergeOptions, Divergence, InstanceAction, InstanceOutcome,
    Reconciler, RecreatePolicy,
};
pub use scheduler::{
    DownOptions, ImageRemoval, OperationReport, RunOptions, RunResult, Scheduler, ServiceOutcome,
    UpOptions, DEFAULT_PARALLELISM,
};
pub use signal::{LifecyclePhase, SignalCoordinator};

use flotilla_runtime::EngineError;
use flotilla_schema::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Engine(#[from] EngineError),
    #[error("external {kind} '{name}' not found on engine")]
    ExternalResourceMissing { kind: String, name: String },
    #[error("service '{service}': dependency '{dependency}' has no usable container")]
    DependencyUnavailable { service: String, dependency: String },
    #[error("operation interrupted")]
    Interrupted,
}

impl CoreError {
    /// Whether the failure is a configuration problem (detected before any
    /// engine call) rather than an operational one.
    pub fn is_config(&self) -> bool {
        matches!(self, CoreError::Config(_))
    }
}
