//! Engine and builder seams for Flotilla.
//!
//! The [`ContainerEngine`] trait is the capability the convergence core is
//! written against: container lifecycle, networks, volumes, and the live
//! event feed. [`MockEngine`] is the in-memory double used across the test
//! suites; [`DockerCliEngine`] adapts a `docker`-compatible binary.

pub mod builder;
pub mod docker_cli;
pub mod engine;
pub mod mock;

pub use builder::{select_builder, BuildRequest, DockerCliBuilder, ImageBuilder, MockBuilder};
pub use docker_cli::DockerCliEngine;
pub use engine::{
    select_engine, ContainerEngine, ContainerRecord, ContainerStatus, CreateSpec, EngineEvent,
    EventAction, EventSubscription, LabelFilter, NetworkSpec, VolumeSpec,
};
pub use mock::MockEngine;

use thiserror::Error;

/// Failures crossing the engine seam.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("no such container: {0}")]
    NoSuchContainer(String),
    #[error("no such network: {0}")]
    NoSuchNetwork(String),
    #[error("no such volume: {0}")]
    NoSuchVolume(String),
    #[error("no such image: {0}")]
    NoSuchImage(String),
    #[error("name conflict: {0}")]
    NameConflict(String),
    #[error("engine call failed: {0}")]
    Remote(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed engine response: {0}")]
    Malformed(#[from] serde_json::Error),
}
