//! Configuration resolution and canonical data model for Flotilla.
//!
//! This crate turns an ordered set of YAML configuration layers into one
//! canonical [`Project`]: documents are parsed, `extends` references are
//! flattened, layers merge field-by-field, variables interpolate, and each
//! service normalizes into an immutable [`ServiceDescriptor`] with a
//! deterministic blake3 fingerprint.

pub mod descriptor;
pub mod document;
pub mod identity;
pub mod interpolate;
pub mod labels;
pub mod merge;
pub mod types;

pub use descriptor::{
    Command, MountMode, NetworkAttachment, NetworkDecl, NetworkMode, PortBinding, Project,
    Protocol, Resolved, RestartPolicy, ServiceDescriptor, VolumeDecl, VolumeMount, VolumesFromRef,
    DEFAULT_NETWORK, DEFAULT_STOP_GRACE_SECS,
};
pub use document::{
    load_documents, parse_document_file, parse_document_str, ConfigDocument, DocumentSet,
    ServiceConfig,
};
pub use identity::compute_fingerprint;
pub use labels::{
    instance_labels, LABEL_CONFIG_HASH, LABEL_NUMBER, LABEL_ONE_OFF, LABEL_PROJECT, LABEL_SERVICE,
};
pub use merge::{flatten_layer, merge_layers, merge_service};
pub use types::{sanitize_project_name, ContainerId, Fingerprint, ProjectName, ServiceName};

use thiserror::Error;

/// Configuration-time failures, always surfaced before any engine call.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config document: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("failed to canonicalize descriptor: {0}")]
    Canonicalize(#[from] serde_json::Error),
    #[error("service '{service}': unresolved extends reference '{reference}'")]
    UnresolvedExtends { service: String, reference: String },
    #[error("circular extends chain: {}", .0.join(" -> "))]
    ExtendsCycle(Vec<String>),
    #[error("circular dependency between services: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
    #[error("service '{service}' depends on undefined service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },
    #[error("service '{service}' references undeclared network '{network}'")]
    UndeclaredNetwork { service: String, network: String },
    #[error("service '{service}' references undeclared volume '{volume}'")]
    UndeclaredVolume { service: String, volume: String },
    #[error("service '{service}': invalid port specification '{spec}'")]
    InvalidPort { service: String, spec: String },
    #[error("service '{service}': invalid volume specification '{spec}'")]
    InvalidVolume { service: String, spec: String },
    #[error("service '{service}': invalid network_mode '{mode}'")]
    InvalidNetworkMode { service: String, mode: String },
    #[error("service '{service}': invalid restart policy '{policy}'")]
    InvalidRestart { service: String, policy: String },
    #[error("service '{service}': invalid duration '{value}'")]
    InvalidDuration { service: String, value: String },
    #[error("service '{service}' must declare either an image or a build context")]
    MissingImage { service: String },
    #[error("options '{a}' and '{b}' are mutually exclusive")]
    MutuallyExclusive { a: String, b: String },
    #[error("no such service: {0}")]
    NoSuchService(String),
}
