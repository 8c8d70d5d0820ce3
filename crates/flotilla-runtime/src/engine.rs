use crate::EngineError;
use chrono::{DateTime, Utc};
use flotilla_schema::{
    Command, ContainerId, Fingerprint, NetworkAttachment, PortBinding, ServiceName, VolumeMount,
    LABEL_CONFIG_HASH, LABEL_NUMBER, LABEL_ONE_OFF, LABEL_PROJECT, LABEL_SERVICE,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::time::Duration;

/// Engine-observed container state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Exited,
    Dead,
}

impl ContainerStatus {
    pub fn is_running(self) -> bool {
        matches!(self, ContainerStatus::Running | ContainerStatus::Paused)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Paused => write!(f, "paused"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Read-through view of one engine-managed container. The engine owns the
/// container; this record is never mutated locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub labels: BTreeMap<String, String>,
    /// Mounted volumes, target path to source (volume name or host path).
    pub mounts: BTreeMap<String, String>,
    pub exit_code: Option<i64>,
}

impl ContainerRecord {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn project(&self) -> Option<&str> {
        self.label(LABEL_PROJECT)
    }

    pub fn service(&self) -> Option<ServiceName> {
        self.label(LABEL_SERVICE).map(ServiceName::new)
    }

    /// 1-based instance index from the reserved number label.
    pub fn number(&self) -> Option<u32> {
        self.label(LABEL_NUMBER).and_then(|n| n.parse().ok())
    }

    pub fn is_one_off(&self) -> bool {
        self.label(LABEL_ONE_OFF) == Some("true")
    }

    /// Fingerprint captured at creation time, if the container carries one.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.label(LABEL_CONFIG_HASH).map(Fingerprint::new)
    }
}

/// Everything the engine needs to create one container.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub command: Option<Command>,
    pub entrypoint: Option<Command>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub mounts: Vec<VolumeMount>,
    /// Containers whose volumes this one mounts, resolved to ids.
    pub volumes_from: Vec<ContainerId>,
    pub networks: BTreeMap<String, NetworkAttachment>,
    /// Raw engine network mode; `None` selects the engine default.
    pub network_mode: Option<String>,
    pub restart: Option<String>,
    pub stop_signal: Option<String>,
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: Option<String>,
    pub options: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// (subnet, gateway) pools for static addressing.
    pub ipam_pools: Vec<(Option<String>, Option<String>)>,
}

#[derive(Debug, Clone, Default)]
pub struct VolumeSpec {
    pub name: String,
    pub driver: Option<String>,
    pub options: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// Label equality filter for list and event subscriptions.
#[derive(Debug, Clone, Default)]
pub struct LabelFilter(BTreeMap<String, String>);

impl LabelFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Engine-level lifecycle event action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Create,
    Start,
    Stop,
    Kill,
    Die,
    Destroy,
    Pause,
    Unpause,
    Restart,
    Rename,
    Other(String),
}

impl EventAction {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "create" => EventAction::Create,
            "start" => EventAction::Start,
            "stop" => EventAction::Stop,
            "kill" => EventAction::Kill,
            "die" => EventAction::Die,
            "destroy" => EventAction::Destroy,
            "pause" => EventAction::Pause,
            "unpause" => EventAction::Unpause,
            "restart" => EventAction::Restart,
            "rename" => EventAction::Rename,
            other => EventAction::Other(other.to_owned()),
        }
    }
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventAction::Create => write!(f, "create"),
            EventAction::Start => write!(f, "start"),
            EventAction::Stop => write!(f, "stop"),
            EventAction::Kill => write!(f, "kill"),
            EventAction::Die => write!(f, "die"),
            EventAction::Destroy => write!(f, "destroy"),
            EventAction::Pause => write!(f, "pause"),
            EventAction::Unpause => write!(f, "unpause"),
            EventAction::Restart => write!(f, "restart"),
            EventAction::Rename => write!(f, "rename"),
            EventAction::Other(other) => write!(f, "{other}"),
        }
    }
}

/// One raw engine event, as observed on the live feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub timestamp: DateTime<Utc>,
    pub action: EventAction,
    pub container_id: ContainerId,
    pub container_name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
}

/// Live event feed handle. The sequence starts at subscription time; engine
/// semantics do not allow replaying history. Dropping the handle ends the
/// subscription.
pub struct EventSubscription {
    receiver: mpsc::Receiver<EngineEvent>,
    /// Feed process for CLI-backed engines, reaped on drop.
    child: Option<std::process::Child>,
}

impl EventSubscription {
    pub fn from_receiver(receiver: mpsc::Receiver<EngineEvent>) -> Self {
        Self {
            receiver,
            child: None,
        }
    }

    pub fn with_child(receiver: mpsc::Receiver<EngineEvent>, child: std::process::Child) -> Self {
        Self {
            receiver,
            child: Some(child),
        }
    }

    /// Next event, waiting at most `timeout`. `None` means the window elapsed
    /// or the feed closed.
    pub fn next_timeout(&self, timeout: Duration) -> Option<EngineEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

impl Iterator for EventSubscription {
    type Item = EngineEvent;

    fn next(&mut self) -> Option<EngineEvent> {
        self.receiver.recv().ok()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(child) = &mut self.child {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// The container engine capability this system converges against.
///
/// Every method may block on remote I/O; callers schedule accordingly.
pub trait ContainerEngine: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    fn create_container(&self, spec: &CreateSpec) -> Result<ContainerId, EngineError>;

    fn start_container(&self, id: &ContainerId) -> Result<(), EngineError>;

    /// Politely request a stop with the given signal (engine default when
    /// `None`). Returns once the request is delivered; pair with
    /// [`ContainerEngine::wait_container`] to observe the exit.
    fn stop_container(&self, id: &ContainerId, stop_signal: Option<&str>)
        -> Result<(), EngineError>;

    fn kill_container(&self, id: &ContainerId) -> Result<(), EngineError>;

    fn pause_container(&self, id: &ContainerId) -> Result<(), EngineError>;

    fn unpause_container(&self, id: &ContainerId) -> Result<(), EngineError>;

    fn restart_container(&self, id: &ContainerId) -> Result<(), EngineError>;

    fn rename_container(&self, id: &ContainerId, new_name: &str) -> Result<(), EngineError>;

    fn remove_container(&self, id: &ContainerId, remove_volumes: bool) -> Result<(), EngineError>;

    fn inspect_container(&self, id: &ContainerId) -> Result<ContainerRecord, EngineError>;

    /// List containers matching the filter; `all` includes stopped ones.
    fn list_containers(
        &self,
        filter: &LabelFilter,
        all: bool,
    ) -> Result<Vec<ContainerRecord>, EngineError>;

    /// Wait for the container to exit, up to `timeout`. `Ok(true)` when the
    /// engine confirmed the exit within the window.
    fn wait_container(&self, id: &ContainerId, timeout: Duration) -> Result<bool, EngineError>;

    fn create_network(&self, spec: &NetworkSpec) -> Result<(), EngineError>;

    fn remove_network(&self, name: &str) -> Result<(), EngineError>;

    fn network_exists(&self, name: &str) -> Result<bool, EngineError>;

    fn create_volume(&self, spec: &VolumeSpec) -> Result<(), EngineError>;

    fn remove_volume(&self, name: &str) -> Result<(), EngineError>;

    fn volume_exists(&self, name: &str) -> Result<bool, EngineError>;

    fn remove_image(&self, reference: &str) -> Result<(), EngineError>;

    /// Subscribe to the live event feed, filtered by labels. The feed starts
    /// from "now".
    fn subscribe_events(&self, filter: &LabelFilter) -> Result<EventSubscription, EngineError>;
}

/// Select an engine implementation by name.
pub fn select_engine(name: &str) -> Result<Box<dyn ContainerEngine>, EngineError> {
    match name {
        "docker" => Ok(Box::new(crate::docker_cli::DockerCliEngine::new("docker"))),
        "podman" => Ok(Box::new(crate::docker_cli::DockerCliEngine::new("podman"))),
        "mock" => Ok(Box::new(crate::mock::MockEngine::new())),
        other => Err(EngineError::Unavailable(other.to_owned())),
    }
}
