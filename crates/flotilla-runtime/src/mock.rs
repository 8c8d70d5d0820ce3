use crate::engine::{
    ContainerEngine, ContainerRecord, ContainerStatus, CreateSpec, EngineEvent, EventAction,
    EventSubscription, LabelFilter, NetworkSpec, VolumeSpec,
};
use crate::EngineError;
use chrono::Utc;
use flotilla_schema::ContainerId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{mpsc, Mutex};
use std::time::Duration;

/// In-memory engine double.
///
/// Deterministic: monotonic ids, name-conflict checks, an operation log for
/// ordering assertions, and a per-container "stubborn" flag that ignores
/// polite stops so tests can exercise the kill escalation.
pub struct MockEngine {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    networks: BTreeMap<String, NetworkSpec>,
    volumes: BTreeMap<String, VolumeSpec>,
    removed_images: Vec<String>,
    next_id: u64,
    subscribers: Vec<(LabelFilter, mpsc::Sender<EngineEvent>)>,
    operations: Vec<String>,
    stubborn: BTreeSet<String>,
    fail_create_matching: Option<String>,
    fail_start_matching: Option<String>,
}

#[derive(Clone)]
struct MockContainer {
    record: ContainerRecord,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockState>, EngineError> {
        self.state
            .lock()
            .map_err(|e| EngineError::Remote(format!("mutex poisoned: {e}")))
    }

    /// Containers whose name contains `fragment` ignore polite stops.
    pub fn set_stubborn(&self, fragment: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.stubborn.insert(fragment.to_owned());
        }
    }

    /// Fail the next and all further creates whose name contains `fragment`.
    pub fn fail_create_matching(&self, fragment: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_create_matching = Some(fragment.to_owned());
        }
    }

    /// Fail starts for containers whose name contains `fragment`.
    pub fn fail_start_matching(&self, fragment: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_start_matching = Some(fragment.to_owned());
        }
    }

    /// Chronological operation log, `"<op> <container-name>"` per entry.
    pub fn operations(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.operations.clone())
            .unwrap_or_default()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.removed_images.clone())
            .unwrap_or_default()
    }

    /// Register a network that exists outside any project, for external
    /// resource checks.
    pub fn add_preexisting_network(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.networks.insert(
                name.to_owned(),
                NetworkSpec {
                    name: name.to_owned(),
                    ..NetworkSpec::default()
                },
            );
        }
    }

    /// Register a volume that exists outside any project.
    pub fn add_preexisting_volume(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.volumes.insert(
                name.to_owned(),
                VolumeSpec {
                    name: name.to_owned(),
                    ..VolumeSpec::default()
                },
            );
        }
    }
}

fn emit(state: &mut MockState, action: EventAction, record: &ContainerRecord) {
    let event = EngineEvent {
        timestamp: Utc::now(),
        action,
        container_id: record.id.clone(),
        container_name: record.name.clone(),
        image: record.image.clone(),
        labels: record.labels.clone(),
    };
    state
        .subscribers
        .retain(|(filter, sender)| !filter.matches(&event.labels) || sender.send(event.clone()).is_ok());
}

fn log(state: &mut MockState, op: &str, name: &str) {
    state.operations.push(format!("{op} {name}"));
}

impl MockState {
    fn get_mut(&mut self, id: &ContainerId) -> Result<&mut MockContainer, EngineError> {
        self.containers
            .get_mut(id.as_str())
            .ok_or_else(|| EngineError::NoSuchContainer(id.to_string()))
    }

    fn is_stubborn(&self, name: &str) -> bool {
        self.stubborn.iter().any(|fragment| name.contains(fragment))
    }
}

impl ContainerEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn create_container(&self, spec: &CreateSpec) -> Result<ContainerId, EngineError> {
        let mut state = self.lock()?;
        if let Some(fragment) = &state.fail_create_matching {
            if spec.name.contains(fragment.as_str()) {
                return Err(EngineError::Remote(format!(
                    "create failed for {}",
                    spec.name
                )));
            }
        }
        if state
            .containers
            .values()
            .any(|c| c.record.name == spec.name)
        {
            return Err(EngineError::NameConflict(spec.name.clone()));
        }

        state.next_id += 1;
        let id = ContainerId::new(format!("mock-{:08x}", state.next_id));

        // Anonymous mounts get engine-provisioned volume names so recreate
        // can carry them forward.
        let mut mounts = BTreeMap::new();
        for mount in &spec.mounts {
            let source = mount
                .source
                .clone()
                .unwrap_or_else(|| format!("anon-{id}{}", mount.target.replace('/', "-")));
            mounts.insert(mount.target.clone(), source);
        }

        let record = ContainerRecord {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            status: ContainerStatus::Created,
            labels: spec.labels.clone(),
            mounts,
            exit_code: None,
        };
        log(&mut state, "create", &spec.name);
        emit(&mut state, EventAction::Create, &record);
        state
            .containers
            .insert(id.to_string(), MockContainer { record });
        Ok(id)
    }

    fn start_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        if let Some(fragment) = state.fail_start_matching.clone() {
            let name = state.get_mut(id)?.record.name.clone();
            if name.contains(&fragment) {
                return Err(EngineError::Remote(format!("start failed for {name}")));
            }
        }
        let record = {
            let container = state.get_mut(id)?;
            container.record.status = ContainerStatus::Running;
            container.record.exit_code = None;
            container.record.clone()
        };
        log(&mut state, "start", &record.name);
        emit(&mut state, EventAction::Start, &record);
        Ok(())
    }

    fn stop_container(
        &self,
        id: &ContainerId,
        _stop_signal: Option<&str>,
    ) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        let (record, obeyed) = {
            let container = state.containers.get(id.as_str()).cloned();
            let container =
                container.ok_or_else(|| EngineError::NoSuchContainer(id.to_string()))?;
            let obeyed = !state.is_stubborn(&container.record.name);
            (container.record, obeyed)
        };
        log(&mut state, "stop", &record.name);
        if obeyed && record.status.is_running() {
            let updated = {
                let container = state.get_mut(id)?;
                container.record.status = ContainerStatus::Exited;
                container.record.exit_code = Some(0);
                container.record.clone()
            };
            emit(&mut state, EventAction::Stop, &updated);
            emit(&mut state, EventAction::Die, &updated);
        }
        Ok(())
    }

    fn kill_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        let record = {
            let container = state.get_mut(id)?;
            if container.record.status.is_running() {
                container.record.status = ContainerStatus::Exited;
                container.record.exit_code = Some(137);
            }
            container.record.clone()
        };
        log(&mut state, "kill", &record.name);
        emit(&mut state, EventAction::Kill, &record);
        emit(&mut state, EventAction::Die, &record);
        Ok(())
    }

    fn pause_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        let record = {
            let container = state.get_mut(id)?;
            if container.record.status != ContainerStatus::Running {
                return Err(EngineError::Remote(format!(
                    "cannot pause {}: not running",
                    container.record.name
                )));
            }
            container.record.status = ContainerStatus::Paused;
            container.record.clone()
        };
        log(&mut state, "pause", &record.name);
        emit(&mut state, EventAction::Pause, &record);
        Ok(())
    }

    fn unpause_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        let record = {
            let container = state.get_mut(id)?;
            if container.record.status != ContainerStatus::Paused {
                return Err(EngineError::Remote(format!(
                    "cannot unpause {}: not paused",
                    container.record.name
                )));
            }
            container.record.status = ContainerStatus::Running;
            container.record.clone()
        };
        log(&mut state, "unpause", &record.name);
        emit(&mut state, EventAction::Unpause, &record);
        Ok(())
    }

    fn restart_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        let record = {
            let container = state.get_mut(id)?;
            container.record.status = ContainerStatus::Running;
            container.record.exit_code = None;
            container.record.clone()
        };
        log(&mut state, "restart", &record.name);
        emit(&mut state, EventAction::Restart, &record);
        Ok(())
    }

    fn rename_container(&self, id: &ContainerId, new_name: &str) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        if state
            .containers
            .values()
            .any(|c| c.record.name == new_name && c.record.id != *id)
        {
            return Err(EngineError::NameConflict(new_name.to_owned()));
        }
        let record = {
            let container = state.get_mut(id)?;
            container.record.name = new_name.to_owned();
            container.record.clone()
        };
        log(&mut state, "rename", &record.name);
        emit(&mut state, EventAction::Rename, &record);
        Ok(())
    }

    fn remove_container(&self, id: &ContainerId, _remove_volumes: bool) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        let record = {
            let container = state.get_mut(id)?;
            if container.record.status.is_running() {
                return Err(EngineError::Remote(format!(
                    "cannot remove running container {}",
                    container.record.name
                )));
            }
            container.record.clone()
        };
        state.containers.remove(id.as_str());
        log(&mut state, "remove", &record.name);
        emit(&mut state, EventAction::Destroy, &record);
        Ok(())
    }

    fn inspect_container(&self, id: &ContainerId) -> Result<ContainerRecord, EngineError> {
        let state = self.lock()?;
        state
            .containers
            .get(id.as_str())
            .map(|c| c.record.clone())
            .ok_or_else(|| EngineError::NoSuchContainer(id.to_string()))
    }

    fn list_containers(
        &self,
        filter: &LabelFilter,
        all: bool,
    ) -> Result<Vec<ContainerRecord>, EngineError> {
        let state = self.lock()?;
        let mut records: Vec<ContainerRecord> = state
            .containers
            .values()
            .map(|c| c.record.clone())
            .filter(|r| filter.matches(&r.labels))
            .filter(|r| all || r.status.is_running())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn wait_container(&self, id: &ContainerId, _timeout: Duration) -> Result<bool, EngineError> {
        let state = self.lock()?;
        let container = state
            .containers
            .get(id.as_str())
            .ok_or_else(|| EngineError::NoSuchContainer(id.to_string()))?;
        Ok(!container.record.status.is_running())
    }

    fn create_network(&self, spec: &NetworkSpec) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        if state.networks.contains_key(&spec.name) {
            return Err(EngineError::NameConflict(spec.name.clone()));
        }
        log(&mut state, "network-create", &spec.name);
        state.networks.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        if state.networks.remove(name).is_none() {
            return Err(EngineError::NoSuchNetwork(name.to_owned()));
        }
        log(&mut state, "network-remove", name);
        Ok(())
    }

    fn network_exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.lock()?.networks.contains_key(name))
    }

    fn create_volume(&self, spec: &VolumeSpec) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        if state.volumes.contains_key(&spec.name) {
            return Err(EngineError::NameConflict(spec.name.clone()));
        }
        log(&mut state, "volume-create", &spec.name);
        state.volumes.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        if state.volumes.remove(name).is_none() {
            return Err(EngineError::NoSuchVolume(name.to_owned()));
        }
        log(&mut state, "volume-remove", name);
        Ok(())
    }

    fn volume_exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.lock()?.volumes.contains_key(name))
    }

    fn remove_image(&self, reference: &str) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        log(&mut state, "image-remove", reference);
        state.removed_images.push(reference.to_owned());
        Ok(())
    }

    fn subscribe_events(&self, filter: &LabelFilter) -> Result<EventSubscription, EngineError> {
        let mut state = self.lock()?;
        let (sender, receiver) = mpsc::channel();
        state.subscribers.push((filter.clone(), sender));
        Ok(EventSubscription::from_receiver(receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_schema::LABEL_PROJECT;

    fn spec(name: &str) -> CreateSpec {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_PROJECT.to_owned(), "demo".to_owned());
        CreateSpec {
            name: name.to_owned(),
            image: "busybox".to_owned(),
            labels,
            ..CreateSpec::default()
        }
    }

    #[test]
    fn create_start_stop_lifecycle() {
        let engine = MockEngine::new();
        let id = engine.create_container(&spec("demo_web_1")).unwrap();
        assert_eq!(
            engine.inspect_container(&id).unwrap().status,
            ContainerStatus::Created
        );

        engine.start_container(&id).unwrap();
        assert_eq!(
            engine.inspect_container(&id).unwrap().status,
            ContainerStatus::Running
        );

        engine.stop_container(&id, None).unwrap();
        let record = engine.inspect_container(&id).unwrap();
        assert_eq!(record.status, ContainerStatus::Exited);
        assert_eq!(record.exit_code, Some(0));
        assert!(engine.wait_container(&id, Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn stubborn_container_ignores_stop_until_killed() {
        let engine = MockEngine::new();
        engine.set_stubborn("web");
        let id = engine.create_container(&spec("demo_web_1")).unwrap();
        engine.start_container(&id).unwrap();

        engine.stop_container(&id, None).unwrap();
        assert!(!engine.wait_container(&id, Duration::from_secs(1)).unwrap());

        engine.kill_container(&id).unwrap();
        let record = engine.inspect_container(&id).unwrap();
        assert_eq!(record.status, ContainerStatus::Exited);
        assert_eq!(record.exit_code, Some(137));
    }

    #[test]
    fn duplicate_name_is_a_conflict() {
        let engine = MockEngine::new();
        engine.create_container(&spec("demo_web_1")).unwrap();
        let err = engine.create_container(&spec("demo_web_1")).unwrap_err();
        assert!(matches!(err, EngineError::NameConflict(_)));
    }

    #[test]
    fn remove_requires_stopped() {
        let engine = MockEngine::new();
        let id = engine.create_container(&spec("demo_web_1")).unwrap();
        engine.start_container(&id).unwrap();
        assert!(engine.remove_container(&id, false).is_err());
        engine.stop_container(&id, None).unwrap();
        engine.remove_container(&id, false).unwrap();
        assert!(engine.inspect_container(&id).is_err());
    }

    #[test]
    fn list_filters_by_label_and_state() {
        let engine = MockEngine::new();
        let a = engine.create_container(&spec("demo_web_1")).unwrap();
        engine.create_container(&spec("demo_db_1")).unwrap();
        engine.start_container(&a).unwrap();

        let filter = LabelFilter::new().with(LABEL_PROJECT, "demo");
        assert_eq!(engine.list_containers(&filter, true).unwrap().len(), 2);
        assert_eq!(engine.list_containers(&filter, false).unwrap().len(), 1);

        let other = LabelFilter::new().with(LABEL_PROJECT, "other");
        assert!(engine.list_containers(&other, true).unwrap().is_empty());
    }

    #[test]
    fn events_reach_matching_subscribers_only() {
        let engine = MockEngine::new();
        let demo = engine
            .subscribe_events(&LabelFilter::new().with(LABEL_PROJECT, "demo"))
            .unwrap();
        let other = engine
            .subscribe_events(&LabelFilter::new().with(LABEL_PROJECT, "other"))
            .unwrap();

        let id = engine.create_container(&spec("demo_web_1")).unwrap();
        engine.start_container(&id).unwrap();

        let first = demo.next_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(first.action, EventAction::Create);
        let second = demo.next_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(second.action, EventAction::Start);
        assert!(other.next_timeout(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn anonymous_mounts_get_sources() {
        let engine = MockEngine::new();
        let mut create = spec("demo_db_1");
        create.mounts = vec![flotilla_schema::VolumeMount {
            source: None,
            target: "/data".to_owned(),
            mode: flotilla_schema::MountMode::ReadWrite,
        }];
        let id = engine.create_container(&create).unwrap();
        let record = engine.inspect_container(&id).unwrap();
        let source = record.mounts.get("/data").unwrap();
        assert!(source.starts_with("anon-"));
    }

    #[test]
    fn rename_checks_conflicts() {
        let engine = MockEngine::new();
        let a = engine.create_container(&spec("demo_web_1")).unwrap();
        engine.create_container(&spec("demo_db_1")).unwrap();
        assert!(engine.rename_container(&a, "demo_db_1").is_err());
        engine.rename_container(&a, "demo_web_1_old").unwrap();
        assert_eq!(
            engine.inspect_container(&a).unwrap().name,
            "demo_web_1_old"
        );
    }

    #[test]
    fn operations_log_preserves_order() {
        let engine = MockEngine::new();
        let id = engine.create_container(&spec("demo_web_1")).unwrap();
        engine.start_container(&id).unwrap();
        engine.stop_container(&id, None).unwrap();
        let ops = engine.operations();
        assert_eq!(
            ops,
            vec![
                "create demo_web_1",
                "start demo_web_1",
                "stop demo_web_1"
            ]
        );
    }
}
