//! Per-instance container reconciliation.
//!
//! The divergence decision is a pure function over the desired fingerprint
//! and the engine-observed record; the side-effecting apply path issues the
//! minimal engine calls to converge one instance slot.

use crate::CoreError;
use flotilla_runtime::{
    ContainerEngine, ContainerRecord, CreateSpec, LabelFilter, NetworkSpec, VolumeSpec,
};
use flotilla_schema::{
    compute_fingerprint, instance_labels, Command, ConfigError, ContainerId, Fingerprint,
    NetworkMode, Project, RestartPolicy, ServiceDescriptor, ServiceName, LABEL_ONE_OFF,
    LABEL_PROJECT, LABEL_SERVICE,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Canonical container name for a service instance.
pub fn container_name(
    project: &flotilla_schema::ProjectName,
    service: &ServiceName,
    number: u32,
    one_off: bool,
) -> String {
    if one_off {
        format!("{project}_{service}_run_{number}")
    } else {
        format!("{project}_{service}_{number}")
    }
}

/// Recreate modifiers, mutually exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecreatePolicy {
    pub force_recreate: bool,
    pub no_recreate: bool,
}

impl RecreatePolicy {
    /// Rejected before any engine call.
    pub fn validate(self) -> Result<(), CoreError> {
        if self.force_recreate && self.no_recreate {
            return Err(CoreError::Config(ConfigError::MutuallyExclusive {
                a: "force-recreate".to_owned(),
                b: "no-recreate".to_owned(),
            }));
        }
        Ok(())
    }
}

/// Outcome of comparing desired configuration with an existing container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    Create,
    Start,
    UpToDate,
    Recreate,
    LeaveStale,
}

/// Pure divergence decision for one instance slot.
pub fn plan(
    desired: &Fingerprint,
    existing: Option<&ContainerRecord>,
    policy: RecreatePolicy,
    want_running: bool,
) -> Divergence {
    let Some(record) = existing else {
        return Divergence::Create;
    };
    if policy.force_recreate {
        return Divergence::Recreate;
    }
    let fingerprints_match = record.fingerprint().as_ref() == Some(desired);
    if fingerprints_match {
        if want_running && !record.status.is_running() {
            Divergence::Start
        } else {
            Divergence::UpToDate
        }
    } else if policy.no_recreate {
        Divergence::LeaveStale
    } else {
        Divergence::Recreate
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConvergeOptions {
    pub policy: RecreatePolicy,
    /// Whether the instance must end up running (false for create-only).
    pub start: bool,
    /// Operation-level stop timeout; overrides the service grace period.
    pub timeout: Option<Duration>,
}

impl Default for ConvergeOptions {
    fn default() -> Self {
        Self {
            policy: RecreatePolicy::default(),
            start: true,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    Created,
    Started,
    Recreated,
    UpToDate,
    LeftStale,
}

#[derive(Debug, Clone)]
pub struct InstanceOutcome {
    pub id: ContainerId,
    pub name: String,
    pub action: InstanceAction,
}

/// Politely stop a container, escalating to kill once the grace period
/// elapses without the engine confirming exit. The escalation is logged,
/// never surfaced as an error.
pub fn stop_with_grace(
    engine: &dyn ContainerEngine,
    record: &ContainerRecord,
    stop_signal: Option<&str>,
    grace: Duration,
) -> Result<(), CoreError> {
    if !record.status.is_running() {
        return Ok(());
    }
    engine.stop_container(&record.id, stop_signal)?;
    if engine.wait_container(&record.id, grace)? {
        return Ok(());
    }
    warn!(
        "container {} did not exit within {}s, killing",
        record.name,
        grace.as_secs()
    );
    engine.kill_container(&record.id)?;
    engine.wait_container(&record.id, grace)?;
    Ok(())
}

pub struct Reconciler<'a> {
    project: &'a Project,
    engine: &'a dyn ContainerEngine,
}

impl<'a> Reconciler<'a> {
    pub fn new(project: &'a Project, engine: &'a dyn ContainerEngine) -> Self {
        Self { project, engine }
    }

    /// Engine-side name for a declared network.
    pub fn network_engine_name(&self, declared: &str) -> String {
        match self.project.networks.get(declared) {
            Some(decl) if decl.external => decl
                .external_name
                .clone()
                .unwrap_or_else(|| declared.to_owned()),
            _ => format!("{}_{declared}", self.project.name),
        }
    }

    /// Engine-side name for a declared volume.
    pub fn volume_engine_name(&self, declared: &str) -> String {
        match self.project.volumes.get(declared) {
            Some(decl) if decl.external => decl
                .external_name
                .clone()
                .unwrap_or_else(|| declared.to_owned()),
            _ => format!("{}_{declared}", self.project.name),
        }
    }

    /// Verify external networks/volumes exist and create project-owned ones.
    ///
    /// A missing external resource aborts before any container for the
    /// project is touched.
    pub fn ensure_resources(&self) -> Result<(), CoreError> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_PROJECT.to_owned(), self.project.name.to_string());

        for (name, decl) in &self.project.networks {
            let engine_name = self.network_engine_name(name);
            if decl.external {
                if !self.engine.network_exists(&engine_name)? {
                    return Err(CoreError::ExternalResourceMissing {
                        kind: "network".to_owned(),
                        name: engine_name,
                    });
                }
                continue;
            }
            if !self.engine.network_exists(&engine_name)? {
                info!("creating network {engine_name}");
                self.engine.create_network(&NetworkSpec {
                    name: engine_name,
                    driver: decl.driver.clone(),
                    options: decl.options.clone(),
                    labels: labels.clone(),
                    ipam_pools: decl
                        .ipam
                        .as_ref()
                        .map(|ipam| {
                            ipam.pools
                                .iter()
                                .map(|pool| (pool.subnet.clone(), pool.gateway.clone()))
                                .collect()
                        })
                        .unwrap_or_default(),
                })?;
            }
        }

        for (name, decl) in &self.project.volumes {
            let engine_name = self.volume_engine_name(name);
            if decl.external {
                if !self.engine.volume_exists(&engine_name)? {
                    return Err(CoreError::ExternalResourceMissing {
                        kind: "volume".to_owned(),
                        name: engine_name,
                    });
                }
                continue;
            }
            if !self.engine.volume_exists(&engine_name)? {
                info!("creating volume {engine_name}");
                self.engine.create_volume(&VolumeSpec {
                    name: engine_name,
                    driver: decl.driver.clone(),
                    options: decl.options.clone(),
                    labels: labels.clone(),
                })?;
            }
        }
        Ok(())
    }

    /// Containers belonging to one service, optionally restricted by the
    /// one-off flag.
    pub fn service_containers(
        &self,
        service: &ServiceName,
        one_off: Option<bool>,
        all: bool,
    ) -> Result<Vec<ContainerRecord>, CoreError> {
        let mut filter = LabelFilter::new()
            .with(LABEL_PROJECT, self.project.name.to_string())
            .with(LABEL_SERVICE, service.to_string());
        if let Some(flag) = one_off {
            filter = filter.with(LABEL_ONE_OFF, flag.to_string());
        }
        Ok(self.engine.list_containers(&filter, all)?)
    }

    /// Every container carrying this project's label.
    pub fn project_containers(&self, all: bool) -> Result<Vec<ContainerRecord>, CoreError> {
        let filter = LabelFilter::new().with(LABEL_PROJECT, self.project.name.to_string());
        Ok(self.engine.list_containers(&filter, all)?)
    }

    fn find_instance(
        &self,
        service: &ServiceName,
        number: u32,
    ) -> Result<Option<ContainerRecord>, CoreError> {
        Ok(self
            .service_containers(service, Some(false), true)?
            .into_iter()
            .find(|record| record.number() == Some(number)))
    }

    /// Converge one numbered instance of a service.
    pub fn converge_instance(
        &self,
        service: &ServiceDescriptor,
        number: u32,
        options: &ConvergeOptions,
    ) -> Result<InstanceOutcome, CoreError> {
        options.policy.validate()?;
        let fingerprint = compute_fingerprint(service).map_err(CoreError::Config)?;
        let existing = self.find_instance(&service.name, number)?;
        let decision = plan(&fingerprint, existing.as_ref(), options.policy, options.start);
        debug!(
            "service {} #{number}: {:?}",
            service.name, decision
        );

        match decision {
            Divergence::Create => {
                let spec = self.create_spec(service, number, false, &fingerprint, None)?;
                let name = spec.name.clone();
                let id = self.engine.create_container(&spec)?;
                if options.start {
                    self.engine.start_container(&id)?;
                }
                Ok(InstanceOutcome {
                    id,
                    name,
                    action: InstanceAction::Created,
                })
            }
            Divergence::Start => {
                let record = existing.unwrap_or_else(|| unreachable!("plan requires a record"));
                self.engine.start_container(&record.id)?;
                Ok(InstanceOutcome {
                    id: record.id,
                    name: record.name,
                    action: InstanceAction::Started,
                })
            }
            Divergence::UpToDate => {
                let record = existing.unwrap_or_else(|| unreachable!("plan requires a record"));
                Ok(InstanceOutcome {
                    id: record.id,
                    name: record.name,
                    action: InstanceAction::UpToDate,
                })
            }
            Divergence::LeaveStale => {
                let record = existing.unwrap_or_else(|| unreachable!("plan requires a record"));
                warn!(
                    "service {} #{number} has drifted but recreation is disabled",
                    service.name
                );
                Ok(InstanceOutcome {
                    id: record.id,
                    name: record.name,
                    action: InstanceAction::LeftStale,
                })
            }
            Divergence::Recreate => {
                let record = existing.unwrap_or_else(|| unreachable!("plan requires a record"));
                self.recreate_instance(service, number, record, &fingerprint, options)
            }
        }
    }

    /// Replace an existing container with one built from the new descriptor.
    ///
    /// The old container is renamed aside so the replacement takes the
    /// canonical name; anonymous volume sources carry forward by target path
    /// before the old container is stopped and removed. The replacement
    /// always has a new identity.
    fn recreate_instance(
        &self,
        service: &ServiceDescriptor,
        number: u32,
        old: ContainerRecord,
        fingerprint: &Fingerprint,
        options: &ConvergeOptions,
    ) -> Result<InstanceOutcome, CoreError> {
        let staging: String = format!(
            "{}_old_{}",
            old.name,
            old.id.as_str().chars().take(12).collect::<String>()
        );
        self.engine.rename_container(&old.id, &staging)?;

        let mut spec = self.create_spec(service, number, false, fingerprint, None)?;
        for mount in &mut spec.mounts {
            if mount.source.is_none() {
                if let Some(source) = old.mounts.get(&mount.target) {
                    mount.source = Some(source.clone());
                }
            }
        }

        let name = spec.name.clone();
        let id = match self.engine.create_container(&spec) {
            Ok(id) => id,
            Err(e) => {
                // Put the old container back under its canonical name.
                let _ = self.engine.rename_container(&old.id, &old.name);
                return Err(e.into());
            }
        };

        let grace = options
            .timeout
            .unwrap_or_else(|| Duration::from_secs(service.stop_grace_period_secs));
        stop_with_grace(self.engine, &old, service.stop_signal.as_deref(), grace)?;
        self.engine.remove_container(&old.id, false)?;

        if options.start {
            self.engine.start_container(&id)?;
        }
        info!("recreated {name} ({} -> {})", old.id, id);
        Ok(InstanceOutcome {
            id,
            name,
            action: InstanceAction::Recreated,
        })
    }

    /// Create (without starting) a fresh one-off container for `run`.
    /// One-off containers are never compared or recreated.
    pub fn create_one_off(
        &self,
        service: &ServiceDescriptor,
        command_override: Option<Command>,
    ) -> Result<InstanceOutcome, CoreError> {
        let number = self
            .service_containers(&service.name, Some(true), true)?
            .iter()
            .filter_map(ContainerRecord::number)
            .max()
            .unwrap_or(0)
            + 1;
        let fingerprint = compute_fingerprint(service).map_err(CoreError::Config)?;
        let spec = self.create_spec(service, number, true, &fingerprint, command_override)?;
        let name = spec.name.clone();
        let id = self.engine.create_container(&spec)?;
        Ok(InstanceOutcome {
            id,
            name,
            action: InstanceAction::Created,
        })
    }

    fn create_spec(
        &self,
        service: &ServiceDescriptor,
        number: u32,
        one_off: bool,
        fingerprint: &Fingerprint,
        command_override: Option<Command>,
    ) -> Result<CreateSpec, CoreError> {
        let name = container_name(&self.project.name, &service.name, number, one_off);

        let network_mode = match &service.network_mode {
            NetworkMode::Bridge => None,
            NetworkMode::Host => Some("host".to_owned()),
            NetworkMode::None => Some("none".to_owned()),
            NetworkMode::Container(id) => Some(format!("container:{id}")),
            NetworkMode::Service(dependency) => {
                let target = self
                    .service_containers(dependency, Some(false), true)?
                    .into_iter()
                    .min_by_key(|record| record.number().unwrap_or(u32::MAX))
                    .ok_or_else(|| CoreError::DependencyUnavailable {
                        service: service.name.to_string(),
                        dependency: dependency.to_string(),
                    })?;
                Some(format!("container:{}", target.id))
            }
        };

        let mut volumes_from = Vec::new();
        for reference in &service.volumes_from {
            let donors = self.service_containers(&reference.service, Some(false), true)?;
            if donors.is_empty() {
                return Err(CoreError::DependencyUnavailable {
                    service: service.name.to_string(),
                    dependency: reference.service.to_string(),
                });
            }
            volumes_from.extend(donors.into_iter().map(|record| record.id));
        }

        let mounts = service
            .volumes
            .iter()
            .map(|mount| {
                let mut mount = mount.clone();
                if let Some(source) = &mount.source {
                    if !mount.is_host_path() {
                        mount.source = Some(self.volume_engine_name(source));
                    }
                }
                mount
            })
            .collect();

        let networks = service
            .networks
            .iter()
            .map(|(declared, attachment)| (self.network_engine_name(declared), attachment.clone()))
            .collect();

        let restart = match &service.restart {
            RestartPolicy::No => None,
            RestartPolicy::Always => Some("always".to_owned()),
            RestartPolicy::UnlessStopped => Some("unless-stopped".to_owned()),
            RestartPolicy::OnFailure { max_retries: None } => Some("on-failure".to_owned()),
            RestartPolicy::OnFailure {
                max_retries: Some(retries),
            } => Some(format!("on-failure:{retries}")),
        };

        Ok(CreateSpec {
            name,
            image: service.image_or_build_tag(&self.project.name),
            command: command_override.or_else(|| service.command.clone()),
            entrypoint: service.entrypoint.clone(),
            env: service.environment.clone(),
            labels: instance_labels(
                &self.project.name,
                &service.name,
                number,
                one_off,
                fingerprint,
                &service.labels,
            ),
            ports: service.ports.clone(),
            mounts,
            volumes_from,
            networks,
            network_mode,
            restart,
            stop_signal: service.stop_signal.clone(),
            devices: service.devices.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_runtime::{ContainerStatus, MockEngine};
    use flotilla_schema::{parse_document_str, ProjectName};

    fn project(yaml: &str) -> Project {
        let doc = parse_document_str(yaml).unwrap();
        let mut registry = BTreeMap::new();
        registry.insert("f.yml".to_owned(), doc);
        Project::resolve(
            ProjectName::new("demo"),
            &["f.yml".to_owned()],
            &registry,
            &BTreeMap::new(),
        )
        .unwrap()
        .project
    }

    const SIMPLE: &str = "services:\n  web:\n    image: busybox\n    command: top\n";

    #[test]
    fn container_names_follow_the_convention() {
        let project_name = ProjectName::new("demo");
        let service = ServiceName::new("web");
        assert_eq!(container_name(&project_name, &service, 1, false), "demo_web_1");
        assert_eq!(
            container_name(&project_name, &service, 2, true),
            "demo_web_run_2"
        );
    }

    #[test]
    fn conflicting_recreate_flags_rejected_before_engine_calls() {
        let policy = RecreatePolicy {
            force_recreate: true,
            no_recreate: true,
        };
        assert!(matches!(
            policy.validate(),
            Err(CoreError::Config(ConfigError::MutuallyExclusive { .. }))
        ));
    }

    #[test]
    fn plan_decision_table() {
        let desired = Fingerprint::new("aaa");
        let record = |fp: &str, status: ContainerStatus| ContainerRecord {
            id: ContainerId::new("c1"),
            name: "demo_web_1".to_owned(),
            image: "busybox".to_owned(),
            status,
            labels: {
                let mut l = BTreeMap::new();
                l.insert(flotilla_schema::LABEL_CONFIG_HASH.to_owned(), fp.to_owned());
                l
            },
            mounts: BTreeMap::new(),
            exit_code: None,
        };
        let default = RecreatePolicy::default();

        assert_eq!(plan(&desired, None, default, true), Divergence::Create);
        assert_eq!(
            plan(&desired, Some(&record("aaa", ContainerStatus::Running)), default, true),
            Divergence::UpToDate
        );
        assert_eq!(
            plan(&desired, Some(&record("aaa", ContainerStatus::Exited)), default, true),
            Divergence::Start
        );
        assert_eq!(
            plan(&desired, Some(&record("aaa", ContainerStatus::Exited)), default, false),
            Divergence::UpToDate
        );
        assert_eq!(
            plan(&desired, Some(&record("bbb", ContainerStatus::Running)), default, true),
            Divergence::Recreate
        );
        assert_eq!(
            plan(
                &desired,
                Some(&record("bbb", ContainerStatus::Running)),
                RecreatePolicy {
                    no_recreate: true,
                    ..RecreatePolicy::default()
                },
                true
            ),
            Divergence::LeaveStale
        );
        assert_eq!(
            plan(
                &desired,
                Some(&record("aaa", ContainerStatus::Running)),
                RecreatePolicy {
                    force_recreate: true,
                    ..RecreatePolicy::default()
                },
                true
            ),
            Divergence::Recreate
        );
    }

    #[test]
    fn converge_creates_and_starts() {
        let project = project(SIMPLE);
        let engine = MockEngine::new();
        let reconciler = Reconciler::new(&project, &engine);
        let service = project.service("web").unwrap();

        let outcome = reconciler
            .converge_instance(service, 1, &ConvergeOptions::default())
            .unwrap();
        assert_eq!(outcome.action, InstanceAction::Created);
        assert_eq!(outcome.name, "demo_web_1");
        assert_eq!(
            engine.inspect_container(&outcome.id).unwrap().status,
            ContainerStatus::Running
        );
    }

    #[test]
    fn converge_twice_is_a_noop() {
        let project = project(SIMPLE);
        let engine = MockEngine::new();
        let reconciler = Reconciler::new(&project, &engine);
        let service = project.service("web").unwrap();

        let first = reconciler
            .converge_instance(service, 1, &ConvergeOptions::default())
            .unwrap();
        let second = reconciler
            .converge_instance(service, 1, &ConvergeOptions::default())
            .unwrap();
        assert_eq!(second.action, InstanceAction::UpToDate);
        assert_eq!(first.id, second.id);
        // Exactly one create happened.
        let creates = engine
            .operations()
            .iter()
            .filter(|op| op.starts_with("create "))
            .count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn changed_config_recreates_with_new_identity() {
        let before = project(SIMPLE);
        let engine = MockEngine::new();
        let service = before.service("web").unwrap().clone();
        let first = Reconciler::new(&before, &engine)
            .converge_instance(&service, 1, &ConvergeOptions::default())
            .unwrap();

        let after = project("services:\n  web:\n    image: busybox\n    command: sleep\n");
        let changed = after.service("web").unwrap();
        let second = Reconciler::new(&after, &engine)
            .converge_instance(changed, 1, &ConvergeOptions::default())
            .unwrap();

        assert_eq!(second.action, InstanceAction::Recreated);
        assert_ne!(first.id, second.id);
        assert_eq!(second.name, "demo_web_1");
        // The old container is gone.
        assert!(engine.inspect_container(&first.id).is_err());
        let record = engine.inspect_container(&second.id).unwrap();
        assert_eq!(record.status, ContainerStatus::Running);
    }

    #[test]
    fn no_recreate_leaves_stale_container_running() {
        let before = project(SIMPLE);
        let engine = MockEngine::new();
        let service = before.service("web").unwrap().clone();
        let first = Reconciler::new(&before, &engine)
            .converge_instance(&service, 1, &ConvergeOptions::default())
            .unwrap();

        let after = project("services:\n  web:\n    image: busybox\n    command: sleep\n");
        let options = ConvergeOptions {
            policy: RecreatePolicy {
                no_recreate: true,
                ..RecreatePolicy::default()
            },
            ..ConvergeOptions::default()
        };
        let second = Reconciler::new(&after, &engine)
            .converge_instance(after.service("web").unwrap(), 1, &options)
            .unwrap();
        assert_eq!(second.action, InstanceAction::LeftStale);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn force_recreate_replaces_identical_container() {
        let project = project(SIMPLE);
        let engine = MockEngine::new();
        let reconciler = Reconciler::new(&project, &engine);
        let service = project.service("web").unwrap();

        let first = reconciler
            .converge_instance(service, 1, &ConvergeOptions::default())
            .unwrap();
        let options = ConvergeOptions {
            policy: RecreatePolicy {
                force_recreate: true,
                ..RecreatePolicy::default()
            },
            ..ConvergeOptions::default()
        };
        let second = reconciler.converge_instance(service, 1, &options).unwrap();
        assert_eq!(second.action, InstanceAction::Recreated);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn recreate_carries_anonymous_volumes_forward() {
        let before = project(
            "services:\n  db:\n    image: busybox\n    volumes:\n      - /data\n",
        );
        let engine = MockEngine::new();
        let service = before.service("db").unwrap().clone();
        let first = Reconciler::new(&before, &engine)
            .converge_instance(&service, 1, &ConvergeOptions::default())
            .unwrap();
        let old_source = engine
            .inspect_container(&first.id)
            .unwrap()
            .mounts
            .get("/data")
            .cloned()
            .unwrap();

        let after = project(
            "services:\n  db:\n    image: busybox\n    command: serve\n    volumes:\n      - /data\n",
        );
        let second = Reconciler::new(&after, &engine)
            .converge_instance(after.service("db").unwrap(), 1, &ConvergeOptions::default())
            .unwrap();
        let new_source = engine
            .inspect_container(&second.id)
            .unwrap()
            .mounts
            .get("/data")
            .cloned()
            .unwrap();
        assert_eq!(old_source, new_source);
    }

    #[test]
    fn ensure_resources_creates_project_owned_and_checks_external() {
        let project = project(
            "services:\n  web:\n    image: busybox\n    networks: [front, shared]\nnetworks:\n  front:\n  shared:\n    external: true\nvolumes:\n  data:\n",
        );
        let engine = MockEngine::new();
        let reconciler = Reconciler::new(&project, &engine);

        // External network missing: abort before anything is created.
        let err = reconciler.ensure_resources().unwrap_err();
        assert!(matches!(err, CoreError::ExternalResourceMissing { .. }));

        engine.add_preexisting_network("shared");
        reconciler.ensure_resources().unwrap();
        assert!(engine.network_exists("demo_front").unwrap());
        assert!(engine.volume_exists("demo_data").unwrap());
        // The external network is used under its own name, never scoped.
        assert!(!engine.network_exists("demo_shared").unwrap());

        // Idempotent on a second pass.
        reconciler.ensure_resources().unwrap();
    }

    #[test]
    fn one_off_containers_number_independently() {
        let project = project(SIMPLE);
        let engine = MockEngine::new();
        let reconciler = Reconciler::new(&project, &engine);
        let service = project.service("web").unwrap();

        reconciler
            .converge_instance(service, 1, &ConvergeOptions::default())
            .unwrap();
        let first = reconciler.create_one_off(service, None).unwrap();
        let second = reconciler.create_one_off(service, None).unwrap();
        assert_eq!(first.name, "demo_web_run_1");
        assert_eq!(second.name, "demo_web_run_2");
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn stubborn_container_is_killed_after_grace() {
        let project = project(SIMPLE);
        let engine = MockEngine::new();
        engine.set_stubborn("web");
        let reconciler = Reconciler::new(&project, &engine);
        let service = project.service("web").unwrap();
        let outcome = reconciler
            .converge_instance(service, 1, &ConvergeOptions::default())
            .unwrap();

        let record = engine.inspect_container(&outcome.id).unwrap();
        stop_with_grace(&engine, &record, None, Duration::from_millis(10)).unwrap();
        let record = engine.inspect_container(&outcome.id).unwrap();
        assert_eq!(record.status, ContainerStatus::Exited);
        assert_eq!(record.exit_code, Some(137));
        let ops = engine.operations();
        assert!(ops.contains(&"stop demo_web_1".to_owned()));
        assert!(ops.contains(&"kill demo_web_1".to_owned()));
    }
}
