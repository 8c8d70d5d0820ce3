//! Dependency-ordered operation scheduling with bounded parallelism.
//!
//! The scheduler walks the service graph with a fixed-size worker pool:
//! services with no dependency relationship converge concurrently, a service
//! runs only after everything it depends on succeeded, and a failure skips
//! the failed service's transitive dependents while independent branches
//! continue. The project and graph are read-only during a walk; the only
//! shared mutable state is the outcome map behind the walk lock.

use crate::graph::DependencyGraph;
use crate::reconcile::{
    stop_with_grace, ConvergeOptions, InstanceAction, Reconciler, RecreatePolicy,
};
use crate::signal::SignalCoordinator;
use crate::CoreError;
use flotilla_runtime::{ContainerEngine, ContainerRecord, EventAction, LabelFilter};
use flotilla_schema::{
    Command, ConfigError, ContainerId, Project, ServiceDescriptor, ServiceName, LABEL_PROJECT,
    LABEL_SERVICE,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default worker pool size; unbounded parallelism would overwhelm the engine.
pub const DEFAULT_PARALLELISM: usize = 4;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ServiceOutcome {
    /// The service reached the requested state.
    Converged { containers: Vec<String> },
    /// Nothing to act on; reported as a user error, does not abort others.
    NoContainers,
    /// Not attempted because a (transitive) dependency failed.
    Skipped { blocked_on: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OperationReport {
    pub outcomes: BTreeMap<ServiceName, ServiceOutcome>,
}

impl OperationReport {
    pub fn ok(&self) -> bool {
        self.outcomes
            .values()
            .all(|outcome| matches!(outcome, ServiceOutcome::Converged { .. }))
    }

    /// 0 on full success, 1 when any per-service outcome failed.
    pub fn exit_code(&self) -> u8 {
        u8::from(!self.ok())
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    /// Target services; empty means the whole project.
    pub services: Vec<ServiceName>,
    /// Restrict traversal to exactly the targets, skipping dependencies.
    pub no_deps: bool,
    pub policy: RecreatePolicy,
    pub detached: bool,
    /// Bring the whole project down once any root container exits.
    pub abort_on_exit: bool,
    /// Cascade recreation to dependents of a recreated dependency.
    pub recreate_dependents: bool,
    pub remove_orphans: bool,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImageRemoval {
    #[default]
    None,
    /// Only images the project built itself.
    Local,
    All,
}

#[derive(Debug, Clone, Default)]
pub struct DownOptions {
    pub remove_images: ImageRemoval,
    pub remove_volumes: bool,
    pub remove_orphans: bool,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub no_deps: bool,
    pub detached: bool,
    /// Remove the one-off container after it exits.
    pub remove: bool,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub id: ContainerId,
    pub container: String,
    pub exit_code: Option<i64>,
}

enum AttachOutcome {
    Interrupted,
    AbortedOnExit,
    AllExited,
}

struct WalkState {
    ready: VecDeque<usize>,
    waiting: BTreeMap<usize, usize>,
    outcomes: BTreeMap<usize, ServiceOutcome>,
    in_flight: usize,
    aborted: bool,
}

pub struct Scheduler<'a> {
    project: &'a Project,
    graph: &'a DependencyGraph,
    engine: &'a dyn ContainerEngine,
    signal: Arc<SignalCoordinator>,
    parallelism: usize,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        project: &'a Project,
        graph: &'a DependencyGraph,
        engine: &'a dyn ContainerEngine,
    ) -> Self {
        Self {
            project,
            graph,
            engine,
            signal: SignalCoordinator::new(),
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    /// Share a process-wide signal coordinator (installed by the binary).
    pub fn with_signal(mut self, signal: Arc<SignalCoordinator>) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn signal(&self) -> &Arc<SignalCoordinator> {
        &self.signal
    }

    /// Create or start containers for the targeted services in dependency
    /// order, reconciling each instance against its fingerprint.
    pub fn up(&self, options: &UpOptions) -> Result<OperationReport, CoreError> {
        options.policy.validate()?;
        let targets = self.select_targets(&options.services, !options.no_deps)?;
        let reconciler = Reconciler::new(self.project, self.engine);
        reconciler.ensure_resources()?;
        if options.remove_orphans {
            self.remove_orphans(&reconciler, options.timeout_secs)?;
        }

        self.signal.begin();
        let recreated: Mutex<BTreeSet<usize>> = Mutex::new(BTreeSet::new());
        let report = self.execute(&targets, false, |node| {
            let descriptor = &self.project.services[node];
            let mut policy = options.policy;
            if options.recreate_dependents && !policy.no_recreate {
                let seen = recreated.lock().unwrap_or_else(|e| e.into_inner());
                if self
                    .graph
                    .dependencies_of(node)
                    .iter()
                    .any(|dep| seen.contains(dep))
                {
                    policy.force_recreate = true;
                }
            }
            let converge = ConvergeOptions {
                policy,
                start: true,
                timeout: options.timeout_secs.map(Duration::from_secs),
            };

            let count = self.desired_count(&reconciler, &descriptor.name)?;
            let mut containers = Vec::with_capacity(count as usize);
            let mut any_recreated = false;
            for number in 1..=count {
                let outcome = reconciler.converge_instance(descriptor, number, &converge)?;
                any_recreated |= outcome.action == InstanceAction::Recreated;
                containers.push(outcome.name);
            }
            if any_recreated {
                recreated
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(node);
            }
            Ok(ServiceOutcome::Converged { containers })
        });

        if self.signal.interrupted() {
            self.shutdown_sweep(options.timeout_secs)?;
            self.signal.finish();
            return Err(CoreError::Interrupted);
        }

        if !options.detached {
            match self.attach(options)? {
                AttachOutcome::Interrupted => {
                    self.shutdown_sweep(options.timeout_secs)?;
                    self.signal.finish();
                    return Err(CoreError::Interrupted);
                }
                AttachOutcome::AbortedOnExit => {
                    self.down(&DownOptions {
                        timeout_secs: options.timeout_secs,
                        ..DownOptions::default()
                    })?;
                }
                AttachOutcome::AllExited => {}
            }
        }

        self.signal.finish();
        Ok(report)
    }

    /// Stop and remove every project container in reverse dependency order,
    /// then optionally remove project-owned networks, volumes, and images.
    pub fn down(&self, options: &DownOptions) -> Result<OperationReport, CoreError> {
        let targets: BTreeSet<usize> = (0..self.graph.len()).collect();
        let reconciler = Reconciler::new(self.project, self.engine);

        let report = self.execute(&targets, true, |node| {
            let descriptor = &self.project.services[node];
            let records = reconciler.service_containers(&descriptor.name, None, true)?;
            let grace = self.grace_for(descriptor, options.timeout_secs);
            let mut containers = Vec::with_capacity(records.len());
            for record in records {
                stop_with_grace(self.engine, &record, descriptor.stop_signal.as_deref(), grace)?;
                self.engine
                    .remove_container(&record.id, options.remove_volumes)?;
                containers.push(record.name);
            }
            Ok(ServiceOutcome::Converged { containers })
        });

        if options.remove_orphans {
            self.remove_orphans(&reconciler, options.timeout_secs)?;
        }

        for (name, decl) in &self.project.networks {
            if decl.external {
                continue;
            }
            let engine_name = reconciler.network_engine_name(name);
            if self.engine.network_exists(&engine_name)? {
                info!("removing network {engine_name}");
                self.engine.remove_network(&engine_name)?;
            }
        }
        if options.remove_volumes {
            for (name, decl) in &self.project.volumes {
                if decl.external {
                    continue;
                }
                let engine_name = reconciler.volume_engine_name(name);
                if self.engine.volume_exists(&engine_name)? {
                    info!("removing volume {engine_name}");
                    self.engine.remove_volume(&engine_name)?;
                }
            }
        }

        let images: BTreeSet<String> = match options.remove_images {
            ImageRemoval::None => BTreeSet::new(),
            ImageRemoval::Local => self
                .project
                .services
                .iter()
                .filter(|service| service.image.is_none())
                .map(|service| service.image_or_build_tag(&self.project.name))
                .collect(),
            ImageRemoval::All => self
                .project
                .services
                .iter()
                .map(|service| service.image_or_build_tag(&self.project.name))
                .collect(),
        };
        for image in images {
            match self.engine.remove_image(&image) {
                Ok(()) | Err(flotilla_runtime::EngineError::NoSuchImage(_)) => {}
                Err(other) => return Err(other.into()),
            }
        }

        Ok(report)
    }

    /// Start existing stopped containers, in dependency order.
    pub fn start(&self, services: &[ServiceName]) -> Result<OperationReport, CoreError> {
        self.apply_to_containers(services, false, "start", |record, _descriptor| {
            if record.status.is_running() {
                return Ok(false);
            }
            self.engine.start_container(&record.id)?;
            Ok(true)
        })
    }

    /// Stop running containers, dependents before dependencies.
    pub fn stop(
        &self,
        services: &[ServiceName],
        timeout_secs: Option<u64>,
    ) -> Result<OperationReport, CoreError> {
        self.apply_to_containers(services, true, "stop", |record, descriptor| {
            if !record.status.is_running() {
                return Ok(false);
            }
            stop_with_grace(
                self.engine,
                record,
                descriptor.stop_signal.as_deref(),
                self.grace_for(descriptor, timeout_secs),
            )?;
            Ok(true)
        })
    }

    /// Kill running containers immediately.
    pub fn kill(&self, services: &[ServiceName]) -> Result<OperationReport, CoreError> {
        self.apply_to_containers(services, true, "kill", |record, _descriptor| {
            if !record.status.is_running() {
                return Ok(false);
            }
            self.engine.kill_container(&record.id)?;
            Ok(true)
        })
    }

    pub fn pause(&self, services: &[ServiceName]) -> Result<OperationReport, CoreError> {
        self.apply_to_containers(services, true, "pause", |record, _descriptor| {
            if record.status != flotilla_runtime::ContainerStatus::Running {
                return Ok(false);
            }
            self.engine.pause_container(&record.id)?;
            Ok(true)
        })
    }

    pub fn unpause(&self, services: &[ServiceName]) -> Result<OperationReport, CoreError> {
        self.apply_to_containers(services, false, "unpause", |record, _descriptor| {
            if record.status != flotilla_runtime::ContainerStatus::Paused {
                return Ok(false);
            }
            self.engine.unpause_container(&record.id)?;
            Ok(true)
        })
    }

    /// Restart existing containers through the engine action.
    pub fn restart(&self, services: &[ServiceName]) -> Result<OperationReport, CoreError> {
        self.apply_to_containers(services, false, "restart", |record, _descriptor| {
            self.engine.restart_container(&record.id)?;
            Ok(true)
        })
    }

    /// Converge numbered instance counts: dense numbering from 1, gaps fill
    /// first on growth, highest numbers remove first on shrink.
    pub fn scale(
        &self,
        counts: &BTreeMap<ServiceName, u32>,
        timeout_secs: Option<u64>,
    ) -> Result<OperationReport, CoreError> {
        let mut targets = BTreeSet::new();
        for name in counts.keys() {
            let node = self
                .graph
                .index_of(name)
                .ok_or_else(|| CoreError::Config(ConfigError::NoSuchService(name.to_string())))?;
            targets.insert(node);
        }
        let reconciler = Reconciler::new(self.project, self.engine);
        reconciler.ensure_resources()?;

        Ok(self.execute(&targets, false, |node| {
            let descriptor = &self.project.services[node];
            let want = counts[&descriptor.name] as usize;
            let mut records = reconciler.service_containers(&descriptor.name, Some(false), true)?;
            records.sort_by_key(|record| record.number().unwrap_or(0));

            while records.len() > want {
                let record = records.pop().unwrap_or_else(|| unreachable!("len checked"));
                debug!("scaling down: removing {}", record.name);
                stop_with_grace(
                    self.engine,
                    &record,
                    descriptor.stop_signal.as_deref(),
                    self.grace_for(descriptor, timeout_secs),
                )?;
                self.engine.remove_container(&record.id, false)?;
            }

            let mut numbers: BTreeSet<u32> =
                records.iter().filter_map(ContainerRecord::number).collect();
            let mut containers: Vec<String> = records.iter().map(|r| r.name.clone()).collect();
            let mut next = 1;
            while numbers.len() < want {
                if numbers.insert(next) {
                    let outcome =
                        reconciler.converge_instance(descriptor, next, &ConvergeOptions::default())?;
                    containers.push(outcome.name);
                }
                next += 1;
            }
            Ok(ServiceOutcome::Converged { containers })
        }))
    }

    /// Create and start one ad-hoc container for a single service, honoring
    /// dependency startup unless `no_deps`.
    pub fn run(
        &self,
        service: &ServiceName,
        command: Option<Command>,
        options: &RunOptions,
    ) -> Result<RunResult, CoreError> {
        let node = self
            .graph
            .index_of(service)
            .ok_or_else(|| CoreError::Config(ConfigError::NoSuchService(service.to_string())))?;
        let descriptor = &self.project.services[node];
        let reconciler = Reconciler::new(self.project, self.engine);
        reconciler.ensure_resources()?;
        self.signal.begin();

        if !options.no_deps {
            let mut seed = BTreeSet::new();
            seed.insert(node);
            let mut dependencies = self.graph.closure_with_dependencies(&seed);
            dependencies.remove(&node);
            if !dependencies.is_empty() {
                let report = self.execute(&dependencies, false, |dep| {
                    let dep_descriptor = &self.project.services[dep];
                    let count = self.desired_count(&reconciler, &dep_descriptor.name)?;
                    let mut containers = Vec::with_capacity(count as usize);
                    for number in 1..=count {
                        let outcome = reconciler.converge_instance(
                            dep_descriptor,
                            number,
                            &ConvergeOptions::default(),
                        )?;
                        containers.push(outcome.name);
                    }
                    Ok(ServiceOutcome::Converged { containers })
                });
                if let Some((failed, outcome)) = report
                    .outcomes
                    .iter()
                    .find(|(_, o)| !matches!(o, ServiceOutcome::Converged { .. }))
                {
                    debug!("dependency {failed} not converged: {outcome:?}");
                    return Err(CoreError::DependencyUnavailable {
                        service: service.to_string(),
                        dependency: failed.to_string(),
                    });
                }
            }
        }
        self.signal.checkpoint()?;

        let outcome = reconciler.create_one_off(descriptor, command)?;
        self.engine.start_container(&outcome.id)?;
        info!("started one-off container {}", outcome.name);

        if options.detached {
            self.signal.finish();
            return Ok(RunResult {
                id: outcome.id,
                container: outcome.name,
                exit_code: None,
            });
        }

        loop {
            if self.signal.interrupted() {
                let record = self.engine.inspect_container(&outcome.id)?;
                if self.signal.forced() {
                    self.engine.kill_container(&record.id)?;
                } else {
                    self.stop_cancellable(
                        &record,
                        descriptor.stop_signal.as_deref(),
                        self.grace_for(descriptor, options.timeout_secs),
                    )?;
                }
                if options.remove {
                    let _ = self.engine.remove_container(&outcome.id, false);
                }
                self.signal.finish();
                return Err(CoreError::Interrupted);
            }
            if self
                .engine
                .wait_container(&outcome.id, Duration::from_millis(250))?
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(25));
        }

        let record = self.engine.inspect_container(&outcome.id)?;
        let exit_code = record.exit_code;
        if options.remove {
            self.engine.remove_container(&outcome.id, false)?;
        }
        self.signal.finish();
        Ok(RunResult {
            id: outcome.id,
            container: outcome.name,
            exit_code,
        })
    }

    fn select_targets(
        &self,
        names: &[ServiceName],
        with_deps: bool,
    ) -> Result<BTreeSet<usize>, CoreError> {
        let mut targets = BTreeSet::new();
        if names.is_empty() {
            targets.extend(0..self.graph.len());
            return Ok(targets);
        }
        for name in names {
            let node = self
                .graph
                .index_of(name)
                .ok_or_else(|| CoreError::Config(ConfigError::NoSuchService(name.to_string())))?;
            targets.insert(node);
        }
        if with_deps {
            targets = self.graph.closure_with_dependencies(&targets);
        }
        Ok(targets)
    }

    fn desired_count(
        &self,
        reconciler: &Reconciler<'_>,
        service: &ServiceName,
    ) -> Result<u32, CoreError> {
        let existing = reconciler.service_containers(service, Some(false), true)?;
        Ok((existing.len() as u32).max(1))
    }

    fn grace_for(&self, descriptor: &ServiceDescriptor, timeout_secs: Option<u64>) -> Duration {
        Duration::from_secs(timeout_secs.unwrap_or(descriptor.stop_grace_period_secs))
    }

    /// Apply one engine action per existing container of each target service.
    /// An empty match is a per-service user error, not an abort.
    fn apply_to_containers<F>(
        &self,
        services: &[ServiceName],
        reverse: bool,
        action: &str,
        apply: F,
    ) -> Result<OperationReport, CoreError>
    where
        F: Fn(&ContainerRecord, &ServiceDescriptor) -> Result<bool, CoreError> + Sync,
    {
        let targets = self.select_targets(services, false)?;
        let reconciler = Reconciler::new(self.project, self.engine);
        Ok(self.execute(&targets, reverse, |node| {
            let descriptor = &self.project.services[node];
            let records = reconciler.service_containers(&descriptor.name, Some(false), true)?;
            let mut containers = Vec::new();
            for record in &records {
                if apply(record, descriptor)? {
                    containers.push(record.name.clone());
                }
            }
            if containers.is_empty() {
                warn!("no containers to {action} for service {}", descriptor.name);
                Ok(ServiceOutcome::NoContainers)
            } else {
                Ok(ServiceOutcome::Converged { containers })
            }
        }))
    }

    /// Stop and remove containers whose service label no longer exists in
    /// the project.
    fn remove_orphans(
        &self,
        reconciler: &Reconciler<'_>,
        timeout_secs: Option<u64>,
    ) -> Result<(), CoreError> {
        let known: BTreeSet<ServiceName> = self.project.service_names().into_iter().collect();
        for record in reconciler.project_containers(true)? {
            let Some(service) = record.service() else {
                continue;
            };
            if known.contains(&service) {
                continue;
            }
            warn!("removing orphan container {}", record.name);
            let grace = Duration::from_secs(
                timeout_secs.unwrap_or(flotilla_schema::DEFAULT_STOP_GRACE_SECS),
            );
            stop_with_grace(self.engine, &record, None, grace)?;
            self.engine.remove_container(&record.id, false)?;
        }
        Ok(())
    }

    /// Block on the project event feed until interrupt, until every project
    /// container has exited, or (with abort-on-exit) until a root container
    /// dies.
    fn attach(&self, options: &UpOptions) -> Result<AttachOutcome, CoreError> {
        let filter = LabelFilter::new().with(LABEL_PROJECT, self.project.name.to_string());
        let subscription = self.engine.subscribe_events(&filter)?;
        let reconciler = Reconciler::new(self.project, self.engine);
        info!("attached to project events; interrupt to stop");
        loop {
            if self.signal.interrupted() {
                return Ok(AttachOutcome::Interrupted);
            }
            let Some(event) = subscription.next_timeout(Duration::from_millis(250)) else {
                continue;
            };
            if event.action != EventAction::Die {
                continue;
            }
            if options.abort_on_exit {
                let is_root = event
                    .labels
                    .get(LABEL_SERVICE)
                    .map(ServiceName::new)
                    .and_then(|name| self.graph.index_of(&name))
                    .is_some_and(|node| self.graph.dependents_of(node).is_empty());
                if is_root {
                    warn!(
                        "container {} exited, bringing the project down",
                        event.container_name
                    );
                    return Ok(AttachOutcome::AbortedOnExit);
                }
            }
            if reconciler.project_containers(false)?.is_empty() {
                info!("all project containers exited");
                return Ok(AttachOutcome::AllExited);
            }
        }
    }

    /// Interrupt sweep: stop every project container in reverse dependency
    /// order, escalating to immediate kills once the force phase is reached.
    fn shutdown_sweep(&self, timeout_secs: Option<u64>) -> Result<(), CoreError> {
        info!("stopping project containers");
        let reconciler = Reconciler::new(self.project, self.engine);
        let mut order = self.graph.topological();
        order.reverse();
        for node in order {
            let descriptor = &self.project.services[node];
            for record in reconciler.service_containers(&descriptor.name, None, false)? {
                if self.signal.forced() {
                    self.engine.kill_container(&record.id)?;
                    continue;
                }
                self.stop_cancellable(
                    &record,
                    descriptor.stop_signal.as_deref(),
                    self.grace_for(descriptor, timeout_secs),
                )?;
            }
        }
        Ok(())
    }

    /// Grace-bounded stop that switches to kill the moment the coordinator
    /// enters the force phase, without waiting out the grace period.
    fn stop_cancellable(
        &self,
        record: &ContainerRecord,
        stop_signal: Option<&str>,
        grace: Duration,
    ) -> Result<(), CoreError> {
        self.engine.stop_container(&record.id, stop_signal)?;
        let deadline = Instant::now() + grace;
        loop {
            if self.signal.forced() {
                self.engine.kill_container(&record.id)?;
                return Ok(());
            }
            if self
                .engine
                .wait_container(&record.id, Duration::from_millis(250))?
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    "container {} did not exit within {}s, killing",
                    record.name,
                    grace.as_secs()
                );
                self.engine.kill_container(&record.id)?;
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(25));
        }
    }

    /// Walk the induced subgraph with the worker pool. `reverse` flips edge
    /// direction so teardown runs dependents-first.
    fn execute<F>(&self, targets: &BTreeSet<usize>, reverse: bool, task: F) -> OperationReport
    where
        F: Fn(usize) -> Result<ServiceOutcome, CoreError> + Sync,
    {
        let total = targets.len();
        if total == 0 {
            return OperationReport::default();
        }
        let prereqs = |node: usize| -> Vec<usize> {
            let edges = if reverse {
                self.graph.dependents_of(node)
            } else {
                self.graph.dependencies_of(node)
            };
            edges
                .iter()
                .copied()
                .filter(|n| targets.contains(n))
                .collect()
        };
        let downstream = |node: usize| -> Vec<usize> {
            let edges = if reverse {
                self.graph.dependencies_of(node)
            } else {
                self.graph.dependents_of(node)
            };
            edges
                .iter()
                .copied()
                .filter(|n| targets.contains(n))
                .collect()
        };

        let mut ready = VecDeque::new();
        let mut waiting = BTreeMap::new();
        for &node in targets {
            let count = prereqs(node).len();
            if count == 0 {
                ready.push_back(node);
            } else {
                waiting.insert(node, count);
            }
        }

        let state = Mutex::new(WalkState {
            ready,
            waiting,
            outcomes: BTreeMap::new(),
            in_flight: 0,
            aborted: false,
        });
        let condvar = Condvar::new();
        let workers = self.parallelism.min(total);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let node = {
                        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
                        loop {
                            if guard.aborted || guard.outcomes.len() == total {
                                return;
                            }
                            if self.signal.interrupted() {
                                guard.aborted = true;
                                condvar.notify_all();
                                return;
                            }
                            if let Some(node) = guard.ready.pop_front() {
                                guard.in_flight += 1;
                                break node;
                            }
                            guard = condvar.wait(guard).unwrap_or_else(|e| e.into_inner());
                        }
                    };

                    let result = task(node);

                    let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
                    guard.in_flight -= 1;
                    match result {
                        Ok(outcome) => {
                            let unblocks =
                                !matches!(outcome, ServiceOutcome::Failed { .. });
                            guard.outcomes.insert(node, outcome);
                            if unblocks {
                                for next in downstream(node) {
                                    if let Some(count) = guard.waiting.get_mut(&next) {
                                        *count -= 1;
                                        if *count == 0 {
                                            guard.waiting.remove(&next);
                                            guard.ready.push_back(next);
                                        }
                                    }
                                }
                            } else {
                                skip_downstream(&mut guard, node, self.graph, &downstream);
                            }
                        }
                        Err(CoreError::Interrupted) => {
                            guard.aborted = true;
                        }
                        Err(error) => {
                            warn!(
                                "service {} failed: {error}",
                                self.graph.name_of(node)
                            );
                            guard.outcomes.insert(
                                node,
                                ServiceOutcome::Failed {
                                    error: error.to_string(),
                                },
                            );
                            skip_downstream(&mut guard, node, self.graph, &downstream);
                        }
                    }
                    condvar.notify_all();
                });
            }
        });

        let state = state.into_inner().unwrap_or_else(|e| e.into_inner());
        OperationReport {
            outcomes: state
                .outcomes
                .into_iter()
                .map(|(node, outcome)| (self.graph.name_of(node).clone(), outcome))
                .collect(),
        }
    }
}

/// Mark everything downstream of a failed node as skipped, transitively.
fn skip_downstream(
    state: &mut WalkState,
    failed: usize,
    graph: &DependencyGraph,
    downstream: &dyn Fn(usize) -> Vec<usize>,
) {
    let blocked_on = graph.name_of(failed).to_string();
    let mut queue: VecDeque<usize> = downstream(failed).into();
    let mut seen = BTreeSet::new();
    while let Some(next) = queue.pop_front() {
        if !seen.insert(next) {
            continue;
        }
        if state.waiting.remove(&next).is_some() {
            state.outcomes.insert(
                next,
                ServiceOutcome::Skipped {
                    blocked_on: blocked_on.clone(),
                },
            );
            queue.extend(downstream(next));
        }
    }
}
