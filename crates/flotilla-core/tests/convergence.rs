//! End-to-end convergence behavior against the mock engine.

use flotilla_core::{
    DependencyGraph, DownOptions, RecreatePolicy, RunOptions, Scheduler, ServiceOutcome,
    SignalCoordinator, UpOptions,
};
use flotilla_runtime::{
    ContainerEngine, ContainerRecord, ContainerStatus, CreateSpec, EngineError, EventSubscription,
    LabelFilter, MockEngine, NetworkSpec, VolumeSpec,
};
use flotilla_schema::{parse_document_str, ContainerId, Project, ProjectName, ServiceName};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

fn project(yaml: &str) -> Project {
    let doc = parse_document_str(yaml).unwrap();
    let mut registry = BTreeMap::new();
    registry.insert("flotilla.yml".to_owned(), doc);
    Project::resolve(
        ProjectName::new("demo"),
        &["flotilla.yml".to_owned()],
        &registry,
        &BTreeMap::new(),
    )
    .unwrap()
    .project
}

fn detached() -> UpOptions {
    UpOptions {
        detached: true,
        ..UpOptions::default()
    }
}

const TWO_SERVICES: &str =
    "services:\n  simple:\n    image: busybox\n    command: top\n  another:\n    image: busybox\n";

#[test]
fn up_creates_named_containers_and_down_removes_them() {
    let project = project(TWO_SERVICES);
    let graph = DependencyGraph::build(&project).unwrap();
    let engine = MockEngine::new();
    let scheduler = Scheduler::new(&project, &graph, &engine);

    let report = scheduler.up(&detached()).unwrap();
    assert!(report.ok());
    let filter = LabelFilter::new().with(flotilla_schema::LABEL_PROJECT, "demo");
    let records = engine.list_containers(&filter, true).unwrap();
    assert_eq!(records.len(), 2);
    let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["demo_another_1", "demo_simple_1"]);
    assert!(records.iter().all(|r| r.status == ContainerStatus::Running));
    let first_fingerprints: BTreeMap<String, _> = records
        .iter()
        .map(|r| (r.name.clone(), r.fingerprint().unwrap()))
        .collect();
    let first_ids: BTreeMap<String, _> = records
        .iter()
        .map(|r| (r.name.clone(), r.id.clone()))
        .collect();

    scheduler.down(&DownOptions::default()).unwrap();
    assert!(engine.list_containers(&filter, true).unwrap().is_empty());

    // A fresh up creates new identities with identical fingerprints.
    scheduler.up(&detached()).unwrap();
    let records = engine.list_containers(&filter, true).unwrap();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(
            record.fingerprint().unwrap(),
            first_fingerprints[&record.name]
        );
        assert_ne!(record.id, first_ids[&record.name]);
    }
}

#[test]
fn up_twice_creates_nothing_new() {
    let project = project(TWO_SERVICES);
    let graph = DependencyGraph::build(&project).unwrap();
    let engine = MockEngine::new();
    let scheduler = Scheduler::new(&project, &graph, &engine);

    scheduler.up(&detached()).unwrap();
    let creates_after_first = engine
        .operations()
        .iter()
        .filter(|op| op.starts_with("create "))
        .count();

    scheduler.up(&detached()).unwrap();
    let creates_after_second = engine
        .operations()
        .iter()
        .filter(|op| op.starts_with("create "))
        .count();
    assert_eq!(creates_after_first, creates_after_second);
}

#[test]
fn changed_service_recreates_only_itself() {
    let before = project(TWO_SERVICES);
    let graph = DependencyGraph::build(&before).unwrap();
    let engine = MockEngine::new();
    Scheduler::new(&before, &graph, &engine)
        .up(&detached())
        .unwrap();

    let after = project(
        "services:\n  simple:\n    image: busybox\n    command: sleep\n  another:\n    image: busybox\n",
    );
    let graph = DependencyGraph::build(&after).unwrap();
    Scheduler::new(&after, &graph, &engine)
        .up(&detached())
        .unwrap();

    let ops = engine.operations();
    let simple_creates = ops.iter().filter(|op| *op == "create demo_simple_1").count();
    let another_creates = ops
        .iter()
        .filter(|op| *op == "create demo_another_1")
        .count();
    assert_eq!(simple_creates, 2, "changed service must recreate");
    assert_eq!(another_creates, 1, "unchanged service must be untouched");
}

#[test]
fn dependency_ordering_holds_for_up_and_down() {
    let project = project(
        "services:\n  db:\n    image: busybox\n  web:\n    image: busybox\n    depends_on: [db]\n",
    );
    let graph = DependencyGraph::build(&project).unwrap();
    let engine = MockEngine::new();
    let scheduler = Scheduler::new(&project, &graph, &engine);

    scheduler.up(&detached()).unwrap();
    let ops = engine.operations();
    let pos = |needle: &str| ops.iter().position(|op| op == needle).unwrap();
    assert!(
        pos("start demo_db_1") < pos("create demo_web_1"),
        "web must not be touched before db is running: {ops:?}"
    );

    scheduler.down(&DownOptions::default()).unwrap();
    let ops = engine.operations();
    let pos = |needle: &str| ops.iter().position(|op| op == needle).unwrap();
    assert!(
        pos("stop demo_web_1") < pos("stop demo_db_1"),
        "dependents must stop before dependencies: {ops:?}"
    );
}

#[test]
fn failed_dependency_skips_dependents_but_not_independents() {
    let project = project(
        "services:\n  db:\n    image: busybox\n  web:\n    image: busybox\n    depends_on: [db]\n  lone:\n    image: busybox\n",
    );
    let graph = DependencyGraph::build(&project).unwrap();
    let engine = MockEngine::new();
    engine.fail_create_matching("db");
    let scheduler = Scheduler::new(&project, &graph, &engine);

    let report = scheduler.up(&detached()).unwrap();
    assert!(!report.ok());
    assert!(matches!(
        report.outcomes[&ServiceName::new("db")],
        ServiceOutcome::Failed { .. }
    ));
    assert!(matches!(
        report.outcomes[&ServiceName::new("web")],
        ServiceOutcome::Skipped { ref blocked_on } if blocked_on == "db"
    ));
    assert!(matches!(
        report.outcomes[&ServiceName::new("lone")],
        ServiceOutcome::Converged { .. }
    ));
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn scale_converges_to_requested_counts() {
    let project = project("services:\n  worker:\n    image: busybox\n");
    let graph = DependencyGraph::build(&project).unwrap();
    let engine = MockEngine::new();
    let scheduler = Scheduler::new(&project, &graph, &engine);

    let worker = ServiceName::new("worker");
    let mut counts = BTreeMap::new();
    counts.insert(worker.clone(), 3);
    scheduler.scale(&counts, None).unwrap();

    let filter = LabelFilter::new().with(flotilla_schema::LABEL_PROJECT, "demo");
    let names: Vec<String> = engine
        .list_containers(&filter, true)
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["demo_worker_1", "demo_worker_2", "demo_worker_3"]);

    // Shrink removes the highest-numbered instances first.
    counts.insert(worker.clone(), 1);
    scheduler.scale(&counts, None).unwrap();
    let names: Vec<String> = engine
        .list_containers(&filter, true)
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["demo_worker_1"]);
    let ops = engine.operations();
    let removed: Vec<&String> = ops.iter().filter(|op| op.starts_with("remove ")).collect();
    assert_eq!(removed, vec!["remove demo_worker_3", "remove demo_worker_2"]);

    // Growing again fills densely from 1.
    counts.insert(worker, 2);
    scheduler.scale(&counts, None).unwrap();
    let names: Vec<String> = engine
        .list_containers(&filter, true)
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["demo_worker_1", "demo_worker_2"]);
}

#[test]
fn run_creates_one_off_after_dependencies() {
    let project = project(
        "services:\n  db:\n    image: busybox\n  job:\n    image: busybox\n    depends_on: [db]\n",
    );
    let graph = DependencyGraph::build(&project).unwrap();
    let engine = MockEngine::new();
    let scheduler = Scheduler::new(&project, &graph, &engine);

    let result = scheduler
        .run(
            &ServiceName::new("job"),
            Some(flotilla_schema::Command::Shell("echo hi".to_owned())),
            &RunOptions {
                detached: true,
                ..RunOptions::default()
            },
        )
        .unwrap();
    assert_eq!(result.container, "demo_job_run_1");

    let ops = engine.operations();
    let pos = |needle: &str| ops.iter().position(|op| op == needle).unwrap();
    assert!(pos("start demo_db_1") < pos("create demo_job_run_1"));
    // No numbered container was created for the target service itself.
    assert!(!ops.contains(&"create demo_job_1".to_owned()));

    // A second run always makes a fresh one-off.
    let second = scheduler
        .run(
            &ServiceName::new("job"),
            None,
            &RunOptions {
                detached: true,
                no_deps: true,
                ..RunOptions::default()
            },
        )
        .unwrap();
    assert_eq!(second.container, "demo_job_run_2");
    assert_ne!(result.id, second.id);
}

#[test]
fn conflicting_recreate_flags_touch_nothing() {
    let project = project(TWO_SERVICES);
    let graph = DependencyGraph::build(&project).unwrap();
    let engine = MockEngine::new();
    let scheduler = Scheduler::new(&project, &graph, &engine);

    let err = scheduler
        .up(&UpOptions {
            detached: true,
            policy: RecreatePolicy {
                force_recreate: true,
                no_recreate: true,
            },
            ..UpOptions::default()
        })
        .unwrap_err();
    assert!(err.is_config());
    assert!(engine.operations().is_empty(), "no engine call may happen");
}

#[test]
fn stop_without_containers_is_a_user_error_that_continues() {
    let project = project(TWO_SERVICES);
    let graph = DependencyGraph::build(&project).unwrap();
    let engine = MockEngine::new();
    let scheduler = Scheduler::new(&project, &graph, &engine);

    // Only "simple" gets a container.
    let mut options = detached();
    options.services = vec![ServiceName::new("simple")];
    scheduler.up(&options).unwrap();

    let report = scheduler.stop(&[], None).unwrap();
    assert!(matches!(
        report.outcomes[&ServiceName::new("another")],
        ServiceOutcome::NoContainers
    ));
    assert!(matches!(
        report.outcomes[&ServiceName::new("simple")],
        ServiceOutcome::Converged { .. }
    ));
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn interrupt_before_up_sweeps_gracefully() {
    let project = project(TWO_SERVICES);
    let graph = DependencyGraph::build(&project).unwrap();
    let engine = MockEngine::new();

    // Bring the project up first.
    Scheduler::new(&project, &graph, &engine)
        .up(&detached())
        .unwrap();

    // A signal arriving as the next up starts aborts it and stops everything.
    let signal = SignalCoordinator::new();
    signal.notify_signal();
    let scheduler = Scheduler::new(&project, &graph, &engine).with_signal(signal);
    let err = scheduler.up(&detached()).unwrap_err();
    assert!(matches!(err, flotilla_core::CoreError::Interrupted));

    let filter = LabelFilter::new().with(flotilla_schema::LABEL_PROJECT, "demo");
    let records = engine.list_containers(&filter, true).unwrap();
    assert!(records.iter().all(|r| r.status == ContainerStatus::Exited));
}

#[test]
fn second_interrupt_kills_without_waiting_out_grace() {
    let project = project(
        "services:\n  slow:\n    image: busybox\n    stop_grace_period: 30\n",
    );
    let graph = DependencyGraph::build(&project).unwrap();
    let engine = MockEngine::new();
    engine.set_stubborn("slow");

    Scheduler::new(&project, &graph, &engine)
        .up(&detached())
        .unwrap();

    let signal = SignalCoordinator::new();
    signal.notify_signal();
    signal.notify_signal();
    assert!(signal.forced());

    let scheduler = Scheduler::new(&project, &graph, &engine).with_signal(signal);
    let started = Instant::now();
    let err = scheduler.up(&detached()).unwrap_err();
    assert!(matches!(err, flotilla_core::CoreError::Interrupted));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "forced sweep must not wait out the 30s grace period"
    );
    assert!(engine.operations().contains(&"kill demo_slow_1".to_owned()));
}

/// Engine wrapper proving that independent services reconcile concurrently:
/// two creates must overlap in time for the probe to record it.
struct ConcurrencyProbe {
    inner: MockEngine,
    active: Mutex<usize>,
    arrived: Condvar,
    saw_overlap: AtomicBool,
}

impl ConcurrencyProbe {
    fn new() -> Self {
        Self {
            inner: MockEngine::new(),
            active: Mutex::new(0),
            arrived: Condvar::new(),
            saw_overlap: AtomicBool::new(false),
        }
    }
}

impl ContainerEngine for ConcurrencyProbe {
    fn name(&self) -> &str {
        "probe"
    }

    fn available(&self) -> bool {
        true
    }

    fn create_container(&self, spec: &CreateSpec) -> Result<ContainerId, EngineError> {
        let mut active = self.active.lock().unwrap();
        *active += 1;
        if *active >= 2 {
            self.saw_overlap.store(true, Ordering::SeqCst);
        }
        self.arrived.notify_all();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !self.saw_overlap.load(Ordering::SeqCst) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (guard, _) = self.arrived.wait_timeout(active, remaining).unwrap();
            active = guard;
        }
        *active -= 1;
        drop(active);
        self.inner.create_container(spec)
    }

    fn start_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.inner.start_container(id)
    }

    fn stop_container(&self, id: &ContainerId, signal: Option<&str>) -> Result<(), EngineError> {
        self.inner.stop_container(id, signal)
    }

    fn kill_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.inner.kill_container(id)
    }

    fn pause_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.inner.pause_container(id)
    }

    fn unpause_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.inner.unpause_container(id)
    }

    fn restart_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.inner.restart_container(id)
    }

    fn rename_container(&self, id: &ContainerId, new_name: &str) -> Result<(), EngineError> {
        self.inner.rename_container(id, new_name)
    }

    fn remove_container(&self, id: &ContainerId, remove_volumes: bool) -> Result<(), EngineError> {
        self.inner.remove_container(id, remove_volumes)
    }

    fn inspect_container(&self, id: &ContainerId) -> Result<ContainerRecord, EngineError> {
        self.inner.inspect_container(id)
    }

    fn list_containers(
        &self,
        filter: &LabelFilter,
        all: bool,
    ) -> Result<Vec<ContainerRecord>, EngineError> {
        self.inner.list_containers(filter, all)
    }

    fn wait_container(&self, id: &ContainerId, timeout: Duration) -> Result<bool, EngineError> {
        self.inner.wait_container(id, timeout)
    }

    fn create_network(&self, spec: &NetworkSpec) -> Result<(), EngineError> {
        self.inner.create_network(spec)
    }

    fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.inner.remove_network(name)
    }

    fn network_exists(&self, name: &str) -> Result<bool, EngineError> {
        self.inner.network_exists(name)
    }

    fn create_volume(&self, spec: &VolumeSpec) -> Result<(), EngineError> {
        self.inner.create_volume(spec)
    }

    fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.inner.remove_volume(name)
    }

    fn volume_exists(&self, name: &str) -> Result<bool, EngineError> {
        self.inner.volume_exists(name)
    }

    fn remove_image(&self, reference: &str) -> Result<(), EngineError> {
        self.inner.remove_image(reference)
    }

    fn subscribe_events(&self, filter: &LabelFilter) -> Result<EventSubscription, EngineError> {
        self.inner.subscribe_events(filter)
    }
}

#[test]
fn independent_services_reconcile_concurrently() {
    let project = project(TWO_SERVICES);
    let graph = DependencyGraph::build(&project).unwrap();
    let engine = ConcurrencyProbe::new();
    let scheduler = Scheduler::new(&project, &graph, &engine).with_parallelism(2);

    let report = scheduler.up(&detached()).unwrap();
    assert!(report.ok());
    assert!(
        engine.saw_overlap.load(Ordering::SeqCst),
        "independent services must be allowed to reconcile concurrently"
    );
}

#[test]
fn down_removes_project_networks_but_keeps_external() {
    let project = project(
        "services:\n  web:\n    image: busybox\n    networks: [front, shared]\nnetworks:\n  front:\n  shared:\n    external: true\n",
    );
    let graph = DependencyGraph::build(&project).unwrap();
    let engine = MockEngine::new();
    engine.add_preexisting_network("shared");
    let scheduler = Scheduler::new(&project, &graph, &engine);

    scheduler.up(&detached()).unwrap();
    assert!(engine.network_exists("demo_front").unwrap());

    scheduler.down(&DownOptions::default()).unwrap();
    assert!(!engine.network_exists("demo_front").unwrap());
    assert!(
        engine.network_exists("shared").unwrap(),
        "external networks are never torn down"
    );
}

#[test]
fn down_with_volumes_removes_declared_volumes() {
    let project = project(
        "services:\n  db:\n    image: busybox\n    volumes:\n      - data:/var/lib/db\nvolumes:\n  data:\n",
    );
    let graph = DependencyGraph::build(&project).unwrap();
    let engine = MockEngine::new();
    let scheduler = Scheduler::new(&project, &graph, &engine);

    scheduler.up(&detached()).unwrap();
    assert!(engine.volume_exists("demo_data").unwrap());

    scheduler
        .down(&DownOptions {
            remove_volumes: true,
            ..DownOptions::default()
        })
        .unwrap();
    assert!(!engine.volume_exists("demo_data").unwrap());
}

#[test]
fn up_with_no_deps_touches_only_the_target() {
    let project = project(
        "services:\n  db:\n    image: busybox\n  web:\n    image: busybox\n    depends_on: [db]\n",
    );
    let graph = DependencyGraph::build(&project).unwrap();
    let engine = MockEngine::new();
    let scheduler = Scheduler::new(&project, &graph, &engine);

    let report = scheduler
        .up(&UpOptions {
            detached: true,
            no_deps: true,
            services: vec![ServiceName::new("web")],
            ..UpOptions::default()
        })
        .unwrap();
    assert_eq!(report.outcomes.len(), 1);
    let ops = engine.operations();
    assert!(ops.contains(&"create demo_web_1".to_owned()));
    assert!(!ops.iter().any(|op| op.contains("demo_db_1")));
}
