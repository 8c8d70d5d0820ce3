//! Project-scoped projection of the engine event feed.
//!
//! The engine feed is a live, unbounded sequence covering every container on
//! the host; the projector narrows it to the current project's label, maps
//! each event onto its service and instance index, and yields a typed
//! sequence. Subscriptions start from "now" and are not replayable, matching
//! engine semantics; dropping the projector unsubscribes.

use crate::CoreError;
use chrono::{DateTime, Utc};
use flotilla_runtime::{ContainerEngine, EngineEvent, EventAction, EventSubscription, LabelFilter};
use flotilla_schema::{ContainerId, Project, ServiceName, LABEL_NUMBER, LABEL_PROJECT, LABEL_SERVICE};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

/// One lifecycle event attributed to a service instance of the project.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectEvent {
    pub timestamp: DateTime<Utc>,
    pub action: EventAction,
    pub container_id: ContainerId,
    pub service: ServiceName,
    pub number: u32,
    pub container_name: String,
    pub image: String,
}

pub struct EventProjector {
    subscription: EventSubscription,
    services: BTreeSet<ServiceName>,
}

impl EventProjector {
    /// Subscribe to the engine feed filtered to `project`.
    pub fn subscribe(
        engine: &dyn ContainerEngine,
        project: &Project,
    ) -> Result<Self, CoreError> {
        let filter = LabelFilter::new().with(LABEL_PROJECT, project.name.to_string());
        let subscription = engine.subscribe_events(&filter)?;
        Ok(Self {
            subscription,
            services: project.service_names().into_iter().collect(),
        })
    }

    fn project_event(&self, raw: EngineEvent) -> Option<ProjectEvent> {
        let service = raw.labels.get(LABEL_SERVICE).map(ServiceName::new)?;
        if !self.services.contains(&service) {
            return None;
        }
        let number = raw
            .labels
            .get(LABEL_NUMBER)
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        Some(ProjectEvent {
            timestamp: raw.timestamp,
            action: raw.action,
            container_id: raw.container_id,
            service,
            number,
            container_name: raw.container_name,
            image: raw.image,
        })
    }

    /// Next projected event, waiting at most `timeout` for the feed.
    pub fn next_timeout(&self, timeout: Duration) -> Option<ProjectEvent> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(std::time::Instant::now())?;
            let raw = self.subscription.next_timeout(remaining)?;
            if let Some(event) = self.project_event(raw) {
                return Some(event);
            }
        }
    }
}

impl Iterator for EventProjector {
    type Item = ProjectEvent;

    fn next(&mut self) -> Option<ProjectEvent> {
        loop {
            let raw = self.subscription.next()?;
            if let Some(event) = self.project_event(raw) {
                return Some(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyGraph;
    use crate::scheduler::{Scheduler, UpOptions};
    use flotilla_runtime::MockEngine;
    use flotilla_schema::{parse_document_str, ProjectName};
    use std::collections::BTreeMap;

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

    #[test]
    fn projects_lifecycle_events_in_order() {
        let project = project("services:\n  web:\n    image: busybox\n");
        let engine = MockEngine::new();
        let projector = EventProjector::subscribe(&engine, &project).unwrap();

        let graph = DependencyGraph::build(&project).unwrap();
        let scheduler = Scheduler::new(&project, &graph, &engine);
        scheduler
            .up(&UpOptions {
                detached: true,
                ..UpOptions::default()
            })
            .unwrap();

        let first = projector.next_timeout(Duration::from_millis(200)).unwrap();
        assert_eq!(first.action, EventAction::Create);
        assert_eq!(first.service, ServiceName::new("web"));
        assert_eq!(first.number, 1);
        assert_eq!(first.container_name, "demo_web_1");

        let second = projector.next_timeout(Duration::from_millis(200)).unwrap();
        assert_eq!(second.action, EventAction::Start);
        assert!(second.timestamp >= first.timestamp);
    }

    #[test]
    fn subscription_starts_from_now() {
        let project = project("services:\n  web:\n    image: busybox\n");
        let engine = MockEngine::new();

        // Events before subscription never replay.
        let graph = DependencyGraph::build(&project).unwrap();
        let scheduler = Scheduler::new(&project, &graph, &engine);
        scheduler
            .up(&UpOptions {
                detached: true,
                ..UpOptions::default()
            })
            .unwrap();

        let projector = EventProjector::subscribe(&engine, &project).unwrap();
        assert!(projector.next_timeout(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn foreign_project_events_are_filtered_out() {
        let demo = project("services:\n  web:\n    image: busybox\n");
        let engine = MockEngine::new();
        let projector = EventProjector::subscribe(&engine, &demo).unwrap();

        let other = {
            let doc = parse_document_str("services:\n  job:\n    image: busybox\n").unwrap();
            let mut registry = BTreeMap::new();
            registry.insert("f.yml".to_owned(), doc);
            Project::resolve(
                ProjectName::new("other"),
                &["f.yml".to_owned()],
                &registry,
                &BTreeMap::new(),
            )
            .unwrap()
            .project
        };
        let graph = DependencyGraph::build(&other).unwrap();
        Scheduler::new(&other, &graph, &engine)
            .up(&UpOptions {
                detached: true,
                ..UpOptions::default()
            })
            .unwrap();

        assert!(projector.next_timeout(Duration::from_millis(50)).is_none());
    }
}
