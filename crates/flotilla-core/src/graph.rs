//! Service dependency graph.
//!
//! Services live in an arena (the project's ordered service list); the graph
//! is adjacency lists of indices into that arena, so "service" and "its
//! dependents" never hold references to each other. Edges come from
//! `depends_on`, `links`, `volumes_from`, and `network_mode: service:<name>`.

use flotilla_schema::{ConfigError, NetworkMode, Project, ServiceName};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<ServiceName>,
    index: BTreeMap<ServiceName, usize>,
    /// deps[i]: services i must wait for.
    deps: Vec<Vec<usize>>,
    /// dependents[i]: services waiting for i.
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build and validate the graph. Runs before any engine call: unknown
    /// references and cycles are configuration errors.
    pub fn build(project: &Project) -> Result<Self, ConfigError> {
        let names: Vec<ServiceName> = project.services.iter().map(|s| s.name.clone()).collect();
        let index: BTreeMap<ServiceName, usize> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();

        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); names.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); names.len()];

        for (i, service) in project.services.iter().enumerate() {
            let mut references: BTreeSet<ServiceName> = service.depends_on.clone();
            references.extend(service.links.keys().cloned());
            references.extend(service.volumes_from.iter().map(|v| v.service.clone()));
            if let NetworkMode::Service(target) = &service.network_mode {
                references.insert(target.clone());
            }
            // network_mode: container:<id> passes through; the engine
            // validates raw container references.

            for reference in references {
                let Some(&dep) = index.get(&reference) else {
                    return Err(ConfigError::UnknownDependency {
                        service: service.name.to_string(),
                        dependency: reference.to_string(),
                    });
                };
                if dep == i {
                    return Err(ConfigError::DependencyCycle(vec![
                        service.name.to_string(),
                        service.name.to_string(),
                    ]));
                }
                if !deps[i].contains(&dep) {
                    deps[i].push(dep);
                    dependents[dep].push(i);
                }
            }
        }

        let graph = Self {
            names,
            index,
            deps,
            dependents,
        };
        graph.reject_cycles()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[ServiceName] {
        &self.names
    }

    pub fn name_of(&self, node: usize) -> &ServiceName {
        &self.names[node]
    }

    pub fn index_of(&self, name: &ServiceName) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn dependencies_of(&self, node: usize) -> &[usize] {
        &self.deps[node]
    }

    pub fn dependents_of(&self, node: usize) -> &[usize] {
        &self.dependents[node]
    }

    /// Services with no dependencies; every traversal can start here.
    pub fn roots(&self) -> Vec<usize> {
        (0..self.names.len())
            .filter(|&i| self.deps[i].is_empty())
            .collect()
    }

    /// Targets plus every transitive dependency.
    pub fn closure_with_dependencies(&self, targets: &BTreeSet<usize>) -> BTreeSet<usize> {
        let mut closure = BTreeSet::new();
        let mut queue: VecDeque<usize> = targets.iter().copied().collect();
        while let Some(node) = queue.pop_front() {
            if closure.insert(node) {
                queue.extend(self.deps[node].iter().copied());
            }
        }
        closure
    }

    /// Every service that transitively depends on `node` (excluding it).
    pub fn dependents_closure(&self, node: usize) -> BTreeSet<usize> {
        let mut closure = BTreeSet::new();
        let mut queue: VecDeque<usize> = self.dependents[node].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if closure.insert(next) {
                queue.extend(self.dependents[next].iter().copied());
            }
        }
        closure
    }

    /// Kahn's algorithm; ties break by arena index, so the order is
    /// deterministic.
    pub fn topological(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.names.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.names.len());
        while let Some(&node) = ready.iter().next() {
            ready.remove(&node);
            order.push(node);
            for &dependent in &self.dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        order
    }

    fn reject_cycles(&self) -> Result<(), ConfigError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Gray,
            Black,
        }

        fn visit(
            graph: &DependencyGraph,
            node: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Result<(), ConfigError> {
            marks[node] = Mark::Gray;
            stack.push(node);
            for &dep in &graph.deps[node] {
                match marks[dep] {
                    Mark::Black => {}
                    Mark::White => visit(graph, dep, marks, stack)?,
                    Mark::Gray => {
                        let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .map(|&n| graph.names[n].to_string())
                            .collect();
                        cycle.push(graph.names[dep].to_string());
                        return Err(ConfigError::DependencyCycle(cycle));
                    }
                }
            }
            stack.pop();
            marks[node] = Mark::Black;
            Ok(())
        }

        let mut marks = vec![Mark::White; self.names.len()];
        let mut stack = Vec::new();
        for node in 0..self.names.len() {
            if marks[node] == Mark::White {
                visit(self, node, &mut marks, &mut stack)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn graph(yaml: &str) -> DependencyGraph {
        DependencyGraph::build(&project(yaml)).unwrap()
    }

    #[test]
    fn depends_on_creates_edges() {
        let g = graph(
            "services:\n  db:\n    image: busybox\n  web:\n    image: busybox\n    depends_on: [db]\n",
        );
        let web = g.index_of(&ServiceName::new("web")).unwrap();
        let db = g.index_of(&ServiceName::new("db")).unwrap();
        assert_eq!(g.dependencies_of(web), &[db]);
        assert_eq!(g.dependents_of(db), &[web]);
        assert_eq!(g.roots(), vec![db]);
    }

    #[test]
    fn links_volumes_from_and_netns_create_edges() {
        let g = graph(
            "services:\n  a:\n    image: busybox\n  b:\n    image: busybox\n    links: [a]\n  c:\n    image: busybox\n    volumes_from: [a]\n  d:\n    image: busybox\n    network_mode: \"service:a\"\n",
        );
        let a = g.index_of(&ServiceName::new("a")).unwrap();
        for name in ["b", "c", "d"] {
            let node = g.index_of(&ServiceName::new(name)).unwrap();
            assert_eq!(g.dependencies_of(node), &[a], "edge missing for {name}");
        }
    }

    #[test]
    fn raw_container_netns_is_not_an_edge() {
        let g = graph(
            "services:\n  a:\n    image: busybox\n    network_mode: \"container:abc\"\n",
        );
        let a = g.index_of(&ServiceName::new("a")).unwrap();
        assert!(g.dependencies_of(a).is_empty());
    }

    #[test]
    fn unknown_dependency_is_config_error() {
        let p = project("services:\n  web:\n    image: busybox\n    depends_on: [ghost]\n");
        let err = DependencyGraph::build(&p).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDependency { .. }));
    }

    #[test]
    fn two_service_cycle_names_both_services() {
        let p = project(
            "services:\n  a:\n    image: busybox\n    depends_on: [b]\n  b:\n    image: busybox\n    depends_on: [a]\n",
        );
        let err = DependencyGraph::build(&p).unwrap_err();
        match err {
            ConfigError::DependencyCycle(cycle) => {
                assert!(cycle.contains(&"a".to_owned()));
                assert!(cycle.contains(&"b".to_owned()));
            }
            other => panic!("expected cycle error, got {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let p = project("services:\n  a:\n    image: busybox\n    depends_on: [a]\n");
        assert!(matches!(
            DependencyGraph::build(&p),
            Err(ConfigError::DependencyCycle(_))
        ));
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let g = graph(
            "services:\n  db:\n    image: busybox\n  cache:\n    image: busybox\n  web:\n    image: busybox\n    depends_on: [db, cache]\n  proxy:\n    image: busybox\n    depends_on: [web]\n",
        );
        let order = g.topological();
        assert_eq!(order.len(), 4);
        let pos = |name: &str| {
            order
                .iter()
                .position(|&n| g.name_of(n) == &ServiceName::new(name))
                .unwrap()
        };
        assert!(pos("db") < pos("web"));
        assert!(pos("cache") < pos("web"));
        assert!(pos("web") < pos("proxy"));
    }

    #[test]
    fn closures_cover_transitive_relations() {
        let g = graph(
            "services:\n  db:\n    image: busybox\n  web:\n    image: busybox\n    depends_on: [db]\n  proxy:\n    image: busybox\n    depends_on: [web]\n  lone:\n    image: busybox\n",
        );
        let proxy = g.index_of(&ServiceName::new("proxy")).unwrap();
        let db = g.index_of(&ServiceName::new("db")).unwrap();
        let lone = g.index_of(&ServiceName::new("lone")).unwrap();

        let mut targets = BTreeSet::new();
        targets.insert(proxy);
        let closure = g.closure_with_dependencies(&targets);
        assert_eq!(closure.len(), 3);
        assert!(!closure.contains(&lone));

        let dependents = g.dependents_closure(db);
        assert_eq!(dependents.len(), 2);
        assert!(dependents.contains(&proxy));
    }
}
