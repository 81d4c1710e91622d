//! Typed dependency graph with breadth-first health propagation.
//!
//! The graph reads registration data but never mutates registrations; it
//! owns the edges and the propagation discipline. A health change is fully
//! propagated (under one lock) before the next update on the same service.

use crate::registry::{Criticality, HealthState, ServiceRegistry};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyType {
    Required,
    Optional,
    Fallback,
}

/// `from` depends on `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub dependency_type: DependencyType,
    pub weight: f64,
    pub cascades_on_failure: bool,
}

impl DependencyEdge {
    pub fn required(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            dependency_type: DependencyType::Required,
            weight: 1.0,
            cascades_on_failure: true,
        }
    }

    pub fn optional(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            dependency_type: DependencyType::Optional,
            weight: 0.5,
            cascades_on_failure: false,
        }
    }

    pub fn fallback(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            dependency_type: DependencyType::Fallback,
            weight: 0.0,
            cascades_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImpactSeverity {
    Critical,
    High,
    Medium,
}

/// Result of [`DependencyGraph::analyze_impact`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactAnalysis {
    pub service: String,
    /// Transitive dependents, breadth-first order.
    pub affected: Vec<String>,
    /// |affected| / |total services|.
    pub blast_radius: f64,
    pub failed_dependents: usize,
    pub severity: ImpactSeverity,
}

struct GraphInner {
    /// Keyed by `from`; each service's outgoing dependency edges.
    edges: HashMap<String, Vec<DependencyEdge>>,
}

/// Process-wide dependency graph.
pub struct DependencyGraph {
    inner: Mutex<GraphInner>,
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph").field("edges", &self.edge_count()).finish()
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self { inner: Mutex::new(GraphInner { edges: HashMap::new() }) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GraphInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add an edge, replacing any existing edge between the same pair.
    pub fn add_dependency(&self, edge: DependencyEdge) {
        let mut inner = self.lock();
        let edges = inner.edges.entry(edge.from.clone()).or_default();
        edges.retain(|e| e.to != edge.to);
        edges.push(edge);
    }

    pub fn remove_dependency(&self, from: &str, to: &str) {
        let mut inner = self.lock();
        if let Some(edges) = inner.edges.get_mut(from) {
            edges.retain(|e| e.to != to);
            if edges.is_empty() {
                inner.edges.remove(from);
            }
        }
    }

    /// Drop every edge touching `service`.
    pub fn remove_service(&self, service: &str) {
        let mut inner = self.lock();
        inner.edges.remove(service);
        for edges in inner.edges.values_mut() {
            edges.retain(|e| e.to != service);
        }
        inner.edges.retain(|_, edges| !edges.is_empty());
    }

    pub fn edge_count(&self) -> usize {
        self.lock().edges.values().map(|v| v.len()).sum()
    }

    /// Outgoing edges: what `service` depends on.
    pub fn dependencies_of(&self, service: &str) -> Vec<DependencyEdge> {
        self.lock().edges.get(service).cloned().unwrap_or_default()
    }

    /// Incoming edges: who depends on `service`, sorted by dependent name.
    pub fn dependents_of(&self, service: &str) -> Vec<DependencyEdge> {
        let inner = self.lock();
        let mut edges: Vec<DependencyEdge> = inner
            .edges
            .values()
            .flatten()
            .filter(|e| e.to == service)
            .cloned()
            .collect();
        edges.sort_by(|a, b| a.from.cmp(&b.from));
        edges
    }

    /// Set `service` health in the registry and propagate breadth-first to
    /// its dependents. Returns every (service, new_health) that changed,
    /// source first, in propagation order.
    pub fn update_health(
        &self,
        registry: &ServiceRegistry,
        service: &str,
        health: HealthState,
        reason: &str,
    ) -> Vec<(String, HealthState)> {
        // One guard for the whole walk: concurrent updates serialise here, so
        // a change is fully propagated before the next begins.
        let inner = self.lock();
        let mut changed = Vec::new();

        let previous = registry.set_health(service, health, reason);
        if previous.is_none() {
            return changed;
        }
        if previous == Some(health) {
            return changed;
        }
        changed.push((service.to_string(), health));

        let mut queue: VecDeque<(String, HealthState)> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(service.to_string());
        queue.push_back((service.to_string(), health));

        while let Some((name, state)) = queue.pop_front() {
            let mut dependents: Vec<&DependencyEdge> =
                inner.edges.values().flatten().filter(|e| e.to == name).collect();
            dependents.sort_by(|a, b| a.from.cmp(&b.from));

            for edge in dependents {
                if visited.contains(&edge.from) {
                    continue;
                }
                let current = match registry.health(&edge.from) {
                    Some(h) => h,
                    None => continue,
                };
                let next = Self::derive(&inner, registry, edge, state, current);
                if let Some(next) = next {
                    if next != current {
                        registry.set_health(
                            &edge.from,
                            next,
                            &format!("propagated from {}", name),
                        );
                        tracing::info!(
                            service = %edge.from,
                            from = ?current,
                            to = ?next,
                            source = %name,
                            "health propagated"
                        );
                        changed.push((edge.from.clone(), next));
                        visited.insert(edge.from.clone());
                        queue.push_back((edge.from.clone(), next));
                    }
                }
            }
        }
        changed
    }

    /// Propagation rules for a single edge.
    fn derive(
        inner: &GraphInner,
        registry: &ServiceRegistry,
        edge: &DependencyEdge,
        source_health: HealthState,
        dependent_current: HealthState,
    ) -> Option<HealthState> {
        match (edge.dependency_type, source_health) {
            (DependencyType::Required, h) if h.is_down() => Some(HealthState::Unhealthy),
            (DependencyType::Optional, h) if h.is_down() => Some(HealthState::Degraded),
            (DependencyType::Required, HealthState::Degraded) => Some(HealthState::Degraded),
            (_, HealthState::Healthy) => {
                // Recovery upgrades a dependent only when every one of its
                // non-fallback dependencies is healthy.
                if dependent_current == HealthState::Healthy {
                    return None;
                }
                let all_healthy = inner
                    .edges
                    .get(&edge.from)
                    .map(|deps| {
                        deps.iter()
                            .filter(|d| d.dependency_type != DependencyType::Fallback)
                            .all(|d| registry.health(&d.to) == Some(HealthState::Healthy))
                    })
                    .unwrap_or(true);
                all_healthy.then_some(HealthState::Healthy)
            }
            _ => None,
        }
    }

    /// Report dependency cycles (DFS with a recursion stack). Cycles are
    /// reported, never broken.
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        let inner = self.lock();
        let mut cycles = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();

        let mut nodes: Vec<&String> = inner.edges.keys().collect();
        nodes.sort();

        for start in nodes {
            if visited.contains(start.as_str()) {
                continue;
            }
            let mut stack: Vec<String> = Vec::new();
            let mut on_stack: HashSet<String> = HashSet::new();
            Self::dfs(&inner, start, &mut visited, &mut stack, &mut on_stack, &mut cycles);
        }
        cycles
    }

    fn dfs(
        inner: &GraphInner,
        node: &str,
        visited: &mut HashSet<String>,
        stack: &mut Vec<String>,
        on_stack: &mut HashSet<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(node.to_string());
        stack.push(node.to_string());
        on_stack.insert(node.to_string());

        if let Some(edges) = inner.edges.get(node) {
            for edge in edges {
                if on_stack.contains(&edge.to) {
                    let start = stack.iter().position(|n| n == &edge.to).unwrap_or(0);
                    cycles.push(stack[start..].to_vec());
                } else if !visited.contains(&edge.to) {
                    Self::dfs(inner, &edge.to, visited, stack, on_stack, cycles);
                }
            }
        }

        stack.pop();
        on_stack.remove(node);
    }

    /// Blast radius and severity if `service` were to fail.
    pub fn analyze_impact(&self, registry: &ServiceRegistry, service: &str) -> ImpactAnalysis {
        let inner = self.lock();
        let mut affected = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(service.to_string());
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(service.to_string());

        while let Some(name) = queue.pop_front() {
            let mut dependents: Vec<&DependencyEdge> =
                inner.edges.values().flatten().filter(|e| e.to == name).collect();
            dependents.sort_by(|a, b| a.from.cmp(&b.from));
            for edge in dependents {
                if visited.insert(edge.from.clone()) {
                    affected.push(edge.from.clone());
                    queue.push_back(edge.from.clone());
                }
            }
        }
        drop(inner);

        let total = registry.len().max(1);
        let failed_dependents = affected
            .iter()
            .filter(|name| registry.health(name).map(|h| h.is_down()).unwrap_or(false))
            .count();
        let criticality = registry.criticality(service);

        let severity = if criticality == Some(Criticality::Critical) || failed_dependents > 3 {
            ImpactSeverity::Critical
        } else if criticality == Some(Criticality::High) || failed_dependents > 1 {
            ImpactSeverity::High
        } else {
            ImpactSeverity::Medium
        };

        ImpactAnalysis {
            service: service.to_string(),
            blast_radius: affected.len() as f64 / total as f64,
            affected,
            failed_dependents,
            severity,
        }
    }

    pub fn destroy(&self) {
        self.lock().edges.clear();
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ServiceRegistration, SloThresholds};

    fn registry_with(names: &[(&str, Criticality, &[&str])]) -> ServiceRegistry {
        let registry = ServiceRegistry::new();
        for (name, criticality, deps) in names {
            registry.register(ServiceRegistration {
                name: name.to_string(),
                kind: "svc".to_string(),
                criticality: *criticality,
                dependencies: deps.iter().map(|d| d.to_string()).collect(),
                slo: SloThresholds::default(),
            });
        }
        registry
    }

    fn graph_for(registry_edges: &[DependencyEdge]) -> DependencyGraph {
        let graph = DependencyGraph::new();
        for edge in registry_edges {
            graph.add_dependency(edge.clone());
        }
        graph
    }

    #[test]
    fn required_dependency_failure_propagates_unhealthy() {
        let registry = registry_with(&[
            ("db", Criticality::Critical, &[]),
            ("api", Criticality::High, &["db"]),
        ]);
        let graph = graph_for(&[DependencyEdge::required("api", "db")]);

        let changed = graph.update_health(&registry, "db", HealthState::Unhealthy, "probe");
        assert_eq!(
            changed,
            vec![
                ("db".to_string(), HealthState::Unhealthy),
                ("api".to_string(), HealthState::Unhealthy)
            ]
        );
        assert_eq!(registry.health("api"), Some(HealthState::Unhealthy));
    }

    #[test]
    fn optional_dependency_failure_degrades() {
        let registry = registry_with(&[
            ("cache", Criticality::Low, &[]),
            ("api", Criticality::High, &["cache"]),
        ]);
        let graph = graph_for(&[DependencyEdge::optional("api", "cache")]);

        graph.update_health(&registry, "cache", HealthState::Offline, "gone");
        assert_eq!(registry.health("api"), Some(HealthState::Degraded));
    }

    #[test]
    fn degraded_required_dependency_degrades() {
        let registry = registry_with(&[
            ("db", Criticality::Critical, &[]),
            ("api", Criticality::High, &["db"]),
        ]);
        let graph = graph_for(&[DependencyEdge::required("api", "db")]);

        graph.update_health(&registry, "db", HealthState::Degraded, "slow");
        assert_eq!(registry.health("api"), Some(HealthState::Degraded));
    }

    #[test]
    fn propagation_is_transitive() {
        let registry = registry_with(&[
            ("db", Criticality::Critical, &[]),
            ("api", Criticality::High, &["db"]),
            ("web", Criticality::Medium, &["api"]),
        ]);
        let graph = graph_for(&[
            DependencyEdge::required("api", "db"),
            DependencyEdge::required("web", "api"),
        ]);

        let changed = graph.update_health(&registry, "db", HealthState::Unhealthy, "down");
        assert_eq!(changed.len(), 3);
        assert_eq!(registry.health("web"), Some(HealthState::Unhealthy));
    }

    #[test]
    fn recovery_requires_all_dependencies_healthy() {
        let registry = registry_with(&[
            ("db", Criticality::Critical, &[]),
            ("cache", Criticality::Low, &[]),
            ("api", Criticality::High, &["db", "cache"]),
        ]);
        let graph = graph_for(&[
            DependencyEdge::required("api", "db"),
            DependencyEdge::required("api", "cache"),
        ]);

        graph.update_health(&registry, "db", HealthState::Unhealthy, "down");
        graph.update_health(&registry, "cache", HealthState::Unhealthy, "down");
        assert_eq!(registry.health("api"), Some(HealthState::Unhealthy));

        // One of two dependencies recovers: the dependent must stay down.
        graph.update_health(&registry, "db", HealthState::Healthy, "back");
        assert_eq!(registry.health("api"), Some(HealthState::Unhealthy));

        graph.update_health(&registry, "cache", HealthState::Healthy, "back");
        assert_eq!(registry.health("api"), Some(HealthState::Healthy));
    }

    #[test]
    fn fallback_edges_do_not_propagate_failure() {
        let registry = registry_with(&[
            ("backup", Criticality::Low, &[]),
            ("api", Criticality::High, &[]),
        ]);
        let graph = graph_for(&[DependencyEdge::fallback("api", "backup")]);

        graph.update_health(&registry, "backup", HealthState::Offline, "gone");
        assert_eq!(registry.health("api"), Some(HealthState::Healthy));
    }

    #[test]
    fn cycles_are_reported_not_broken() {
        let graph = graph_for(&[
            DependencyEdge::required("a", "b"),
            DependencyEdge::required("b", "c"),
            DependencyEdge::required("c", "a"),
        ]);
        let cycles = graph.find_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 3);
        // Edges survive cycle detection.
        assert_eq!(graph.edge_count(), 3);
    }

    #[test]
    fn acyclic_graph_reports_no_cycles() {
        let graph = graph_for(&[
            DependencyEdge::required("api", "db"),
            DependencyEdge::required("web", "api"),
        ]);
        assert!(graph.find_cycles().is_empty());
    }

    #[test]
    fn impact_analysis_blast_radius_and_severity() {
        let registry = registry_with(&[
            ("db", Criticality::Critical, &[]),
            ("api", Criticality::High, &["db"]),
            ("web", Criticality::Medium, &["api"]),
            ("admin", Criticality::Low, &[]),
        ]);
        let graph = graph_for(&[
            DependencyEdge::required("api", "db"),
            DependencyEdge::required("web", "api"),
        ]);

        let impact = graph.analyze_impact(&registry, "db");
        assert_eq!(impact.affected, vec!["api".to_string(), "web".to_string()]);
        assert!((impact.blast_radius - 0.5).abs() < 1e-9);
        assert_eq!(impact.severity, ImpactSeverity::Critical);

        let impact = graph.analyze_impact(&registry, "admin");
        assert!(impact.affected.is_empty());
        assert_eq!(impact.severity, ImpactSeverity::Medium);
    }

    #[test]
    fn remove_service_drops_both_directions() {
        let graph = graph_for(&[
            DependencyEdge::required("api", "db"),
            DependencyEdge::required("db", "disk"),
        ]);
        graph.remove_service("db");
        assert_eq!(graph.edge_count(), 0);
    }
}
