//! Dependency resolution
//!
//! [`DependencyGraph`] is a pure snapshot of declared dependencies; it is
//! rebuilt whenever it is needed and never persisted. Cycles are reported by
//! [`DependencyGraph::detect_cycles`] but do not stop load ordering: the first
//! edge that closes a cycle is dropped with a warning.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

use crate::PluginManifest;
use crate::compatibility::CompatibilityChecker;
use crate::registry::Registry;

/// Priority for self-identified core plugins
pub const CORE_PRIORITY: u32 = 10;
/// Priority of a plugin nobody depends on
pub const BASE_PRIORITY: u32 = 100;
/// Priority bonus per dependent
const DEPENDENT_WEIGHT: u32 = 10;
/// Largest total dependent bonus
const MAX_DEPENDENT_BONUS: u32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Load order plus the cycle edges that were skipped to produce it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOrder {
    pub order: Vec<String>,
    pub warnings: Vec<String>,
}

/// id -> dependencies, and its inverse
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    dependencies: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
    explicit_priority: HashMap<String, u32>,
    core: HashSet<String>,
}

impl DependencyGraph {
    /// Build from a snapshot; edges to unknown ids are kept but never followed
    pub fn build(manifests: &[PluginManifest]) -> Self {
        let mut graph = Self::default();

        for manifest in manifests {
            if graph.dependencies.contains_key(&manifest.id) {
                continue;
            }
            graph.nodes.push(manifest.id.clone());
            graph
                .dependencies
                .insert(manifest.id.clone(), manifest.dependency_ids());
            if let Some(priority) = manifest.priority {
                graph.explicit_priority.insert(manifest.id.clone(), priority);
            }
            if manifest.core {
                graph.core.insert(manifest.id.clone());
            }
        }

        for (id, deps) in &graph.dependencies {
            for dep in deps {
                graph
                    .dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(id.clone());
            }
        }
        for dependents in graph.dependents.values_mut() {
            dependents.sort();
            dependents.dedup();
        }

        graph
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn contains(&self, id: &str) -> bool {
        self.dependencies.contains_key(id)
    }

    pub fn dependencies(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Plugins that declare `id` as a dependency (known or not)
    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Lower loads earlier
    ///
    /// An explicit priority replaces the base; dependents still pull it
    /// earlier, so equal explicit priorities order by dependents count.
    pub fn priority(&self, id: &str) -> u32 {
        let dependents = self.dependents(id).len() as u32;
        let bonus = MAX_DEPENDENT_BONUS.min(DEPENDENT_WEIGHT.saturating_mul(dependents));
        if let Some(priority) = self.explicit_priority.get(id) {
            return priority.saturating_sub(bonus);
        }
        if self.core.contains(id) {
            return CORE_PRIORITY;
        }
        BASE_PRIORITY - bonus
    }

    /// Every distinct cycle, each as the path slice that closes it
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();
        let mut cycles = Vec::new();
        let mut seen: HashSet<Vec<String>> = HashSet::new();

        for node in &self.nodes {
            if !marks.contains_key(node.as_str()) {
                self.visit_for_cycles(node, &mut marks, &mut path, &mut cycles, &mut seen);
            }
        }
        cycles
    }

    fn visit_for_cycles<'a>(
        &'a self,
        node: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
        seen: &mut HashSet<Vec<String>>,
    ) {
        marks.insert(node, Mark::InProgress);
        path.push(node);

        for dep in self.dependencies(node) {
            if !self.contains(dep) {
                continue;
            }
            match marks.get(dep.as_str()) {
                Some(Mark::InProgress) => {
                    if let Some(start) = path.iter().position(|n| *n == dep) {
                        let cycle: Vec<String> =
                            path[start..].iter().map(|n| n.to_string()).collect();
                        if seen.insert(canonical_rotation(&cycle)) {
                            cycles.push(cycle);
                        }
                    }
                }
                Some(Mark::Done) => {}
                None => self.visit_for_cycles(dep, marks, path, cycles, seen),
            }
        }

        path.pop();
        marks.insert(node, Mark::Done);
    }

    /// Ids taking part in at least one cycle
    pub fn cycle_members(&self) -> HashSet<String> {
        self.detect_cycles().into_iter().flatten().collect()
    }

    /// Dependencies-first order over every node
    ///
    /// Start nodes are taken by ascending priority, ties going to the node
    /// with more dependents, then registration order.
    pub fn load_order(&self) -> LoadOrder {
        let mut starts: Vec<(usize, &String)> = self.nodes.iter().enumerate().collect();
        starts.sort_by_key(|(index, id)| {
            (self.priority(id), Reverse(self.dependents(id).len()), *index)
        });

        let mut result = LoadOrder::default();
        let mut placed: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();

        for (_, id) in starts {
            self.place(id, &mut placed, &mut stack, &mut result);
        }
        result
    }

    fn place<'a>(
        &'a self,
        id: &'a str,
        placed: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        result: &mut LoadOrder,
    ) {
        if placed.contains(id) {
            return;
        }
        stack.push(id);

        for dep in self.dependencies(id) {
            if !self.contains(dep) {
                result
                    .warnings
                    .push(format!("Plugin '{}' depends on unknown plugin '{}'", id, dep));
                continue;
            }
            if stack.contains(&dep.as_str()) {
                let message = format!(
                    "Dependency cycle between '{}' and '{}' broken arbitrarily",
                    id, dep
                );
                warn!("{}", message);
                result.warnings.push(message);
                continue;
            }
            self.place(dep, placed, stack, result);
        }

        stack.pop();
        if placed.insert(id) {
            result.order.push(id.to_string());
        }
    }

    /// Order a subset of ids; ids outside the graph go last in input order
    pub fn order_ids(&self, ids: &[String]) -> Vec<String> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut ordered: Vec<String> = self
            .load_order()
            .order
            .into_iter()
            .filter(|id| wanted.contains(id.as_str()))
            .collect();
        for id in ids {
            if !self.contains(id) && !ordered.contains(id) {
                ordered.push(id.clone());
            }
        }
        ordered
    }
}

/// Rotate a cycle so it starts at its smallest id
fn canonical_rotation(cycle: &[String]) -> Vec<String> {
    let start = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    cycle[start..].iter().chain(&cycle[..start]).cloned().collect()
}

/// Per-plugin aggregate of compatibility, dependency, conflict and cycle checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginValidation {
    pub plugin_id: String,
    pub valid: bool,
    pub compatible: bool,
    pub dependencies_satisfied: bool,
    pub conflict_free: bool,
    pub in_cycle: bool,
    pub priority: u32,
    pub issues: Vec<String>,
}

/// Resolver service over the live registry
pub struct DependencyResolver {
    registry: Arc<Registry>,
    compatibility: Arc<CompatibilityChecker>,
}

impl DependencyResolver {
    pub fn new(registry: Arc<Registry>, compatibility: Arc<CompatibilityChecker>) -> Self {
        Self {
            registry,
            compatibility,
        }
    }

    /// Fresh graph from the current registry snapshot
    pub async fn build_graph(&self) -> DependencyGraph {
        DependencyGraph::build(&self.registry.manifests().await)
    }

    pub async fn detect_cycles(&self) -> Vec<Vec<String>> {
        self.build_graph().await.detect_cycles()
    }

    pub async fn load_order(&self) -> LoadOrder {
        self.build_graph().await.load_order()
    }

    pub async fn priority(&self, id: &str) -> u32 {
        self.build_graph().await.priority(id)
    }

    /// Validate every registered plugin
    pub async fn validate_all_plugins(&self) -> Vec<PluginValidation> {
        let graph = self.build_graph().await;
        let cycles = graph.detect_cycles();
        let in_cycle: HashSet<&String> = cycles.iter().flatten().collect();

        let mut report = Vec::new();
        for id in graph.nodes() {
            let Ok(result) = self.compatibility.run_full_check(id).await else {
                continue;
            };

            let mut issues: Vec<String> = [
                &result.app_version,
                &result.dependencies,
                &result.conflicts,
                &result.reverse_conflicts,
            ]
            .into_iter()
            .filter_map(|c| c.reason.clone())
            .collect();

            let cyclic = in_cycle.contains(id);
            if cyclic {
                for cycle in cycles.iter().filter(|c| c.contains(id)) {
                    issues.push(format!("Part of dependency cycle: {}", cycle.join(" -> ")));
                }
            }

            report.push(PluginValidation {
                plugin_id: id.clone(),
                valid: result.compatible && !cyclic,
                compatible: result.app_version.passed,
                dependencies_satisfied: result.dependencies.passed,
                conflict_free: result.conflicts.passed && result.reverse_conflicts.passed,
                in_cycle: cyclic,
                priority: graph.priority(id),
                issues,
            });
        }
        report
    }
}
