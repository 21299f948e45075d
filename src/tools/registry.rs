//! Tool registry - static descriptors and the dependency graph.
//!
//! Owns descriptors, not runtime state. Descriptors are handed out as
//! `Arc<ToolDescriptor>` so readers never hold the registry lock across a tick.
//! Dependencies may reference tools that are registered later; `load` prunes
//! tools whose references never resolve.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::{Error, Result, ToolId};
use crate::validation::{validate_budget_percent, validate_priority};

/// Registry shared between the scheduler, optimizer and control surface.
pub type SharedRegistry = Arc<RwLock<ToolRegistry>>;

// =============================================================================
// Descriptor
// =============================================================================

/// Immutable description of a tool, fixed at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: ToolId,
    /// 1..=10, 10 = must-run.
    pub priority: u8,
    pub max_cpu_percent: f64,
    pub max_memory_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_gpu_percent: Option<f64>,
    /// Tools that must be Running before this one may start.
    #[serde(default)]
    pub dependencies: BTreeSet<ToolId>,
    /// Workload labels matched against profiles.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl ToolDescriptor {
    pub fn new(id: ToolId, priority: u8, max_cpu_percent: f64, max_memory_bytes: u64) -> Self {
        Self {
            id,
            priority,
            max_cpu_percent,
            max_memory_bytes,
            max_gpu_percent: None,
            dependencies: BTreeSet::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_gpu(mut self, percent: f64) -> Self {
        self.max_gpu_percent = Some(percent);
        self
    }

    pub fn depends_on(mut self, dependency: &str) -> Self {
        self.dependencies.insert(ToolId::must(dependency));
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }

    /// Field-level validation (graph checks happen in the registry).
    pub fn validate(&self) -> Result<()> {
        validate_priority(self.priority, &format!("{}.priority", self.id))?;
        validate_budget_percent(self.max_cpu_percent, &format!("{}.max_cpu_percent", self.id))?;
        if let Some(gpu) = self.max_gpu_percent {
            validate_budget_percent(gpu, &format!("{}.max_gpu_percent", self.id))?;
        }
        Ok(())
    }

    pub fn is_must_run(&self) -> bool {
        self.priority >= crate::validation::MAX_PRIORITY
    }
}

/// A tool rejected while loading a catalog.
#[derive(Debug)]
pub struct RegistrationFailure {
    pub tool: ToolId,
    pub error: Error,
}

// =============================================================================
// Topological ordering
// =============================================================================

/// Ready-set entry: higher priority first, then id for determinism.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyItem {
    id: ToolId,
    priority: u8,
}

impl Ord for ReadyItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is max-heap: higher priority pops first, then smaller id
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// =============================================================================
// Registry
// =============================================================================

/// In-memory tool registry. Read-heavy; writes only at startup or explicit
/// reconfiguration.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    entries: HashMap<ToolId, Arc<ToolDescriptor>>,
    /// Reverse edges, including edges from not-yet-registered targets.
    dependents: HashMap<ToolId, BTreeSet<ToolId>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    /// Build a registry from a catalog, rejecting bad entries individually.
    ///
    /// Entries whose dependencies never resolve are rejected along with every
    /// tool that depends on them.
    pub fn load(
        descriptors: impl IntoIterator<Item = ToolDescriptor>,
    ) -> (ToolRegistry, Vec<RegistrationFailure>) {
        let mut registry = ToolRegistry::new();
        let mut failures = Vec::new();

        for descriptor in descriptors {
            let id = descriptor.id.clone();
            if let Err(error) = registry.register(descriptor) {
                tracing::warn!("tool_rejected: tool={}, error={}", id, error);
                failures.push(RegistrationFailure { tool: id, error });
            }
        }

        loop {
            let mut dangling: Vec<(ToolId, ToolId)> = registry
                .entries
                .values()
                .filter_map(|d| {
                    d.dependencies
                        .iter()
                        .find(|dep| !registry.entries.contains_key(*dep))
                        .map(|dep| (d.id.clone(), dep.clone()))
                })
                .collect();
            if dangling.is_empty() {
                break;
            }
            dangling.sort();
            for (tool, missing) in dangling {
                registry.remove(&tool);
                let error = Error::validation(format!(
                    "{} depends on unregistered tool {}",
                    tool, missing
                ));
                tracing::warn!("tool_rejected: tool={}, error={}", tool, error);
                failures.push(RegistrationFailure { tool, error });
            }
        }

        (registry, failures)
    }

    /// Register a tool.
    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<()> {
        descriptor.validate()?;
        if self.entries.contains_key(&descriptor.id) {
            return Err(Error::DuplicateTool(descriptor.id));
        }
        if let Some(cycle) = self.find_cycle(&descriptor) {
            return Err(Error::CyclicDependency(cycle));
        }

        for dep in &descriptor.dependencies {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(descriptor.id.clone());
        }
        tracing::debug!(
            "tool_registered: tool={}, priority={}, deps={}",
            descriptor.id,
            descriptor.priority,
            descriptor.dependencies.len()
        );
        self.entries
            .insert(descriptor.id.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Search for a path from the new tool's dependencies back to itself.
    fn find_cycle(&self, descriptor: &ToolDescriptor) -> Option<Vec<ToolId>> {
        let target = &descriptor.id;
        let mut visited = HashSet::new();

        fn walk(
            registry: &ToolRegistry,
            node: &ToolId,
            target: &ToolId,
            path: &mut Vec<ToolId>,
            visited: &mut HashSet<ToolId>,
        ) -> bool {
            path.push(node.clone());
            if node == target {
                return true;
            }
            if visited.insert(node.clone()) {
                if let Some(entry) = registry.entries.get(node) {
                    for dep in &entry.dependencies {
                        if walk(registry, dep, target, path, visited) {
                            return true;
                        }
                    }
                }
            }
            path.pop();
            false
        }

        for dep in &descriptor.dependencies {
            let mut path = vec![target.clone()];
            if walk(self, dep, target, &mut path, &mut visited) {
                return Some(path);
            }
        }
        None
    }

    /// Drop a tool and its outgoing edges. Incoming edges stay recorded so a
    /// later re-registration is still linked to its dependents.
    pub(crate) fn remove(&mut self, id: &ToolId) -> Option<Arc<ToolDescriptor>> {
        let removed = self.entries.remove(id)?;
        for dep in &removed.dependencies {
            if let Some(set) = self.dependents.get_mut(dep) {
                set.remove(id);
            }
        }
        Some(removed)
    }

    /// Get a descriptor by id.
    pub fn get(&self, id: &ToolId) -> Result<Arc<ToolDescriptor>> {
        self.entries
            .get(id)
            .cloned()
            .ok_or_else(|| Error::unknown_tool(id))
    }

    pub fn contains(&self, id: &ToolId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All descriptors, priority descending then id ascending.
    pub fn list_by_priority_descending(&self) -> Vec<Arc<ToolDescriptor>> {
        let mut all: Vec<Arc<ToolDescriptor>> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Direct dependencies.
    pub fn dependencies_of(&self, id: &ToolId) -> Result<Vec<ToolId>> {
        Ok(self.get(id)?.dependencies.iter().cloned().collect())
    }

    /// Direct dependents (reverse edges), registered tools only.
    pub fn dependents_of(&self, id: &ToolId) -> Result<Vec<ToolId>> {
        if !self.contains(id) {
            return Err(Error::unknown_tool(id));
        }
        Ok(self
            .dependents
            .get(id)
            .map(|set| {
                set.iter()
                    .filter(|d| self.entries.contains_key(*d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Every tool reachable through dependency edges, excluding `id`.
    pub fn transitive_dependencies(&self, id: &ToolId) -> BTreeSet<ToolId> {
        self.closure(id, |registry, node| {
            registry
                .entries
                .get(node)
                .map(|d| d.dependencies.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Every tool that (transitively) depends on `id`, excluding `id`.
    pub fn transitive_dependents(&self, id: &ToolId) -> BTreeSet<ToolId> {
        self.closure(id, |registry, node| {
            registry.dependents_of(node).unwrap_or_default()
        })
    }

    fn closure<F>(&self, id: &ToolId, next: F) -> BTreeSet<ToolId>
    where
        F: Fn(&ToolRegistry, &ToolId) -> Vec<ToolId>,
    {
        let mut seen = BTreeSet::new();
        let mut stack = next(self, id);
        while let Some(node) = stack.pop() {
            if seen.insert(node.clone()) {
                stack.extend(next(self, &node));
            }
        }
        seen.remove(id);
        seen
    }

    /// Registered tools carrying a workload tag.
    pub fn ids_with_tag(&self, tag: &str) -> BTreeSet<ToolId> {
        self.entries
            .values()
            .filter(|d| d.tags.contains(tag))
            .map(|d| d.id.clone())
            .collect()
    }

    /// Dependencies first; among ready tools, higher priority then smaller id.
    pub fn topological_order(&self) -> Vec<ToolId> {
        let mut indegree: HashMap<&ToolId, usize> = self
            .entries
            .values()
            .map(|d| {
                let n = d
                    .dependencies
                    .iter()
                    .filter(|dep| self.entries.contains_key(*dep))
                    .count();
                (&d.id, n)
            })
            .collect();

        let mut ready: BinaryHeap<ReadyItem> = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .filter_map(|(id, _)| self.entries.get(*id))
            .map(|d| ReadyItem {
                id: d.id.clone(),
                priority: d.priority,
            })
            .collect();

        let mut order = Vec::with_capacity(self.entries.len());
        while let Some(item) = ready.pop() {
            if let Some(children) = self.dependents.get(&item.id) {
                for child in children {
                    if let Some(n) = indegree.get_mut(child) {
                        *n = n.saturating_sub(1);
                        if *n == 0 {
                            if let Some(d) = self.entries.get(child) {
                                ready.push(ReadyItem {
                                    id: d.id.clone(),
                                    priority: d.priority,
                                });
                            }
                        }
                    }
                }
            }
            order.push(item.id);
        }
        order
    }
}

// =============================================================================
// Tests
// =============================================================================
