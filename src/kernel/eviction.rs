//! Eviction under Critical pressure.
//!
//! Works on declared budgets of the tools projected to keep holding resources
//! after the tick. Order is total and stable: lowest priority first, then larger
//! memory budget, then most recently started, then id.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::resources::{ProjectedUsage, ResourceCeiling};
use crate::tools::registry::{ToolDescriptor, ToolRegistry};
use crate::types::ToolId;

/// A tool projected to hold resources after this tick.
#[derive(Debug, Clone)]
pub struct Holding {
    pub descriptor: Arc<ToolDescriptor>,
    /// Warm-paused: keeps memory and GPU, no CPU.
    pub paused: bool,
    pub start_order: u64,
    /// Can be sent a stop (or have its start withdrawn) this tick.
    pub evictable: bool,
}

/// Tools chosen for eviction, in eviction order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub evicted: Vec<ToolId>,
    /// Projected usage still exceeds the ceiling.
    pub unresolved: bool,
}

/// Eviction order between two holdings.
pub fn eviction_cmp(a: &Holding, b: &Holding) -> Ordering {
    a.descriptor
        .priority
        .cmp(&b.descriptor.priority)
        .then_with(|| b.descriptor.max_memory_bytes.cmp(&a.descriptor.max_memory_bytes))
        .then_with(|| b.start_order.cmp(&a.start_order))
        .then_with(|| a.descriptor.id.cmp(&b.descriptor.id))
}

pub fn projected_usage<'a>(holdings: impl IntoIterator<Item = &'a Holding>) -> ProjectedUsage {
    let mut usage = ProjectedUsage::default();
    for holding in holdings {
        usage.add(&holding.descriptor, holding.paused);
    }
    usage
}

/// Pick tools to evict until projected usage fits under `ceiling` or only
/// must-run tools remain. A tool goes together with every dependent still
/// holding resources; a tool with a must-run or non-evictable dependent is
/// skipped.
pub fn select_evictions(
    holdings: &BTreeMap<ToolId, Holding>,
    registry: &ToolRegistry,
    ceiling: &ResourceCeiling,
) -> EvictionOutcome {
    let mut usage = projected_usage(holdings.values());
    if !usage.exceeds(ceiling) {
        return EvictionOutcome::default();
    }

    let mut candidates: Vec<&Holding> = holdings
        .values()
        .filter(|h| h.evictable && !h.descriptor.is_must_run())
        .collect();
    candidates.sort_by(|a, b| eviction_cmp(a, b));

    let mut retained: BTreeSet<ToolId> = holdings.keys().cloned().collect();
    let mut evicted = Vec::new();

    for candidate in candidates {
        if !usage.exceeds(ceiling) {
            break;
        }
        let id = &candidate.descriptor.id;
        if !retained.contains(id) {
            continue;
        }

        let dependents: Vec<&Holding> = registry
            .transitive_dependents(id)
            .iter()
            .filter(|d| retained.contains(*d))
            .filter_map(|d| holdings.get(d))
            .collect();
        if dependents
            .iter()
            .any(|d| d.descriptor.is_must_run() || !d.evictable)
        {
            tracing::debug!("eviction_skipped: tool={}, reason=protected_dependent", id);
            continue;
        }

        for holding in std::iter::once(candidate).chain(dependents) {
            let victim = &holding.descriptor.id;
            retained.remove(victim);
            usage.remove(&holding.descriptor, holding.paused);
            tracing::info!(
                "tool_evicted: tool={}, priority={}, memory_bytes={}",
                victim,
                holding.descriptor.priority,
                holding.descriptor.max_memory_bytes
            );
            evicted.push(victim.clone());
        }
    }

    EvictionOutcome {
        unresolved: usage.exceeds(ceiling),
        evicted,
    }
}
