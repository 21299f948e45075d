//! Planner throughput benchmark.
//!
//! Measures one planning pass over registries of increasing size, at Low
//! (mass start in dependency order) and at Critical (policy plus eviction)
//! using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeMap;
use warden_core::kernel::planner::{plan, PlanInput, ToolView};
use warden_core::kernel::types::ToolState;
use warden_core::{ResourceCeiling, ResourceLevel, ToolDescriptor, ToolId, ToolRegistry};

/// Chains of five tools, each depending on its predecessor.
fn catalog(size: usize) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for i in 0..size {
        let priority = (i % 10) as u8 + 1;
        let mut descriptor =
            ToolDescriptor::new(ToolId::must(&format!("t{i}")), priority, 2.0, 1 << 20);
        if i % 5 != 0 {
            descriptor = descriptor.depends_on(&format!("t{}", i - 1));
        }
        registry.register(descriptor).unwrap();
    }
    registry
}

fn views(registry: &ToolRegistry, state: ToolState) -> BTreeMap<ToolId, ToolView> {
    registry
        .topological_order()
        .into_iter()
        .map(|id| (id, ToolView::new(state)))
        .collect()
}

fn bench_plan(c: &mut Criterion) {
    let sizes: &[usize] = &[10, 100, 1000];
    let ceiling = ResourceCeiling {
        cpu_percent: Some(50.0),
        memory_bytes: Some(64 << 20),
        gpu_percent: None,
    };

    for (name, level, state) in [
        ("plan_low_cold_start", ResourceLevel::Low, ToolState::Stopped),
        ("plan_critical_running", ResourceLevel::Critical, ToolState::Running),
    ] {
        let mut group = c.benchmark_group(name);
        for &size in sizes {
            let registry = catalog(size);
            let tools = views(&registry, state);
            group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
                b.iter(|| {
                    let input = PlanInput {
                        registry: &registry,
                        tools: &tools,
                        level,
                        calm_streak: 0,
                        hysteresis_ticks: 3,
                        profile: None,
                        ceiling,
                    };
                    black_box(plan(black_box(&input)))
                });
            });
        }
        group.finish();
    }
}

criterion_group!(benches, bench_plan);
criterion_main!(benches);
