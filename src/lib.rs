//! # Warden Core - Resource-Aware Tool Lifecycle Scheduler
//!
//! Keeps a set of host-local tools (workers, daemons, model servers) inside the
//! host's resource budget:
//! - Tool registry with priorities, resource budgets and an acyclic dependency graph
//! - Host resource sampling classified into Low/Medium/High/Critical levels
//! - Priority-driven pause/stop under pressure with hysteresis on the way back
//! - Deterministic eviction under Critical pressure
//! - Health monitoring with heartbeats, error windows and restart backoff
//! - Workload profiles that force tools on or off
//!
//! ## Architecture
//!
//! A single `Scheduler` owns all tool state. Commands run concurrently and
//! report back tagged with the generation they were issued under:
//! ```text
//!                    ┌─────────────────────────────────┐
//!   enable/disable → │           Scheduler             │ → StateChangeEvent stream
//!                    │  ┌─────────┐ ┌─────────┐        │
//!                    │  │ Planner │ │ Health  │        │
//!                    │  │         │ │ Monitor │        │
//!                    │  └─────────┘ └─────────┘        │
//!                    │  ┌─────────┐ ┌─────────┐        │
//!                    │  │Workload │ │Dispatch-│ ─────→ │ start/stop/pause/resume
//!                    │  │Optimizer│ │   er    │ ←───── │ completions
//!                    │  └─────────┘ └─────────┘        │
//!                    └─────────────────────────────────┘
//!                                   ↑ snapshot
//!                            Resource sampler
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod events;
pub mod kernel;
pub mod tools;
pub mod types;
pub mod validation;
pub mod workload;

// Internal utilities
pub mod observability;

pub use events::{EventBus, SchedulerEvent, StateChangeEvent};
pub use kernel::resources::{ResourceCeiling, ResourceLevel, ResourceSnapshot, Thresholds};
pub use kernel::sampler::{ManualSampler, ResourceSampler, SamplerHandle, SysinfoSampler};
pub use kernel::service::{SchedulerHandle, SchedulerService};
pub use kernel::{LoadReport, Scheduler, TickReport, ToolState, ToolStatus, ToolSummary};
pub use tools::{DetachedTool, ToolCapability, ToolDescriptor, ToolRegistry};
pub use types::{Config, Error, ProfileName, Result, ToolId};
pub use workload::{WorkloadOptimizer, WorkloadProfile};
