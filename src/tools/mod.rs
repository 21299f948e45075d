//! Tool infrastructure: registry, capability interface, process-backed tools
//! and health tracking.
//!
//! The scheduler never looks inside a tool. It reads descriptors from the
//! registry, drives the capability and keeps per-tool health here.

pub mod capability;
pub mod command;
pub mod health;
pub mod registry;

pub use capability::{DetachedTool, SharedCapability, ToolCapability};
pub use command::{CommandSpec, CommandTool};
pub use health::{HealthClassification, HealthConfig, HealthMonitor, HealthRecord, RetryConfig};
pub use registry::{RegistrationFailure, SharedRegistry, ToolDescriptor, ToolRegistry};
