//! Core types for the warden scheduler.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ToolId, ProfileName)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures loaded once at startup

mod config;
mod errors;
mod ids;

pub use config::{Config, ObservabilityConfig, SamplerConfig, SchedulerConfig, ToolConfig};
pub use errors::{Error, Result};
pub use ids::{ProfileName, ToolId};
