//! Capability interface supplied by each tool implementation.
//!
//! The scheduler never looks inside a tool: it only drives these four
//! operations and optionally probes liveness.

use async_trait::async_trait;
use std::sync::Arc;

use crate::types::Result;

/// Lifecycle operations of one tool instance.
///
/// Each call must eventually return; the scheduler applies its own deadline
/// and treats an overrun as a failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolCapability: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Liveness check for a running instance. Success counts as a heartbeat.
    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared handle to a capability.
pub type SharedCapability = Arc<dyn ToolCapability>;

/// Capability for tools whose process is managed elsewhere. Every operation
/// succeeds immediately; liveness comes from externally reported heartbeats.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedTool;

#[async_trait]
impl ToolCapability for DetachedTool {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        Ok(())
    }
}
