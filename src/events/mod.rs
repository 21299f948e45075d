//! Scheduler events - the externally observable side effects of the control loop.
//!
//! Monitoring and reporting collaborators consume these through
//! `SchedulerHandle::events()`; nothing else is mutated by the scheduler.

pub mod bus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kernel::resources::ResourceLevel;
use crate::kernel::types::{ToolState, TransitionReason, ToolStatus};
use crate::types::{ProfileName, ToolId};

pub use bus::{BusStats, EventBus};

/// One tool state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChangeEvent {
    pub tool: ToolId,
    pub old_state: ToolState,
    pub new_state: ToolState,
    pub reason: TransitionReason,
    pub status: ToolStatus,
    pub generation: u64,
    pub at: DateTime<Utc>,
}

/// Why a resource alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertReason {
    /// Critical pressure held for this many consecutive ticks.
    SustainedCritical { ticks: u32 },
    /// Every evictable tool is already going down and the ceiling is still breached.
    CeilingUnresolved,
}

/// System-level resource exhaustion alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceAlert {
    pub reason: AlertReason,
    pub level: ResourceLevel,
    pub at: DateTime<Utc>,
}

/// Everything published on the event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    StateChanged(StateChangeEvent),
    ResourceAlert(ResourceAlert),
    ProfileActivated { name: ProfileName },
    ProfileDeactivated { name: ProfileName },
}

impl SchedulerEvent {
    /// Tool the event is about, if any.
    pub fn tool(&self) -> Option<&ToolId> {
        match self {
            SchedulerEvent::StateChanged(change) => Some(&change.tool),
            _ => None,
        }
    }

    pub fn as_state_change(&self) -> Option<&StateChangeEvent> {
        match self {
            SchedulerEvent::StateChanged(change) => Some(change),
            _ => None,
        }
    }
}
