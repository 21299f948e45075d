//! Kernel types: ToolState, ToolRuntime, lifecycle commands and tick reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::resources::ResourceLevel;
use crate::events::AlertReason;
use crate::tools::health::HealthClassification;
use crate::types::ToolId;

/// Tool lifecycle state.
///
/// State transitions:
/// ```text
/// STOPPED → STARTING → RUNNING → PAUSING → PAUSED → RESUMING → RUNNING
///              ↓          ↓                   ↓
///           STOPPING ← ───┴───────────────────┘
///              ↓
///           STOPPED            (any transient or RUNNING) → FAILED → {STARTING | STOPPING | STOPPED}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolState {
    Stopped,
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Failed,
}

impl ToolState {
    /// A command for this tool is in flight.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ToolState::Starting | ToolState::Pausing | ToolState::Resuming | ToolState::Stopping
        )
    }

    /// Running or on its way back to Running.
    pub fn is_up(self) -> bool {
        matches!(
            self,
            ToolState::Starting | ToolState::Running | ToolState::Resuming
        )
    }

    /// Paused or about to be.
    pub fn is_paused(self) -> bool {
        matches!(self, ToolState::Pausing | ToolState::Paused)
    }

    /// Stopped, stopping or failed.
    pub fn is_down(self) -> bool {
        matches!(
            self,
            ToolState::Stopped | ToolState::Stopping | ToolState::Failed
        )
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: ToolState) -> bool {
        match (self, to) {
            // STOPPED
            (ToolState::Stopped, ToolState::Starting) => true,
            // STARTING
            (ToolState::Starting, ToolState::Running) => true,
            (ToolState::Starting, ToolState::Stopping) => true, // Cancelled
            (ToolState::Starting, ToolState::Failed) => true,
            // RUNNING
            (ToolState::Running, ToolState::Pausing) => true,
            (ToolState::Running, ToolState::Stopping) => true,
            (ToolState::Running, ToolState::Failed) => true,
            // PAUSING
            (ToolState::Pausing, ToolState::Paused) => true,
            (ToolState::Pausing, ToolState::Failed) => true,
            // PAUSED
            (ToolState::Paused, ToolState::Resuming) => true,
            (ToolState::Paused, ToolState::Stopping) => true,
            (ToolState::Paused, ToolState::Failed) => true,
            // RESUMING
            (ToolState::Resuming, ToolState::Running) => true,
            (ToolState::Resuming, ToolState::Failed) => true,
            // STOPPING
            (ToolState::Stopping, ToolState::Stopped) => true,
            (ToolState::Stopping, ToolState::Failed) => true,
            // FAILED
            (ToolState::Failed, ToolState::Starting) => true, // Restart
            (ToolState::Failed, ToolState::Stopping) => true, // Cleanup
            (ToolState::Failed, ToolState::Stopped) => true,  // Cleanup already failed
            // All other transitions invalid
            _ => false,
        }
    }
}

impl fmt::Display for ToolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ToolState::Stopped => "stopped",
            ToolState::Starting => "starting",
            ToolState::Running => "running",
            ToolState::Pausing => "pausing",
            ToolState::Paused => "paused",
            ToolState::Resuming => "resuming",
            ToolState::Stopping => "stopping",
            ToolState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Operation sent through a tool's capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleCommand {
    Start,
    Stop,
    Pause,
    Resume,
}

impl LifecycleCommand {
    /// State recorded while the command is in flight.
    pub fn transient_state(self) -> ToolState {
        match self {
            LifecycleCommand::Start => ToolState::Starting,
            LifecycleCommand::Stop => ToolState::Stopping,
            LifecycleCommand::Pause => ToolState::Pausing,
            LifecycleCommand::Resume => ToolState::Resuming,
        }
    }

    /// State reached on success.
    pub fn target_state(self) -> ToolState {
        match self {
            LifecycleCommand::Start | LifecycleCommand::Resume => ToolState::Running,
            LifecycleCommand::Stop => ToolState::Stopped,
            LifecycleCommand::Pause => ToolState::Paused,
        }
    }

    /// Stops and pauses release resources and are issued before starts.
    pub fn is_release(self) -> bool {
        matches!(self, LifecycleCommand::Stop | LifecycleCommand::Pause)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleCommand::Start => "start",
            LifecycleCommand::Stop => "stop",
            LifecycleCommand::Pause => "pause",
            LifecycleCommand::Resume => "resume",
        }
    }
}

impl fmt::Display for LifecycleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a state change happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    UserEnable,
    UserDisable,
    Profile,
    /// Automatic priority/resource policy.
    ResourcePolicy,
    /// Calm streak reached; suppressed tool brought back.
    Hysteresis,
    /// Dependency left Running.
    Dependency,
    Eviction,
    Restart,
    CommandCompleted,
    CommandFailed,
    CommandTimeout,
    HealthCheckFailed,
    RetriesExhausted,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransitionReason::UserEnable => "user_enable",
            TransitionReason::UserDisable => "user_disable",
            TransitionReason::Profile => "profile",
            TransitionReason::ResourcePolicy => "resource_policy",
            TransitionReason::Hysteresis => "hysteresis",
            TransitionReason::Dependency => "dependency",
            TransitionReason::Eviction => "eviction",
            TransitionReason::Restart => "restart",
            TransitionReason::CommandCompleted => "command_completed",
            TransitionReason::CommandFailed => "command_failed",
            TransitionReason::CommandTimeout => "command_timeout",
            TransitionReason::HealthCheckFailed => "health_check_failed",
            TransitionReason::RetriesExhausted => "retries_exhausted",
        };
        f.write_str(name)
    }
}

/// Soft status shown next to the state in `list_tools`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    #[default]
    Ok,
    /// Desired Running, waiting for a dependency to be observed Running.
    AwaitingDependency,
    /// A dependency is Failed or needs intervention.
    DependencyUnavailable,
    /// Failed, waiting for the restart backoff to elapse.
    BackingOff,
    /// Retry budget exhausted; only an explicit enable restarts it.
    NeedsIntervention,
}

/// Explicit operator command, sticky until the opposite command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Enable,
    Disable,
}

/// How the automatic policy last took a tool down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Suppression {
    /// Auto-paused under High/Critical; may resume at Medium after the streak.
    Paused,
    /// Stopped by Critical policy or eviction; may restart at Low after the streak.
    Stopped,
}

/// Scheduler-owned runtime record of one tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolRuntime {
    pub state: ToolState,
    /// Bumped on every transition; completions carrying an older value are stale.
    pub generation: u64,
    pub status: ToolStatus,
    pub changed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Monotonic start sequence, larger = more recently started.
    pub start_order: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppression: Option<Suppression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<LifecycleCommand>,
    /// Command whose failure put the tool in Failed; `None` for health failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_command: Option<LifecycleCommand>,
}

impl ToolRuntime {
    pub fn new() -> Self {
        Self {
            state: ToolState::Stopped,
            generation: 0,
            status: ToolStatus::Ok,
            changed_at: Utc::now(),
            started_at: None,
            start_order: 0,
            intent: None,
            suppression: None,
            pending: None,
            failed_command: None,
        }
    }

    /// Move to `to`, bumping the generation. Returns the previous state.
    pub(crate) fn transition(&mut self, to: ToolState) -> ToolState {
        let old = self.state;
        self.state = to;
        self.generation += 1;
        self.changed_at = Utc::now();
        old
    }
}

impl Default for ToolRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Row returned by `list_tools`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSummary {
    pub id: ToolId,
    pub priority: u8,
    pub state: ToolState,
    pub health: HealthClassification,
    pub status: ToolStatus,
    pub generation: u64,
}

/// A command issued during a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedCommand {
    pub tool: ToolId,
    pub command: LifecycleCommand,
    pub reason: TransitionReason,
    pub generation: u64,
}

/// Outcome of one control-loop pass.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    /// Periodic tick counter (reconciles reuse the last value).
    pub tick: u64,
    /// False for fast-path reconciles, which do not advance hysteresis.
    pub periodic: bool,
    pub level: ResourceLevel,
    pub stale: bool,
    pub calm_streak: u32,
    /// In issuance order.
    pub commands: Vec<IssuedCommand>,
    pub evicted: Vec<ToolId>,
    pub alerts: Vec<AlertReason>,
    pub completions_applied: usize,
    pub completions_discarded: usize,
}

impl TickReport {
    /// Commands for one tool, in issuance order.
    pub fn commands_for(&self, tool: &str) -> Vec<LifecycleCommand> {
        self.commands
            .iter()
            .filter(|c| c.tool.as_str() == tool)
            .map(|c| c.command)
            .collect()
    }
}
