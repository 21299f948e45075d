//! Tick planner - desired states, dependency gating, eviction and command order.
//!
//! Pure: the same registry, tool views, level, streak, profile and ceiling
//! always produce the same plan. The scheduler copies its runtime state into
//! [`ToolView`]s at tick start and applies the returned [`Plan`].
//!
//! Desired state precedence, highest first:
//! 1. explicit operator intent (enable/disable),
//! 2. active profile forced sets,
//! 3. automatic priority/resource policy with the hysteresis gate.

use std::collections::{BTreeMap, HashMap};

use super::eviction::{select_evictions, Holding};
use super::resources::{ResourceCeiling, ResourceLevel};
use super::types::{Intent, LifecycleCommand, Suppression, ToolState, ToolStatus, TransitionReason};
use crate::tools::registry::{ToolDescriptor, ToolRegistry};
use crate::types::ToolId;
use crate::workload::ResolvedProfile;

/// Highest priority stopped outright under Critical.
pub const CRITICAL_STOP_PRIORITY: u8 = 3;
/// Highest priority paused under High (and Critical).
pub const HIGH_PAUSE_PRIORITY: u8 = 5;

/// Copy-on-read view of one tool taken at tick start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolView {
    pub state: ToolState,
    pub intent: Option<Intent>,
    pub suppression: Option<Suppression>,
    pub start_order: u64,
    pub needs_intervention: bool,
    /// For Failed tools: restart backoff has elapsed.
    pub restart_ready: bool,
    /// Failed because a Stop did not complete; the next Stop waits for backoff.
    pub stop_failed: bool,
}

impl ToolView {
    pub fn new(state: ToolState) -> Self {
        Self {
            state,
            intent: None,
            suppression: None,
            start_order: 0,
            needs_intervention: false,
            restart_ready: true,
            stop_failed: false,
        }
    }
}

/// Everything a plan depends on.
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    pub registry: &'a ToolRegistry,
    pub tools: &'a BTreeMap<ToolId, ToolView>,
    pub level: ResourceLevel,
    /// Consecutive periodic ticks at or below Medium.
    pub calm_streak: u32,
    pub hysteresis_ticks: u32,
    pub profile: Option<&'a ResolvedProfile>,
    /// Ceiling with implicit dimensions already resolved.
    pub ceiling: ResourceCeiling,
}

/// Where a tool should end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCommand {
    pub tool: ToolId,
    pub command: LifecycleCommand,
    pub reason: TransitionReason,
}

/// Result of planning one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Stops and pauses in reverse dependency order, then starts and resumes
    /// in dependency order.
    pub commands: Vec<PlannedCommand>,
    pub statuses: BTreeMap<ToolId, ToolStatus>,
    pub evicted: Vec<ToolId>,
    pub ceiling_unresolved: bool,
}

impl Plan {
    pub fn command_for(&self, tool: &str) -> Option<LifecycleCommand> {
        self.commands
            .iter()
            .find(|c| c.tool.as_str() == tool)
            .map(|c| c.command)
    }

    pub fn status_of(&self, tool: &str) -> ToolStatus {
        self.statuses.get(tool).copied().unwrap_or_default()
    }
}

// =============================================================================
// Desired state
// =============================================================================

/// Resolve the desired state of one tool from the three precedence layers.
pub fn desired_state(
    input: &PlanInput<'_>,
    descriptor: &ToolDescriptor,
    view: &ToolView,
) -> (Target, TransitionReason) {
    match view.intent {
        Some(Intent::Enable) => return (Target::Running, TransitionReason::UserEnable),
        Some(Intent::Disable) => return (Target::Stopped, TransitionReason::UserDisable),
        None => {}
    }

    if let Some(profile) = input.profile {
        if profile.force_disabled.contains(&descriptor.id) {
            return (Target::Stopped, TransitionReason::Profile);
        }
        if profile.force_enabled.contains(&descriptor.id) {
            return (Target::Running, TransitionReason::Profile);
        }
    }

    auto_policy(input, descriptor, view)
}

fn auto_policy(
    input: &PlanInput<'_>,
    descriptor: &ToolDescriptor,
    view: &ToolView,
) -> (Target, TransitionReason) {
    let policy = TransitionReason::ResourcePolicy;
    if descriptor.is_must_run() {
        return (Target::Running, policy);
    }

    let level = input.level;
    let priority = descriptor.priority;
    let hold_down = if view.state.is_down() {
        Target::Stopped
    } else {
        Target::Paused
    };

    if level == ResourceLevel::Critical && priority <= CRITICAL_STOP_PRIORITY {
        return (Target::Stopped, policy);
    }
    if level >= ResourceLevel::High && priority <= HIGH_PAUSE_PRIORITY {
        return (hold_down, policy);
    }

    let streak_reached = level.is_calm() && input.calm_streak >= input.hysteresis_ticks;
    match view.suppression {
        Some(Suppression::Paused) if streak_reached => (Target::Running, TransitionReason::Hysteresis),
        Some(Suppression::Paused) => (hold_down, policy),
        Some(Suppression::Stopped) if streak_reached && level == ResourceLevel::Low => {
            (Target::Running, TransitionReason::Hysteresis)
        }
        Some(Suppression::Stopped) => (Target::Stopped, policy),
        None if level == ResourceLevel::Low => (Target::Running, policy),
        // Above Low nothing new is started; whatever is up stays up.
        None => match view.state {
            ToolState::Stopped | ToolState::Stopping => (Target::Stopped, policy),
            _ => (Target::Running, policy),
        },
    }
}

// =============================================================================
// Dependency gating
// =============================================================================

/// Per-tool decision during planning.
#[derive(Debug, Clone)]
struct Decision {
    state: ToolState,
    command: Option<(LifecycleCommand, TransitionReason)>,
    status: ToolStatus,
    position: usize,
    start_order: u64,
}

impl Decision {
    /// Observed Running and not being taken down this tick.
    fn stays_running(&self) -> bool {
        self.state == ToolState::Running && self.command.is_none()
    }

    fn heading_to_pause(&self) -> bool {
        match self.command {
            Some((LifecycleCommand::Pause, _)) => true,
            Some(_) => false,
            None => self.state.is_paused(),
        }
    }

    fn unavailable(&self) -> bool {
        self.state == ToolState::Failed
            || matches!(
                self.status,
                ToolStatus::DependencyUnavailable | ToolStatus::NeedsIntervention
            )
    }

    /// `Some(paused)` if the tool is projected to hold resources after the tick.
    fn holding(&self) -> Option<bool> {
        match self.command {
            Some((LifecycleCommand::Start | LifecycleCommand::Resume, _)) => Some(false),
            Some((LifecycleCommand::Pause, _)) => Some(true),
            Some((LifecycleCommand::Stop, _)) => None,
            None => match self.state {
                ToolState::Running | ToolState::Starting | ToolState::Resuming => Some(false),
                ToolState::Paused | ToolState::Pausing => Some(true),
                _ => None,
            },
        }
    }

    fn evictable(&self) -> bool {
        match self.command {
            Some((LifecycleCommand::Stop, _)) => false,
            Some(_) => true,
            None => matches!(
                self.state,
                ToolState::Running | ToolState::Paused | ToolState::Starting
            ),
        }
    }

    fn evict(&mut self) {
        match (self.command, self.state) {
            (Some((LifecycleCommand::Start, _)), ToolState::Stopped) => self.command = None,
            _ => self.command = Some((LifecycleCommand::Stop, TransitionReason::Eviction)),
        }
        self.status = ToolStatus::Ok;
    }
}

#[derive(Debug, Clone, Copy)]
struct DependencyGate {
    all_running: bool,
    any_unavailable: bool,
    /// Some dependency is leaving Running for something other than Paused.
    any_going_down: bool,
}

impl DependencyGate {
    fn waiting_status(self) -> ToolStatus {
        if self.any_unavailable {
            ToolStatus::DependencyUnavailable
        } else {
            ToolStatus::AwaitingDependency
        }
    }
}

fn gate(descriptor: &ToolDescriptor, decisions: &HashMap<ToolId, Decision>) -> DependencyGate {
    let mut gate = DependencyGate {
        all_running: true,
        any_unavailable: false,
        any_going_down: false,
    };
    for dependency in &descriptor.dependencies {
        match decisions.get(dependency) {
            Some(d) => {
                if !d.stays_running() {
                    gate.all_running = false;
                    if !d.heading_to_pause() {
                        gate.any_going_down = true;
                    }
                }
                if d.unavailable() {
                    gate.any_unavailable = true;
                }
            }
            None => {
                gate.all_running = false;
                gate.any_going_down = true;
                gate.any_unavailable = true;
            }
        }
    }
    gate
}

fn decide(
    view: &ToolView,
    target: Target,
    reason: TransitionReason,
    gate: DependencyGate,
    position: usize,
) -> Decision {
    use LifecycleCommand::*;

    let mut d = Decision {
        state: view.state,
        command: None,
        status: ToolStatus::Ok,
        position,
        start_order: view.start_order,
    };

    match target {
        Target::Running => match view.state {
            ToolState::Stopped | ToolState::Failed if view.needs_intervention => {}
            ToolState::Stopped => {
                if gate.all_running {
                    d.command = Some((Start, reason));
                } else {
                    d.status = gate.waiting_status();
                }
            }
            ToolState::Failed => {
                if !gate.all_running {
                    d.status = gate.waiting_status();
                } else if view.restart_ready {
                    d.command = Some((Start, TransitionReason::Restart));
                } else {
                    d.status = ToolStatus::BackingOff;
                }
            }
            ToolState::Paused => {
                if gate.all_running {
                    d.command = Some((Resume, reason));
                } else {
                    d.status = gate.waiting_status();
                }
            }
            ToolState::Running => {
                if !gate.all_running {
                    let command = if gate.any_going_down { Stop } else { Pause };
                    d.command = Some((command, TransitionReason::Dependency));
                    d.status = gate.waiting_status();
                }
            }
            ToolState::Starting | ToolState::Resuming => {
                if !gate.all_running {
                    d.status = gate.waiting_status();
                }
            }
            ToolState::Pausing | ToolState::Stopping => {}
        },
        Target::Paused => match view.state {
            ToolState::Running => d.command = Some((Pause, reason)),
            ToolState::Failed => d.status = ToolStatus::BackingOff,
            _ => {}
        },
        Target::Stopped => match view.state {
            ToolState::Running | ToolState::Paused | ToolState::Starting => {
                d.command = Some((Stop, reason));
            }
            ToolState::Failed if view.stop_failed && !view.restart_ready => {
                d.status = ToolStatus::BackingOff;
            }
            // The process may still be alive; always go through the capability.
            ToolState::Failed => d.command = Some((Stop, reason)),
            _ => {}
        },
    }

    if view.needs_intervention && d.command.is_none() {
        d.status = ToolStatus::NeedsIntervention;
    }
    d
}

// =============================================================================
// Plan
// =============================================================================

/// Compute the plan for one tick.
pub fn plan(input: &PlanInput<'_>) -> Plan {
    let order = input.registry.topological_order();
    let mut decisions: HashMap<ToolId, Decision> = HashMap::with_capacity(order.len());

    for (position, id) in order.iter().enumerate() {
        let (Some(view), Ok(descriptor)) = (input.tools.get(id), input.registry.get(id)) else {
            continue;
        };
        let (target, reason) = desired_state(input, &descriptor, view);
        let gate = gate(&descriptor, &decisions);
        decisions.insert(id.clone(), decide(view, target, reason, gate, position));
    }

    let mut plan = Plan::default();

    if input.level == ResourceLevel::Critical {
        let holdings: BTreeMap<ToolId, Holding> = decisions
            .iter()
            .filter_map(|(id, d)| {
                let paused = d.holding()?;
                let descriptor = input.registry.get(id).ok()?;
                Some((
                    id.clone(),
                    Holding {
                        descriptor,
                        paused,
                        start_order: d.start_order,
                        evictable: d.evictable(),
                    },
                ))
            })
            .collect();
        let outcome = select_evictions(&holdings, input.registry, &input.ceiling);
        for id in &outcome.evicted {
            if let Some(d) = decisions.get_mut(id) {
                d.evict();
            }
        }
        plan.evicted = outcome.evicted;
        plan.ceiling_unresolved = outcome.unresolved;
    }

    let mut ranked: Vec<(&ToolId, &Decision)> = decisions.iter().collect();
    ranked.sort_by_key(|(_, d)| d.position);

    let mut releases = Vec::new();
    let mut acquires = Vec::new();
    for (id, d) in &ranked {
        plan.statuses.insert((*id).clone(), d.status);
        if let Some((command, reason)) = d.command {
            let planned = PlannedCommand {
                tool: (*id).clone(),
                command,
                reason,
            };
            if command.is_release() {
                releases.push(planned);
            } else {
                acquires.push(planned);
            }
        }
    }
    releases.reverse();
    plan.commands = releases;
    plan.commands.extend(acquires);
    plan
}
