//! Scheduler - the single decision-maker of the control loop.
//!
//! The Scheduler owns every `ToolRuntime` and the health monitor. Each pass
//! drains command completions, reads one snapshot, plans against a copy of the
//! tool states and then applies the plan. Tool operations never run inside a
//! pass: they are dispatched and report back through the signal channel.
//! Subsystems (planner, eviction, dispatcher, sampler) are plain values owned
//! here, not separate actors.

pub mod eviction;
pub mod lifecycle;
pub mod planner;
pub mod recovery;
pub mod resources;
pub mod sampler;
pub mod service;
pub mod types;

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::events::{AlertReason, EventBus, ResourceAlert, SchedulerEvent, StateChangeEvent};
use crate::tools::capability::SharedCapability;
use crate::tools::health::{HealthMonitor, HealthRecord, RestartGate, RetryDecision};
use crate::tools::registry::{RegistrationFailure, SharedRegistry, ToolDescriptor, ToolRegistry};
use crate::types::{Config, Error, ProfileName, Result, SchedulerConfig, ToolConfig, ToolId};
use crate::workload::{WorkloadOptimizer, WorkloadProfile};

use lifecycle::{Completion, Dispatcher, Prelude, ProbeOutcome, Signal};
use planner::{PlanInput, ToolView};
use resources::{ResourceLevel, Thresholds};
use sampler::SamplerHandle;

pub use types::{
    IssuedCommand, LifecycleCommand, TickReport, ToolRuntime, ToolState, ToolStatus, ToolSummary,
    TransitionReason,
};

/// Upper bound on reconcile passes in [`Scheduler::settle`].
const SETTLE_LIMIT: usize = 64;

/// Entries rejected while building a scheduler from configuration.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub rejected_tools: Vec<RegistrationFailure>,
    pub rejected_profiles: Vec<(ProfileName, Error)>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.rejected_tools.is_empty() && self.rejected_profiles.is_empty()
    }
}

/// Lifecycle scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    thresholds: Thresholds,
    registry: SharedRegistry,
    capabilities: HashMap<ToolId, SharedCapability>,
    runtimes: BTreeMap<ToolId, ToolRuntime>,
    health: HealthMonitor,
    optimizer: WorkloadOptimizer,
    sampler: SamplerHandle,
    events: EventBus,
    dispatcher: Dispatcher,
    /// Task of the latest command dispatched per tool.
    in_flight: HashMap<ToolId, JoinHandle<()>>,
    signals: mpsc::UnboundedReceiver<Signal>,
    wake: Arc<Notify>,

    /// Consecutive periodic ticks at or below Medium.
    calm_streak: u32,
    /// Consecutive periodic ticks at Critical.
    critical_streak: u32,
    last_level: Option<ResourceLevel>,
    start_seq: u64,
    tick_count: u64,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tools", &self.runtimes)
            .field("last_level", &self.last_level)
            .field("calm_streak", &self.calm_streak)
            .field("tick_count", &self.tick_count)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Empty scheduler; tools are added with [`Scheduler::register_tool`].
    pub fn new(
        config: SchedulerConfig,
        thresholds: Thresholds,
        health: HealthMonitor,
        sampler: SamplerHandle,
    ) -> Self {
        Self::with_registry(ToolRegistry::new(), config, thresholds, health, sampler)
    }

    fn with_registry(
        registry: ToolRegistry,
        config: SchedulerConfig,
        thresholds: Thresholds,
        health: HealthMonitor,
        sampler: SamplerHandle,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let wake = Arc::new(Notify::new());
        let dispatcher = Dispatcher::new(
            config.in_flight_limit(),
            config.command_timeout,
            tx,
            Arc::clone(&wake),
        );
        Self {
            events: EventBus::new(config.event_capacity),
            config,
            thresholds,
            registry: registry.shared(),
            capabilities: HashMap::new(),
            runtimes: BTreeMap::new(),
            health,
            optimizer: WorkloadOptimizer::new(),
            sampler,
            dispatcher,
            in_flight: HashMap::new(),
            signals: rx,
            wake,
            calm_streak: 0,
            critical_streak: 0,
            last_level: None,
            start_seq: 0,
            tick_count: 0,
        }
    }

    /// Build a scheduler from a validated configuration. Bad tools and
    /// profiles are rejected individually and reported; the rest load.
    pub fn from_config(
        config: &Config,
        sampler: SamplerHandle,
        mut capability_for: impl FnMut(&ToolConfig) -> SharedCapability,
    ) -> (Self, LoadReport) {
        let (registry, rejected_tools) =
            ToolRegistry::load(config.tools.iter().map(|t| t.descriptor.clone()));

        let mut scheduler = Self::with_registry(
            ToolRegistry::new(),
            config.scheduler.clone(),
            config.thresholds,
            HealthMonitor::new(config.health.clone(), config.retry.clone()),
            sampler,
        );

        for tool in &config.tools {
            let id = &tool.descriptor.id;
            if registry.contains(id) && !scheduler.runtimes.contains_key(id) {
                scheduler.runtimes.insert(id.clone(), ToolRuntime::new());
                scheduler.capabilities.insert(id.clone(), capability_for(tool));
            }
        }

        let mut rejected_profiles = Vec::new();
        for profile in &config.profiles {
            if let Err(error) = scheduler.optimizer.define(profile.clone(), &registry) {
                tracing::warn!("profile_rejected: profile={}, error={}", profile.name, error);
                rejected_profiles.push((profile.name.clone(), error));
            }
        }

        tracing::info!(
            "scheduler_loaded: tools={}, rejected_tools={}, profiles={}, rejected_profiles={}",
            registry.len(),
            rejected_tools.len(),
            scheduler.optimizer.profile_names().len(),
            rejected_profiles.len()
        );

        scheduler.registry = registry.shared();
        (
            scheduler,
            LoadReport {
                rejected_tools,
                rejected_profiles,
            },
        )
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a tool after startup. Takes the registry write lock.
    pub async fn register_tool(
        &mut self,
        descriptor: ToolDescriptor,
        capability: SharedCapability,
    ) -> Result<()> {
        let id = descriptor.id.clone();
        self.registry.write().await.register(descriptor)?;
        self.runtimes.insert(id.clone(), ToolRuntime::new());
        self.capabilities.insert(id.clone(), capability);
        tracing::info!("tool_registered: tool={}", id);
        Ok(())
    }

    /// Add a named workload profile.
    pub async fn define_profile(&mut self, profile: WorkloadProfile) -> Result<()> {
        let registry = self.registry.read().await;
        self.optimizer.define(profile, &registry)
    }

    // =========================================================================
    // Control loop
    // =========================================================================

    /// Periodic pass. Advances the hysteresis streak.
    pub async fn tick(&mut self) -> TickReport {
        self.tick_count += 1;
        self.run_cycle(true).await
    }

    /// Fast-path pass after a completion or an operator request. Does not
    /// advance the hysteresis streak.
    pub async fn reconcile(&mut self) -> TickReport {
        self.run_cycle(false).await
    }

    /// Reconcile until nothing is in flight and a pass issues no command.
    pub async fn settle(&mut self) -> Vec<TickReport> {
        let mut reports = Vec::new();
        loop {
            let report = self.reconcile().await;
            let idle = report.commands.is_empty();
            reports.push(report);
            if !self.has_pending() {
                if idle {
                    break;
                }
                continue;
            }
            if reports.len() >= SETTLE_LIMIT {
                tracing::warn!("settle_limit_reached: passes={}", reports.len());
                break;
            }
            match self.signals.recv().await {
                Some(signal) => {
                    self.handle_signal(signal, Instant::now());
                }
                None => break,
            }
        }
        reports
    }

    async fn run_cycle(&mut self, periodic: bool) -> TickReport {
        let registry_handle = Arc::clone(&self.registry);
        let registry = registry_handle.read().await;
        let now = Instant::now();

        let (completions_applied, completions_discarded) = self.drain_signals(now);

        for tool in self.health.evaluate(now) {
            if self.state_of(&tool) == Some(ToolState::Running) {
                self.fail_tool(&tool, TransitionReason::HealthCheckFailed, None, now);
            }
        }

        let (snapshot, stale) = self.sampler.current_snapshot();
        let level = self.effective_level(&snapshot, stale);
        if periodic && !stale {
            self.calm_streak = if level.is_calm() {
                self.calm_streak.saturating_add(1)
            } else {
                0
            };
            self.critical_streak = if level == ResourceLevel::Critical {
                self.critical_streak.saturating_add(1)
            } else {
                0
            };
        }
        if self.last_level != Some(level) {
            tracing::info!(
                "resource_level_changed: from={}, to={}, stale={}",
                self.last_level
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                level,
                stale
            );
        }
        self.last_level = Some(level);

        let views: BTreeMap<ToolId, ToolView> = self
            .runtimes
            .iter()
            .map(|(id, runtime)| {
                let view = ToolView {
                    state: runtime.state,
                    intent: runtime.intent,
                    suppression: runtime.suppression,
                    start_order: runtime.start_order,
                    needs_intervention: self.health.needs_intervention(id),
                    restart_ready: matches!(
                        self.health.restart_gate(id, now),
                        RestartGate::Ready { .. }
                    ),
                    stop_failed: runtime.state == ToolState::Failed
                        && runtime.failed_command == Some(LifecycleCommand::Stop),
                };
                (id.clone(), view)
            })
            .collect();

        let profile = self.optimizer.constraints();
        let plan = planner::plan(&PlanInput {
            registry: &registry,
            tools: &views,
            level,
            calm_streak: self.calm_streak,
            hysteresis_ticks: self.config.hysteresis_ticks,
            profile: profile.as_deref(),
            ceiling: self.config.ceiling.resolve(&snapshot, &self.thresholds),
        });
        drop(registry);

        for (tool, status) in &plan.statuses {
            if let Some(runtime) = self.runtimes.get_mut(tool) {
                if runtime.status != *status {
                    tracing::debug!("tool_status_changed: tool={}, status={:?}", tool, status);
                    runtime.status = *status;
                }
            }
        }

        let mut commands = Vec::with_capacity(plan.commands.len());
        for planned in plan.commands {
            if let Some(issued) = self.issue(planned.tool, planned.command, planned.reason, now) {
                commands.push(issued);
            }
        }

        let mut alerts = Vec::new();
        if plan.ceiling_unresolved {
            alerts.push(AlertReason::CeilingUnresolved);
        }
        let every = self.config.alert_after_ticks;
        if periodic
            && !stale
            && every > 0
            && self.critical_streak > 0
            && self.critical_streak % every == 0
        {
            alerts.push(AlertReason::SustainedCritical {
                ticks: self.critical_streak,
            });
        }
        for reason in &alerts {
            tracing::error!("resource_alert: reason={:?}, level={}", reason, level);
            self.events.publish(SchedulerEvent::ResourceAlert(ResourceAlert {
                reason: *reason,
                level,
                at: Utc::now(),
            }));
        }

        let report = TickReport {
            tick: self.tick_count,
            periodic,
            level,
            stale,
            calm_streak: self.calm_streak,
            commands,
            evicted: plan.evicted,
            alerts,
            completions_applied,
            completions_discarded,
        };
        if !report.commands.is_empty() || !report.evicted.is_empty() {
            tracing::debug!(
                "cycle_completed: tick={}, periodic={}, level={}, commands={}, evicted={}",
                report.tick,
                periodic,
                level,
                report.commands.len(),
                report.evicted.len()
            );
        }
        report
    }

    /// Stale snapshots never lower the level below the previous pass.
    fn effective_level(&self, snapshot: &resources::ResourceSnapshot, stale: bool) -> ResourceLevel {
        let classified = self.thresholds.classify(snapshot);
        if !stale {
            return classified;
        }
        match self.last_level {
            Some(previous) => classified.max(previous),
            None => classified.max(ResourceLevel::Medium),
        }
    }

    /// Move a tool into the transient state for `command` and dispatch it.
    fn issue(
        &mut self,
        tool: ToolId,
        command: LifecycleCommand,
        reason: TransitionReason,
        now: Instant,
    ) -> Option<IssuedCommand> {
        let current = self.state_of(&tool)?;
        let transient = command.transient_state();
        if !current.can_transition_to(transient) {
            tracing::warn!(
                "command_skipped: tool={}, command={}, state={}",
                tool,
                command,
                current
            );
            return None;
        }
        let capability = self.capabilities.get(&tool).cloned()?;

        let retrying_stop = command == LifecycleCommand::Stop
            && self
                .runtimes
                .get(&tool)
                .is_some_and(|r| r.failed_command == Some(LifecycleCommand::Stop));
        if current == ToolState::Failed && (command == LifecycleCommand::Start || retrying_stop) {
            match self.health.take_restart(&tool, now) {
                RestartGate::Ready { attempt } => {
                    tracing::info!(
                        "tool_retrying: tool={}, command={}, attempt={}",
                        tool,
                        command,
                        attempt
                    );
                }
                RestartGate::Wait(_) | RestartGate::Exhausted => return None,
            }
        }

        let prelude = if current == ToolState::Failed && command == LifecycleCommand::Start {
            Prelude::Recycle
        } else {
            match self.in_flight.remove(&tool) {
                Some(previous) if !previous.is_finished() => Prelude::Supersede(previous),
                _ => Prelude::Direct,
            }
        };
        if let Prelude::Supersede(_) = prelude {
            tracing::info!("in_flight_command_cancelled: tool={}, by={}", tool, command);
        }

        if let Some(runtime) = self.runtimes.get_mut(&tool) {
            match (command, reason) {
                (LifecycleCommand::Pause, TransitionReason::ResourcePolicy) => {
                    runtime.suppression = Some(types::Suppression::Paused);
                }
                (LifecycleCommand::Stop, TransitionReason::ResourcePolicy) => {
                    runtime.suppression = Some(types::Suppression::Stopped);
                }
                (_, TransitionReason::Eviction) => {
                    runtime.suppression = Some(types::Suppression::Stopped);
                    if runtime.intent == Some(types::Intent::Enable) {
                        runtime.intent = None;
                    }
                }
                _ => {}
            }
            runtime.pending = Some(command);
        }

        match command {
            LifecycleCommand::Start => self.health.on_starting(&tool, now),
            LifecycleCommand::Stop | LifecycleCommand::Pause => {
                self.health.suspend_monitoring(&tool)
            }
            LifecycleCommand::Resume => {}
        }

        let generation = self.transition(&tool, transient, reason)?;
        let task = self
            .dispatcher
            .dispatch(tool.clone(), generation, command, capability, prelude);
        self.in_flight.insert(tool.clone(), task);
        Some(IssuedCommand {
            tool,
            command,
            reason,
            generation,
        })
    }

    /// Apply a state change, emit its event and return the new generation.
    fn transition(
        &mut self,
        tool: &ToolId,
        to: ToolState,
        reason: TransitionReason,
    ) -> Option<u64> {
        let runtime = self.runtimes.get_mut(tool)?;
        let old = runtime.transition(to);
        if !to.is_transient() {
            runtime.pending = None;
        }
        tracing::info!(
            "tool_state_changed: tool={}, from={}, to={}, reason={}, generation={}",
            tool,
            old,
            to,
            reason,
            runtime.generation
        );
        let event = StateChangeEvent {
            tool: tool.clone(),
            old_state: old,
            new_state: to,
            reason,
            status: runtime.status,
            generation: runtime.generation,
            at: runtime.changed_at,
        };
        let generation = runtime.generation;
        self.events.publish(SchedulerEvent::StateChanged(event));
        Some(generation)
    }

    // =========================================================================
    // Completions
    // =========================================================================

    fn has_pending(&self) -> bool {
        self.runtimes.values().any(|r| r.pending.is_some())
    }

    fn drain_signals(&mut self, now: Instant) -> (usize, usize) {
        let mut applied = 0;
        let mut discarded = 0;
        while let Ok(signal) = self.signals.try_recv() {
            match self.handle_signal(signal, now) {
                Some(true) => applied += 1,
                Some(false) => discarded += 1,
                None => {}
            }
        }
        (applied, discarded)
    }

    /// `Some(applied)` for completions, `None` for probes.
    fn handle_signal(&mut self, signal: Signal, now: Instant) -> Option<bool> {
        match signal {
            Signal::Completion(completion) => Some(self.apply_completion(completion, now)),
            Signal::Probe(outcome) => {
                self.apply_probe(outcome, now);
                None
            }
        }
    }

    fn apply_completion(&mut self, completion: Completion, now: Instant) -> bool {
        let Completion {
            tool,
            generation,
            command,
            result,
        } = completion;

        let Some(runtime) = self.runtimes.get_mut(&tool) else {
            return false;
        };
        if runtime.generation != generation || runtime.pending != Some(command) {
            tracing::debug!(
                "stale_completion_discarded: tool={}, command={}, generation={}, current={}",
                tool,
                command,
                generation,
                runtime.generation
            );
            return false;
        }

        match result {
            Ok(()) => {
                runtime.failed_command = None;
                match command {
                    LifecycleCommand::Start => {
                        self.start_seq += 1;
                        runtime.start_order = self.start_seq;
                        runtime.started_at = Some(Utc::now());
                        runtime.suppression = None;
                        self.health.on_started(&tool, now);
                    }
                    LifecycleCommand::Resume => {
                        runtime.suppression = None;
                        self.health.on_resumed(&tool, now);
                    }
                    LifecycleCommand::Stop => {
                        runtime.started_at = None;
                        if !self.health.needs_intervention(&tool) {
                            self.health.clear(&tool);
                        }
                    }
                    LifecycleCommand::Pause => {}
                }
                self.transition(&tool, command.target_state(), TransitionReason::CommandCompleted);
            }
            Err(error) => {
                let reason = match error {
                    Error::CommandTimeout { .. } => TransitionReason::CommandTimeout,
                    _ => TransitionReason::CommandFailed,
                };
                tracing::warn!(
                    "command_failed: tool={}, command={}, error={}",
                    tool,
                    command,
                    error
                );
                self.fail_tool(&tool, reason, Some(command), now);
            }
        }
        true
    }

    fn apply_probe(&mut self, outcome: ProbeOutcome, now: Instant) {
        let current = self.runtimes.get(&outcome.tool);
        if !current.is_some_and(|r| r.generation == outcome.generation && r.state == ToolState::Running)
        {
            return;
        }
        match outcome.result {
            Ok(()) => self.health.report_heartbeat(&outcome.tool, now),
            Err(error) => {
                tracing::debug!("probe_failed: tool={}, error={}", outcome.tool, error);
                self.health.report_error(&outcome.tool, now);
            }
        }
    }

    /// Enter Failed and hand over to the retry policy. `failed` is the
    /// command that failed, `None` for health failures.
    ///
    /// When the budget is spent the tool is stopped through its capability;
    /// only a Stop that itself failed goes straight to Stopped.
    fn fail_tool(
        &mut self,
        tool: &ToolId,
        reason: TransitionReason,
        failed: Option<LifecycleCommand>,
        now: Instant,
    ) {
        let decision = self.health.mark_failed(tool, now);
        let status = match decision {
            RetryDecision::RetryAt(_) => ToolStatus::BackingOff,
            RetryDecision::GiveUp => ToolStatus::NeedsIntervention,
        };
        if let Some(runtime) = self.runtimes.get_mut(tool) {
            runtime.status = status;
            runtime.started_at = None;
            runtime.failed_command = failed;
        }
        self.transition(tool, ToolState::Failed, reason);
        if decision == RetryDecision::GiveUp {
            if failed == Some(LifecycleCommand::Stop) {
                self.transition(tool, ToolState::Stopped, TransitionReason::RetriesExhausted);
            } else if self
                .issue(tool.clone(), LifecycleCommand::Stop, TransitionReason::RetriesExhausted, now)
                .is_none()
            {
                self.transition(tool, ToolState::Stopped, TransitionReason::RetriesExhausted);
            }
        }
    }

    // =========================================================================
    // Control surface
    // =========================================================================

    /// Ask for a tool to run. Sticky until `disable`; clears a spent retry
    /// budget. Takes effect on the next pass.
    pub fn enable(&mut self, tool: &ToolId) -> Result<()> {
        let runtime = self
            .runtimes
            .get_mut(tool)
            .ok_or_else(|| Error::unknown_tool(tool))?;
        runtime.intent = Some(types::Intent::Enable);
        runtime.suppression = None;
        self.health.reset_retries(tool);
        tracing::info!("tool_enable_requested: tool={}", tool);
        Ok(())
    }

    /// Ask for a tool to stop. An in-flight start is superseded.
    pub fn disable(&mut self, tool: &ToolId) -> Result<()> {
        let runtime = self
            .runtimes
            .get_mut(tool)
            .ok_or_else(|| Error::unknown_tool(tool))?;
        runtime.intent = Some(types::Intent::Disable);
        tracing::info!("tool_disable_requested: tool={}", tool);
        Ok(())
    }

    /// Tools by descending priority.
    pub async fn list_tools(&self) -> Vec<ToolSummary> {
        let registry = self.registry.read().await;
        registry
            .list_by_priority_descending()
            .into_iter()
            .filter_map(|descriptor| {
                let runtime = self.runtimes.get(&descriptor.id)?;
                Some(ToolSummary {
                    id: descriptor.id.clone(),
                    priority: descriptor.priority,
                    state: runtime.state,
                    health: self.health.classify(&descriptor.id).classification,
                    status: runtime.status,
                    generation: runtime.generation,
                })
            })
            .collect()
    }

    /// Replace the active profile. Constraints apply from the next pass.
    pub async fn activate_profile(&mut self, name: &str) -> Result<()> {
        let registry = self.registry.read().await;
        let resolved = self.optimizer.activate(name, &registry)?;
        self.events.publish(SchedulerEvent::ProfileActivated {
            name: resolved.name.clone(),
        });
        Ok(())
    }

    pub fn deactivate_profile(&mut self) -> Option<WorkloadProfile> {
        let previous = self.optimizer.deactivate()?;
        self.events.publish(SchedulerEvent::ProfileDeactivated {
            name: previous.name.clone(),
        });
        Some(previous)
    }

    pub fn current_profile(&self) -> Option<&WorkloadProfile> {
        self.optimizer.current_profile()
    }

    /// Level the scheduler is acting on.
    pub fn current_resource_level(&self) -> ResourceLevel {
        let (snapshot, stale) = self.sampler.current_snapshot();
        self.effective_level(&snapshot, stale)
    }

    pub fn report_heartbeat(&mut self, tool: &ToolId) -> Result<()> {
        self.known(tool)?;
        self.health.report_heartbeat(tool, Instant::now());
        Ok(())
    }

    pub fn report_error(&mut self, tool: &ToolId) -> Result<()> {
        self.known(tool)?;
        self.health.report_error(tool, Instant::now());
        Ok(())
    }

    pub fn health_of(&self, tool: &ToolId) -> Result<HealthRecord> {
        self.known(tool)?;
        Ok(self.health.classify(tool))
    }

    /// Capability of a Running tool.
    pub async fn acquire(&self, tool: &ToolId) -> Result<SharedCapability> {
        let runtime = self
            .runtimes
            .get(tool)
            .ok_or_else(|| Error::unknown_tool(tool))?;
        if runtime.state == ToolState::Running {
            return self
                .capabilities
                .get(tool)
                .cloned()
                .ok_or_else(|| Error::internal(format!("no capability for {}", tool)));
        }

        let registry = self.registry.read().await;
        for dependency in registry.transitive_dependencies(tool) {
            let failed = self.state_of(&dependency) == Some(ToolState::Failed)
                || self.health.needs_intervention(&dependency);
            if failed {
                return Err(Error::DependencyUnavailable {
                    tool: tool.clone(),
                    dependency,
                });
            }
        }
        Err(Error::NotRunning {
            tool: tool.clone(),
            state: runtime.state.to_string(),
        })
    }

    /// Probe every Running tool in the background.
    pub fn probe_running(&self) {
        for (tool, runtime) in &self.runtimes {
            if runtime.state != ToolState::Running {
                continue;
            }
            if let Some(capability) = self.capabilities.get(tool) {
                self.dispatcher
                    .probe(tool.clone(), runtime.generation, Arc::clone(capability));
            }
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    fn known(&self, tool: &ToolId) -> Result<()> {
        if self.runtimes.contains_key(tool) {
            Ok(())
        } else {
            Err(Error::unknown_tool(tool))
        }
    }

    pub fn state_of(&self, tool: &ToolId) -> Option<ToolState> {
        self.runtimes.get(tool).map(|r| r.state)
    }

    pub fn runtime(&self, tool: &ToolId) -> Option<&ToolRuntime> {
        self.runtimes.get(tool)
    }

    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn sampler(&self) -> &SamplerHandle {
        &self.sampler
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn health_config(&self) -> &crate::tools::health::HealthConfig {
        self.health.config()
    }

    /// Notified whenever a command completion or probe result arrives.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn tool_count(&self) -> usize {
        self.runtimes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::sampler::ManualSampler;
    use crate::tools::capability::DetachedTool;
    use tracing_test::traced_test;

    async fn scheduler_at(percent: f64) -> (Scheduler, Arc<ManualSampler>) {
        let manual = Arc::new(ManualSampler::at(percent));
        let handle = SamplerHandle::new(manual.clone(), std::time::Duration::from_secs(5));
        handle.refresh().await;
        let config = SchedulerConfig {
            max_in_flight: Some(4),
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(
            config,
            Thresholds::default(),
            HealthMonitor::default(),
            handle,
        );
        (scheduler, manual)
    }

    fn tool(id: &str, priority: u8) -> ToolDescriptor {
        ToolDescriptor::new(ToolId::must(id), priority, 10.0, 1024)
    }

    #[tokio::test]
    async fn test_low_level_runs_everything() {
        let (mut s, _) = scheduler_at(10.0).await;
        s.register_tool(tool("a", 9), Arc::new(DetachedTool)).await.unwrap();
        s.register_tool(tool("b", 2).depends_on("a"), Arc::new(DetachedTool))
            .await
            .unwrap();

        let reports = s.settle().await;
        assert_eq!(s.state_of(&ToolId::must("a")), Some(ToolState::Running));
        assert_eq!(s.state_of(&ToolId::must("b")), Some(ToolState::Running));
        assert_eq!(reports[0].commands_for("a"), vec![LifecycleCommand::Start]);
        assert!(reports[0].commands_for("b").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_operations_fail() {
        let (mut s, _) = scheduler_at(10.0).await;
        let ghost = ToolId::must("ghost");
        assert!(matches!(s.enable(&ghost), Err(Error::UnknownTool(_))));
        assert!(matches!(s.disable(&ghost), Err(Error::UnknownTool(_))));
        assert!(matches!(s.report_heartbeat(&ghost), Err(Error::UnknownTool(_))));
        assert!(matches!(s.acquire(&ghost).await, Err(Error::UnknownTool(_))));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let (mut s, _) = scheduler_at(10.0).await;
        s.register_tool(tool("a", 5), Arc::new(DetachedTool)).await.unwrap();
        let err = s
            .register_tool(tool("a", 6), Arc::new(DetachedTool))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateTool(_)));
        assert_eq!(s.tool_count(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stale_completion_is_discarded() {
        let (mut s, _) = scheduler_at(10.0).await;
        let id = ToolId::must("sim");
        s.register_tool(tool("sim", 6), Arc::new(DetachedTool)).await.unwrap();
        s.settle().await;
        let runtime = s.runtime(&id).unwrap().clone();
        assert_eq!(runtime.state, ToolState::Running);

        let applied = s.apply_completion(
            Completion {
                tool: id.clone(),
                generation: runtime.generation - 1,
                command: LifecycleCommand::Start,
                result: Err(Error::command_failed("late failure")),
            },
            Instant::now(),
        );
        assert!(!applied);
        let after = s.runtime(&id).unwrap();
        assert_eq!(after.state, ToolState::Running);
        assert_eq!(after.generation, runtime.generation);
        assert!(logs_contain("stale_completion_discarded"));
    }

    #[tokio::test]
    async fn test_stale_sample_never_lowers_level() {
        let (mut s, manual) = scheduler_at(80.0).await;
        s.tick().await;
        assert_eq!(s.current_resource_level(), ResourceLevel::High);

        manual.set_percent(10.0);
        manual.fail();
        s.sampler().refresh().await;
        let report = s.tick().await;
        assert!(report.stale);
        assert_eq!(report.level, ResourceLevel::High);
        assert_eq!(report.calm_streak, 0);
    }

    #[tokio::test]
    async fn test_first_stale_pass_treated_as_medium() {
        let manual = Arc::new(ManualSampler::at(10.0));
        let handle = SamplerHandle::new(manual, std::time::Duration::from_secs(5));
        let mut s = Scheduler::new(
            SchedulerConfig::default(),
            Thresholds::default(),
            HealthMonitor::default(),
            handle,
        );
        s.register_tool(tool("a", 6), Arc::new(DetachedTool)).await.unwrap();
        let report = s.tick().await;
        assert!(report.stale);
        assert_eq!(report.level, ResourceLevel::Medium);
        assert!(report.commands.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_reports_reason() {
        let (mut s, _) = scheduler_at(60.0).await;
        s.register_tool(tool("a", 6), Arc::new(DetachedTool)).await.unwrap();
        s.tick().await;
        let err = s.acquire(&ToolId::must("a")).await.err().unwrap();
        assert!(matches!(err, Error::NotRunning { .. }));

        s.enable(&ToolId::must("a")).unwrap();
        s.settle().await;
        assert!(s.acquire(&ToolId::must("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_profile_events_published() {
        let (mut s, _) = scheduler_at(10.0).await;
        s.register_tool(tool("a", 6), Arc::new(DetachedTool)).await.unwrap();
        s.define_profile(WorkloadProfile::new("quiet").disabling("a"))
            .await
            .unwrap();
        let mut rx = s.events().subscribe();

        s.activate_profile("quiet").await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            SchedulerEvent::ProfileActivated { .. }
        ));
        assert!(s.deactivate_profile().is_some());
        assert!(matches!(
            rx.recv().await.unwrap(),
            SchedulerEvent::ProfileDeactivated { .. }
        ));
        assert!(matches!(
            s.activate_profile("missing").await,
            Err(Error::UnknownProfile(_))
        ));
    }
}
