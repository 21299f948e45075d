//! Background control loop and the cloneable control surface.
//!
//! SchedulerService drives the Scheduler:
//! - a periodic tick at `scheduler.tick_interval` (advances hysteresis)
//! - a fast-path reconcile whenever a command completion arrives
//! - liveness probes of Running tools at the heartbeat interval
//!
//! SchedulerHandle is what callers hold. Every call takes the scheduler mutex
//! briefly; enable and disable reconcile immediately so a disable cancels an
//! in-flight start without waiting for the next tick.

use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{interval, MissedTickBehavior};

use super::resources::ResourceLevel;
use super::types::{TickReport, ToolSummary};
use super::Scheduler;
use crate::events::{EventBus, SchedulerEvent};
use crate::tools::capability::SharedCapability;
use crate::tools::health::HealthRecord;
use crate::tools::registry::ToolDescriptor;
use crate::types::{Result, ToolId};
use crate::workload::WorkloadProfile;

/// Cloneable handle to a shared scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    scheduler: Arc<Mutex<Scheduler>>,
    wake: Arc<Notify>,
    events: EventBus,
}

impl SchedulerHandle {
    pub fn new(scheduler: Scheduler) -> Self {
        let wake = scheduler.wake_handle();
        let events = scheduler.events();
        Self {
            scheduler: Arc::new(Mutex::new(scheduler)),
            wake,
            events,
        }
    }

    /// Direct access for embedding and tests.
    pub fn scheduler(&self) -> Arc<Mutex<Scheduler>> {
        Arc::clone(&self.scheduler)
    }

    pub async fn enable(&self, tool: &ToolId) -> Result<TickReport> {
        let mut scheduler = self.scheduler.lock().await;
        scheduler.enable(tool)?;
        Ok(scheduler.reconcile().await)
    }

    pub async fn disable(&self, tool: &ToolId) -> Result<TickReport> {
        let mut scheduler = self.scheduler.lock().await;
        scheduler.disable(tool)?;
        Ok(scheduler.reconcile().await)
    }

    pub async fn list_tools(&self) -> Vec<ToolSummary> {
        self.scheduler.lock().await.list_tools().await
    }

    pub async fn activate_profile(&self, name: &str) -> Result<()> {
        self.scheduler.lock().await.activate_profile(name).await
    }

    pub async fn deactivate_profile(&self) -> Option<WorkloadProfile> {
        self.scheduler.lock().await.deactivate_profile()
    }

    pub async fn current_profile(&self) -> Option<WorkloadProfile> {
        self.scheduler.lock().await.current_profile().cloned()
    }

    pub async fn current_resource_level(&self) -> ResourceLevel {
        self.scheduler.lock().await.current_resource_level()
    }

    /// Stream of scheduler events from the moment of subscription.
    pub fn events(&self) -> impl Stream<Item = SchedulerEvent> + Send + 'static {
        self.events.stream()
    }

    pub async fn report_heartbeat(&self, tool: &ToolId) -> Result<()> {
        self.scheduler.lock().await.report_heartbeat(tool)
    }

    pub async fn report_error(&self, tool: &ToolId) -> Result<()> {
        self.scheduler.lock().await.report_error(tool)
    }

    pub async fn health(&self, tool: &ToolId) -> Result<HealthRecord> {
        self.scheduler.lock().await.health_of(tool)
    }

    pub async fn register_tool(
        &self,
        descriptor: ToolDescriptor,
        capability: SharedCapability,
    ) -> Result<()> {
        self.scheduler
            .lock()
            .await
            .register_tool(descriptor, capability)
            .await?;
        self.wake.notify_one();
        Ok(())
    }

    /// Capability of a Running tool, or why it is not available.
    pub async fn acquire(&self, tool: &ToolId) -> Result<SharedCapability> {
        self.scheduler.lock().await.acquire(tool).await
    }
}

/// SchedulerService runs the control loop in the background.
#[derive(Debug)]
pub struct SchedulerService {
    handle: SchedulerHandle,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl SchedulerService {
    pub fn new(handle: SchedulerHandle) -> Self {
        Self {
            handle,
            stop_tx: None,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Start the loop. Returns immediately; the loop runs in a spawned task.
    pub async fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let (tick_interval, probe_interval) = {
            let scheduler = self.handle.scheduler.lock().await;
            (
                scheduler.config().tick_interval,
                scheduler.health_config().heartbeat_interval,
            )
        };
        let scheduler = self.handle.scheduler();
        let wake = Arc::clone(&self.handle.wake);
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tracing::info!(
            "scheduler_service_started: tick_interval_ms={}",
            tick_interval.as_millis()
        );

        tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut prober = interval(probe_interval.unwrap_or(Duration::from_secs(3600)));
            prober.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First probe tick fires immediately; nothing is Running yet.
            prober.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.lock().await.tick().await;
                    }
                    _ = wake.notified() => {
                        scheduler.lock().await.reconcile().await;
                    }
                    _ = prober.tick(), if probe_interval.is_some() => {
                        scheduler.lock().await.probe_running();
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("scheduler_service_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the loop. In-flight commands still complete in their own tasks.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}
