//! Shared fixtures: a scripted tool and a scheduler wired to a manual sampler.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use warden_core::kernel::sampler::{ManualSampler, SamplerHandle};
use warden_core::tools::{HealthConfig, HealthMonitor, RetryConfig};
use warden_core::types::SchedulerConfig;
use warden_core::{
    Result, Scheduler, Thresholds, ToolCapability, ToolDescriptor, ToolId, ToolState,
};

/// Ordered record of capability calls across all tools, e.g. `"a:start"`.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

/// Tool whose behaviour is scripted by the test.
#[derive(Debug)]
pub struct ScriptedTool {
    name: String,
    log: CallLog,
    failing_starts: AtomicU32,
    start_delay: Duration,
    stop_delay: Duration,
    probe_ok: AtomicBool,
    running: AtomicBool,
}

impl ScriptedTool {
    pub fn new(name: &str, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            failing_starts: AtomicU32::new(0),
            start_delay: Duration::ZERO,
            stop_delay: Duration::ZERO,
            probe_ok: AtomicBool::new(true),
            running: AtomicBool::new(false),
        }
    }

    /// The next `n` starts fail.
    pub fn failing_starts(self, n: u32) -> Self {
        self.failing_starts.store(n, Ordering::SeqCst);
        self
    }

    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Whether the simulated process is up: set by a completed start or
    /// resume, cleared by a completed stop or pause.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_probe_ok(&self, ok: bool) {
        self.probe_ok.store(ok, Ordering::SeqCst);
    }

    fn record(&self, op: &str) {
        self.log.push(format!("{}:{}", self.name, op));
    }
}

#[async_trait]
impl ToolCapability for ScriptedTool {
    async fn start(&self) -> Result<()> {
        self.record("start");
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        let remaining = self.failing_starts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_starts.store(remaining - 1, Ordering::SeqCst);
            return Err(warden_core::Error::command_failed(format!(
                "{} refused to start",
                self.name
            )));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.record("stop");
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.record("pause");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.record("resume");
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        if self.probe_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(warden_core::Error::command_failed("probe failed"))
        }
    }
}

/// Scheduler plus the knobs a test turns.
#[derive(Debug)]
pub struct Harness {
    pub scheduler: Scheduler,
    pub sampler: Arc<ManualSampler>,
    pub log: CallLog,
}

impl Harness {
    pub async fn new(percent: f64) -> Self {
        Self::with(percent, SchedulerConfig::default(), HealthMonitor::default()).await
    }

    pub async fn with(percent: f64, mut config: SchedulerConfig, health: HealthMonitor) -> Self {
        let sampler = Arc::new(ManualSampler::at(percent));
        let handle = SamplerHandle::new(sampler.clone(), Duration::from_secs(5));
        handle.refresh().await;
        if config.max_in_flight.is_none() {
            config.max_in_flight = Some(4);
        }
        Self {
            scheduler: Scheduler::new(config, Thresholds::default(), health, handle),
            sampler,
            log: CallLog::default(),
        }
    }

    pub async fn add(&mut self, descriptor: ToolDescriptor) -> Arc<ScriptedTool> {
        let tool = Arc::new(ScriptedTool::new(descriptor.id.as_str(), &self.log));
        self.add_tool(descriptor, tool.clone()).await;
        tool
    }

    pub async fn add_tool(&mut self, descriptor: ToolDescriptor, tool: Arc<ScriptedTool>) {
        self.scheduler.register_tool(descriptor, tool).await.unwrap();
    }

    /// Move host pressure and refresh the cached snapshot.
    pub async fn set_level(&self, percent: f64) {
        self.sampler.set_percent(percent);
        self.scheduler.sampler().refresh().await;
    }

    pub fn state(&self, id: &str) -> ToolState {
        self.scheduler.state_of(&ToolId::must(id)).unwrap()
    }
}

pub fn tool(id: &str, priority: u8, memory: u64) -> ToolDescriptor {
    ToolDescriptor::new(ToolId::must(id), priority, 10.0, memory)
}

pub fn fast_retry(max_retries: u32) -> HealthMonitor {
    HealthMonitor::new(
        HealthConfig::default(),
        RetryConfig {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(2),
            jitter: 0.0,
            max_retries,
        },
    )
}
