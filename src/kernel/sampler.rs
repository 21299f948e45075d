//! Resource sampler - pluggable host measurement with a latest-value cache.
//!
//! The scheduler never waits on a measurement: it reads the cached snapshot.
//! A background loop refreshes the cache every interval; a sample that fails or
//! overruns the interval keeps the previous snapshot and marks it stale.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, System};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::resources::ResourceSnapshot;
use crate::types::{Error, Result};

/// Source of host resource measurements.
#[async_trait]
pub trait ResourceSampler: Send + Sync + std::fmt::Debug {
    async fn sample(&self) -> Result<ResourceSnapshot>;
}

/// Latest snapshot plus staleness flag.
#[derive(Debug, Clone)]
pub struct SampleState {
    pub snapshot: ResourceSnapshot,
    pub stale: bool,
}

/// Cloneable handle to a sampler and its cached snapshot.
#[derive(Debug, Clone)]
pub struct SamplerHandle {
    sampler: Arc<dyn ResourceSampler>,
    interval: Duration,
    state: Arc<watch::Sender<SampleState>>,
}

impl SamplerHandle {
    /// Until the first successful sample the snapshot is empty and stale.
    pub fn new(sampler: Arc<dyn ResourceSampler>, interval: Duration) -> Self {
        let (tx, _) = watch::channel(SampleState {
            snapshot: ResourceSnapshot::empty(),
            stale: true,
        });
        Self {
            sampler,
            interval,
            state: Arc::new(tx),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// `(snapshot, stale)`; never blocks.
    pub fn current_snapshot(&self) -> (ResourceSnapshot, bool) {
        let state = self.state.borrow();
        (state.snapshot.clone(), state.stale)
    }

    pub fn subscribe(&self) -> watch::Receiver<SampleState> {
        self.state.subscribe()
    }

    /// Take one sample, bounded by the interval. Returns the staleness flag.
    pub async fn refresh(&self) -> bool {
        let outcome = tokio::time::timeout(self.interval, self.sampler.sample()).await;
        match outcome {
            Ok(Ok(snapshot)) => {
                self.state.send_replace(SampleState {
                    snapshot,
                    stale: false,
                });
                false
            }
            Ok(Err(e)) => {
                tracing::warn!("resource_sample_failed: error={}", e);
                self.mark_stale();
                true
            }
            Err(_) => {
                tracing::warn!(
                    "resource_sample_timed_out: interval_ms={}",
                    self.interval.as_millis()
                );
                self.mark_stale();
                true
            }
        }
    }

    fn mark_stale(&self) {
        self.state.send_modify(|state| state.stale = true);
    }

    /// Refresh in the background until cancelled.
    pub fn spawn(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(handle.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        handle.refresh().await;
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("resource_sampler_stopped");
                        break;
                    }
                }
            }
        })
    }
}

// =============================================================================
// Backends
// =============================================================================

/// Host CPU and memory via `sysinfo`. GPU is not reported.
#[derive(Debug)]
pub struct SysinfoSampler {
    system: Arc<Mutex<System>>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta; prime the first reading.
        system.refresh_cpu_specifics(CpuRefreshKind::new().with_cpu_usage());
        Self {
            system: Arc::new(Mutex::new(system)),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceSampler for SysinfoSampler {
    async fn sample(&self) -> Result<ResourceSnapshot> {
        let system = self.system.clone();
        tokio::task::spawn_blocking(move || {
            let mut sys = system
                .lock()
                .map_err(|_| Error::internal("sysinfo state poisoned"))?;
            sys.refresh_cpu_specifics(CpuRefreshKind::new().with_cpu_usage());
            sys.refresh_memory_specifics(MemoryRefreshKind::new().with_ram());

            let cpus = sys.cpus();
            let cpu = cpus.iter().map(|c| f64::from(c.cpu_usage())).sum::<f64>()
                / cpus.len().max(1) as f64;
            let total = sys.total_memory();
            if total == 0 {
                return Err(Error::internal("sysinfo reported zero total memory"));
            }
            let memory = sys.used_memory() as f64 / total as f64 * 100.0;
            Ok(ResourceSnapshot::new(cpu.min(100.0), memory, None).with_memory_total(total))
        })
        .await
        .map_err(|e| Error::internal(format!("sampler task failed: {}", e)))?
    }
}

/// Scripted sampler for tests and embedding.
#[derive(Debug)]
pub struct ManualSampler {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    snapshot: ResourceSnapshot,
    failing: bool,
}

impl ManualSampler {
    pub fn new(snapshot: ResourceSnapshot) -> Self {
        Self {
            state: Mutex::new(ManualState {
                snapshot,
                failing: false,
            }),
        }
    }

    /// Uniform pressure on CPU and memory.
    pub fn at(percent: f64) -> Self {
        Self::new(ResourceSnapshot::new(percent, percent, None))
    }

    pub fn set(&self, snapshot: ResourceSnapshot) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.snapshot = snapshot;
        state.failing = false;
    }

    pub fn set_percent(&self, percent: f64) {
        self.set(ResourceSnapshot::new(percent, percent, None));
    }

    /// Make subsequent samples fail until the next `set`.
    pub fn fail(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).failing = true;
    }
}

#[async_trait]
impl ResourceSampler for ManualSampler {
    async fn sample(&self) -> Result<ResourceSnapshot> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.failing {
            return Err(Error::internal("manual sampler set to fail"));
        }
        let mut snapshot = state.snapshot.clone();
        snapshot.sampled_at = chrono::Utc::now();
        Ok(snapshot)
    }
}
