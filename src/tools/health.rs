//! Tool health tracking and restart backoff.
//!
//! Per-tool liveness (heartbeats) and error signals, classified as Healthy,
//! Degraded or Failed. The monitor is the only writer of health records; the
//! scheduler feeds it lifecycle facts and asks it when a failed tool may be
//! restarted.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Error, Result, ToolId};
use crate::validation::validate_fraction;

// =============================================================================
// Configuration
// =============================================================================

/// Failure detection thresholds (configurable, not hardcoded).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Expected heartbeat period; `None` disables heartbeat tracking.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Option<Duration>,
    /// Consecutive missed heartbeats that fail a tool (default: 3).
    pub missed_heartbeat_limit: u32,
    /// Errors within `error_window` that fail a tool (default: 5).
    pub error_threshold: usize,
    /// Sliding window for reported errors (default: 60s).
    #[serde(with = "humantime_serde")]
    pub error_window: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Some(Duration::from_secs(15)),
            missed_heartbeat_limit: 3,
            error_threshold: 5,
            error_window: Duration::from_secs(60),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_some_and(|d| d.is_zero()) {
            return Err(Error::validation("health.heartbeat_interval must be positive"));
        }
        if self.missed_heartbeat_limit == 0 || self.error_threshold == 0 {
            return Err(Error::validation("health limits must be at least 1"));
        }
        Ok(())
    }
}

/// Restart backoff policy for failed tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    #[serde(with = "humantime_serde")]
    pub cap: Duration,
    /// Relative jitter, e.g. 0.2 for ±20%.
    pub jitter: f64,
    /// Restarts attempted before a tool needs manual intervention.
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(300),
            jitter: 0.2,
            max_retries: 5,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base.is_zero() || self.cap < self.base {
            return Err(Error::validation("retry.base must be positive and <= retry.cap"));
        }
        validate_fraction(self.jitter, "retry.jitter")
    }

    /// Un-jittered delay before restart `attempt` (1-based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let scaled = self.base.as_secs_f64() * f64::from(1u32 << exp);
        Duration::from_secs_f64(scaled.min(self.cap.as_secs_f64()))
    }

    /// Delay with symmetric jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64(nominal.as_secs_f64() * factor)
    }
}

// =============================================================================
// Records
// =============================================================================

/// Coarse health of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthClassification {
    Healthy,
    Degraded,
    Failed,
}

/// Point-in-time view of a tool's health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub tool: ToolId,
    pub classification: HealthClassification,
    pub consecutive_failures: u32,
    pub missed_heartbeats: u32,
    pub recent_errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub restart_attempts: u32,
    pub needs_intervention: bool,
}

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Restart allowed at this instant.
    RetryAt(Instant),
    /// Retry budget spent; manual enable required.
    GiveUp,
}

/// Whether a failed tool may be restarted now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartGate {
    Ready { attempt: u32 },
    Wait(Instant),
    Exhausted,
}

/// Mutable per-tool health state.
#[derive(Debug)]
struct ToolHealth {
    classification: HealthClassification,
    consecutive_failures: u32,
    last_heartbeat: Instant,
    last_heartbeat_at: Option<DateTime<Utc>>,
    errors: VecDeque<Instant>,
    /// Heartbeats are only expected while the tool is Running.
    monitoring: bool,
    restart_attempts: u32,
    next_restart_at: Option<Instant>,
    needs_intervention: bool,
}

impl ToolHealth {
    fn new(now: Instant) -> Self {
        Self {
            classification: HealthClassification::Healthy,
            consecutive_failures: 0,
            last_heartbeat: now,
            last_heartbeat_at: None,
            errors: VecDeque::new(),
            monitoring: false,
            restart_attempts: 0,
            next_restart_at: None,
            needs_intervention: false,
        }
    }

    fn missed_heartbeats(&self, now: Instant, interval: Option<Duration>) -> u32 {
        match interval {
            Some(interval) if self.monitoring => {
                let silent = now.saturating_duration_since(self.last_heartbeat);
                (silent.as_nanos() / interval.as_nanos().max(1)).min(u32::MAX as u128) as u32
            }
            _ => 0,
        }
    }

    fn prune_errors(&mut self, now: Instant, window: Duration) {
        while let Some(&ts) = self.errors.front() {
            if now.saturating_duration_since(ts) > window {
                self.errors.pop_front();
            } else {
                break;
            }
        }
    }
}

// =============================================================================
// Health monitor
// =============================================================================

/// In-memory health monitor with sliding-window error tracking.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    retry: RetryConfig,
    records: HashMap<ToolId, ToolHealth>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, retry: RetryConfig) -> Self {
        Self {
            config,
            retry,
            records: HashMap::new(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Tool entered Starting; creates the record on first start.
    pub fn on_starting(&mut self, tool: &ToolId, now: Instant) {
        let record = self
            .records
            .entry(tool.clone())
            .or_insert_with(|| ToolHealth::new(now));
        record.monitoring = false;
        record.next_restart_at = None;
    }

    /// Tool reached Running after a start: reset to Healthy.
    pub fn on_started(&mut self, tool: &ToolId, now: Instant) {
        let record = self
            .records
            .entry(tool.clone())
            .or_insert_with(|| ToolHealth::new(now));
        record.classification = HealthClassification::Healthy;
        record.consecutive_failures = 0;
        record.errors.clear();
        record.restart_attempts = 0;
        record.next_restart_at = None;
        record.needs_intervention = false;
        record.monitoring = true;
        record.last_heartbeat = now;
        record.last_heartbeat_at = Some(Utc::now());
    }

    /// Tool reached Running after a resume.
    pub fn on_resumed(&mut self, tool: &ToolId, now: Instant) {
        if let Some(record) = self.records.get_mut(tool) {
            record.monitoring = true;
            record.last_heartbeat = now;
        }
    }

    /// Tool left Running without failing (paused or stopping).
    pub fn suspend_monitoring(&mut self, tool: &ToolId) {
        if let Some(record) = self.records.get_mut(tool) {
            record.monitoring = false;
        }
    }

    /// Tool was stopped deliberately.
    pub fn clear(&mut self, tool: &ToolId) {
        if self.records.remove(tool).is_some() {
            tracing::debug!("health_record_cleared: tool={}", tool);
        }
    }

    pub fn report_heartbeat(&mut self, tool: &ToolId, now: Instant) {
        if let Some(record) = self.records.get_mut(tool) {
            record.last_heartbeat = now;
            record.last_heartbeat_at = Some(Utc::now());
            if record.classification == HealthClassification::Degraded {
                record.prune_errors(now, self.config.error_window);
                if record.errors.is_empty() {
                    record.classification = HealthClassification::Healthy;
                    record.consecutive_failures = 0;
                }
            }
        }
    }

    pub fn report_error(&mut self, tool: &ToolId, now: Instant) {
        let window = self.config.error_window;
        if let Some(record) = self.records.get_mut(tool) {
            record.errors.push_back(now);
            record.prune_errors(now, window);
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            if record.classification == HealthClassification::Healthy {
                record.classification = HealthClassification::Degraded;
            }
        }
    }

    /// Scan monitored tools; returns the ones that just crossed a failure
    /// threshold. Their classification becomes Failed.
    pub fn evaluate(&mut self, now: Instant) -> Vec<ToolId> {
        let interval = self.config.heartbeat_interval;
        let mut failed = Vec::new();

        for (tool, record) in self.records.iter_mut() {
            if !record.monitoring || record.classification == HealthClassification::Failed {
                continue;
            }
            record.prune_errors(now, self.config.error_window);
            let missed = record.missed_heartbeats(now, interval);

            if missed >= self.config.missed_heartbeat_limit
                || record.errors.len() >= self.config.error_threshold
            {
                tracing::warn!(
                    "tool_health_failed: tool={}, missed_heartbeats={}, recent_errors={}",
                    tool,
                    missed,
                    record.errors.len()
                );
                record.classification = HealthClassification::Failed;
                record.monitoring = false;
                failed.push(tool.clone());
            } else if missed > 0 || !record.errors.is_empty() {
                record.classification = HealthClassification::Degraded;
            }
        }

        failed.sort();
        failed
    }

    /// Record that a tool entered Failed and schedule its restart.
    pub fn mark_failed(&mut self, tool: &ToolId, now: Instant) -> RetryDecision {
        let record = self
            .records
            .entry(tool.clone())
            .or_insert_with(|| ToolHealth::new(now));
        record.classification = HealthClassification::Failed;
        record.monitoring = false;
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);

        if record.restart_attempts >= self.retry.max_retries {
            record.needs_intervention = true;
            record.next_restart_at = None;
            tracing::error!(
                "tool_retries_exhausted: tool={}, attempts={}",
                tool,
                record.restart_attempts
            );
            return RetryDecision::GiveUp;
        }

        let delay = self.retry.delay(record.restart_attempts + 1);
        let at = now + delay;
        record.next_restart_at = Some(at);
        tracing::info!(
            "tool_restart_scheduled: tool={}, attempt={}, delay_ms={}",
            tool,
            record.restart_attempts + 1,
            delay.as_millis()
        );
        RetryDecision::RetryAt(at)
    }

    /// Whether a Failed tool may be restarted now, without consuming anything.
    pub fn restart_gate(&self, tool: &ToolId, now: Instant) -> RestartGate {
        let Some(record) = self.records.get(tool) else {
            return RestartGate::Ready { attempt: 1 };
        };
        if record.needs_intervention {
            return RestartGate::Exhausted;
        }
        match record.next_restart_at {
            Some(at) if now < at => RestartGate::Wait(at),
            _ => RestartGate::Ready {
                attempt: record.restart_attempts + 1,
            },
        }
    }

    /// Gate for restarting a Failed tool. Consumes one attempt when Ready.
    pub fn take_restart(&mut self, tool: &ToolId, now: Instant) -> RestartGate {
        let gate = self.restart_gate(tool, now);
        if let RestartGate::Ready { attempt } = gate {
            if let Some(record) = self.records.get_mut(tool) {
                record.restart_attempts = attempt;
                record.next_restart_at = None;
            }
        }
        gate
    }

    /// Operator intervention: forget the spent retry budget.
    pub fn reset_retries(&mut self, tool: &ToolId) {
        if let Some(record) = self.records.get_mut(tool) {
            record.restart_attempts = 0;
            record.next_restart_at = None;
            record.needs_intervention = false;
        }
    }

    pub fn needs_intervention(&self, tool: &ToolId) -> bool {
        self.records
            .get(tool)
            .map(|r| r.needs_intervention)
            .unwrap_or(false)
    }

    /// Health view of one tool. Tools without a record are Healthy.
    pub fn classify(&self, tool: &ToolId) -> HealthRecord {
        self.classify_at(tool, Instant::now())
    }

    pub fn classify_at(&self, tool: &ToolId, now: Instant) -> HealthRecord {
        match self.records.get(tool) {
            None => HealthRecord {
                tool: tool.clone(),
                classification: HealthClassification::Healthy,
                consecutive_failures: 0,
                missed_heartbeats: 0,
                recent_errors: 0,
                last_heartbeat_at: None,
                restart_attempts: 0,
                needs_intervention: false,
            },
            Some(r) => HealthRecord {
                tool: tool.clone(),
                classification: r.classification,
                consecutive_failures: r.consecutive_failures,
                missed_heartbeats: r.missed_heartbeats(now, self.config.heartbeat_interval),
                recent_errors: r
                    .errors
                    .iter()
                    .filter(|ts| now.saturating_duration_since(**ts) <= self.config.error_window)
                    .count(),
                last_heartbeat_at: r.last_heartbeat_at,
                restart_attempts: r.restart_attempts,
                needs_intervention: r.needs_intervention,
            },
        }
    }

    /// Number of tracked tools.
    pub fn tool_count(&self) -> usize {
        self.records.len()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default(), RetryConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter: 0.0,
            max_retries: 2,
            ..Default::default()
        }
    }

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig::default(), no_jitter())
    }

    #[test]
    fn test_nominal_backoff_doubles_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.nominal_delay(1), Duration::from_secs(2));
        assert_eq!(retry.nominal_delay(2), Duration::from_secs(4));
        assert_eq!(retry.nominal_delay(5), Duration::from_secs(32));
        assert_eq!(retry.nominal_delay(9), Duration::from_secs(300));
        assert_eq!(retry.nominal_delay(100), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let retry = RetryConfig::default();
        for _ in 0..200 {
            let d = retry.delay(3).as_secs_f64();
            assert!((6.4..=9.6).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn test_unknown_tool_is_healthy() {
        let m = monitor();
        let record = m.classify(&ToolId::must("nobody"));
        assert_eq!(record.classification, HealthClassification::Healthy);
        assert_eq!(m.tool_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_missed_heartbeats_fail() {
        let mut m = monitor();
        let t = ToolId::must("sim");
        m.on_starting(&t, Instant::now());
        m.on_started(&t, Instant::now());

        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(m.evaluate(Instant::now()).is_empty());
        assert_eq!(m.classify(&t).classification, HealthClassification::Degraded);

        m.report_heartbeat(&t, Instant::now());
        assert_eq!(m.classify(&t).classification, HealthClassification::Healthy);

        tokio::time::advance(Duration::from_secs(44)).await;
        assert!(m.evaluate(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(m.evaluate(Instant::now()), vec![t.clone()]);
        assert_eq!(m.classify(&t).classification, HealthClassification::Failed);
        // Reported once only.
        assert!(m.evaluate(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_tools_do_not_miss_heartbeats() {
        let mut m = monitor();
        let t = ToolId::must("sim");
        m.on_started(&t, Instant::now());
        m.suspend_monitoring(&t);
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(m.evaluate(Instant::now()).is_empty());
        assert_eq!(m.classify(&t).missed_heartbeats, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_errors_in_window_fail() {
        let mut m = monitor();
        let t = ToolId::must("sim");
        m.on_started(&t, Instant::now());

        for _ in 0..4 {
            m.report_error(&t, Instant::now());
            m.report_heartbeat(&t, Instant::now());
            tokio::time::advance(Duration::from_secs(10)).await;
        }
        assert!(m.evaluate(Instant::now()).is_empty());
        assert_eq!(m.classify(&t).classification, HealthClassification::Degraded);

        m.report_error(&t, Instant::now());
        assert_eq!(m.evaluate(Instant::now()), vec![t]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_outside_window_expire() {
        let mut m = monitor();
        let t = ToolId::must("sim");
        m.on_started(&t, Instant::now());

        for _ in 0..4 {
            m.report_error(&t, Instant::now());
        }
        tokio::time::advance(Duration::from_secs(14)).await;
        m.report_heartbeat(&t, Instant::now());
        tokio::time::advance(Duration::from_secs(14)).await;
        m.report_heartbeat(&t, Instant::now());
        tokio::time::advance(Duration::from_secs(14)).await;
        m.report_heartbeat(&t, Instant::now());
        tokio::time::advance(Duration::from_secs(14)).await;
        m.report_heartbeat(&t, Instant::now());
        tokio::time::advance(Duration::from_secs(14)).await;
        m.report_heartbeat(&t, Instant::now());

        m.report_error(&t, Instant::now());
        assert!(m.evaluate(Instant::now()).is_empty());
        assert_eq!(m.classify(&t).recent_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_backoff_and_exhaustion() {
        let mut m = monitor();
        let t = ToolId::must("sim");
        let start = Instant::now();
        m.on_starting(&t, start);

        assert_eq!(
            m.mark_failed(&t, start),
            RetryDecision::RetryAt(start + Duration::from_secs(2))
        );
        assert_eq!(
            m.take_restart(&t, start),
            RestartGate::Wait(start + Duration::from_secs(2))
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        // Peeking does not consume the attempt.
        assert_eq!(m.restart_gate(&t, Instant::now()), RestartGate::Ready { attempt: 1 });
        assert_eq!(m.take_restart(&t, Instant::now()), RestartGate::Ready { attempt: 1 });

        let now = Instant::now();
        assert_eq!(
            m.mark_failed(&t, now),
            RetryDecision::RetryAt(now + Duration::from_secs(4))
        );
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(m.take_restart(&t, Instant::now()), RestartGate::Ready { attempt: 2 });

        assert_eq!(m.mark_failed(&t, Instant::now()), RetryDecision::GiveUp);
        assert!(m.needs_intervention(&t));
        assert_eq!(m.take_restart(&t, Instant::now()), RestartGate::Exhausted);

        m.reset_retries(&t);
        assert!(!m.needs_intervention(&t));
        assert_eq!(m.take_restart(&t, Instant::now()), RestartGate::Ready { attempt: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_start_resets_record() {
        let mut m = monitor();
        let t = ToolId::must("sim");
        m.on_starting(&t, Instant::now());
        m.mark_failed(&t, Instant::now());
        m.on_started(&t, Instant::now());

        let record = m.classify(&t);
        assert_eq!(record.classification, HealthClassification::Healthy);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.restart_attempts, 0);

        m.clear(&t);
        assert_eq!(m.tool_count(), 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(HealthConfig::default().validate().is_ok());
        assert!(RetryConfig::default().validate().is_ok());
        let bad = RetryConfig {
            jitter: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = HealthConfig {
            heartbeat_interval: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
