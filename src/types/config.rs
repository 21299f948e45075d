//! Configuration structures.
//!
//! Configuration is a single JSON document loaded once at startup and validated
//! before the scheduler is built. Durations use humantime strings (`"5s"`,
//! `"5m"`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};
use crate::kernel::resources::{ResourceCeiling, Thresholds};
use crate::tools::command::CommandSpec;
use crate::tools::health::{HealthConfig, RetryConfig};
use crate::tools::registry::ToolDescriptor;
use crate::workload::WorkloadProfile;

/// Global warden configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Control loop configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// ResourceLevel boundaries.
    #[serde(default)]
    pub thresholds: Thresholds,

    /// Resource sampler configuration.
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Heartbeat and error policy.
    #[serde(default)]
    pub health: HealthConfig,

    /// Restart backoff policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Tool catalog.
    #[serde(default)]
    pub tools: Vec<ToolConfig>,

    /// Named workload profiles.
    #[serde(default)]
    pub profiles: Vec<WorkloadProfile>,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate global settings.
    ///
    /// Per-tool problems are not reported here; the registry rejects individual
    /// tools at load time so one bad entry does not sink the rest.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.thresholds.validate()?;
        self.retry.validate()?;
        self.health.validate()?;
        if self.sampler.interval.is_zero() {
            return Err(Error::validation("sampler.interval must be positive"));
        }

        let mut names = std::collections::HashSet::new();
        for profile in &self.profiles {
            if !names.insert(profile.name.clone()) {
                return Err(Error::validation(format!(
                    "profile {} defined more than once",
                    profile.name
                )));
            }
        }
        Ok(())
    }
}

/// Control loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period of the control loop.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Consecutive ticks at or below Medium required before auto-suppressed
    /// tools come back.
    pub hysteresis_ticks: u32,

    /// Deadline for a single start/stop/pause/resume.
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Maximum concurrently executing commands. Defaults to the CPU count.
    pub max_in_flight: Option<usize>,

    /// Projected-usage ceiling checked under Critical pressure.
    pub ceiling: ResourceCeiling,

    /// Consecutive Critical ticks before a resource alert is raised.
    pub alert_after_ticks: u32,

    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
}

impl SchedulerConfig {
    /// Effective in-flight bound.
    pub fn in_flight_limit(&self) -> usize {
        self.max_in_flight.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(Error::validation("scheduler.tick_interval must be positive"));
        }
        if self.hysteresis_ticks == 0 {
            return Err(Error::validation("scheduler.hysteresis_ticks must be at least 1"));
        }
        if self.command_timeout.is_zero() {
            return Err(Error::validation("scheduler.command_timeout must be positive"));
        }
        if self.max_in_flight == Some(0) {
            return Err(Error::validation("scheduler.max_in_flight must be positive"));
        }
        if self.event_capacity == 0 {
            return Err(Error::validation("scheduler.event_capacity must be positive"));
        }
        self.ceiling.validate()
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            hysteresis_ticks: 3,
            command_timeout: Duration::from_secs(30),
            max_in_flight: None,
            ceiling: ResourceCeiling::default(),
            alert_after_ticks: 3,
            event_capacity: 256,
        }
    }
}

/// Resource sampler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Sampling period; also the per-sample deadline.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// One tool entry: its descriptor plus how the daemon runs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(flatten)]
    pub descriptor: ToolDescriptor,

    /// Program backing the tool (daemon binary only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandSpec>,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "scheduler": { "tick_interval": "10s", "hysteresis_ticks": 4 },
        "thresholds": { "medium": 40.0, "high": 65.0, "critical": 85.0 },
        "retry": { "base": "1s", "cap": "2m", "jitter": 0.1, "max_retries": 3 },
        "tools": [
            { "id": "ingest", "priority": 9, "max_cpu_percent": 20.0,
              "max_memory_bytes": 1048576 },
            { "id": "render", "priority": 2, "max_cpu_percent": 40.0,
              "max_memory_bytes": 4194304, "dependencies": ["ingest"],
              "tags": ["media"],
              "command": { "program": "/usr/bin/render", "args": ["--fast"] } }
        ],
        "profiles": [
            { "name": "lightweight", "disable": ["render"] }
        ]
    }"#;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(5));
        assert_eq!(config.scheduler.hysteresis_ticks, 3);
        assert_eq!(config.scheduler.command_timeout, Duration::from_secs(30));
        assert!(config.scheduler.in_flight_limit() >= 1);
    }

    #[test]
    fn test_parse_sample() {
        let config = Config::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(10));
        assert_eq!(config.scheduler.hysteresis_ticks, 4);
        // Unspecified fields keep their defaults.
        assert_eq!(config.scheduler.command_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.tools.len(), 2);
        assert_eq!(config.tools[1].descriptor.dependencies.len(), 1);
        assert!(config.tools[1].command.is_some());
        assert!(config.tools[0].command.is_none());
        assert_eq!(config.profiles[0].name.as_str(), "lightweight");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.tools.len(), 2);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Config::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        let raw = r#"{ "thresholds": { "medium": 80.0, "high": 70.0, "critical": 90.0 } }"#;
        let err = Config::from_json_str(raw).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_rejects_zero_hysteresis() {
        let raw = r#"{ "scheduler": { "hysteresis_ticks": 0 } }"#;
        assert!(Config::from_json_str(raw).is_err());
    }

    #[test]
    fn test_rejects_duplicate_profile_names() {
        let raw = r#"{ "profiles": [ { "name": "p" }, { "name": "p" } ] }"#;
        assert!(Config::from_json_str(raw).is_err());
    }
}
