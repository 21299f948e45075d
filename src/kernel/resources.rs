//! Resource snapshots, pressure classification and ceiling accounting.
//!
//! A snapshot is immutable for the duration of a tick. Pressure is the maximum
//! of the sampled dimensions; the ceiling check works on declared tool budgets,
//! not on measured usage, so eviction decisions are reproducible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::tools::registry::ToolDescriptor;
use crate::types::{Error, Result};
use crate::validation::validate_percent;

// =============================================================================
// Snapshot
// =============================================================================

/// Host resource usage at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_percent: Option<f64>,
    /// Physical memory size, when the sampler knows it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_total_bytes: Option<u64>,
    pub sampled_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn new(cpu_percent: f64, memory_percent: f64, gpu_percent: Option<f64>) -> Self {
        Self {
            cpu_percent,
            memory_percent,
            gpu_percent,
            memory_total_bytes: None,
            sampled_at: Utc::now(),
        }
    }

    /// Placeholder used before the first successful sample.
    pub fn empty() -> Self {
        Self::new(0.0, 0.0, None)
    }

    pub fn with_memory_total(mut self, bytes: u64) -> Self {
        self.memory_total_bytes = Some(bytes);
        self
    }

    /// Highest utilisation across all dimensions.
    pub fn pressure(&self) -> f64 {
        let base = self.cpu_percent.max(self.memory_percent);
        match self.gpu_percent {
            Some(gpu) => base.max(gpu),
            None => base,
        }
    }
}

// =============================================================================
// Level
// =============================================================================

/// Coarse classification of host pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ResourceLevel {
    /// Levels at which suppressed tools may come back.
    pub fn is_calm(self) -> bool {
        self <= ResourceLevel::Medium
    }
}

impl fmt::Display for ResourceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceLevel::Low => "low",
            ResourceLevel::Medium => "medium",
            ResourceLevel::High => "high",
            ResourceLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Level boundaries in percent.
///
/// `pressure < medium` is Low, `< high` is Medium, `<= critical` is High and
/// anything above `critical` is Critical.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            medium: 50.0,
            high: 70.0,
            critical: 90.0,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<()> {
        validate_percent(self.medium, "thresholds.medium")?;
        validate_percent(self.high, "thresholds.high")?;
        validate_percent(self.critical, "thresholds.critical")?;
        if !(self.medium < self.high && self.high < self.critical) {
            return Err(Error::validation(format!(
                "thresholds must increase strictly: medium={} high={} critical={}",
                self.medium, self.high, self.critical
            )));
        }
        Ok(())
    }

    pub fn classify_value(&self, pressure: f64) -> ResourceLevel {
        if pressure > self.critical {
            ResourceLevel::Critical
        } else if pressure >= self.high {
            ResourceLevel::High
        } else if pressure >= self.medium {
            ResourceLevel::Medium
        } else {
            ResourceLevel::Low
        }
    }

    pub fn classify(&self, snapshot: &ResourceSnapshot) -> ResourceLevel {
        self.classify_value(snapshot.pressure())
    }
}

// =============================================================================
// Ceiling
// =============================================================================

/// Budget ceiling applied to the tools projected to keep holding resources.
///
/// `None` disables a dimension. When `memory_bytes` is unset and the snapshot
/// reports total memory, the critical threshold of total memory is used.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceCeiling {
    pub cpu_percent: Option<f64>,
    pub memory_bytes: Option<u64>,
    pub gpu_percent: Option<f64>,
}

impl Default for ResourceCeiling {
    fn default() -> Self {
        Self {
            cpu_percent: Some(90.0),
            memory_bytes: None,
            gpu_percent: Some(90.0),
        }
    }
}

impl ResourceCeiling {
    pub fn validate(&self) -> Result<()> {
        if let Some(cpu) = self.cpu_percent {
            if !cpu.is_finite() || cpu <= 0.0 {
                return Err(Error::validation("ceiling.cpu_percent must be positive"));
            }
        }
        if let Some(gpu) = self.gpu_percent {
            if !gpu.is_finite() || gpu <= 0.0 {
                return Err(Error::validation("ceiling.gpu_percent must be positive"));
            }
        }
        if self.memory_bytes == Some(0) {
            return Err(Error::validation("ceiling.memory_bytes must be positive"));
        }
        Ok(())
    }

    /// Resolve implicit dimensions against the current snapshot.
    pub fn resolve(&self, snapshot: &ResourceSnapshot, thresholds: &Thresholds) -> ResourceCeiling {
        let memory_bytes = self.memory_bytes.or_else(|| {
            snapshot
                .memory_total_bytes
                .map(|total| (total as f64 * thresholds.critical / 100.0) as u64)
        });
        ResourceCeiling {
            cpu_percent: self.cpu_percent,
            memory_bytes,
            gpu_percent: self.gpu_percent,
        }
    }
}

/// Sum of declared budgets for a set of tools.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProjectedUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub gpu_percent: f64,
}

impl ProjectedUsage {
    /// Account a tool. Warm-paused tools keep memory and GPU but no CPU.
    pub fn add(&mut self, descriptor: &ToolDescriptor, paused: bool) {
        if !paused {
            self.cpu_percent += descriptor.max_cpu_percent;
        }
        self.memory_bytes = self.memory_bytes.saturating_add(descriptor.max_memory_bytes);
        self.gpu_percent += descriptor.max_gpu_percent.unwrap_or(0.0);
    }

    pub fn remove(&mut self, descriptor: &ToolDescriptor, paused: bool) {
        if !paused {
            self.cpu_percent = (self.cpu_percent - descriptor.max_cpu_percent).max(0.0);
        }
        self.memory_bytes = self.memory_bytes.saturating_sub(descriptor.max_memory_bytes);
        self.gpu_percent = (self.gpu_percent - descriptor.max_gpu_percent.unwrap_or(0.0)).max(0.0);
    }

    /// Whether any bounded dimension is over the ceiling.
    pub fn exceeds(&self, ceiling: &ResourceCeiling) -> bool {
        let cpu = ceiling.cpu_percent.is_some_and(|c| self.cpu_percent > c);
        let mem = ceiling.memory_bytes.is_some_and(|c| self.memory_bytes > c);
        let gpu = ceiling.gpu_percent.is_some_and(|c| self.gpu_percent > c);
        cpu || mem || gpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolId;

    #[test]
    fn test_classify_boundaries() {
        let t = Thresholds::default();
        assert_eq!(t.classify_value(0.0), ResourceLevel::Low);
        assert_eq!(t.classify_value(49.9), ResourceLevel::Low);
        assert_eq!(t.classify_value(50.0), ResourceLevel::Medium);
        assert_eq!(t.classify_value(69.9), ResourceLevel::Medium);
        assert_eq!(t.classify_value(70.0), ResourceLevel::High);
        assert_eq!(t.classify_value(90.0), ResourceLevel::High);
        assert_eq!(t.classify_value(90.1), ResourceLevel::Critical);
    }

    #[test]
    fn test_classify_uses_max_dimension() {
        let t = Thresholds::default();
        let snap = ResourceSnapshot::new(10.0, 20.0, Some(95.0));
        assert_eq!(t.classify(&snap), ResourceLevel::Critical);

        let snap = ResourceSnapshot::new(75.0, 20.0, None);
        assert_eq!(t.classify(&snap), ResourceLevel::High);
    }

    #[test]
    fn test_level_ordering() {
        assert!(ResourceLevel::Low < ResourceLevel::Critical);
        assert!(ResourceLevel::Medium.is_calm());
        assert!(!ResourceLevel::High.is_calm());
    }

    #[test]
    fn test_thresholds_validate() {
        assert!(Thresholds::default().validate().is_ok());
        let bad = Thresholds {
            medium: 50.0,
            high: 50.0,
            critical: 90.0,
        };
        assert!(bad.validate().is_err());
        let bad = Thresholds {
            medium: 50.0,
            high: 70.0,
            critical: 120.0,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_ceiling_resolves_memory_from_snapshot() {
        let ceiling = ResourceCeiling {
            cpu_percent: None,
            memory_bytes: None,
            gpu_percent: None,
        };
        let snap = ResourceSnapshot::new(0.0, 0.0, None).with_memory_total(1000);
        let resolved = ceiling.resolve(&snap, &Thresholds::default());
        assert_eq!(resolved.memory_bytes, Some(900));

        let explicit = ResourceCeiling {
            memory_bytes: Some(5),
            ..ceiling
        };
        assert_eq!(explicit.resolve(&snap, &Thresholds::default()).memory_bytes, Some(5));
    }

    #[test]
    fn test_projected_usage_warm_pause() {
        let d = ToolDescriptor::new(ToolId::must("t"), 5, 30.0, 100).with_gpu(10.0);
        let mut usage = ProjectedUsage::default();
        usage.add(&d, true);
        assert_eq!(usage.cpu_percent, 0.0);
        assert_eq!(usage.memory_bytes, 100);
        assert_eq!(usage.gpu_percent, 10.0);

        usage.add(&d, false);
        assert_eq!(usage.cpu_percent, 30.0);
        assert_eq!(usage.memory_bytes, 200);

        let ceiling = ResourceCeiling {
            cpu_percent: Some(50.0),
            memory_bytes: Some(150),
            gpu_percent: None,
        };
        assert!(usage.exceeds(&ceiling));
        usage.remove(&d, true);
        assert!(!usage.exceeds(&ceiling));
    }
}
