//! Validation helpers shared by config loading and registration.

use crate::types::{Error, Result};

/// Lowest tool priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest tool priority; such tools are never evicted.
pub const MAX_PRIORITY: u8 = 10;

/// Validate that a priority lies in `[1, 10]`.
pub fn validate_priority(priority: u8, field: &str) -> Result<()> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(Error::validation(format!(
            "{} must be within [{}, {}], got {}",
            field, MIN_PRIORITY, MAX_PRIORITY, priority
        )));
    }
    Ok(())
}

/// Validate a percentage in `(0, 100]`.
pub fn validate_percent(value: f64, field: &str) -> Result<()> {
    if !value.is_finite() || value <= 0.0 || value > 100.0 {
        return Err(Error::validation(format!(
            "{} must be within (0, 100], got {}",
            field, value
        )));
    }
    Ok(())
}

/// Validate a budget percentage in `[0, 100]`.
pub fn validate_budget_percent(value: f64, field: &str) -> Result<()> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(Error::validation(format!(
            "{} must be within [0, 100], got {}",
            field, value
        )));
    }
    Ok(())
}

/// Validate a fraction in `[0, 1)`.
pub fn validate_fraction(value: f64, field: &str) -> Result<()> {
    if !value.is_finite() || !(0.0..1.0).contains(&value) {
        return Err(Error::validation(format!(
            "{} must be within [0, 1), got {}",
            field, value
        )));
    }
    Ok(())
}
