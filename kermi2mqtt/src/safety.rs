//! Write protection: per-parameter range checks and a per-key rate limiter.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::client::WriteTarget;

/// Allowed constant DHW setpoint in °C.
pub const DHW_SETPOINT_RANGE: (f64, f64) = (40.0, 60.0);
/// Allowed heating curve shift in K.
pub const HEATING_CURVE_OFFSET_RANGE: (f64, f64) = (-5.0, 5.0);
/// Allowed heating limit temperature in °C.
pub const SEASON_THRESHOLD_RANGE: (f64, f64) = (10.0, 25.0);

/// Default minimum interval between writes to the same control.
pub const DEFAULT_RATE_LIMIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SafetyError {
    #[error("{0}")]
    OutOfRange(String),

    #[error("{name} is blocked: {reason}")]
    Blocked { name: String, reason: String },
}

/// Closed-interval range check.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeValidator {
    min: f64,
    max: f64,
    below_hint: Option<&'static str>,
    above_hint: Option<&'static str>,
}

impl RangeValidator {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            below_hint: None,
            above_hint: None,
        }
    }

    pub fn from_range(range: (f64, f64)) -> Self {
        Self::new(range.0, range.1)
    }

    /// Extra explanation appended when a value is below the minimum.
    pub fn with_below_hint(mut self, hint: &'static str) -> Self {
        self.below_hint = Some(hint);
        self
    }

    /// Extra explanation appended when a value is above the maximum.
    pub fn with_above_hint(mut self, hint: &'static str) -> Self {
        self.above_hint = Some(hint);
        self
    }

    pub fn validate(&self, name: &str, value: f64) -> Result<(), SafetyError> {
        let (side, bound, hint) = if value < self.min {
            ("below minimum", self.min, self.below_hint)
        } else if value > self.max {
            ("above maximum", self.max, self.above_hint)
        } else if value.is_nan() {
            return Err(SafetyError::OutOfRange(format!("{} must be a number", name)));
        } else {
            return Ok(());
        };

        let mut reason = format!(
            "{} value {} is {} {} (allowed range {} to {})",
            name, value, side, bound, self.min, self.max
        );
        if let Some(hint) = hint {
            reason.push_str(": ");
            reason.push_str(hint);
        }
        Err(SafetyError::OutOfRange(reason))
    }
}

/// Validator of one writable parameter, optionally blocked outright.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyValidator {
    name: &'static str,
    range: Option<RangeValidator>,
    blocked: Option<String>,
}

impl SafetyValidator {
    pub fn new(name: &'static str, range: Option<RangeValidator>) -> Self {
        Self {
            name,
            range,
            blocked: None,
        }
    }

    pub fn block(&mut self, reason: impl Into<String>) {
        self.blocked = Some(reason.into());
    }

    /// Check a value. Blocks always apply; ranges only when `check_range`.
    pub fn validate(&self, value: Option<f64>, check_range: bool) -> Result<(), SafetyError> {
        if let Some(reason) = &self.blocked {
            return Err(SafetyError::Blocked {
                name: self.name.to_string(),
                reason: reason.clone(),
            });
        }

        match (&self.range, value) {
            (Some(range), Some(value)) if check_range => range.validate(self.name, value),
            _ => Ok(()),
        }
    }
}

/// Validators for every write target.
#[derive(Debug, Clone)]
pub struct SafetyRegistry {
    validators: HashMap<WriteTarget, SafetyValidator>,
    enable_validation: bool,
}

impl SafetyRegistry {
    pub fn new(enable_validation: bool) -> Self {
        let mut validators = HashMap::new();

        validators.insert(
            WriteTarget::HotWaterSetpoint,
            SafetyValidator::new(
                "DHW setpoint",
                Some(
                    RangeValidator::from_range(DHW_SETPOINT_RANGE)
                        .with_below_hint("Legionella risk")
                        .with_above_hint("scald risk"),
                ),
            ),
        );
        validators.insert(
            WriteTarget::HeatingCurveOffset,
            SafetyValidator::new(
                "Heating curve offset",
                Some(RangeValidator::from_range(HEATING_CURVE_OFFSET_RANGE)),
            ),
        );
        validators.insert(
            WriteTarget::SeasonThresholdHeatingLimit,
            SafetyValidator::new(
                "Heating limit temperature",
                Some(RangeValidator::from_range(SEASON_THRESHOLD_RANGE)),
            ),
        );
        validators.insert(
            WriteTarget::HotWaterSingleCharge,
            SafetyValidator::new("One-time heating", None),
        );
        validators.insert(
            WriteTarget::SeasonSelection,
            SafetyValidator::new("Season selection", None),
        );
        validators.insert(WriteTarget::EnergyMode, SafetyValidator::new("Energy mode", None));

        Self {
            validators,
            enable_validation,
        }
    }

    pub fn block(&mut self, target: WriteTarget, reason: impl Into<String>) {
        if let Some(validator) = self.validators.get_mut(&target) {
            validator.block(reason);
        }
    }

    /// Validate a write. Numeric values are range-checked when validation is
    /// enabled; other values only face blocks.
    pub fn validate(&self, target: WriteTarget, value: Option<f64>) -> Result<(), SafetyError> {
        match self.validators.get(&target) {
            Some(validator) => validator.validate(value, self.enable_validation),
            None => Ok(()),
        }
    }
}

impl Default for SafetyRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Minimum interval between accepted writes, per key.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    last_write: HashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_write: HashMap::new(),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Check whether `key` may be written now. On rejection returns the
    /// remaining wait. Never changes state.
    pub fn can_write(&self, key: &str) -> Result<(), Duration> {
        let Some(last) = self.last_write.get(key) else {
            return Ok(());
        };

        let elapsed = last.elapsed();
        if elapsed < self.min_interval {
            Err(self.min_interval - elapsed)
        } else {
            Ok(())
        }
    }

    /// Record an accepted write of `key`.
    pub fn record(&mut self, key: &str) {
        let now = Instant::now();
        let entry = self.last_write.entry(key.to_string()).or_insert(now);
        if now > *entry {
            *entry = now;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dhw_setpoint_bounds() {
        let safety = SafetyRegistry::default();
        let target = WriteTarget::HotWaterSetpoint;

        let low = safety.validate(target, Some(39.9)).unwrap_err();
        assert!(low.to_string().contains("Legionella"));

        let high = safety.validate(target, Some(60.1)).unwrap_err();
        assert!(high.to_string().contains("scald"));

        assert!(safety.validate(target, Some(45.0)).is_ok());
        assert!(safety.validate(target, Some(40.0)).is_ok());
        assert!(safety.validate(target, Some(60.0)).is_ok());
    }

    #[test]
    fn test_other_ranges() {
        let safety = SafetyRegistry::default();
        assert!(safety.validate(WriteTarget::HeatingCurveOffset, Some(-5.0)).is_ok());
        assert!(safety.validate(WriteTarget::HeatingCurveOffset, Some(5.5)).is_err());
        assert!(safety.validate(WriteTarget::SeasonThresholdHeatingLimit, Some(9.0)).is_err());
        assert!(safety.validate(WriteTarget::SeasonThresholdHeatingLimit, Some(18.0)).is_ok());
    }

    #[test]
    fn test_validation_disabled_keeps_blocks() {
        let mut safety = SafetyRegistry::new(false);
        assert!(safety.validate(WriteTarget::HotWaterSetpoint, Some(75.0)).is_ok());

        safety.block(WriteTarget::EnergyMode, "managed by PV controller");
        let err = safety.validate(WriteTarget::EnergyMode, None).unwrap_err();
        assert_eq!(
            err,
            SafetyError::Blocked {
                name: "Energy mode".to_string(),
                reason: "managed by PV controller".to_string(),
            }
        );
    }

    #[test]
    fn test_nan_rejected() {
        let range = RangeValidator::new(0.0, 1.0);
        assert!(range.validate("x", f64::NAN).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_window() {
        let mut limiter = RateLimiter::new(Duration::from_secs(60));
        assert!(limiter.can_write("dev_hot_water_setpoint").is_ok());
        limiter.record("dev_hot_water_setpoint");

        tokio::time::advance(Duration::from_secs(20)).await;
        let wait = limiter.can_write("dev_hot_water_setpoint").unwrap_err();
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(60));
        assert_eq!(wait, Duration::from_secs(40));

        // Other keys are independent
        assert!(limiter.can_write("dev_energy_mode").is_ok());

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(limiter.can_write("dev_hot_water_setpoint").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_does_not_extend_window() {
        let mut limiter = RateLimiter::new(Duration::from_secs(10));
        limiter.record("k");
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.can_write("k").is_err());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.can_write("k").is_ok());
    }
}
