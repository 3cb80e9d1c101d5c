//! Capability traits exposed by finished devices.
//!
//! These are the only operations the hosting framework calls. Each trait is
//! object safe and returns `anyhow::Result` so drivers can attach context to
//! the [`DeviceError`](crate::error::DeviceError) values underneath.
//!
//! # Example
//!
//! ```rust,ignore
//! use scope_core::capabilities::LightSource;
//!
//! async fn half_power(laser: &dyn LightSource) -> anyhow::Result<()> {
//!     laser.set_power(0.5).await?;
//!     if !laser.enable().await? {
//!         for line in laser.status().await? {
//!             tracing::warn!("{}", line);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use crate::error::DeviceError;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Device
// =============================================================================

/// Lifecycle shared by every device.
#[async_trait]
pub trait Device: Send + Sync {
    /// Name for logs and listings.
    fn name(&self) -> &str;

    /// Cancel pending work, switch off outputs and release the line.
    async fn shutdown(&self) -> Result<()>;
}

// =============================================================================
// FilterWheel
// =============================================================================

/// Wheel with `position_count()` logical slots numbered from zero.
#[async_trait]
pub trait FilterWheel: Send + Sync {
    fn position_count(&self) -> usize;

    /// Current slot, decoded through the position table.
    async fn position(&self) -> Result<usize>;

    /// Move to `slot`.
    async fn set_position(&self, slot: usize) -> Result<()>;
}

// =============================================================================
// LightSource
// =============================================================================

/// Laser or other switchable light with a normalised power control.
#[async_trait]
pub trait LightSource: Send + Sync {
    /// Request output power as a fraction of the maximum, `0.0..=1.0`.
    async fn set_power(&self, fraction: f64) -> Result<()>;

    /// Output power as reported by the device, as a fraction.
    async fn power(&self) -> Result<f64>;

    /// Last requested power fraction.
    fn power_setpoint(&self) -> f64;

    /// Switch emission on. `Ok(false)` means the device refused.
    async fn enable(&self) -> Result<bool>;

    /// Switch emission off. `Ok(false)` means the device stayed on.
    async fn disable(&self) -> Result<bool>;

    async fn is_enabled(&self) -> Result<bool>;

    /// Human readable status lines.
    async fn status(&self) -> Result<Vec<String>>;
}

/// Reject power fractions outside `0.0..=1.0`.
pub fn validate_power_fraction(fraction: f64) -> Result<f64, DeviceError> {
    if fraction.is_finite() && (0.0..=1.0).contains(&fraction) {
        Ok(fraction)
    } else {
        Err(DeviceError::InvalidParameter(format!(
            "power fraction {} is outside 0.0..=1.0",
            fraction
        )))
    }
}

// =============================================================================
// Stage
// =============================================================================

/// Travel range of one stage axis, in the controller's units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisLimits {
    pub lower: f64,
    pub upper: f64,
}

impl AxisLimits {
    pub fn contains(&self, position: f64) -> bool {
        position.is_finite() && (self.lower..=self.upper).contains(&position)
    }
}

/// Positioner with one or more named axes.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Axis names, sorted.
    fn axes(&self) -> Vec<String>;

    /// Move `axis` to an absolute position. Targets outside
    /// [`limits`](Self::limits) fail with [`DeviceError::InvalidParameter`].
    async fn move_to(&self, axis: &str, position: f64) -> Result<()>;

    async fn move_by(&self, axis: &str, delta: f64) -> Result<()>;

    async fn position(&self, axis: &str) -> Result<f64>;

    async fn limits(&self, axis: &str) -> Result<AxisLimits>;
}

// =============================================================================
// Software trigger
// =============================================================================

/// Source of the trigger that starts an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Software,
    /// External digital input
    Hardware,
}

/// What one trigger does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// One exposure of the configured length per trigger
    Once,
    /// Light stays on while the trigger is held
    Bulb,
    /// Repeated pulses
    Strobe,
}

/// Light source that can be triggered for a fixed exposure.
///
/// Triggering leaves standby and schedules the return to standby; it does
/// not wait for the exposure to end.
#[async_trait]
pub trait SoftwareTriggered: Send + Sync {
    fn trigger_type(&self) -> TriggerType;

    fn trigger_mode(&self) -> TriggerMode;

    /// Select trigger source and mode. Unsupported combinations fail with
    /// [`DeviceError::Unsupported`].
    async fn set_trigger(&self, trigger_type: TriggerType, mode: TriggerMode) -> Result<()>;

    fn exposure(&self) -> Duration;

    fn set_exposure(&self, exposure: Duration);

    async fn trigger(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_fraction_bounds() {
        assert_eq!(validate_power_fraction(0.0).unwrap(), 0.0);
        assert_eq!(validate_power_fraction(1.0).unwrap(), 1.0);
        assert!(validate_power_fraction(1.01).is_err());
        assert!(validate_power_fraction(-0.1).is_err());
        assert!(validate_power_fraction(f64::NAN).is_err());
    }

    #[test]
    fn test_axis_limits() {
        let limits = AxisLimits {
            lower: 0.0,
            upper: 100.0,
        };
        assert!(limits.contains(0.0));
        assert!(limits.contains(100.0));
        assert!(!limits.contains(100.5));
        assert!(!limits.contains(f64::NAN));
    }

    #[test]
    fn test_trigger_type_serde_names() {
        let parsed: TriggerType = toml::Value::String("software".into()).try_into().unwrap();
        assert_eq!(parsed, TriggerType::Software);
    }
}
