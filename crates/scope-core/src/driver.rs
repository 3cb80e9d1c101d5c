//! Driver factory and component types.
//!
//! Drivers implement [`DriverFactory`] and are registered with a device
//! registry at startup. A factory parses its `[devices.driver]` TOML table,
//! opens the hardware and returns a [`DeviceComponents`] bag holding one
//! trait object per capability the device offers.
//!
//! ```text
//! main.rs ── registry.register_factory(ThorlabsFilterWheelFactory)
//!                 │
//!                 ▼
//! DeviceRegistry ── factories: driver_type -> Box<dyn DriverFactory>
//!                 │
//!                 ▼
//! DriverFactory::build(toml) -> DeviceComponents { filter_wheel, .. }
//! ```

use crate::capabilities::{Device, FilterWheel, LightSource, SoftwareTriggered, Stage};
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Capability Enum
// =============================================================================

/// Runtime capability flags for device introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Corresponds to [`FilterWheel`]
    FilterWheel,
    /// Corresponds to [`LightSource`]
    LightSource,
    /// Corresponds to [`SoftwareTriggered`]
    SoftwareTrigger,
    /// Corresponds to [`Stage`]
    Stage,
}

impl Capability {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::FilterWheel => "Filter Wheel",
            Self::LightSource => "Light Source",
            Self::SoftwareTrigger => "Software Trigger",
            Self::Stage => "Stage",
        }
    }
}

// =============================================================================
// DeviceComponents
// =============================================================================

/// Capabilities produced by one factory build.
///
/// Usually every field points at the same driver object.
#[derive(Default, Clone)]
pub struct DeviceComponents {
    /// Lifecycle handle; present for every real device
    pub device: Option<Arc<dyn Device>>,
    pub filter_wheel: Option<Arc<dyn FilterWheel>>,
    pub light_source: Option<Arc<dyn LightSource>>,
    pub software_trigger: Option<Arc<dyn SoftwareTriggered>>,
    pub stage: Option<Arc<dyn Stage>>,
}

impl DeviceComponents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capabilities actually present.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.filter_wheel.is_some() {
            caps.push(Capability::FilterWheel);
        }
        if self.light_source.is_some() {
            caps.push(Capability::LightSource);
        }
        if self.software_trigger.is_some() {
            caps.push(Capability::SoftwareTrigger);
        }
        if self.stage.is_some() {
            caps.push(Capability::Stage);
        }
        caps
    }
}

// =============================================================================
// DriverFactory
// =============================================================================

/// Factory for a driver type named in TOML config.
///
/// Factories are registered once and live for the whole program, so they
/// hold no mutable state between builds.
pub trait DriverFactory: Send + Sync + 'static {
    /// Value of the `type` field this factory handles, e.g. `"thorlabs_filter_wheel"`.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// Capabilities this driver type provides.
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Check the configuration without touching hardware.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Open the hardware and build the device.
    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_components_have_no_capabilities() {
        assert!(DeviceComponents::new().capabilities().is_empty());
    }

    #[test]
    fn test_capability_names() {
        assert_eq!(Capability::FilterWheel.name(), "Filter Wheel");
        let parsed: Capability = toml::Value::String("software_trigger".into())
            .try_into()
            .unwrap();
        assert_eq!(parsed, Capability::SoftwareTrigger);
    }
}
