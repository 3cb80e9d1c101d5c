//! Device registry.
//!
//! The registry owns two tables:
//!
//! - **factories**: `driver_type -> Box<dyn DriverFactory>`, filled once at
//!   startup
//! - **devices**: `id -> DeviceComponents`, filled from a [`HardwareConfig`]
//!   or by calling [`DeviceRegistry::register`]
//!
//! Devices are looked up by capability, so callers never see concrete
//! driver types:
//!
//! ```rust,ignore
//! use scope_hardware::{create_registry_from_file, DeviceRegistry};
//!
//! let registry = create_registry_from_file(Path::new("hardware.toml")).await?;
//! if let Some(wheel) = registry.filter_wheel("emission_wheel") {
//!     wheel.set_position(3).await?;
//! }
//! registry.shutdown_all().await?;
//! ```

use crate::config::{ConfigLoadError, DeviceConfig, HardwareConfig};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use scope_core::capabilities::{Device, FilterWheel, LightSource, SoftwareTriggered, Stage};
use scope_core::driver::{Capability, DeviceComponents, DriverFactory};
use scope_driver_mock::FactoryRegistry;
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while registering or shutting down devices.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Device '{0}' is already registered")]
    DuplicateDevice(String),

    #[error("No factory registered for driver_type '{driver_type}'. Available factories: {available:?}")]
    UnknownDriver {
        driver_type: String,
        available: Vec<String>,
    },

    #[error("Device '{0}' has no driver type")]
    MissingDriverType(String),

    #[error("Configuration validation failed for device '{device_id}' ({driver_type}): {message}")]
    InvalidConfig {
        device_id: String,
        driver_type: String,
        message: String,
    },

    #[error("Factory build failed for device '{device_id}' ({driver_type}): {message}")]
    BuildFailed {
        device_id: String,
        driver_type: String,
        message: String,
    },

    #[error("Shutdown failed for {} device(s):\n  - {}", .0.len(), .0.join("\n  - "))]
    ShutdownFailed(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigLoadError),
}

// =============================================================================
// Introspection types
// =============================================================================

/// Information about a registered device (returned by list operations)
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    /// Driver type name (e.g., "thorlabs_filter_wheel", "omicron")
    pub driver_type: String,
    /// Capabilities the built device actually offers
    pub capabilities: Vec<Capability>,
}

/// Information about a failed device registration
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationFailure {
    pub device_id: String,
    pub device_name: String,
    pub driver_type: String,
    /// Error message describing the failure
    pub error: String,
}

/// Information about a registered driver factory
#[derive(Debug, Clone, PartialEq)]
pub struct FactoryInfo {
    pub driver_type: String,
    pub name: String,
    pub capabilities: Vec<Capability>,
}

struct RegisteredDevice {
    info: DeviceInfo,
    components: DeviceComponents,
}

// =============================================================================
// DeviceRegistry
// =============================================================================

/// Thread-safe table of driver factories and built devices.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, RegisteredDevice>,
    factories: DashMap<String, Box<dyn DriverFactory>>,
    registration_failures: DashMap<String, RegistrationFailure>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver factory.
    ///
    /// Returns the factory previously registered for the same driver type.
    pub fn register_factory(
        &self,
        factory: Box<dyn DriverFactory>,
    ) -> Option<Box<dyn DriverFactory>> {
        let driver_type = factory.driver_type().to_string();
        tracing::info!(
            driver_type = %driver_type,
            name = %factory.name(),
            capabilities = ?factory.capabilities(),
            "Registering driver factory"
        );
        self.factories.insert(driver_type, factory)
    }

    /// Check if a factory is registered for a driver type.
    pub fn has_factory(&self, driver_type: &str) -> bool {
        self.factories.contains_key(driver_type)
    }

    /// Registered driver types, sorted.
    pub fn list_factories(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .factories
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        types.sort();
        types
    }

    pub fn factory_info(&self, driver_type: &str) -> Option<FactoryInfo> {
        self.factories.get(driver_type).map(|entry| {
            let factory = entry.value();
            FactoryInfo {
                driver_type: factory.driver_type().to_string(),
                name: factory.name().to_string(),
                capabilities: factory.capabilities().to_vec(),
            }
        })
    }

    /// Register a device from its config; `driver.type` selects the factory.
    pub async fn register(&self, config: DeviceConfig) -> Result<(), RegistryError> {
        let driver_type = config
            .driver_type()
            .ok_or_else(|| RegistryError::MissingDriverType(config.id.clone()))?
            .to_string();
        self.register_from_toml(&config.id, &config.name, &driver_type, config.driver)
            .await
    }

    /// Validate `config` with the factory for `driver_type`, build the device
    /// and store it under `device_id`.
    pub async fn register_from_toml(
        &self,
        device_id: &str,
        device_name: &str,
        driver_type: &str,
        config: toml::Value,
    ) -> Result<(), RegistryError> {
        if self.devices.contains_key(device_id) {
            return Err(RegistryError::DuplicateDevice(device_id.to_string()));
        }

        // The factory entry is released before the build is awaited.
        let build = {
            let factory = self
                .factories
                .get(driver_type)
                .ok_or_else(|| RegistryError::UnknownDriver {
                    driver_type: driver_type.to_string(),
                    available: self.list_factories(),
                })?;

            factory
                .validate(&config)
                .map_err(|e| RegistryError::InvalidConfig {
                    device_id: device_id.to_string(),
                    driver_type: driver_type.to_string(),
                    message: format!("{:#}", e),
                })?;
            factory.build(config)
        };

        tracing::info!(
            device_id = %device_id,
            device_name = %device_name,
            driver_type = %driver_type,
            "Building device from factory"
        );

        let components = build.await.map_err(|e| RegistryError::BuildFailed {
            device_id: device_id.to_string(),
            driver_type: driver_type.to_string(),
            message: format!("{:#}", e),
        })?;

        let info = DeviceInfo {
            id: device_id.to_string(),
            name: device_name.to_string(),
            driver_type: driver_type.to_string(),
            capabilities: components.capabilities(),
        };
        // Another register call for the same id may have finished during the build.
        let rejected = match self.devices.entry(device_id.to_string()) {
            Entry::Occupied(_) => Some(components),
            Entry::Vacant(slot) => {
                slot.insert(RegisteredDevice { info, components });
                None
            }
        };
        if let Some(components) = rejected {
            if let Some(device) = components.device {
                if let Err(e) = device.shutdown().await {
                    tracing::warn!(device_id = %device_id, error = %e, "Shutdown of duplicate device failed");
                }
            }
            return Err(RegistryError::DuplicateDevice(device_id.to_string()));
        }
        tracing::info!(device_id = %device_id, "Device registered successfully");
        Ok(())
    }

    /// Remove a device and shut it down. Returns false if the id is unknown.
    pub async fn unregister(&self, id: &str) -> anyhow::Result<bool> {
        let Some((_, device)) = self.devices.remove(id) else {
            return Ok(false);
        };
        if let Some(handle) = device.components.device {
            handle.shutdown().await?;
        }
        tracing::info!(device_id = %id, "Device unregistered");
        Ok(true)
    }

    /// Shut down and remove every device, collecting errors.
    pub async fn shutdown_all(&self) -> Result<(), RegistryError> {
        let ids: Vec<String> = self
            .devices
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut errors = Vec::new();

        for id in ids {
            if let Err(e) = self.unregister(&id).await {
                tracing::error!(device_id = %id, error = %e, "Shutdown failed");
                errors.push(format!("{}: {:#}", id, e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::ShutdownFailed(errors))
        }
    }

    /// All registered devices, sorted by id.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self
            .devices
            .iter()
            .map(|entry| entry.value().info.clone())
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn get_device_info(&self, id: &str) -> Option<DeviceInfo> {
        self.devices.get(id).map(|d| d.info.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    // =========================================================================
    // Capability access
    // =========================================================================

    pub fn device(&self, id: &str) -> Option<Arc<dyn Device>> {
        self.devices.get(id)?.components.device.clone()
    }

    pub fn filter_wheel(&self, id: &str) -> Option<Arc<dyn FilterWheel>> {
        self.devices.get(id)?.components.filter_wheel.clone()
    }

    pub fn light_source(&self, id: &str) -> Option<Arc<dyn LightSource>> {
        self.devices.get(id)?.components.light_source.clone()
    }

    pub fn triggered(&self, id: &str) -> Option<Arc<dyn SoftwareTriggered>> {
        self.devices.get(id)?.components.software_trigger.clone()
    }

    pub fn stage(&self, id: &str) -> Option<Arc<dyn Stage>> {
        self.devices.get(id)?.components.stage.clone()
    }

    /// Ids of devices offering `capability`, sorted.
    pub fn devices_with_capability(&self, capability: Capability) -> Vec<String> {
        let mut ids: Vec<String> = self
            .devices
            .iter()
            .filter(|entry| entry.value().info.capabilities.contains(&capability))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    // =========================================================================
    // Registration failures
    // =========================================================================

    /// Record a registration failure for later inspection.
    pub fn record_registration_failure(&self, failure: RegistrationFailure) {
        tracing::error!(
            device_id = %failure.device_id,
            device_name = %failure.device_name,
            driver_type = %failure.driver_type,
            error = %failure.error,
            "Device registration failed"
        );
        self.registration_failures
            .insert(failure.device_id.clone(), failure);
    }

    pub fn list_registration_failures(&self) -> Vec<RegistrationFailure> {
        let mut failures: Vec<RegistrationFailure> = self
            .registration_failures
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        failures.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        failures
    }

    pub fn has_registration_failures(&self) -> bool {
        !self.registration_failures.is_empty()
    }
}

impl FactoryRegistry for DeviceRegistry {
    fn register_factory(&self, factory: Box<dyn DriverFactory>) {
        DeviceRegistry::register_factory(self, factory);
    }
}

// =============================================================================
// Factory registration
// =============================================================================

/// Register the simulated-device factories.
pub fn register_mock_factories(registry: &DeviceRegistry) {
    scope_driver_mock::register_all(registry);
}

/// Register every real and simulated driver factory.
pub fn register_all_factories(registry: &DeviceRegistry) {
    registry.register_factory(Box::new(scope_driver_thorlabs::ThorlabsFilterWheelFactory));
    registry.register_factory(Box::new(scope_driver_cobolt::CoboltFactory));
    registry.register_factory(Box::new(scope_driver_omicron::OmicronFactory));
    registry.register_factory(Box::new(scope_driver_pi::PiStageFactory));
    register_mock_factories(registry);
}

// =============================================================================
// Building registries
// =============================================================================

/// Build a registry from a hardware config.
///
/// Devices that fail to validate or build are logged, recorded as
/// [`RegistrationFailure`]s and skipped; the remaining devices are still
/// registered.
pub async fn create_registry_from_config(config: &HardwareConfig) -> DeviceRegistry {
    let registry = DeviceRegistry::new();
    register_all_factories(&registry);

    let mut success_count = 0;
    let mut failure_count = 0;

    for device in &config.devices {
        let driver_type = device.driver_type().unwrap_or("<none>").to_string();
        tracing::info!(
            device_id = %device.id,
            device_name = %device.name,
            driver_type = %driver_type,
            "Registering device"
        );

        match registry.register(device.clone()).await {
            Ok(()) => success_count += 1,
            Err(e) => {
                failure_count += 1;
                registry.record_registration_failure(RegistrationFailure {
                    device_id: device.id.clone(),
                    device_name: device.name.clone(),
                    driver_type,
                    error: e.to_string(),
                });
            }
        }
    }

    if failure_count > 0 {
        tracing::warn!(
            success_count,
            failure_count,
            "Device registration completed with failures"
        );
    } else {
        tracing::info!(success_count, "All devices registered successfully");
    }
    registry
}

/// Load a hardware file and build a registry from it.
pub async fn create_registry_from_file(path: &Path) -> Result<DeviceRegistry, RegistryError> {
    let config = HardwareConfig::from_file(path)?;
    Ok(create_registry_from_config(&config).await)
}

/// Hardware config describing one of each simulated device.
pub fn mock_hardware_config() -> HardwareConfig {
    let table = |value: toml::Table| toml::Value::Table(value);
    HardwareConfig {
        devices: vec![
            DeviceConfig::new(
                "wheel",
                "Simulated FW102C",
                "mock_filter_wheel",
                table(toml::toml! { model = "fw102c" }),
            ),
            DeviceConfig::new(
                "stepper_wheel",
                "Simulated FW103M",
                "mock_stepper_wheel",
                table(toml::Table::new()),
            ),
            DeviceConfig::new(
                "cobolt",
                "Simulated Cobolt 04",
                "mock_cobolt",
                table(toml::toml! { variant = "standard" }),
            ),
            DeviceConfig::new(
                "dpl",
                "Simulated Cobolt 06-DPL",
                "mock_cobolt",
                table(toml::toml! { variant = "dpl06" }),
            ),
            DeviceConfig::new(
                "omicron",
                "Simulated Omicron LuxX",
                "mock_omicron",
                table(toml::toml! { max_power_mw = 100.0 }),
            ),
            DeviceConfig::new(
                "stage",
                "Simulated PI E-754",
                "mock_pi_stage",
                table(toml::toml! { axes = { z = 1 } }),
            ),
        ],
    }
}

/// Registry holding one of each simulated device.
pub async fn create_mock_registry() -> DeviceRegistry {
    create_registry_from_config(&mock_hardware_config()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_register_all_factories() {
        let registry = DeviceRegistry::new();
        register_all_factories(&registry);
        for driver_type in [
            "thorlabs_filter_wheel",
            "cobolt",
            "omicron",
            "pi_e754",
            "mock_filter_wheel",
            "mock_stepper_wheel",
            "mock_cobolt",
            "mock_omicron",
            "mock_pi_stage",
        ] {
            assert!(registry.has_factory(driver_type), "{}", driver_type);
        }
        let info = registry.factory_info("omicron").unwrap();
        assert_eq!(
            info.capabilities,
            vec![Capability::LightSource, Capability::SoftwareTrigger]
        );
    }

    #[tokio::test]
    async fn test_register_factory_returns_previous() {
        let registry = DeviceRegistry::new();
        assert!(registry
            .register_factory(Box::new(scope_driver_mock::MockCoboltFactory))
            .is_none());
        assert!(registry
            .register_factory(Box::new(scope_driver_mock::MockCoboltFactory))
            .is_some());
        assert_eq!(registry.list_factories(), vec!["mock_cobolt"]);
    }

    #[tokio::test]
    async fn test_mock_registry_capabilities() {
        let registry = create_mock_registry().await;
        assert!(!registry.has_registration_failures());
        assert_eq!(registry.len(), 6);

        assert!(registry.filter_wheel("wheel").is_some());
        assert!(registry.filter_wheel("stepper_wheel").is_some());
        assert!(registry.light_source("wheel").is_none());
        assert!(registry.light_source("cobolt").is_some());
        assert!(registry.triggered("cobolt").is_none());
        assert!(registry.triggered("dpl").is_some());
        assert!(registry.triggered("omicron").is_some());
        assert!(registry.stage("stage").is_some());
        assert!(registry.stage("omicron").is_none());

        assert_eq!(
            registry.devices_with_capability(Capability::FilterWheel),
            vec!["stepper_wheel", "wheel"]
        );
        registry.shutdown_all().await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_driver_is_recorded_and_skipped() {
        let config = HardwareConfig {
            devices: vec![
                DeviceConfig::new("ghost", "Ghost", "no_such_driver", toml::Value::Table(toml::Table::new())),
                DeviceConfig::new("wheel", "Wheel", "mock_filter_wheel", toml::Value::Table(toml::Table::new())),
            ],
        };
        let registry = create_registry_from_config(&config).await;

        assert!(registry.contains("wheel"));
        assert!(!registry.contains("ghost"));
        let failures = registry.list_registration_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].driver_type, "no_such_driver");
        assert!(failures[0].error.contains("No factory registered"));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_build() {
        let registry = DeviceRegistry::new();
        register_mock_factories(&registry);
        let err = registry
            .register(DeviceConfig::new(
                "laser",
                "Laser",
                "mock_omicron",
                toml::Value::Table(toml::toml! { adhoc_rate = 1.5 }),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfig { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_device_id() {
        let registry = DeviceRegistry::new();
        register_mock_factories(&registry);
        let config = DeviceConfig::new(
            "wheel",
            "Wheel",
            "mock_stepper_wheel",
            toml::Value::Table(toml::Table::new()),
        );
        registry.register(config.clone()).await.unwrap();
        let err = registry.register(config).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateDevice(_)));
    }

    struct Counted {
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Device for Counted {
        fn name(&self) -> &str {
            "counted"
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Builds take a while, so two registrations can overlap.
    struct SlowFactory {
        shutdowns: Arc<AtomicUsize>,
    }

    impl DriverFactory for SlowFactory {
        fn driver_type(&self) -> &'static str {
            "slow"
        }

        fn name(&self) -> &'static str {
            "Slow"
        }

        fn validate(&self, _config: &toml::Value) -> anyhow::Result<()> {
            Ok(())
        }

        fn build(&self, _config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
            let shutdowns = self.shutdowns.clone();
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                Ok(DeviceComponents {
                    device: Some(Arc::new(Counted { shutdowns })),
                    ..Default::default()
                })
            })
        }
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_registration() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let registry = DeviceRegistry::new();
        registry.register_factory(Box::new(SlowFactory {
            shutdowns: shutdowns.clone(),
        }));
        let config = DeviceConfig::new("dup", "Dup", "slow", toml::Value::Table(toml::Table::new()));

        let (a, b) = tokio::join!(registry.register(config.clone()), registry.register(config));
        let duplicates = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(RegistryError::DuplicateDevice(_))))
            .count();
        assert_eq!(duplicates, 1);
        assert!(a.is_ok() || b.is_ok());
        assert_eq!(registry.len(), 1);
        // The losing build was shut down, the registered one is untouched.
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        registry.shutdown_all().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unregister_unknown_device() {
        let registry = DeviceRegistry::new();
        assert!(!registry.unregister("nothing").await.unwrap());
    }
}
