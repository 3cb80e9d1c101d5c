//! Hardware configuration files.
//!
//! A hardware file lists the devices to build:
//!
//! ```toml
//! [[devices]]
//! id = "emission_wheel"
//! name = "Emission filter wheel"
//! [devices.driver]
//! type = "thorlabs_filter_wheel"
//! port = "/dev/ttyUSB0"
//! model = "fw102c"
//!
//! [[devices]]
//! id = "laser_488"
//! name = "Omicron LuxX 488"
//! [devices.driver]
//! type = "omicron"
//! port = "/dev/ttyUSB1"
//! ```
//!
//! Everything under `[devices.driver]` apart from `type` is handed to the
//! driver factory unchanged. Files are read through Figment, so any key can
//! also be supplied by a `SCOPE_`-prefixed environment variable.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// File not found
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Parse error (invalid TOML or wrong shape)
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// Validation error
    #[error("Config validation failed:\n  - {}", .0.join("\n  - "))]
    ValidationError(Vec<String>),
}

/// One device to build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique identifier (e.g., "emission_wheel", "laser_488")
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Driver table; `type` selects the factory
    pub driver: toml::Value,
}

impl DeviceConfig {
    /// Build a config from a driver type and its remaining options.
    pub fn new(id: &str, name: &str, driver_type: &str, options: toml::Value) -> Self {
        let mut table = match options {
            toml::Value::Table(table) => table,
            _ => toml::Table::new(),
        };
        table.insert("type".to_string(), toml::Value::String(driver_type.to_string()));
        Self {
            id: id.to_string(),
            name: name.to_string(),
            driver: toml::Value::Table(table),
        }
    }

    /// Value of `driver.type`, if present.
    pub fn driver_type(&self) -> Option<&str> {
        self.driver.get("type").and_then(|t| t.as_str())
    }
}

/// Contents of a hardware configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Devices in registration order
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl HardwareConfig {
    /// Load and check a hardware file, with `SCOPE_` environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigLoadError> {
        if !path.exists() {
            return Err(ConfigLoadError::NotFound(path.display().to_string()));
        }
        debug!("Loading hardware config from: {}", path.display());

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SCOPE_").split("__"))
            .extract()
            .map_err(|e| ConfigLoadError::ParseError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;

        info!(
            path = %path.display(),
            devices = config.devices.len(),
            "Loaded hardware config"
        );
        Ok(config)
    }

    /// Parse and check hardware config text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigLoadError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that need no driver knowledge: ids are unique and
    /// every driver table names a type.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                errors.push(format!("device '{}' has an empty id", device.name));
            } else if !seen.insert(device.id.as_str()) {
                errors.push(format!("device id '{}' is used more than once", device.id));
            }
            if !device.driver.is_table() {
                errors.push(format!("device '{}': driver must be a table", device.id));
            } else if device.driver_type().is_none() {
                errors.push(format!("device '{}': driver table has no 'type'", device.id));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigLoadError::ValidationError(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_DEVICES: &str = r#"
[[devices]]
id = "wheel"
name = "Wheel"
[devices.driver]
type = "mock_filter_wheel"
positions = [0, 300, 240, 180, 120, 60]

[[devices]]
id = "laser"
name = "Laser"
[devices.driver]
type = "mock_cobolt"
variant = "dpl06"
"#;

    #[test]
    fn test_parse_devices() {
        let config = HardwareConfig::from_toml_str(TWO_DEVICES).unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].driver_type(), Some("mock_filter_wheel"));
        assert_eq!(
            config.devices[1].driver.get("variant").and_then(|v| v.as_str()),
            Some("dpl06")
        );
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let text = r#"
[[devices]]
id = "a"
name = "One"
driver = { type = "mock_cobolt" }

[[devices]]
id = "a"
name = "Two"
driver = { type = "mock_omicron" }
"#;
        let err = HardwareConfig::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("used more than once"));
    }

    #[test]
    fn test_missing_type_rejected() {
        let text = r#"
[[devices]]
id = "a"
name = "One"
driver = { port = "/dev/ttyUSB0" }
"#;
        assert!(matches!(
            HardwareConfig::from_toml_str(text),
            Err(ConfigLoadError::ValidationError(_))
        ));
    }

    #[test]
    fn test_device_config_new_sets_type() {
        let config = DeviceConfig::new(
            "w",
            "Wheel",
            "mock_filter_wheel",
            toml::Value::Table(toml::toml! { count = 12 }),
        );
        assert_eq!(config.driver_type(), Some("mock_filter_wheel"));
        assert_eq!(config.driver.get("count").and_then(|c| c.as_integer()), Some(12));
    }

    #[test]
    fn test_missing_file() {
        let err = HardwareConfig::from_file(Path::new("/nonexistent/hardware.toml")).unwrap_err();
        assert!(matches!(err, ConfigLoadError::NotFound(_)));
    }
}
