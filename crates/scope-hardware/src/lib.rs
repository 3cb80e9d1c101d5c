//! # scope-hardware
//!
//! Device registry and hardware configuration for the scope drivers.
//!
//! - **[`DeviceRegistry`]** - driver factories and built devices, looked up
//!   by capability
//! - **[`HardwareConfig`]** - `[[devices]]` TOML files loaded through Figment
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use scope_hardware::{create_registry_from_file, HardwareConfig};
//!
//! let registry = create_registry_from_file(Path::new("hardware.toml")).await?;
//! for info in registry.list_devices() {
//!     println!("{}: {} ({:?})", info.id, info.name, info.capabilities);
//! }
//! ```

pub mod config;
pub mod registry;

pub use config::{ConfigLoadError, DeviceConfig, HardwareConfig};
pub use registry::{
    create_mock_registry, create_registry_from_config, create_registry_from_file,
    mock_hardware_config, register_all_factories, register_mock_factories, DeviceInfo,
    DeviceRegistry, FactoryInfo, RegistrationFailure, RegistryError,
};
pub use scope_core::capabilities;
pub use scope_core::driver::Capability;
