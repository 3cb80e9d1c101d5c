//! Thorlabs FW102C / FW212C serial filter wheel.
//!
//! Protocol: 115200 baud, 8N1, ASCII commands terminated by CR.
//! The controller echoes every command, answers queries on the following
//! line and then prints a `> ` prompt without a terminator. Error messages
//! end in LF instead of CR.
//!
//! | command   | meaning                         |
//! |-----------|---------------------------------|
//! | `pcount?` | number of positions             |
//! | `pos?`    | current position, 1-based       |
//! | `pos=<n>` | move to position `n`            |
//!
//! Models differ only in position count, so one driver covers all of them;
//! `model` or `expected_positions` in the config turns a count mismatch into
//! an initialization error.
//!
//! # Usage
//!
//! ```rust,ignore
//! let config = toml::toml! {
//!     port = "/dev/ttyUSB0"
//!     model = "fw102c"
//! };
//! let components = ThorlabsFilterWheelFactory.build(config.into()).await?;
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use scope_core::capabilities::{Device, FilterWheel};
use scope_core::driver::{Capability, DeviceComponents, DriverFactory};
use scope_core::error::{DeviceError, DeviceResult};
use scope_core::exchange::{ExchangeSettings, Exchanger};
use scope_core::position_table::PositionTable;
use scope_core::serial::{Connection, SerialSettings};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

// =============================================================================
// Configuration
// =============================================================================

/// Known wheel models and their position counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WheelModel {
    Fw102c,
    Fw212c,
}

impl WheelModel {
    pub fn position_count(self) -> usize {
        match self {
            Self::Fw102c => 6,
            Self::Fw212c => 12,
        }
    }
}

/// Configuration for the serial filter wheel
#[derive(Debug, Clone, Deserialize)]
pub struct FilterWheelConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0")
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Per-line read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Model whose position count the device must report
    #[serde(default)]
    pub model: Option<WheelModel>,
    /// Position count the device must report
    #[serde(default)]
    pub expected_positions: Option<usize>,
    /// Device position for each slot; defaults to `1..=pcount`
    #[serde(default)]
    pub positions: Option<Vec<u32>>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_timeout_ms() -> u64 {
    2_000
}

fn default_max_attempts() -> u32 {
    scope_core::exchange::DEFAULT_MAX_ATTEMPTS
}

impl FilterWheelConfig {
    /// Config for `port` with every option at its default.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
            model: None,
            expected_positions: None,
            positions: None,
            max_attempts: default_max_attempts(),
        }
    }

    /// Position count the device is required to report, if any.
    pub fn expected_count(&self) -> DeviceResult<Option<usize>> {
        match (self.model, self.expected_positions) {
            (Some(model), Some(count)) if model.position_count() != count => {
                Err(DeviceError::Configuration(format!(
                    "model {:?} has {} positions but expected_positions is {}",
                    model,
                    model.position_count(),
                    count
                )))
            }
            (Some(model), _) => Ok(Some(model.position_count())),
            (None, count) => Ok(count),
        }
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(&self.port, self.baud_rate)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_terminator("\r")
    }

    fn check(&self) -> DeviceResult<()> {
        self.expected_count()?;
        if let Some(positions) = &self.positions {
            PositionTable::new(positions.clone())?;
        }
        Ok(())
    }
}

// =============================================================================
// ThorlabsFilterWheelFactory
// =============================================================================

/// Factory for serial filter wheels.
pub struct ThorlabsFilterWheelFactory;

static FILTER_WHEEL_CAPABILITIES: &[Capability] = &[Capability::FilterWheel];

impl DriverFactory for ThorlabsFilterWheelFactory {
    fn driver_type(&self) -> &'static str {
        "thorlabs_filter_wheel"
    }

    fn name(&self) -> &'static str {
        "Thorlabs FW102C/FW212C Filter Wheel"
    }

    fn capabilities(&self) -> &'static [Capability] {
        FILTER_WHEEL_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: FilterWheelConfig = config.clone().try_into()?;
        cfg.check()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: FilterWheelConfig = config
                .try_into()
                .context("Invalid Thorlabs filter wheel config")?;
            let wheel = Arc::new(ThorlabsFilterWheel::open(&cfg).await?);

            Ok(DeviceComponents {
                device: Some(wheel.clone()),
                filter_wheel: Some(wheel),
                ..Default::default()
            })
        })
    }
}

// =============================================================================
// ThorlabsFilterWheel
// =============================================================================

/// Serial filter wheel with slots mapped through a position table.
pub struct ThorlabsFilterWheel {
    name: String,
    exchanger: Exchanger,
    table: PositionTable<u32>,
}

impl ThorlabsFilterWheel {
    /// Open the configured port and initialise.
    pub async fn open(config: &FilterWheelConfig) -> DeviceResult<Self> {
        config.check()?;
        let connection = Connection::open("thorlabs_filter_wheel", &config.serial_settings()).await?;
        Self::with_connection(connection, config).await
    }

    /// Initialise over an already open line.
    ///
    /// Queries the position count and fails if it disagrees with the
    /// configured model, expected count or position table.
    pub async fn with_connection(
        connection: Connection,
        config: &FilterWheelConfig,
    ) -> DeviceResult<Self> {
        let name = connection.name().to_string();
        let settings = ExchangeSettings::default().with_max_attempts(config.max_attempts);
        let exchanger = Exchanger::new(connection, settings);
        exchanger.drain().await;

        let count: usize = exchanger
            .query_parsed("pcount?")
            .await
            .map_err(|e| DeviceError::Initialization(format!("position count query failed: {}", e)))?;

        if let Some(expected) = config.expected_count()? {
            if count != expected {
                return Err(DeviceError::Initialization(format!(
                    "wheel reports {} positions, expected {}",
                    count, expected
                )));
            }
        }

        let table = match &config.positions {
            Some(positions) if positions.len() != count => {
                return Err(DeviceError::Initialization(format!(
                    "position table has {} entries but wheel reports {} positions",
                    positions.len(),
                    count
                )));
            }
            Some(positions) => PositionTable::new(positions.clone())?,
            None => PositionTable::one_based(count)?,
        };

        tracing::info!(device = %name, positions = count, "Filter wheel initialised");
        Ok(Self {
            name,
            exchanger,
            table,
        })
    }

    pub fn table(&self) -> &PositionTable<u32> {
        &self.table
    }

    /// Move to a logical slot.
    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn move_to(&self, slot: usize) -> DeviceResult<()> {
        let physical = self.table.physical(slot)?;
        self.exchanger.send(&format!("pos={}", physical)).await?;
        Ok(())
    }

    /// Read the current logical slot.
    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn current_slot(&self) -> DeviceResult<usize> {
        let physical: u32 = self.exchanger.query_parsed("pos?").await?;
        self.table.slot_of(physical)
    }
}

#[async_trait]
impl FilterWheel for ThorlabsFilterWheel {
    fn position_count(&self) -> usize {
        self.table.len()
    }

    async fn position(&self) -> Result<usize> {
        Ok(self.current_slot().await?)
    }

    async fn set_position(&self, slot: usize) -> Result<()> {
        self.move_to(slot)
            .await
            .with_context(|| format!("{}: move to slot {}", self.name, slot))
    }
}

#[async_trait]
impl Device for ThorlabsFilterWheel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) -> Result<()> {
        let mut line = self.exchanger.connection().lock().await;
        line.drain(Duration::from_millis(10)).await;
        line.close().await?;
        tracing::info!(device = %self.name, "Filter wheel shut down");
        Ok(())
    }
}
