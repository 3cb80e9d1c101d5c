//! Cobolt diode pumped lasers.
//!
//! Protocol: 115200 baud, 8N1, commands terminated by CR, replies by CRLF.
//! There is no echo: every command gets exactly one reply line, `OK` for
//! accepted actions. Queries end in `?`. While busy the head answers some
//! queries (`pa?`, `gmc?`) with `1` instead of a value.
//!
//! Two variants share the command set:
//!
//! - **standard** (04 series): power set in watts with `@cobasp`, measured
//!   with `pa?`
//! - **dpl06** (06-DPL): direct modulation; power is set through the
//!   modulation high current (`smc`) using [`CurrentModel`], and read back
//!   from `gmc?`. Supports a software trigger that leaves standby for one
//!   exposure.

use crate::current_model::CurrentModel;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use scope_core::capabilities::{
    validate_power_fraction, Device, LightSource, SoftwareTriggered, TriggerMode, TriggerType,
};
use scope_core::deferred::DeferredTask;
use scope_core::driver::{Capability, DeviceComponents, DriverFactory};
use scope_core::error::{DeviceError, DeviceResult};
use scope_core::exchange::{ExchangeSettings, Exchanger};
use scope_core::serial::{Connection, SerialSettings};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Placeholder the head returns for some queries while busy.
const BUSY: &[&str] = &["1"];

/// Low modulation current applied at start-up (mA).
const INITIAL_LOW_CURRENT_MA: f64 = 650.0;

// =============================================================================
// Configuration
// =============================================================================

/// Head family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoboltVariant {
    Standard,
    Dpl06,
}

/// Configuration for Cobolt lasers
#[derive(Debug, Clone, Deserialize)]
pub struct CoboltConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0")
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_variant")]
    pub variant: CoboltVariant,
    /// Power at fraction 1.0
    #[serde(default = "default_max_power_mw")]
    pub max_power_mw: f64,
    /// 06-DPL power while a software exposure runs
    #[serde(default = "default_active_power_mw")]
    pub active_power_mw: f64,
    /// 06-DPL power in standby
    #[serde(default = "default_standby_power_mw")]
    pub standby_power_mw: f64,
    /// Software trigger exposure in milliseconds
    #[serde(default = "default_exposure_ms")]
    pub exposure_ms: u64,
    /// 06-DPL tangent fit; defaults to the 561 nm head
    #[serde(default)]
    pub current_model: CurrentModel,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_timeout_ms() -> u64 {
    100
}

fn default_variant() -> CoboltVariant {
    CoboltVariant::Standard
}

fn default_max_power_mw() -> f64 {
    120.0
}

fn default_active_power_mw() -> f64 {
    100.0
}

fn default_standby_power_mw() -> f64 {
    0.12
}

fn default_exposure_ms() -> u64 {
    100
}

fn default_max_attempts() -> u32 {
    scope_core::exchange::DEFAULT_MAX_ATTEMPTS
}

impl CoboltConfig {
    /// Config for `port` with every option at its default.
    pub fn new(port: impl Into<String>, variant: CoboltVariant) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
            variant,
            max_power_mw: default_max_power_mw(),
            active_power_mw: default_active_power_mw(),
            standby_power_mw: default_standby_power_mw(),
            exposure_ms: default_exposure_ms(),
            current_model: CurrentModel::default(),
            max_attempts: default_max_attempts(),
        }
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(&self.port, self.baud_rate)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_terminator("\r")
    }

    fn check(&self) -> DeviceResult<()> {
        if !(self.max_power_mw.is_finite() && self.max_power_mw > 0.0) {
            return Err(DeviceError::Configuration(format!(
                "max_power_mw must be positive, got {}",
                self.max_power_mw
            )));
        }
        for (name, value) in [
            ("active_power_mw", self.active_power_mw),
            ("standby_power_mw", self.standby_power_mw),
        ] {
            if !(0.0..=self.max_power_mw).contains(&value) {
                return Err(DeviceError::Configuration(format!(
                    "{} = {} is outside 0..={}",
                    name, value, self.max_power_mw
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// CoboltFactory
// =============================================================================

/// Factory for Cobolt lasers.
pub struct CoboltFactory;

static COBOLT_CAPABILITIES: &[Capability] = &[Capability::LightSource, Capability::SoftwareTrigger];

impl DriverFactory for CoboltFactory {
    fn driver_type(&self) -> &'static str {
        "cobolt"
    }

    fn name(&self) -> &'static str {
        "Cobolt Laser"
    }

    fn capabilities(&self) -> &'static [Capability] {
        COBOLT_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: CoboltConfig = config.clone().try_into()?;
        cfg.check()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: CoboltConfig = config.try_into().context("Invalid Cobolt config")?;
            let laser = Arc::new(CoboltLaser::open(&cfg).await?);
            Ok(laser.components())
        })
    }
}

// =============================================================================
// CoboltLaser
// =============================================================================

struct Shared {
    name: String,
    exchanger: Exchanger,
    variant: CoboltVariant,
    model: CurrentModel,
    max_power_mw: f64,
    active_power_mw: f64,
    standby_power_mw: f64,
    setpoint: Mutex<f64>,
    exposure: Mutex<Duration>,
    standby: AtomicBool,
}

/// Cobolt laser on a serial line.
pub struct CoboltLaser {
    shared: Arc<Shared>,
    standby_timer: DeferredTask,
    serial_number: String,
}

impl CoboltLaser {
    /// Open the configured port and initialise.
    pub async fn open(config: &CoboltConfig) -> DeviceResult<Self> {
        config.check()?;
        let connection = Connection::open("cobolt", &config.serial_settings()).await?;
        Self::with_connection(connection, config).await
    }

    /// Initialise over an already open line.
    pub async fn with_connection(connection: Connection, config: &CoboltConfig) -> DeviceResult<Self> {
        config.check()?;
        let name = connection.name().to_string();
        let settings = ExchangeSettings::silent().with_max_attempts(config.max_attempts);
        let exchanger = Exchanger::new(connection, settings);

        let shared = Arc::new(Shared {
            name,
            exchanger,
            variant: config.variant,
            model: config.current_model,
            max_power_mw: config.max_power_mw,
            active_power_mw: config.active_power_mw,
            standby_power_mw: config.standby_power_mw,
            setpoint: Mutex::new(0.0),
            exposure: Mutex::new(Duration::from_millis(config.exposure_ms)),
            standby: AtomicBool::new(true),
        });

        let serial_number = shared.initialise().await.map_err(|e| {
            DeviceError::Initialization(format!("{}: {}", shared.name, e))
        })?;

        Ok(Self {
            shared,
            standby_timer: DeferredTask::new(),
            serial_number,
        })
    }

    /// Capability bag for the registry.
    pub fn components(self: &Arc<Self>) -> DeviceComponents {
        DeviceComponents {
            device: Some(self.clone()),
            light_source: Some(self.clone()),
            software_trigger: match self.shared.variant {
                CoboltVariant::Dpl06 => Some(self.clone() as Arc<dyn SoftwareTriggered>),
                CoboltVariant::Standard => None,
            },
            ..Default::default()
        }
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn variant(&self) -> CoboltVariant {
        self.shared.variant
    }

    /// Clear a latched fault and return the fresh status.
    #[instrument(skip(self), fields(device = %self.shared.name))]
    pub async fn clear_fault(&self) -> DeviceResult<Vec<String>> {
        let mut session = self.shared.exchanger.session().await;
        session.send("cf").await?;
        drop(session);
        self.shared.status_lines().await
    }

    /// Whether the 06-DPL is currently held at standby power.
    pub fn is_standby(&self) -> bool {
        self.shared.standby.load(Ordering::SeqCst)
    }

    /// Switch the 06-DPL between standby and active power.
    pub async fn set_standby(&self, standby: bool) -> DeviceResult<()> {
        self.shared.set_standby(standby).await
    }

    /// Modulation low current in mA (06-DPL); 0 when emission is off.
    pub async fn modulation_low_current(&self) -> DeviceResult<f64> {
        if !self.shared.is_on().await? {
            return Ok(0.0);
        }
        self.shared.exchanger.query_parsed("glth?").await
    }
}

impl Shared {
    /// Start-up sequence; returns the serial number.
    async fn initialise(&self) -> DeviceResult<String> {
        let mut session = self.exchanger.session().await;
        session.drain().await;
        let serial = session.query("sn?").await?;
        let ack = session.send("@cobas 0").await?;
        tracing::debug!(device = %self.name, ack = ?ack, "Autostart disabled");

        match self.variant {
            CoboltVariant::Standard => {
                session.send("@cobasdr 0").await?;
                session.send("@cob1").await?;
            }
            CoboltVariant::Dpl06 => {
                session.send("@cobasdr 1").await?;
                session
                    .send(&format!("slth {:.4}", INITIAL_LOW_CURRENT_MA))
                    .await?;
                let current = self.model.current_ma(0.0);
                session.send(&format!("smc {:.4}", current)).await?;
            }
        }
        drop(session);

        tracing::info!(
            device = %self.name,
            serial = %serial,
            variant = ?self.variant,
            max_power_mw = self.max_power_mw,
            "Cobolt laser initialised"
        );
        Ok(serial)
    }

    async fn is_on(&self) -> DeviceResult<bool> {
        Ok(self.exchanger.query("l?").await? == "1")
    }

    /// Write a power in mW using the variant's command.
    async fn apply_power_mw(&self, power_mw: f64) -> DeviceResult<()> {
        let command = match self.variant {
            CoboltVariant::Standard => format!("@cobasp {:.4}", power_mw / 1000.0),
            CoboltVariant::Dpl06 => format!("smc {:.4}", self.model.current_ma(power_mw)),
        };
        tracing::debug!(device = %self.name, power_mw, cmd = %command, "Setting power");
        let ack = self.exchanger.send(&command).await?;
        if let Some(reply) = ack.filter(|r| r != "OK") {
            tracing::warn!(device = %self.name, cmd = %command, reply = %reply, "Power command not acknowledged");
            return Err(DeviceError::Refused { command, reply });
        }
        Ok(())
    }

    async fn measured_power_mw(&self) -> DeviceResult<f64> {
        let mut session = self.exchanger.session().await;
        if session.query("l?").await? != "1" {
            return Ok(0.0);
        }
        match self.variant {
            CoboltVariant::Standard => {
                let watts: f64 = session.query_parsed_unless("pa?", BUSY).await?;
                Ok(watts * 1000.0)
            }
            CoboltVariant::Dpl06 => {
                let current: f64 = session.query_parsed_unless("gmc?", BUSY).await?;
                Ok(self.model.power_mw(current))
            }
        }
    }

    async fn status_lines(&self) -> DeviceResult<Vec<String>> {
        let mut session = self.exchanger.session().await;
        let mut lines = Vec::with_capacity(5);
        for (cmd, label) in [
            ("l?", "Emission on?"),
            ("p?", "Target power:"),
            ("pa?", "Measured power:"),
            ("f?", "Fault?"),
            ("hrs?", "Head operating hours:"),
        ] {
            let value = session.query(cmd).await?;
            lines.push(format!("{} {}", label, value));
        }
        Ok(lines)
    }

    async fn set_standby(&self, standby: bool) -> DeviceResult<()> {
        if self.variant != CoboltVariant::Dpl06 {
            return Err(DeviceError::Unsupported(
                "standby is only available on 06-DPL heads".to_string(),
            ));
        }
        let power = if standby {
            self.standby_power_mw
        } else {
            self.active_power_mw
        };
        self.apply_power_mw(power).await?;
        self.standby.store(standby, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl LightSource for CoboltLaser {
    #[instrument(skip(self), fields(device = %self.shared.name))]
    async fn set_power(&self, fraction: f64) -> Result<()> {
        let fraction = validate_power_fraction(fraction)?;
        *self.shared.setpoint.lock() = fraction;
        self.shared
            .apply_power_mw(fraction * self.shared.max_power_mw)
            .await
            .context("set power")
    }

    async fn power(&self) -> Result<f64> {
        let mw = self.shared.measured_power_mw().await?;
        Ok(mw / self.shared.max_power_mw)
    }

    fn power_setpoint(&self) -> f64 {
        *self.shared.setpoint.lock()
    }

    #[instrument(skip(self), fields(device = %self.shared.name))]
    async fn enable(&self) -> Result<bool> {
        let ack = self.shared.exchanger.send("l1").await?;
        tracing::info!(ack = ?ack, "Turning laser on");
        if self.shared.is_on().await? {
            return Ok(true);
        }
        let status = self.shared.status_lines().await?;
        tracing::error!(status = ?status, "Laser refused to turn on");
        Ok(false)
    }

    #[instrument(skip(self), fields(device = %self.shared.name))]
    async fn disable(&self) -> Result<bool> {
        let ack = self.shared.exchanger.send("l0").await?;
        tracing::info!(ack = ?ack, "Turning laser off");
        if !self.shared.is_on().await? {
            return Ok(true);
        }
        let status = self.shared.status_lines().await?;
        tracing::error!(status = ?status, "Laser refused to turn off");
        Ok(false)
    }

    async fn is_enabled(&self) -> Result<bool> {
        Ok(self.shared.is_on().await?)
    }

    async fn status(&self) -> Result<Vec<String>> {
        Ok(self.shared.status_lines().await?)
    }
}

#[async_trait]
impl SoftwareTriggered for CoboltLaser {
    fn trigger_type(&self) -> TriggerType {
        TriggerType::Software
    }

    fn trigger_mode(&self) -> TriggerMode {
        TriggerMode::Once
    }

    async fn set_trigger(&self, trigger_type: TriggerType, mode: TriggerMode) -> Result<()> {
        if trigger_type != TriggerType::Software || mode != TriggerMode::Once {
            return Err(DeviceError::Unsupported(format!(
                "Cobolt lasers only support software trigger once, not {:?}/{:?}",
                trigger_type, mode
            ))
            .into());
        }
        Ok(())
    }

    fn exposure(&self) -> Duration {
        *self.shared.exposure.lock()
    }

    fn set_exposure(&self, exposure: Duration) {
        *self.shared.exposure.lock() = exposure;
    }

    #[instrument(skip(self), fields(device = %self.shared.name))]
    async fn trigger(&self) -> Result<()> {
        self.shared.set_standby(false).await?;
        let shared = self.shared.clone();
        let exposure = self.exposure();
        self.standby_timer.schedule(exposure, async move {
            if let Err(e) = shared.set_standby(true).await {
                tracing::warn!(device = %shared.name, error = %e, "Return to standby failed");
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Device for CoboltLaser {
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn shutdown(&self) -> Result<()> {
        // A standby change already on the wire finishes before the timer goes.
        let mut session = self.shared.exchanger.session().await;
        self.standby_timer.cancel();
        session.send("l0").await?;
        session.send("@cob0").await?;
        session.drain().await;
        tracing::info!(device = %self.shared.name, "Cobolt laser shut down");
        Ok(())
    }
}
