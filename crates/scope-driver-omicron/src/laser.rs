//! Omicron LuxX / Deepstar lasers.
//!
//! Protocol: 500000 baud, 8N1, see [`crate::protocol`] for framing. During
//! initialisation the laser is switched to ad-hoc mode, after which it
//! pushes status and power frames that land in [`AdhocState`].
//!
//! Standby is expressed through the operating mode rather than the emission
//! state: with a software trigger the bias and operating level releases are
//! dropped, with a hardware trigger APC is dropped.

use crate::protocol::{AdhocState, OmicronLink, Reply};
use crate::registers::{LatchedFailure, OperationMode, Status};
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
use scope_core::serial::{Connection, SerialSettings};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Full scale of the `SLP` / `GLP` power level.
pub const LEVEL_FULL_SCALE: u16 = 0xFFF;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for Omicron lasers
#[derive(Debug, Clone, Deserialize)]
pub struct OmicronConfig {
    /// Serial port path (e.g., "/dev/ttyACM0")
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Software trigger exposure in milliseconds
    #[serde(default = "default_exposure_ms")]
    pub exposure_ms: u64,
    #[serde(default = "default_trigger_type")]
    pub trigger_type: TriggerType,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// How long `reset` waits for the device to come back
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    500_000
}

fn default_timeout_ms() -> u64 {
    100
}

fn default_exposure_ms() -> u64 {
    100
}

fn default_trigger_type() -> TriggerType {
    TriggerType::Software
}

fn default_max_attempts() -> u32 {
    scope_core::exchange::DEFAULT_MAX_ATTEMPTS
}

fn default_reset_timeout_ms() -> u64 {
    10_000
}

impl OmicronConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
            exposure_ms: default_exposure_ms(),
            trigger_type: default_trigger_type(),
            max_attempts: default_max_attempts(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(&self.port, self.baud_rate)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_terminator("\r")
    }

    fn check(&self) -> DeviceResult<()> {
        if self.timeout_ms == 0 {
            return Err(DeviceError::Configuration(
                "timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(DeviceError::Configuration(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// OmicronFactory
// =============================================================================

/// Factory for Omicron lasers.
pub struct OmicronFactory;

static OMICRON_CAPABILITIES: &[Capability] = &[Capability::LightSource, Capability::SoftwareTrigger];

impl DriverFactory for OmicronFactory {
    fn driver_type(&self) -> &'static str {
        "omicron"
    }

    fn name(&self) -> &'static str {
        "Omicron LuxX/Deepstar Laser"
    }

    fn capabilities(&self) -> &'static [Capability] {
        OMICRON_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: OmicronConfig = config.clone().try_into()?;
        cfg.check()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: OmicronConfig = config.try_into().context("Invalid Omicron config")?;
            let laser = Arc::new(OmicronLaser::open(&cfg).await?);
            Ok(laser.components())
        })
    }
}

// =============================================================================
// Operating mode rules
// =============================================================================

/// Mode written at start-up, derived from the mode the device reports.
pub fn initial_mode(current: OperationMode) -> OperationMode {
    let mut mode = current;
    mode.insert(OperationMode::AUTO_POWERUP | OperationMode::USB_ADHOC_MODE | OperationMode::APC_MODE);
    mode.remove(
        OperationMode::AUTO_STARTUP
            | OperationMode::ANALOG_INPUT_RELEASE
            | OperationMode::BIAS_LEVEL_RELEASE
            | OperationMode::OPERATING_LEVEL_RELEASE,
    );
    mode
}

/// Mode for a trigger type and standby state.
pub fn trigger_mode_bits(current: OperationMode, trigger: TriggerType, standby: bool) -> OperationMode {
    let releases = OperationMode::BIAS_LEVEL_RELEASE | OperationMode::OPERATING_LEVEL_RELEASE;
    let mut mode = current;
    match trigger {
        TriggerType::Software => {
            mode.insert(OperationMode::APC_MODE);
            mode.set(releases, !standby);
        }
        TriggerType::Hardware => {
            // APC lets light out as soon as the external trigger fires
            mode.insert(releases);
            mode.set(OperationMode::APC_MODE, !standby);
        }
    }
    mode
}

/// Level code for a power fraction.
pub fn level_for(fraction: f64) -> u16 {
    (fraction * f64::from(LEVEL_FULL_SCALE)).floor() as u16
}

// =============================================================================
// OmicronLaser
// =============================================================================

/// Identification read during initialisation.
#[derive(Debug, Clone, PartialEq)]
pub struct OmicronInfo {
    pub model_code: String,
    pub device_id: String,
    pub firmware: String,
    pub serial_number: String,
    pub wavelength_nm: f64,
    pub max_power_mw: f64,
}

struct Shared {
    name: String,
    link: OmicronLink,
    info: OmicronInfo,
    setpoint: Mutex<f64>,
    exposure: Mutex<Duration>,
    trigger_type: Mutex<TriggerType>,
    standby: AtomicBool,
    on: AtomicBool,
}

/// Omicron laser on a serial line.
pub struct OmicronLaser {
    shared: Arc<Shared>,
    standby_timer: DeferredTask,
    reset_timeout: Duration,
}

impl OmicronLaser {
    /// Open the configured port and initialise.
    pub async fn open(config: &OmicronConfig) -> DeviceResult<Self> {
        config.check()?;
        let connection = Connection::open("omicron", &config.serial_settings()).await?;
        Self::with_connection(connection, config).await
    }

    /// Initialise over an already open line.
    pub async fn with_connection(connection: Connection, config: &OmicronConfig) -> DeviceResult<Self> {
        config.check()?;
        let name = connection.name().to_string();
        let link = OmicronLink::new(connection, config.max_attempts);

        let info = initialise(&link)
            .await
            .map_err(|e| DeviceError::Initialization(format!("{}: {}", name, e)))?;

        tracing::info!(
            device = %name,
            model = %info.model_code,
            id = %info.device_id,
            firmware = %info.firmware,
            serial = %info.serial_number,
            wavelength_nm = info.wavelength_nm,
            max_power_mw = info.max_power_mw,
            "Omicron laser initialised"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                name,
                link,
                info,
                setpoint: Mutex::new(0.0),
                exposure: Mutex::new(Duration::from_millis(config.exposure_ms)),
                trigger_type: Mutex::new(config.trigger_type),
                standby: AtomicBool::new(true),
                on: AtomicBool::new(false),
            }),
            standby_timer: DeferredTask::new(),
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
        })
    }

    /// Capability bag for the registry.
    pub fn components(self: &Arc<Self>) -> DeviceComponents {
        DeviceComponents {
            device: Some(self.clone()),
            light_source: Some(self.clone()),
            software_trigger: Some(self.clone()),
            ..Default::default()
        }
    }

    pub fn info(&self) -> &OmicronInfo {
        &self.shared.info
    }

    /// State pushed by ad-hoc frames and refreshed by reads.
    pub fn cached_state(&self) -> AdhocState {
        self.shared.link.state()
    }

    /// Actual status (`GAS`).
    pub async fn status_register(&self) -> DeviceResult<Status> {
        self.shared.status_register().await
    }

    /// Latched failures (`GLF`).
    pub async fn latched_failure(&self) -> DeviceResult<LatchedFailure> {
        self.shared.latched_failure().await
    }

    /// Operating mode (`GOM`).
    pub async fn operation_mode(&self) -> DeviceResult<OperationMode> {
        let reply = self.shared.link.ask("GOM").await?;
        let mode = OperationMode::from_hex(reply.first())?;
        self.shared.link.update_state(|s| s.operation_mode = Some(mode));
        Ok(mode)
    }

    /// Write an operating mode (`SOM`); true if accepted.
    pub async fn set_operation_mode(&self, mode: OperationMode) -> DeviceResult<bool> {
        let reply = self.shared.link.set("SOM", &mode.to_hex()).await?;
        Ok(reply.is_ack())
    }

    /// Raw power level (`GLP`), 0..=0xFFF.
    pub async fn level(&self) -> DeviceResult<u16> {
        let reply = self.shared.link.ask("GLP").await?;
        u16::from_str_radix(reply.first().trim(), 16)
            .map_err(|_| DeviceError::decode("power level", reply.first()))
    }

    /// Measured diode power in mW (`MDP`).
    pub async fn diode_power_mw(&self) -> DeviceResult<f64> {
        self.shared.diode_power_mw().await
    }

    #[instrument(skip(self), fields(device = %self.shared.name))]
    pub async fn power_on(&self) -> DeviceResult<bool> {
        let ok = self.shared.link.ask("POn").await?.is_ack();
        tracing::info!(accepted = ok, "Power on");
        Ok(ok)
    }

    #[instrument(skip(self), fields(device = %self.shared.name))]
    pub async fn power_off(&self) -> DeviceResult<bool> {
        let ok = self.shared.link.ask("POf").await?.is_ack();
        tracing::info!(accepted = ok, "Power off");
        Ok(ok)
    }

    /// Reset the controller; clears latched failures.
    #[instrument(skip(self), fields(device = %self.shared.name))]
    pub async fn reset(&self) -> DeviceResult<()> {
        self.shared.link.session().await.reset(self.reset_timeout).await?;
        self.shared.on.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_standby(&self) -> bool {
        self.shared.standby.load(Ordering::SeqCst)
    }

    pub async fn set_standby(&self, standby: bool) -> DeviceResult<()> {
        self.shared.set_standby(standby).await
    }
}

/// Start-up sequence under one lock.
async fn initialise(link: &OmicronLink) -> DeviceResult<OmicronInfo> {
    let mut session = link.session().await;
    session.drain().await;
    session.ask("LOf").await?;

    let firmware = session.ask("GFw").await?;
    let serial = session.ask("GSN").await?;
    let specs = session.ask("GSI").await?;
    let max_power = session.ask("GMP").await?;

    let info = OmicronInfo {
        model_code: firmware.field(0, "model code")?.to_string(),
        device_id: firmware.field(1, "device id")?.to_string(),
        firmware: firmware.field(2, "firmware version")?.to_string(),
        serial_number: serial.first().to_string(),
        wavelength_nm: parse_field(&specs, "wavelength")?,
        max_power_mw: max_power.first_f64("maximum power")?,
    };
    if !(info.max_power_mw.is_finite() && info.max_power_mw > 0.0) {
        return Err(DeviceError::decode("maximum power", max_power.first()));
    }

    let current = OperationMode::from_hex(session.ask("GOM").await?.first())?;
    let mode = initial_mode(current);
    let ack = session.set("SOM", &mode.to_hex()).await?;
    if !ack.is_ack() {
        tracing::warn!(device = link.name(), mode = %mode, reply = ?ack.fields, "Operating mode refused");
    }

    let power = session.ask("MDP").await?.first_f64("diode power")?;
    drop(session);

    link.update_state(|s| {
        s.operation_mode = Some(mode);
        s.diode_power_mw = Some(power);
    });
    Ok(info)
}

fn parse_field(reply: &Reply, what: &'static str) -> DeviceResult<f64> {
    let raw = reply.first().trim();
    raw.parse().map_err(|_| DeviceError::decode(what, raw))
}

impl Shared {
    async fn status_register(&self) -> DeviceResult<Status> {
        let reply = self.link.ask("GAS").await?;
        let status = Status::from_hex(reply.first())?;
        self.link.update_state(|s| s.status = Some(status));
        Ok(status)
    }

    async fn latched_failure(&self) -> DeviceResult<LatchedFailure> {
        let reply = self.link.ask("GLF").await?;
        LatchedFailure::from_hex(reply.first())
    }

    async fn diode_power_mw(&self) -> DeviceResult<f64> {
        let power = self.link.ask("MDP").await?.first_f64("diode power")?;
        self.link.update_state(|s| s.diode_power_mw = Some(power));
        Ok(power)
    }

    async fn write_level(&self, fraction: f64) -> DeviceResult<bool> {
        let level = level_for(fraction);
        let reply = self.link.set("SLP", &format!("{:x}", level)).await?;
        if !reply.is_ack() {
            tracing::warn!(device = %self.name, level, reply = ?reply.fields, "Power level refused");
        }
        Ok(reply.is_ack())
    }

    /// Read the mode, apply the trigger/standby rule, write it back. A refused
    /// `SOM` is an error and leaves the cached mode alone.
    async fn update_mode(&self, trigger: TriggerType, standby: bool) -> DeviceResult<()> {
        let mut session = self.link.session().await;
        let current = OperationMode::from_hex(session.ask("GOM").await?.first())?;
        let mode = trigger_mode_bits(current, trigger, standby);
        let ack = session.set("SOM", &mode.to_hex()).await?;
        drop(session);

        if !ack.is_ack() {
            tracing::warn!(device = %self.name, mode = %mode, reply = ?ack.fields, "Operating mode refused");
            return Err(DeviceError::Refused {
                command: format!("SOM{}", mode.to_hex()),
                reply: ack.fields.join("|"),
            });
        }
        self.link.update_state(|s| s.operation_mode = Some(mode));
        tracing::debug!(device = %self.name, mode = %mode, standby, "Operating mode updated");
        Ok(())
    }

    async fn set_standby(&self, standby: bool) -> DeviceResult<()> {
        let trigger = *self.trigger_type.lock();
        self.update_mode(trigger, standby).await?;
        self.standby.store(standby, Ordering::SeqCst);
        Ok(())
    }

    async fn status_lines(&self) -> DeviceResult<Vec<String>> {
        let status = self.status_register().await?;
        let failure = self.latched_failure().await?;
        let mode = OperationMode::from_hex(self.link.ask("GOM").await?.first())?;
        let power = self.diode_power_mw().await?;
        Ok(vec![
            format!("Status: {}", status),
            format!("Latched failure: {}", failure),
            format!("Operation mode: {}", mode),
            format!("Diode power: {} mW", power),
        ])
    }
}

#[async_trait]
impl LightSource for OmicronLaser {
    #[instrument(skip(self), fields(device = %self.shared.name))]
    async fn set_power(&self, fraction: f64) -> Result<()> {
        let fraction = validate_power_fraction(fraction)?;
        *self.shared.setpoint.lock() = fraction;
        tracing::info!("Setting laser power to {}%", fraction * 100.0);
        if self.shared.on.load(Ordering::SeqCst) {
            self.shared.write_level(fraction).await.context("set power")?;
        }
        Ok(())
    }

    async fn power(&self) -> Result<f64> {
        let mw = self.shared.diode_power_mw().await?;
        Ok(mw / self.shared.info.max_power_mw)
    }

    fn power_setpoint(&self) -> f64 {
        *self.shared.setpoint.lock()
    }

    #[instrument(skip(self), fields(device = %self.shared.name))]
    async fn enable(&self) -> Result<bool> {
        let on = self.shared.link.ask("LOn").await?.is_ack();
        self.shared.on.store(on, Ordering::SeqCst);
        if !on {
            let status = self.shared.status_register().await?;
            let failure = self.shared.latched_failure().await?;
            tracing::error!(status = %status, failure = %failure, "Laser refused to turn on");
            return Ok(false);
        }
        tracing::info!("Laser on");
        let setpoint = *self.shared.setpoint.lock();
        self.shared.write_level(setpoint).await?;
        Ok(true)
    }

    #[instrument(skip(self), fields(device = %self.shared.name))]
    async fn disable(&self) -> Result<bool> {
        let off = self.shared.link.ask("LOf").await?.is_ack();
        if !off {
            let status = self.shared.status_register().await?;
            tracing::error!(status = %status, "Laser refused to turn off");
            self.shared
                .on
                .store(status.contains(Status::ON), Ordering::SeqCst);
            return Ok(false);
        }
        self.shared.on.store(false, Ordering::SeqCst);
        tracing::info!("Laser off");
        Ok(true)
    }

    async fn is_enabled(&self) -> Result<bool> {
        Ok(self.shared.on.load(Ordering::SeqCst))
    }

    async fn status(&self) -> Result<Vec<String>> {
        Ok(self.shared.status_lines().await?)
    }
}

#[async_trait]
impl SoftwareTriggered for OmicronLaser {
    fn trigger_type(&self) -> TriggerType {
        *self.shared.trigger_type.lock()
    }

    fn trigger_mode(&self) -> TriggerMode {
        TriggerMode::Once
    }

    async fn set_trigger(&self, trigger_type: TriggerType, mode: TriggerMode) -> Result<()> {
        if mode != TriggerMode::Once {
            return Err(DeviceError::Unsupported(format!(
                "the only trigger mode supported is once, not {:?}",
                mode
            ))
            .into());
        }
        let standby = self.shared.standby.load(Ordering::SeqCst);
        self.shared.update_mode(trigger_type, standby).await?;
        *self.shared.trigger_type.lock() = trigger_type;
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
        if self.trigger_type() != TriggerType::Software {
            tracing::debug!("Hardware trigger selected, nothing to do");
            return Ok(());
        }
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
impl Device for OmicronLaser {
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn shutdown(&self) -> Result<()> {
        // A mode change already on the wire finishes before the timer goes.
        let mut session = self.shared.link.session().await;
        self.standby_timer.cancel();
        let off = session.ask("LOf").await?.is_ack();
        session.drain().await;
        drop(session);
        self.shared.on.store(false, Ordering::SeqCst);
        tracing::info!(device = %self.shared.name, accepted = off, "Omicron laser shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_driver_type() {
        let factory = OmicronFactory;
        assert_eq!(factory.driver_type(), "omicron");
        assert!(factory.capabilities().contains(&Capability::SoftwareTrigger));
    }

    #[test]
    fn test_config_defaults() {
        let cfg: OmicronConfig = toml::Value::Table(toml::toml! { port = "/dev/ttyACM0" })
            .try_into()
            .unwrap();
        assert_eq!(cfg.baud_rate, 500_000);
        assert_eq!(cfg.trigger_type, TriggerType::Software);
        assert_eq!(cfg.max_attempts, 3);
    }

    #[test]
    fn test_factory_validate_config() {
        let factory = OmicronFactory;
        let hardware = toml::Value::Table(toml::toml! {
            port = "/dev/ttyACM0"
            trigger_type = "hardware"
        });
        assert!(factory.validate(&hardware).is_ok());

        let zero_attempts = toml::Value::Table(toml::toml! {
            port = "/dev/ttyACM0"
            max_attempts = 0
        });
        assert!(factory.validate(&zero_attempts).is_err());
    }

    #[test]
    fn test_initial_mode() {
        let reported = OperationMode::AUTO_STARTUP
            | OperationMode::BIAS_LEVEL_RELEASE
            | OperationMode::ANALOG_INPUT_RELEASE
            | OperationMode::DIGITAL_INPUT_IMPEDANCE;
        let mode = initial_mode(reported);
        assert_eq!(
            mode,
            OperationMode::AUTO_POWERUP
                | OperationMode::USB_ADHOC_MODE
                | OperationMode::APC_MODE
                | OperationMode::DIGITAL_INPUT_IMPEDANCE
        );
        assert_eq!(initial_mode(OperationMode::empty()).to_hex(), "a100");
    }

    #[test]
    fn test_software_trigger_mode_bits() {
        let base = initial_mode(OperationMode::empty());
        let active = trigger_mode_bits(base, TriggerType::Software, false);
        assert!(active.contains(OperationMode::BIAS_LEVEL_RELEASE | OperationMode::OPERATING_LEVEL_RELEASE));
        assert!(active.contains(OperationMode::APC_MODE));

        let standby = trigger_mode_bits(active, TriggerType::Software, true);
        assert!(!standby.intersects(OperationMode::BIAS_LEVEL_RELEASE | OperationMode::OPERATING_LEVEL_RELEASE));
        assert_eq!(standby, base);
    }

    #[test]
    fn test_hardware_trigger_mode_bits() {
        let base = initial_mode(OperationMode::empty());
        let standby = trigger_mode_bits(base, TriggerType::Hardware, true);
        assert!(standby.contains(OperationMode::BIAS_LEVEL_RELEASE | OperationMode::OPERATING_LEVEL_RELEASE));
        assert!(!standby.contains(OperationMode::APC_MODE));

        let armed = trigger_mode_bits(standby, TriggerType::Hardware, false);
        assert!(armed.contains(OperationMode::APC_MODE));
    }

    #[test]
    fn test_level_for() {
        assert_eq!(level_for(0.0), 0);
        assert_eq!(level_for(1.0), 0xFFF);
        assert_eq!(level_for(0.5), 0x7FF);
    }
}
