//! PI E-754 digital piezo controller.
//!
//! The controller listens on TCP and takes GCS commands terminated by LF.
//! Queries name a controller axis and are answered as `<axis>=<value>`.
//! Set commands get no reply at all, so every one is followed by `ERR?`,
//! which returns and clears the last error code.
//!
//! | command             | meaning                         |
//! |---------------------|---------------------------------|
//! | `POS? <a>`          | current position                |
//! | `MOV <a> <p>`       | absolute move, closed loop      |
//! | `MVR <a> <d>`       | relative move, closed loop      |
//! | `SVA <a> <p>`       | absolute move, open loop        |
//! | `SVR <a> <d>`       | relative move, open loop        |
//! | `TMN? <a>`          | lower travel limit              |
//! | `TMX? <a>`          | upper travel limit              |
//! | `SVO <a> <0/1>`     | servo (closed loop) off / on    |
//! | `VEL <a> <v>`       | closed-loop velocity            |
//! | `ATZ <a>`           | start zero calibration          |
//! | `ERR?`              | last error code, then cleared   |
//!
//! Axes are configured by name, each mapped to a controller axis number.
//! Initialization closes the loop on every axis and reads its travel limits.
//!
//! # Usage
//!
//! ```rust,ignore
//! let config = toml::toml! {
//!     host = "192.168.0.20"
//!     axes = { z = 1 }
//! };
//! let components = PiStageFactory.build(config.into()).await?;
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use scope_core::capabilities::{AxisLimits, Device, Stage};
use scope_core::driver::{Capability, DeviceComponents, DriverFactory};
use scope_core::error::{DeviceError, DeviceResult};
use scope_core::exchange::{ExchangeSession, ExchangeSettings, Exchanger};
use scope_core::serial::{Connection, LineTransport};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::instrument;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Short description of a GCS controller error code.
pub fn controller_error_text(code: i32) -> &'static str {
    match code {
        0 => "No error",
        1 => "Parameter syntax error",
        2 => "Unknown command",
        3 => "Command length out of limits or command buffer overrun",
        5 => "Unallowable move attempted on unreferenced axis, or move attempted with servo off",
        7 => "Position out of limits",
        8 => "Velocity out of limits",
        10 => "Controller was stopped by command",
        15 => "Invalid axis identifier",
        17 => "Parameter out of range",
        _ => "Unknown controller error",
    }
}

/// Value of an `<axis>=<value>` reply, if it belongs to axis `id`.
fn axis_value(reply: &str, id: u32) -> Option<f64> {
    let (axis, value) = reply.split_once('=')?;
    if axis.trim().parse::<u32>().ok()? != id {
        return None;
    }
    value.trim().parse().ok()
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for an E-754 controller
#[derive(Debug, Clone, Deserialize)]
pub struct PiStageConfig {
    /// Controller host name or address
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-reply read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Axis name to controller axis number
    #[serde(default = "default_axes")]
    pub axes: BTreeMap<String, u32>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_port() -> u16 {
    50_000
}

fn default_timeout_ms() -> u64 {
    1_000
}

fn default_axes() -> BTreeMap<String, u32> {
    BTreeMap::from([("z".to_string(), 1)])
}

fn default_max_attempts() -> u32 {
    scope_core::exchange::DEFAULT_MAX_ATTEMPTS
}

impl PiStageConfig {
    /// Config for `host` with every option at its default.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            axes: default_axes(),
            max_attempts: default_max_attempts(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn check(&self) -> DeviceResult<()> {
        if self.axes.is_empty() {
            return Err(DeviceError::Configuration("no axes configured".to_string()));
        }
        let mut seen = HashSet::new();
        for (name, &id) in &self.axes {
            if id == 0 {
                return Err(DeviceError::Configuration(format!(
                    "axis '{}' is mapped to 0; controller axes start at 1",
                    name
                )));
            }
            if !seen.insert(id) {
                return Err(DeviceError::Configuration(format!(
                    "controller axis {} is mapped more than once",
                    id
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// PiStageFactory
// =============================================================================

/// Factory for E-754 stages.
pub struct PiStageFactory;

static STAGE_CAPABILITIES: &[Capability] = &[Capability::Stage];

impl DriverFactory for PiStageFactory {
    fn driver_type(&self) -> &'static str {
        "pi_e754"
    }

    fn name(&self) -> &'static str {
        "PI E-754 Piezo Stage"
    }

    fn capabilities(&self) -> &'static [Capability] {
        STAGE_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: PiStageConfig = config.clone().try_into()?;
        cfg.check()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: PiStageConfig = config.try_into().context("Invalid PI E-754 config")?;
            let stage = Arc::new(PiE754Stage::connect(&cfg).await?);

            Ok(DeviceComponents {
                device: Some(stage.clone()),
                stage: Some(stage),
                ..Default::default()
            })
        })
    }
}

// =============================================================================
// PiE754Stage
// =============================================================================

struct Axis {
    id: u32,
    limits: AxisLimits,
    /// Last confirmed servo state
    closed_loop: AtomicBool,
}

impl Axis {
    fn move_command(&self, relative: bool) -> &'static str {
        match (self.closed_loop.load(Ordering::Acquire), relative) {
            (true, false) => "MOV",
            (true, true) => "MVR",
            (false, false) => "SVA",
            (false, true) => "SVR",
        }
    }

    fn check_target(&self, name: &str, target: f64) -> DeviceResult<()> {
        if self.limits.contains(target) {
            return Ok(());
        }
        Err(DeviceError::InvalidParameter(format!(
            "{} is outside [{}, {}] on axis '{}'",
            target, self.limits.lower, self.limits.upper, name
        )))
    }
}

/// Piezo stage behind an E-754 controller.
pub struct PiE754Stage {
    name: String,
    exchanger: Exchanger,
    axes: BTreeMap<String, Axis>,
}

impl PiE754Stage {
    /// Connect to the configured controller and initialise.
    pub async fn connect(config: &PiStageConfig) -> DeviceResult<Self> {
        config.check()?;
        let address = config.address();
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| DeviceError::Initialization(format!("timed out connecting to {}", address)))?
            .map_err(|e| DeviceError::Initialization(format!("cannot connect to {}: {}", address, e)))?;
        stream.set_nodelay(true)?;
        tracing::info!(device = "pi_e754", address = %address, "Connected to controller");

        let transport =
            LineTransport::from_port(Box::new(stream), Duration::from_millis(config.timeout_ms), "\n");
        Self::with_connection(Connection::new("pi_e754", transport), config).await
    }

    /// Initialise over an already open line.
    ///
    /// Closes the loop on every configured axis and caches its travel limits.
    pub async fn with_connection(connection: Connection, config: &PiStageConfig) -> DeviceResult<Self> {
        config.check()?;
        let name = connection.name().to_string();
        let settings = ExchangeSettings::query_only().with_max_attempts(config.max_attempts);
        let exchanger = Exchanger::new(connection, settings);
        exchanger.drain().await;

        let mut axes = BTreeMap::new();
        {
            let mut session = exchanger.session().await;
            for (axis_name, &id) in &config.axes {
                let limits = init_axis(&mut session, id).await.map_err(|e| {
                    DeviceError::Initialization(format!("axis '{}' (controller axis {}): {}", axis_name, id, e))
                })?;
                tracing::debug!(
                    device = %name,
                    axis = %axis_name,
                    lower = limits.lower,
                    upper = limits.upper,
                    "Axis ready"
                );
                axes.insert(
                    axis_name.clone(),
                    Axis {
                        id,
                        limits,
                        closed_loop: AtomicBool::new(true),
                    },
                );
            }
        }

        tracing::info!(device = %name, axes = axes.len(), "Stage initialised");
        Ok(Self {
            name,
            exchanger,
            axes,
        })
    }

    fn axis(&self, name: &str) -> DeviceResult<&Axis> {
        self.axes
            .get(name)
            .ok_or_else(|| DeviceError::InvalidParameter(format!("unknown axis '{}'", name)))
    }

    /// Absolute move, checked against the travel limits before sending.
    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn move_axis_to(&self, axis: &str, position: f64) -> DeviceResult<()> {
        let state = self.axis(axis)?;
        state.check_target(axis, position)?;
        let command = format!("{} {} {}", state.move_command(false), state.id, position);
        let mut session = self.exchanger.session().await;
        set_checked(&mut session, &command).await
    }

    /// Relative move. The target is the position read now plus `delta`.
    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn move_axis_by(&self, axis: &str, delta: f64) -> DeviceResult<()> {
        let state = self.axis(axis)?;
        if !delta.is_finite() {
            return Err(DeviceError::InvalidParameter(format!("step {} is not finite", delta)));
        }
        let mut session = self.exchanger.session().await;
        let current = query_axis(&mut session, "POS?", state.id).await?;
        state.check_target(axis, current + delta)?;
        let command = format!("{} {} {}", state.move_command(true), state.id, delta);
        set_checked(&mut session, &command).await
    }

    pub async fn axis_position(&self, axis: &str) -> DeviceResult<f64> {
        let id = self.axis(axis)?.id;
        query_axis(&mut self.exchanger.session().await, "POS?", id).await
    }

    /// Closed-loop velocity.
    pub async fn velocity(&self, axis: &str) -> DeviceResult<f64> {
        let id = self.axis(axis)?.id;
        query_axis(&mut self.exchanger.session().await, "VEL?", id).await
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn set_velocity(&self, axis: &str, velocity: f64) -> DeviceResult<()> {
        let id = self.axis(axis)?.id;
        if !(velocity.is_finite() && velocity > 0.0) {
            return Err(DeviceError::InvalidParameter(format!(
                "velocity {} must be positive",
                velocity
            )));
        }
        let mut session = self.exchanger.session().await;
        set_checked(&mut session, &format!("VEL {} {}", id, velocity)).await
    }

    /// Servo state as reported by the controller.
    pub async fn closed_loop(&self, axis: &str) -> DeviceResult<bool> {
        let state = self.axis(axis)?;
        let on = query_axis(&mut self.exchanger.session().await, "SVO?", state.id).await? == 1.0;
        state.closed_loop.store(on, Ordering::Release);
        Ok(on)
    }

    /// Switch the servo. Later moves use `MOV`/`MVR` with the loop closed
    /// and `SVA`/`SVR` with it open.
    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn set_closed_loop(&self, axis: &str, on: bool) -> DeviceResult<()> {
        let state = self.axis(axis)?;
        let mut session = self.exchanger.session().await;
        set_checked(&mut session, &format!("SVO {} {}", state.id, u8::from(on))).await?;
        state.closed_loop.store(on, Ordering::Release);
        Ok(())
    }

    /// Start automatic zero-point calibration.
    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn start_zero_calibration(&self, axis: &str) -> DeviceResult<()> {
        let id = self.axis(axis)?.id;
        let mut session = self.exchanger.session().await;
        set_checked(&mut session, &format!("ATZ {}", id)).await
    }

    /// Whether zero-point calibration has completed.
    pub async fn zero_calibrated(&self, axis: &str) -> DeviceResult<bool> {
        let id = self.axis(axis)?.id;
        Ok(query_axis(&mut self.exchanger.session().await, "ATZ?", id).await? == 1.0)
    }
}

async fn init_axis(session: &mut ExchangeSession<'_>, id: u32) -> DeviceResult<AxisLimits> {
    set_checked(session, &format!("SVO {} 1", id)).await?;
    let lower = query_axis(session, "TMN?", id).await?;
    let upper = query_axis(session, "TMX?", id).await?;
    if lower >= upper {
        return Err(DeviceError::Initialization(format!(
            "travel limits [{}, {}] are empty",
            lower, upper
        )));
    }
    Ok(AxisLimits { lower, upper })
}

async fn query_axis(session: &mut ExchangeSession<'_>, query: &str, id: u32) -> DeviceResult<f64> {
    session
        .query_with(&format!("{} {}", query, id), |reply| axis_value(reply, id))
        .await
}

/// Send a set command and collect its error code.
async fn set_checked(session: &mut ExchangeSession<'_>, command: &str) -> DeviceResult<()> {
    session.send(command).await?;
    let code: i32 = session.query_parsed("ERR?").await?;
    if code == 0 {
        return Ok(());
    }
    let text = controller_error_text(code);
    tracing::error!(cmd = %command, code, error = text, "Controller error");
    Err(DeviceError::Refused {
        command: command.to_string(),
        reply: format!("error {}: {}", code, text),
    })
}

#[async_trait]
impl Stage for PiE754Stage {
    fn axes(&self) -> Vec<String> {
        self.axes.keys().cloned().collect()
    }

    async fn move_to(&self, axis: &str, position: f64) -> Result<()> {
        self.move_axis_to(axis, position)
            .await
            .with_context(|| format!("{}: move {} to {}", self.name, axis, position))
    }

    async fn move_by(&self, axis: &str, delta: f64) -> Result<()> {
        self.move_axis_by(axis, delta)
            .await
            .with_context(|| format!("{}: move {} by {}", self.name, axis, delta))
    }

    async fn position(&self, axis: &str) -> Result<f64> {
        Ok(self.axis_position(axis).await?)
    }

    async fn limits(&self, axis: &str) -> Result<AxisLimits> {
        Ok(self.axis(axis)?.limits)
    }
}

#[async_trait]
impl Device for PiE754Stage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) -> Result<()> {
        let mut line = self.exchanger.connection().lock().await;
        line.close().await?;
        tracing::info!(device = %self.name, "Stage connection closed");
        Ok(())
    }
}
