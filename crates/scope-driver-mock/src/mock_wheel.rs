//! Simulated filter wheels: an FW102C-style serial wheel and a stepper
//! controller for FW103M-style wheels.

use crate::port::{DeviceModel, SimulatedPort};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use scope_core::capabilities::Device;
use scope_core::driver::{Capability, DeviceComponents, DriverFactory};
use scope_driver_thorlabs::{
    FilterWheelConfig, StepperController, StepperFilterWheel, ThorlabsFilterWheel,
    ThorlabsFilterWheelFactory,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Fw102cModel
// =============================================================================

/// Serial wheel speaking the echoed `pcount?` / `pos?` / `pos=` protocol.
///
/// Echoes each command, answers queries on the next line and prints a
/// `> ` prompt. Errors end in LF. Positions are not range checked, so wheels
/// configured with arbitrary device units can be exercised.
#[derive(Debug, Clone)]
pub struct Fw102cModel {
    count: u32,
    position: u32,
}

impl Fw102cModel {
    pub fn new(count: u32) -> Self {
        Self { count, position: 1 }
    }

    /// Start at a given device position.
    pub fn at(mut self, position: u32) -> Self {
        self.position = position;
        self
    }
}

impl DeviceModel for Fw102cModel {
    fn respond(&mut self, command: &str) -> Vec<String> {
        let echo = format!("{}\r", command);
        let prompt = "> ".to_string();
        match command {
            "pcount?" => vec![echo, format!("{}\r", self.count), prompt],
            "pos?" => vec![echo, format!("{}\r", self.position), prompt],
            c if c.starts_with("pos=") => match c[4..].parse() {
                Ok(position) => {
                    self.position = position;
                    vec![echo, prompt]
                }
                Err(_) => vec![echo, "Command error CMD_ARG_INVALID\n".to_string(), prompt],
            },
            _ => vec![echo, "Command error CMD_NOT_DEFINED\n".to_string(), prompt],
        }
    }
}

/// Mock-only options read alongside the regular wheel config.
#[derive(Debug, Clone, Deserialize)]
struct MockWheelOptions {
    /// Position count the simulated wheel reports
    #[serde(default)]
    count: Option<u32>,
    /// Device position at start-up
    #[serde(default)]
    start_position: Option<u32>,
}

/// Insert a placeholder port so real driver configs parse without one.
pub(crate) fn with_simulated_port(config: toml::Value) -> toml::Value {
    match config {
        toml::Value::Table(mut table) => {
            table
                .entry("port")
                .or_insert_with(|| toml::Value::String("simulated".to_string()));
            toml::Value::Table(table)
        }
        other => other,
    }
}

/// Factory for a serial filter wheel on a simulated port.
pub struct MockFilterWheelFactory;

static MOCK_WHEEL_CAPABILITIES: &[Capability] = &[Capability::FilterWheel];

impl DriverFactory for MockFilterWheelFactory {
    fn driver_type(&self) -> &'static str {
        "mock_filter_wheel"
    }

    fn name(&self) -> &'static str {
        "Mock Serial Filter Wheel"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_WHEEL_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let config = with_simulated_port(config.clone());
        let _: MockWheelOptions = config.clone().try_into()?;
        ThorlabsFilterWheelFactory.validate(&config)
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let config = with_simulated_port(config);
            let options: MockWheelOptions = config.clone().try_into()?;
            let cfg: FilterWheelConfig = config.try_into()?;

            let count = match (options.count, &cfg.positions, cfg.expected_count()?) {
                (Some(count), _, _) => count,
                (None, Some(positions), _) => positions.len() as u32,
                (None, None, Some(expected)) => expected as u32,
                (None, None, None) => 6,
            };
            let mut model = Fw102cModel::new(count);
            if let Some(position) = options.start_position.or_else(|| cfg.positions.as_ref()?.first().copied()) {
                model = model.at(position);
            }

            let (connection, _log) = SimulatedPort::connection(
                "mock_filter_wheel",
                model,
                Duration::from_millis(cfg.timeout_ms),
            );
            let wheel = Arc::new(ThorlabsFilterWheel::with_connection(connection, &cfg).await?);
            Ok(DeviceComponents {
                device: Some(wheel.clone()),
                filter_wheel: Some(wheel),
                ..Default::default()
            })
        })
    }
}

// =============================================================================
// MockStepper
// =============================================================================

/// Stepper controller that turns instantly (or after `settle`).
#[derive(Debug, Default)]
pub struct MockStepper {
    angle: f64,
    connected: bool,
    homed: bool,
    settle: Duration,
    moves: Vec<f64>,
}

impl MockStepper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every move by `settle`.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Angles moved to so far.
    pub fn moves(&self) -> &[f64] {
        &self.moves
    }
}

#[async_trait]
impl StepperController for MockStepper {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn home(&mut self) -> Result<()> {
        if !self.connected {
            return Err(anyhow!("home before connect"));
        }
        self.angle = 0.0;
        self.homed = true;
        Ok(())
    }

    async fn move_to(&mut self, degrees: f64) -> Result<()> {
        if !self.homed {
            return Err(anyhow!("move before home"));
        }
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        self.angle = degrees.rem_euclid(360.0);
        self.moves.push(degrees);
        Ok(())
    }

    async fn position(&mut self) -> Result<f64> {
        if !self.connected {
            return Err(anyhow!("not connected"));
        }
        Ok(self.angle)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.homed = false;
        Ok(())
    }
}

/// Configuration for the mock stepper wheel
#[derive(Debug, Clone, Deserialize)]
pub struct MockStepperWheelConfig {
    /// Per-move settle time in milliseconds
    #[serde(default)]
    pub settle_ms: u64,
}

/// Factory for an FW103M-style wheel on a [`MockStepper`].
pub struct MockStepperWheelFactory;

impl DriverFactory for MockStepperWheelFactory {
    fn driver_type(&self) -> &'static str {
        "mock_stepper_wheel"
    }

    fn name(&self) -> &'static str {
        "Mock FW103M Stepper Filter Wheel"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_WHEEL_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let _: MockStepperWheelConfig = config.clone().try_into()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockStepperWheelConfig = config.try_into()?;
            let stepper = MockStepper::new().with_settle(Duration::from_millis(cfg.settle_ms));
            let wheel = Arc::new(StepperFilterWheel::fw103m("mock_stepper_wheel", stepper).await?);
            Ok(DeviceComponents {
                device: Some(wheel.clone() as Arc<dyn Device>),
                filter_wheel: Some(wheel),
                ..Default::default()
            })
        })
    }
}
