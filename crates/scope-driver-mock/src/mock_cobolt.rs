//! Simulated Cobolt laser head.

use crate::mock_wheel::with_simulated_port;
use crate::port::{DeviceModel, SimulatedPort};
use anyhow::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use scope_core::driver::{Capability, DeviceComponents, DriverFactory};
use scope_driver_cobolt::{CoboltConfig, CoboltFactory, CoboltLaser};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Observable state of a [`CoboltModel`].
#[derive(Debug, Clone, PartialEq)]
pub struct CoboltState {
    pub on: bool,
    pub autostart: bool,
    pub direct_control: bool,
    /// Set point from `@cobasp`, W
    pub power_w: f64,
    /// `smc`, mA
    pub modulation_current_ma: f64,
    /// `slth`, mA
    pub low_current_ma: f64,
    /// Queries still to be answered with the busy placeholder
    pub busy_replies: u32,
    /// `l1` is acknowledged but emission stays off
    pub refuse_enable: bool,
    /// `l0` is acknowledged but emission stays on
    pub refuse_disable: bool,
    /// `smc` is answered with an error and the current is kept
    pub refuse_current: bool,
}

impl Default for CoboltState {
    fn default() -> Self {
        Self {
            on: false,
            autostart: true,
            direct_control: false,
            power_w: 0.0,
            modulation_current_ma: 0.0,
            low_current_ma: 0.0,
            busy_replies: 0,
            refuse_enable: false,
            refuse_disable: false,
            refuse_current: false,
        }
    }
}

/// Handle for inspecting and steering a running [`CoboltModel`].
#[derive(Debug, Clone, Default)]
pub struct CoboltHandle(Arc<Mutex<CoboltState>>);

impl CoboltHandle {
    pub fn snapshot(&self) -> CoboltState {
        self.0.lock().clone()
    }

    /// Answer the next `n` measurement queries with `1`.
    pub fn inject_busy(&self, n: u32) {
        self.0.lock().busy_replies = n;
    }

    pub fn set_refuse_enable(&self, refuse: bool) {
        self.0.lock().refuse_enable = refuse;
    }

    pub fn set_refuse_disable(&self, refuse: bool) {
        self.0.lock().refuse_disable = refuse;
    }

    pub fn set_refuse_current(&self, refuse: bool) {
        self.0.lock().refuse_current = refuse;
    }
}

/// Cobolt head: no echo, one CRLF-terminated reply per command.
#[derive(Debug, Clone)]
pub struct CoboltModel {
    serial: String,
    state: CoboltHandle,
}

impl CoboltModel {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            state: CoboltHandle::default(),
        }
    }

    pub fn handle(&self) -> CoboltHandle {
        self.state.clone()
    }

    fn measurement(state: &mut CoboltState, value: f64) -> String {
        if state.busy_replies > 0 {
            state.busy_replies -= 1;
            return "1".to_string();
        }
        format!("{:.4}", value)
    }
}

impl DeviceModel for CoboltModel {
    fn respond(&mut self, command: &str) -> Vec<String> {
        let mut state = self.state.0.lock();
        let (name, arg) = match command.split_once(' ') {
            Some((name, arg)) => (name, arg.trim().parse::<f64>().ok()),
            None => (command, None),
        };
        let ok = "OK".to_string();
        let reply = match (name, arg) {
            ("sn?", _) => self.serial.clone(),
            ("l?", _) => String::from(if state.on { "1" } else { "0" }),
            ("l1", _) => {
                state.on = !state.refuse_enable;
                ok
            }
            ("l0", _) => {
                state.on = state.on && state.refuse_disable;
                ok
            }
            ("@cob0", _) => {
                state.on = false;
                ok
            }
            ("@cob1", _) => {
                state.on = !state.refuse_enable;
                ok
            }
            ("@cobas", Some(v)) => {
                state.autostart = v != 0.0;
                ok
            }
            ("@cobasdr", Some(v)) => {
                state.direct_control = v != 0.0;
                ok
            }
            ("@cobasp", Some(w)) => {
                state.power_w = w;
                ok
            }
            ("p?", _) => format!("{:.4}", state.power_w),
            ("pa?", _) => {
                let watts = if state.on { state.power_w } else { 0.0 };
                Self::measurement(&mut state, watts)
            }
            ("smc", Some(_)) if state.refuse_current => {
                "Error: value out of range".to_string()
            }
            ("smc", Some(ma)) => {
                state.modulation_current_ma = ma;
                ok
            }
            ("gmc?", _) => {
                let ma = state.modulation_current_ma;
                Self::measurement(&mut state, ma)
            }
            ("slth", Some(ma)) => {
                state.low_current_ma = ma;
                ok
            }
            ("glth?", _) => format!("{:.4}", state.low_current_ma),
            ("f?", _) => "0".to_string(),
            ("hrs?", _) => "1234.56".to_string(),
            ("cf", _) => ok,
            _ => "Syntax error: illegal command".to_string(),
        };
        vec![format!("{}\r\n", reply)]
    }
}

/// Mock-only options read alongside the regular Cobolt config.
#[derive(Debug, Clone, Deserialize)]
struct MockCoboltOptions {
    #[serde(default = "default_serial")]
    serial_number: String,
}

fn default_serial() -> String {
    "MOCK-COBOLT-0001".to_string()
}

/// Factory for a Cobolt laser on a simulated port.
pub struct MockCoboltFactory;

static MOCK_COBOLT_CAPABILITIES: &[Capability] = &[Capability::LightSource, Capability::SoftwareTrigger];

impl DriverFactory for MockCoboltFactory {
    fn driver_type(&self) -> &'static str {
        "mock_cobolt"
    }

    fn name(&self) -> &'static str {
        "Mock Cobolt Laser"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_COBOLT_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let config = with_simulated_port(config.clone());
        let _: MockCoboltOptions = config.clone().try_into()?;
        CoboltFactory.validate(&config)
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let config = with_simulated_port(config);
            let options: MockCoboltOptions = config.clone().try_into()?;
            let cfg: CoboltConfig = config.try_into()?;

            let (connection, _log) = SimulatedPort::connection(
                "mock_cobolt",
                CoboltModel::new(options.serial_number),
                Duration::from_millis(cfg.timeout_ms),
            );
            let laser = Arc::new(CoboltLaser::with_connection(connection, &cfg).await?);
            Ok(laser.components())
        })
    }
}
