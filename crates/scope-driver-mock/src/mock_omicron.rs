//! Simulated Omicron LuxX laser with ad-hoc frame injection.

use crate::mock_wheel::with_simulated_port;
use crate::port::{DeviceModel, SimulatedPort};
use crate::rng::MockRng;
use anyhow::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use scope_core::driver::{Capability, DeviceComponents, DriverFactory};
use scope_driver_omicron::{
    LatchedFailure, OmicronConfig, OmicronFactory, OmicronLaser, OperationMode, Status,
    LEVEL_FULL_SCALE,
};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Observable state of an [`OmicronModel`].
#[derive(Debug, Clone, PartialEq)]
pub struct OmicronState {
    pub on: bool,
    pub powered: bool,
    pub level: u16,
    pub mode: OperationMode,
    pub failure: LatchedFailure,
    pub max_power_mw: f64,
    /// `LOn` is answered with `x` and emission stays off
    pub refuse_on: bool,
    /// `LOf` is answered with `x` and emission stays on
    pub refuse_off: bool,
    /// `SOM` is answered with `x` and the mode is kept
    pub refuse_mode: bool,
    /// Frames written before the next reply
    pub queued: VecDeque<String>,
}

impl OmicronState {
    fn status(&self) -> Status {
        let mut status = Status::KEY_SWITCH | Status::ENABLED_PIN;
        status.set(Status::ON, self.on);
        status.set(Status::SYSTEM_POWER, self.powered);
        status.set(Status::ERROR, !self.failure.is_empty());
        status
    }

    fn diode_power_mw(&self) -> f64 {
        if self.on {
            f64::from(self.level) / f64::from(LEVEL_FULL_SCALE) * self.max_power_mw
        } else {
            0.0
        }
    }
}

/// Handle for inspecting and steering a running [`OmicronModel`].
#[derive(Debug, Clone)]
pub struct OmicronHandle(Arc<Mutex<OmicronState>>);

impl OmicronHandle {
    pub fn snapshot(&self) -> OmicronState {
        self.0.lock().clone()
    }

    /// Push a raw frame (without terminator) ahead of the next reply.
    pub fn queue_frame(&self, frame: impl Into<String>) {
        self.0.lock().queued.push_back(frame.into());
    }

    pub fn set_refuse_on(&self, refuse: bool) {
        self.0.lock().refuse_on = refuse;
    }

    pub fn set_refuse_off(&self, refuse: bool) {
        self.0.lock().refuse_off = refuse;
    }

    pub fn set_refuse_mode(&self, refuse: bool) {
        self.0.lock().refuse_mode = refuse;
    }

    pub fn set_failure(&self, failure: LatchedFailure) {
        self.0.lock().failure = failure;
    }
}

/// LuxX controller: `?CMD<payload>|` in, `!CMD<fields>` out, CR terminated.
///
/// Once ad-hoc mode is enabled through `SOM`, each reply may be preceded by
/// randomly chosen `$GAS` / `$MDP` / `$TPP` frames.
#[derive(Debug)]
pub struct OmicronModel {
    state: OmicronHandle,
    rng: MockRng,
    adhoc_rate: f64,
}

impl OmicronModel {
    /// Laser with `max_power_mw` full scale, reporting a factory-default mode.
    pub fn new(max_power_mw: f64) -> Self {
        let state = OmicronState {
            on: false,
            powered: true,
            level: 0,
            mode: OperationMode::AUTO_STARTUP
                | OperationMode::AUTO_POWERUP
                | OperationMode::BIAS_LEVEL_RELEASE
                | OperationMode::OPERATING_LEVEL_RELEASE
                | OperationMode::ANALOG_INPUT_RELEASE,
            failure: LatchedFailure::empty(),
            max_power_mw,
            refuse_on: false,
            refuse_off: false,
            refuse_mode: false,
            queued: VecDeque::new(),
        };
        Self {
            state: OmicronHandle(Arc::new(Mutex::new(state))),
            rng: MockRng::new(None),
            adhoc_rate: 0.0,
        }
    }

    /// Inject random ad-hoc frames with probability `rate` per reply slot.
    pub fn with_adhoc(mut self, rate: f64, seed: Option<u64>) -> Self {
        self.adhoc_rate = rate;
        self.rng = MockRng::new(seed);
        self
    }

    pub fn handle(&self) -> OmicronHandle {
        self.state.clone()
    }

    fn random_frames(&self, state: &OmicronState, out: &mut Vec<String>) {
        if !state.mode.contains(OperationMode::USB_ADHOC_MODE) {
            return;
        }
        while self.rng.chance(self.adhoc_rate) && out.len() < 8 {
            let frame = match self.rng.below(3) {
                0 => format!("$GAS{:04X}\r", state.status().bits()),
                1 => format!("$MDP{:.3}\r", state.diode_power_mw()),
                _ => format!("$TPP{:.3}\r", state.diode_power_mw()),
            };
            out.push(frame);
        }
    }
}

impl DeviceModel for OmicronModel {
    fn respond(&mut self, line: &str) -> Vec<String> {
        let mut state = self.state.0.lock();
        let body = line.trim_start_matches('?').trim_end_matches('|');
        let cmd = body.get(..3).unwrap_or(body);
        let payload = body.get(3..).unwrap_or("");

        let mut out: Vec<String> = state.queued.drain(..).map(|f| format!("{}\r", f)).collect();
        self.random_frames(&state, &mut out);

        let ack = |ok: bool| String::from(if ok { ">" } else { "x" });
        let reply = match cmd {
            "LOf" => {
                state.on = state.on && state.refuse_off;
                ack(!state.refuse_off)
            }
            "LOn" => {
                state.on = !state.refuse_on && state.failure.is_empty();
                ack(state.on)
            }
            "POn" => {
                state.powered = true;
                ack(true)
            }
            "POf" => {
                state.powered = false;
                state.on = false;
                ack(true)
            }
            "GFw" => "LuxX|488-100|3.1.7".to_string(),
            "GSN" => "OM-MOCK-0042".to_string(),
            "GSI" => format!("488|{}", state.max_power_mw),
            "GMP" => format!("{}", state.max_power_mw),
            "GOM" => format!("{:04X}", state.mode.bits()),
            "SOM" => match OperationMode::from_hex(payload) {
                Ok(_) if state.refuse_mode => ack(false),
                Ok(mode) => {
                    state.mode = mode;
                    ack(true)
                }
                Err(_) => ack(false),
            },
            "GAS" => format!("{:04X}", state.status().bits()),
            "GLF" => format!("{:04X}", state.failure.bits()),
            "MDP" => format!("{:.3}", state.diode_power_mw()),
            "SLP" => match u16::from_str_radix(payload, 16) {
                Ok(level) if level <= LEVEL_FULL_SCALE => {
                    state.level = level;
                    ack(true)
                }
                _ => ack(false),
            },
            "GLP" => format!("{:03X}", state.level),
            "RsC" => {
                state.failure = LatchedFailure::empty();
                state.on = false;
                out.push("!RsC\r".to_string());
                out.push("\0$RsC>\r".to_string());
                return out;
            }
            _ => ack(false),
        };
        out.push(format!("!{}{}\r", cmd, reply));
        out
    }
}

/// Mock-only options read alongside the regular Omicron config.
#[derive(Debug, Clone, Deserialize)]
struct MockOmicronOptions {
    #[serde(default = "default_max_power_mw")]
    max_power_mw: f64,
    /// Probability of an ad-hoc frame per reply slot
    #[serde(default)]
    adhoc_rate: f64,
    #[serde(default)]
    seed: Option<u64>,
}

fn default_max_power_mw() -> f64 {
    100.0
}

/// Factory for an Omicron laser on a simulated port.
pub struct MockOmicronFactory;

static MOCK_OMICRON_CAPABILITIES: &[Capability] = &[Capability::LightSource, Capability::SoftwareTrigger];

impl DriverFactory for MockOmicronFactory {
    fn driver_type(&self) -> &'static str {
        "mock_omicron"
    }

    fn name(&self) -> &'static str {
        "Mock Omicron LuxX Laser"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_OMICRON_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let config = with_simulated_port(config.clone());
        let options: MockOmicronOptions = config.clone().try_into()?;
        if !(0.0..1.0).contains(&options.adhoc_rate) {
            anyhow::bail!("adhoc_rate must be in [0, 1), got {}", options.adhoc_rate);
        }
        OmicronFactory.validate(&config)
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let config = with_simulated_port(config);
            let options: MockOmicronOptions = config.clone().try_into()?;
            let cfg: OmicronConfig = config.try_into()?;

            let model = OmicronModel::new(options.max_power_mw).with_adhoc(options.adhoc_rate, options.seed);
            let (connection, _log) = SimulatedPort::connection(
                "mock_omicron",
                model,
                Duration::from_millis(cfg.timeout_ms),
            );
            let laser = Arc::new(OmicronLaser::with_connection(connection, &cfg).await?);
            Ok(laser.components())
        })
    }
}
