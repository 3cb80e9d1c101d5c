//! Simulated PI E-754 piezo controller.

use crate::port::{DeviceModel, SimulatedPort};
use anyhow::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use scope_core::driver::{Capability, DeviceComponents, DriverFactory};
use scope_driver_pi::{PiE754Stage, PiStageConfig, PiStageFactory};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// One controller axis.
#[derive(Debug, Clone, PartialEq)]
pub struct E754Axis {
    pub position: f64,
    pub velocity: f64,
    pub servo: bool,
    pub lower: f64,
    pub upper: f64,
    pub zero_calibrated: bool,
}

impl Default for E754Axis {
    fn default() -> Self {
        Self {
            position: 0.0,
            velocity: 10.0,
            servo: false,
            lower: 0.0,
            upper: 100.0,
            zero_calibrated: false,
        }
    }
}

/// Observable state of an [`E754Model`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct E754State {
    pub axes: BTreeMap<u32, E754Axis>,
    /// Code returned by the next `ERR?`
    pub error: i32,
    /// Closed-loop moves fail with error 5 even with the servo on
    pub refuse_moves: bool,
}

/// Handle for inspecting and steering a running [`E754Model`].
#[derive(Debug, Clone, Default)]
pub struct E754Handle(Arc<Mutex<E754State>>);

impl E754Handle {
    pub fn snapshot(&self) -> E754State {
        self.0.lock().clone()
    }

    pub fn axis(&self, id: u32) -> Option<E754Axis> {
        self.0.lock().axes.get(&id).cloned()
    }

    pub fn set_refuse_moves(&self, refuse: bool) {
        self.0.lock().refuse_moves = refuse;
    }
}

/// E-754 controller: LF-terminated GCS, replies only to queries.
///
/// Set commands that fail record an error code for the next `ERR?`
/// instead of answering.
#[derive(Debug, Clone)]
pub struct E754Model {
    state: E754Handle,
}

impl E754Model {
    /// Controller with axes `1..=count`, each travelling over `[0, 100]`.
    pub fn new(count: u32) -> Self {
        let axes = (1..=count).map(|id| (id, E754Axis::default())).collect();
        Self {
            state: E754Handle(Arc::new(Mutex::new(E754State {
                axes,
                ..Default::default()
            }))),
        }
    }

    /// Change the travel range of axis `id`.
    pub fn with_limits(self, id: u32, lower: f64, upper: f64) -> Self {
        if let Some(axis) = self.state.0.lock().axes.get_mut(&id) {
            axis.lower = lower;
            axis.upper = upper;
        }
        self
    }

    pub fn handle(&self) -> E754Handle {
        self.state.clone()
    }
}

/// Error code for a set command applied to `axis`, or 0.
fn apply(axis: &mut E754Axis, command: &str, value: f64, refuse_moves: bool) -> i32 {
    let target = match command {
        "MOV" | "SVA" => value,
        "MVR" | "SVR" => axis.position + value,
        "VEL" if value > 0.0 => {
            axis.velocity = value;
            return 0;
        }
        "VEL" => return 8,
        "SVO" => {
            axis.servo = value != 0.0;
            return 0;
        }
        _ => return 2,
    };
    let closed = matches!(command, "MOV" | "MVR");
    if closed && (!axis.servo || refuse_moves) {
        return 5;
    }
    if !(axis.lower..=axis.upper).contains(&target) {
        return 7;
    }
    axis.position = target;
    0
}

impl DeviceModel for E754Model {
    fn respond(&mut self, command: &str) -> Vec<String> {
        let mut state = self.state.0.lock();
        let words: Vec<&str> = command.split_whitespace().collect();

        if words.as_slice() == ["ERR?"] {
            return vec![format!("{}\n", std::mem::take(&mut state.error))];
        }

        let (Some(&name), Some(Ok(id))) = (words.first(), words.get(1).map(|w| w.parse::<u32>())) else {
            state.error = 1;
            return Vec::new();
        };
        let refuse_moves = state.refuse_moves;
        let Some(axis) = state.axes.get_mut(&id) else {
            state.error = 15;
            return Vec::new();
        };

        let reply = |value: f64| vec![format!("{}={}\n", id, value)];
        let code = match (name, words.get(2)) {
            ("POS?", None) => return reply(axis.position),
            ("VEL?", None) => return reply(axis.velocity),
            ("TMN?", None) => return reply(axis.lower),
            ("TMX?", None) => return reply(axis.upper),
            ("SVO?", None) => return reply(f64::from(u8::from(axis.servo))),
            ("ATZ?", None) => return reply(f64::from(u8::from(axis.zero_calibrated))),
            ("ATZ", None) => {
                axis.zero_calibrated = true;
                0
            }
            (set, Some(value)) if !set.ends_with('?') => match value.parse::<f64>() {
                Ok(value) if value.is_finite() => apply(axis, set, value, refuse_moves),
                _ => 1,
            },
            _ => 2,
        };
        if code != 0 {
            state.error = code;
        }
        Vec::new()
    }
}

/// Factory for an E-754 stage on a simulated controller.
///
/// Reads the regular `pi_e754` config; `host` may be omitted.
pub struct MockPiStageFactory;

static MOCK_STAGE_CAPABILITIES: &[Capability] = &[Capability::Stage];

fn with_simulated_host(config: toml::Value) -> toml::Value {
    match config {
        toml::Value::Table(mut table) => {
            table
                .entry("host")
                .or_insert_with(|| toml::Value::String("simulated".to_string()));
            toml::Value::Table(table)
        }
        other => other,
    }
}

impl DriverFactory for MockPiStageFactory {
    fn driver_type(&self) -> &'static str {
        "mock_pi_stage"
    }

    fn name(&self) -> &'static str {
        "Mock PI E-754 Stage"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_STAGE_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        PiStageFactory.validate(&with_simulated_host(config.clone()))
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: PiStageConfig = with_simulated_host(config).try_into()?;
            let count = cfg.axes.values().copied().max().unwrap_or(1);

            let (connection, _log) = SimulatedPort::connection_with_terminator(
                "mock_pi_stage",
                E754Model::new(count),
                Duration::from_millis(cfg.timeout_ms),
                "\n",
            );
            let stage = Arc::new(PiE754Stage::with_connection(connection, &cfg).await?);
            Ok(DeviceComponents {
                device: Some(stage.clone()),
                stage: Some(stage),
                ..Default::default()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queries_name_the_axis() {
        let mut model = E754Model::new(2).with_limits(2, -5.0, 5.0);
        assert_eq!(model.respond("TMN? 2"), vec!["2=-5\n"]);
        assert_eq!(model.respond("POS? 1"), vec!["1=0\n"]);
        assert!(model.respond("SVO 1 1").is_empty());
        assert_eq!(model.respond("SVO? 1"), vec!["1=1\n"]);
    }

    #[test]
    fn test_errors_are_kept_until_read() {
        let mut model = E754Model::new(1);
        assert!(model.respond("MOV 1 10").is_empty());
        assert_eq!(model.respond("ERR?"), vec!["5\n"]);
        assert_eq!(model.respond("ERR?"), vec!["0\n"]);

        model.respond("SVO 1 1");
        model.respond("MOV 1 150");
        assert_eq!(model.respond("ERR?"), vec!["7\n"]);
        model.respond("POS? 3");
        assert_eq!(model.respond("ERR?"), vec!["15\n"]);
        model.respond("FOO 1 2");
        assert_eq!(model.respond("ERR?"), vec!["2\n"]);
    }

    #[test]
    fn test_open_loop_moves_ignore_servo() {
        let mut model = E754Model::new(1);
        model.respond("SVA 1 40");
        model.respond("SVR 1 -15");
        assert_eq!(model.respond("ERR?"), vec!["0\n"]);
        assert_eq!(model.handle().axis(1).map(|a| a.position), Some(25.0));
    }
}
