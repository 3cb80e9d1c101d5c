//! Simulated devices for scope drivers.
//!
//! The real drivers run unchanged on top of an in-memory serial port whose
//! far end is a scripted device model. This exercises the full protocol
//! stack (framing, echo handling, retries, ad-hoc frames) without hardware.
//!
//! # Device models
//!
//! - [`Fw102cModel`] - echoing filter wheel with a `> ` prompt
//! - [`CoboltModel`] - silent CRLF protocol, busy placeholder injection
//! - [`OmicronModel`] - framed protocol, random or queued ad-hoc frames
//! - [`MockStepper`] - stepper controller for FW103M-style wheels
//! - [`E754Model`] - LF-terminated GCS piezo controller, errors via `ERR?`
//!
//! # Driver Factory Pattern
//!
//! ```rust,ignore
//! use scope_driver_mock::register_all;
//! use scope_hardware::DeviceRegistry;
//!
//! let registry = DeviceRegistry::new();
//! register_all(&registry);
//! ```

mod mock_cobolt;
mod mock_omicron;
mod mock_pi;
mod mock_wheel;
pub mod port;
pub mod rng;

pub use mock_cobolt::{CoboltHandle, CoboltModel, CoboltState, MockCoboltFactory};
pub use mock_omicron::{MockOmicronFactory, OmicronHandle, OmicronModel, OmicronState};
pub use mock_pi::{E754Axis, E754Handle, E754Model, E754State, MockPiStageFactory};
pub use mock_wheel::{
    Fw102cModel, MockFilterWheelFactory, MockStepper, MockStepperWheelConfig,
    MockStepperWheelFactory,
};
pub use port::{DeviceModel, SimulatedPort, WireEvent, WireLog};
pub use rng::MockRng;

/// Register all mock driver factories with a device registry.
pub fn register_all(registry: &impl FactoryRegistry) {
    registry.register_factory(Box::new(MockFilterWheelFactory));
    registry.register_factory(Box::new(MockStepperWheelFactory));
    registry.register_factory(Box::new(MockCoboltFactory));
    registry.register_factory(Box::new(MockOmicronFactory));
    registry.register_factory(Box::new(MockPiStageFactory));
}

/// Registry that accepts driver factories.
///
/// Lets this crate register its factories without depending on
/// `scope-hardware`.
pub trait FactoryRegistry {
    fn register_factory(&self, factory: Box<dyn scope_core::driver::DriverFactory>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Names(Mutex<Vec<&'static str>>);

    impl FactoryRegistry for Names {
        fn register_factory(&self, factory: Box<dyn scope_core::driver::DriverFactory>) {
            self.0.lock().push(factory.driver_type());
        }
    }

    #[test]
    fn test_register_all() {
        let names = Names::default();
        register_all(&names);
        assert_eq!(
            *names.0.lock(),
            vec![
                "mock_filter_wheel",
                "mock_stepper_wheel",
                "mock_cobolt",
                "mock_omicron",
                "mock_pi_stage"
            ]
        );
    }
}
