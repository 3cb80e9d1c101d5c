//! Thorlabs filter wheel drivers.
//!
//! - [`ThorlabsFilterWheel`]: FW102C / FW212C and other wheels speaking the
//!   echoed ASCII protocol (`pcount?`, `pos=<n>`, `pos?`)
//! - [`StepperFilterWheel`]: FW103M wheel driven through a stepper motor
//!   controller, with slots mapped to angles
//!
//! Register the factory with your device registry:
//!
//! ```rust,ignore
//! use scope_driver_thorlabs::ThorlabsFilterWheelFactory;
//!
//! registry.register_factory(Box::new(ThorlabsFilterWheelFactory));
//! ```

mod filter_wheel;
mod stepper;

pub use filter_wheel::{
    FilterWheelConfig, ThorlabsFilterWheel, ThorlabsFilterWheelFactory, WheelModel,
};
pub use stepper::{StepperController, StepperFilterWheel, FW103M_ANGLES};
