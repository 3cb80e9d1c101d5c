//! Cobolt laser drivers.
//!
//! - 04 series heads with power set in watts
//! - 06-DPL directly modulated heads with power set through drive current
//!
//! Register the factory with your device registry:
//!
//! ```rust,ignore
//! use scope_driver_cobolt::CoboltFactory;
//!
//! registry.register_factory(Box::new(CoboltFactory));
//! ```

mod current_model;
mod laser;

pub use current_model::CurrentModel;
pub use laser::{CoboltConfig, CoboltFactory, CoboltLaser, CoboltVariant};
