//! Physik Instrumente piezo stage drivers.
//!
//! - [`PiE754Stage`]: E-754 digital piezo controller reached over TCP,
//!   speaking the GCS command set (`MOV`, `POS?`, `ERR?`, ...)
//!
//! Register the factory with your device registry:
//!
//! ```rust,ignore
//! use scope_driver_pi::PiStageFactory;
//!
//! registry.register_factory(Box::new(PiStageFactory));
//! ```

mod stage;

pub use stage::{controller_error_text, PiE754Stage, PiStageConfig, PiStageFactory};
