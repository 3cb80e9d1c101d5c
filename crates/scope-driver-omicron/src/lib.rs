//! Omicron LuxX / Deepstar laser driver.
//!
//! The laser interleaves unsolicited `$` frames with its replies; the
//! [`protocol`] module separates the two so callers only ever see the
//! answer to their own command.
//!
//! ```rust,ignore
//! use scope_driver_omicron::OmicronFactory;
//!
//! registry.register_factory(Box::new(OmicronFactory));
//! ```

mod laser;
pub mod protocol;
pub mod registers;

pub use laser::{
    initial_mode, level_for, trigger_mode_bits, OmicronConfig, OmicronFactory, OmicronInfo,
    OmicronLaser, LEVEL_FULL_SCALE,
};
pub use protocol::{AdhocFrame, AdhocState, FrameCounts, OmicronLink};
pub use registers::{LatchedFailure, OperationMode, Status};
