//! Core types and serial plumbing shared by the microscope device drivers.
//!
//! Driver crates build on three layers defined here:
//!
//! - [`serial`]: an exclusively owned serial line with normalised line reads
//! - [`exchange`]: the half-duplex, echo-confirming command/response exchange
//! - [`capabilities`] / [`driver`]: the traits a finished device exposes and
//!   the factory API used to build devices from TOML configuration
//!
//! Supporting pieces ([`bitfield`], [`position_table`], [`deferred`]) cover
//! the recurring chores of vendor protocols: decoding status words, mapping
//! wheel slots to device positions and scheduling a return to standby.

pub mod bitfield;
pub mod capabilities;
pub mod deferred;
pub mod driver;
pub mod error;
pub mod exchange;
pub mod position_table;
pub mod serial;

pub use error::{DeviceError, DeviceResult, DriverErrorKind};
