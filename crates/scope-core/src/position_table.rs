//! Logical slot to device position mapping for filter wheels.
//!
//! Slots are always `0..N`. What the device calls a position differs per
//! product: 1-based integers on serial wheels, angles in degrees on
//! stepper-driven ones. The table is built once and never changes; reads go
//! through [`PositionTable::slot_of`], which fails rather than guessing when
//! the device reports something the table does not contain.

use crate::error::{DeviceError, DeviceResult};
use std::fmt::{Debug, Display};

/// Allowed difference when matching decimal positions (device units).
pub const UNIT_MARGIN: f64 = 0.01;

/// A value a device may report as a position.
pub trait DevicePosition: Copy + Debug + Display + Send + Sync + 'static {
    /// True when `reported` should be read as `self`.
    fn matches(&self, reported: &Self) -> bool;
}

impl DevicePosition for u32 {
    fn matches(&self, reported: &Self) -> bool {
        self == reported
    }
}

impl DevicePosition for i64 {
    fn matches(&self, reported: &Self) -> bool {
        self == reported
    }
}

impl DevicePosition for f64 {
    fn matches(&self, reported: &Self) -> bool {
        (self - reported).abs() < UNIT_MARGIN
    }
}

/// Immutable slot table.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionTable<T> {
    positions: Vec<T>,
}

impl<T: DevicePosition> PositionTable<T> {
    /// Table whose slot `i` is `positions[i]`.
    ///
    /// Rejects empty tables and tables in which two slots would match the
    /// same reported value, since the reverse lookup would be ambiguous.
    pub fn new(positions: Vec<T>) -> DeviceResult<Self> {
        if positions.is_empty() {
            return Err(DeviceError::Configuration(
                "position table is empty".to_string(),
            ));
        }
        for (i, a) in positions.iter().enumerate() {
            if let Some(j) = positions[i + 1..].iter().position(|b| a.matches(b)) {
                return Err(DeviceError::Configuration(format!(
                    "slots {} and {} share position {}",
                    i,
                    i + 1 + j,
                    a
                )));
            }
        }
        Ok(Self { positions })
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Device position for a logical slot.
    pub fn physical(&self, slot: usize) -> DeviceResult<T> {
        self.positions
            .get(slot)
            .copied()
            .ok_or(DeviceError::SlotOutOfRange {
                slot,
                count: self.positions.len(),
            })
    }

    /// Logical slot for a position reported by the device.
    pub fn slot_of(&self, reported: T) -> DeviceResult<usize> {
        self.positions
            .iter()
            .position(|p| p.matches(&reported))
            .ok_or_else(|| DeviceError::UnknownPosition {
                value: reported.to_string(),
            })
    }

    pub fn positions(&self) -> &[T] {
        &self.positions
    }
}

impl PositionTable<u32> {
    /// Table for devices that number positions `1..=count`.
    pub fn one_based(count: usize) -> DeviceResult<Self> {
        let count = u32::try_from(count)
            .map_err(|_| DeviceError::Configuration(format!("{} positions", count)))?;
        Self::new((1..=count).collect())
    }
}
