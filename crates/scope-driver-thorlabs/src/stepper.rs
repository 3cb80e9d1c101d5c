//! FW103M filter wheel on a stepper motor controller.
//!
//! The wheel has no controller of its own; a benchtop stepper controller
//! turns it to fixed angles. The controller is reached through its vendor
//! SDK, represented here by [`StepperController`]. Only the slot/angle
//! mapping and lifecycle live in this crate.

use anyhow::{Context, Result};
use async_trait::async_trait;
use scope_core::capabilities::{Device, FilterWheel};
use scope_core::error::DeviceResult;
use scope_core::position_table::PositionTable;
use tokio::sync::Mutex;
use tracing::instrument;

/// Angle in degrees for each FW103M slot.
pub const FW103M_ANGLES: [f64; 6] = [0.0, 300.0, 240.0, 180.0, 120.0, 60.0];

/// Motion controller the wheel is mounted on.
#[async_trait]
pub trait StepperController: Send + Sync {
    /// Connect and load the motor configuration.
    async fn connect(&mut self) -> Result<()>;

    async fn home(&mut self) -> Result<()>;

    /// Move to an absolute angle in degrees and wait for completion.
    async fn move_to(&mut self, degrees: f64) -> Result<()>;

    async fn position(&mut self) -> Result<f64>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// Filter wheel whose slots are angles on a stepper controller.
pub struct StepperFilterWheel<C> {
    name: String,
    controller: Mutex<C>,
    table: PositionTable<f64>,
}

impl<C: StepperController> StepperFilterWheel<C> {
    /// FW103M wheel: connect, home, use the standard angle table.
    pub async fn fw103m(name: &str, controller: C) -> Result<Self> {
        Self::new(name, controller, PositionTable::new(FW103M_ANGLES.to_vec())?).await
    }

    /// Connect and home the controller.
    pub async fn new(name: &str, mut controller: C, table: PositionTable<f64>) -> Result<Self> {
        controller
            .connect()
            .await
            .with_context(|| format!("{}: connect to stepper controller", name))?;
        controller
            .home()
            .await
            .with_context(|| format!("{}: home stepper controller", name))?;
        tracing::info!(device = name, positions = table.len(), "Stepper filter wheel homed");
        Ok(Self {
            name: name.to_string(),
            controller: Mutex::new(controller),
            table,
        })
    }

    pub fn table(&self) -> &PositionTable<f64> {
        &self.table
    }

    fn angle_for(&self, slot: usize) -> DeviceResult<f64> {
        self.table.physical(slot)
    }
}

#[async_trait]
impl<C: StepperController> FilterWheel for StepperFilterWheel<C> {
    fn position_count(&self) -> usize {
        self.table.len()
    }

    #[instrument(skip(self), fields(device = %self.name))]
    async fn position(&self) -> Result<usize> {
        let angle = self.controller.lock().await.position().await?;
        Ok(self.table.slot_of(angle)?)
    }

    #[instrument(skip(self), fields(device = %self.name))]
    async fn set_position(&self, slot: usize) -> Result<()> {
        let angle = self.angle_for(slot)?;
        tracing::debug!(slot, angle, "Moving stepper wheel");
        self.controller.lock().await.move_to(angle).await
    }
}

#[async_trait]
impl<C: StepperController> Device for StepperFilterWheel<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) -> Result<()> {
        self.controller.lock().await.disconnect().await
    }
}
