//! Capability traits the engine consumes.
//!
//! The engine only ever talks to the rig through these three seams. Drivers for
//! the actual micromanipulator, camera and segmentation model live outside this
//! crate and implement them.
//!
//! # Contract
//!
//! - Every call is awaited to completion before the next one is issued; the
//!   engine never has two motion commands in flight.
//! - Faults are reported as [`HardwareError`] and are never retried here.

use async_trait::async_trait;

use crate::error::HardwareError;
use crate::frame::Frame;
use crate::geometry::{PixelPoint, Pose};

/// Result alias for collaborator calls.
pub type HardwareResult<T> = std::result::Result<T, HardwareError>;

/// Micromanipulator position control.
#[async_trait]
pub trait Motion: Send + Sync {
    /// Read the current absolute position.
    async fn position(&self) -> HardwareResult<Pose>;

    /// Move to an absolute position and return once it has been reached.
    ///
    /// # Errors
    /// - `MotionOutOfRange` when the target is unreachable
    async fn move_absolute(&self, target: Pose) -> HardwareResult<()>;

    /// Move by a displacement. Components left at zero do not move.
    async fn move_relative(&self, delta: Pose) -> HardwareResult<()> {
        let current = self.position().await?;
        self.move_absolute(current + delta).await
    }
}

/// Single-frame acquisition.
#[async_trait]
pub trait Imaging: Send + Sync {
    /// Grab one frame at the current pose.
    async fn capture(&self) -> HardwareResult<Frame>;
}

/// Black-box pipette tip detection and focus scoring.
pub trait TipLocalizer: Send + Sync {
    /// Locate the tip in `image_a` using the parallax against `image_b`.
    ///
    /// Returns `None` when no tip is found.
    fn locate_tip(
        &self,
        image_a: &Frame,
        image_b: &Frame,
        diameter: f64,
        orientation: f64,
    ) -> Option<PixelPoint>;

    /// Non-negative focus score; only relative order within a search matters.
    fn sharpness(&self, image: &Frame) -> f64 {
        image.laplacian_variance()
    }
}
