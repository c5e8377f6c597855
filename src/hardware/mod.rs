//! Rig collaborators: capability traits plus a synthetic rig for simulation.

pub mod capabilities;
pub mod mock;

use std::sync::Arc;

pub use capabilities::{HardwareResult, Imaging, Motion, TipLocalizer};

/// Handles to the three collaborators an engine run needs.
#[derive(Clone)]
pub struct Rig {
    /// Micromanipulator.
    pub motion: Arc<dyn Motion>,
    /// Camera.
    pub imaging: Arc<dyn Imaging>,
    /// Tip detector and focus scorer.
    pub localizer: Arc<dyn TipLocalizer>,
}

impl Rig {
    /// Bundle the three collaborators.
    pub fn new(
        motion: Arc<dyn Motion>,
        imaging: Arc<dyn Imaging>,
        localizer: Arc<dyn TipLocalizer>,
    ) -> Self {
        Self {
            motion,
            imaging,
            localizer,
        }
    }
}
