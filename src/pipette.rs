//! Validated pipette geometry.

use serde::{Deserialize, Serialize};

use crate::error::{RigError, RigResult};

/// Opening diameter and in-image orientation of the pipette.
///
/// Validated once at construction and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipetteGeometry {
    diameter_um: f64,
    orientation_rad: f64,
}

impl PipetteGeometry {
    /// Fails unless the diameter is positive and the orientation finite.
    pub fn new(diameter_um: f64, orientation_rad: f64) -> RigResult<Self> {
        if !diameter_um.is_finite() || diameter_um <= 0.0 {
            return Err(RigError::Configuration(format!(
                "pipette diameter must be a positive number of microns, got {diameter_um}"
            )));
        }
        if !orientation_rad.is_finite() {
            return Err(RigError::Configuration(format!(
                "pipette orientation must be finite, got {orientation_rad}"
            )));
        }
        Ok(Self {
            diameter_um,
            orientation_rad,
        })
    }

    /// Tip diameter in microns.
    pub fn diameter(&self) -> f64 {
        self.diameter_um
    }

    /// Tip orientation in radians.
    pub fn orientation(&self) -> f64 {
        self.orientation_rad
    }
}
