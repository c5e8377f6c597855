use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RigError;
use crate::geometry::{PixelPoint, Pose, RotationAngles, RotationFrame};

/// What a hard calibration run estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationMode {
    /// In-plane rotation only; sweeps x and y
    Xy,
    /// Full rotation; sweeps x, y and z
    Xyz,
    /// Microns per pixel; sweeps x and y
    PixelSize,
}

impl CalibrationMode {
    /// Manipulator axes swept in this mode.
    pub fn axes(&self) -> std::ops::Range<usize> {
        match self {
            CalibrationMode::Xy | CalibrationMode::PixelSize => 0..2,
            CalibrationMode::Xyz => 0..3,
        }
    }

    /// Lowercase name, also used in artifact file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationMode::Xy => "xy",
            CalibrationMode::Xyz => "xyz",
            CalibrationMode::PixelSize => "pixelsize",
        }
    }
}

impl fmt::Display for CalibrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CalibrationMode {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xy" => Ok(CalibrationMode::Xy),
            "xyz" => Ok(CalibrationMode::Xyz),
            "pixelsize" | "pixel-size" | "pixel_size" => Ok(CalibrationMode::PixelSize),
            other => Err(RigError::Configuration(format!(
                "unsupported hard calibration mode '{other}'"
            ))),
        }
    }
}

/// Outcome of one calibration run. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalibrationResult {
    /// Observed in-plane rotation; alpha and beta are taken as zero.
    Xy {
        /// In-plane angle, radians.
        gamma: f64,
        /// Frame the angle was read from.
        frame: RotationFrame,
    },
    /// Correction to apply: the negation of the observed rotation.
    Xyz {
        /// Negated observed angles.
        correction: RotationAngles,
        /// Frame the angles were read from.
        frame: RotationFrame,
    },
    /// Pixel size from the x and y sweeps.
    PixelSize {
        /// Mean microns per pixel.
        mean_um_per_px: f64,
        /// Population variance of the per-pair estimates.
        variance: f64,
        /// Number of displacement pairs used.
        samples: usize,
    },
    /// Manipulator reference linked to the averaged, bias-corrected tip pixel.
    SoftPair {
        /// Manipulator pose when the run started.
        reference: Pose,
        /// Averaged tip pixel plus bias.
        tip: PixelPoint,
        /// Number of found samples averaged.
        samples: usize,
    },
}

impl CalibrationResult {
    /// Rotation correction this result implies, if it is a rotation result.
    pub fn rotation_correction(&self) -> Option<RotationAngles> {
        match self {
            CalibrationResult::Xy { gamma, .. } => Some(RotationAngles::new(0.0, 0.0, -gamma)),
            CalibrationResult::Xyz { correction, .. } => Some(*correction),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modes_and_rejects_unknown() {
        assert_eq!("XY".parse::<CalibrationMode>().unwrap(), CalibrationMode::Xy);
        assert_eq!(
            "pixel-size".parse::<CalibrationMode>().unwrap(),
            CalibrationMode::PixelSize
        );
        assert!(matches!(
            "xz".parse::<CalibrationMode>(),
            Err(RigError::Configuration(_))
        ));
    }

    #[test]
    fn xy_correction_negates_gamma() {
        let result = CalibrationResult::Xy {
            gamma: 0.2,
            frame: RotationFrame::identity(),
        };
        assert_eq!(
            result.rotation_correction(),
            Some(RotationAngles::new(0.0, 0.0, -0.2))
        );
    }
}
