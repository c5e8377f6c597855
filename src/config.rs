//! Configuration System using Figment
//!
//! Engine parameters are loaded from, in increasing priority:
//! 1. Built-in defaults (the values the rig was tuned with)
//! 2. A TOML file, when one is given
//! 3. Environment variables prefixed with `SMARTPATCH_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! SMARTPATCH_APPLICATION__LOG_LEVEL=debug
//! SMARTPATCH_CALIBRATION__STEP_SIZE_UM=20
//! SMARTPATCH_AUTOFOCUS__MAX_ITERATIONS=500
//! ```
//!
//! # Example
//!
//! ```no_run
//! use smartpatch::config::RigConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RigConfig::load(Some("config/smartpatch.toml".as_ref()))?;
//!     println!("Calibration step: {} um", config.calibration.step_size_um);
//!     Ok(())
//! }
//! ```

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{RigError, RigResult};
use crate::geometry::{PixelPoint, Pose, RotationAngles};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// `[application]`
    pub application: ApplicationConfig,
    /// `[calibration]`
    pub calibration: CalibrationConfig,
    /// `[autofocus]`
    pub autofocus: AutofocusConfig,
    /// `[storage]`
    pub storage: StorageConfig,
    /// `[simulation]`
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Name logged at startup
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Optional data directory for persistent storage
    pub data_dir: Option<PathBuf>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "smartpatch".to_string(),
            log_level: "info".to_string(),
            data_dir: None,
        }
    }
}

/// Hard and soft calibration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Spacing between sweep samples in microns; small enough to keep the tip in view
    pub step_size_um: f64,
    /// Samples per swept axis, centred on the reference pose
    pub sweep_points: usize,
    /// Lateral x offset between the two frames of a parallax pair
    pub parallax_offset_um: f64,
    /// Expected-diameter multiplier for the masked refinement pass
    pub refine_diameter_factor: f64,
    /// Mask sigma is frame width / divisor and frame height / divisor
    pub mask_sigma_divisor: u32,
    /// Largest tolerated fraction of missed localizations before the run fails
    pub max_miss_fraction: f64,
    /// Soft calibration offsets relative to the reference pose
    pub soft_offsets_um: Vec<[f64; 3]>,
    /// User bias added to the averaged soft calibration tip
    pub soft_bias_px: [f64; 2],
    /// Correction currently applied to every sampled target offset
    pub rotation_correction: RotationAngles,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            step_size_um: 25.0,
            sweep_points: 7,
            parallax_offset_um: 5.0,
            refine_diameter_factor: 1.25,
            mask_sigma_divisor: 12,
            max_miss_fraction: 0.0,
            soft_offsets_um: vec![
                [-100.0, -50.0, 0.0],
                [0.0, -50.0, 0.0],
                [100.0, -50.0, 0.0],
                [-100.0, 50.0, 0.0],
                [0.0, 50.0, 0.0],
                [100.0, 50.0, 0.0],
            ],
            soft_bias_px: [0.0, 0.0],
            rotation_correction: RotationAngles::default(),
        }
    }
}

impl CalibrationConfig {
    /// Soft calibration offsets as poses.
    pub fn soft_offsets(&self) -> Vec<Pose> {
        self.soft_offsets_um
            .iter()
            .map(|[x, y, z]| Pose::new(*x, *y, *z))
            .collect()
    }

    /// Configured soft calibration bias as a pixel offset.
    pub fn soft_bias(&self) -> PixelPoint {
        PixelPoint::new(self.soft_bias_px[0], self.soft_bias_px[1])
    }

    /// Rejects non-positive steps, too few sweep points and bad tolerances.
    pub fn validate(&self) -> RigResult<()> {
        if !(self.step_size_um.is_finite() && self.step_size_um > 0.0) {
            return Err(RigError::Configuration(format!(
                "calibration step_size_um must be positive, got {}",
                self.step_size_um
            )));
        }
        if self.sweep_points < 2 {
            return Err(RigError::Configuration(format!(
                "calibration sweep_points must be at least 2, got {}",
                self.sweep_points
            )));
        }
        if !(self.refine_diameter_factor.is_finite() && self.refine_diameter_factor > 0.0) {
            return Err(RigError::Configuration(format!(
                "refine_diameter_factor must be positive, got {}",
                self.refine_diameter_factor
            )));
        }
        if self.mask_sigma_divisor == 0 {
            return Err(RigError::Configuration(
                "mask_sigma_divisor must be non-zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.max_miss_fraction) {
            return Err(RigError::Configuration(format!(
                "max_miss_fraction must lie in [0, 1], got {}",
                self.max_miss_fraction
            )));
        }
        if self.soft_offsets_um.is_empty() {
            return Err(RigError::Configuration(
                "soft_offsets_um must list at least one offset".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sharpness-peak search parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofocusConfig {
    /// Coarse search step along z in microns
    pub step_size_um: f64,
    /// Known offset between the sharpest image and the in-focus tip height
    pub focus_bias_um: f64,
    /// Length of the tail checked for monotonic decline behind a candidate peak
    pub probe_length: usize,
    /// Refinement passes use step_size_um / divisor, in this order
    pub refinement_divisors: Vec<f64>,
    /// Samples per refinement pass across [z - step, z + step]
    pub refinement_points: usize,
    /// Search loop iterations before giving up
    pub max_iterations: usize,
    /// Largest distance from the reference height the search may sample
    pub max_excursion_um: f64,
}

impl Default for AutofocusConfig {
    fn default() -> Self {
        Self {
            step_size_um: 10.0,
            focus_bias_um: 20.0,
            probe_length: 8,
            refinement_divisors: vec![1.0, 5.0, 25.0],
            refinement_points: 6,
            max_iterations: 200,
            max_excursion_um: 1000.0,
        }
    }
}

impl AutofocusConfig {
    /// Range checks for the search parameters.
    pub fn validate(&self) -> RigResult<()> {
        if !(self.step_size_um.is_finite() && self.step_size_um > 0.0) {
            return Err(RigError::Configuration(format!(
                "autofocus step_size_um must be positive, got {}",
                self.step_size_um
            )));
        }
        if !self.focus_bias_um.is_finite() {
            return Err(RigError::Configuration(
                "focus_bias_um must be finite".to_string(),
            ));
        }
        if self.probe_length < 3 {
            return Err(RigError::Configuration(format!(
                "probe_length must be at least 3, got {}",
                self.probe_length
            )));
        }
        if self.refinement_points < 2 {
            return Err(RigError::Configuration(format!(
                "refinement_points must be at least 2, got {}",
                self.refinement_points
            )));
        }
        let strictly_decreasing = self
            .refinement_divisors
            .windows(2)
            .all(|pair| pair[1] > pair[0]);
        if self.refinement_divisors.iter().any(|d| !(d.is_finite() && *d > 0.0))
            || !strictly_decreasing
        {
            return Err(RigError::Configuration(
                "refinement_divisors must be positive and increasing so steps strictly decrease"
                    .to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(RigError::Configuration(
                "max_iterations must be non-zero".to_string(),
            ));
        }
        if !(self.max_excursion_um.is_finite() && self.max_excursion_um > 3.0 * self.step_size_um)
        {
            return Err(RigError::Configuration(format!(
                "max_excursion_um must exceed the three seed steps ({} um), got {}",
                3.0 * self.step_size_um,
                self.max_excursion_um
            )));
        }
        Ok(())
    }

    /// Coarse step divided by each refinement divisor, in order.
    pub fn refinement_steps(&self) -> Vec<f64> {
        self.refinement_divisors
            .iter()
            .map(|divisor| self.step_size_um / divisor)
            .collect()
    }
}

/// Results store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Persist raw sample arrays and focus traces
    pub enabled: bool,
    /// Output directory for artifacts
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output_dir: PathBuf::from("data"),
        }
    }
}

/// Synthetic rig used by the binary when no hardware drivers are linked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Initial manipulator pose
    pub start_um: [f64; 3],
    /// Camera scale at zero rotation
    pub pixels_per_um: f64,
    /// In-plane rotation of the manipulator relative to the camera
    pub rotation_deg: f64,
    /// Tip pixel position at manipulator x = y = 0
    pub tip_origin_px: [f64; 2],
    /// Height of the sharpness peak
    pub focus_peak_um: f64,
    /// Uniform pixel noise amplitude on tip detections
    pub pixel_noise: f64,
    /// Seed of the pixel noise generator
    pub seed: u64,
    /// Simulated frame width in pixels
    pub frame_width: u32,
    /// Simulated frame height in pixels
    pub frame_height: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            start_um: [0.0, 0.0, 0.0],
            pixels_per_um: 10.0,
            rotation_deg: 0.0,
            tip_origin_px: [1000.0, 1000.0],
            focus_peak_um: 42.0,
            pixel_noise: 0.0,
            seed: 7,
            frame_width: 64,
            frame_height: 48,
        }
    }
}

impl RigConfig {
    /// Load defaults, then `path` if given, then `SMARTPATCH_` variables.
    pub fn load(path: Option<&Path>) -> RigResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(RigConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("SMARTPATCH_").split("__"));
        Self::from_figment(&figment)
    }

    /// Extract and validate from an already assembled figment.
    pub fn from_figment(figment: &Figment) -> RigResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks log level, calibration and autofocus parameter ranges.
    pub fn validate(&self) -> RigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(RigError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        self.calibration.validate()?;
        self.autofocus.validate()?;
        if !(self.simulation.pixels_per_um.is_finite() && self.simulation.pixels_per_um > 0.0) {
            return Err(RigError::Configuration(format!(
                "simulation pixels_per_um must be positive, got {}",
                self.simulation.pixels_per_um
            )));
        }
        Ok(())
    }
}
