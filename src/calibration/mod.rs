//! Coordinate calibration between the micromanipulator and the camera.
//!
//! Two procedures share one sampler:
//!
//! - **Hard calibration** sweeps the manipulator along its own axes and fits
//!   the [`RotationFrame`](crate::geometry::RotationFrame) relating manipulator
//!   displacement to pixel displacement, or estimates the pixel size.
//! - **Soft calibration** averages the tip position over a small fixed pattern
//!   around the reference pose and pairs it with that pose.
//!
//! Both runs return the manipulator to the pose it started from on every exit
//! path, including hardware faults and cancellation.
//!
//! # Usage
//!
//! ```rust,ignore
//! let calibrator = CoordinateCalibrator::new(rig, config.calibration.clone())?
//!     .with_events(sender);
//! let pipette = PipetteGeometry::new(16.0, 0.0)?;
//! let outcome = calibrator
//!     .hard_calibrate(CalibrationMode::Xy, pipette, &CancellationToken::new())
//!     .await?;
//! ```

mod hard;
mod result;
mod sampler;
mod soft;

use std::sync::Arc;

use tracing::warn;

pub use hard::{pixel_size_estimate, rotation_frame, AxisSweep};
pub use result::{CalibrationMode, CalibrationResult};
pub use sampler::{SampleRecord, TipObservation, TipSample, TipSampleSet, TipSampler};

use crate::config::CalibrationConfig;
use crate::error::{RigError, RigResult};
use crate::events::{ProgressEvent, ProgressSender};
use crate::hardware::Rig;
use crate::storage::{NullStore, ResultsStore};

/// Runs hard and soft calibrations against a rig.
pub struct CoordinateCalibrator {
    rig: Rig,
    config: CalibrationConfig,
    store: Arc<dyn ResultsStore>,
    events: ProgressSender,
}

impl CoordinateCalibrator {
    /// Validates `config` before any hardware is touched.
    pub fn new(rig: Rig, config: CalibrationConfig) -> RigResult<Self> {
        config.validate()?;
        Ok(Self {
            rig,
            config,
            store: Arc::new(NullStore),
            events: ProgressSender::disabled(),
        })
    }

    /// Persist raw tip samples through `store`.
    pub fn with_store(mut self, store: Arc<dyn ResultsStore>) -> Self {
        self.store = store;
        self
    }

    /// Report samples and the terminal event through `events`.
    pub fn with_events(mut self, events: ProgressSender) -> Self {
        self.events = events;
        self
    }

    /// Applies the miss tolerance to a finished sample set.
    ///
    /// Fails when the missed fraction exceeds `max_miss_fraction`; otherwise a
    /// run with any misses is flagged as degraded.
    fn check_misses(&self, samples: &TipSampleSet) -> RigResult<()> {
        let total = samples.len();
        let missed = samples.missed();
        if samples.is_empty() || missed == 0 {
            return Ok(());
        }
        let fraction = missed as f64 / total as f64;
        if fraction > self.config.max_miss_fraction {
            return Err(RigError::CalibrationFailed {
                reason: format!(
                    "tip not found in {missed} of {total} samples (tolerance {:.0}%)",
                    self.config.max_miss_fraction * 100.0
                ),
            });
        }
        warn!(missed, total, "calibration degraded by missed localizations");
        self.events
            .emit(ProgressEvent::CalibrationDegraded { missed, total });
        Ok(())
    }
}
