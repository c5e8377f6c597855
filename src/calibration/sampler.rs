//! Parallax image pairs and two-pass tip localization.
//!
//! At every sampled pose two frames are captured with a small lateral offset
//! between them, so the tip stands out from the static background. A coarse
//! localization seeds a Gaussian mask; the masked pair is localized again with a
//! slightly larger expected diameter.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CalibrationConfig;
use crate::error::RigResult;
use crate::geometry::{PixelPoint, Pose};
use crate::hardware::Rig;
use crate::pipette::PipetteGeometry;

/// Coarse and refined tip estimates for one pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TipSample {
    /// First pass over the unmasked pair.
    pub primary: PixelPoint,
    /// Second pass over the masked pair.
    pub refined: PixelPoint,
}

/// Per-sample localization outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TipObservation {
    /// Both localization passes found the tip.
    Found(TipSample),
    /// Either pass came back empty.
    Missed,
}

impl TipObservation {
    /// Refined tip pixel of a found sample.
    pub fn refined(&self) -> Option<PixelPoint> {
        match self {
            TipObservation::Found(sample) => Some(sample.refined),
            TipObservation::Missed => None,
        }
    }
}

/// One persisted sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Commanded pose before the parallax offset.
    pub pose: Pose,
    /// Swept axis for hard calibration samples.
    pub axis: Option<usize>,
    /// What the localizer reported.
    pub observation: TipObservation,
}

/// Raw samples of a run, in the order they were taken.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TipSampleSet {
    /// Samples in acquisition order.
    pub records: Vec<SampleRecord>,
}

impl TipSampleSet {
    /// Append one sample.
    pub fn record(&mut self, pose: Pose, axis: Option<usize>, observation: TipObservation) {
        self.records.push(SampleRecord {
            pose,
            axis,
            observation,
        });
    }

    /// Append a found sample without a swept axis.
    pub fn record_found(&mut self, pose: Pose, primary: PixelPoint, refined: PixelPoint) {
        self.record(
            pose,
            None,
            TipObservation::Found(TipSample { primary, refined }),
        );
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True before the first sample.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of samples without a tip.
    pub fn missed(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.observation == TipObservation::Missed)
            .count()
    }

    /// Refined points of every found sample.
    pub fn found_points(&self) -> Vec<PixelPoint> {
        self.records
            .iter()
            .filter_map(|r| r.observation.refined())
            .collect()
    }
}

/// Drives one capture-and-localize round-trip.
pub struct TipSampler<'a> {
    rig: &'a Rig,
    config: &'a CalibrationConfig,
    pipette: PipetteGeometry,
}

impl<'a> TipSampler<'a> {
    /// Sampler borrowing `rig` for the length of one run.
    pub fn new(rig: &'a Rig, config: &'a CalibrationConfig, pipette: PipetteGeometry) -> Self {
        Self {
            rig,
            config,
            pipette,
        }
    }

    /// Move to `target`, capture the parallax pair and localize the tip.
    pub async fn sample_at(&self, target: Pose) -> RigResult<TipObservation> {
        self.rig.motion.move_absolute(target).await?;
        let image_a = self.rig.imaging.capture().await?;
        self.rig
            .motion
            .move_relative(Pose::along(0, self.config.parallax_offset_um))
            .await?;
        let image_b = self.rig.imaging.capture().await?;

        let diameter = self.pipette.diameter();
        let orientation = self.pipette.orientation();
        let Some(primary) =
            self.rig
                .localizer
                .locate_tip(&image_a, &image_b, diameter, orientation)
        else {
            debug!(%target, "coarse localization missed");
            return Ok(TipObservation::Missed);
        };

        let mask = image_a.gaussian_mask(primary, image_a.mask_sigma(self.config.mask_sigma_divisor));
        let refined = self.rig.localizer.locate_tip(
            &image_a.masked(&mask),
            &image_b.masked(&mask),
            diameter * self.config.refine_diameter_factor,
            orientation,
        );

        match refined {
            Some(refined) => {
                debug!(%target, %primary, %refined, "tip localized");
                Ok(TipObservation::Found(TipSample { primary, refined }))
            }
            None => {
                debug!(%target, %primary, "refined localization missed");
                Ok(TipObservation::Missed)
            }
        }
    }
}
