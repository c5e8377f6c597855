//! Soft calibration: pair the reference pose with the averaged tip pixel.

use tracing::info;

use super::{CalibrationResult, CoordinateCalibrator, TipSampleSet, TipSampler};
use crate::cancel::{completion, CancellationToken, Halt};
use crate::error::{RigError, RigResult};
use crate::events::{Outcome, ProgressEvent};
use crate::geometry::{PixelPoint, Pose};
use crate::guard::restore_reference;
use crate::pipette::PipetteGeometry;

impl CoordinateCalibrator {
    /// Sample the tip at each configured soft offset and average the hits.
    ///
    /// `bias` is added to the averaged pixel; [`CalibrationConfig::soft_bias`]
    /// holds the configured default. A cancelled run reports the average of
    /// whatever was found so far as its partial result.
    ///
    /// [`CalibrationConfig::soft_bias`]: crate::config::CalibrationConfig::soft_bias
    pub async fn soft_calibrate(
        &self,
        pipette: PipetteGeometry,
        bias: PixelPoint,
        cancel: &CancellationToken,
    ) -> RigResult<Outcome<CalibrationResult>> {
        let result = self.run_soft(pipette, bias, cancel).await;
        self.events.finish(&result);
        result
    }

    async fn run_soft(
        &self,
        pipette: PipetteGeometry,
        bias: PixelPoint,
        cancel: &CancellationToken,
    ) -> RigResult<Outcome<CalibrationResult>> {
        let motion = self.rig.motion.as_ref();
        let reference = motion.position().await?;
        info!(%reference, offsets = self.config.soft_offsets_um.len(), "starting soft calibration");

        let mut samples = TipSampleSet::default();
        let sampled = self.sample_pattern(pipette, reference, cancel, &mut samples).await;
        let completed = restore_reference(motion, reference, completion(sampled)).await?;

        let paired = pair(reference, &samples, bias);
        if !completed {
            self.store.save_tip_samples("softcalibration", &samples)?;
            info!(samples = samples.len(), "soft calibration cancelled");
            return Ok(Outcome::Cancelled { partial: paired });
        }

        self.check_misses(&samples)?;
        let result = paired.ok_or_else(|| RigError::CalibrationFailed {
            reason: "tip not found at any soft calibration offset".to_string(),
        })?;
        self.store.save_tip_samples("softcalibration", &samples)?;
        info!(?result, "soft calibration finished");
        Ok(Outcome::Completed(result))
    }

    async fn sample_pattern(
        &self,
        pipette: PipetteGeometry,
        reference: Pose,
        cancel: &CancellationToken,
        samples: &mut TipSampleSet,
    ) -> Result<(), Halt> {
        let sampler = TipSampler::new(&self.rig, &self.config, pipette);
        let correction = self.config.rotation_correction;

        cancel.checkpoint()?;
        for offset in self.config.soft_offsets() {
            let target = correction.compensate(reference, reference + offset);
            let observation = sampler.sample_at(target).await?;
            samples.record(target, None, observation);
            match observation.refined() {
                Some(point) => self
                    .events
                    .emit(ProgressEvent::TipSampled { pose: target, point }),
                None => self.events.emit(ProgressEvent::TipMissed { pose: target }),
            }
            cancel.checkpoint()?;
        }
        Ok(())
    }
}

fn pair(reference: Pose, samples: &TipSampleSet, bias: PixelPoint) -> Option<CalibrationResult> {
    let points = samples.found_points();
    let mean = PixelPoint::mean(&points)?;
    Some(CalibrationResult::SoftPair {
        reference,
        tip: mean.offset(bias),
        samples: points.len(),
    })
}
