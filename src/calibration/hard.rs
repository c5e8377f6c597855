//! Hard calibration: axis sweeps and their reduction to angles or pixel size.

use nalgebra::Matrix3;
use tracing::{info, warn};

use super::{CalibrationMode, CalibrationResult, CoordinateCalibrator, TipSampleSet, TipSampler};
use crate::cancel::{completion, CancellationToken, Halt};
use crate::error::{RigError, RigResult};
use crate::events::{Outcome, ProgressEvent};
use crate::geometry::{PixelPoint, Pose, RotationAngles, RotationFrame};
use crate::guard::restore_reference;
use crate::pipette::PipetteGeometry;

/// Targets and refined tip points along one swept manipulator axis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AxisSweep {
    /// Swept manipulator axis, 0 to 2 for x, y, z.
    pub axis: usize,
    /// Commanded poses in sweep order.
    pub targets: Vec<Pose>,
    /// `None` where the tip was missed.
    pub points: Vec<Option<PixelPoint>>,
}

impl AxisSweep {
    /// Empty sweep along `axis`.
    pub fn new(axis: usize) -> Self {
        Self {
            axis,
            ..Self::default()
        }
    }

    /// Record the outcome at `target`.
    pub fn push(&mut self, target: Pose, point: Option<PixelPoint>) {
        self.targets.push(target);
        self.points.push(point);
    }

    /// Pixel displacement between neighbouring samples where both were found.
    fn consecutive_pairs(&self) -> impl Iterator<Item = (usize, PixelPoint, PixelPoint)> + '_ {
        self.points
            .windows(2)
            .enumerate()
            .filter_map(|(j, pair)| match (pair[0], pair[1]) {
                (Some(a), Some(b)) => Some((j, a, b)),
                _ => None,
            })
    }
}

/// Offsets from the reference, evenly spaced by `step` and centred on zero.
pub(crate) fn sweep_offsets(step: f64, points: usize) -> Vec<f64> {
    let half_span = (points as f64 - 1.0) / 2.0;
    (0..points)
        .map(|j| (j as f64 - half_span) * step)
        .collect()
}

/// Mean pixel displacement per micron of manipulator travel, one row per swept axis.
///
/// Pairs with a missed neighbour are skipped. An axis without any usable pair
/// fails the calibration.
pub fn rotation_frame(sweeps: &[AxisSweep], step: f64) -> RigResult<RotationFrame> {
    let mut e = Matrix3::zeros();
    for sweep in sweeps {
        let (mut sum_x, mut sum_y, mut n) = (0.0, 0.0, 0usize);
        for (_, a, b) in sweep.consecutive_pairs() {
            sum_x += b.x - a.x;
            sum_y += b.y - a.y;
            n += 1;
        }
        if n == 0 {
            return Err(RigError::CalibrationFailed {
                reason: format!("no consecutive tip pair along axis {}", sweep.axis),
            });
        }
        e[(sweep.axis, 0)] = sum_x / n as f64 / step;
        e[(sweep.axis, 1)] = sum_y / n as f64 / step;
    }
    Ok(RotationFrame(e))
}

/// Microns-per-pixel samples from the x and y sweeps: `(mean, variance, count)`.
///
/// Each sample divides the absolute real displacement along the swept axis by
/// the absolute pixel displacement along the matching camera axis. The variance
/// is the population variance.
pub fn pixel_size_estimate(sweeps: &[AxisSweep]) -> RigResult<(f64, f64, usize)> {
    let mut samples = Vec::new();
    for sweep in sweeps.iter().filter(|s| s.axis < 2) {
        for (j, a, b) in sweep.consecutive_pairs() {
            let real = (sweep.targets[j + 1].axis(sweep.axis) - sweep.targets[j].axis(sweep.axis))
                .abs();
            let pixels = if sweep.axis == 0 {
                (b.x - a.x).abs()
            } else {
                (b.y - a.y).abs()
            };
            if pixels <= f64::EPSILON {
                warn!(axis = sweep.axis, index = j, "tip did not move between samples");
                continue;
            }
            samples.push(real / pixels);
        }
    }
    if samples.is_empty() {
        return Err(RigError::CalibrationFailed {
            reason: "no usable displacement pairs for pixel size".to_string(),
        });
    }

    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    Ok((mean, variance, samples.len()))
}

impl CoordinateCalibrator {
    /// Sweep the manipulator and estimate rotation angles or pixel size.
    ///
    /// Every active axis is sampled at `sweep_points` poses spaced by
    /// `step_size_um` around the current pose. The manipulator is returned to
    /// that pose afterwards, also on error and cancellation.
    pub async fn hard_calibrate(
        &self,
        mode: CalibrationMode,
        pipette: PipetteGeometry,
        cancel: &CancellationToken,
    ) -> RigResult<Outcome<CalibrationResult>> {
        let result = self.run_hard(mode, pipette, cancel).await;
        self.events.finish(&result);
        result
    }

    async fn run_hard(
        &self,
        mode: CalibrationMode,
        pipette: PipetteGeometry,
        cancel: &CancellationToken,
    ) -> RigResult<Outcome<CalibrationResult>> {
        let motion = self.rig.motion.as_ref();
        let reference = motion.position().await?;
        info!(%mode, %reference, step = self.config.step_size_um, "starting hard calibration");

        let mut samples = TipSampleSet::default();
        let mut sweeps = Vec::new();
        let swept = self
            .sweep_axes(mode, pipette, reference, cancel, &mut samples, &mut sweeps)
            .await;
        let completed = restore_reference(motion, reference, completion(swept)).await?;
        let name = format!("hardcalibration_{mode}");

        if !completed {
            self.store.save_tip_samples(&name, &samples)?;
            info!(samples = samples.len(), "hard calibration cancelled");
            return Ok(Outcome::Cancelled { partial: None });
        }

        self.check_misses(&samples)?;
        let result = self.reduce(mode, &sweeps)?;
        self.store.save_tip_samples(&name, &samples)?;
        info!(?result, "hard calibration finished");
        Ok(Outcome::Completed(result))
    }

    async fn sweep_axes(
        &self,
        mode: CalibrationMode,
        pipette: PipetteGeometry,
        reference: Pose,
        cancel: &CancellationToken,
        samples: &mut TipSampleSet,
        sweeps: &mut Vec<AxisSweep>,
    ) -> Result<(), Halt> {
        let sampler = TipSampler::new(&self.rig, &self.config, pipette);
        let offsets = sweep_offsets(self.config.step_size_um, self.config.sweep_points);
        let correction = self.config.rotation_correction;

        cancel.checkpoint()?;
        for axis in mode.axes() {
            let mut sweep = AxisSweep::new(axis);
            for offset in &offsets {
                let target = correction.compensate(reference, reference + Pose::along(axis, *offset));
                let observation = sampler.sample_at(target).await?;
                samples.record(target, Some(axis), observation);

                let point = observation.refined();
                match point {
                    Some(point) => self
                        .events
                        .emit(ProgressEvent::TipSampled { pose: target, point }),
                    None => self.events.emit(ProgressEvent::TipMissed { pose: target }),
                }
                sweep.push(target, point);
                cancel.checkpoint()?;
            }
            sweeps.push(sweep);
        }
        Ok(())
    }

    fn reduce(&self, mode: CalibrationMode, sweeps: &[AxisSweep]) -> RigResult<CalibrationResult> {
        if mode == CalibrationMode::PixelSize {
            let (mean, variance, samples) = pixel_size_estimate(sweeps)?;
            info!(
                mean_um_per_px = mean,
                sd = variance.sqrt(),
                "pixel size estimate"
            );
            return Ok(CalibrationResult::PixelSize {
                mean_um_per_px: mean,
                variance,
                samples,
            });
        }

        let frame = rotation_frame(sweeps, self.config.step_size_um)?;
        if frame.in_plane_scale() <= f64::EPSILON {
            return Err(RigError::CalibrationFailed {
                reason: "tip did not move with the manipulator".to_string(),
            });
        }
        let angles = frame.angles();
        if mode == CalibrationMode::Xy {
            self.events
                .emit(ProgressEvent::AngleComputed(RotationAngles::new(0.0, 0.0, angles.gamma)));
            Ok(CalibrationResult::Xy {
                gamma: angles.gamma,
                frame,
            })
        } else {
            self.events.emit(ProgressEvent::AngleComputed(angles));
            Ok(CalibrationResult::Xyz {
                correction: angles.negated(),
                frame,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sweep(axis: usize, step: f64, px_per_um: (f64, f64)) -> AxisSweep {
        let mut sweep = AxisSweep::new(axis);
        for offset in sweep_offsets(step, 7) {
            let target = Pose::along(axis, offset);
            sweep.push(
                target,
                Some(PixelPoint::new(
                    500.0 + px_per_um.0 * offset,
                    500.0 + px_per_um.1 * offset,
                )),
            );
        }
        sweep
    }

    #[test]
    fn offsets_are_centred_and_evenly_spaced() {
        assert_eq!(
            sweep_offsets(25.0, 7),
            vec![-75.0, -50.0, -25.0, 0.0, 25.0, 50.0, 75.0]
        );
    }

    #[test]
    fn frame_rows_follow_swept_axes() {
        let sweeps = [sweep(0, 25.0, (10.0, 0.0)), sweep(1, 25.0, (0.0, 10.0))];
        let frame = rotation_frame(&sweeps, 25.0).unwrap();

        assert_relative_eq!(frame.matrix()[(0, 0)], 10.0, epsilon = 1e-12);
        assert_relative_eq!(frame.matrix()[(1, 1)], 10.0, epsilon = 1e-12);
        assert_eq!(frame.matrix()[(2, 2)], 0.0);
    }

    #[test]
    fn missed_points_are_skipped_not_interpolated() {
        let mut x = sweep(0, 25.0, (10.0, 0.0));
        x.points[3] = None;
        let frame = rotation_frame(&[x], 25.0).unwrap();
        assert_relative_eq!(frame.matrix()[(0, 0)], 10.0, epsilon = 1e-12);
    }

    #[test]
    fn axis_without_pairs_fails() {
        let mut x = sweep(0, 25.0, (10.0, 0.0));
        for point in x.points.iter_mut().skip(1).step_by(2) {
            *point = None;
        }
        assert!(matches!(
            rotation_frame(&[x], 25.0),
            Err(RigError::CalibrationFailed { .. })
        ));
    }

    #[test]
    fn pixel_size_of_known_ratio() {
        let sweeps = [sweep(0, 25.0, (4.0, 0.0)), sweep(1, 25.0, (0.0, -4.0))];
        let (mean, variance, count) = pixel_size_estimate(&sweeps).unwrap();
        assert_relative_eq!(mean, 0.25, epsilon = 1e-12);
        assert_relative_eq!(variance, 0.0, epsilon = 1e-12);
        assert_eq!(count, 12);
    }
}
