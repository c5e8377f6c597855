//! End-to-end calibration runs against the synthetic rig.

use std::sync::Arc;

use approx::assert_relative_eq;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use smartpatch::calibration::{CalibrationMode, CalibrationResult, CoordinateCalibrator};
use smartpatch::cancel::CancellationToken;
use smartpatch::config::CalibrationConfig;
use smartpatch::error::{ErrorKind, HardwareError, RigError};
use smartpatch::events::{ProgressEvent, ProgressSender, RunResult};
use smartpatch::geometry::{PixelPoint, Pose};
use smartpatch::hardware::mock::{
    rotated_tip_model, MockCamera, MockManipulator, MockRig, SyntheticLocalizer,
};
use smartpatch::hardware::{HardwareResult, Motion, Rig};
use smartpatch::pipette::PipetteGeometry;
use smartpatch::storage::JsonResultsStore;

fn pipette() -> PipetteGeometry {
    PipetteGeometry::new(16.0, 0.0).unwrap()
}

fn drain(rx: &mut UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn hard(
    mock: &MockRig,
    config: CalibrationConfig,
    mode: CalibrationMode,
) -> Result<CalibrationResult, RigError> {
    let calibrator = CoordinateCalibrator::new(mock.rig(), config)?;
    let outcome = calibrator
        .hard_calibrate(mode, pipette(), &CancellationToken::new())
        .await?;
    Ok(outcome.completed().expect("run was not cancelled"))
}

#[tokio::test]
async fn aligned_rig_yields_scaled_identity_and_zero_gamma() {
    let mock = MockRig::at(Pose::default());
    let (events, mut rx) = ProgressSender::channel();
    let calibrator = CoordinateCalibrator::new(mock.rig(), CalibrationConfig::default())
        .unwrap()
        .with_events(events);

    let outcome = calibrator
        .hard_calibrate(CalibrationMode::Xy, pipette(), &CancellationToken::new())
        .await
        .unwrap();

    let Some(CalibrationResult::Xy { gamma, frame }) = outcome.completed() else {
        panic!("expected an XY result");
    };
    assert_relative_eq!(gamma, 0.0, epsilon = 1e-12);
    let e = frame.matrix();
    assert_relative_eq!(e[(0, 0)], 10.0, epsilon = 1e-9);
    assert_relative_eq!(e[(0, 1)], 0.0, epsilon = 1e-9);
    assert_relative_eq!(e[(1, 0)], 0.0, epsilon = 1e-9);
    assert_relative_eq!(e[(1, 1)], 10.0, epsilon = 1e-9);
    assert_eq!(mock.manipulator.position().await.unwrap(), Pose::default());

    let events = drain(&mut rx);
    let sampled = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::TipSampled { .. }))
        .count();
    assert_eq!(sampled, 14);
    assert!(matches!(
        events[events.len() - 2],
        ProgressEvent::AngleComputed(_)
    ));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Completed(RunResult::Calibration(
            CalibrationResult::Xy { .. }
        )))
    ));
}

#[tokio::test]
async fn sweep_events_follow_sample_order() {
    let mock = MockRig::at(Pose::default());
    let (events, mut rx) = ProgressSender::channel();
    let calibrator = CoordinateCalibrator::new(mock.rig(), CalibrationConfig::default())
        .unwrap()
        .with_events(events);
    calibrator
        .hard_calibrate(CalibrationMode::Xy, pipette(), &CancellationToken::new())
        .await
        .unwrap();

    let poses: Vec<Pose> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::TipSampled { pose, .. } => Some(pose),
            _ => None,
        })
        .collect();
    assert_eq!(poses[0], Pose::new(-75.0, 0.0, 0.0));
    assert_eq!(poses[6], Pose::new(75.0, 0.0, 0.0));
    assert_eq!(poses[7], Pose::new(0.0, -75.0, 0.0));
    assert_eq!(poses[13], Pose::new(0.0, 75.0, 0.0));
}

#[tokio::test]
async fn rotated_camera_recovers_gamma_for_any_step() {
    for theta in [-0.8_f64, -0.1, 0.25, 1.2] {
        for step in [5.0, 25.0, 40.0] {
            let mock = MockRig::at(Pose::new(10.0, -20.0, 0.0)).with_localizer(|l| {
                l.with_tip_model(rotated_tip_model(PixelPoint::new(512.0, 512.0), 10.0, theta))
            });
            let config = CalibrationConfig {
                step_size_um: step,
                ..CalibrationConfig::default()
            };

            let result = hard(&mock, config, CalibrationMode::Xy).await.unwrap();
            let CalibrationResult::Xy { gamma, .. } = result else {
                panic!("expected an XY result");
            };
            assert_relative_eq!(gamma, theta, epsilon = 1e-9);
        }
    }
}

#[tokio::test]
async fn applying_the_correction_aligns_the_sweep() {
    let theta = 0.3;
    let mock = MockRig::at(Pose::default()).with_localizer(|l| {
        l.with_tip_model(rotated_tip_model(PixelPoint::new(1000.0, 1000.0), 10.0, theta))
    });

    let first = hard(&mock, CalibrationConfig::default(), CalibrationMode::Xy)
        .await
        .unwrap();
    let config = CalibrationConfig {
        rotation_correction: first.rotation_correction().unwrap(),
        ..CalibrationConfig::default()
    };
    let second = hard(&mock, config, CalibrationMode::Xy).await.unwrap();

    let CalibrationResult::Xy { gamma, frame } = second else {
        panic!("expected an XY result");
    };
    assert_relative_eq!(gamma, 0.0, epsilon = 1e-9);
    assert_relative_eq!(frame.matrix()[(0, 0)], 10.0, epsilon = 1e-9);
    assert_relative_eq!(frame.matrix()[(1, 1)], 10.0, epsilon = 1e-9);
}

#[tokio::test]
async fn xyz_reports_negated_tilt() {
    let tilt = 0.1_f64;
    let mock = MockRig::at(Pose::default()).with_localizer(|l| {
        l.with_tip_model(move |p: Pose| {
            Some(PixelPoint::new(
                1000.0 + 10.0 * p.x,
                1000.0 + 10.0 * p.y + 10.0 * tilt.sin() * p.z,
            ))
        })
    });

    let result = hard(&mock, CalibrationConfig::default(), CalibrationMode::Xyz)
        .await
        .unwrap();
    let CalibrationResult::Xyz { correction, frame } = result else {
        panic!("expected an XYZ result");
    };
    assert_relative_eq!(correction.alpha, -tilt, epsilon = 1e-9);
    assert_relative_eq!(correction.beta, 0.0, epsilon = 1e-9);
    assert_relative_eq!(correction.gamma, 0.0, epsilon = 1e-9);
    assert_relative_eq!(frame.matrix()[(2, 1)], 10.0 * tilt.sin(), epsilon = 1e-9);
    assert_eq!(mock.manipulator.position().await.unwrap(), Pose::default());
}

#[tokio::test]
async fn xyz_recovers_all_three_angles_of_a_rotated_tilted_rig() {
    let (alpha, beta, gamma) = (0.05_f64, -0.08_f64, 0.2_f64);
    // z row of the rotation frame, per micron of in-plane travel.
    let ezx = alpha.sin() * gamma.sin() - beta.sin() * alpha.cos() * gamma.cos();
    let ezy = alpha.sin() * gamma.cos() + beta.sin() * alpha.cos() * gamma.sin();
    let in_plane = rotated_tip_model(PixelPoint::new(1000.0, 1000.0), 10.0, gamma);
    let mock = MockRig::at(Pose::new(5.0, -5.0, 20.0)).with_localizer(|l| {
        l.with_tip_model(move |p: Pose| {
            in_plane(p).map(|tip| {
                PixelPoint::new(tip.x + 10.0 * ezx * p.z, tip.y + 10.0 * ezy * p.z)
            })
        })
    });

    let result = hard(&mock, CalibrationConfig::default(), CalibrationMode::Xyz)
        .await
        .unwrap();

    let CalibrationResult::Xyz { correction, frame } = result else {
        panic!("expected an XYZ result");
    };
    assert_relative_eq!(frame.matrix()[(2, 0)], 10.0 * ezx, epsilon = 1e-9);
    assert_relative_eq!(frame.matrix()[(2, 1)], 10.0 * ezy, epsilon = 1e-9);
    assert_relative_eq!(correction.alpha, -alpha, epsilon = 1e-9);
    assert_relative_eq!(correction.beta, -beta, epsilon = 1e-9);
    assert_relative_eq!(correction.gamma, -gamma, epsilon = 1e-9);
    assert_eq!(
        mock.manipulator.position().await.unwrap(),
        Pose::new(5.0, -5.0, 20.0)
    );
}

#[tokio::test]
async fn pixel_size_recovers_known_ratio() {
    let mock = MockRig::at(Pose::default());
    let result = hard(&mock, CalibrationConfig::default(), CalibrationMode::PixelSize)
        .await
        .unwrap();

    let CalibrationResult::PixelSize {
        mean_um_per_px,
        variance,
        samples,
    } = result
    else {
        panic!("expected a pixel size result");
    };
    assert_relative_eq!(mean_um_per_px, 0.1, epsilon = 1e-12);
    assert_relative_eq!(variance, 0.0, epsilon = 1e-12);
    assert_eq!(samples, 12);
}

#[tokio::test]
async fn pixel_size_with_detection_noise_stays_close() {
    let mock = MockRig::at(Pose::default()).with_localizer(|l| l.with_pixel_noise(0.5, 11));
    let result = hard(&mock, CalibrationConfig::default(), CalibrationMode::PixelSize)
        .await
        .unwrap();

    let CalibrationResult::PixelSize {
        mean_um_per_px,
        variance,
        ..
    } = result
    else {
        panic!("expected a pixel size result");
    };
    assert_relative_eq!(mean_um_per_px, 0.1, epsilon = 1e-3);
    assert!(variance < 1e-5, "variance = {variance}");
}

fn missing_beyond_x(limit: f64) -> impl Fn(Pose) -> Option<PixelPoint> + Send + Sync + 'static {
    move |p: Pose| {
        (p.x <= limit).then(|| PixelPoint::new(1000.0 + 10.0 * p.x, 1000.0 + 10.0 * p.y))
    }
}

#[tokio::test]
async fn misses_beyond_tolerance_fail_and_restore_pose() {
    let start = Pose::new(0.0, 0.0, 12.0);
    let mock = MockRig::at(start).with_localizer(|l| l.with_tip_model(missing_beyond_x(50.0)));
    let (events, mut rx) = ProgressSender::channel();
    let calibrator = CoordinateCalibrator::new(mock.rig(), CalibrationConfig::default())
        .unwrap()
        .with_events(events);

    let result = calibrator
        .hard_calibrate(CalibrationMode::Xy, pipette(), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(RigError::CalibrationFailed { .. })));
    assert_eq!(mock.manipulator.position().await.unwrap(), start);
    let events = drain(&mut rx);
    assert!(events.contains(&ProgressEvent::TipMissed {
        pose: Pose::new(75.0, 0.0, 12.0)
    }));
    assert_eq!(
        events.last(),
        Some(&ProgressEvent::Failed(ErrorKind::CalibrationFailed))
    );
}

#[tokio::test]
async fn tolerated_misses_degrade_without_skewing_the_frame() {
    let mock = MockRig::at(Pose::default()).with_localizer(|l| l.with_tip_model(missing_beyond_x(50.0)));
    let config = CalibrationConfig {
        max_miss_fraction: 0.1,
        ..CalibrationConfig::default()
    };
    let (events, mut rx) = ProgressSender::channel();
    let calibrator = CoordinateCalibrator::new(mock.rig(), config)
        .unwrap()
        .with_events(events);

    let result = calibrator
        .hard_calibrate(CalibrationMode::Xy, pipette(), &CancellationToken::new())
        .await
        .unwrap()
        .completed()
        .unwrap();

    let CalibrationResult::Xy { frame, .. } = result else {
        panic!("expected an XY result");
    };
    assert_relative_eq!(frame.matrix()[(0, 0)], 10.0, epsilon = 1e-9);
    assert!(drain(&mut rx).contains(&ProgressEvent::CalibrationDegraded {
        missed: 1,
        total: 14
    }));
}

fn limited_rig(start: Pose, half_range: f64) -> MockRig {
    let manipulator = MockManipulator::at(start).with_limits(
        Pose::new(-half_range, -half_range, -half_range),
        Pose::new(half_range, half_range, half_range),
    );
    let camera = MockCamera::new(manipulator.clone(), 64, 48);
    let localizer = SyntheticLocalizer::new(camera.log());
    MockRig::from_parts(manipulator, camera, localizer)
}

#[tokio::test]
async fn unreachable_target_is_propagated_and_pose_restored() {
    let start = Pose::new(1.0, 2.0, 3.0);
    let mock = limited_rig(start, 50.0);

    let result = hard(&mock, CalibrationConfig::default(), CalibrationMode::Xy).await;

    assert!(matches!(
        result,
        Err(RigError::Hardware(HardwareError::MotionOutOfRange { .. }))
    ));
    assert_eq!(mock.manipulator.position().await.unwrap(), start);
}

#[tokio::test]
async fn capture_fault_is_not_retried() {
    let manipulator = MockManipulator::at(Pose::default());
    let camera = MockCamera::new(manipulator.clone(), 64, 48).failing_on_capture(5);
    let localizer = SyntheticLocalizer::new(camera.log());
    let mock = MockRig::from_parts(manipulator, camera, localizer);

    let result = hard(&mock, CalibrationConfig::default(), CalibrationMode::Xy).await;

    assert!(matches!(
        result,
        Err(RigError::Hardware(HardwareError::Capture(_)))
    ));
    assert_eq!(mock.camera.frame_count(), 5);
    assert_eq!(mock.manipulator.position().await.unwrap(), Pose::default());
}

#[tokio::test]
async fn invalid_config_fails_before_any_motion() {
    let mock = MockRig::at(Pose::default());
    let config = CalibrationConfig {
        step_size_um: 0.0,
        ..CalibrationConfig::default()
    };

    let result = CoordinateCalibrator::new(mock.rig(), config);

    assert!(matches!(result, Err(RigError::Configuration(_))));
    assert_eq!(mock.manipulator.move_count(), 0);
}

#[tokio::test]
async fn hard_calibration_cancel_restores_pose() {
    let start = Pose::new(4.0, 4.0, 4.0);
    let mock = MockRig::at(start);
    let cancel = CancellationToken::new();
    let motion = CancelAfter {
        inner: mock.manipulator.clone(),
        token: cancel.clone(),
        after: 5,
    };
    let rig = Rig::new(
        Arc::new(motion),
        Arc::new(mock.camera.clone()),
        Arc::new(mock.localizer.clone()),
    );
    let calibrator = CoordinateCalibrator::new(rig, CalibrationConfig::default()).unwrap();

    let outcome = calibrator
        .hard_calibrate(CalibrationMode::Xyz, pipette(), &cancel)
        .await
        .unwrap();

    assert!(outcome.is_cancelled());
    assert_eq!(mock.manipulator.position().await.unwrap(), start);
}

#[tokio::test]
async fn raw_samples_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonResultsStore::new(dir.path()).unwrap());
    let mock = MockRig::at(Pose::default());
    let calibrator = CoordinateCalibrator::new(mock.rig(), CalibrationConfig::default())
        .unwrap()
        .with_store(store);

    calibrator
        .hard_calibrate(CalibrationMode::PixelSize, pipette(), &CancellationToken::new())
        .await
        .unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("hardcalibration_pixelsize_"));
}

#[tokio::test]
async fn failed_calibration_writes_no_sample_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonResultsStore::new(dir.path()).unwrap());
    let mock = MockRig::at(Pose::default()).with_localizer(|l| l.with_tip_model(missing_beyond_x(50.0)));
    let calibrator = CoordinateCalibrator::new(mock.rig(), CalibrationConfig::default())
        .unwrap()
        .with_store(store);

    let hard = calibrator
        .hard_calibrate(CalibrationMode::Xy, pipette(), &CancellationToken::new())
        .await;
    let soft = calibrator
        .soft_calibrate(
            pipette(),
            PixelPoint::default(),
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(hard, Err(RigError::CalibrationFailed { .. })));
    assert!(matches!(soft, Err(RigError::CalibrationFailed { .. })));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn hard_calibration_cancelled_during_last_sample_is_cancelled() {
    let start = Pose::new(4.0, 4.0, 4.0);
    let mock = MockRig::at(start);
    let cancel = CancellationToken::new();
    // Fourteen samples of two moves each; the last sample's second move.
    let motion = CancelAfter {
        inner: mock.manipulator.clone(),
        token: cancel.clone(),
        after: 28,
    };
    let rig = Rig::new(
        Arc::new(motion),
        Arc::new(mock.camera.clone()),
        Arc::new(mock.localizer.clone()),
    );
    let (events, mut rx) = ProgressSender::channel();
    let calibrator = CoordinateCalibrator::new(rig, CalibrationConfig::default())
        .unwrap()
        .with_events(events);

    let outcome = calibrator
        .hard_calibrate(CalibrationMode::Xy, pipette(), &cancel)
        .await
        .unwrap();

    assert!(outcome.is_cancelled());
    assert_eq!(mock.manipulator.position().await.unwrap(), start);
    let events = drain(&mut rx);
    assert!(!events
        .iter()
        .any(|e| matches!(e, ProgressEvent::AngleComputed(_))));
    assert_eq!(events.last(), Some(&ProgressEvent::Cancelled));
}

/// Motion wrapper that requests cancellation once `after` moves were issued.
struct CancelAfter {
    inner: MockManipulator,
    token: CancellationToken,
    after: usize,
}

#[async_trait]
impl Motion for CancelAfter {
    async fn position(&self) -> HardwareResult<Pose> {
        self.inner.position().await
    }

    async fn move_absolute(&self, target: Pose) -> HardwareResult<()> {
        let moved = self.inner.move_absolute(target).await;
        if self.inner.move_count() >= self.after {
            self.token.cancel();
        }
        moved
    }
}

#[tokio::test]
async fn soft_calibration_cancelled_anywhere_ends_at_reference() {
    let reference = Pose::new(3.0, 4.0, 5.0);
    // Six samples take two moves each; the thirteenth move is the return.
    for after in 1..=13 {
        let mock = MockRig::at(reference);
        let cancel = CancellationToken::new();
        let motion = CancelAfter {
            inner: mock.manipulator.clone(),
            token: cancel.clone(),
            after,
        };
        let rig = Rig::new(
            Arc::new(motion),
            Arc::new(mock.camera.clone()),
            Arc::new(mock.localizer.clone()),
        );
        let (events, mut rx) = ProgressSender::channel();
        let calibrator = CoordinateCalibrator::new(rig, CalibrationConfig::default())
            .unwrap()
            .with_events(events);

        let outcome = calibrator
            .soft_calibrate(pipette(), PixelPoint::default(), &cancel)
            .await
            .unwrap();

        assert_eq!(
            mock.manipulator.position().await.unwrap(),
            reference,
            "cancelled after move {after}"
        );
        if after <= 12 {
            let smartpatch::events::Outcome::Cancelled { partial } = outcome else {
                panic!("run after move {after} should be cancelled");
            };
            let Some(CalibrationResult::SoftPair { samples, reference: paired, .. }) = partial
            else {
                panic!("cancelled run should carry a partial pair");
            };
            assert_eq!(samples, (after + 1) / 2);
            assert_eq!(paired, reference);
            assert_eq!(drain(&mut rx).last(), Some(&ProgressEvent::Cancelled));
        } else {
            assert!(!outcome.is_cancelled());
        }
    }
}
