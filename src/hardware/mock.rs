//! Mock Hardware Implementations
//!
//! Provides a simulated rig for testing without physical hardware.
//!
//! # Available Mocks
//!
//! - `MockManipulator` - Three-axis manipulator with optional travel limits
//!   and one-shot fault injection
//! - `MockCamera` - Camera that stamps frame numbers and remembers the
//!   manipulator pose at every capture
//! - `SyntheticLocalizer` - Tip detector and focus scorer driven by model
//!   closures of the capture pose
//!
//! The localizer never looks at pixel data: it resolves a frame back to the
//! pose it was captured at through the shared [`CaptureLog`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::RwLock;
use tracing::debug;

use super::capabilities::{HardwareResult, Imaging, Motion, TipLocalizer};
use super::Rig;
use crate::error::HardwareError;
use crate::frame::Frame;
use crate::geometry::{PixelPoint, Pose};

// =============================================================================
// MockManipulator - Simulated Micromanipulator
// =============================================================================

/// Simulated micromanipulator.
///
/// Clones share the same state, so a test can keep a handle after passing
/// one into a [`Rig`].
///
/// # Example
///
/// ```rust,ignore
/// let manipulator = MockManipulator::at(Pose::new(0.0, 0.0, 0.0));
/// manipulator.move_absolute(Pose::new(10.0, 0.0, 0.0)).await?;
/// assert_eq!(manipulator.position().await?.x, 10.0);
/// ```
#[derive(Clone)]
pub struct MockManipulator {
    pose: Arc<RwLock<Pose>>,
    limits: Option<(Pose, Pose)>,
    moves: Arc<AtomicUsize>,
    fail_on_move: Option<usize>,
    history: Arc<RwLock<Vec<Pose>>>,
}

impl MockManipulator {
    /// Manipulator resting at `start`, without travel limits.
    pub fn at(start: Pose) -> Self {
        Self {
            pose: Arc::new(RwLock::new(start)),
            limits: None,
            moves: Arc::new(AtomicUsize::new(0)),
            fail_on_move: None,
            history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Reject targets outside the box spanned by `min` and `max`.
    pub fn with_limits(mut self, min: Pose, max: Pose) -> Self {
        self.limits = Some((min, max));
        self
    }

    /// Make the `n`-th move (1-based) fail with a motion fault, once.
    pub fn failing_on_move(mut self, n: usize) -> Self {
        self.fail_on_move = Some(n);
        self
    }

    /// Number of completed and attempted moves so far.
    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }

    /// Every target reached, in order.
    pub async fn history(&self) -> Vec<Pose> {
        self.history.read().await.clone()
    }

    fn within_limits(&self, target: Pose) -> bool {
        match self.limits {
            Some((min, max)) => (0..3).all(|axis| {
                let value = target.axis(axis);
                value >= min.axis(axis) && value <= max.axis(axis)
            }),
            None => true,
        }
    }
}

impl Default for MockManipulator {
    fn default() -> Self {
        Self::at(Pose::default())
    }
}

#[async_trait]
impl Motion for MockManipulator {
    async fn position(&self) -> HardwareResult<Pose> {
        Ok(*self.pose.read().await)
    }

    async fn move_absolute(&self, target: Pose) -> HardwareResult<()> {
        let attempt = self.moves.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_move == Some(attempt) {
            return Err(HardwareError::Motion(format!(
                "injected fault on move #{attempt}"
            )));
        }
        if !self.within_limits(target) {
            return Err(HardwareError::MotionOutOfRange { target });
        }

        *self.pose.write().await = target;
        self.history.write().await.push(target);
        debug!(%target, "MockManipulator: reached target");
        Ok(())
    }
}

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Frame number to manipulator pose at the moment of capture.
#[derive(Clone, Default)]
pub struct CaptureLog {
    poses: Arc<parking_lot::RwLock<HashMap<u64, Pose>>>,
}

impl CaptureLog {
    /// Pose at which `frame` was captured, if it came from this camera.
    pub fn pose_of(&self, frame: &Frame) -> Option<Pose> {
        self.poses.read().get(&frame.frame_number).copied()
    }

    fn record(&self, frame_number: u64, pose: Pose) {
        self.poses.write().insert(frame_number, pose);
    }
}

/// Simulated camera producing blank frames of a fixed resolution.
#[derive(Clone)]
pub struct MockCamera {
    manipulator: MockManipulator,
    resolution: (u32, u32),
    frame_counter: Arc<AtomicU64>,
    log: CaptureLog,
    fail_on_capture: Option<u64>,
}

impl MockCamera {
    /// Camera that reads its capture pose from `manipulator`.
    pub fn new(manipulator: MockManipulator, width: u32, height: u32) -> Self {
        Self {
            manipulator,
            resolution: (width, height),
            frame_counter: Arc::new(AtomicU64::new(0)),
            log: CaptureLog::default(),
            fail_on_capture: None,
        }
    }

    /// Make capture `n` (1-based) fail with a capture fault.
    pub fn failing_on_capture(mut self, n: u64) -> Self {
        self.fail_on_capture = Some(n);
        self
    }

    /// Shared capture log, for a [`SyntheticLocalizer`].
    pub fn log(&self) -> CaptureLog {
        self.log.clone()
    }

    /// Captures attempted so far, failed ones included.
    pub fn frame_count(&self) -> u64 {
        self.frame_counter.load(Ordering::SeqCst)
    }

    /// `(width, height)` of every frame.
    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }
}

#[async_trait]
impl Imaging for MockCamera {
    async fn capture(&self) -> HardwareResult<Frame> {
        let frame_number = self.frame_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_capture == Some(frame_number) {
            return Err(HardwareError::Capture(format!(
                "injected fault on frame #{frame_number}"
            )));
        }
        let pose = self.manipulator.position().await?;
        self.log.record(frame_number, pose);

        let (width, height) = self.resolution;
        Ok(Frame::blank(frame_number, width, height))
    }
}

// =============================================================================
// SyntheticLocalizer - Model-driven Tip Detection
// =============================================================================

type TipModel = Arc<dyn Fn(Pose) -> Option<PixelPoint> + Send + Sync>;
type SharpnessModel = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Tip detector and focus scorer evaluating closures of the capture pose.
///
/// Defaults: the tip sits at `(1000, 1000) + 10 * (x, y)` pixels and
/// sharpness peaks at `z = 0`.
#[derive(Clone)]
pub struct SyntheticLocalizer {
    log: CaptureLog,
    tip_model: TipModel,
    sharpness_model: SharpnessModel,
    noise: Option<(f64, Arc<parking_lot::Mutex<StdRng>>)>,
}

impl SyntheticLocalizer {
    /// Localizer with the default models, resolving frames through `log`.
    pub fn new(log: CaptureLog) -> Self {
        Self {
            log,
            tip_model: Arc::new(|pose: Pose| {
                Some(PixelPoint::new(1000.0 + 10.0 * pose.x, 1000.0 + 10.0 * pose.y))
            }),
            sharpness_model: Arc::new(|z: f64| -z * z),
            noise: None,
        }
    }

    /// Tip pixel as a function of the capture pose; `None` is a miss.
    pub fn with_tip_model<F>(mut self, model: F) -> Self
    where
        F: Fn(Pose) -> Option<PixelPoint> + Send + Sync + 'static,
    {
        self.tip_model = Arc::new(model);
        self
    }

    /// Sharpness as a function of the capture height.
    pub fn with_sharpness<F>(mut self, model: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        self.sharpness_model = Arc::new(model);
        self
    }

    /// Add uniform noise in `[-amplitude, amplitude]` pixels to every detection.
    pub fn with_pixel_noise(mut self, amplitude: f64, seed: u64) -> Self {
        self.noise = Some((
            amplitude,
            Arc::new(parking_lot::Mutex::new(StdRng::seed_from_u64(seed))),
        ));
        self
    }

    fn jitter(&self, point: PixelPoint) -> PixelPoint {
        match &self.noise {
            Some((amplitude, rng)) if *amplitude > 0.0 => {
                let mut rng = rng.lock();
                PixelPoint::new(
                    point.x + rng.gen_range(-amplitude..=*amplitude),
                    point.y + rng.gen_range(-amplitude..=*amplitude),
                )
            }
            _ => point,
        }
    }
}

/// Tip model of a camera rotated by `rotation` radians against the manipulator.
///
/// Manipulator x maps to `(cos, -sin)` and y to `(sin, cos)` in pixels, scaled
/// by `pixels_per_um` and offset by `origin`. z does not move the tip.
pub fn rotated_tip_model(
    origin: PixelPoint,
    pixels_per_um: f64,
    rotation: f64,
) -> impl Fn(Pose) -> Option<PixelPoint> + Send + Sync + Clone + 'static {
    let (sin, cos) = rotation.sin_cos();
    move |pose: Pose| {
        Some(PixelPoint::new(
            origin.x + pixels_per_um * (pose.x * cos + pose.y * sin),
            origin.y + pixels_per_um * (-pose.x * sin + pose.y * cos),
        ))
    }
}

impl TipLocalizer for SyntheticLocalizer {
    fn locate_tip(
        &self,
        image_a: &Frame,
        _image_b: &Frame,
        _diameter: f64,
        _orientation: f64,
    ) -> Option<PixelPoint> {
        let pose = self.log.pose_of(image_a)?;
        (self.tip_model)(pose).map(|point| self.jitter(point))
    }

    fn sharpness(&self, image: &Frame) -> f64 {
        match self.log.pose_of(image) {
            Some(pose) => (self.sharpness_model)(pose.z),
            None => 0.0,
        }
    }
}

// =============================================================================
// MockRig - Bundled Handles
// =============================================================================

/// Synthetic rig with handles kept for inspection after a run.
#[derive(Clone)]
pub struct MockRig {
    /// Shared with the rig's motion handle.
    pub manipulator: MockManipulator,
    /// Shared with the rig's imaging handle.
    pub camera: MockCamera,
    /// Copied into every [`rig`](Self::rig); configure it before building one.
    pub localizer: SyntheticLocalizer,
}

impl MockRig {
    /// Rig at `start` with a 64x48 camera and the default models.
    pub fn at(start: Pose) -> Self {
        let manipulator = MockManipulator::at(start);
        let camera = MockCamera::new(manipulator.clone(), 64, 48);
        let localizer = SyntheticLocalizer::new(camera.log());
        Self {
            manipulator,
            camera,
            localizer,
        }
    }

    /// Rig from separately configured mocks. `camera` and `localizer` should
    /// share a capture log and `camera` should observe `manipulator`.
    pub fn from_parts(
        manipulator: MockManipulator,
        camera: MockCamera,
        localizer: SyntheticLocalizer,
    ) -> Self {
        Self {
            manipulator,
            camera,
            localizer,
        }
    }

    /// Replace the localizer with `configure(localizer)`.
    pub fn with_localizer(
        mut self,
        configure: impl FnOnce(SyntheticLocalizer) -> SyntheticLocalizer,
    ) -> Self {
        self.localizer = configure(self.localizer);
        self
    }

    /// Capability handles backed by these mocks.
    pub fn rig(&self) -> Rig {
        Rig::new(
            Arc::new(self.manipulator.clone()),
            Arc::new(self.camera.clone()),
            Arc::new(self.localizer.clone()),
        )
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_manipulator_absolute_and_relative_moves() {
        let manipulator = MockManipulator::default();

        manipulator
            .move_absolute(Pose::new(10.0, 0.0, 0.0))
            .await
            .unwrap();
        manipulator.move_relative(Pose::along(2, 5.0)).await.unwrap();

        assert_eq!(
            manipulator.position().await.unwrap(),
            Pose::new(10.0, 0.0, 5.0)
        );
        assert_eq!(manipulator.history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_mock_manipulator_rejects_out_of_range_target() {
        let manipulator = MockManipulator::default()
            .with_limits(Pose::new(-50.0, -50.0, -50.0), Pose::new(50.0, 50.0, 50.0));

        let result = manipulator.move_absolute(Pose::new(75.0, 0.0, 0.0)).await;
        assert!(matches!(
            result,
            Err(HardwareError::MotionOutOfRange { .. })
        ));
        assert_eq!(manipulator.position().await.unwrap(), Pose::default());
    }

    #[tokio::test]
    async fn test_mock_manipulator_injected_fault_is_one_shot() {
        let manipulator = MockManipulator::default().failing_on_move(1);

        assert!(manipulator.move_absolute(Pose::along(0, 1.0)).await.is_err());
        assert!(manipulator.move_absolute(Pose::along(0, 1.0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_camera_log_maps_frames_to_poses() {
        let rig = MockRig::at(Pose::new(1.0, 2.0, 3.0));
        let frame = rig.camera.capture().await.unwrap();

        assert_eq!(frame.frame_number, 1);
        assert_eq!((frame.width, frame.height), rig.camera.resolution());
        assert_eq!(rig.camera.log().pose_of(&frame), Some(Pose::new(1.0, 2.0, 3.0)));
    }

    #[tokio::test]
    async fn test_synthetic_localizer_follows_capture_pose() {
        let rig = MockRig::at(Pose::new(5.0, -5.0, 0.0));
        let frame = rig.camera.capture().await.unwrap();

        let tip = rig.localizer.locate_tip(&frame, &frame, 10.0, 0.0).unwrap();
        assert_eq!(tip, PixelPoint::new(1050.0, 950.0));
    }

    #[test]
    fn test_unknown_frame_is_a_miss() {
        let localizer = SyntheticLocalizer::new(CaptureLog::default());
        let frame = Frame::blank(99, 4, 4);
        assert!(localizer.locate_tip(&frame, &frame, 10.0, 0.0).is_none());
        assert_eq!(localizer.sharpness(&frame), 0.0);
    }
}
