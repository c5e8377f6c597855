//! Coordinate types shared by the calibrator and the focus search.
//!
//! Manipulator coordinates are microns, camera coordinates are pixels. All
//! values are `Copy`; nothing here holds shared mutable state.

use std::fmt;
use std::ops::{Add, Sub};

use nalgebra::{Matrix3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// Absolute manipulator position in microns.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    /// Lateral axis swept first by hard calibration.
    pub x: f64,
    /// Second lateral axis.
    pub y: f64,
    /// Height; the focus search only moves along this axis.
    pub z: f64,
}

impl Pose {
    /// Pose at `(x, y, z)` microns.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Displacement of `distance` along a single axis (0 = x, 1 = y, 2 = z).
    pub fn along(axis: usize, distance: f64) -> Self {
        let mut pose = Self::default();
        match axis {
            0 => pose.x = distance,
            1 => pose.y = distance,
            _ => pose.z = distance,
        }
        pose
    }

    /// Same x and y, different height.
    pub fn with_z(self, z: f64) -> Self {
        Self { z, ..self }
    }

    /// Coordinate along axis 0, 1 or 2.
    pub fn axis(&self, axis: usize) -> f64 {
        match axis {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }

    /// Column vector `(x, y, z)`.
    pub fn to_vector(self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    /// Inverse of [`to_vector`](Self::to_vector).
    pub fn from_vector(v: &Vector3<f64>) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

impl Add for Pose {
    type Output = Pose;

    fn add(self, rhs: Pose) -> Pose {
        Pose::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Pose {
    type Output = Pose;

    fn sub(self, rhs: Pose) -> Pose {
        Pose::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2}) um", self.x, self.y, self.z)
    }
}

/// Image coordinates in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PixelPoint {
    /// Column, growing to the right.
    pub x: f64,
    /// Row, growing downward.
    pub y: f64,
}

impl PixelPoint {
    /// Point at column `x`, row `y`.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Shift by `bias` pixels.
    pub fn offset(self, bias: PixelPoint) -> Self {
        Self::new(self.x + bias.x, self.y + bias.y)
    }

    /// Component-wise mean, `None` for an empty slice.
    pub fn mean(points: &[PixelPoint]) -> Option<PixelPoint> {
        if points.is_empty() {
            return None;
        }
        let n = points.len() as f64;
        let (sx, sy) = points
            .iter()
            .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
        Some(PixelPoint::new(sx / n, sy / n))
    }
}

impl fmt::Display for PixelPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.1}, {:.1}) px", self.x, self.y)
    }
}

/// Passive rotation angles in radians.
///
/// `gamma` rotates about the camera z-axis, `alpha` about x and `beta` about y.
/// They are always derived in that order because alpha and beta depend on gamma.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RotationAngles {
    /// Tilt about x.
    pub alpha: f64,
    /// Tilt about y.
    pub beta: f64,
    /// In-plane rotation about z.
    pub gamma: f64,
}

impl RotationAngles {
    /// Angles in radians, in field order.
    pub const fn new(alpha: f64, beta: f64, gamma: f64) -> Self {
        Self { alpha, beta, gamma }
    }

    /// All three angles with the opposite sign.
    pub fn negated(self) -> Self {
        Self::new(-self.alpha, -self.beta, -self.gamma)
    }

    /// True when no angle is set.
    pub fn is_zero(&self) -> bool {
        self.alpha == 0.0 && self.beta == 0.0 && self.gamma == 0.0
    }

    /// `Rz(gamma) * Rx(alpha) * Ry(beta)`.
    pub fn rotation(&self) -> Rotation3<f64> {
        Rotation3::from_axis_angle(&Vector3::z_axis(), self.gamma)
            * Rotation3::from_axis_angle(&Vector3::x_axis(), self.alpha)
            * Rotation3::from_axis_angle(&Vector3::y_axis(), self.beta)
    }

    /// Applies the correction to a target given relative to `origin`.
    ///
    /// The angles act passively on the offset `target - origin` (the inverse of
    /// [`rotation`](Self::rotation)), which is then re-anchored at `origin`. With
    /// the correction from a calibration run the manipulator travels along
    /// camera axes instead of its own.
    pub fn compensate(&self, origin: Pose, target: Pose) -> Pose {
        if self.is_zero() {
            return target;
        }
        let offset = (target - origin).to_vector();
        origin + Pose::from_vector(&(self.rotation().inverse() * offset))
    }
}

impl fmt::Display for RotationAngles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "alpha={:.3} deg, beta={:.3} deg, gamma={:.3} deg",
            self.alpha.to_degrees(),
            self.beta.to_degrees(),
            self.gamma.to_degrees()
        )
    }
}

/// Observed pixel displacement per unit manipulator displacement.
///
/// Row `i` belongs to manipulator axis `i`, columns to camera axes. The camera
/// has no depth axis, so column 2 and the rows of unswept axes stay zero. A
/// perfectly aligned rig with unit scale gives the identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotationFrame(pub Matrix3<f64>);

impl RotationFrame {
    /// Aligned rig at one pixel per micron.
    pub fn identity() -> Self {
        Self(Matrix3::identity())
    }

    /// Rows are manipulator axes, columns camera axes.
    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.0
    }

    /// Mean length of the in-plane parts of the x and y rows (pixels per micron).
    pub fn in_plane_scale(&self) -> f64 {
        let e = &self.0;
        let x_row = e[(0, 0)].hypot(e[(0, 1)]);
        let y_row = e[(1, 0)].hypot(e[(1, 1)]);
        (x_row + y_row) / 2.0
    }

    /// In-plane angle read from the x row.
    pub fn gamma(&self) -> f64 {
        let e = &self.0;
        let gamma = (-e[(0, 1)] / e[(0, 0)]).atan();
        if e[(0, 0)] > 0.0 {
            gamma
        } else {
            gamma - std::f64::consts::PI
        }
    }

    /// Extracts gamma, then alpha and beta from the z row.
    ///
    /// The z row is divided by the in-plane scale first, so a rig imaged at a
    /// few pixels per micron yields the same tilt angles as a unit-scale one.
    /// Arcsine arguments are clamped to [-1, 1] against round-off.
    pub fn angles(&self) -> RotationAngles {
        let gamma = self.gamma();
        let scale = self.in_plane_scale();
        let scale = if scale > f64::EPSILON { scale } else { 1.0 };
        let ezx = self.0[(2, 0)] / scale;
        let ezy = self.0[(2, 1)] / scale;

        let alpha = (ezx * gamma.sin() + ezy * gamma.cos())
            .clamp(-1.0, 1.0)
            .asin();
        let beta = ((-ezx * gamma.cos() + ezy * gamma.sin()) / alpha.cos())
            .clamp(-1.0, 1.0)
            .asin();
        RotationAngles::new(alpha, beta, gamma)
    }
}
