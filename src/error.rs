//! Custom error types for the calibration and autofocus engine.
//!
//! This module defines the primary error type, `RigError`, used by every
//! long-running operation of the core. Using the `thiserror` crate, it gives a
//! single place where configuration mistakes, hardware faults and algorithmic
//! failures are classified.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type
//!   mismatches in the configuration sources.
//! - **`Configuration`**: Semantic errors in values that parsed fine but are
//!   logically invalid (a negative pipette diameter, a zero step size). These are
//!   raised before the manipulator is touched.
//! - **`Hardware`**: Motion or capture faults reported by the collaborators.
//!   The core never retries them.
//! - **`CalibrationFailed`**: Too many tip localizations missed for the
//!   configured tolerance, or an axis had no usable displacement pairs.
//! - **`FocusNotFound`**: The sharpness-peak search ran past its iteration or
//!   excursion bound without a monotonic tail.
//! - **`Storage`**: The results store could not persist an artifact.
//!
//! `HardwareError` is separate: it is what the capability traits
//! return, and it converts into `RigError` through `#[from]` so `?` works at
//! every call site in the engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::Pose;

/// Convenience alias for results using the engine error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

/// Faults raised by the motion and imaging collaborators.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    /// The manipulator refused a target beyond its travel limits.
    #[error("Target {target} is outside the manipulator travel range")]
    MotionOutOfRange {
        /// Rejected absolute target.
        target: Pose,
    },

    /// Any other motion failure reported by the driver.
    #[error("Motion fault: {0}")]
    Motion(String),

    /// The camera failed to deliver a frame.
    #[error("Capture fault: {0}")]
    Capture(String),
}

/// Primary error type of the engine.
#[derive(Error, Debug)]
pub enum RigError {
    /// Figment could not load or extract the configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// A loaded value is out of range.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A collaborator fault, propagated without retry.
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    /// Too many tip misses, or the sweep data cannot be reduced.
    #[error("Calibration failed: {reason}")]
    CalibrationFailed {
        /// Human-readable cause.
        reason: String,
    },

    /// The search hit its iteration or excursion guard.
    #[error("Focus not found after {iterations} iterations (excursion {excursion_um:.1} um)")]
    FocusNotFound {
        /// Coarse iterations run before giving up.
        iterations: usize,
        /// Largest distance from the reference height, in microns.
        excursion_um: f64,
    },

    /// Writing a result artifact failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Copyable classification of a [`RigError`], carried by failure events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// [`RigError::Config`] or [`RigError::Configuration`].
    ConfigurationError,
    /// [`RigError::Hardware`].
    HardwareError,
    /// [`RigError::CalibrationFailed`].
    CalibrationFailed,
    /// [`RigError::FocusNotFound`].
    FocusNotFound,
    /// [`RigError::Storage`].
    StorageError,
}

impl RigError {
    /// Classification used in [`ProgressEvent::Failed`](crate::events::ProgressEvent::Failed).
    pub fn kind(&self) -> ErrorKind {
        match self {
            RigError::Config(_) | RigError::Configuration(_) => ErrorKind::ConfigurationError,
            RigError::Hardware(_) => ErrorKind::HardwareError,
            RigError::CalibrationFailed { .. } => ErrorKind::CalibrationFailed,
            RigError::FocusNotFound { .. } => ErrorKind::FocusNotFound,
            RigError::Storage(_) => ErrorKind::StorageError,
        }
    }
}

impl From<std::io::Error> for RigError {
    fn from(err: std::io::Error) -> Self {
        RigError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RigError {
    fn from(err: serde_json::Error) -> Self {
        RigError::Storage(err.to_string())
    }
}
