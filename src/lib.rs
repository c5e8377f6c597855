//! Calibration and autofocus engine for a patch-clamp micromanipulator rig.
//!
//! The engine drives a micromanipulator, a camera and a pipette tip detector
//! through the capability traits in [`hardware`] and provides:
//!
//! - [`calibration`]: hard calibration (rotation between manipulator and camera
//!   axes, or pixel size) and soft calibration (one reference pose paired with
//!   the averaged tip pixel).
//! - [`autofocus`]: a sharpness-peak search along z that rejects noise maxima
//!   with a monotonicity check and refines the peak with shrinking steps.
//!
//! Every run reports progress over a [`events::ProgressSender`], honours a
//! [`cancel::CancellationToken`] and returns the manipulator to its reference
//! pose when it fails or is cancelled.

pub mod autofocus;
pub mod calibration;
pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod geometry;
pub mod guard;
pub mod hardware;
pub mod pipette;
pub mod storage;
