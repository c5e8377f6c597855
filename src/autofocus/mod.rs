//! Sharpness-peak search along the manipulator z axis.
//!
//! The search seeds three samples above the reference height, walks up or
//! down by a fixed step following the rising sharpness, and only accepts a
//! candidate peak once a monotonicity check shows scores declining behind it.
//! The accepted height is then refined with successively smaller steps and
//! shifted by the focus bias to give the operating height.

mod search;
mod trace;

use serde::{Deserialize, Serialize};

pub use search::FocusSearch;
pub use trace::FocusTrace;

/// In-focus height and the bias-corrected operating height, in microns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusResult {
    /// Height of the sharpest refined sample.
    pub z: f64,
    /// `z` minus the configured focus bias; the manipulator ends here.
    pub operating_z: f64,
}
