//! Cooperative cancellation for long-running engine operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{HardwareError, RigError, RigResult};

/// Shared stop flag checked after each hardware round-trip.
///
/// Clones observe the same flag. Cancelling is sticky: once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Suspension point: `Err(Halt::Cancelled)` once cancellation was requested.
    pub(crate) fn checkpoint(&self) -> Result<(), Halt> {
        if self.is_cancelled() {
            Err(Halt::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Why a sweep stopped early. Lets `?` carry both errors and cancellation.
#[derive(Debug)]
pub(crate) enum Halt {
    Cancelled,
    Failed(RigError),
}

impl From<RigError> for Halt {
    fn from(err: RigError) -> Self {
        Halt::Failed(err)
    }
}

impl From<HardwareError> for Halt {
    fn from(err: HardwareError) -> Self {
        Halt::Failed(err.into())
    }
}

/// `Ok(true)` when the sweep ran to the end, `Ok(false)` when it was cancelled.
pub(crate) fn completion(result: Result<(), Halt>) -> RigResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(Halt::Cancelled) => Ok(false),
        Err(Halt::Failed(err)) => Err(err),
    }
}
