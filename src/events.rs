//! Progress reporting from a running engine operation.
//!
//! Events flow through an unbounded `tokio::sync::mpsc` channel: emitting never
//! blocks the worker on a slow consumer and a dropped receiver is ignored.
//! Events arrive in exactly the order the samples were taken.
//!
//! ```text
//! worker --[ProgressEvent]--> mpsc::unbounded ---> GUI / CLI / logger
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::autofocus::{FocusResult, FocusTrace};
use crate::calibration::CalibrationResult;
use crate::error::{ErrorKind, RigResult};
use crate::geometry::{PixelPoint, Pose, RotationAngles};

/// Terminal value of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunResult {
    /// Hard or soft calibration result.
    Calibration(CalibrationResult),
    /// Focus search result.
    Focus(FocusResult),
}

impl From<CalibrationResult> for RunResult {
    fn from(result: CalibrationResult) -> Self {
        RunResult::Calibration(result)
    }
}

impl From<FocusResult> for RunResult {
    fn from(result: FocusResult) -> Self {
        RunResult::Focus(result)
    }
}

/// One step of a running operation, or its terminal event.
///
/// Every run ends with exactly one of `Completed`, `Failed` or `Cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProgressEvent {
    /// A refined tip location for the manipulator at `pose`.
    TipSampled {
        /// Commanded manipulator pose.
        pose: Pose,
        /// Refined tip pixel.
        point: PixelPoint,
    },
    /// The localizer found no tip for the manipulator at `pose`.
    TipMissed {
        /// Commanded manipulator pose.
        pose: Pose,
    },
    /// Some samples were skipped but stayed within tolerance.
    CalibrationDegraded {
        /// Samples without a tip.
        missed: usize,
        /// All samples of the run.
        total: usize,
    },
    /// Angles reduced from a finished sweep, before the run completes.
    AngleComputed(RotationAngles),
    /// Full snapshot of the focus trace after it grew.
    TraceUpdated(FocusTrace),
    /// Successful end of the run.
    Completed(RunResult),
    /// The run failed; the manipulator is back at its reference pose.
    Failed(ErrorKind),
    /// The run stopped on request.
    Cancelled,
}

/// How a cancellable operation ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The run finished.
    Completed(T),
    /// Stopped on request; `partial` holds whatever result the samples so far allow.
    Cancelled {
        /// Result from the samples taken before the stop, where one exists.
        partial: Option<T>,
    },
}

impl<T> Outcome<T> {
    /// The result of a finished run, `None` when cancelled.
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Cancelled { .. } => None,
        }
    }

    /// Whether the run stopped on request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled { .. })
    }
}

/// Fire-and-forget sender half of the progress channel.
#[derive(Debug, Clone, Default)]
pub struct ProgressSender {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSender {
    /// Connected sender and receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sender that drops every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Send `event` unless the sender is disabled.
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is watching; the run carries on.
            let _ = tx.send(event);
        }
    }

    /// Emit the single terminal event for a finished run.
    pub fn finish<T>(&self, result: &RigResult<Outcome<T>>)
    where
        T: Clone + Into<RunResult>,
    {
        match result {
            Ok(Outcome::Completed(value)) => {
                self.emit(ProgressEvent::Completed(value.clone().into()))
            }
            Ok(Outcome::Cancelled { .. }) => self.emit(ProgressEvent::Cancelled),
            Err(err) => self.emit(ProgressEvent::Failed(err.kind())),
        }
    }
}
