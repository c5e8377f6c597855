//! Reference-pose restoration on every exit path.
//!
//! Async code cannot move the manipulator from `Drop`, so the scope is
//! expressed as a function: the caller records the reference pose, runs its
//! sweep, and hands the sweep's result to [`restore_reference`], which moves
//! back before the result is returned.

use tracing::{debug, warn};

use crate::error::RigResult;
use crate::geometry::Pose;
use crate::hardware::Motion;

/// Move back to `reference`, then return `result`.
///
/// On success a failed return move becomes the error. When `result` already
/// holds an error, the return move is best-effort and the original error wins.
pub async fn restore_reference<T>(
    motion: &dyn Motion,
    reference: Pose,
    result: RigResult<T>,
) -> RigResult<T> {
    match result {
        Ok(value) => {
            motion.move_absolute(reference).await?;
            debug!(%reference, "restored reference pose");
            Ok(value)
        }
        Err(err) => {
            if let Err(restore_err) = motion.move_absolute(reference).await {
                warn!(
                    %reference,
                    error = %restore_err,
                    "could not restore reference pose after failure"
                );
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RigError;
    use crate::hardware::mock::MockManipulator;

    #[tokio::test]
    async fn success_moves_back() {
        let manipulator = MockManipulator::at(Pose::new(1.0, 2.0, 3.0));
        manipulator.move_absolute(Pose::new(9.0, 9.0, 9.0)).await.unwrap();

        let value = restore_reference(&manipulator, Pose::new(1.0, 2.0, 3.0), Ok(5))
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert_eq!(
            manipulator.position().await.unwrap(),
            Pose::new(1.0, 2.0, 3.0)
        );
    }

    #[tokio::test]
    async fn failure_still_moves_back_and_keeps_error() {
        let manipulator = MockManipulator::at(Pose::default());
        manipulator.move_absolute(Pose::along(2, 40.0)).await.unwrap();

        let result: RigResult<()> = restore_reference(
            &manipulator,
            Pose::default(),
            Err(RigError::CalibrationFailed {
                reason: "no tip".into(),
            }),
        )
        .await;
        assert!(matches!(result, Err(RigError::CalibrationFailed { .. })));
        assert_eq!(manipulator.position().await.unwrap(), Pose::default());
    }

    #[tokio::test]
    async fn failed_return_on_success_is_reported() {
        let manipulator = MockManipulator::default().failing_on_move(1);
        let result = restore_reference(&manipulator, Pose::default(), Ok(())).await;
        assert!(matches!(result, Err(RigError::Hardware(_))));
    }
}
