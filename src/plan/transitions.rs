//! Step status transition validation.

use super::StepStatus;

/// Valid step transitions:
/// - not_started -> in_progress
/// - in_progress -> completed
/// - in_progress -> blocked
/// - blocked -> in_progress (retry)
///
/// Neither `completed` nor `blocked` ever returns to `not_started`.
pub fn is_valid_transition(from: StepStatus, to: StepStatus) -> bool {
    use StepStatus::*;
    matches!(
        (from, to),
        (NotStarted, InProgress)
            | (InProgress, Completed)
            | (InProgress, Blocked)
            | (Blocked, InProgress)
    )
}
