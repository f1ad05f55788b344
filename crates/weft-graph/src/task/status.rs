//! Task status state machine.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Lifecycle status of a task.
///
/// Tasks move `Pending -> Processing -> {Completed | Failed | Aborting}`,
/// may be marked `Skipped` while still pending, and re-enter `Pending`
/// only through a reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting to be scheduled.
    #[default]
    Pending,
    /// Currently executing.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancellation was requested; terminal for scheduling purposes.
    Aborting,
    /// Never executed because the run ended early.
    Skipped,
}

impl TaskStatus {
    /// Returns whether this status ends a task's participation in a run.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Aborting | Self::Skipped
        )
    }

    /// Returns whether moving from `self` to `next` is a valid transition.
    ///
    /// A reset (any status back to `Pending`) is always allowed.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (_, Self::Pending)
                | (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Skipped)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::Aborting)
        )
    }
}
