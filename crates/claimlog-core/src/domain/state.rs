//! Task lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The state tag of a task.
///
/// State transitions:
/// - Ready -> Claimed (claim)
/// - Claimed -> Ready (lease expiry, reclaimer only)
/// - Claimed -> Completed (completion)
///
/// Completed is terminal. Nothing moves a task back out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a worker (eligible once its dependencies are completed).
    Ready,

    /// Leased by exactly one worker.
    Claimed,

    /// Finished.
    Completed,
}

impl TaskState {
    pub fn can_transition_to(self, to: TaskState) -> bool {
        matches!(
            (self, to),
            (TaskState::Ready, TaskState::Claimed)
                | (TaskState::Claimed, TaskState::Ready)
                | (TaskState::Claimed, TaskState::Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Ready => "ready",
            TaskState::Claimed => "claimed",
            TaskState::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::claim(TaskState::Ready, TaskState::Claimed, true)]
    #[case::expire(TaskState::Claimed, TaskState::Ready, true)]
    #[case::complete(TaskState::Claimed, TaskState::Completed, true)]
    #[case::skip_claim(TaskState::Ready, TaskState::Completed, false)]
    #[case::reopen(TaskState::Completed, TaskState::Ready, false)]
    #[case::unfinish(TaskState::Completed, TaskState::Claimed, false)]
    #[case::self_ready(TaskState::Ready, TaskState::Ready, false)]
    #[case::self_claimed(TaskState::Claimed, TaskState::Claimed, false)]
    fn only_protocol_transitions_are_allowed(
        #[case] from: TaskState,
        #[case] to: TaskState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn only_completed_is_terminal() {
        assert!(TaskState::Completed.is_terminal());
        assert!(!TaskState::Ready.is_terminal());
        assert!(!TaskState::Claimed.is_terminal());
    }
}
