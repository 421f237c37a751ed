//! Task state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task state.
///
/// Transitions:
/// - Pending -> Claimed -> Running -> Succeeded
/// - Pending -> Claimed -> Running -> Retrying -> Claimed (loop, bounded by max_attempts)
/// - Claimed/Running -> Failed (permanent handler error)
/// - Claimed/Running -> Abandoned (attempts exhausted)
/// - Pending/Retrying -> Abandoned (cancelled before claim)
///
/// Succeeded, Failed, and Abandoned are terminal; no task regresses out of
/// a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Enqueued, waiting for its first claim (visible once next_visible_at passes).
    Pending,

    /// A worker holds the task but has not started the handler yet.
    Claimed,

    /// The handler is executing.
    Running,

    /// Completed successfully.
    Succeeded,

    /// Failed permanently (non-retriable handler error).
    Failed,

    /// Waiting out a backoff delay before becoming claimable again.
    Retrying,

    /// Attempts exhausted, reaped past its ceiling, or cancelled before claim.
    Abandoned,
}

impl TaskState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Abandoned
        )
    }

    /// States eligible for `claim` (subject to the visibility gate).
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Retrying)
    }

    /// States in which a worker owns the task.
    pub fn is_owned(self) -> bool {
        matches!(self, TaskState::Claimed | TaskState::Running)
    }

    /// Stable string form, used as the store column value.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Claimed => "claimed",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Retrying => "retrying",
            TaskState::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "claimed" => Ok(TaskState::Claimed),
            "running" => Ok(TaskState::Running),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed" => Ok(TaskState::Failed),
            "retrying" => Ok(TaskState::Retrying),
            "abandoned" => Ok(TaskState::Abandoned),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}
