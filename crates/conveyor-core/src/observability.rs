//! Status views exposed to the API service and operators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{TaskId, TaskKind, TaskRecord, TaskState};

/// Per-state task totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub claimed: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retrying: usize,
    pub abandoned: usize,
}

impl QueueCounts {
    pub fn record(&mut self, state: TaskState) {
        self.add(state, 1);
    }

    /// Add a pre-aggregated total, as produced by a GROUP BY over states.
    pub fn add(&mut self, state: TaskState, n: usize) {
        match state {
            TaskState::Pending => self.pending += n,
            TaskState::Claimed => self.claimed += n,
            TaskState::Running => self.running += n,
            TaskState::Succeeded => self.succeeded += n,
            TaskState::Failed => self.failed += n,
            TaskState::Retrying => self.retrying += n,
            TaskState::Abandoned => self.abandoned += n,
        }
    }
}

/// Read-only task snapshot, the API service's status touchpoint.
///
/// Terminal tasks stay queryable with their last failure reason; nothing is
/// silently deleted.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub id: TaskId,
    pub kind: TaskKind,
    pub state: TaskState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&TaskRecord> for TaskStatus {
    fn from(rec: &TaskRecord) -> Self {
        Self {
            id: rec.id,
            kind: rec.kind.clone(),
            state: rec.state,
            attempt_count: rec.attempt_count,
            max_attempts: rec.max_attempts,
            last_error: rec.last_error.clone(),
            created_at: rec.created_at,
            completed_at: rec.completed_at,
        }
    }
}
