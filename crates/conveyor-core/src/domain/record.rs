//! Durable task record.

use chrono::{DateTime, Utc};

use super::{TaskEnvelope, TaskId, TaskKind, TaskState, WorkerId};

/// One row in the task table. Single source of truth for a task's lifecycle.
///
/// Design:
/// - All state transitions go through methods here; stores never poke fields.
/// - Timestamps are `DateTime<Utc>` in the domain; stores persist Unix
///   milliseconds.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub state: TaskState,

    /// Incremented on each successful claim. Never exceeds `max_attempts`.
    pub attempt_count: u32,
    pub max_attempts: u32,

    /// Owning worker while Claimed/Running; None otherwise.
    pub claimed_by: Option<WorkerId>,

    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// The task is invisible to `claim` before this instant (enqueue delay,
    /// retry backoff). Always >= created_at.
    pub next_visible_at: DateTime<Utc>,

    /// Heartbeat-extended deadline while Claimed/Running. Past this instant
    /// the reaper may reclaim the task.
    pub lease_deadline: Option<DateTime<Utc>>,

    /// Most recent failure reason, retained on terminal states for diagnosis.
    pub last_error: Option<String>,

    /// Optional idempotent-enqueue key; unique among live tasks.
    pub dedup_key: Option<String>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        kind: TaskKind,
        payload: serde_json::Value,
        max_attempts: u32,
        created_at: DateTime<Utc>,
        next_visible_at: DateTime<Utc>,
    ) -> Self {
        // Visibility never precedes creation.
        let next_visible_at = next_visible_at.max(created_at);
        Self {
            id,
            kind,
            payload,
            state: TaskState::Pending,
            attempt_count: 0,
            max_attempts,
            claimed_by: None,
            created_at,
            claimed_at: None,
            completed_at: None,
            next_visible_at,
            lease_deadline: None,
            last_error: None,
            dedup_key: None,
        }
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Eligible for `claim` at `now`?
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.state.is_claimable() && self.next_visible_at <= now
    }

    /// The envelope handed to handlers.
    pub fn envelope(&self) -> TaskEnvelope {
        TaskEnvelope::new(self.id, self.kind.clone(), self.payload.clone())
    }

    /// Pending/Retrying -> Claimed. Increments the attempt counter and
    /// installs the lease.
    pub fn begin_claim(&mut self, worker: WorkerId, now: DateTime<Utc>, lease: DateTime<Utc>) {
        debug_assert!(self.is_claimable_at(now));
        self.state = TaskState::Claimed;
        self.attempt_count += 1;
        self.claimed_by = Some(worker);
        self.claimed_at = Some(now);
        self.lease_deadline = Some(lease);
    }

    /// Claimed -> Running.
    pub fn mark_running(&mut self) {
        self.state = TaskState::Running;
    }

    /// Heartbeat: push the lease deadline out.
    pub fn extend_lease(&mut self, until: DateTime<Utc>) {
        self.lease_deadline = Some(until);
    }

    /// Claimed/Running -> Succeeded.
    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Succeeded;
        self.completed_at = Some(now);
        self.release_owner();
    }

    /// Claimed/Running -> Retrying, visible again at `next_visible_at`.
    pub fn schedule_retry(&mut self, next_visible_at: DateTime<Utc>, error: impl Into<String>) {
        self.state = TaskState::Retrying;
        self.next_visible_at = next_visible_at;
        self.last_error = Some(error.into());
        self.release_owner();
    }

    /// Transition into a terminal failure state (Failed or Abandoned).
    pub fn mark_terminal(
        &mut self,
        state: TaskState,
        now: DateTime<Utc>,
        error: Option<String>,
    ) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.completed_at = Some(now);
        if error.is_some() {
            self.last_error = error;
        }
        self.release_owner();
    }

    /// Attempts exhausted: the next retriable failure is terminal.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    fn release_owner(&mut self) {
        self.claimed_by = None;
        self.lease_deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn record_at(now: DateTime<Utc>) -> TaskRecord {
        TaskRecord::new(
            TaskId::generate(),
            TaskKind::new("test"),
            serde_json::json!({"n": 1}),
            3,
            now,
            now,
        )
    }

    #[test]
    fn new_record_is_pending_and_claimable() {
        let now = Utc::now();
        let rec = record_at(now);
        assert_eq!(rec.state, TaskState::Pending);
        assert!(rec.is_claimable_at(now));
        assert_eq!(rec.attempt_count, 0);
    }

    #[test]
    fn delayed_record_is_invisible_until_due() {
        let now = Utc::now();
        let mut rec = record_at(now);
        rec.next_visible_at = now + TimeDelta::seconds(30);

        assert!(!rec.is_claimable_at(now));
        assert!(rec.is_claimable_at(now + TimeDelta::seconds(30)));
    }

    #[test]
    fn visibility_never_precedes_creation() {
        let now = Utc::now();
        let rec = TaskRecord::new(
            TaskId::generate(),
            TaskKind::new("test"),
            serde_json::json!({}),
            3,
            now,
            now - TimeDelta::seconds(60),
        );
        assert_eq!(rec.next_visible_at, rec.created_at);
    }

    #[test]
    fn claim_sets_owner_and_counts_attempt() {
        let now = Utc::now();
        let mut rec = record_at(now);
        let worker = WorkerId::generate();

        rec.begin_claim(worker, now, now + TimeDelta::seconds(30));

        assert_eq!(rec.state, TaskState::Claimed);
        assert_eq!(rec.attempt_count, 1);
        assert_eq!(rec.claimed_by, Some(worker));
        assert!(rec.lease_deadline.is_some());
    }

    #[test]
    fn success_releases_owner() {
        let now = Utc::now();
        let mut rec = record_at(now);
        rec.begin_claim(WorkerId::generate(), now, now + TimeDelta::seconds(30));
        rec.mark_running();
        rec.mark_succeeded(now);

        assert_eq!(rec.state, TaskState::Succeeded);
        assert!(rec.claimed_by.is_none());
        assert!(rec.lease_deadline.is_none());
        assert!(rec.completed_at.is_some());
    }

    #[test]
    fn retry_keeps_error_and_reschedules() {
        let now = Utc::now();
        let mut rec = record_at(now);
        rec.begin_claim(WorkerId::generate(), now, now + TimeDelta::seconds(30));
        rec.schedule_retry(now + TimeDelta::seconds(10), "boom");

        assert_eq!(rec.state, TaskState::Retrying);
        assert_eq!(rec.last_error.as_deref(), Some("boom"));
        assert!(!rec.is_claimable_at(now));
        assert!(rec.is_claimable_at(now + TimeDelta::seconds(10)));
    }

    #[test]
    fn exhaustion_tracks_max_attempts() {
        let now = Utc::now();
        let mut rec = record_at(now);
        for _ in 0..3 {
            rec.begin_claim(WorkerId::generate(), now, now);
            rec.schedule_retry(now, "err");
        }
        assert!(rec.attempts_exhausted());
    }
}
