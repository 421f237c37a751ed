//! Task store port and implementations.
//!
//! The store is the single source of truth for task state; the coordinator
//! layers policy (backoff, attempt ceilings) on top. Every mutation here is
//! an atomic conditional update: the predicate (expected state, owning
//! worker, observed lease deadline) is evaluated in the same transaction as
//! the write, never as a separate read.

mod memory;
mod sqlite;

pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Error, TaskId, TaskKind, TaskRecord, TaskState, WorkerId};
use crate::observability::QueueCounts;

/// A Claimed/Running task whose lease deadline has elapsed, as observed by
/// the reap sweep.
#[derive(Debug, Clone)]
pub struct LeaseExpiry {
    pub task_id: TaskId,
    /// Deadline at observation time. `apply_reap` re-checks it so a racing
    /// heartbeat invalidates the reap instead of being clobbered.
    pub observed_deadline: DateTime<Utc>,
    pub attempt_count: u32,
    pub max_attempts: u32,
}

/// What to do with an expired lease.
#[derive(Debug, Clone)]
pub enum ReapOutcome {
    /// Back to Retrying, visible again at the given instant.
    Retry { next_visible_at: DateTime<Utc> },
    /// Attempts exhausted: terminal.
    Abandon,
}

/// Durable task table contract.
///
/// Owner-checked transitions fail with `NotOwner` when `claimed_by` does not
/// match and `InvalidState` when the task is not in an expected state; both
/// are surfaced to the caller, never swallowed.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new Pending record. If the record carries a dedup key that is
    /// already present, returns the existing task's id instead (idempotent
    /// enqueue).
    async fn insert(&self, record: TaskRecord) -> Result<TaskId, Error>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, Error>;

    /// Atomically claim the earliest-created claimable task (Pending or
    /// Retrying, `next_visible_at <= now`, kind accepted): transition to
    /// Claimed, set owner and lease, increment the attempt counter. Returns
    /// None without blocking when nothing is eligible.
    ///
    /// An empty `kinds` slice accepts every kind.
    async fn claim_one(
        &self,
        worker: WorkerId,
        kinds: &[TaskKind],
        now: DateTime<Utc>,
        lease_deadline: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, Error>;

    /// Claimed -> Running, owner-checked.
    async fn mark_running(&self, id: TaskId, worker: WorkerId) -> Result<(), Error>;

    /// Heartbeat: extend the lease deadline, owner-checked.
    async fn extend_lease(
        &self,
        id: TaskId,
        worker: WorkerId,
        until: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Claimed/Running -> Succeeded, owner-checked.
    async fn mark_succeeded(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Claimed/Running -> Retrying with a new visibility instant,
    /// owner-checked.
    async fn mark_retrying(
        &self,
        id: TaskId,
        worker: WorkerId,
        next_visible_at: DateTime<Utc>,
        error: String,
    ) -> Result<(), Error>;

    /// Claimed/Running -> Failed or Abandoned, owner-checked.
    async fn mark_terminal(
        &self,
        id: TaskId,
        worker: WorkerId,
        state: TaskState,
        now: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), Error>;

    /// Pending/Retrying -> Abandoned, before any claim.
    async fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<(), Error>;

    /// Scan for Claimed/Running tasks whose lease deadline has elapsed.
    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LeaseExpiry>, Error>;

    /// Apply a reap decision. The update only lands if the task is still
    /// Claimed/Running with exactly the observed lease deadline; returns
    /// whether it applied. A no-op result means a heartbeat or completion
    /// won the race.
    async fn apply_reap(
        &self,
        id: TaskId,
        observed_deadline: DateTime<Utc>,
        outcome: ReapOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, Error>;

    async fn counts_by_state(&self) -> Result<QueueCounts, Error>;
}
