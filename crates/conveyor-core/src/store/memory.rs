//! In-memory task store.
//!
//! Dev/test substrate. One async mutex guards the whole table, which makes
//! every operation trivially atomic: claim selection and the state write
//! happen under the same lock, matching the conditional-update semantics the
//! durable store implements in SQL.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{Error, TaskId, TaskKind, TaskRecord, TaskState, WorkerId};
use crate::observability::QueueCounts;

use super::{LeaseExpiry, ReapOutcome, TaskStore};

#[derive(Default)]
struct MemoryState {
    /// All records; single source of truth.
    records: HashMap<TaskId, TaskRecord>,

    /// dedup_key -> existing task, for idempotent enqueue.
    dedup: HashMap<String, TaskId>,
}

impl MemoryState {
    /// Owner-checked lookup shared by the transition methods.
    fn owned_mut(
        &mut self,
        id: TaskId,
        worker: WorkerId,
        expected: &'static str,
    ) -> Result<&mut TaskRecord, Error> {
        let rec = self.records.get_mut(&id).ok_or(Error::NotFound(id))?;
        if !rec.state.is_owned() {
            return Err(Error::InvalidState {
                task_id: id,
                state: rec.state,
                expected,
            });
        }
        if rec.claimed_by != Some(worker) {
            return Err(Error::NotOwner {
                task_id: id,
                worker_id: worker,
            });
        }
        Ok(rec)
    }
}

/// In-memory `TaskStore`.
#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<TaskId, Error> {
        let mut state = self.state.lock().await;
        if let Some(key) = &record.dedup_key {
            if let Some(existing) = state.dedup.get(key) {
                return Ok(*existing);
            }
            state.dedup.insert(key.clone(), record.id);
        }
        let id = record.id;
        state.records.insert(id, record);
        Ok(id)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, Error> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    async fn claim_one(
        &self,
        worker: WorkerId,
        kinds: &[TaskKind],
        now: DateTime<Utc>,
        lease_deadline: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, Error> {
        let mut state = self.state.lock().await;

        // FIFO among eligible tasks: earliest created_at wins, id breaks ties.
        let candidate = state
            .records
            .values()
            .filter(|r| r.is_claimable_at(now))
            .filter(|r| kinds.is_empty() || kinds.contains(&r.kind))
            .min_by_key(|r| (r.created_at, r.id))
            .map(|r| r.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let rec = state
            .records
            .get_mut(&id)
            .ok_or(Error::NotFound(id))?;
        rec.begin_claim(worker, now, lease_deadline);
        Ok(Some(rec.clone()))
    }

    async fn mark_running(&self, id: TaskId, worker: WorkerId) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let rec = state.owned_mut(id, worker, "claimed")?;
        if rec.state != TaskState::Claimed {
            return Err(Error::InvalidState {
                task_id: id,
                state: rec.state,
                expected: "claimed",
            });
        }
        rec.mark_running();
        Ok(())
    }

    async fn extend_lease(
        &self,
        id: TaskId,
        worker: WorkerId,
        until: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let rec = state.owned_mut(id, worker, "claimed or running")?;
        rec.extend_lease(until);
        Ok(())
    }

    async fn mark_succeeded(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let rec = state.owned_mut(id, worker, "claimed or running")?;
        rec.mark_succeeded(now);
        Ok(())
    }

    async fn mark_retrying(
        &self,
        id: TaskId,
        worker: WorkerId,
        next_visible_at: DateTime<Utc>,
        error: String,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let rec = state.owned_mut(id, worker, "claimed or running")?;
        rec.schedule_retry(next_visible_at, error);
        Ok(())
    }

    async fn mark_terminal(
        &self,
        id: TaskId,
        worker: WorkerId,
        state_to: TaskState,
        now: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let rec = state.owned_mut(id, worker, "claimed or running")?;
        rec.mark_terminal(state_to, now, error);
        Ok(())
    }

    async fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let rec = state.records.get_mut(&id).ok_or(Error::NotFound(id))?;
        if !rec.state.is_claimable() {
            return Err(Error::InvalidState {
                task_id: id,
                state: rec.state,
                expected: "pending or retrying",
            });
        }
        rec.mark_terminal(TaskState::Abandoned, now, Some("cancelled".into()));
        Ok(())
    }

    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LeaseExpiry>, Error> {
        let state = self.state.lock().await;
        let mut expired: Vec<LeaseExpiry> = state
            .records
            .values()
            .filter(|r| r.state.is_owned())
            .filter_map(|r| {
                let deadline = r.lease_deadline?;
                (deadline <= now).then(|| LeaseExpiry {
                    task_id: r.id,
                    observed_deadline: deadline,
                    attempt_count: r.attempt_count,
                    max_attempts: r.max_attempts,
                })
            })
            .collect();
        expired.sort_by_key(|e| e.observed_deadline);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn apply_reap(
        &self,
        id: TaskId,
        observed_deadline: DateTime<Utc>,
        outcome: ReapOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let mut state = self.state.lock().await;
        let Some(rec) = state.records.get_mut(&id) else {
            return Ok(false);
        };
        // Re-check at apply time: a heartbeat moved the deadline, or the
        // worker already reported. Either way the reap loses.
        if !rec.state.is_owned() || rec.lease_deadline != Some(observed_deadline) {
            return Ok(false);
        }
        match outcome {
            ReapOutcome::Retry { next_visible_at } => {
                rec.schedule_retry(next_visible_at, "lease expired");
            }
            ReapOutcome::Abandon => {
                rec.mark_terminal(TaskState::Abandoned, now, Some("lease expired".into()));
            }
        }
        Ok(true)
    }

    async fn counts_by_state(&self) -> Result<QueueCounts, Error> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for rec in state.records.values() {
            counts.record(rec.state);
        }
        Ok(counts)
    }
}
