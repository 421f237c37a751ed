//! Coordinator: owns the task lifecycle.
//!
//! Workers and the scheduler never mutate task state directly; every
//! transition goes through here and lands in the store as an atomic
//! conditional update. The coordinator adds policy on top: default attempt
//! ceilings, lease duration, and the backoff curve for retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tracing::{debug, warn};

use crate::domain::{Error, TaskId, TaskKind, TaskRecord, TaskState, WorkerId};
use crate::observability::{QueueCounts, TaskStatus};
use crate::ports::Clock;
use crate::retry::BackoffPolicy;
use crate::store::{ReapOutcome, TaskStore};

/// Tunables.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Attempt ceiling applied when `enqueue` does not override it.
    pub default_max_attempts: u32,

    /// How long a claim stays valid without a heartbeat.
    pub lease_duration: Duration,

    /// Max expired leases processed per reap sweep.
    pub reap_batch: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 5,
            lease_duration: Duration::from_secs(30),
            reap_batch: 100,
        }
    }
}

/// Optional enqueue parameters.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Keep the task invisible to claims for this long.
    pub delay: Duration,

    /// Override the configured default attempt ceiling.
    pub max_attempts: Option<u32>,

    /// Idempotency key: a second enqueue under the same key returns the
    /// first task's id.
    pub dedup_key: Option<String>,
}

/// The task queue coordinator.
pub struct Coordinator {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        backoff: BackoffPolicy,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            clock,
            backoff,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Create a Pending task, claimable once `delay` has passed.
    pub async fn enqueue(
        &self,
        kind: TaskKind,
        payload: serde_json::Value,
    ) -> Result<TaskId, Error> {
        self.enqueue_with(kind, payload, EnqueueOptions::default())
            .await
    }

    pub async fn enqueue_with(
        &self,
        kind: TaskKind,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<TaskId, Error> {
        let now = self.clock.now();
        let delay = TimeDelta::from_std(opts.delay)
            .map_err(|e| Error::InvalidArgument(format!("delay out of range: {e}")))?;
        let max_attempts = opts.max_attempts.unwrap_or(self.config.default_max_attempts);

        let mut record = TaskRecord::new(
            TaskId::generate(),
            kind.clone(),
            payload,
            max_attempts,
            now,
            now + delay,
        );
        if let Some(key) = opts.dedup_key {
            record = record.with_dedup_key(key);
        }
        let id = self.store.insert(record).await?;
        debug!(task_id = %id, kind = %kind, "task enqueued");
        Ok(id)
    }

    /// Atomically claim one eligible task for `worker`. Returns None without
    /// blocking when nothing is claimable; callers poll on their own
    /// interval.
    pub async fn claim(
        &self,
        worker: WorkerId,
        kinds: &[TaskKind],
    ) -> Result<Option<TaskRecord>, Error> {
        let now = self.clock.now();
        let lease = now + self.lease_delta();
        let claimed = self.store.claim_one(worker, kinds, now, lease).await?;
        if let Some(rec) = &claimed {
            debug!(task_id = %rec.id, worker_id = %worker, attempt = rec.attempt_count, "task claimed");
        }
        Ok(claimed)
    }

    /// Claimed -> Running; the worker calls this before invoking the handler.
    pub async fn start(&self, id: TaskId, worker: WorkerId) -> Result<(), Error> {
        self.store.mark_running(id, worker).await
    }

    /// Extend the claim's visibility timeout.
    pub async fn heartbeat(&self, id: TaskId, worker: WorkerId) -> Result<(), Error> {
        let until = self.clock.now() + self.lease_delta();
        self.store.extend_lease(id, worker, until).await
    }

    /// Claimed/Running -> Succeeded.
    pub async fn complete(&self, id: TaskId, worker: WorkerId) -> Result<(), Error> {
        self.store.mark_succeeded(id, worker, self.clock.now()).await
    }

    /// Report a failure. Retriable failures go back to Retrying with
    /// backoff until the attempt ceiling, then Abandoned; non-retriable
    /// failures are terminally Failed. Returns the resulting state.
    pub async fn fail(
        &self,
        id: TaskId,
        worker: WorkerId,
        retriable: bool,
        error: &str,
    ) -> Result<TaskState, Error> {
        let now = self.clock.now();
        let rec = self.store.get(id).await?.ok_or(Error::NotFound(id))?;

        if !retriable {
            self.store
                .mark_terminal(id, worker, TaskState::Failed, now, Some(error.into()))
                .await?;
            return Ok(TaskState::Failed);
        }
        // attempt_count is stable while the task is owned (only claims
        // increment it), so this read-then-update is race-free: the update
        // itself still re-checks ownership.
        if rec.attempts_exhausted() {
            self.store
                .mark_terminal(id, worker, TaskState::Abandoned, now, Some(error.into()))
                .await?;
            warn!(task_id = %id, attempts = rec.attempt_count, "task abandoned: attempts exhausted");
            return Ok(TaskState::Abandoned);
        }
        let delay = TimeDelta::from_std(self.backoff.delay(rec.attempt_count))
            .unwrap_or(TimeDelta::MAX);
        self.store
            .mark_retrying(id, worker, now + delay, error.into())
            .await?;
        Ok(TaskState::Retrying)
    }

    /// Abandon a task that has not been claimed yet. A Running task cannot
    /// be interrupted; it can only time out via the reaper.
    pub async fn cancel(&self, id: TaskId) -> Result<(), Error> {
        self.store.cancel(id, self.clock.now()).await
    }

    /// Sweep expired leases: each becomes a retriable failure (Retrying with
    /// backoff, or Abandoned once attempts are exhausted). Returns how many
    /// tasks were actually reclaimed; sweeps are idempotent because the
    /// apply step re-checks the observed lease deadline.
    pub async fn reap(&self) -> Result<usize, Error> {
        let now = self.clock.now();
        let expired = self
            .store
            .expired_leases(now, self.config.reap_batch)
            .await?;

        let mut reaped = 0;
        for expiry in expired {
            let outcome = if expiry.attempt_count >= expiry.max_attempts {
                ReapOutcome::Abandon
            } else {
                let delay = TimeDelta::from_std(self.backoff.delay(expiry.attempt_count))
                    .unwrap_or(TimeDelta::MAX);
                ReapOutcome::Retry {
                    next_visible_at: now + delay,
                }
            };
            let applied = self
                .store
                .apply_reap(expiry.task_id, expiry.observed_deadline, outcome, now)
                .await?;
            if applied {
                warn!(task_id = %expiry.task_id, attempt = expiry.attempt_count, "reaped expired lease");
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Read-only status view; the API service's status touchpoint.
    pub async fn get_status(&self, id: TaskId) -> Result<TaskStatus, Error> {
        let rec = self.store.get(id).await?.ok_or(Error::NotFound(id))?;
        Ok(TaskStatus::from(&rec))
    }

    pub async fn counts(&self) -> Result<QueueCounts, Error> {
        self.store.counts_by_state().await
    }

    pub fn lease_duration(&self) -> Duration {
        self.config.lease_duration
    }

    fn lease_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.lease_duration).unwrap_or(TimeDelta::MAX)
    }
}
