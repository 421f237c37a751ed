//! Periodic scheduler: enqueues recurring tasks on a fixed cadence.
//!
//! Firing is drift-free: the next fire instant is the previous *scheduled*
//! instant plus the interval, never the wall clock at enqueue time, so an
//! entry with a 60s interval fires at t0+60, t0+120, t0+180 no matter how
//! long any single tick takes. Each firing enqueues with a dedup key derived
//! from (kind, scheduled instant), so a redundant scheduler instance cannot
//! double-enqueue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, EnqueueOptions};
use crate::domain::{Error, ScheduleId, TaskKind};
use crate::ports::Clock;

/// A recurring task template.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub id: ScheduleId,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub interval: Duration,

    /// The most recent instant this entry was scheduled for. The first fire
    /// happens one interval after the anchor passed to `new`.
    last_scheduled_at: DateTime<Utc>,
}

impl ScheduleEntry {
    pub fn new(
        kind: TaskKind,
        payload: serde_json::Value,
        interval: Duration,
        anchor: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ScheduleId::generate(),
            kind,
            payload,
            interval,
            last_scheduled_at: anchor,
        }
    }

    fn interval_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.interval).unwrap_or(TimeDelta::MAX)
    }

    /// Next due fire instant, if any. A zero interval never fires: it has
    /// no grid to anchor to and would otherwise be due forever.
    fn peek_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.interval.is_zero() {
            return None;
        }
        let next = self.last_scheduled_at + self.interval_delta();
        (next <= now).then_some(next)
    }

    /// Commit a fire: only called once the instant's enqueue has landed, so
    /// a failed enqueue leaves the instant due for the next tick.
    fn commit_fire(&mut self, instant: DateTime<Utc>) {
        self.last_scheduled_at = instant;
    }
}

/// The scheduler process: a set of entries plus a tick loop.
pub struct Scheduler {
    coordinator: Arc<Coordinator>,
    clock: Arc<dyn Clock>,
    entries: Vec<ScheduleEntry>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        coordinator: Arc<Coordinator>,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            clock,
            entries: Vec::new(),
            tick_interval,
        }
    }

    pub fn add_entry(&mut self, entry: ScheduleEntry) {
        info!(schedule_id = %entry.id, kind = %entry.kind, interval = ?entry.interval, "schedule entry added");
        self.entries.push(entry);
    }

    /// One pass over all entries: enqueue everything due, catching up missed
    /// intervals one instant at a time. Returns how many firings were
    /// enqueued. An entry advances past an instant only once its enqueue has
    /// landed, so a store error leaves the instant due for the next tick.
    pub async fn tick(&mut self) -> Result<usize, Error> {
        let now = self.clock.now();
        let mut fired = 0;
        for entry in &mut self.entries {
            while let Some(instant) = entry.peek_due(now) {
                let dedup_key = format!(
                    "{}@{}",
                    entry.kind,
                    instant.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
                );
                self.coordinator
                    .enqueue_with(
                        entry.kind.clone(),
                        entry.payload.clone(),
                        EnqueueOptions {
                            dedup_key: Some(dedup_key),
                            ..Default::default()
                        },
                    )
                    .await?;
                entry.commit_fire(instant);
                debug!(schedule_id = %entry.id, kind = %entry.kind, %instant, "schedule fired");
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// Spawn the tick loop. Dropping or shutting down the handle stops it.
    pub fn spawn(mut self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let tick_interval = self.tick_interval;

        let join = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                if let Err(e) = self.tick().await {
                    // Transient store trouble: the failed instant was not
                    // committed, so the next tick retries it. Dedup keys
                    // absorb any enqueue that did land before the error.
                    warn!(error = %e, "scheduler tick failed");
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(tick_interval) => {}
                }
            }
        });

        SchedulerHandle { shutdown_tx, join }
    }
}

pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown_and_join(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}
