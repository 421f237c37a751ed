//! Worker pool: claim -> start -> execute -> report loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::domain::{HandlerError, TaskRecord, WorkerId};
use crate::runtime::HandlerRegistry;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between empty claim attempts. The claim itself never blocks.
    pub poll_interval: Duration,

    /// Lease-extension cadence while a handler runs. Must be well under the
    /// coordinator's lease duration or the reaper will steal live tasks.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Handle over a group of worker loops.
///
/// Shutdown stops the loops from taking new claims; in-flight handlers run
/// to completion and report normally.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n` workers executing the registry's kinds.
    pub fn spawn(
        n: usize,
        coordinator: Arc<Coordinator>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for _ in 0..n {
            let coord = Arc::clone(&coordinator);
            let reg = Arc::clone(&registry);
            let cfg = config.clone();
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                let worker_id = WorkerId::generate();
                info!(%worker_id, "worker started");
                worker_loop(worker_id, coord, reg, cfg, &mut rx).await;
                info!(%worker_id, "worker stopped");
            });
            joins.push(join);
        }

        Self { shutdown_tx, joins }
    }

    /// Ask all workers to stop after their current task.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
    }
}

async fn worker_loop(
    worker_id: WorkerId,
    coordinator: Arc<Coordinator>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let kinds = registry.kinds();
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match coordinator.claim(worker_id, &kinds).await {
            Ok(Some(record)) => {
                run_one(worker_id, &coordinator, &registry, &config, record).await;
            }
            Ok(None) => {
                // Nothing claimable; poll-wait, but wake promptly on shutdown.
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
            Err(e) if e.is_transient() => {
                warn!(%worker_id, error = %e, "claim failed; backing off");
                tokio::time::sleep(config.poll_interval).await;
            }
            Err(e) => {
                error!(%worker_id, error = %e, "claim failed");
                tokio::time::sleep(config.poll_interval).await;
            }
        }
    }
}

/// Execute one claimed task: mark Running, run the handler with a heartbeat
/// ticker, report the outcome.
async fn run_one(
    worker_id: WorkerId,
    coordinator: &Coordinator,
    registry: &HandlerRegistry,
    config: &WorkerConfig,
    record: TaskRecord,
) {
    let task_id = record.id;
    if let Err(e) = coordinator.start(task_id, worker_id).await {
        // The claim went stale between claim and start (reaped, cancelled).
        warn!(%worker_id, %task_id, error = %e, "could not start claimed task");
        return;
    }

    let envelope = record.envelope();
    let exec = registry.execute(&envelope);
    tokio::pin!(exec);

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result: Result<(), HandlerError> = loop {
        tokio::select! {
            res = &mut exec => break res,
            _ = heartbeat.tick() => {
                if let Err(e) = coordinator.heartbeat(task_id, worker_id).await {
                    // Stale claim: the reaper reassigned the task. Stop
                    // executing; whoever owns it now reports for it.
                    warn!(%worker_id, %task_id, error = %e, "heartbeat rejected; dropping task");
                    return;
                }
            }
        }
    };

    let report = match &result {
        Ok(()) => coordinator.complete(task_id, worker_id).await,
        Err(e) => {
            debug!(%worker_id, %task_id, error = %e, "handler failed");
            coordinator
                .fail(task_id, worker_id, e.is_retriable(), &e.to_string())
                .await
                .map(|_| ())
        }
    };
    if let Err(e) = report {
        warn!(%worker_id, %task_id, error = %e, "could not report task outcome");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use crate::domain::{TaskEnvelope, TaskKind, TaskState};
    use crate::ports::SystemClock;
    use crate::retry::BackoffPolicy;
    use crate::runtime::TaskHandler;
    use crate::store::MemoryTaskStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyHandler {
        remaining_failures: AtomicU32,
    }

    #[async_trait]
    impl TaskHandler for FlakyHandler {
        async fn handle(&self, _envelope: &TaskEnvelope) -> Result<(), HandlerError> {
            let left = self.remaining_failures.load(Ordering::Relaxed);
            if left > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
                return Err(HandlerError::retriable(format!("flaky (left={left})")));
            }
            Ok(())
        }
    }

    struct RejectingHandler;

    #[async_trait]
    impl TaskHandler for RejectingHandler {
        async fn handle(&self, _envelope: &TaskEnvelope) -> Result<(), HandlerError> {
            Err(HandlerError::permanent("malformed payload"))
        }
    }

    fn test_coordinator() -> Arc<Coordinator> {
        Arc::new(Coordinator::new(
            Arc::new(MemoryTaskStore::new()),
            Arc::new(SystemClock),
            BackoffPolicy::new(
                Duration::from_millis(10),
                Duration::from_millis(50),
                Duration::ZERO,
            ),
            CoordinatorConfig {
                default_max_attempts: 5,
                lease_duration: Duration::from_secs(30),
                reap_batch: 10,
            },
        ))
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(100),
        }
    }

    async fn wait_for_state(
        coordinator: &Coordinator,
        id: crate::domain::TaskId,
        want: TaskState,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = coordinator.get_status(id).await.unwrap();
                if status.state == want {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("task never reached {want}"));
    }

    #[tokio::test]
    async fn flaky_task_retries_to_success() {
        let coordinator = test_coordinator();
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                TaskKind::new("flaky"),
                Arc::new(FlakyHandler {
                    remaining_failures: AtomicU32::new(2),
                }),
            )
            .unwrap();

        let pool = WorkerPool::spawn(2, coordinator.clone(), Arc::new(registry), fast_config());

        let id = coordinator
            .enqueue(TaskKind::new("flaky"), serde_json::json!({"n": 1}))
            .await
            .unwrap();
        wait_for_state(&coordinator, id, TaskState::Succeeded).await;

        let status = coordinator.get_status(id).await.unwrap();
        assert_eq!(status.attempt_count, 3);

        pool.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn permanent_failure_lands_in_failed() {
        let coordinator = test_coordinator();
        let mut registry = HandlerRegistry::new();
        registry
            .register(TaskKind::new("reject"), Arc::new(RejectingHandler))
            .unwrap();

        let pool = WorkerPool::spawn(1, coordinator.clone(), Arc::new(registry), fast_config());

        let id = coordinator
            .enqueue(TaskKind::new("reject"), serde_json::json!({}))
            .await
            .unwrap();
        wait_for_state(&coordinator, id, TaskState::Failed).await;

        let status = coordinator.get_status(id).await.unwrap();
        assert_eq!(status.attempt_count, 1);
        assert!(status.last_error.as_deref().unwrap().contains("malformed"));

        pool.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn workers_ignore_unregistered_kinds() {
        let coordinator = test_coordinator();
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                TaskKind::new("known"),
                Arc::new(FlakyHandler {
                    remaining_failures: AtomicU32::new(0),
                }),
            )
            .unwrap();

        let pool = WorkerPool::spawn(1, coordinator.clone(), Arc::new(registry), fast_config());

        let other = coordinator
            .enqueue(TaskKind::new("other"), serde_json::json!({}))
            .await
            .unwrap();
        let known = coordinator
            .enqueue(TaskKind::new("known"), serde_json::json!({}))
            .await
            .unwrap();
        wait_for_state(&coordinator, known, TaskState::Succeeded).await;

        // Untouched: no handler registered for it in this pool.
        let status = coordinator.get_status(other).await.unwrap();
        assert_eq!(status.state, TaskState::Pending);
        assert_eq!(status.attempt_count, 0);

        pool.shutdown_and_join().await;
    }
}
