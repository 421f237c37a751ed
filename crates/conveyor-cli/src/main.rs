//! End-to-end demo: SQLite-backed coordinator, a small worker pool, the
//! reaper, and a recurring schedule, wired together the way the real
//! API/worker/scheduler processes would be.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::info;

use conveyor_core::coordinator::{Coordinator, CoordinatorConfig};
use conveyor_core::domain::{HandlerError, TaskEnvelope, TaskKind};
use conveyor_core::ports::{
    Clock, InferenceClient, Prediction, SearchIndexWriter, SystemClock, index_best_effort,
};
use conveyor_core::reaper::ReaperLoop;
use conveyor_core::retry::BackoffPolicy;
use conveyor_core::runtime::{HandlerRegistry, TaskHandler};
use conveyor_core::scheduler::{ScheduleEntry, Scheduler};
use conveyor_core::store::SqliteTaskStore;
use conveyor_core::worker::{WorkerConfig, WorkerPool};

/// Stand-in for the model-serving endpoint; fails a few times first so the
/// retry path is visible in the logs.
struct StubInference {
    remaining_failures: AtomicU32,
}

#[async_trait]
impl InferenceClient for StubInference {
    async fn predict(&self, input: &serde_json::Value) -> Result<Prediction, HandlerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::retriable(format!(
                "inference endpoint unavailable (left={left})"
            )));
        }
        Ok(serde_json::json!({
            "input": input,
            "label": "en:organic",
            "confidence": 0.93,
        }))
    }
}

/// Stand-in for the search index.
struct StubSearchIndex;

#[async_trait]
impl SearchIndexWriter for StubSearchIndex {
    async fn index(&self, doc_id: &str, _doc: &serde_json::Value) -> Result<(), String> {
        info!(doc_id, "indexed document");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PredictPayload {
    barcode: String,
}

/// Runs one prediction and pushes the result to the search index.
struct PredictHandler {
    inference: Arc<dyn InferenceClient>,
    search: Arc<dyn SearchIndexWriter>,
}

#[async_trait]
impl TaskHandler for PredictHandler {
    async fn handle(&self, envelope: &TaskEnvelope) -> Result<(), HandlerError> {
        let payload: PredictPayload = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| HandlerError::permanent(format!("bad payload: {e}")))?;

        let prediction = self.inference.predict(envelope.payload()).await?;
        info!(barcode = %payload.barcode, %prediction, "prediction ready");

        // Off the critical path: a failed index write never fails the task.
        index_best_effort(self.search.as_ref(), &payload.barcode, &prediction).await;
        Ok(())
    }
}

/// Recurring housekeeping kind fired by the scheduler.
struct RefreshHandler;

#[async_trait]
impl TaskHandler for RefreshHandler {
    async fn handle(&self, _envelope: &TaskEnvelope) -> Result<(), HandlerError> {
        info!("refresh pass done");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let data_dir = std::env::temp_dir().join("conveyor-demo");
    std::fs::create_dir_all(&data_dir)?;
    let store = SqliteTaskStore::open(&data_dir)?;

    let clock = Arc::new(SystemClock);
    let coordinator = Arc::new(Coordinator::new(
        Arc::new(store),
        clock.clone(),
        BackoffPolicy::new(
            Duration::from_millis(200),
            Duration::from_secs(5),
            Duration::from_millis(100),
        ),
        CoordinatorConfig {
            default_max_attempts: 5,
            lease_duration: Duration::from_secs(10),
            reap_batch: 50,
        },
    ));

    let mut registry = HandlerRegistry::new();
    registry.register(
        TaskKind::new("predict"),
        Arc::new(PredictHandler {
            inference: Arc::new(StubInference {
                remaining_failures: AtomicU32::new(2),
            }),
            search: Arc::new(StubSearchIndex),
        }),
    )?;
    registry.register(TaskKind::new("refresh"), Arc::new(RefreshHandler))?;

    let pool = WorkerPool::spawn(
        2,
        coordinator.clone(),
        Arc::new(registry),
        WorkerConfig {
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(3),
        },
    );
    let reaper = ReaperLoop::spawn(coordinator.clone(), Duration::from_secs(2));

    let mut scheduler = Scheduler::new(coordinator.clone(), clock.clone(), Duration::from_millis(500));
    scheduler.add_entry(ScheduleEntry::new(
        TaskKind::new("refresh"),
        serde_json::json!({"scope": "all"}),
        Duration::from_secs(2),
        clock.now(),
    ));
    let scheduler = scheduler.spawn();

    // What the API process would do: enqueue and poll status.
    let id = coordinator
        .enqueue(
            TaskKind::new("predict"),
            serde_json::json!({"barcode": "3017620422003"}),
        )
        .await?;
    info!(task_id = %id, "enqueued prediction task");

    loop {
        let status = coordinator.get_status(id).await?;
        if status.state.is_terminal() {
            info!(
                state = %status.state,
                attempts = status.attempt_count,
                last_error = ?status.last_error,
                "prediction task finished"
            );
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    // Let the schedule fire a couple of times before shutting down.
    sleep(Duration::from_secs(5)).await;
    info!(counts = ?coordinator.counts().await?, "queue counts");

    scheduler.shutdown_and_join().await;
    reaper.shutdown_and_join().await;
    pool.shutdown_and_join().await;
    Ok(())
}
