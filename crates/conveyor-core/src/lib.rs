//! conveyor-core
//!
//! Job distribution and scheduling core for a multi-service backend: an API
//! process and a periodic scheduler produce tasks, a worker pool claims and
//! executes them, and a durable store serializes every state transition.
//!
//! Module map:
//! - **domain**: ids, task kinds/envelopes, the task state machine, the
//!   durable record, error types
//! - **store**: the `TaskStore` port plus in-memory and SQLite
//!   implementations
//! - **coordinator**: task lifecycle owner (enqueue / claim / heartbeat /
//!   complete / fail / cancel / reap / status)
//! - **runtime**: `TaskHandler` trait and the kind -> handler registry
//! - **worker**: the claim -> execute -> report pool
//! - **scheduler**: drift-free recurring enqueues
//! - **reaper**: visibility-timeout recovery loop
//! - **ports**: clock and external service contracts (inference, search
//!   index)
//! - **retry**: the backoff policy
//! - **observability**: queue counts and task status views

pub mod coordinator;
pub mod domain;
pub mod observability;
pub mod ports;
pub mod reaper;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use coordinator::{Coordinator, CoordinatorConfig, EnqueueOptions};
pub use domain::{Error, HandlerError, TaskEnvelope, TaskId, TaskKind, TaskState, WorkerId};
pub use observability::{QueueCounts, TaskStatus};
pub use reaper::ReaperLoop;
pub use retry::BackoffPolicy;
pub use runtime::{HandlerRegistry, TaskHandler};
pub use scheduler::{ScheduleEntry, Scheduler};
pub use store::{MemoryTaskStore, SqliteTaskStore, TaskStore};
pub use worker::{WorkerConfig, WorkerPool};
