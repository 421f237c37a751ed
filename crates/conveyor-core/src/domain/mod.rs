//! Domain model: ids, task kinds and envelopes, the task state machine, and
//! the durable task record.

pub mod errors;
pub mod ids;
pub mod record;
pub mod state;
pub mod task;

pub use errors::{Error, HandlerError};
pub use ids::{ScheduleId, TaskId, WorkerId};
pub use record::TaskRecord;
pub use state::TaskState;
pub use task::{TaskEnvelope, TaskKind};
