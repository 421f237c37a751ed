//! Strongly-typed identifiers.
//!
//! ULID-based: sortable by creation time, generatable on any node without
//! coordination, 128-bit. A phantom-typed `Id<T>` provides one implementation
//! for all id kinds while keeping them distinct at compile time (a `TaskId`
//! can never be passed where a `WorkerId` is expected).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for id kinds. Supplies the Display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic id wrapper. `T` is a zero-sized marker.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Generate a fresh id from the current time.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    /// Parses both the bare ULID and the prefixed Display form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ok(Self::from_ulid(Ulid::from_string(bare)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn prefix() -> &'static str {
        "worker-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Schedule {}

impl IdMarker for Schedule {
    fn prefix() -> &'static str {
        "schedule-"
    }
}

/// Identifier of a Task (the durable unit of work).
pub type TaskId = Id<Task>;

/// Identifier of a Worker process (claim ownership).
pub type WorkerId = Id<Worker>;

/// Identifier of a Schedule entry.
pub type ScheduleId = Id<Schedule>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_prefix() {
        let task = TaskId::generate();
        let worker = WorkerId::generate();

        assert!(task.to_string().starts_with("task-"));
        assert!(worker.to_string().starts_with("worker-"));
    }

    #[test]
    fn parse_round_trip() {
        let id = TaskId::generate();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);

        // Bare ULID also accepted.
        let bare: TaskId = id.as_ulid().to_string().parse().unwrap();
        assert_eq!(id, bare);
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let a = TaskId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = TaskId::generate();
        assert!(a < b);
    }

    #[test]
    fn serde_round_trip() {
        let id = WorkerId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: WorkerId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn marker_is_zero_sized() {
        assert_eq!(std::mem::size_of::<TaskId>(), std::mem::size_of::<Ulid>());
    }
}
