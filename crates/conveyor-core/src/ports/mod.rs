//! Ports: interfaces to things outside the coordination core.
//!
//! Each trait hides an external system (clock, model-serving endpoint,
//! search index) behind a narrow contract so implementations can be swapped
//! and tests can use fakes.

pub mod clock;
pub mod inference;
pub mod search;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::inference::{InferenceClient, Prediction};
pub use self::search::{SearchIndexWriter, index_best_effort};
