//! Inference service port.
//!
//! Workers call the model-serving endpoint synchronously during task
//! execution. The core treats it as stateless: one request in, one
//! prediction out. Timeouts and transport errors surface as retriable
//! handler failures.

use async_trait::async_trait;

use crate::domain::HandlerError;

/// A prediction returned by the inference endpoint. Opaque to the core.
pub type Prediction = serde_json::Value;

/// Synchronous request/response prediction endpoint.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Run one model input through the endpoint.
    ///
    /// Implementations map timeouts and transport failures to
    /// `HandlerError::Retriable` so the task is backed off and retried.
    async fn predict(&self, input: &serde_json::Value) -> Result<Prediction, HandlerError>;
}
