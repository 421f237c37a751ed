//! Search index port.
//!
//! Index writes are asynchronous and off the coordination path: a failed
//! write is logged and the task still completes (eventual consistency).

use async_trait::async_trait;
use tracing::warn;

/// Asynchronous write/index operation on the search index.
#[async_trait]
pub trait SearchIndexWriter: Send + Sync {
    /// Index one document. Errors are reported but carry no task-level
    /// consequence.
    async fn index(&self, doc_id: &str, doc: &serde_json::Value) -> Result<(), String>;
}

/// Fire-and-forget helper: attempt the write, log on failure, never fail the
/// caller.
pub async fn index_best_effort(
    writer: &dyn SearchIndexWriter,
    doc_id: &str,
    doc: &serde_json::Value,
) {
    if let Err(e) = writer.index(doc_id, doc).await {
        warn!(doc_id, error = %e, "search index write failed; continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingWriter;

    #[async_trait]
    impl SearchIndexWriter for FailingWriter {
        async fn index(&self, _doc_id: &str, _doc: &serde_json::Value) -> Result<(), String> {
            Err("index offline".into())
        }
    }

    #[tokio::test]
    async fn index_failure_does_not_propagate() {
        // Must return normally; completion never rolls back on index errors.
        index_best_effort(&FailingWriter, "doc-1", &serde_json::json!({})).await;
    }
}
