//! Task handlers and the kind -> handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{HandlerError, TaskEnvelope, TaskKind};

/// A handler for one task kind.
///
/// Handlers get the whole envelope and decode the payload as they like.
/// They may call the inference service or write to the search index; the
/// core only cares about the returned classification (retriable vs
/// permanent).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, envelope: &TaskEnvelope) -> Result<(), HandlerError>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate handler for kind={0}")]
    DuplicateHandler(TaskKind),
}

/// Registry of handlers (kind -> handler).
///
/// Built during initialization (mutable), used during runtime (immutable);
/// no locks needed on the execution path.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registering the same kind twice is a wiring bug
    /// and fails fast.
    pub fn register(
        &mut self,
        kind: TaskKind,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::DuplicateHandler(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: &TaskKind) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(kind)
    }

    /// The kinds this registry can execute; what a worker passes to `claim`.
    pub fn kinds(&self) -> Vec<TaskKind> {
        self.handlers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Execute one envelope. A kind with no handler is a permanent failure:
    /// retrying cannot make a handler appear.
    pub async fn execute(&self, envelope: &TaskEnvelope) -> Result<(), HandlerError> {
        let handler = self.get(envelope.kind()).ok_or_else(|| {
            HandlerError::permanent(format!("no handler for kind={}", envelope.kind()))
        })?;
        handler.handle(envelope).await
    }
}
