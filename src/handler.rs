//! Integration event handlers.

use std::error::Error;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::IntegrationEvent;

/// Handles one integration event type.
///
/// Instances are resolved from a fresh [`Scope`](crate::Scope) for every
/// delivered message, so handlers may hold per-message state. Returning an
/// error makes the bus requeue the whole message; handlers must tolerate
/// seeing the same event more than once.
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync + 'static {
    async fn handle(&self, event: &E) -> Result<(), HandlerError>;
}

/// Failure reported by a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler refused the event.
    #[error("rejected: {0}")]
    Rejected(String),

    /// A dependency (database, cache, remote service) failed.
    #[error("dependency failed: {0}")]
    Dependency(String),

    /// The handler panicked while processing the event.
    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("handler error: {0}")]
    Other(#[source] Box<dyn Error + Send + Sync>),
}

impl HandlerError {
    /// Wrap any error type.
    pub fn other(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        HandlerError::Other(err.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Other(Box::new(err))
    }
}
