use thiserror::Error;

use crate::broker::BrokerError;

/// Error returned by the public [`EventBus`](crate::EventBus) operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// No live broker connection could be obtained, even after `try_connect`.
    #[error("broker connection unavailable: {0}")]
    ConnectionUnavailable(#[source] BrokerError),

    /// Every publish attempt failed; carries the last broker error.
    #[error("publishing {event_name} failed after {attempts} attempt(s): {source}")]
    PublishFailed {
        event_name: &'static str,
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    /// The broker returned a mandatory message because no queue is bound to its routing key.
    #[error("no queue is bound for routing key {event_name}")]
    Unroutable { event_name: &'static str },

    /// The handler type is already registered for the event name.
    #[error("handler {handler} already registered for '{event_name}'")]
    DuplicateSubscription {
        event_name: String,
        handler: &'static str,
    },

    /// A different event type is already subscribed under this name.
    #[error("event name '{event_name}' is taken by {registered}, cannot subscribe {requested}")]
    EventNameConflict {
        event_name: &'static str,
        registered: &'static str,
        requested: &'static str,
    },

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The bus has been shut down.
    #[error("event bus is shut down")]
    Closed,

    #[error("configuration error: {0}")]
    Config(#[source] Box<figment::Error>),
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;
