//! # integration_bus
//!
//! Integration events between microservices over a message broker.
//!
//! - [`EventBus::publish`] serializes an event to JSON and publishes it to a
//!   shared direct exchange with routing key = the event's name, retrying
//!   broker failures with exponential backoff.
//! - [`EventBus::subscribe`] registers a handler type for an event type and
//!   makes sure that event's queue is declared, bound, and consumed.
//! - A single consumer channel decodes each delivery, runs its handlers in
//!   order inside one resolution [`Scope`], then acks, or nacks and requeues
//!   when a handler fails.
//!
//! The broker is reached through the [`broker::Connection`] and
//! [`broker::Channel`] traits. [`InMemoryBroker`] implements them in process.

pub mod broker;
pub mod bus;
pub mod config;
mod error;
mod event;
mod handler;
mod scope;

pub use broker::{BrokerError, Connection, InMemoryBroker};
pub use bus::{BusState, EventBus, RetryPolicy};
pub use config::{BrokerSettings, BusConfig, DeadLetterConfig};
pub use error::{BusError, Result};
pub use event::{EventMetadata, IntegrationEvent};
pub use handler::{HandlerError, IntegrationEventHandler};
pub use scope::{Scope, ServiceProvider};
