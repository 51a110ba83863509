//! Broker contract - the narrow interface the bus needs from a message broker.
//!
//! The bus never manages sockets or reconnection itself. It talks to a
//! [`Connection`] (the connection provider) and to short- or long-lived
//! [`Channel`]s handed out by it.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Connection (provider)                     │
//! │  is_connected() / try_connect() / create_channel()          │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Channel                             │
//! │  exchange_declare / queue_declare / queue_bind              │
//! │  basic_publish / basic_qos / basic_consume                  │
//! │  basic_ack / basic_nack / close                             │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                     │
//!          ▼                                     ▼
//! ┌─────────────────┐                 ┌─────────────────────┐
//! │ InMemoryBroker  │                 │  AMQP client        │
//! │   (included)    │                 │   (external)        │
//! └─────────────────┘                 └─────────────────────┘
//! ```

mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use in_memory::{InMemoryBroker, InMemoryChannel};

/// Exchange routing behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route to queues whose binding key equals the routing key.
    Direct,
    /// Route to every bound queue.
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

/// Queue declaration flags and arguments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// `x-dead-letter-exchange`: where rejected messages are republished.
    pub dead_letter_exchange: Option<String>,
}

impl QueueOptions {
    /// Durable, shared, never auto-deleted.
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// AMQP delivery mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    #[default]
    Transient,
    /// Written to disk by the broker (`delivery_mode = 2`).
    Persistent,
}

/// Basic message properties.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub delivery_mode: DeliveryMode,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
}

impl MessageProperties {
    /// Persistent JSON message with the given id.
    pub fn persistent_json(message_id: impl Into<String>) -> Self {
        Self {
            delivery_mode: DeliveryMode::Persistent,
            message_id: Some(message_id.into()),
            content_type: Some("application/json".to_string()),
        }
    }
}

/// A message pushed to a consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Tag used to ack or nack this delivery on the channel that received it.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    /// Set when the message was delivered before and requeued.
    pub redelivered: bool,
}

/// Broker answer to a publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted by the broker.
    Accepted,
    /// Mandatory message matched no queue and was returned to the publisher.
    Returned,
}

/// Consumer-side sink the broker pushes deliveries into.
pub type DeliverySender = mpsc::UnboundedSender<Delivery>;

/// Errors raised by broker operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("not connected to the broker")]
    NotConnected,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Redeclaration with different properties.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("publish rejected: {0}")]
    PublishRejected(String),

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("broker error: {0}")]
    Other(String),
}

/// A communication channel. Not meant to be shared by concurrent publishers.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare an exchange. Repeating an identical declaration is a no-op.
    async fn exchange_declare(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    /// Declare a queue. Repeating an identical declaration is a no-op.
    async fn queue_declare(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<PublishOutcome, BrokerError>;

    /// Limit unacknowledged deliveries held by this channel (0 = unlimited).
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Start pushing messages from `queue` into `deliveries` with manual acknowledgment.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        deliveries: DeliverySender,
    ) -> Result<(), BrokerError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Negatively acknowledge. With `requeue = false` the broker dead-letters
    /// or drops the message.
    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Close the channel; unacknowledged deliveries go back to their queues.
    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}

/// Connection provider: owns the broker connection and its reconnection policy.
#[async_trait]
pub trait Connection: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Connect if disconnected, retrying internally. Safe to call repeatedly.
    async fn try_connect(&self) -> bool;

    /// Open a channel on the live connection. Fails if there is none.
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;
}
