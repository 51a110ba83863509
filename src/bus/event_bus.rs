//! The `EventBus` facade: publish, subscribe, unsubscribe.

use std::any::type_name;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info, warn};

use crate::broker::Connection;
use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::event::IntegrationEvent;
use crate::handler::IntegrationEventHandler;
use crate::scope::ServiceProvider;

use super::consumer::Consumer;
use super::publisher::Publisher;
use super::registry::{SharedRegistry, SubscriptionRegistry};

/// Lifecycle of a bus. Only moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BusState {
    Uninitialized,
    /// A publish or subscribe reached the broker.
    ConnectionEstablished,
    /// The shared consumer channel is running.
    Consuming,
    Closed,
}

/// Integration event bus over a direct exchange.
///
/// Publishing opens a short-lived channel per event. The first subscription
/// starts one consumer channel that serves every subscribed event type.
///
/// ## Example
///
/// ```
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use serde::{Deserialize, Serialize};
/// use integration_bus::{
///     integration_event, EventBus, EventMetadata, HandlerError, InMemoryBroker,
///     IntegrationEventHandler, ServiceProvider,
/// };
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced {
///     #[serde(flatten)]
///     metadata: EventMetadata,
///     order_id: u64,
/// }
/// integration_event!(OrderPlaced);
///
/// struct ReserveStock;
///
/// #[async_trait]
/// impl IntegrationEventHandler<OrderPlaced> for ReserveStock {
///     async fn handle(&self, _event: &OrderPlaced) -> Result<(), HandlerError> {
///         Ok(())
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let services = ServiceProvider::new();
/// services.add_scoped(|_| ReserveStock);
///
/// let bus = EventBus::new(Arc::new(InMemoryBroker::new()), services);
/// bus.subscribe::<OrderPlaced, ReserveStock>().await.unwrap();
/// bus.publish(&OrderPlaced { metadata: EventMetadata::new(), order_id: 7 })
///     .await
///     .unwrap();
/// bus.shutdown().await.unwrap();
/// # }
/// ```
pub struct EventBus {
    connection: Arc<dyn Connection>,
    services: ServiceProvider,
    config: BusConfig,
    registry: SharedRegistry,
    publisher: Publisher,
    consumer: tokio::sync::Mutex<Option<Consumer>>,
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new(connection: Arc<dyn Connection>, services: ServiceProvider) -> Self {
        let config = BusConfig::default();
        Self {
            publisher: Self::publisher_for(&connection, &config),
            connection,
            services,
            config,
            registry: Arc::new(SubscriptionRegistry::new()),
            consumer: tokio::sync::Mutex::new(None),
            state: Mutex::new(BusState::Uninitialized),
        }
    }

    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.publisher = Self::publisher_for(&self.connection, &config);
        self.config = config;
        self
    }

    fn publisher_for(connection: &Arc<dyn Connection>, config: &BusConfig) -> Publisher {
        Publisher::new(
            Arc::clone(connection),
            config.exchange_name.clone(),
            config.publish_retry,
            config.fail_on_unroutable,
        )
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn state(&self) -> BusState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, to: BusState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state < to && *state != BusState::Closed {
            debug!(from = ?*state, to = ?to, "event bus state change");
            *state = to;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == BusState::Closed {
            return Err(BusError::Closed);
        }
        Ok(())
    }

    /// Publish `event` with routing key `E::NAME`, retrying broker failures.
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<()> {
        self.ensure_open()?;
        let result = self.publisher.publish(event).await;
        let reached_broker = match &result {
            Ok(()) => true,
            Err(BusError::PublishFailed { .. } | BusError::Unroutable { .. }) => true,
            Err(BusError::Broker(_)) => true,
            Err(_) => false,
        };
        if reached_broker {
            self.advance(BusState::ConnectionEstablished);
        }
        result
    }

    /// Publish and log any failure instead of returning it.
    ///
    /// For call sites where a lost integration event must not fail the
    /// business operation that raised it. Returns whether the publish succeeded.
    pub async fn publish_or_log<E: IntegrationEvent>(&self, event: &E) -> bool {
        match self.publish(event).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    event_id = %event.id(),
                    event_name = E::NAME,
                    error = %err,
                    "failed to publish integration event"
                );
                false
            }
        }
    }

    /// Register handler `H` for event `E` and make sure `E`'s queue is consumed.
    ///
    /// Fails with [`BusError::DuplicateSubscription`] if `H` is already
    /// registered for `E`, or [`BusError::EventNameConflict`] if another event
    /// type owns `E::NAME`. If the queue cannot be set up the registration is
    /// undone. A consumer whose channel was lost is rebuilt here.
    pub async fn subscribe<E, H>(&self) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.ensure_open()?;
        self.registry.add::<E, H>()?;
        info!(
            event_name = E::NAME,
            handler = type_name::<H>(),
            "subscribing to event"
        );

        if let Err(err) = self.consume(E::NAME).await {
            self.registry.remove::<E, H>();
            return Err(err);
        }
        Ok(())
    }

    /// Remove handler `H` from event `E`. Returns whether it was registered.
    ///
    /// The queue stays bound and consumed; later deliveries for an event with
    /// no handlers left are acknowledged and dropped.
    pub fn unsubscribe<E, H>(&self) -> bool
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let removed = self.registry.remove::<E, H>();
        if removed {
            info!(
                event_name = E::NAME,
                handler = type_name::<H>(),
                "unsubscribed from event"
            );
        }
        removed
    }

    async fn consume(&self, event_name: &str) -> Result<()> {
        let mut consumer = self.consumer.lock().await;
        if let Some(running) = consumer.as_ref() {
            if running.is_open() {
                return running.ensure_queue(event_name).await;
            }
        }

        if let Some(stale) = consumer.take() {
            warn!("consumer channel closed, restarting consumer");
            if let Err(err) = stale.shutdown().await {
                debug!(error = %err, "failed to tear down closed consumer");
            }
        }

        let started = Consumer::start(
            self.connection.as_ref(),
            Arc::clone(&self.registry),
            self.services.clone(),
            self.config.clone(),
        )
        .await?;
        // a rebuilt consumer has to pick up every queue the old one served
        for subscribed in self.registry.event_names() {
            started.ensure_queue(&subscribed).await?;
        }
        started.ensure_queue(event_name).await?;

        self.advance(BusState::Consuming);
        *consumer = Some(started);
        Ok(())
    }

    pub fn is_subscribed<E: IntegrationEvent>(&self) -> bool {
        self.registry.contains(E::NAME)
    }

    /// Handler type names registered for `event_name`, in dispatch order.
    pub fn handler_names(&self, event_name: &str) -> Vec<&'static str> {
        self.registry.handler_names(event_name)
    }

    pub fn subscribed_events(&self) -> Vec<String> {
        self.registry.event_names()
    }

    /// Stop consuming and close the consumer channel.
    ///
    /// A message being handled is finished first. Queues and the exchange are
    /// left on the broker. Calling this more than once is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == BusState::Closed {
                return Ok(());
            }
            *state = BusState::Closed;
        }

        let consumer = self.consumer.lock().await.take();
        if let Some(consumer) = consumer {
            consumer.shutdown().await?;
        }
        info!("event bus shut down");
        Ok(())
    }
}
