//! Consumer loop - one long-lived channel shared by every subscription.
//!
//! ```text
//! queue per event type ──► basic_consume ──► mpsc ──► consumer task
//!                                                        │
//!                     ┌──────────────────────────────────┘
//!                     ▼
//!   routing key ─► registry snapshot ─► decode ─► scope ─► handlers (in order)
//!                                                        │
//!                          ack ◄── all handlers Ok ──────┤
//!             nack(requeue) ◄── a handler failed ────────┤
//!       nack(dead-letter) ◄── failed max_deliveries times┘
//! ```
//!
//! The channel runs with a prefetch of one, so a message is processed to
//! completion across all its handlers before the next is delivered.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::broker::{
    BrokerError, Channel, Connection, Delivery, DeliverySender, ExchangeKind, QueueOptions,
};
use crate::config::{BusConfig, DeadLetterConfig};
use crate::error::BusError;
use crate::handler::HandlerError;
use crate::scope::ServiceProvider;

use super::registry::{Invocation, SharedRegistry};

/// What happened to one delivery.
#[derive(Debug)]
pub(crate) enum DeliveryOutcome {
    /// Every handler completed.
    Handled,
    /// Nobody is subscribed to the routing key.
    NoSubscription,
    /// The payload could not be decoded into the subscribed event type.
    Undecodable(serde_json::Error),
    /// A handler failed; remaining handlers were not run.
    HandlerFailed {
        handler: &'static str,
        error: HandlerError,
    },
}

/// Running consumer: shared channel, bound queues, and the dispatch task.
pub(crate) struct Consumer {
    channel: Arc<dyn Channel>,
    config: BusConfig,
    deliveries: DeliverySender,
    consumed: Mutex<HashSet<String>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Consumer {
    /// Open the consumer channel, declare the exchange, and spawn the dispatch task.
    pub(crate) async fn start(
        connection: &dyn Connection,
        registry: SharedRegistry,
        services: ServiceProvider,
        config: BusConfig,
    ) -> Result<Self, BusError> {
        trace!("starting basic consume");

        if !connection.is_connected() {
            connection.try_connect().await;
        }
        let channel = connection
            .create_channel()
            .await
            .map_err(BusError::ConnectionUnavailable)?;

        channel
            .exchange_declare(&config.exchange_name, ExchangeKind::Direct)
            .await?;
        if config.dead_letter.enabled {
            channel
                .exchange_declare(&config.dead_letter_exchange(), ExchangeKind::Direct)
                .await?;
        }
        channel.basic_qos(1).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            Arc::clone(&channel),
            registry,
            services,
            config.dead_letter.clone(),
        );
        let task = tokio::spawn(dispatcher.run(rx, cancel.clone()));

        Ok(Self {
            channel,
            config,
            deliveries: tx,
            consumed: Mutex::new(HashSet::new()),
            cancel,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }

    /// Whether the consumer channel is still usable. False after a connection drop.
    pub(crate) fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.channel.is_open()
    }

    /// Declare, bind, and start consuming the queue for `event_name`, once.
    pub(crate) async fn ensure_queue(&self, event_name: &str) -> Result<(), BusError> {
        let mut consumed = self.consumed.lock().await;
        if consumed.contains(event_name) {
            return Ok(());
        }

        let exchange = &self.config.exchange_name;
        let queue = self.config.queue_name(event_name);
        let mut options = QueueOptions::durable();

        if self.config.dead_letter.enabled {
            let dlx = self.config.dead_letter_exchange();
            let dead_letter_queue = self.config.dead_letter_queue_name(event_name);
            self.channel
                .queue_declare(&dead_letter_queue, &QueueOptions::durable())
                .await?;
            self.channel
                .queue_bind(&dead_letter_queue, &dlx, event_name)
                .await?;
            options = options.with_dead_letter_exchange(dlx);
        }

        self.channel.queue_declare(&queue, &options).await?;
        self.channel.queue_bind(&queue, exchange, event_name).await?;
        self.channel
            .basic_consume(
                &queue,
                &format!("{}_consumer", event_name),
                self.deliveries.clone(),
            )
            .await?;

        debug!(event_name, queue = %queue, "consuming event queue");
        consumed.insert(event_name.to_string());
        Ok(())
    }

    /// Stop taking deliveries, let the current message finish, close the channel.
    pub(crate) async fn shutdown(&self) -> Result<(), BusError> {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "consumer task ended abnormally");
            }
        }
        self.closed.store(true, Ordering::SeqCst);
        self.channel.close().await?;
        debug!("consumer channel closed");
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.closed.load(Ordering::SeqCst) || !self.channel.is_open() {
            return;
        }
        // dropped without shutdown: the broker requeues whatever is still unacked
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let channel = Arc::clone(&self.channel);
            runtime.spawn(async move {
                if let Err(err) = channel.close().await {
                    debug!(error = %err, "failed to close dropped consumer channel");
                }
            });
        }
    }
}

/// State owned by the consumer task.
struct Dispatcher {
    channel: Arc<dyn Channel>,
    registry: SharedRegistry,
    services: ServiceProvider,
    dead_letter: DeadLetterConfig,
    /// Handler failures per message still being redelivered. Only kept with
    /// dead-lettering on.
    failures: HashMap<String, u32>,
}

impl Dispatcher {
    fn new(
        channel: Arc<dyn Channel>,
        registry: SharedRegistry,
        services: ServiceProvider,
        dead_letter: DeadLetterConfig,
    ) -> Self {
        Self {
            channel,
            registry,
            services,
            dead_letter,
            failures: HashMap::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Delivery>, cancel: CancellationToken) {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivery = rx.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            self.handle(delivery).await;
        }
        trace!("consumer loop stopped");
    }

    async fn handle(&mut self, delivery: Delivery) {
        let key = failure_key(&delivery);
        if !delivery.redelivered {
            // a first delivery starts a fresh count
            self.failures.remove(&key);
        }

        let outcome = process(&self.registry, &self.services, &delivery).await;
        if !matches!(outcome, DeliveryOutcome::HandlerFailed { .. }) {
            self.failures.remove(&key);
        }
        let tag = delivery.delivery_tag;
        let event_name = delivery.routing_key.as_str();

        let result = match outcome {
            DeliveryOutcome::Handled | DeliveryOutcome::NoSubscription => {
                self.channel.basic_ack(tag).await
            }
            DeliveryOutcome::Undecodable(err) if self.dead_letter.enabled => {
                error!(event_name, error = %err, "undecodable payload, dead-lettering");
                self.channel.basic_nack(tag, false).await
            }
            DeliveryOutcome::Undecodable(err) => {
                error!(event_name, error = %err, "undecodable payload, dropping");
                self.channel.basic_ack(tag).await
            }
            DeliveryOutcome::HandlerFailed { handler, error } if self.dead_letter.enabled => {
                let failures = {
                    let count = self.failures.entry(key.clone()).or_insert(0);
                    *count += 1;
                    *count
                };

                if failures >= self.dead_letter.max_deliveries {
                    error!(
                        event_name,
                        handler,
                        failures,
                        error = %error,
                        "handler kept failing, dead-lettering message"
                    );
                    self.failures.remove(&key);
                    self.channel.basic_nack(tag, false).await
                } else {
                    warn!(
                        event_name,
                        handler,
                        failures,
                        error = %error,
                        "error processing message, requeueing"
                    );
                    self.channel.basic_nack(tag, true).await
                }
            }
            DeliveryOutcome::HandlerFailed { handler, error } => {
                warn!(
                    event_name,
                    handler,
                    error = %error,
                    "error processing message, requeueing"
                );
                self.channel.basic_nack(tag, true).await
            }
        };

        if let Err(err) = result {
            log_settle_error(tag, &err);
        }
    }
}

/// Dispatch one delivery to its handlers.
pub(crate) async fn process(
    registry: &SharedRegistry,
    services: &ServiceProvider,
    delivery: &Delivery,
) -> DeliveryOutcome {
    let event_name = delivery.routing_key.as_str();
    trace!(event_name, delivery_tag = delivery.delivery_tag, "processing event");

    let Some(subscription) = registry.snapshot(event_name) else {
        warn!(event_name, "no subscription for event");
        return DeliveryOutcome::NoSubscription;
    };

    let event = match (subscription.decode)(&delivery.body) {
        Ok(event) => event,
        Err(err) => return DeliveryOutcome::Undecodable(err),
    };

    let scope = services.create_scope();
    for handler in &subscription.handlers {
        let invocation = AssertUnwindSafe(handler.invoke(&scope, &event))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Invocation::Failed(HandlerError::Panicked(panic_message(panic)))
            });

        match invocation {
            Invocation::Completed => {}
            Invocation::Unresolved => {
                warn!(
                    event_name = event.name(),
                    handler = handler.name(),
                    "handler not registered with the service provider, skipping"
                );
            }
            Invocation::TypeMismatch => {
                warn!(
                    event_name,
                    handler = handler.name(),
                    "decoded event type mismatch, skipping"
                );
            }
            Invocation::Failed(error) => {
                return DeliveryOutcome::HandlerFailed {
                    handler: handler.name(),
                    error,
                };
            }
        }
    }

    DeliveryOutcome::Handled
}

fn failure_key(delivery: &Delivery) -> String {
    match &delivery.properties.message_id {
        Some(id) => format!("{}:{}", delivery.routing_key, id),
        None => {
            let mut hasher = DefaultHasher::new();
            delivery.body.hash(&mut hasher);
            format!("{}#{:x}", delivery.routing_key, hasher.finish())
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_settle_error(delivery_tag: u64, err: &BrokerError) {
    error!(delivery_tag, error = %err, "failed to settle delivery");
}
