//! In-memory broker for testing and single-process scenarios.
//!
//! [`InMemoryBroker`] implements both [`Connection`] and, through
//! [`InMemoryChannel`], the full [`Channel`] contract:
//! - direct and fanout exchanges, durable queues, bindings
//! - mandatory publishes returned when no queue matches
//! - push delivery with manual ack, prefetch limits, requeue on nack
//! - dead-letter routing for messages rejected without requeue
//! - connection drop / restore and publish fault injection
//!
//! ## Example
//!
//! ```
//! use integration_bus::broker::{
//!     Channel, Connection, ExchangeKind, InMemoryBroker, MessageProperties, QueueOptions,
//! };
//!
//! # tokio_test_block(async {
//! let broker = InMemoryBroker::new();
//! let channel = broker.create_channel().await.unwrap();
//!
//! channel.exchange_declare("events", ExchangeKind::Direct).await.unwrap();
//! channel.queue_declare("OrderCreated_queue", &QueueOptions::durable()).await.unwrap();
//! channel.queue_bind("OrderCreated_queue", "events", "OrderCreated").await.unwrap();
//!
//! channel
//!     .basic_publish("events", "OrderCreated", true, &MessageProperties::default(), b"{}")
//!     .await
//!     .unwrap();
//!
//! assert_eq!(broker.queue_depth("OrderCreated_queue"), 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, trace};

use super::{
    BrokerError, Channel, Connection, Delivery, DeliverySender, ExchangeKind, MessageProperties,
    PublishOutcome, QueueOptions,
};

/// In-process message broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    connected: bool,
    reconnect_allowed: bool,
    next_channel_id: u64,
    next_delivery_tag: u64,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, ChannelState>,
    failing_publishes: u32,
    published: u64,
    channels_opened: u64,
}

struct ChannelState {
    open: Arc<AtomicBool>,
    prefetch: u16,
    unacked: usize,
}

#[derive(Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    channel_id: u64,
    message: Message,
}

struct ConsumerEntry {
    channel_id: u64,
    tag: String,
    sender: DeliverySender,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a connected broker with no topology.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                connected: true,
                reconnect_allowed: true,
                next_channel_id: 0,
                next_delivery_tag: 0,
                exchanges: HashMap::new(),
                queues: HashMap::new(),
                bindings: Vec::new(),
                channels: HashMap::new(),
                failing_publishes: 0,
                published: 0,
                channels_opened: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the connection. Every open channel is closed and its
    /// unacknowledged deliveries are requeued.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.connected = false;
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id);
        }
        debug!("in-memory broker disconnected");
    }

    /// Whether `try_connect` may restore a dropped connection.
    pub fn set_reconnect_allowed(&self, allowed: bool) {
        self.lock().reconnect_allowed = allowed;
    }

    /// Make the next `count` publishes fail with [`BrokerError::PublishRejected`].
    pub fn fail_next_publishes(&self, count: u32) {
        self.lock().failing_publishes = count;
    }

    /// Messages waiting in a queue (not yet delivered).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from a queue and awaiting acknowledgment.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Consumer tags registered on a queue.
    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.lock().queues.get(queue).map_or_else(Vec::new, |q| {
            q.consumers.iter().map(|c| c.tag.clone()).collect()
        })
    }

    /// Publishes accepted by the broker (routed or not).
    pub fn published_count(&self) -> u64 {
        self.lock().published
    }

    /// Channels created over the broker's lifetime.
    pub fn channels_opened(&self) -> u64 {
        self.lock().channels_opened
    }

    pub fn open_channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    /// Declared queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(exchange).copied()
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.lock().queues.get(queue).map(|q| q.options.clone())
    }

    pub fn has_binding(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.lock().bindings.iter().any(|b| {
            b.exchange == exchange && b.queue == queue && b.routing_key == routing_key
        })
    }

    /// Bodies of the messages waiting in a queue, oldest first.
    pub fn peek_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock().queues.get(queue).map_or_else(Vec::new, |q| {
            q.ready.iter().map(|m| m.body.clone()).collect()
        })
    }
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        let Some(kind) = self.exchanges.get(exchange) else {
            return Vec::new();
        };
        self.bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Fanout => true,
            })
            .map(|b| b.queue.clone())
            .collect()
    }

    fn enqueue(&mut self, queue: &str, message: Message) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_back(message);
        }
        self.dispatch(queue);
    }

    /// Push ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self, queue_name: &str) {
        let BrokerState {
            queues,
            channels,
            next_delivery_tag,
            ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&idx| {
                    channels
                        .get(&queue.consumers[idx].channel_id)
                        .is_some_and(|c| c.prefetch == 0 || c.unacked < usize::from(c.prefetch))
                });
            let Some(idx) = chosen else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            *next_delivery_tag += 1;
            let tag = *next_delivery_tag;
            let delivery = Delivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                properties: message.properties.clone(),
                body: message.body.clone(),
                redelivered: message.redelivered,
            };

            let channel_id = queue.consumers[idx].channel_id;
            if queue.consumers[idx].sender.send(delivery).is_err() {
                // receiver dropped
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                continue;
            }

            queue.next_consumer = (idx + 1) % count;
            if let Some(channel) = channels.get_mut(&channel_id) {
                channel.unacked += 1;
            }
            queue.unacked.insert(
                tag,
                Unacked {
                    channel_id,
                    message,
                },
            );
            trace!(queue = queue_name, delivery_tag = tag, "message delivered");
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn take_unacked(
        &mut self,
        channel_id: u64,
        tag: u64,
    ) -> Result<(String, Message), BrokerError> {
        let queue_name = self
            .queues
            .iter()
            .find(|(_, q)| {
                q.unacked
                    .get(&tag)
                    .is_some_and(|u| u.channel_id == channel_id)
            })
            .map(|(name, _)| name.clone())
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;

        let unacked = self
            .queues
            .get_mut(&queue_name)
            .and_then(|q| q.unacked.remove(&tag))
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;

        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.unacked = channel.unacked.saturating_sub(1);
        }
        Ok((queue_name, unacked.message))
    }

    fn dead_letter(&mut self, queue_name: &str, mut message: Message) {
        let dlx = self
            .queues
            .get(queue_name)
            .and_then(|q| q.options.dead_letter_exchange.clone());
        let Some(dlx) = dlx else {
            trace!(queue = queue_name, "rejected message dropped");
            return;
        };

        message.exchange = dlx.clone();
        message.redelivered = false;
        for target in self.route(&dlx, &message.routing_key) {
            debug!(from = queue_name, to = %target, "message dead-lettered");
            self.enqueue(&target, message.clone());
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };
        channel.open.store(false, Ordering::SeqCst);

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.channel_id == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            let mut returned: Vec<(u64, Message)> = tags
                .into_iter()
                .filter_map(|tag| queue.unacked.remove(&tag).map(|u| (tag, u.message)))
                .collect();
            // oldest delivery ends up first
            returned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            for (_, mut message) in returned {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        self.dispatch_all();
    }
}

/// Channel on an [`InMemoryBroker`].
pub struct InMemoryChannel {
    id: u64,
    open: Arc<AtomicBool>,
    broker: InMemoryBroker,
}

impl InMemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn usable(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let state = self.broker.lock();
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed);
        }
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        Ok(state)
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn exchange_declare(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut state = self.usable()?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::PreconditionFailed(format!(
                "exchange '{}' already declared as {}",
                name,
                existing.as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.usable()?;
        match state.queues.get(name) {
            Some(existing) if existing.options != *options => Err(
                BrokerError::PreconditionFailed(format!(
                    "queue '{}' already declared with different arguments",
                    name
                )),
            ),
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(name.to_string(), QueueState::new(options.clone()));
                Ok(())
            }
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.usable()?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            });
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<PublishOutcome, BrokerError> {
        let mut state = self.usable()?;
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BrokerError::PublishRejected(
                "injected publish failure".to_string(),
            ));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            });
        }

        state.published += 1;
        let targets = state.route(exchange, routing_key);
        if targets.is_empty() {
            return Ok(if mandatory {
                PublishOutcome::Returned
            } else {
                PublishOutcome::Accepted
            });
        }

        let message = Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            body: body.to_vec(),
            redelivered: false,
        };
        for target in targets {
            state.enqueue(&target, message.clone());
        }
        Ok(PublishOutcome::Accepted)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        let mut state = self.usable()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        state.dispatch_all();
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        deliveries: DeliverySender,
    ) -> Result<(), BrokerError> {
        let mut state = self.usable()?;
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        };
        q.consumers.push(ConsumerEntry {
            channel_id: self.id,
            tag: consumer_tag.to_string(),
            sender: deliveries,
        });
        state.dispatch(queue);
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.usable()?;
        state.take_unacked(self.id, delivery_tag)?;
        state.dispatch_all();
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.usable()?;
        let (queue, mut message) = state.take_unacked(self.id, delivery_tag)?;
        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_front(message);
            }
        } else {
            state.dead_letter(&queue, message);
        }
        state.dispatch_all();
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.close_channel(self.id);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for InMemoryBroker {
    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn try_connect(&self) -> bool {
        let mut state = self.lock();
        if !state.connected && state.reconnect_allowed {
            state.connected = true;
            debug!("in-memory broker reconnected");
        }
        state.connected
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        state.next_channel_id += 1;
        state.channels_opened += 1;
        let id = state.next_channel_id;
        let open = Arc::new(AtomicBool::new(true));
        state.channels.insert(
            id,
            ChannelState {
                open: Arc::clone(&open),
                prefetch: 0,
                unacked: 0,
            },
        );
        drop(state);

        Ok(Arc::new(InMemoryChannel {
            id,
            open,
            broker: self.clone(),
        }))
    }
}
