//! Test domain: catalog integration events and recording handlers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use integration_bus::{
    integration_event, BusConfig, EventBus, EventMetadata, HandlerError, InMemoryBroker,
    IntegrationEventHandler, ServiceProvider,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProductCreated {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub product_id: Uuid,
    #[serde(rename = "SKU")]
    pub sku: String,
    pub product_name: String,
    pub price: f64,
}
integration_event!(ProductCreated);

impl ProductCreated {
    pub fn new(product_id: Uuid, sku: &str, price: f64) -> Self {
        Self {
            metadata: EventMetadata::new(),
            product_id,
            sku: sku.to_string(),
            product_name: format!("Product {}", sku),
            price,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProductUpdated {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub product_id: Uuid,
    pub product_name: String,
}
integration_event!(ProductUpdated);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProductPriceChanged {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub product_id: Uuid,
    pub old_price: f64,
    pub new_price: f64,
}
integration_event!(ProductPriceChanged);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProductDeleted {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub product_id: Uuid,
}
integration_event!(ProductDeleted);

pub fn product_id() -> Uuid {
    Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap()
}

/// Records every `ProductCreated` it handles.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<ProductCreated>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<ProductCreated> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl IntegrationEventHandler<ProductCreated> for Recorder {
    async fn handle(&self, event: &ProductCreated) -> Result<(), HandlerError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Fails a fixed number of times, then succeeds.
#[derive(Clone, Default)]
pub struct Flaky {
    failures_left: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl Flaky {
    pub fn failing(times: usize) -> Self {
        let flaky = Self::default();
        flaky.failures_left.store(times, Ordering::SeqCst);
        flaky
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntegrationEventHandler<ProductPriceChanged> for Flaky {
    async fn handle(&self, _event: &ProductPriceChanged) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(HandlerError::Dependency("pricing database unavailable".into()));
        }
        Ok(())
    }
}

/// Never succeeds.
#[derive(Clone, Default)]
pub struct AlwaysFails {
    calls: Arc<AtomicUsize>,
}

impl AlwaysFails {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntegrationEventHandler<ProductDeleted> for AlwaysFails {
    async fn handle(&self, _event: &ProductDeleted) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::Rejected("product still referenced".into()))
    }
}

/// Handler invocation log shared by the `ProductUpdated` handlers.
#[derive(Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<(&'static str, usize)>>>,
}

impl CallLog {
    pub fn entries(&self) -> Vec<(&'static str, usize)> {
        self.entries.lock().unwrap().clone()
    }
}

/// Scoped dependency; one per delivered message.
pub struct UnitOfWork {
    pub id: usize,
}

pub struct UpdateSearchIndex {
    pub log: CallLog,
    pub unit_of_work: Arc<UnitOfWork>,
}

pub struct InvalidateCache {
    pub log: CallLog,
    pub unit_of_work: Arc<UnitOfWork>,
}

#[async_trait]
impl IntegrationEventHandler<ProductUpdated> for UpdateSearchIndex {
    async fn handle(&self, _event: &ProductUpdated) -> Result<(), HandlerError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut entries = self.log.entries.lock().unwrap();
        entries.push(("search_index", self.unit_of_work.id));
        Ok(())
    }
}

#[async_trait]
impl IntegrationEventHandler<ProductUpdated> for InvalidateCache {
    async fn handle(&self, _event: &ProductUpdated) -> Result<(), HandlerError> {
        let mut entries = self.log.entries.lock().unwrap();
        entries.push(("cache", self.unit_of_work.id));
        Ok(())
    }
}

/// Registers the `ProductUpdated` handlers and a per-scope `UnitOfWork`.
pub fn register_update_handlers(services: &ServiceProvider, log: &CallLog) {
    let counter = Arc::new(AtomicUsize::new(0));
    let search_log = log.clone();
    let cache_log = log.clone();

    services
        .add_scoped(move |_| UnitOfWork {
            id: counter.fetch_add(1, Ordering::SeqCst),
        })
        .add_scoped(move |scope| UpdateSearchIndex {
            log: search_log.clone(),
            unit_of_work: scope.resolve::<UnitOfWork>().unwrap(),
        })
        .add_scoped(move |scope| InvalidateCache {
            log: cache_log.clone(),
            unit_of_work: scope.resolve::<UnitOfWork>().unwrap(),
        });
}

/// Parks inside `handle` until released.
#[derive(Clone, Default)]
pub struct Gate {
    started: Arc<Notify>,
    release: Arc<Notify>,
    completed: Arc<AtomicBool>,
}

impl Gate {
    pub async fn wait_started(&self) {
        tokio::time::timeout(Duration::from_secs(2), self.started.notified())
            .await
            .expect("handler never started");
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntegrationEventHandler<ProductDeleted> for Gate {
    async fn handle(&self, _event: &ProductDeleted) -> Result<(), HandlerError> {
        self.started.notify_one();
        self.release.notified().await;
        self.completed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Register `handler` so every scope hands out a clone of it.
pub fn provide<T: Clone + Send + Sync + 'static>(services: &ServiceProvider, handler: &T) {
    let handler = handler.clone();
    services.add_scoped(move |_| handler.clone());
}

pub fn bus(broker: &InMemoryBroker, services: ServiceProvider) -> EventBus {
    bus_with(broker, services, BusConfig::default())
}

pub fn bus_with(broker: &InMemoryBroker, services: ServiceProvider, config: BusConfig) -> EventBus {
    init_tracing();
    EventBus::new(Arc::new(broker.clone()), services).with_config(config)
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Let the consumer task run for a while.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
