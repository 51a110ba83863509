//! Catalog service publishing product events to a pricing subscriber.
//!
//! Run with `RUST_LOG=integration_bus=trace` to watch channels, retries and acks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use integration_bus::{
    integration_event, BusConfig, EventBus, EventMetadata, HandlerError, InMemoryBroker,
    IntegrationEventHandler, ServiceProvider,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProductPriceChanged {
    #[serde(flatten)]
    metadata: EventMetadata,
    product_id: Uuid,
    old_price: f64,
    new_price: f64,
}
integration_event!(ProductPriceChanged);

/// Stand-in for a repository shared across messages.
#[derive(Default)]
struct PriceHistory {
    changes: AtomicUsize,
}

/// Fails the first time it sees a message so the redelivery path shows up in the log.
struct UpdateBasketPrices {
    history: Arc<PriceHistory>,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl IntegrationEventHandler<ProductPriceChanged> for UpdateBasketPrices {
    async fn handle(&self, event: &ProductPriceChanged) -> Result<(), HandlerError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(HandlerError::Dependency("basket store warming up".into()));
        }
        self.history.changes.fetch_add(1, Ordering::SeqCst);
        info!(
            product_id = %event.product_id,
            old_price = event.old_price,
            new_price = event.new_price,
            "basket prices updated"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = BusConfig::load(None)?;
    info!(broker = %config.broker.amqp_uri(), exchange = %config.exchange_name, "starting");

    let attempts = Arc::new(AtomicUsize::new(0));
    let services = ServiceProvider::new();
    services.add_singleton(PriceHistory::default()).add_scoped({
        let attempts = Arc::clone(&attempts);
        move |scope| UpdateBasketPrices {
            history: scope.resolve::<PriceHistory>().unwrap_or_default(),
            attempts: Arc::clone(&attempts),
        }
    });

    let broker = InMemoryBroker::new();
    let bus = EventBus::new(Arc::new(broker.clone()), services.clone()).with_config(config);
    bus.subscribe::<ProductPriceChanged, UpdateBasketPrices>()
        .await?;

    let published = bus
        .publish_or_log(&ProductPriceChanged {
            metadata: EventMetadata::new(),
            product_id: Uuid::new_v4(),
            old_price: 9.99,
            new_price: 12.49,
        })
        .await;
    info!(published, "price change published");

    let history = services
        .create_scope()
        .resolve::<PriceHistory>()
        .unwrap_or_default();
    for _ in 0..100 {
        if history.changes.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    info!(
        handler_attempts = attempts.load(Ordering::SeqCst),
        queue_depth = broker.queue_depth("ProductPriceChanged_queue"),
        "done"
    );
    bus.shutdown().await?;
    Ok(())
}
