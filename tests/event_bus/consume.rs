//! Consumer loop: dispatch, ordering, scopes, ack and requeue.

use integration_bus::broker::{Channel, Connection, MessageProperties};
use integration_bus::{EventMetadata, InMemoryBroker, ServiceProvider};

use crate::support::{
    bus, eventually, product_id, provide, register_update_handlers, settle, CallLog, Flaky,
    InvalidateCache, ProductCreated, ProductPriceChanged, ProductUpdated, Recorder,
    UpdateSearchIndex,
};

#[tokio::test]
async fn published_event_reaches_its_handler_once() {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::default();
    let services = ServiceProvider::new();
    provide(&services, &recorder);
    let bus = bus(&broker, services);

    bus.subscribe::<ProductCreated, Recorder>().await.unwrap();
    let event = ProductCreated::new(product_id(), "ABC-1", 9.99);
    bus.publish(&event).await.unwrap();

    eventually("ProductCreated to be handled", || recorder.len() == 1).await;
    settle().await;

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], event);
    assert_eq!(events[0].product_id.to_string(), "11111111-1111-1111-1111-111111111111");
    assert_eq!(events[0].sku, "ABC-1");

    eventually("the delivery to be acked", || {
        broker.unacked_count("ProductCreated_queue") == 0
    })
    .await;
    assert_eq!(broker.queue_depth("ProductCreated_queue"), 0);
}

#[tokio::test]
async fn handlers_run_in_registration_order_within_one_scope() {
    let broker = InMemoryBroker::new();
    let log = CallLog::default();
    let services = ServiceProvider::new();
    register_update_handlers(&services, &log);
    let bus = bus(&broker, services);

    bus.subscribe::<ProductUpdated, UpdateSearchIndex>()
        .await
        .unwrap();
    bus.subscribe::<ProductUpdated, InvalidateCache>()
        .await
        .unwrap();

    for name in ["Desk", "Chair"] {
        bus.publish(&ProductUpdated {
            metadata: EventMetadata::new(),
            product_id: product_id(),
            product_name: name.to_string(),
        })
        .await
        .unwrap();
    }

    eventually("both messages to be handled", || log.entries().len() == 4).await;

    // the slower first handler still finishes before the second starts,
    // and both share the message's unit of work
    assert_eq!(
        log.entries(),
        vec![
            ("search_index", 0),
            ("cache", 0),
            ("search_index", 1),
            ("cache", 1)
        ]
    );
}

#[tokio::test]
async fn failing_handler_gets_the_message_again() {
    let broker = InMemoryBroker::new();
    let flaky = Flaky::failing(1);
    let services = ServiceProvider::new();
    provide(&services, &flaky);
    let bus = bus(&broker, services);

    bus.subscribe::<ProductPriceChanged, Flaky>().await.unwrap();
    bus.publish(&ProductPriceChanged {
        metadata: EventMetadata::new(),
        product_id: product_id(),
        old_price: 9.99,
        new_price: 12.49,
    })
    .await
    .unwrap();

    eventually("the redelivery to be handled", || flaky.calls() == 2).await;
    eventually("the redelivery to be acked", || {
        broker.unacked_count("ProductPriceChanged_queue") == 0
    })
    .await;
    settle().await;

    assert_eq!(flaky.calls(), 2);
    assert_eq!(broker.queue_depth("ProductPriceChanged_queue"), 0);
}

#[tokio::test]
async fn without_dead_lettering_failures_are_requeued_indefinitely() {
    let broker = InMemoryBroker::new();
    let flaky = Flaky::failing(20);
    let services = ServiceProvider::new();
    provide(&services, &flaky);
    let bus = bus(&broker, services);

    bus.subscribe::<ProductPriceChanged, Flaky>().await.unwrap();
    bus.publish(&ProductPriceChanged {
        metadata: EventMetadata::new(),
        product_id: product_id(),
        old_price: 1.0,
        new_price: 2.0,
    })
    .await
    .unwrap();

    eventually("all failures and the final success", || flaky.calls() == 21).await;
    eventually("the final ack", || {
        broker.unacked_count("ProductPriceChanged_queue") == 0
    })
    .await;
    assert_eq!(broker.queue_depth("ProductPriceChanged_queue"), 0);
}

#[tokio::test]
async fn delivery_without_subscription_is_acked_and_dropped() {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::default();
    let services = ServiceProvider::new();
    provide(&services, &recorder);
    let bus = bus(&broker, services);

    bus.subscribe::<ProductCreated, Recorder>().await.unwrap();
    assert!(bus.unsubscribe::<ProductCreated, Recorder>());

    bus.publish(&ProductCreated::new(product_id(), "ABC-1", 9.99))
        .await
        .unwrap();

    eventually("the orphaned delivery to be acked", || {
        broker.queue_depth("ProductCreated_queue") == 0
            && broker.unacked_count("ProductCreated_queue") == 0
    })
    .await;
    assert_eq!(recorder.len(), 0);
}

#[tokio::test]
async fn undecodable_payload_is_dropped_and_consumption_continues() {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::default();
    let services = ServiceProvider::new();
    provide(&services, &recorder);
    let bus = bus(&broker, services);
    bus.subscribe::<ProductCreated, Recorder>().await.unwrap();

    let channel = broker.create_channel().await.unwrap();
    channel
        .basic_publish(
            "microservices_event_bus",
            "ProductCreated",
            true,
            &MessageProperties::persistent_json("garbage"),
            b"{\"ProductId\": 42",
        )
        .await
        .unwrap();
    bus.publish(&ProductCreated::new(product_id(), "ABC-2", 5.0))
        .await
        .unwrap();

    eventually("the valid event to be handled", || recorder.len() == 1).await;
    eventually("both deliveries to be acked", || {
        broker.queue_depth("ProductCreated_queue") == 0
            && broker.unacked_count("ProductCreated_queue") == 0
    })
    .await;
    assert_eq!(recorder.events()[0].sku, "ABC-2");
}

#[tokio::test]
async fn handler_without_factory_is_skipped() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, ServiceProvider::new());

    bus.subscribe::<ProductCreated, Recorder>().await.unwrap();
    bus.publish(&ProductCreated::new(product_id(), "ABC-1", 9.99))
        .await
        .unwrap();

    eventually("the delivery to be acked", || {
        broker.queue_depth("ProductCreated_queue") == 0
            && broker.unacked_count("ProductCreated_queue") == 0
    })
    .await;
}

#[tokio::test]
async fn events_published_before_subscribing_wait_in_the_queue() {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::default();
    let services = ServiceProvider::new();
    provide(&services, &recorder);

    let first = bus(&broker, services.clone());
    first.subscribe::<ProductCreated, Recorder>().await.unwrap();
    first.shutdown().await.unwrap();

    let publisher = bus(&broker, ServiceProvider::new());
    publisher
        .publish(&ProductCreated::new(product_id(), "ABC-1", 9.99))
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("ProductCreated_queue"), 1);

    let second = bus(&broker, services);
    second.subscribe::<ProductCreated, Recorder>().await.unwrap();
    eventually("the queued event to be handled", || recorder.len() == 1).await;
}

#[tokio::test]
async fn subscribing_after_a_connection_drop_rebuilds_the_consumer() {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::default();
    let log = CallLog::default();
    let services = ServiceProvider::new();
    provide(&services, &recorder);
    register_update_handlers(&services, &log);
    let bus = bus(&broker, services);

    bus.subscribe::<ProductCreated, Recorder>().await.unwrap();
    broker.disconnect();
    assert_eq!(broker.consumer_count("ProductCreated_queue"), 0);

    bus.subscribe::<ProductUpdated, UpdateSearchIndex>()
        .await
        .unwrap();
    assert_eq!(broker.open_channel_count(), 1);
    assert_eq!(broker.consumer_count("ProductCreated_queue"), 1);
    assert_eq!(broker.consumer_count("ProductUpdated_queue"), 1);

    bus.publish(&ProductCreated::new(product_id(), "ABC-1", 9.99))
        .await
        .unwrap();
    eventually("ProductCreated to be handled on the new channel", || {
        recorder.len() == 1
    })
    .await;
}
