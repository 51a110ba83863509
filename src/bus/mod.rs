//! Event bus - publishing and consuming integration events over a broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    EventBus (per service)                   │
//! │  publish() / subscribe::<E, H>() / unsubscribe::<E, H>()    │
//! └─────────────────────────────────────────────────────────────┘
//!          │                     │                     │
//!          ▼                     ▼                     ▼
//! ┌─────────────────┐  ┌───────────────────┐  ┌─────────────────┐
//! │    Publisher    │  │ SubscriptionReg.  │  │    Consumer     │
//! │ channel/publish │  │ name → decoder +  │◄─│ shared channel, │
//! │ + RetryPolicy   │  │ ordered handlers  │  │ ack / nack      │
//! └─────────────────┘  └───────────────────┘  └─────────────────┘
//!          │                                           ▲
//!          ▼                                           │
//! ┌─────────────────────────────────────────────────────────────┐
//! │     Connection / Channel  (InMemoryBroker or an AMQP client)│
//! │  direct exchange ──routing key = event name──► <Name>_queue │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Delivery is at-least-once: a message whose handler fails is requeued and
//! all of its handlers run again on redelivery.

mod consumer;
mod event_bus;
mod publisher;
mod registry;
mod retry;

pub use event_bus::{BusState, EventBus};
pub use retry::{Exhausted, RetryPolicy};
