//! Publishing side of the bus.
//!
//! The event is serialized before any broker work. Every publish then
//! opens its own short-lived channel, declares the shared direct exchange,
//! and sends the JSON payload with routing key = [`IntegrationEvent::NAME`]. Only the broker publish itself is retried;
//! a missing connection is reported straight back to the caller.

use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::broker::{Channel, Connection, ExchangeKind, MessageProperties, PublishOutcome};
use crate::error::BusError;
use crate::event::IntegrationEvent;

use super::retry::RetryPolicy;

pub(crate) struct Publisher {
    connection: Arc<dyn Connection>,
    exchange: String,
    retry: RetryPolicy,
    fail_on_unroutable: bool,
}

impl Publisher {
    pub(crate) fn new(
        connection: Arc<dyn Connection>,
        exchange: impl Into<String>,
        retry: RetryPolicy,
        fail_on_unroutable: bool,
    ) -> Self {
        Self {
            connection,
            exchange: exchange.into(),
            retry,
            fail_on_unroutable,
        }
    }

    pub(crate) async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), BusError> {
        let body = serde_json::to_vec(event)?;

        if !self.connection.is_connected() {
            self.connection.try_connect().await;
        }

        trace!(event_id = %event.id(), event_name = E::NAME, "creating channel to publish event");
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(BusError::ConnectionUnavailable)?;

        let result = self.publish_on(channel.as_ref(), event, &body).await;

        if let Err(err) = channel.close().await {
            debug!(error = %err, "failed to close publish channel");
        }
        result
    }

    async fn publish_on<E: IntegrationEvent>(
        &self,
        channel: &dyn Channel,
        event: &E,
        body: &[u8],
    ) -> Result<(), BusError> {
        let event_id = event.id();

        trace!(%event_id, exchange = %self.exchange, "declaring exchange to publish event");
        channel
            .exchange_declare(&self.exchange, ExchangeKind::Direct)
            .await?;

        let properties = MessageProperties::persistent_json(event_id.to_string());

        let outcome = self
            .retry
            .run(
                |attempt| {
                    trace!(%event_id, attempt, "publishing event");
                    channel.basic_publish(&self.exchange, E::NAME, true, &properties, body)
                },
                |attempt, delay, err| {
                    warn!(
                        %event_id,
                        event_name = E::NAME,
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        error = %err,
                        "could not publish event, retrying after {:.1}s",
                        delay.as_secs_f64()
                    );
                },
            )
            .await
            .map_err(|exhausted| {
                error!(
                    %event_id,
                    event_name = E::NAME,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "giving up publishing event"
                );
                BusError::PublishFailed {
                    event_name: E::NAME,
                    attempts: exhausted.attempts,
                    source: exhausted.last_error,
                }
            })?;

        if outcome == PublishOutcome::Returned {
            warn!(%event_id, event_name = E::NAME, "event was not routed to any queue");
            if self.fail_on_unroutable {
                return Err(BusError::Unroutable {
                    event_name: E::NAME,
                });
            }
        }

        trace!(%event_id, event_name = E::NAME, "event published");
        Ok(())
    }
}
