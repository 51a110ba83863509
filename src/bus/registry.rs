//! Subscription registry - event name → decoder + ordered handler list.
//!
//! The decoder doubles as the event type index: an entry exists iff at
//! least one handler is registered for the name, so the two can never
//! drift apart. Dispatch is a plain lookup-and-call; handler adapters are
//! monomorphized per `(event, handler)` pair at subscribe time.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;

use crate::error::BusError;
use crate::event::IntegrationEvent;
use crate::handler::{HandlerError, IntegrationEventHandler};
use crate::scope::Scope;

/// A decoded payload tagged with its event name.
pub(crate) struct DecodedEvent {
    name: &'static str,
    value: Box<dyn Any + Send + Sync>,
}

impl DecodedEvent {
    fn new<E: IntegrationEvent>(event: E) -> Self {
        Self {
            name: E::NAME,
            value: Box::new(event),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn downcast_ref<E: IntegrationEvent>(&self) -> Option<&E> {
        self.value.downcast_ref::<E>()
    }
}

pub(crate) type DecodeFn = fn(&[u8]) -> Result<DecodedEvent, serde_json::Error>;
type InvokeFn = for<'a> fn(&'a Scope, &'a DecodedEvent) -> BoxFuture<'a, Invocation>;

/// Result of calling one handler adapter.
pub(crate) enum Invocation {
    Completed,
    Failed(HandlerError),
    /// The scope could not produce the handler.
    Unresolved,
    /// The decoded value is not the handler's event type.
    TypeMismatch,
}

fn decode<E: IntegrationEvent>(body: &[u8]) -> Result<DecodedEvent, serde_json::Error> {
    serde_json::from_slice::<E>(body).map(DecodedEvent::new)
}

fn invoke<'a, E, H>(scope: &'a Scope, event: &'a DecodedEvent) -> BoxFuture<'a, Invocation>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    Box::pin(async move {
        let Some(handler) = scope.resolve::<H>() else {
            return Invocation::Unresolved;
        };
        let Some(event) = event.downcast_ref::<E>() else {
            return Invocation::TypeMismatch;
        };
        match handler.handle(event).await {
            Ok(()) => Invocation::Completed,
            Err(err) => Invocation::Failed(err),
        }
    })
}

/// A registered handler type.
#[derive(Clone, Copy)]
pub(crate) struct HandlerDescriptor {
    type_id: TypeId,
    name: &'static str,
    invoke: InvokeFn,
}

impl HandlerDescriptor {
    fn of<E, H>() -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        Self {
            type_id: TypeId::of::<H>(),
            name: type_name::<H>(),
            invoke: invoke::<E, H>,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn invoke<'a>(
        &self,
        scope: &'a Scope,
        event: &'a DecodedEvent,
    ) -> BoxFuture<'a, Invocation> {
        (self.invoke)(scope, event)
    }
}

struct Subscription {
    event_type: TypeId,
    event_type_name: &'static str,
    decode: DecodeFn,
    handlers: Vec<HandlerDescriptor>,
}

/// Point-in-time copy of one event name's subscription.
pub(crate) struct SubscriptionSnapshot {
    pub(crate) decode: DecodeFn,
    pub(crate) handlers: Vec<HandlerDescriptor>,
}

/// Mutex-guarded map shared by subscribe/unsubscribe and the consumer loop.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `H` for `E`. Returns `true` when `E` had no handlers before.
    ///
    /// Fails without touching the registry if `H` is already registered, or if
    /// another event type is subscribed under the same name.
    pub(crate) fn add<E, H>(&self) -> Result<bool, BusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let descriptor = HandlerDescriptor::of::<E, H>();
        let mut subscriptions = self.lock();

        match subscriptions.get_mut(E::NAME) {
            Some(subscription) => {
                if subscription.event_type != TypeId::of::<E>() {
                    return Err(BusError::EventNameConflict {
                        event_name: E::NAME,
                        registered: subscription.event_type_name,
                        requested: type_name::<E>(),
                    });
                }
                if subscription
                    .handlers
                    .iter()
                    .any(|h| h.type_id == descriptor.type_id)
                {
                    return Err(BusError::DuplicateSubscription {
                        event_name: E::NAME.to_string(),
                        handler: descriptor.name,
                    });
                }
                subscription.handlers.push(descriptor);
                Ok(false)
            }
            None => {
                subscriptions.insert(
                    E::NAME.to_string(),
                    Subscription {
                        event_type: TypeId::of::<E>(),
                        event_type_name: type_name::<E>(),
                        decode: decode::<E>,
                        handlers: vec![descriptor],
                    },
                );
                Ok(true)
            }
        }
    }

    /// Remove `H` from `E`. Returns `true` if it was registered.
    pub(crate) fn remove<E, H>(&self) -> bool
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let type_id = TypeId::of::<H>();
        let mut subscriptions = self.lock();
        let Some(subscription) = subscriptions.get_mut(E::NAME) else {
            return false;
        };

        let before = subscription.handlers.len();
        subscription.handlers.retain(|h| h.type_id != type_id);
        let removed = subscription.handlers.len() != before;

        if subscription.handlers.is_empty() {
            subscriptions.remove(E::NAME);
        }
        removed
    }

    pub(crate) fn snapshot(&self, event_name: &str) -> Option<SubscriptionSnapshot> {
        self.lock().get(event_name).map(|s| SubscriptionSnapshot {
            decode: s.decode,
            handlers: s.handlers.clone(),
        })
    }

    pub(crate) fn contains(&self, event_name: &str) -> bool {
        self.lock().contains_key(event_name)
    }

    pub(crate) fn handler_names(&self, event_name: &str) -> Vec<&'static str> {
        self.lock()
            .get(event_name)
            .map_or_else(Vec::new, |s| s.handlers.iter().map(|h| h.name).collect())
    }

    /// Subscribed event names, sorted.
    pub(crate) fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Shared handle used by the bus and its consumer task.
pub(crate) type SharedRegistry = Arc<SubscriptionRegistry>;
