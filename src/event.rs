//! Integration events - immutable facts broadcast to other services.
//!
//! An event's [`IntegrationEvent::NAME`] must be unique across the whole
//! deployment: it is the broker routing key, the queue name stem, and the
//! key used to pick a decoder when a delivery arrives. The payload on the
//! wire is the plain JSON encoding of the event struct with no envelope.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity and creation time shared by every integration event.
///
/// Embed it with `#[serde(flatten)]` so `Id` and `CreatedDate` sit next to
/// the event's own fields in the JSON payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(rename = "Id")]
    pub id: Uuid,
    #[serde(rename = "CreatedDate")]
    pub created_date: DateTime<Utc>,
}

impl EventMetadata {
    /// Fresh metadata: random v4 id, current UTC time.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_date: Utc::now(),
        }
    }

    /// Restore metadata for an event that already exists.
    pub fn with(id: Uuid, created_date: DateTime<Utc>) -> Self {
        Self { id, created_date }
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// A serializable fact about a state change in one service.
///
/// Most events implement this through [`integration_event!`](crate::integration_event).
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Deployment-unique type name, used as routing key.
    const NAME: &'static str;

    fn metadata(&self) -> &EventMetadata;

    fn id(&self) -> Uuid {
        self.metadata().id
    }

    fn created_date(&self) -> DateTime<Utc> {
        self.metadata().created_date
    }
}

/// Implement [`IntegrationEvent`] for a struct with a `metadata: EventMetadata` field.
///
/// With a bare type name the routing key is the type name itself; pass a
/// second argument to pin a different wire name.
///
/// # Example
/// ```
/// use integration_bus::{integration_event, EventMetadata, IntegrationEvent};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct ProductDeleted {
///     #[serde(flatten)]
///     metadata: EventMetadata,
///     product_name: String,
/// }
///
/// integration_event!(ProductDeleted);
///
/// assert_eq!(ProductDeleted::NAME, "ProductDeleted");
/// ```
#[macro_export]
macro_rules! integration_event {
    ($ty:ident) => {
        $crate::integration_event!($ty, stringify!($ty));
    };
    ($ty:ty, $name:expr) => {
        impl $crate::IntegrationEvent for $ty {
            const NAME: &'static str = $name;

            fn metadata(&self) -> &$crate::EventMetadata {
                &self.metadata
            }
        }
    };
}
