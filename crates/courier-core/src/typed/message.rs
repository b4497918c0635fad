//! Message trait - typed messages and their wire form.
//!
//! The wire form is a flat JSON object of the message fields. Nothing else is
//! carried in the payload; the routing key names the type.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::domain::key::short_type_name;
use crate::domain::{MessageKey, underscore};
use crate::error::CourierError;

/// A message type that can be published on the bus and bound to handlers.
///
/// # Example
/// ```ignore
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct OrderPlaced {
///     id: u64,
///     total_cents: i64,
/// }
///
/// impl Message for OrderPlaced {
///     const KEY: Option<&'static str> = Some("orders.placed");
/// }
/// ```
///
/// `Default` is required so registrations can check the identity selector
/// against a fresh instance.
pub trait Message: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    /// Explicit routing key. `None` derives it from the type name.
    const KEY: Option<&'static str> = None;

    fn message_key() -> MessageKey {
        match Self::KEY {
            Some(key) => MessageKey::new(key),
            None => MessageKey::for_type::<Self>(),
        }
    }

    fn type_name() -> &'static str {
        short_type_name::<Self>()
    }

    /// Value of the named identity field, used to correlate the message with
    /// a running saga. Override to expose computed identities.
    fn identity(&self, selector: &str) -> Option<Value> {
        self.to_hash().ok()?.remove(selector)
    }

    fn to_hash(&self) -> Result<Map<String, Value>, CourierError> {
        let value =
            serde_json::to_value(self).map_err(|e| CourierError::codec(&Self::message_key(), e))?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(CourierError::codec(
                &Self::message_key(),
                format!("expected a JSON object, got {other}"),
            )),
        }
    }

    /// Build a message from a field mapping. Incoming keys are underscored,
    /// so `orderId` fills `order_id`.
    fn from_hash(hash: Map<String, Value>) -> Result<Self, CourierError> {
        let normalized: Map<String, Value> = hash
            .into_iter()
            .map(|(key, value)| (underscore(&key), value))
            .collect();
        serde_json::from_value(Value::Object(normalized))
            .map_err(|e| CourierError::codec(&Self::message_key(), e))
    }

    fn marshall(&self) -> Result<Vec<u8>, CourierError> {
        let hash = self.to_hash()?;
        serde_json::to_vec(&hash).map_err(|e| CourierError::codec(&Self::message_key(), e))
    }

    fn unmarshall(payload: &[u8]) -> Result<Self, CourierError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| CourierError::codec(&Self::message_key(), e))?;
        match value {
            Value::Object(map) => Self::from_hash(map),
            other => Err(CourierError::codec(
                &Self::message_key(),
                format!("expected a JSON object, got {other}"),
            )),
        }
    }
}
