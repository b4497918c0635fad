//! Handler traits.
//!
//! - `Handler`: implemented by the application's handler types.
//! - `DynHandler`: object-safe view of a `HandlerConfig<H>`, so the manager and
//!   the bus can hold handler types of different `H` side by side.

use std::any::{Any, TypeId};

use tracing::debug;

use super::config::HandlerConfig;
use crate::domain::key::{normalized_name, type_path};
use crate::domain::MessageKey;
use crate::error::CourierError;

/// Type-erased message body.
pub type AnyMessage = dyn Any + Send + Sync;

/// A handler type: stateless fan-out handler or saga.
///
/// ```ignore
/// #[derive(Default)]
/// struct OrderSaga { state: Mutex<OrderState> }
///
/// impl Handler for OrderSaga {
///     type Output = ();
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Value returned by the bound functions.
    type Output: Send + 'static;

    /// Handler type name, also the base of its durable queue name.
    ///
    /// Defaults to the module path inside the crate plus the type name, so
    /// `billing::OrderSaga` is `billing_order_saga` and doesn't collide with
    /// `shipping::OrderSaga`. Override it (or call `HandlerConfigBuilder::name`)
    /// to keep a queue name stable when the type moves.
    fn handler_name() -> String
    where
        Self: Sized,
    {
        normalized_name(type_path::<Self>())
    }
}

/// A payload decoded into the message type registered for its routing key.
pub struct DecodedMessage {
    pub(crate) key: MessageKey,
    pub(crate) message_type: &'static str,
    pub(crate) body: Box<AnyMessage>,
}

impl DecodedMessage {
    pub fn key(&self) -> &MessageKey {
        &self.key
    }

    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    pub fn downcast_ref<M: 'static>(&self) -> Option<&M> {
        self.body.downcast_ref::<M>()
    }
}

impl std::fmt::Debug for DecodedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedMessage")
            .field("key", &self.key)
            .field("message_type", &self.message_type)
            .finish_non_exhaustive()
    }
}

/// Key and type identity of a registered message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDescriptor {
    pub key: MessageKey,
    pub type_name: &'static str,
    pub type_id: TypeId,
}

/// Object-safe handler type used on the delivery path.
pub trait DynHandler: Send + Sync {
    fn name(&self) -> &str;

    fn messages(&self) -> Vec<MessageDescriptor>;

    /// Deserialize `payload` into the message type registered for `key`.
    fn decode(&self, key: &MessageKey, payload: &[u8]) -> Result<DecodedMessage, CourierError>;

    /// Resolve an instance and handle `message`, discarding the output.
    fn process(&self, message: &DecodedMessage) -> Result<(), CourierError>;
}

impl<H: Handler> DynHandler for HandlerConfig<H> {
    fn name(&self) -> &str {
        HandlerConfig::name(self)
    }

    fn messages(&self) -> Vec<MessageDescriptor> {
        self.registrations()
            .map(|r| MessageDescriptor {
                key: r.message_key().clone(),
                type_name: r.message_type(),
                type_id: r.type_id(),
            })
            .collect()
    }

    fn decode(&self, key: &MessageKey, payload: &[u8]) -> Result<DecodedMessage, CourierError> {
        let registration = self
            .registration(key)
            .ok_or_else(|| self.unbound(key.as_str()))?;
        registration.decode(payload)
    }

    fn process(&self, message: &DecodedMessage) -> Result<(), CourierError> {
        let instance = self.resolve_decoded(message)?;
        self.handle_decoded(&instance, message)?;
        debug!(handler = %self.name(), message = message.message_type, "message handled");
        Ok(())
    }
}
