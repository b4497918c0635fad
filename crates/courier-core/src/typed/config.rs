//! HandlerConfig - per handler type registration table and dispatcher.
//!
//! A handler type declares, once at startup, which message types it handles,
//! which function processes each one, which field correlates a message to a
//! saga instance, and which message types may start a new saga. The result is
//! an immutable `HandlerConfig<H>`.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::handler::{AnyMessage, DecodedMessage, Handler};
use super::message::Message;
use crate::domain::{MessageKey, underscore};
use crate::error::{BoxError, CourierError};

/// Default identity selector.
pub const DEFAULT_SELECTOR: &str = "id";

type Invoke<H> = Box<
    dyn Fn(&H, &AnyMessage) -> Option<Result<<H as Handler>::Output, BoxError>> + Send + Sync,
>;
type Identify = fn(&AnyMessage, &str) -> Option<Value>;
type Decode = fn(&[u8]) -> Result<Box<AnyMessage>, CourierError>;
type Finder<H> = Box<dyn Fn(&Value) -> Result<Option<Arc<H>>, BoxError> + Send + Sync>;
type Constructor<H> = Box<dyn Fn() -> H + Send + Sync>;

/// One (handler type, message type) binding.
pub struct Registration<H: Handler> {
    message_key: MessageKey,
    message_type: &'static str,
    type_id: TypeId,
    method: String,
    selector: String,
    invoke: Invoke<H>,
    identify: Identify,
    decode: Decode,
}

impl<H: Handler> Registration<H> {
    pub fn message_key(&self) -> &MessageKey {
        &self.message_key
    }

    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Label of the bound function, derived from the message type name.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub(crate) fn identity_of(&self, message: &AnyMessage) -> Option<Value> {
        (self.identify)(message, &self.selector)
    }

    pub(crate) fn decode(&self, payload: &[u8]) -> Result<DecodedMessage, CourierError> {
        Ok(DecodedMessage {
            key: self.message_key.clone(),
            message_type: self.message_type,
            body: (self.decode)(payload)?,
        })
    }
}

fn identify_as<M: Message>(message: &AnyMessage, selector: &str) -> Option<Value> {
    message.downcast_ref::<M>()?.identity(selector)
}

fn decode_as<M: Message>(payload: &[u8]) -> Result<Box<AnyMessage>, CourierError> {
    Ok(Box::new(M::unmarshall(payload)?))
}

/// Immutable configuration of one handler type.
pub struct HandlerConfig<H: Handler> {
    name: String,
    stateful: bool,
    registrations: BTreeMap<MessageKey, Registration<H>>,
    starters: HashSet<MessageKey>,
    finders: HashMap<String, Finder<H>>,
    constructor: Constructor<H>,
}

impl<H: Handler> HandlerConfig<H> {
    /// Start a configuration. `constructor` builds fresh instances.
    pub fn builder<F>(constructor: F) -> HandlerConfigBuilder<H>
    where
        F: Fn() -> H + Send + Sync + 'static,
    {
        HandlerConfigBuilder {
            config: HandlerConfig {
                name: H::handler_name(),
                stateful: false,
                registrations: BTreeMap::new(),
                starters: HashSet::new(),
                finders: HashMap::new(),
                constructor: Box::new(constructor),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stateful(&self) -> bool {
        self.stateful
    }

    pub fn is_starter(&self, key: &MessageKey) -> bool {
        self.starters.contains(key)
    }

    /// Names of the distinct message types this handler type handles.
    pub fn handle_messages(&self) -> Vec<&'static str> {
        self.registrations.values().map(|r| r.message_type).collect()
    }

    pub fn message_keys(&self) -> Vec<MessageKey> {
        self.registrations.keys().cloned().collect()
    }

    /// Message type registered for a routing key.
    pub fn message_type_for(&self, key: &MessageKey) -> Option<&'static str> {
        self.registrations.get(key).map(|r| r.message_type)
    }

    pub fn registration(&self, key: &MessageKey) -> Option<&Registration<H>> {
        self.registrations.get(key)
    }

    pub(crate) fn registrations(&self) -> impl Iterator<Item = &Registration<H>> {
        self.registrations.values()
    }

    pub(crate) fn finder(&self, selector: &str) -> Option<&Finder<H>> {
        self.finders.get(selector)
    }

    pub(crate) fn create(&self) -> Arc<H> {
        Arc::new((self.constructor)())
    }

    /// Invoke the function bound to `message`'s type on `instance`.
    ///
    /// Fails with `UnboundMessage` when the message type isn't registered on
    /// this handler type, including when its key belongs to another type.
    pub fn handle<M: Message>(&self, instance: &H, message: &M) -> Result<H::Output, CourierError> {
        let key = M::message_key();
        match self.registrations.get(&key) {
            Some(registration) if registration.type_id == TypeId::of::<M>() => {
                self.invoke(registration, instance, message)
            }
            _ => Err(self.unbound(M::type_name())),
        }
    }

    pub(crate) fn handle_decoded(
        &self,
        instance: &H,
        message: &DecodedMessage,
    ) -> Result<H::Output, CourierError> {
        let registration = self
            .registrations
            .get(&message.key)
            .ok_or_else(|| self.unbound(message.message_type))?;
        self.invoke(registration, instance, message.body.as_ref())
    }

    fn invoke(
        &self,
        registration: &Registration<H>,
        instance: &H,
        message: &AnyMessage,
    ) -> Result<H::Output, CourierError> {
        debug!(
            handler = %self.name,
            message = registration.message_type,
            method = %registration.method,
            "invoking handler"
        );
        match (registration.invoke)(instance, message) {
            Some(Ok(output)) => Ok(output),
            Some(Err(source)) => Err(CourierError::Handler {
                handler: self.name.clone(),
                message: registration.message_type.to_string(),
                source,
            }),
            None => Err(self.unbound(registration.message_type)),
        }
    }

    pub(crate) fn unbound(&self, message_type: &str) -> CourierError {
        CourierError::UnboundMessage {
            handler: self.name.clone(),
            message: message_type.to_string(),
        }
    }
}

/// Builder for [`HandlerConfig`].
///
/// # Example
/// ```ignore
/// let config = HandlerConfig::builder(OrderSaga::default)
///     .stateful(true)
///     .started_by::<OrderPlaced>()
///     .on::<OrderPlaced, _, _>(OrderSaga::order_placed)?
///     .on_with::<PaymentReceived, _, _>("order_id", OrderSaga::payment_received)?
///     .finder("id", move |id| Ok(store.get(id)))
///     .finder("order_id", move |id| Ok(store.get(id)))
///     .build();
/// ```
pub struct HandlerConfigBuilder<H: Handler> {
    config: HandlerConfig<H>,
}

impl<H: Handler> HandlerConfigBuilder<H> {
    /// Override the handler type name (used in queue names and errors).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn stateful(mut self, stateful: bool) -> Self {
        self.config.stateful = stateful;
        self
    }

    /// Allow `M` to create a new instance when no existing one is found.
    pub fn started_by<M: Message>(mut self) -> Self {
        self.config.starters.insert(M::message_key());
        self
    }

    /// Bind `M` to `method`, correlated by the `id` field.
    pub fn on<M, F, E>(self, method: F) -> Result<Self, CourierError>
    where
        M: Message,
        F: Fn(&H, &M) -> Result<H::Output, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        self.on_with::<M, F, E>(DEFAULT_SELECTOR, method)
    }

    /// Bind `M` to `method`, correlated by `selector`.
    ///
    /// The selector is checked against `M::default()` right away. Binding the
    /// same message type again replaces the earlier binding.
    pub fn on_with<M, F, E>(mut self, selector: &str, method: F) -> Result<Self, CourierError>
    where
        M: Message,
        F: Fn(&H, &M) -> Result<H::Output, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        if M::default().identity(selector).is_none() {
            return Err(CourierError::Registration {
                message: M::type_name().to_string(),
                selector: selector.to_string(),
            });
        }

        let key = M::message_key();
        if let Some(existing) = self.config.registrations.get(&key)
            && existing.type_id != TypeId::of::<M>()
        {
            return Err(CourierError::DuplicateMessageKey {
                key,
                existing: existing.message_type.to_string(),
                conflicting: M::type_name().to_string(),
            });
        }

        let invoke: Invoke<H> = Box::new(move |instance: &H, message: &AnyMessage| {
            let message = message.downcast_ref::<M>()?;
            Some(method(instance, message).map_err(Into::into))
        });

        let registration = Registration {
            message_key: key.clone(),
            message_type: M::type_name(),
            type_id: TypeId::of::<M>(),
            method: underscore(M::type_name()),
            selector: selector.to_string(),
            invoke,
            identify: identify_as::<M>,
            decode: decode_as::<M>,
        };
        self.config.registrations.insert(key, registration);
        Ok(self)
    }

    /// Application lookup `find_by_<selector>`. A missing finder behaves like
    /// one that never finds anything.
    pub fn finder<F, E>(mut self, selector: &str, finder: F) -> Self
    where
        F: Fn(&Value) -> Result<Option<Arc<H>>, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        self.config.finders.insert(
            selector.to_string(),
            Box::new(move |value: &Value| finder(value).map_err(Into::into)),
        );
        self
    }

    pub fn build(self) -> HandlerConfig<H> {
        self.config
    }
}
