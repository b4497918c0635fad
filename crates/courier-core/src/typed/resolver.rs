//! Instance resolution: which handler object receives a message.
//!
//! - stateless handler type: always a fresh instance
//! - stateful, starter message: the instance found by identity, else a fresh one
//! - stateful, other message: the instance found by identity, else `NoHandler`

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::config::{HandlerConfig, Registration};
use super::handler::{AnyMessage, DecodedMessage, Handler};
use super::message::Message;
use crate::domain::MessageKey;
use crate::error::CourierError;

impl<H: Handler> HandlerConfig<H> {
    /// Obtain the instance that should handle `message`.
    pub fn resolve<M: Message>(&self, message: &M) -> Result<Arc<H>, CourierError> {
        self.resolve_any(&M::message_key(), M::type_name(), message)
    }

    /// Look up an existing instance through `find_by_<selector>`.
    pub fn find<M: Message>(&self, message: &M) -> Result<Option<Arc<H>>, CourierError> {
        let registration = self.bound_registration(&M::message_key(), M::type_name())?;
        self.find_with(registration, message)
    }

    /// Resolve an instance and handle `message` with it. Errors propagate
    /// immediately; nothing is retried here.
    pub fn dispatch<M: Message>(&self, message: &M) -> Result<H::Output, CourierError> {
        let instance = self.resolve(message)?;
        self.handle(&instance, message)
    }

    pub(crate) fn resolve_decoded(&self, message: &DecodedMessage) -> Result<Arc<H>, CourierError> {
        self.resolve_any(&message.key, message.message_type, message.body.as_ref())
    }

    fn resolve_any(
        &self,
        key: &MessageKey,
        message_type: &str,
        message: &AnyMessage,
    ) -> Result<Arc<H>, CourierError> {
        if !self.is_stateful() {
            return Ok(self.create());
        }

        let registration = self.bound_registration(key, message_type)?;
        if let Some(instance) = self.find_with(registration, message)? {
            debug!(handler = %self.name(), message = message_type, "reusing existing instance");
            return Ok(instance);
        }

        if self.is_starter(key) {
            debug!(handler = %self.name(), message = message_type, "starting new instance");
            Ok(self.create())
        } else {
            Err(CourierError::NoHandler {
                handler: self.name().to_string(),
                message: message_type.to_string(),
            })
        }
    }

    fn bound_registration(
        &self,
        key: &MessageKey,
        message_type: &str,
    ) -> Result<&Registration<H>, CourierError> {
        self.registration(key)
            .ok_or_else(|| self.unbound(message_type))
    }

    fn find_with(
        &self,
        registration: &Registration<H>,
        message: &AnyMessage,
    ) -> Result<Option<Arc<H>>, CourierError> {
        let selector = registration.selector();
        let Some(finder) = self.finder(selector) else {
            return Ok(None);
        };
        let value = registration.identity_of(message).unwrap_or(Value::Null);
        finder(&value).map_err(|source| CourierError::Finder {
            handler: self.name().to_string(),
            selector: selector.to_string(),
            source,
        })
    }
}
