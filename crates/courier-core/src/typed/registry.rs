//! HandlerRegistry - process-wide table of handler types.
//!
//! Built once during startup and read-only afterwards, so it needs no locks.
//! It also enforces that a message key names exactly one message type across
//! every registered handler type.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::info;

use super::config::HandlerConfig;
use super::handler::{DynHandler, Handler, MessageDescriptor};
use crate::domain::MessageKey;
use crate::error::CourierError;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn DynHandler>>,
    messages: HashMap<MessageKey, MessageDescriptor>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: Handler>(
        &mut self,
        config: HandlerConfig<H>,
    ) -> Result<Arc<dyn DynHandler>, CourierError> {
        self.register_dyn(Arc::new(config))
    }

    pub fn register_dyn(
        &mut self,
        handler: Arc<dyn DynHandler>,
    ) -> Result<Arc<dyn DynHandler>, CourierError> {
        let name = handler.name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(CourierError::DuplicateHandler(name));
        }

        let messages = handler.messages();
        for message in &messages {
            if let Some(existing) = self.messages.get(&message.key)
                && existing.type_id != message.type_id
            {
                return Err(CourierError::DuplicateMessageKey {
                    key: message.key.clone(),
                    existing: existing.type_name.to_string(),
                    conflicting: message.type_name.to_string(),
                });
            }
        }

        info!(handler = %name, messages = messages.len(), "handler type registered");
        for message in messages {
            self.messages.insert(message.key.clone(), message);
        }
        self.handlers.insert(name, Arc::clone(&handler));
        Ok(handler)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn DynHandler>> {
        self.handlers.values()
    }

    pub fn registered_handlers(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Message type registered for a routing key by any handler type.
    pub fn message_type_for(&self, key: &MessageKey) -> Option<&'static str> {
        self.messages.get(key).map(|m| m.type_name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
