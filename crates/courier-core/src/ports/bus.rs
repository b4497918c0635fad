//! Bus port - the publish/subscribe capability of a broker.
//!
//! A bus adapter sends marshalled envelopes tagged with their routing key, and
//! feeds inbound payloads for bound keys back into the delivery path
//! (`app::delivery`), acknowledging or rejecting each delivery.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Envelope, MessageKey};
use crate::error::CourierError;
use crate::typed::DynHandler;

/// Subscription style requested by the handler manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionMode {
    /// Transient exclusive queue per subscription; every subscriber gets a copy.
    Push,
    /// Durable queue shared by every process registering the handler type.
    Pull,
}

/// Bind one routing key to one handler type.
#[derive(Clone)]
pub struct Subscription {
    routing_key: MessageKey,
    handler: Arc<dyn DynHandler>,
}

impl Subscription {
    pub fn new(routing_key: MessageKey, handler: Arc<dyn DynHandler>) -> Self {
        Self {
            routing_key,
            handler,
        }
    }

    pub fn routing_key(&self) -> &MessageKey {
        &self.routing_key
    }

    pub fn handler(&self) -> &Arc<dyn DynHandler> {
        &self.handler
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("routing_key", &self.routing_key)
            .field("handler", &self.handler.name())
            .finish()
    }
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Send an envelope to the exchange. Failures propagate; there is no
    /// retry on the publish path.
    async fn publish(&self, envelope: Envelope) -> Result<(), CourierError>;

    /// Push-mode delivery registration.
    async fn subscribe(&self, subscription: Subscription) -> Result<(), CourierError>;

    /// Durable, competing-consumer delivery registration. The queue is named
    /// `queue_prefix + normalized(handler name)`.
    async fn pull_subscribe(&self, subscription: Subscription) -> Result<(), CourierError>;
}
