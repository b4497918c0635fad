use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MessageKey;

/// A marshalled message on its way to the broker.
///
/// The payload carries only the message fields; the type travels out of band
/// as the routing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    routing_key: MessageKey,
    payload: Vec<u8>,
    published_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(routing_key: MessageKey, payload: Vec<u8>) -> Self {
        Self {
            routing_key,
            payload,
            published_at: Utc::now(),
        }
    }

    pub fn routing_key(&self) -> &MessageKey {
        &self.routing_key
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    /// Unix timestamp in seconds, as sent in the broker `timestamp` property.
    pub fn timestamp(&self) -> i64 {
        self.published_at.timestamp()
    }
}
