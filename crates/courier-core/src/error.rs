use thiserror::Error;

use crate::domain::MessageKey;

/// Boxed error returned by handler functions and finders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum CourierError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("message {message} has no identity selector `{selector}`")]
    Registration { message: String, selector: String },

    #[error("message key {key} is used by both {existing} and {conflicting}")]
    DuplicateMessageKey {
        key: MessageKey,
        existing: String,
        conflicting: String,
    },

    #[error("duplicate handler type {0}")]
    DuplicateHandler(String),

    #[error("can't handle message {message} in {handler}")]
    UnboundMessage { handler: String, message: String },

    #[error("no handler (or starter if stateful) for message {message} in {handler}")]
    NoHandler { handler: String, message: String },

    #[error("codec error for {key}: {reason}")]
    Codec { key: MessageKey, reason: String },

    #[error("finder `find_by_{selector}` failed in {handler}: {source}")]
    Finder {
        handler: String,
        selector: String,
        #[source]
        source: BoxError,
    },

    #[error("handler {handler} failed on {message}: {source}")]
    Handler {
        handler: String,
        message: String,
        #[source]
        source: BoxError,
    },

    #[error("message {0} staged outside a delivery; publish it through the manager instead")]
    OutsideDelivery(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl CourierError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    pub fn codec(key: &MessageKey, reason: impl ToString) -> Self {
        Self::Codec {
            key: key.clone(),
            reason: reason.to_string(),
        }
    }

    /// Errors that re-delivery can never fix. The delivery path rejects these
    /// on the spot instead of scheduling a retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CourierError::UnboundMessage { .. } | CourierError::Codec { .. }
        ) || self.is_configuration()
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CourierError::Configuration(_)
                | CourierError::Registration { .. }
                | CourierError::DuplicateMessageKey { .. }
                | CourierError::DuplicateHandler(_)
        )
    }
}
