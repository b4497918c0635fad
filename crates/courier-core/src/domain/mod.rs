//! Domain model: message keys, envelopes, delivery ids and states.

pub mod envelope;
pub mod ids;
pub mod key;
pub mod state;

pub use envelope::Envelope;
pub use ids::{DeliveryId, GeneratedQueueId};
pub use key::{MessageKey, normalized_name, underscore};
pub use state::DeliveryState;
