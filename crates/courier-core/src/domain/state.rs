//! Delivery state machine.

use serde::{Deserialize, Serialize};

/// State of one inbound delivery.
///
/// State transitions:
/// - Delivered -> Processing -> Acknowledged
/// - Delivered -> Processing -> RetryScheduled -> Processing (loop until max_attempts)
/// - Delivered -> Processing -> Abandoned (final attempt failed)
/// - Delivered -> Abandoned (payload can't be decoded for this handler)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Payload received, not decoded yet.
    Delivered,

    /// Handler resolution and invocation in progress.
    Processing,

    /// Waiting for the retry delay to elapse.
    RetryScheduled,

    /// Handled and positively acknowledged.
    Acknowledged,

    /// Rejected without requeue.
    Abandoned,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Acknowledged | DeliveryState::Abandoned)
    }
}
