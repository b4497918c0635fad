//! Acknowledger port - settles one delivery with the broker.

use async_trait::async_trait;

use crate::error::CourierError;

/// Handle for a single inbound delivery. The delivery path consumes it with
/// exactly one of `ack` or `reject`.
#[async_trait]
pub trait Acknowledger: Send {
    /// Positive acknowledgment.
    async fn ack(self: Box<Self>) -> Result<(), CourierError>;

    /// Negative acknowledgment. With `requeue == false` the broker drops or
    /// dead-letters the message.
    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), CourierError>;
}
