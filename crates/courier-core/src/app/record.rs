//! Delivery record: the state machine of one inbound delivery.

use std::time::Instant;

use crate::domain::{DeliveryId, DeliveryState, MessageKey};

/// Outcome and history of one delivery.
///
/// Every transition happens through the methods below; the delivery engine
/// owns the record until the delivery reaches a terminal state.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub id: DeliveryId,
    pub routing_key: MessageKey,
    pub handler: String,
    pub state: DeliveryState,

    /// Processing attempts made so far (including the current one while Processing).
    pub attempts: u32,

    pub max_attempts: u32,

    pub last_error: Option<String>,

    pub created_at: Instant,
    pub updated_at: Instant,
}

impl DeliveryRecord {
    pub fn new(routing_key: MessageKey, handler: impl Into<String>, max_attempts: u32) -> Self {
        let now = Instant::now();
        Self {
            id: DeliveryId::generate(),
            routing_key,
            handler: handler.into(),
            state: DeliveryState::Delivered,
            attempts: 0,
            max_attempts,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn start_attempt(&mut self) {
        self.state = DeliveryState::Processing;
        self.attempts += 1;
        self.updated_at = Instant::now();
    }

    pub fn mark_acknowledged(&mut self) {
        self.state = DeliveryState::Acknowledged;
        self.updated_at = Instant::now();
    }

    pub fn schedule_retry(&mut self, error: String) {
        self.state = DeliveryState::RetryScheduled;
        self.last_error = Some(error);
        self.updated_at = Instant::now();
    }

    pub fn mark_abandoned(&mut self, error: String) {
        self.state = DeliveryState::Abandoned;
        self.last_error = Some(error);
        self.updated_at = Instant::now();
    }
}
