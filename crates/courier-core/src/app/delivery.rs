//! DeliveryEngine - turns an inbound payload into an acknowledged or
//! abandoned delivery.
//!
//! Flow per delivery:
//! 1. decode the payload into the message type bound to the routing key
//!    (failure rejects at once; re-delivery can't fix a missing binding)
//! 2. resolve the handler instance and handle the message
//! 3. success: publish what the handler staged, then ack
//! 4. failure before the last attempt: log, wait the policy delay, go to 2
//!    with the already decoded message
//! 5. failure on the last attempt: log with full context, reject without requeue
//!
//! A staged publish that fails counts as a failed attempt. Messages already
//! published by that attempt are published again on the next one.
//!
//! The wait is a timer await inside the delivery's own task, so other
//! deliveries keep flowing while one sits in `RetryScheduled`.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info_span, warn};

use super::outbox;
use super::record::DeliveryRecord;
use super::retry::RetryPolicy;
use crate::domain::{Envelope, MessageKey};
use crate::error::CourierError;
use crate::ports::{Acknowledger, Bus};
use crate::typed::DynHandler;

#[derive(Debug, Clone, Default)]
pub struct DeliveryEngine {
    policy: RetryPolicy,
}

impl DeliveryEngine {
    /// A policy with `max_attempts == 0` (e.g. deserialized) runs one attempt.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: RetryPolicy::new(policy.max_attempts, policy.delay),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one delivery to a terminal state on a new task.
    pub fn spawn(
        self: &Arc<Self>,
        handler: Arc<dyn DynHandler>,
        routing_key: MessageKey,
        payload: Vec<u8>,
        acknowledger: Box<dyn Acknowledger>,
        outbound: Arc<dyn Bus>,
    ) -> JoinHandle<DeliveryRecord> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine
                .deliver(handler, routing_key, payload, acknowledger, outbound.as_ref())
                .await
        })
    }

    /// Run one delivery to a terminal state. Messages the handler stages are
    /// published on `outbound`.
    pub async fn deliver(
        &self,
        handler: Arc<dyn DynHandler>,
        routing_key: MessageKey,
        payload: Vec<u8>,
        acknowledger: Box<dyn Acknowledger>,
        outbound: &dyn Bus,
    ) -> DeliveryRecord {
        let record = DeliveryRecord::new(routing_key, handler.name(), self.policy.max_attempts);
        let span = info_span!(
            "delivery",
            delivery_id = %record.id,
            routing_key = %record.routing_key,
            handler = %record.handler,
        );
        self.run(record, handler.as_ref(), &payload, acknowledger, outbound)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        mut record: DeliveryRecord,
        handler: &dyn DynHandler,
        payload: &[u8],
        acknowledger: Box<dyn Acknowledger>,
        outbound: &dyn Bus,
    ) -> DeliveryRecord {
        let message = match handler.decode(&record.routing_key, payload) {
            Ok(message) => message,
            Err(err) => {
                error!(
                    error = %err,
                    payload = %String::from_utf8_lossy(payload),
                    "payload rejected before processing"
                );
                record.mark_abandoned(err.to_string());
                reject(acknowledger).await;
                return record;
            }
        };

        loop {
            record.start_attempt();
            let (processed, staged) = outbox::collect(|| handler.process(&message));
            let outcome = match processed {
                Ok(()) => publish_staged(outbound, staged).await,
                Err(err) => Err(err),
            };
            let err = match outcome {
                Ok(()) => {
                    if let Err(e) = acknowledger.ack().await {
                        warn!(error = %e, "ack failed");
                    }
                    record.mark_acknowledged();
                    debug!(attempts = record.attempts, "delivery acknowledged");
                    return record;
                }
                Err(err) => err,
            };

            if err.is_fatal() || !self.policy.should_retry(record.attempts) {
                error!(
                    attempt = record.attempts,
                    max_attempts = record.max_attempts,
                    error = %err,
                    details = ?err,
                    payload = %String::from_utf8_lossy(payload),
                    "delivery abandoned"
                );
                record.mark_abandoned(err.to_string());
                reject(acknowledger).await;
                return record;
            }

            let delay = self.policy.next_delay(record.attempts);
            warn!(
                attempt = record.attempts,
                max_attempts = record.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "handler failed, retry scheduled"
            );
            record.schedule_retry(err.to_string());
            tokio::time::sleep(delay).await;
        }
    }
}

async fn publish_staged(outbound: &dyn Bus, staged: Vec<Envelope>) -> Result<(), CourierError> {
    for envelope in staged {
        let routing_key = envelope.routing_key().clone();
        outbound.publish(envelope).await?;
        debug!(%routing_key, "staged message published");
    }
    Ok(())
}

async fn reject(acknowledger: Box<dyn Acknowledger>) {
    if let Err(e) = acknowledger.reject(false).await {
        warn!(error = %e, "reject failed");
    }
}
