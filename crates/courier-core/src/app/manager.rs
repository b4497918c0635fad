//! HandlerManager - ハンドラ型と Bus のワイヤリング
//!
//! # 役割
//! - アクティブな Bus を 1 つだけ保持する（差し替え可能、積み重ねない）
//! - ハンドラ型のメッセージキーごとに subscribe / pull_subscribe を発行
//! - ハンドラコードからの publish を Bus に転送
//!
//! ハンドラインスタンスは Bus を持たず、manager 経由で publish する。
//! bound function は同期なので、配送中は `stage` で積み、DeliveryEngine が
//! 処理成功後・ack 前に publish する。publish の失敗はその配送の失敗になる。

use std::sync::Arc;

use tracing::info;

use super::outbox;
use crate::domain::Envelope;
use crate::error::CourierError;
use crate::ports::{Bus, Subscription, SubscriptionMode};
use crate::typed::{DynHandler, HandlerRegistry, Message};

#[derive(Clone)]
pub struct HandlerManager {
    bus: Arc<dyn Bus>,
}

impl HandlerManager {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    /// Replace the active bus. Subscriptions made through the old one stay there.
    pub fn set_bus(&mut self, bus: Arc<dyn Bus>) {
        self.bus = bus;
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    /// Push registration: one exclusive subscription per message key.
    pub async fn register(&self, handler: Arc<dyn DynHandler>) -> Result<(), CourierError> {
        self.bind(handler, SubscriptionMode::Push).await
    }

    /// Pull registration: every key is bound to the handler type's durable queue.
    pub async fn pull_register(&self, handler: Arc<dyn DynHandler>) -> Result<(), CourierError> {
        self.bind(handler, SubscriptionMode::Pull).await
    }

    /// Bind every handler type of `registry` in `mode`.
    pub async fn register_all(
        &self,
        registry: &HandlerRegistry,
        mode: SubscriptionMode,
    ) -> Result<(), CourierError> {
        for handler in registry.handlers() {
            self.bind(Arc::clone(handler), mode).await?;
        }
        Ok(())
    }

    pub async fn publish<M: Message>(&self, message: &M) -> Result<(), CourierError> {
        let payload = message.marshall()?;
        self.bus
            .publish(Envelope::new(M::message_key(), payload))
            .await
    }

    /// Publish `message` from inside a bound function or finder.
    ///
    /// The message is sent once the current delivery has been handled and
    /// before it is acked. If the publish fails, the delivery is retried like
    /// any handler failure; staged messages of failed attempts are dropped.
    /// Outside a delivery this fails with `OutsideDelivery`; use `publish`.
    pub fn stage<M: Message>(&self, message: &M) -> Result<(), CourierError> {
        outbox::stage(message)
    }

    async fn bind(
        &self,
        handler: Arc<dyn DynHandler>,
        mode: SubscriptionMode,
    ) -> Result<(), CourierError> {
        let messages = handler.messages();
        for message in &messages {
            let subscription = Subscription::new(message.key.clone(), Arc::clone(&handler));
            match mode {
                SubscriptionMode::Push => self.bus.subscribe(subscription).await?,
                SubscriptionMode::Pull => self.bus.pull_subscribe(subscription).await?,
            }
        }
        info!(
            handler = %handler.name(),
            mode = ?mode,
            keys = messages.len(),
            "handler type bound to bus"
        );
        Ok(())
    }
}
