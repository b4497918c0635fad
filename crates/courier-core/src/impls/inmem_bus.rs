//! InMemoryBus - 開発用・テスト用の Bus 実装
//!
//! # 実装詳細
//! - topic exchange を 1 つだけ持ち、routing key の完全一致で queue に振り分ける
//! - push (`subscribe`): subscription ごとに排他的な自動命名 queue (`amq.gen-<ulid>`)
//! - pull (`pull_subscribe`): `queue_prefix + normalized(handler)` の durable queue を共有し、
//!   consumer 間はラウンドロビン
//! - prefetch は consumer ごとの Semaphore。retry 待ちの配送が同じ queue の
//!   他の consumer を止めない
//! - ハンドラが配送中に積んだメッセージはこの Bus 自身に publish する
//! - publish log と完了済み配送の記録は `history` 件まで保持
//! - 配送は 1 件ずつ独立した task として `DeliveryEngine` に渡す
//!
//! # 使用例
//! ```ignore
//! let bus = Arc::new(InMemoryBus::new(BusConfig::new("events"))?);
//! let manager = HandlerManager::new(bus.clone());
//! manager.register(handler).await?;
//! manager.publish(&OrderPlaced { order_id: 7 }).await?;
//! let records = bus.drain().await;
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::app::{DeliveryEngine, DeliveryRecord};
use crate::config::BusConfig;
use crate::domain::{Envelope, GeneratedQueueId, MessageKey};
use crate::error::CourierError;
use crate::observability::BusCounts;
use crate::ports::{Acknowledger, Bus, Subscription};
use crate::typed::DynHandler;

/// A consumer on a queue with its own prefetch window.
struct Consumer {
    handler: Arc<dyn DynHandler>,
    prefetch: Arc<Semaphore>,
}

/// One queue bound to the exchange.
struct QueueState {
    bindings: BTreeSet<MessageKey>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    durable: bool,
    prefetch: usize,
}

impl QueueState {
    fn new(durable: bool, prefetch: usize) -> Self {
        Self {
            bindings: BTreeSet::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            durable,
            prefetch,
        }
    }

    fn add_consumer(&mut self, handler: &Arc<dyn DynHandler>) {
        let already = self
            .consumers
            .iter()
            .any(|c| std::ptr::addr_eq(Arc::as_ptr(&c.handler), Arc::as_ptr(handler)));
        if !already {
            self.consumers.push(Consumer {
                handler: Arc::clone(handler),
                prefetch: Arc::new(Semaphore::new(self.prefetch)),
            });
        }
    }

    /// Round-robin over the queue's consumers.
    fn route(&mut self, queue: &str) -> Option<Routed> {
        if self.consumers.is_empty() {
            return None;
        }
        let consumer = &self.consumers[self.next_consumer % self.consumers.len()];
        self.next_consumer = self.next_consumer.wrapping_add(1);
        Some(Routed {
            queue: queue.to_string(),
            handler: Arc::clone(&consumer.handler),
            prefetch: Arc::clone(&consumer.prefetch),
        })
    }
}

#[derive(Default)]
struct BusState {
    queues: BTreeMap<String, QueueState>,
    counts: BusCounts,
    published: VecDeque<Envelope>,
}

/// A delivery routed to one consumer but not yet started.
struct Routed {
    queue: String,
    handler: Arc<dyn DynHandler>,
    prefetch: Arc<Semaphore>,
}

type DeliveryTask = JoinHandle<Option<DeliveryRecord>>;

#[derive(Default)]
struct Deliveries {
    running: Vec<DeliveryTask>,
    finished: VecDeque<DeliveryRecord>,
}

struct Inner {
    config: BusConfig,
    engine: DeliveryEngine,
    state: Mutex<BusState>,
    deliveries: Mutex<Deliveries>,
}

/// In-memory topic exchange with push and pull subscriptions.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl InMemoryBus {
    /// Fails with `Configuration` when the config doesn't validate.
    pub fn new(config: BusConfig) -> Result<Self, CourierError> {
        config.validate()?;
        let engine = DeliveryEngine::new(config.retry.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                engine,
                state: Mutex::new(BusState::default()),
                deliveries: Mutex::new(Deliveries::default()),
            }),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Wait for every delivery in flight, including ones started while
    /// waiting, and return their records.
    ///
    /// Deliveries that finished before the call are returned too, up to
    /// `history` of them.
    pub async fn drain(&self) -> Vec<DeliveryRecord> {
        let mut records = Vec::new();
        loop {
            let running = {
                let mut deliveries = self.inner.deliveries.lock().await;
                records.extend(deliveries.finished.drain(..));
                std::mem::take(&mut deliveries.running)
            };
            if running.is_empty() {
                return records;
            }
            for task in running {
                records.extend(settle(task).await);
            }
        }
    }

    /// Delivery tasks tracked and not yet collected.
    pub async fn tracked(&self) -> usize {
        self.inner.deliveries.lock().await.running.len()
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.inner.state.lock().await.queues.keys().cloned().collect()
    }

    pub async fn bindings(&self, queue: &str) -> Vec<MessageKey> {
        self.inner
            .state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    pub async fn is_durable(&self, queue: &str) -> Option<bool> {
        self.inner.state.lock().await.queues.get(queue).map(|q| q.durable)
    }

    pub async fn counts(&self) -> BusCounts {
        self.inner.state.lock().await.counts.clone()
    }

    /// The last `history` envelopes published, oldest first.
    pub async fn published(&self) -> Vec<Envelope> {
        self.inner.state.lock().await.published.iter().cloned().collect()
    }
}

async fn settle(task: DeliveryTask) -> Option<DeliveryRecord> {
    match task.await {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "delivery task failed");
            None
        }
    }
}

/// Append to a log that keeps at most `capacity` entries.
fn keep_last<T>(log: &mut VecDeque<T>, entry: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while log.len() >= capacity {
        log.pop_front();
    }
    log.push_back(entry);
}

impl Inner {
    /// Spawn the delivery. It waits for a permit of the chosen consumer
    /// before processing.
    fn start(
        self: &Arc<Self>,
        routed: Routed,
        routing_key: MessageKey,
        payload: Vec<u8>,
    ) -> DeliveryTask {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = routed.prefetch.acquire_owned().await.ok()?;
            let acknowledger = Box::new(InMemoryAck {
                inner: Arc::clone(&inner),
                queue: routed.queue,
                routing_key: routing_key.clone(),
                payload: payload.clone(),
            });
            let outbound = InMemoryBus {
                inner: Arc::clone(&inner),
            };
            let record = inner
                .engine
                .deliver(routed.handler, routing_key, payload, acknowledger, &outbound)
                .await;
            Some(record)
        })
    }

    /// Track new delivery tasks and collect the ones already finished.
    async fn track(&self, tasks: Vec<DeliveryTask>) {
        let mut deliveries = self.deliveries.lock().await;
        deliveries.running.extend(tasks);

        let (done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut deliveries.running)
            .into_iter()
            .partition(|task| task.is_finished());
        deliveries.running = running;
        for task in done {
            if let Some(record) = settle(task).await {
                keep_last(&mut deliveries.finished, record, self.config.history);
            }
        }
    }

    /// Put a rejected delivery back on its queue for the next consumer.
    async fn requeue(self: &Arc<Self>, queue: &str, routing_key: MessageKey, payload: Vec<u8>) {
        let routed = {
            let mut state = self.state.lock().await;
            state.counts.requeued += 1;
            let Some(target) = state.queues.get_mut(queue) else {
                warn!(queue, "requeue target is gone, dropping delivery");
                return;
            };
            let Some(routed) = target.route(queue) else {
                warn!(queue, "requeue target has no consumer, dropping delivery");
                return;
            };
            state.counts.delivered += 1;
            routed
        };
        let task = self.start(routed, routing_key, payload);
        self.track(vec![task]).await;
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), CourierError> {
        let routed: Vec<Routed> = {
            let mut state = self.inner.state.lock().await;
            state.counts.published += 1;
            keep_last(&mut state.published, envelope.clone(), self.inner.config.history);

            let routed: Vec<Routed> = state
                .queues
                .iter_mut()
                .filter(|(_, queue)| queue.bindings.contains(envelope.routing_key()))
                .filter_map(|(name, queue)| queue.route(name))
                .collect();
            if routed.is_empty() {
                state.counts.unroutable += 1;
            }
            state.counts.delivered += routed.len();
            routed
        };

        debug!(
            exchange = %self.inner.config.exchange,
            routing_key = %envelope.routing_key(),
            queues = routed.len(),
            "message published"
        );

        let tasks = routed
            .into_iter()
            .map(|r| {
                self.inner
                    .start(r, envelope.routing_key().clone(), envelope.payload().to_vec())
            })
            .collect();
        self.inner.track(tasks).await;
        Ok(())
    }

    async fn subscribe(&self, subscription: Subscription) -> Result<(), CourierError> {
        let name = GeneratedQueueId::generate().to_string();
        let mut queue = QueueState::new(false, self.inner.config.prefetch);
        queue.bindings.insert(subscription.routing_key().clone());
        queue.add_consumer(subscription.handler());

        debug!(
            queue = %name,
            routing_key = %subscription.routing_key(),
            handler = %subscription.handler().name(),
            "exclusive queue bound"
        );
        self.inner.state.lock().await.queues.insert(name, queue);
        Ok(())
    }

    async fn pull_subscribe(&self, subscription: Subscription) -> Result<(), CourierError> {
        let name = self.inner.config.queue_name(subscription.handler().name());
        let prefetch = self.inner.config.prefetch;

        let mut state = self.inner.state.lock().await;
        let queue = state
            .queues
            .entry(name.clone())
            .or_insert_with(|| QueueState::new(true, prefetch));
        queue.bindings.insert(subscription.routing_key().clone());
        queue.add_consumer(subscription.handler());

        debug!(
            queue = %name,
            routing_key = %subscription.routing_key(),
            consumers = queue.consumers.len(),
            "durable queue bound"
        );
        Ok(())
    }
}

/// Settles one in-memory delivery and keeps the bus counters.
struct InMemoryAck {
    inner: Arc<Inner>,
    queue: String,
    routing_key: MessageKey,
    payload: Vec<u8>,
}

#[async_trait]
impl Acknowledger for InMemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), CourierError> {
        self.inner.state.lock().await.counts.acknowledged += 1;
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), CourierError> {
        if requeue {
            let InMemoryAck {
                inner,
                queue,
                routing_key,
                payload,
            } = *self;
            inner.requeue(&queue, routing_key, payload).await;
        } else {
            self.inner.state.lock().await.counts.rejected += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{HandlerManager, RetryPolicy};
    use crate::domain::DeliveryState;
    use crate::error::BoxError;
    use crate::typed::fixtures::{TestMessage, TestMessage1};
    use crate::typed::{Handler, HandlerConfig, Message};
    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Seen = Arc<StdMutex<Vec<String>>>;

    /// Stateless handler that appends `<label>:<key>:<id>` to a shared log.
    struct Tally {
        label: &'static str,
        seen: Seen,
    }

    impl Handler for Tally {
        type Output = ();
    }

    impl Tally {
        fn test_message(&self, message: &TestMessage) -> Result<(), BoxError> {
            self.push("test1", message.id);
            Ok(())
        }

        fn test_message1(&self, message: &TestMessage1) -> Result<(), BoxError> {
            self.push("test2", message.id);
            Ok(())
        }

        fn push(&self, key: &str, id: u64) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}:{}", self.label, key, id));
        }
    }

    fn tally(name: &str, label: &'static str, seen: &Seen) -> HandlerConfig<Tally> {
        let seen = Arc::clone(seen);
        HandlerConfig::builder(move || Tally {
            label,
            seen: Arc::clone(&seen),
        })
        .name(name)
        .on::<TestMessage, _, _>(Tally::test_message)
        .unwrap()
        .on::<TestMessage1, _, _>(Tally::test_message1)
        .unwrap()
        .build()
    }

    fn sorted(seen: &Seen) -> Vec<String> {
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        seen
    }

    fn bus(config: BusConfig) -> (Arc<InMemoryBus>, HandlerManager) {
        let bus = Arc::new(InMemoryBus::new(config).unwrap());
        let manager = HandlerManager::new(bus.clone());
        (bus, manager)
    }

    #[test]
    fn missing_exchange_fails_construction() {
        let err = InMemoryBus::new(BusConfig::new("")).err().unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn routing_delivers_by_key() {
        let seen = Seen::default();
        let (bus, manager) = bus(BusConfig::new("events"));

        let only_test1 = HandlerConfig::builder({
            let seen = Arc::clone(&seen);
            move || Tally {
                label: "a",
                seen: Arc::clone(&seen),
            }
        })
        .name("alpha")
        .on::<TestMessage, _, _>(Tally::test_message)
        .unwrap()
        .build();
        manager.register(Arc::new(only_test1)).await.unwrap();

        manager.publish(&TestMessage { id: 3 }).await.unwrap();
        manager.publish(&TestMessage1 { id: 4 }).await.unwrap();
        let records = bus.drain().await;

        assert_eq!(sorted(&seen), vec!["a:test1:3"]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].routing_key.as_str(), "test1");

        let counts = bus.counts().await;
        assert_eq!(counts.published, 2);
        assert_eq!(counts.unroutable, 1);
        assert_eq!(counts.acknowledged, 1);
    }

    #[tokio::test]
    async fn push_subscriptions_each_get_a_copy() {
        let seen = Seen::default();
        let (bus, manager) = bus(BusConfig::new("events"));
        manager
            .register(Arc::new(tally("alpha", "a", &seen)))
            .await
            .unwrap();
        manager
            .register(Arc::new(tally("beta", "b", &seen)))
            .await
            .unwrap();

        manager.publish(&TestMessage { id: 1 }).await.unwrap();
        bus.drain().await;

        assert_eq!(sorted(&seen), vec!["a:test1:1", "b:test1:1"]);

        let queues = bus.queue_names().await;
        assert_eq!(queues.len(), 4);
        for queue in &queues {
            assert!(queue.starts_with("amq.gen-"));
            assert_eq!(bus.is_durable(queue).await, Some(false));
            assert_eq!(bus.bindings(queue).await.len(), 1);
        }
        assert_eq!(bus.counts().await.acknowledged, 2);
    }

    #[tokio::test]
    async fn pull_subscriptions_share_one_durable_queue() {
        let seen = Seen::default();
        let (bus, manager) = bus(BusConfig::new("events").with_queue_prefix("app."));
        manager
            .pull_register(Arc::new(tally("WorkerSaga", "a", &seen)))
            .await
            .unwrap();

        assert_eq!(bus.queue_names().await, vec!["app.worker_saga".to_string()]);
        assert_eq!(
            bus.bindings("app.worker_saga").await,
            vec![MessageKey::new("test1"), MessageKey::new("test2")]
        );
        assert_eq!(bus.consumer_count("app.worker_saga").await, 1);
        assert_eq!(bus.is_durable("app.worker_saga").await, Some(true));
    }

    #[tokio::test]
    async fn pull_consumers_compete() {
        let seen = Seen::default();
        let (bus, first) = bus(BusConfig::new("events"));
        let second = HandlerManager::new(bus.clone());

        // Two processes registering the same handler type.
        first
            .pull_register(Arc::new(tally("worker", "a", &seen)))
            .await
            .unwrap();
        second
            .pull_register(Arc::new(tally("worker", "b", &seen)))
            .await
            .unwrap();
        assert_eq!(bus.consumer_count("worker").await, 2);

        for id in 1..=4 {
            first.publish(&TestMessage { id }).await.unwrap();
        }
        bus.drain().await;

        let seen = sorted(&seen);
        assert_eq!(seen.len(), 4);
        assert_eq!(seen.iter().filter(|s| s.starts_with("a:")).count(), 2);
        assert_eq!(seen.iter().filter(|s| s.starts_with("b:")).count(), 2);
        assert_eq!(bus.counts().await.delivered, 4);
    }

    fn always_failing(name: &str) -> HandlerConfig<Tally> {
        HandlerConfig::builder(|| Tally {
            label: "x",
            seen: Seen::default(),
        })
        .name(name)
        .on::<TestMessage, _, _>(|_: &Tally, _: &TestMessage| {
            Err::<(), BoxError>("database unavailable".into())
        })
        .unwrap()
        .build()
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_consumer_does_not_hold_up_its_peer() {
        let seen = Seen::default();
        let (bus, first) = bus(BusConfig::new("events"));
        let second = HandlerManager::new(bus.clone());

        first
            .pull_register(Arc::new(always_failing("worker")))
            .await
            .unwrap();
        second
            .pull_register(Arc::new(tally("worker", "b", &seen)))
            .await
            .unwrap();

        // Round-robin: id 1 goes to the failing consumer, id 2 to the healthy one.
        first.publish(&TestMessage { id: 1 }).await.unwrap();
        first.publish(&TestMessage { id: 2 }).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sorted(&seen), vec!["b:test1:2"]);
        assert_eq!(bus.counts().await.acknowledged, 1);

        let records = bus.drain().await;
        assert_eq!(records.len(), 2);
        assert_eq!(
            records
                .iter()
                .filter(|r| r.state == DeliveryState::Abandoned)
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_bounds_each_consumer() {
        let (bus, manager) = bus(BusConfig::new("events").with_prefetch(1));
        manager
            .pull_register(Arc::new(always_failing("worker")))
            .await
            .unwrap();

        manager.publish(&TestMessage { id: 1 }).await.unwrap();
        manager.publish(&TestMessage { id: 2 }).await.unwrap();

        // The second delivery waits until the first one gives up.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(bus.counts().await.rejected, 0);

        let started = tokio::time::Instant::now();
        let records = bus.drain().await;
        assert_eq!(records.len(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(49));
        assert_eq!(bus.counts().await.rejected, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_delivery_is_rejected_after_retry_bound() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let config = HandlerConfig::builder(|| Tally {
            label: "x",
            seen: Seen::default(),
        })
        .on::<TestMessage, _, _>(move |_: &Tally, _: &TestMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), BoxError>("database unavailable".into())
        })
        .unwrap()
        .build();

        let (bus, manager) = bus(BusConfig::new("events"));
        manager.register(Arc::new(config)).await.unwrap();
        manager.publish(&TestMessage::default()).await.unwrap();

        let started = tokio::time::Instant::now();
        let records = bus.drain().await;

        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, DeliveryState::Abandoned);
        assert_eq!(started.elapsed(), Duration::from_secs(25));

        let counts = bus.counts().await;
        assert_eq!(counts.rejected, 1);
        assert_eq!(counts.acknowledged, 0);
        assert_eq!(counts.requeued, 0);
        assert_eq!(counts.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_comes_from_config() {
        let config = HandlerConfig::builder(|| Tally {
            label: "x",
            seen: Seen::default(),
        })
        .on::<TestMessage, _, _>(|_: &Tally, _: &TestMessage| Err::<(), BoxError>("nope".into()))
        .unwrap()
        .build();

        let (bus, manager) = bus(
            BusConfig::new("events").with_retry(RetryPolicy::new(2, Duration::from_millis(100))),
        );
        manager.register(Arc::new(config)).await.unwrap();
        manager.publish(&TestMessage::default()).await.unwrap();

        let records = bus.drain().await;
        assert_eq!(records[0].attempts, 2);
        assert_eq!(records[0].max_attempts, 2);
    }

    #[tokio::test]
    async fn publish_log_keeps_envelopes() {
        let (bus, manager) = bus(BusConfig::new("events"));
        manager.publish(&TestMessage { id: 9 }).await.unwrap();

        let published = bus.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key().as_str(), "test1");
        assert_eq!(
            TestMessage::unmarshall(published[0].payload()).unwrap(),
            TestMessage { id: 9 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn history_bounds_logs_and_finished_tasks() {
        let seen = Seen::default();
        let (bus, manager) = bus(BusConfig::new("events").with_history(2));
        manager
            .register(Arc::new(tally("alpha", "a", &seen)))
            .await
            .unwrap();

        for id in 1..=5 {
            manager.publish(&TestMessage { id }).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(sorted(&seen).len(), 5);
        // Finished tasks are collected on the next publish; only the last is left.
        assert_eq!(bus.tracked().await, 1);

        let ids: Vec<u64> = bus
            .published()
            .await
            .iter()
            .map(|e| TestMessage::unmarshall(e.payload()).unwrap().id)
            .collect();
        assert_eq!(ids, vec![4, 5]);

        // Two kept from history plus the one still tracked.
        assert_eq!(bus.drain().await.len(), 3);
        assert_eq!(bus.tracked().await, 0);
    }

    #[tokio::test]
    async fn zero_history_keeps_no_publish_log() {
        let (bus, manager) = bus(BusConfig::new("events").with_history(0));
        manager.publish(&TestMessage { id: 9 }).await.unwrap();

        assert!(bus.published().await.is_empty());
        assert_eq!(bus.counts().await.published, 1);
    }

    #[tokio::test]
    async fn requeue_redelivers_to_the_queue() {
        let seen = Seen::default();
        let (bus, manager) = bus(BusConfig::new("events"));
        manager
            .pull_register(Arc::new(tally("worker", "a", &seen)))
            .await
            .unwrap();

        let ack = Box::new(InMemoryAck {
            inner: Arc::clone(&bus.inner),
            queue: "worker".to_string(),
            routing_key: TestMessage::message_key(),
            payload: TestMessage { id: 5 }.marshall().unwrap(),
        });
        ack.reject(true).await.unwrap();
        bus.drain().await;

        assert_eq!(sorted(&seen), vec!["a:test1:5"]);
        let counts = bus.counts().await;
        assert_eq!(counts.requeued, 1);
        assert_eq!(counts.acknowledged, 1);
    }

    // Saga scenario: an order saga started by OrderPlaced and continued by
    // PaymentReceived, correlated by order_id, persisted by the application.

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: u64,
    }

    impl Message for OrderPlaced {}

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct PaymentReceived {
        order_id: u64,
    }

    impl Message for PaymentReceived {}

    type Orders = Arc<StdMutex<HashMap<u64, Vec<&'static str>>>>;

    struct OrderSaga {
        orders: Orders,
    }

    impl Handler for OrderSaga {
        type Output = ();
    }

    impl OrderSaga {
        fn order_placed(&self, message: &OrderPlaced) -> Result<(), BoxError> {
            self.orders
                .lock()
                .unwrap()
                .entry(message.order_id)
                .or_default()
                .push("placed");
            Ok(())
        }

        fn payment_received(&self, message: &PaymentReceived) -> Result<(), BoxError> {
            let mut orders = self.orders.lock().unwrap();
            let order = orders.get_mut(&message.order_id).ok_or("unknown order")?;
            order.push("paid");
            Ok(())
        }
    }

    fn order_saga(orders: &Orders, created: &Arc<AtomicUsize>) -> HandlerConfig<OrderSaga> {
        let for_new = Arc::clone(orders);
        let for_find = Arc::clone(orders);
        let created = Arc::clone(created);
        HandlerConfig::builder(move || {
            created.fetch_add(1, Ordering::SeqCst);
            OrderSaga {
                orders: Arc::clone(&for_new),
            }
        })
        .stateful(true)
        .started_by::<OrderPlaced>()
        .on_with::<OrderPlaced, _, _>("order_id", OrderSaga::order_placed)
        .unwrap()
        .on_with::<PaymentReceived, _, _>("order_id", OrderSaga::payment_received)
        .unwrap()
        .finder("order_id", move |id: &Value| {
            let known = id
                .as_u64()
                .is_some_and(|id| for_find.lock().unwrap().contains_key(&id));
            Ok::<_, BoxError>(known.then(|| {
                Arc::new(OrderSaga {
                    orders: Arc::clone(&for_find),
                })
            }))
        })
        .build()
    }

    #[tokio::test(start_paused = true)]
    async fn saga_is_started_then_continued() {
        let orders = Orders::default();
        let created = Arc::new(AtomicUsize::new(0));
        let (bus, manager) = bus(BusConfig::new("events").with_queue_prefix("shop."));
        manager
            .pull_register(Arc::new(order_saga(&orders, &created)))
            .await
            .unwrap();
        assert_eq!(
            bus.queue_names().await,
            vec!["shop.impls_inmem_bus_tests_order_saga".to_string()]
        );

        manager.publish(&OrderPlaced { order_id: 7 }).await.unwrap();
        bus.drain().await;
        manager.publish(&PaymentReceived { order_id: 7 }).await.unwrap();
        bus.drain().await;

        assert_eq!(orders.lock().unwrap().get(&7), Some(&vec!["placed", "paid"]));
        assert_eq!(created.load(Ordering::SeqCst), 1);

        // A continuation with no saga behind it exhausts its retries.
        manager.publish(&PaymentReceived { order_id: 8 }).await.unwrap();
        let records = bus.drain().await;
        assert_eq!(records[0].state, DeliveryState::Abandoned);
        assert_eq!(records[0].attempts, 6);
        assert!(
            records[0]
                .last_error
                .as_deref()
                .is_some_and(|e| e.starts_with("no handler"))
        );
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    // A saga that publishes a follow-up through the manager while handling.

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct OrderConfirmed {
        order_id: u64,
    }

    impl Message for OrderConfirmed {}

    struct Checkout {
        manager: HandlerManager,
    }

    impl Handler for Checkout {
        type Output = ();
    }

    impl Checkout {
        fn order_placed(&self, message: &OrderPlaced) -> Result<(), BoxError> {
            self.manager.stage(&OrderConfirmed {
                order_id: message.order_id,
            })?;
            Ok(())
        }
    }

    struct Ledger {
        confirmed: Arc<StdMutex<Vec<u64>>>,
    }

    impl Handler for Ledger {
        type Output = ();
    }

    impl Ledger {
        fn order_confirmed(&self, message: &OrderConfirmed) -> Result<(), BoxError> {
            self.confirmed.lock().unwrap().push(message.order_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn saga_publishes_follow_up_to_another_handler_type() {
        let (bus, manager) = bus(BusConfig::new("events"));
        let confirmed = Arc::new(StdMutex::new(Vec::new()));

        let for_checkout = manager.clone();
        let checkout = HandlerConfig::builder(move || Checkout {
            manager: for_checkout.clone(),
        })
        .stateful(true)
        .started_by::<OrderPlaced>()
        .on_with::<OrderPlaced, _, _>("order_id", Checkout::order_placed)
        .unwrap()
        .build();
        let for_ledger = Arc::clone(&confirmed);
        let ledger = HandlerConfig::builder(move || Ledger {
            confirmed: Arc::clone(&for_ledger),
        })
        .on::<OrderConfirmed, _, _>(Ledger::order_confirmed)
        .unwrap()
        .build();

        manager.pull_register(Arc::new(checkout)).await.unwrap();
        manager.register(Arc::new(ledger)).await.unwrap();

        manager.publish(&OrderPlaced { order_id: 7 }).await.unwrap();
        let records = bus.drain().await;

        assert_eq!(*confirmed.lock().unwrap(), vec![7]);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.state == DeliveryState::Acknowledged));

        let keys: Vec<String> = bus
            .published()
            .await
            .iter()
            .map(|e| e.routing_key().to_string())
            .collect();
        assert_eq!(keys, vec!["order_placed", "order_confirmed"]);
    }
}
