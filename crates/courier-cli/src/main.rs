use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_core::{
    AppBuilder, BoxError, BusConfig, DeliveryState, Handler, HandlerConfig, HandlerManager,
    InMemoryBus, Message, RetryPolicy, SubscriptionMode,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u64,
    amount: u64,
}

impl Message for OrderPlaced {}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PaymentReceived {
    order_id: u64,
    amount: u64,
}

impl Message for PaymentReceived {}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OrderShipped {
    order_id: u64,
}

impl Message for OrderShipped {}

#[derive(Debug, Clone, Default)]
struct OrderState {
    due: u64,
    paid: u64,
    shipped: bool,
}

/// アプリケーション側の saga ストア（永続化は courier の責務外）
type OrderStore = Arc<Mutex<HashMap<u64, OrderState>>>;

/// 注文 saga：OrderPlaced で開始、PaymentReceived / OrderShipped で継続
///
/// 支払いが揃ったら manager 経由で OrderShipped を publish する
struct OrderSaga {
    store: OrderStore,
    manager: HandlerManager,
}

impl Handler for OrderSaga {
    type Output = ();
}

impl OrderSaga {
    fn order_placed(&self, m: &OrderPlaced) -> Result<(), BoxError> {
        let mut store = self.store.lock().map_err(|e| e.to_string())?;
        store.entry(m.order_id).or_default().due = m.amount;
        info!(order_id = m.order_id, amount = m.amount, "order placed");
        Ok(())
    }

    fn payment_received(&self, m: &PaymentReceived) -> Result<(), BoxError> {
        let mut store = self.store.lock().map_err(|e| e.to_string())?;
        let order = store.entry(m.order_id).or_default();
        order.paid += m.amount;
        info!(order_id = m.order_id, paid = order.paid, due = order.due, "payment received");
        if order.paid >= order.due {
            self.manager.stage(&OrderShipped {
                order_id: m.order_id,
            })?;
        }
        Ok(())
    }

    fn order_shipped(&self, m: &OrderShipped) -> Result<(), BoxError> {
        let mut store = self.store.lock().map_err(|e| e.to_string())?;
        let order = store.entry(m.order_id).or_default();
        if order.shipped {
            return Ok(());
        }
        if order.paid < order.due {
            return Err(format!("order {} shipped before being paid", m.order_id).into());
        }
        order.shipped = true;
        info!(order_id = m.order_id, "order shipped");
        Ok(())
    }
}

/// stateless：毎回新しいインスタンス。最初の数回はわざと失敗する
struct AuditLog {
    remaining_failures: Arc<AtomicU32>,
}

impl Handler for AuditLog {
    type Output = ();
}

impl AuditLog {
    fn order_placed(&self, m: &OrderPlaced) -> Result<(), BoxError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(format!("intentional failure (left={left})").into());
        }
        println!("audit: order {} placed for {}", m.order_id, m.amount);
        Ok(())
    }
}

fn order_saga(
    store: &OrderStore,
    manager: &HandlerManager,
) -> Result<HandlerConfig<OrderSaga>, courier_core::CourierError> {
    let for_new = (Arc::clone(store), manager.clone());
    let for_find = (Arc::clone(store), manager.clone());
    Ok(HandlerConfig::builder(move || OrderSaga {
        store: Arc::clone(&for_new.0),
        manager: for_new.1.clone(),
    })
    .stateful(true)
    .started_by::<OrderPlaced>()
    .on_with::<OrderPlaced, _, _>("order_id", OrderSaga::order_placed)?
    .on_with::<PaymentReceived, _, _>("order_id", OrderSaga::payment_received)?
    .on_with::<OrderShipped, _, _>("order_id", OrderSaga::order_shipped)?
    .finder("order_id", move |id: &Value| -> Result<Option<Arc<OrderSaga>>, BoxError> {
        let Some(id) = id.as_u64() else {
            return Ok(None);
        };
        let (store, manager) = &for_find;
        let known = store.lock().map_err(|e| e.to_string())?.contains_key(&id);
        Ok(known.then(|| {
            Arc::new(OrderSaga {
                store: Arc::clone(store),
                manager: manager.clone(),
            })
        }))
    })
    .build())
}

fn audit_log(failures: u32) -> Result<HandlerConfig<AuditLog>, courier_core::CourierError> {
    let remaining = Arc::new(AtomicU32::new(failures));
    HandlerConfig::builder(move || AuditLog {
        remaining_failures: Arc::clone(&remaining),
    })
    .on::<OrderPlaced, _, _>(AuditLog::order_placed)
    .map(|b| b.build())
}

/// `COURIER_BUS` に JSON があればそれを、なければ短い retry 遅延のデモ設定を使う
fn bus_config() -> Result<BusConfig, courier_core::CourierError> {
    match std::env::var("COURIER_BUS") {
        Ok(json) => BusConfig::from_json(&json),
        Err(_) => Ok(BusConfig::new("courier.demo")
            .with_queue_prefix("demo.")
            .with_retry(RetryPolicy::new(3, Duration::from_millis(200)))),
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // (A) Bus と manager、ハンドラ型を用意（saga は manager 経由で publish する）
    let bus = Arc::new(InMemoryBus::new(bus_config()?)?);
    let manager = HandlerManager::new(bus.clone());
    let store = OrderStore::default();

    // (B) 登録と起動時検証、Bus への bind
    let app = AppBuilder::new()
        .register(order_saga(&store, &manager)?, SubscriptionMode::Pull)?
        .register(audit_log(1)?, SubscriptionMode::Push)?
        .expect_messages(&["order_placed", "payment_received", "order_shipped"])
        .build_with(manager)
        .await?;

    let queues = bus.queue_names().await;
    info!(handlers = ?app.registry.registered_handlers(), ?queues, "app ready");

    // (C) saga を開始して継続する。支払い完了で saga 自身が OrderShipped を publish
    app.manager
        .publish(&OrderPlaced { order_id: 1, amount: 30 })
        .await?;
    bus.drain().await;

    app.manager
        .publish(&PaymentReceived { order_id: 1, amount: 30 })
        .await?;
    bus.drain().await;

    // (D) saga のない継続メッセージは retry 上限まで試して reject される
    app.manager.publish(&OrderShipped { order_id: 2 }).await?;

    let records = bus.drain().await;
    for record in &records {
        let outcome = match record.state {
            DeliveryState::Acknowledged => "acknowledged",
            DeliveryState::Abandoned => "abandoned",
            _ => "in progress",
        };
        println!(
            "{} {} -> {} after {} attempt(s){}",
            record.id,
            record.routing_key,
            outcome,
            record.attempts,
            record
                .last_error
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default()
        );
    }

    println!("orders: {:?}", store.lock().map_err(|e| e.to_string())?);
    println!("counts: {}", serde_json::to_string(&bus.counts().await)?);
    Ok(())
}
