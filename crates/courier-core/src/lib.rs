//! courier-core
//!
//! Core building blocks for Courier: message handlers and sagas on a
//! publish/subscribe bus.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（message key, envelope, ids, delivery state）
//! - **typed**: 型付き API（Message, Handler, HandlerConfig, HandlerRegistry, instance resolution）
//! - **ports**: 抽象化レイヤー（Bus, Acknowledger）
//! - **app**: アプリケーションロジック（builder, manager, delivery engine, retry policy）
//! - **impls**: 実装（InMemoryBus）
//! - **config**: Bus の設定
//! - **error**: エラー型
//! - **observability**: Bus のカウンタ

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod typed;

pub use app::{App, AppBuilder, DeliveryEngine, DeliveryRecord, HandlerManager, RetryPolicy};
pub use config::BusConfig;
pub use domain::{DeliveryState, Envelope, MessageKey};
pub use error::{BoxError, CourierError};
pub use impls::InMemoryBus;
pub use ports::{Acknowledger, Bus, Subscription, SubscriptionMode};
pub use typed::{DynHandler, Handler, HandlerConfig, HandlerRegistry, Message};
