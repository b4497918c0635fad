//! App - アプリケーション層
//!
//! ports と typed を組み合わせて配送ロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: ハンドラ型の登録と起動時検証
//! - **HandlerManager**: Bus の保持、subscribe、publish の転送
//! - **DeliveryEngine**: 1 件の配送（decode→resolve→handle→ack / retry / reject）
//! - **outbox**: ハンドラが配送中に publish するメッセージ（ack 前に送信）
//! - **RetryPolicy**: 試行回数の上限と固定遅延
//! - **DeliveryRecord**: 配送ごとの状態遷移

pub mod builder;
pub mod delivery;
pub mod manager;
mod outbox;
pub mod record;
pub mod retry;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::delivery::DeliveryEngine;
pub use self::manager::HandlerManager;
pub use self::record::DeliveryRecord;
pub use self::retry::RetryPolicy;
