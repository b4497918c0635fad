//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryBus**: topic exchange を模した開発用の Bus
//!
//! # 本番用実装
//! 本番用のブローカー接続（AMQP クライアント等）は別クレートに配置します。

pub mod inmem_bus;

// 主要な型を再エクスポート
pub use self::inmem_bus::InMemoryBus;
