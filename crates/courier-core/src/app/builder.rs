//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 登録と subscribe の分離（設定は build 前に確定、Bus への bind は build 時）

use std::sync::Arc;

use crate::domain::MessageKey;
use crate::error::CourierError;
use crate::ports::{Bus, SubscriptionMode};
use crate::typed::{DynHandler, Handler, HandlerConfig, HandlerRegistry};

use super::manager::HandlerManager;

/// AppBuilder はハンドラ型を集めて App を生成
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .register(order_saga, SubscriptionMode::Pull)?
///     .register(audit_log, SubscriptionMode::Push)?
///     .expect_messages(&["order_placed", "payment_received"])
///     .build(bus)
///     .await?;
/// app.manager.publish(&OrderPlaced { order_id: 7 }).await?;
/// ```
///
/// # Fail-fast 設計
/// - register() の時点で重複したハンドラ名・メッセージキーを拒否
/// - expect_messages() で期待されるメッセージキーを登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
pub struct AppBuilder {
    registry: HandlerRegistry,
    bindings: Vec<(Arc<dyn DynHandler>, SubscriptionMode)>,
    expected_messages: Option<Vec<String>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing message keys: {0:?}. These messages were expected but no handler type binds them.")]
    MissingMessageKeys(Vec<String>),

    #[error(transparent)]
    Courier(#[from] CourierError),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            bindings: Vec::new(),
            expected_messages: None,
        }
    }

    /// ハンドラ型を登録し、build 時の subscribe 方式を指定
    pub fn register<H: Handler>(
        mut self,
        config: HandlerConfig<H>,
        mode: SubscriptionMode,
    ) -> Result<Self, CourierError> {
        let handler = self.registry.register(config)?;
        self.bindings.push((handler, mode));
        Ok(self)
    }

    pub fn expect_messages(mut self, keys: &[&str]) -> Self {
        self.expected_messages = Some(keys.iter().map(|k| k.to_string()).collect());
        self
    }

    /// 検証後、全ハンドラ型を `bus` に bind して App を生成
    pub async fn build(self, bus: Arc<dyn Bus>) -> Result<App, BuildError> {
        self.build_with(HandlerManager::new(bus)).await
    }

    /// build() と同じだが、既存の manager に bind する
    ///
    /// ハンドラが publish する場合は manager を先に作り、コンストラクタに
    /// clone を渡してから register する。
    pub async fn build_with(self, manager: HandlerManager) -> Result<App, BuildError> {
        if let Some(expected) = &self.expected_messages {
            let missing: Vec<String> = expected
                .iter()
                .filter(|key| {
                    self.registry
                        .message_type_for(&MessageKey::new(key.as_str()))
                        .is_none()
                })
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingMessageKeys(missing));
            }
        }

        for (handler, mode) in &self.bindings {
            match mode {
                SubscriptionMode::Push => manager.register(Arc::clone(handler)).await?,
                SubscriptionMode::Pull => manager.pull_register(Arc::clone(handler)).await?,
            }
        }

        Ok(App {
            registry: self.registry,
            manager,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// App は構築済みのレジストリと Bus に bind 済みの manager を保持
pub struct App {
    pub registry: HandlerRegistry,
    pub manager: HandlerManager,
}
