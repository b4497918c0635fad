//! Outbox - 配送中のハンドラが publish するメッセージの一時置き場
//!
//! bound function は同期なので、その場で Bus に publish できない。
//! DeliveryEngine は試行ごとに空の outbox を用意してハンドラを実行し、
//! 積まれた envelope を処理成功後・ack 前に publish する。
//!
//! # 学習ポイント
//! - `tokio::task_local!` の `sync_scope` で配送ごとに outbox を分離
//!   （同じハンドラ型の並行配送が混ざらない）
//! - 失敗した試行の outbox は捨てる。publish されるのは成功した試行の分だけ

use std::cell::RefCell;

use crate::domain::Envelope;
use crate::error::CourierError;
use crate::typed::Message;

tokio::task_local! {
    static STAGED: RefCell<Vec<Envelope>>;
}

/// Run `f` with an empty outbox and return what it staged.
pub(crate) fn collect<R>(f: impl FnOnce() -> R) -> (R, Vec<Envelope>) {
    STAGED.sync_scope(RefCell::new(Vec::new()), || {
        let result = f();
        let staged = STAGED.with(|staged| staged.take());
        (result, staged)
    })
}

/// Marshall `message` onto the outbox of the delivery running on this task.
pub(crate) fn stage<M: Message>(message: &M) -> Result<(), CourierError> {
    let envelope = Envelope::new(M::message_key(), message.marshall()?);
    STAGED
        .try_with(|staged| staged.borrow_mut().push(envelope))
        .map_err(|_| CourierError::OutsideDelivery(M::type_name().to_string()))
}
