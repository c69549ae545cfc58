//! WorkQueue port - consumer group 付きの追記ログ
//!
//! Redis Streams と同じ形のモデルです。
//!
//! # 設計原則
//! - at-least-once 配送。append 順の FIFO だが consumer 間の全体順序はない
//! - consume されたエントリは ack されるまで group の pending list に残る
//! - 一定時間 idle な pending は group の誰でも claim できる（worker のクラッシュ対策）
//! - キューが使えないときは `QueueError::Unavailable`。呼び出し側はサイクル全体を
//!   後でやり直し、途中までの状態をコミットしない

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, QueueEnvelope, QueueError};

/// Default idle threshold after which a pending delivery may be reclaimed.
pub const DEFAULT_RECLAIM_IDLE: Duration = Duration::from_millis(60_000);

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: MessageId,
    pub consumer: String,
    pub delivery_count: u32,
    pub envelope: QueueEnvelope,
}

/// One row of a group's pending list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub message_id: MessageId,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: usize,
    pub pending: usize,
    /// Entries appended after the group's last delivered id.
    pub lag: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub length: usize,
    pub groups: Vec<GroupInfo>,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Creates the consumer group (and the stream) if absent. Idempotent.
    async fn ensure_group(&self, group: &str) -> Result<(), QueueError>;

    async fn append(&self, envelope: QueueEnvelope) -> Result<MessageId, QueueError>;

    /// Hands out up to `count` never-delivered entries, waiting up to `block`
    /// for the first one to arrive. An empty vec means nothing was available.
    async fn consume(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Returns whether the id was pending.
    async fn ack(&self, group: &str, message_id: MessageId) -> Result<bool, QueueError>;

    /// Oldest-first view of the group's pending list, at most `count` rows.
    async fn pending_range(&self, group: &str, count: usize)
    -> Result<Vec<PendingEntry>, QueueError>;

    /// Moves ownership of the given pending ids to `consumer` when idle at
    /// least `min_idle`. Ids that are not pending, not idle long enough, or
    /// whose entry was trimmed are not returned.
    async fn claim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Reads one entry's payload without delivering it.
    async fn read(&self, message_id: MessageId) -> Result<Option<QueueEnvelope>, QueueError>;

    /// Drops the oldest entries so at most `max_len` remain. Returns how many went.
    async fn trim(&self, max_len: usize) -> Result<usize, QueueError>;

    async fn info(&self) -> Result<StreamInfo, QueueError>;
}
