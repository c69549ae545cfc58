//! DocumentStore port - 収集結果と制御状態の保存先
//!
//! # 設計原則
//! - 収集結果の書き込みは必ず create-if-absent（replay しても重複しない）
//! - 存在確認は collection ごとに 1 往復の batch
//! - 制御状態（watermark, last generation）は単一レコードの get/put

use std::collections::HashSet;

use async_trait::async_trait;

use crate::domain::{BulkWriteSummary, IndexAction, StoreError};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Ids among `ids` that already exist in `collection`.
    async fn exists_batch(&self, collection: &str, ids: &[String])
    -> Result<HashSet<String>, StoreError>;

    /// Create-only bulk write.
    ///
    /// Per-action failures are reported in the summary; `Err` means the batch
    /// could not be sent at all.
    async fn bulk_create(&self, actions: &[IndexAction]) -> Result<BulkWriteSummary, StoreError>;

    async fn get(&self, collection: &str, id: &str)
    -> Result<Option<serde_json::Value>, StoreError>;

    /// Unconditional overwrite of a single record.
    async fn put(
        &self,
        collection: &str,
        id: &str,
        document: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Returns whether the record existed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;
}
