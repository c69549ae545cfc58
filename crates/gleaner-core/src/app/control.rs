//! ControlState - watermark と last generation の永続化
//!
//! どちらも control collection の単一レコードとして DocumentStore に置きます。
//!
//! # キー
//! - `watermark_{group}_{keyword}` → `{group, keyword, watermark_timestamp, updated_at}`
//! - `last_generation_{mode}` → `{mode, last_generation, updated_at}`
//!
//! # 設計原則
//! - watermark はクロール方向にしか動かさない（historical は過去へ、incremental は未来へ）。
//!   `enforce_monotonic` が有効なら読んでから比較して書く。無効なら上書き
//! - 読み取り時に壊れたレコードは `StoreError::MalformedRecord`。黙って None にしない

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::ControlConfig;
use crate::domain::{CrawlMode, GroupKey, StoreError};
use crate::ports::{Clock, DocumentStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkRecord {
    pub group: String,
    pub keyword: String,
    pub watermark_timestamp: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastGenerationRecord {
    pub mode: CrawlMode,
    pub last_generation: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a watermark write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkWrite {
    Written,
    /// The candidate did not move in the crawl direction; the stored value stays.
    Kept { current: DateTime<Utc> },
}

pub fn watermark_key(key: &GroupKey) -> String {
    format!("watermark_{}_{}", key.group, key.keyword)
}

pub fn last_generation_key(mode: CrawlMode) -> String {
    format!("last_generation_{}", mode.as_str())
}

/// Whether `candidate` moves `current` in the crawl direction of `mode`.
pub fn moves_forward(mode: CrawlMode, current: DateTime<Utc>, candidate: DateTime<Utc>) -> bool {
    match mode {
        CrawlMode::Historical => candidate < current,
        CrawlMode::Incremental => candidate > current,
    }
}

#[derive(Clone)]
pub struct ControlState {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: ControlConfig,
}

impl ControlState {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, config: ControlConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    async fn read<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.store.get(&self.config.collection, id).await? else {
            return Ok(None);
        };
        serde_json::from_value(raw)
            .map(Some)
            .map_err(|e| StoreError::MalformedRecord {
                key: id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn write<T: Serialize>(&self, id: &str, record: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(record).map_err(|e| StoreError::MalformedRecord {
            key: id.to_string(),
            reason: e.to_string(),
        })?;
        self.store.put(&self.config.collection, id, value).await
    }

    pub async fn watermark(&self, key: &GroupKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        let record: Option<WatermarkRecord> = self.read(&watermark_key(key)).await?;
        Ok(record.map(|r| r.watermark_timestamp))
    }

    /// Persists `candidate` as the watermark of `key`.
    pub async fn advance_watermark(
        &self,
        key: &GroupKey,
        mode: CrawlMode,
        candidate: DateTime<Utc>,
    ) -> Result<WatermarkWrite, StoreError> {
        let id = watermark_key(key);
        if self.config.enforce_monotonic
            && let Some(current) = self.watermark(key).await?
            && !moves_forward(mode, current, candidate)
        {
            warn!(
                group = %key.group,
                keyword = %key.keyword,
                %current,
                %candidate,
                mode = %mode,
                "watermark write would move against the crawl direction; keeping current"
            );
            return Ok(WatermarkWrite::Kept { current });
        }

        let record = WatermarkRecord {
            group: key.group.clone(),
            keyword: key.keyword.clone(),
            watermark_timestamp: candidate,
            updated_at: self.clock.now(),
        };
        self.write(&id, &record).await?;
        debug!(group = %key.group, keyword = %key.keyword, watermark = %candidate, "watermark updated");
        Ok(WatermarkWrite::Written)
    }

    pub async fn last_generation(&self, mode: CrawlMode) -> Result<Option<DateTime<Utc>>, StoreError> {
        let record: Option<LastGenerationRecord> = self.read(&last_generation_key(mode)).await?;
        Ok(record.map(|r| r.last_generation))
    }

    pub async fn set_last_generation(
        &self,
        mode: CrawlMode,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let record = LastGenerationRecord {
            mode,
            last_generation: at,
            updated_at: self.clock.now(),
        };
        self.write(&last_generation_key(mode), &record).await?;
        info!(mode = %mode, last_generation = %at, "last generation updated");
        Ok(())
    }

    /// Forgets the generation cursor so the next cycle is a first run.
    pub async fn reset(&self, mode: CrawlMode) -> Result<bool, StoreError> {
        let existed = self
            .store
            .delete(&self.config.collection, &last_generation_key(mode))
            .await?;
        info!(mode = %mode, existed, "generation cursor reset");
        Ok(existed)
    }
}
