//! Backpressure - キューの健全性チェックと trim
//!
//! 生成の可否はストリーム長ではなく「まだ処理されていない量」で決めます。
//!
//! # 判定
//! - effective queue size = pending + lag（全 consumer group の合計）
//! - pending > `max_pending` または effective > `max_effective_queue` なら生成しない
//!
//! # trim
//! - housekeeping: sweep の前に段階的に trim（既定 200 超 → 50、100 超 → 30）
//! - emergency: 生成の後、長さが上限（既定 300）を超えていれば生成判定と無関係に trim

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BackpressureConfig;
use crate::domain::QueueError;
use crate::ports::{StreamInfo, WorkQueue};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHealth {
    pub stream_length: usize,
    pub pending_tasks: usize,
    pub lag: usize,
    pub effective_queue_size: usize,
}

impl QueueHealth {
    pub fn from_info(info: &StreamInfo) -> Self {
        let pending_tasks: usize = info.groups.iter().map(|g| g.pending).sum();
        let lag: usize = info.groups.iter().map(|g| g.lag).sum();
        Self {
            stream_length: info.length,
            pending_tasks,
            lag,
            effective_queue_size: pending_tasks + lag,
        }
    }
}

/// Generation gate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum Gate {
    Open,
    TooManyPending { pending: usize, limit: usize },
    QueueBacklogged { effective: usize, limit: usize },
}

impl Gate {
    pub fn is_open(&self) -> bool {
        matches!(self, Gate::Open)
    }
}

pub fn gate(health: &QueueHealth, config: &BackpressureConfig) -> Gate {
    if health.pending_tasks > config.max_pending {
        Gate::TooManyPending {
            pending: health.pending_tasks,
            limit: config.max_pending,
        }
    } else if health.effective_queue_size > config.max_effective_queue {
        Gate::QueueBacklogged {
            effective: health.effective_queue_size,
            limit: config.max_effective_queue,
        }
    } else {
        Gate::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimReport {
    pub length_before: usize,
    pub max_len: usize,
    pub removed: usize,
}

pub struct Backpressure {
    queue: Arc<dyn WorkQueue>,
    config: BackpressureConfig,
}

impl Backpressure {
    pub fn new(queue: Arc<dyn WorkQueue>, config: BackpressureConfig) -> Self {
        Self { queue, config }
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    pub async fn inspect(&self) -> Result<QueueHealth, QueueError> {
        Ok(QueueHealth::from_info(&self.queue.info().await?))
    }

    pub fn gate(&self, health: &QueueHealth) -> Gate {
        gate(health, &self.config)
    }

    /// Tiered trim run before the retry sweep.
    pub async fn housekeeping(&self) -> Result<Option<TrimReport>, QueueError> {
        let length = self.queue.info().await?.length;
        let Some(tier) = self.config.housekeeping.iter().find(|t| length > t.above) else {
            return Ok(None);
        };
        let removed = self.queue.trim(tier.keep).await?;
        info!(length, keep = tier.keep, removed, "housekeeping trim");
        Ok(Some(TrimReport {
            length_before: length,
            max_len: tier.keep,
            removed,
        }))
    }

    /// Hard ceiling on the raw stream length, independent of the gate.
    pub async fn emergency_trim(&self) -> Result<Option<TrimReport>, QueueError> {
        let length = self.queue.info().await?.length;
        if length <= self.config.emergency_ceiling {
            return Ok(None);
        }
        let removed = self.queue.trim(self.config.emergency_keep).await?;
        warn!(
            length,
            ceiling = self.config.emergency_ceiling,
            keep = self.config.emergency_keep,
            removed,
            "emergency trim"
        );
        Ok(Some(TrimReport {
            length_before: length,
            max_len: self.config.emergency_keep,
            removed,
        }))
    }
}
