//! Errors - エラー型と分類
//!
//! 境界（キュー / ドキュメントストア / コンテンツソース / タスク記述子）ごとに
//! エラー型を分け、すべて `ErrorKind` で運用分類できるようにします。
//!
//! # 分類
//! - Transient: 一時的なエラー（バックオフしてリトライ）
//! - Permanent: 恒久的なエラー（リトライ無意味）
//! - Infrastructure: キュー・ストアの障害（サイクルごと中断、状態は変更しない）
//! - Malformed: ペイロードが型付きレコードとして解釈できない

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
    Malformed,
}

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("consumer group {0:?} does not exist")]
    NoSuchGroup(String),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Infrastructure
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed control record {key}: {reason}")]
    MalformedRecord { key: String, reason: String },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Unavailable(_) => ErrorKind::Infrastructure,
            StoreError::MalformedRecord { .. } => ErrorKind::Malformed,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("rate limited by content source, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("transient content source error: {0}")]
    Transient(String),

    #[error("content source rejected the request: {0}")]
    Permanent(String),
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::RateLimited { .. } | SourceError::Transient(_) => ErrorKind::Transient,
            SourceError::Permanent(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// A queue payload that does not decode into a valid harvest task.
#[derive(Debug, Error)]
pub enum TaskDecodeError {
    #[error("task payload is not a valid task descriptor: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid task {task_id}: {reason}")]
    Invalid { task_id: String, reason: String },
}

impl TaskDecodeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Malformed
    }
}

/// Failure of one harvest task. The delivery stays unacknowledged.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("content source still failing after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: SourceError },
}

impl HarvestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarvestError::Source(e) => e.kind(),
            HarvestError::Store(e) => e.kind(),
            HarvestError::RetriesExhausted { .. } => ErrorKind::Transient,
        }
    }
}

/// Aborts a generation cycle. Nothing persisted is mutated when this is returned.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode task {task_id}: {source}")]
    Encode {
        task_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl GenerateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerateError::Queue(e) => e.kind(),
            GenerateError::Store(e) => e.kind(),
            GenerateError::Encode { .. } => ErrorKind::Malformed,
        }
    }
}
