//! HarvestTask - キューを流れるタスク記述子
//!
//! 1 タスク = 1 つの group key（source-group, keyword）× 1 つの時間窓。
//! `retry_count` / `requeued_at` 以外は生成後に変更しません。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::TaskDecodeError;
use super::ids::TaskId;
use super::window::TimeWindow;

/// Crawl direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlMode {
    /// Forward from "last seen" towards now.
    #[default]
    Incremental,
    /// Backward from a recent point towards an origin.
    Historical,
}

impl CrawlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlMode::Incremental => "incremental",
            CrawlMode::Historical => "historical",
        }
    }

    pub fn is_incremental(&self) -> bool {
        matches!(self, CrawlMode::Incremental)
    }
}

impl fmt::Display for CrawlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority, 1 (highest) to 3 (lowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGH: Priority = Priority(1);
    pub const MEDIUM: Priority = Priority(2);
    pub const LOW: Priority = Priority(3);

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1..=3 => Ok(Priority(value)),
            other => Err(format!("priority must be within 1..=3, got {other}")),
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

/// The unit of independent progress tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub group: String,
    pub keyword: String,
}

impl GroupKey {
    pub fn new(group: impl Into<String>, keyword: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            keyword: keyword.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.keyword)
    }
}

fn default_max_retries() -> u32 {
    3
}

/// Serialized task record carried by one queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestTask {
    pub task_id: TaskId,
    pub group: String,
    pub keyword: String,
    pub max_items: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub priority: Priority,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Absent on the wire for incremental tasks.
    #[serde(default, skip_serializing_if = "CrawlMode::is_incremental")]
    pub mode: CrawlMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeued_at: Option<DateTime<Utc>>,
}

impl HarvestTask {
    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(self.group.clone(), self.keyword.clone())
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.start_time, self.end_time)
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// The copy that gets re-appended by the retry sweep.
    pub fn next_retry(&self, now: DateTime<Utc>) -> HarvestTask {
        HarvestTask {
            retry_count: self.retry_count + 1,
            requeued_at: Some(now),
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses and validates a payload taken off the queue.
    pub fn decode(payload: &str) -> Result<HarvestTask, TaskDecodeError> {
        let task: HarvestTask = serde_json::from_str(payload)?;
        task.validate()?;
        Ok(task)
    }

    pub fn validate(&self) -> Result<(), TaskDecodeError> {
        let invalid = |reason: &str| TaskDecodeError::Invalid {
            task_id: self.task_id.to_string(),
            reason: reason.to_string(),
        };
        if self.group.trim().is_empty() {
            return Err(invalid("group is empty"));
        }
        if self.keyword.trim().is_empty() {
            return Err(invalid("keyword is empty"));
        }
        if self.max_items == 0 {
            return Err(invalid("max_items must be positive"));
        }
        if self.end_time <= self.start_time {
            return Err(invalid("end_time must be after start_time"));
        }
        Ok(())
    }
}
