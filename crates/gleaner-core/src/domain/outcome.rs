//! Outcome model: structured results returned by every invocation.
//!
//! A worker run produces one `TaskReport`; a controller trigger aggregates
//! them into a `BatchReport`. Both serialize to the JSON shape operators see.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ErrorKind;
use super::ids::{MessageId, RunId};
use super::task::{CrawlMode, HarvestTask};
use super::window::TimeWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Error,
}

/// Result of processing one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub status: TaskStatus,
    /// Raw id string; malformed payloads may not carry a parseable one.
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub mode: CrawlMode,
    #[serde(default)]
    pub posts_processed: usize,
    #[serde(default)]
    pub comments_processed: usize,
    #[serde(default)]
    pub duplicates_skipped: usize,
    #[serde(default)]
    pub write_failures: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_watermark: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub completed_at: DateTime<Utc>,
}

impl TaskReport {
    pub fn success(task: &HarvestTask, window: TimeWindow, completed_at: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Success,
            task_id: task.task_id.to_string(),
            message_id: None,
            group: task.group.clone(),
            keyword: task.keyword.clone(),
            mode: task.mode,
            posts_processed: 0,
            comments_processed: 0,
            duplicates_skipped: 0,
            write_failures: 0,
            time_window: Some(window),
            new_watermark: None,
            error: None,
            error_kind: None,
            completed_at,
        }
    }

    pub fn failure(
        task: &HarvestTask,
        kind: ErrorKind,
        error: impl Into<String>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: TaskStatus::Error,
            time_window: None,
            error: Some(error.into()),
            error_kind: Some(kind),
            ..Self::success(task, task.window(), completed_at)
        }
    }

    /// A delivery whose payload never decoded into a task.
    pub fn malformed(
        message_id: MessageId,
        error: impl Into<String>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: TaskStatus::Error,
            task_id: String::new(),
            message_id: Some(message_id),
            group: String::new(),
            keyword: String::new(),
            mode: CrawlMode::default(),
            posts_processed: 0,
            comments_processed: 0,
            duplicates_skipped: 0,
            write_failures: 0,
            time_window: None,
            new_watermark: None,
            error: Some(error.into()),
            error_kind: Some(ErrorKind::Malformed),
            completed_at,
        }
    }

    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    NoTasks,
    BatchSuccess,
    Error,
}

/// Aggregate of one controller trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub status: BatchStatus,
    pub run_id: RunId,
    pub consumer: String,
    pub tasks_processed: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub results: Vec<TaskReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl BatchReport {
    /// Builds the aggregate from per-task results.
    ///
    /// `interrupted` carries a queue error that cut the batch short; the
    /// results gathered so far are kept.
    pub fn from_results(
        run_id: RunId,
        consumer: impl Into<String>,
        results: Vec<TaskReport>,
        interrupted: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let successful_tasks = results.iter().filter(|r| r.is_success()).count();
        let tasks_processed = results.len();
        let status = match (&interrupted, tasks_processed) {
            (Some(_), _) => BatchStatus::Error,
            (None, 0) => BatchStatus::NoTasks,
            (None, _) => BatchStatus::BatchSuccess,
        };
        let message = interrupted.or_else(|| {
            (status == BatchStatus::NoTasks).then(|| "No tasks available".to_string())
        });
        Self {
            status,
            run_id,
            consumer: consumer.into(),
            tasks_processed,
            successful_tasks,
            failed_tasks: tasks_processed - successful_tasks,
            results,
            message,
            timestamp,
        }
    }
}
