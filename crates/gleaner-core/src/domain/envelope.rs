//! QueueEnvelope - キューエントリのペイロード
//!
//! エントリは `task_data` という 1 フィールドだけを持ち、そこにシリアライズ済みの
//! タスクが入ります。配送メタデータ（message id, consumer, idle time,
//! delivery count）はキュー側が割り当てるので含めません。

use serde::{Deserialize, Serialize};

use super::errors::TaskDecodeError;
use super::task::HarvestTask;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEnvelope {
    pub task_data: String,
}

impl QueueEnvelope {
    pub fn new(task_data: impl Into<String>) -> Self {
        Self {
            task_data: task_data.into(),
        }
    }

    pub fn from_task(task: &HarvestTask) -> Result<Self, serde_json::Error> {
        Ok(Self::new(task.encode()?))
    }

    pub fn decode_task(&self) -> Result<HarvestTask, TaskDecodeError> {
        HarvestTask::decode(&self.task_data)
    }
}
