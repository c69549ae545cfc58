//! IndexAction - create-if-absent な書き込み
//!
//! ドキュメント ID は取得元アイテムの ID そのもの。同じアイテムを何度書いても
//! create セマンティクスにより 2 件目以降は conflict として無視されます。

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::item::CandidateItem;
use super::task::HarvestTask;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexAction {
    pub collection: String,
    pub id: String,
    pub body: serde_json::Value,
}

impl IndexAction {
    pub fn post(collection: &str, item: &CandidateItem, task: &HarvestTask) -> Self {
        Self {
            collection: collection.to_string(),
            id: item.id.clone(),
            body: json!({
                "post_id": item.id,
                "author": item.author_or_deleted(),
                "content": item.content(),
                "created_at": item.created_at.to_rfc3339(),
                "tags": [task.group, task.keyword],
                "group": task.group,
                "keyword": task.keyword,
                "score": item.score,
                "task_id": task.task_id.to_string(),
                "collection_mode": task.mode.as_str(),
            }),
        }
    }

    pub fn reply(collection: &str, item: &CandidateItem, post_id: &str, task: &HarvestTask) -> Self {
        Self {
            collection: collection.to_string(),
            id: item.id.clone(),
            body: json!({
                "comment_id": item.id,
                "post_id": post_id,
                "author": item.author_or_deleted(),
                "content": item.content(),
                "created_at": item.created_at.to_rfc3339(),
                "collection_mode": task.mode.as_str(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum WriteStatus {
    Created,
    /// Create conflict: the document was already there. Expected on replays.
    Duplicate,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub collection: String,
    pub id: String,
    pub status: WriteStatus,
}

/// Per-action results of one or more `bulk_create` calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkWriteSummary {
    pub results: Vec<WriteResult>,
}

impl BulkWriteSummary {
    pub fn push(&mut self, collection: &str, id: &str, status: WriteStatus) {
        self.results.push(WriteResult {
            collection: collection.to_string(),
            id: id.to_string(),
            status,
        });
    }

    pub fn merge(&mut self, other: BulkWriteSummary) {
        self.results.extend(other.results);
    }

    /// Fails every action of a batch that could not be sent at all.
    pub fn all_failed(actions: &[IndexAction], reason: &str) -> Self {
        let mut summary = Self::default();
        for action in actions {
            summary.push(&action.collection, &action.id, WriteStatus::Failed(reason.to_string()));
        }
        summary
    }

    pub fn created_in(&self, collection: &str) -> usize {
        self.count(collection, |s| matches!(s, WriteStatus::Created))
    }

    pub fn duplicates_in(&self, collection: &str) -> usize {
        self.count(collection, |s| matches!(s, WriteStatus::Duplicate))
    }

    pub fn failure_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.status, WriteStatus::Failed(_)))
            .count()
    }

    pub fn status_of(&self, collection: &str, id: &str) -> Option<&WriteStatus> {
        self.results
            .iter()
            .find(|r| r.collection == collection && r.id == id)
            .map(|r| &r.status)
    }

    fn count(&self, collection: &str, pred: impl Fn(&WriteStatus) -> bool) -> usize {
        self.results
            .iter()
            .filter(|r| r.collection == collection && pred(&r.status))
            .count()
    }
}
