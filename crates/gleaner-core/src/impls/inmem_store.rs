//! In-memory document store (開発・テスト用)
//!
//! collection ごとの BTreeMap。create は既存 ID に対して `Duplicate` を返し、
//! 上書きしません。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::domain::{BulkWriteSummary, IndexAction, StoreError, WriteStatus};
use crate::ports::DocumentStore;

#[derive(Debug, Default)]
struct StoreState {
    collections: HashMap<String, BTreeMap<String, Value>>,
    /// Ids whose create is refused with a per-action failure.
    rejected: HashSet<String>,
    outage: Option<String>,
}

impl StoreState {
    fn check_available(&self) -> Result<(), StoreError> {
        match &self.outage {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later create of `id` fail (mapping error, document too large, ...).
    pub async fn reject_writes_to(&self, id: &str) {
        self.state.lock().await.rejected.insert(id.to_string());
    }

    pub async fn accept_writes_to(&self, id: &str) {
        self.state.lock().await.rejected.remove(id);
    }

    pub async fn set_outage(&self, reason: Option<&str>) {
        self.state.lock().await.outage = reason.map(str::to_string);
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.state
            .lock()
            .await
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Ids stored in `collection`, sorted.
    pub async fn ids(&self, collection: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .collections
            .get(collection)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn exists_batch(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        let Some(docs) = state.collections.get(collection) else {
            return Ok(HashSet::new());
        };
        Ok(ids
            .iter()
            .filter(|id| docs.contains_key(id.as_str()))
            .cloned()
            .collect())
    }

    async fn bulk_create(&self, actions: &[IndexAction]) -> Result<BulkWriteSummary, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let mut summary = BulkWriteSummary::default();
        for action in actions {
            if state.rejected.contains(&action.id) {
                summary.push(
                    &action.collection,
                    &action.id,
                    WriteStatus::Failed("document rejected by store".to_string()),
                );
                continue;
            }
            let docs = state
                .collections
                .entry(action.collection.clone())
                .or_default();
            let status = if docs.contains_key(&action.id) {
                WriteStatus::Duplicate
            } else {
                docs.insert(action.id.clone(), action.body.clone());
                WriteStatus::Created
            };
            summary.push(&action.collection, &action.id, status);
        }
        Ok(summary)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn put(&self, collection: &str, id: &str, document: Value) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        Ok(state
            .collections
            .get_mut(collection)
            .is_some_and(|docs| docs.remove(id).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(id: &str) -> IndexAction {
        IndexAction {
            collection: "posts".into(),
            id: id.into(),
            body: json!({ "post_id": id }),
        }
    }

    #[tokio::test]
    async fn create_does_not_overwrite() {
        let store = InMemoryDocumentStore::new();
        let first = store.bulk_create(&[action("p1")]).await.unwrap();
        assert_eq!(first.created_in("posts"), 1);

        let mut changed = action("p1");
        changed.body = json!({ "post_id": "p1", "edited": true });
        let second = store.bulk_create(&[changed]).await.unwrap();
        assert_eq!(second.duplicates_in("posts"), 1);

        let doc = store.get("posts", "p1").await.unwrap().unwrap();
        assert_eq!(doc, json!({ "post_id": "p1" }));
    }

    #[tokio::test]
    async fn rejected_ids_fail_individually() {
        let store = InMemoryDocumentStore::new();
        store.reject_writes_to("bad").await;
        let summary = store
            .bulk_create(&[action("good"), action("bad")])
            .await
            .unwrap();
        assert_eq!(summary.created_in("posts"), 1);
        assert_eq!(summary.failure_count(), 1);
        assert_eq!(store.ids("posts").await, vec!["good".to_string()]);

        store.accept_writes_to("bad").await;
        let retried = store.bulk_create(&[action("bad")]).await.unwrap();
        assert_eq!(retried.created_in("posts"), 1);
    }

    #[tokio::test]
    async fn exists_batch_reports_only_known_ids() {
        let store = InMemoryDocumentStore::new();
        store.bulk_create(&[action("p1")]).await.unwrap();
        let found = store
            .exists_batch("posts", &["p1".to_string(), "p2".to_string()])
            .await
            .unwrap();
        assert_eq!(found, HashSet::from(["p1".to_string()]));
        assert!(store
            .exists_batch("comments", &["p1".to_string()])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn put_overwrites_and_delete_reports_presence() {
        let store = InMemoryDocumentStore::new();
        store.put("control", "k", json!(1)).await.unwrap();
        store.put("control", "k", json!(2)).await.unwrap();
        assert_eq!(store.get("control", "k").await.unwrap(), Some(json!(2)));
        assert!(store.delete("control", "k").await.unwrap());
        assert!(!store.delete("control", "k").await.unwrap());
    }

    #[tokio::test]
    async fn outage_is_unavailable() {
        let store = InMemoryDocumentStore::new();
        store.set_outage(Some("cluster red")).await;
        assert!(matches!(
            store.get("control", "k").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
