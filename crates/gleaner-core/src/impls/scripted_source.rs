//! Scripted content source (開発・テスト用)
//!
//! 登録したアイテムをそのまま返します。本物のソースと同じく時間フィルタは
//! 粗く扱い、窓の外のアイテムも返します（絞り込みは worker 側の責務）。
//! 失敗を順番に仕込んでおくと、次の `search` 呼び出しから 1 つずつ消費されます。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{CandidateItem, GroupKey, SourceError};
use crate::ports::{ContentSource, SearchQuery};

#[derive(Debug, Default)]
struct ScriptState {
    items: HashMap<GroupKey, Vec<CandidateItem>>,
    replies: HashMap<String, Vec<CandidateItem>>,
    failing_replies: HashSet<String>,
    search_failures: VecDeque<SourceError>,
    searches: Vec<SearchQuery>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedContentSource {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_items(&self, key: GroupKey, items: impl IntoIterator<Item = CandidateItem>) {
        self.state
            .lock()
            .await
            .items
            .entry(key)
            .or_default()
            .extend(items);
    }

    pub async fn add_replies(
        &self,
        parent_id: &str,
        replies: impl IntoIterator<Item = CandidateItem>,
    ) {
        self.state
            .lock()
            .await
            .replies
            .entry(parent_id.to_string())
            .or_default()
            .extend(replies);
    }

    /// The next `search` call fails with `error` instead of returning items.
    pub async fn fail_next_search(&self, error: SourceError) {
        self.state.lock().await.search_failures.push_back(error);
    }

    /// Every reply fetch for `parent_id` fails.
    pub async fn fail_replies_for(&self, parent_id: &str) {
        self.state
            .lock()
            .await
            .failing_replies
            .insert(parent_id.to_string());
    }

    /// Queries received so far, in order.
    pub async fn searches(&self) -> Vec<SearchQuery> {
        self.state.lock().await.searches.clone()
    }
}

#[async_trait]
impl ContentSource for ScriptedContentSource {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<CandidateItem>, SourceError> {
        let mut state = self.state.lock().await;
        state.searches.push(query.clone());
        if let Some(error) = state.search_failures.pop_front() {
            return Err(error);
        }
        let key = GroupKey::new(query.group.clone(), query.keyword.clone());
        let mut items = state.items.get(&key).cloned().unwrap_or_default();
        // 新しい順（sort=new 相当）
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(query.limit as usize);
        Ok(items)
    }

    async fn replies(
        &self,
        item_id: &str,
        limit: usize,
    ) -> Result<Vec<CandidateItem>, SourceError> {
        let state = self.state.lock().await;
        if state.failing_replies.contains(item_id) {
            return Err(SourceError::Transient(format!(
                "reply listing for {item_id} timed out"
            )));
        }
        let mut replies = state.replies.get(item_id).cloned().unwrap_or_default();
        replies.truncate(limit);
        Ok(replies)
    }
}
