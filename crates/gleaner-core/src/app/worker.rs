//! HarvestWorker - 1 タスクを冪等な書き込みに変換する
//!
//! # フロー
//! 1. watermark を読み、実効窓を決める（空なら成功の no-op）
//! 2. コンテンツソースを検索（一時エラーはバックオフ付きでリトライ）
//! 3. 実効窓の外のアイテムを捨てる（ソースは多めに返すことがある）
//! 4. 既存チェックを collection ごとに 1 往復で行う
//! 5. 新規アイテムの create アクションを作り、返信も取得して追加
//! 6. `flush_batch_size` ずつ書き込む。部分的な失敗は数えてログに出すだけ
//! 7. 新規に書けたアイテムから watermark 候補を決めて保存
//!
//! # watermark の向き
//! - historical: 実効窓 `[start, min(watermark, end))`、候補は書けたものの最古の
//!   created_at（ただし書き込みに失敗した最新のものより新しい範囲で）。
//!   実効窓の end より前なら保存
//! - incremental: 実効窓 `[max(start, watermark), end)`、候補は書けたものの最新の
//!   created_at（ただし失敗した最古のものより古い範囲で）。実効窓の start より後なら保存
//!
//! 失敗したアイテムは必ず次回の実効窓に残ります。
//!
//! ack はここではしません。呼び出し側（controller）が結果を見て決めます。

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::app::control::{ControlState, WatermarkWrite};
use crate::app::retry::RetryPolicy;
use crate::config::WorkerConfig;
use crate::domain::{
    BulkWriteSummary, CandidateItem, CrawlMode, HarvestError, HarvestTask, IndexAction,
    TaskReport, TimeWindow, WriteStatus,
};
use crate::ports::{Clock, ContentSource, DocumentStore, SearchQuery, SortOrder, TimeFilter};

/// The part of the task window not covered by earlier runs.
pub fn effective_window(task: &HarvestTask, watermark: Option<DateTime<Utc>>) -> TimeWindow {
    match (task.mode, watermark) {
        (_, None) => task.window(),
        (CrawlMode::Historical, Some(wm)) => TimeWindow::new(task.start_time, wm.min(task.end_time)),
        (CrawlMode::Incremental, Some(wm)) => {
            TimeWindow::new(task.start_time.max(wm), task.end_time)
        }
    }
}

/// Watermark candidate among written top-level items.
///
/// Every item whose write failed must stay inside the next effective window, so
/// the candidate is taken only from written items beyond the failures in the
/// crawl direction.
fn watermark_candidate(
    mode: CrawlMode,
    written: &[DateTime<Utc>],
    failed: &[DateTime<Utc>],
) -> Option<DateTime<Utc>> {
    match mode {
        CrawlMode::Historical => {
            let newest_failed = failed.iter().max().copied();
            written
                .iter()
                .copied()
                .filter(|t| newest_failed.is_none_or(|f| *t > f))
                .min()
        }
        CrawlMode::Incremental => {
            let oldest_failed = failed.iter().min().copied();
            written
                .iter()
                .copied()
                .filter(|t| oldest_failed.is_none_or(|f| *t < f))
                .max()
        }
    }
}

fn candidate_is_progress(mode: CrawlMode, window: TimeWindow, candidate: DateTime<Utc>) -> bool {
    match mode {
        CrawlMode::Historical => candidate < window.end,
        CrawlMode::Incremental => candidate > window.start,
    }
}

pub struct HarvestWorker {
    source: Arc<dyn ContentSource>,
    store: Arc<dyn DocumentStore>,
    control: ControlState,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    config: WorkerConfig,
}

impl HarvestWorker {
    pub fn new(
        source: Arc<dyn ContentSource>,
        store: Arc<dyn DocumentStore>,
        control: ControlState,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            source,
            store,
            control,
            clock,
            retry: RetryPolicy::from_config(&config),
            config,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn process(&self, task: &HarvestTask) -> Result<TaskReport, HarvestError> {
        let key = task.group_key();
        let watermark = self.control.watermark(&key).await?;
        let window = effective_window(task, watermark);

        if window.is_empty() {
            info!(
                task_id = %task.task_id,
                group = %task.group,
                keyword = %task.keyword,
                ?watermark,
                "effective window is empty; nothing to harvest"
            );
            return Ok(TaskReport::success(task, window, self.clock.now()));
        }
        info!(task_id = %task.task_id, group = %task.group, keyword = %task.keyword, %window, mode = %task.mode, "harvesting");

        let posts = self.fetch_posts(task, window).await?;
        let post_ids: Vec<String> = posts.iter().map(|p| p.id.clone()).collect();
        let existing_posts = self
            .existing(&self.config.posts_collection, &post_ids)
            .await?;
        let new_posts: Vec<&CandidateItem> = posts
            .iter()
            .filter(|p| !existing_posts.contains(&p.id))
            .collect();

        let replies = self.fetch_replies(&new_posts).await;
        let reply_ids: Vec<String> = replies.iter().map(|(_, r)| r.id.clone()).collect();
        let existing_replies = self
            .existing(&self.config.comments_collection, &reply_ids)
            .await?;

        let mut actions = Vec::with_capacity(new_posts.len() + replies.len());
        for post in &new_posts {
            actions.push(IndexAction::post(&self.config.posts_collection, post, task));
        }
        for (post_id, reply) in &replies {
            if !existing_replies.contains(&reply.id) {
                actions.push(IndexAction::reply(
                    &self.config.comments_collection,
                    reply,
                    post_id,
                    task,
                ));
            }
        }

        let summary = self.flush(task, &actions).await;

        let mut report = TaskReport::success(task, window, self.clock.now());
        report.posts_processed = summary.created_in(&self.config.posts_collection);
        report.comments_processed = summary.created_in(&self.config.comments_collection);
        report.duplicates_skipped = existing_posts.len()
            + existing_replies.len()
            + summary.duplicates_in(&self.config.posts_collection)
            + summary.duplicates_in(&self.config.comments_collection);
        report.write_failures = summary.failure_count();

        let (mut written, mut failed) = (Vec::new(), Vec::new());
        for post in &new_posts {
            match summary.status_of(&self.config.posts_collection, &post.id) {
                Some(WriteStatus::Created | WriteStatus::Duplicate) => written.push(post.created_at),
                _ => failed.push(post.created_at),
            }
        }
        if let Some(candidate) = watermark_candidate(task.mode, &written, &failed)
            && candidate_is_progress(task.mode, window, candidate)
        {
            match self.control.advance_watermark(&key, task.mode, candidate).await? {
                WatermarkWrite::Written => report.new_watermark = Some(candidate),
                WatermarkWrite::Kept { .. } => {}
            }
        }

        info!(
            task_id = %task.task_id,
            group = %task.group,
            keyword = %task.keyword,
            posts = report.posts_processed,
            comments = report.comments_processed,
            duplicates = report.duplicates_skipped,
            failures = report.write_failures,
            new_watermark = ?report.new_watermark,
            "task finished"
        );
        Ok(report)
    }

    async fn fetch_posts(
        &self,
        task: &HarvestTask,
        window: TimeWindow,
    ) -> Result<Vec<CandidateItem>, HarvestError> {
        let query = SearchQuery {
            group: task.group.clone(),
            keyword: task.keyword.clone(),
            time_filter: TimeFilter::reaching_back_to(window.start, self.clock.now()),
            limit: task.max_items,
            sort: SortOrder::New,
        };
        let fetched = self
            .retry
            .run("search", || self.source.search(&query))
            .await?;
        let returned = fetched.len();

        let mut seen = HashSet::new();
        let mut posts: Vec<CandidateItem> = fetched
            .into_iter()
            .filter(|item| window.covers(item.created_at))
            .filter(|item| seen.insert(item.id.clone()))
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        debug!(
            task_id = %task.task_id,
            time_filter = %query.time_filter,
            returned,
            in_window = posts.len(),
            "search finished"
        );
        Ok(posts)
    }

    /// Replies of each new post. A post whose replies cannot be fetched is skipped.
    async fn fetch_replies(&self, posts: &[&CandidateItem]) -> Vec<(String, CandidateItem)> {
        let mut replies = Vec::new();
        let mut seen = HashSet::new();
        for post in posts {
            let fetched = self
                .retry
                .run("replies", || {
                    self.source.replies(&post.id, self.config.reply_limit)
                })
                .await;
            match fetched {
                Ok(items) => {
                    for reply in items {
                        if seen.insert(reply.id.clone()) {
                            replies.push((post.id.clone(), reply));
                        }
                    }
                }
                Err(e) => {
                    warn!(post_id = %post.id, error = %e, "failed to fetch replies; skipping them");
                }
            }
        }
        replies
    }

    async fn existing(&self, collection: &str, ids: &[String]) -> Result<HashSet<String>, HarvestError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        Ok(self.store.exists_batch(collection, ids).await?)
    }

    async fn flush(&self, task: &HarvestTask, actions: &[IndexAction]) -> BulkWriteSummary {
        let mut summary = BulkWriteSummary::default();
        for chunk in actions.chunks(self.config.flush_batch_size) {
            match self.store.bulk_create(chunk).await {
                Ok(part) => {
                    let failures = part.failure_count();
                    if failures > 0 {
                        warn!(task_id = %task.task_id, failures, batch = chunk.len(), "partial bulk write failure");
                    }
                    summary.merge(part);
                }
                Err(e) => {
                    warn!(task_id = %task.task_id, batch = chunk.len(), error = %e, "bulk write failed");
                    summary.merge(BulkWriteSummary::all_failed(chunk, &e.to_string()));
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;
    use crate::domain::{GroupKey, Priority, TaskId};
    use crate::impls::{InMemoryDocumentStore, ScriptedContentSource};
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn task(mode: CrawlMode) -> HarvestTask {
        HarvestTask {
            task_id: TaskId::from_ulid(Ulid::new()),
            group: "housing".into(),
            keyword: "rent".into(),
            max_items: 300,
            start_time: day(1),
            end_time: day(8),
            created_at: day(8),
            priority: Priority::MEDIUM,
            retry_count: 0,
            max_retries: 3,
            mode,
            requeued_at: None,
        }
    }

    struct Fixture {
        source: ScriptedContentSource,
        store: InMemoryDocumentStore,
        control: ControlState,
        worker: HarvestWorker,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(day(10)));
        let source = ScriptedContentSource::new();
        let store = InMemoryDocumentStore::new();
        let control = ControlState::new(
            Arc::new(store.clone()),
            clock.clone(),
            ControlConfig::default(),
        );
        let worker = HarvestWorker::new(
            Arc::new(source.clone()),
            Arc::new(store.clone()),
            control.clone(),
            clock,
            WorkerConfig::default(),
        )
        .with_retry_policy(RetryPolicy::immediate(3));
        Fixture {
            source,
            store,
            control,
            worker,
        }
    }

    #[test]
    fn effective_window_follows_the_crawl_direction() {
        let hist = task(CrawlMode::Historical);
        assert_eq!(effective_window(&hist, None), hist.window());
        assert_eq!(
            effective_window(&hist, Some(day(5))),
            TimeWindow::new(day(1), day(5))
        );
        assert!(effective_window(&hist, Some(day(1))).is_empty());

        let inc = task(CrawlMode::Incremental);
        assert_eq!(
            effective_window(&inc, Some(day(5))),
            TimeWindow::new(day(5), day(8))
        );
        assert!(effective_window(&inc, Some(day(9))).is_empty());
    }

    #[tokio::test]
    async fn out_of_window_items_are_dropped() {
        let f = fixture();
        let key = GroupKey::new("housing", "rent");
        f.source
            .add_items(
                key.clone(),
                [
                    CandidateItem::new("inside", day(3)),
                    CandidateItem::new("too-new", day(9)),
                    CandidateItem::new("too-old", day(1) - Duration::hours(1)),
                ],
            )
            .await;

        let report = f.worker.process(&task(CrawlMode::Historical)).await.unwrap();
        assert_eq!(report.posts_processed, 1);
        assert_eq!(f.store.ids("posts").await, vec!["inside".to_string()]);
    }

    #[tokio::test]
    async fn replies_are_written_for_new_posts_only() {
        let f = fixture();
        let key = GroupKey::new("housing", "rent");
        f.source
            .add_items(
                key,
                [
                    CandidateItem::new("old", day(2)),
                    CandidateItem::new("new", day(3)),
                ],
            )
            .await;
        f.source
            .add_replies("old", [CandidateItem::new("c-old", day(2)).reply_to("old")])
            .await;
        f.source
            .add_replies("new", [CandidateItem::new("c-new", day(4)).reply_to("new")])
            .await;
        f.store
            .bulk_create(&[IndexAction {
                collection: "posts".into(),
                id: "old".into(),
                body: serde_json::json!({}),
            }])
            .await
            .unwrap();

        let report = f.worker.process(&task(CrawlMode::Historical)).await.unwrap();
        assert_eq!(report.posts_processed, 1);
        assert_eq!(report.comments_processed, 1);
        assert_eq!(report.duplicates_skipped, 1);
        assert_eq!(f.store.ids("comments").await, vec!["c-new".to_string()]);
    }

    #[tokio::test]
    async fn reply_failures_do_not_fail_the_task() {
        let f = fixture();
        f.source
            .add_items(GroupKey::new("housing", "rent"), [CandidateItem::new("p", day(3))])
            .await;
        f.source.fail_replies_for("p").await;

        let report = f.worker.process(&task(CrawlMode::Historical)).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.posts_processed, 1);
        assert_eq!(report.comments_processed, 0);
    }

    #[tokio::test]
    async fn failed_writes_do_not_feed_the_watermark() {
        let f = fixture();
        f.source
            .add_items(
                GroupKey::new("housing", "rent"),
                [
                    CandidateItem::new("earliest", day(2)),
                    CandidateItem::new("later", day(4)),
                ],
            )
            .await;
        f.store.reject_writes_to("earliest").await;

        let report = f.worker.process(&task(CrawlMode::Historical)).await.unwrap();
        assert_eq!(report.write_failures, 1);
        assert_eq!(report.new_watermark, Some(day(4)));
        assert_eq!(
            f.control
                .watermark(&GroupKey::new("housing", "rent"))
                .await
                .unwrap(),
            Some(day(4))
        );
    }

    #[tokio::test]
    async fn failed_newer_post_keeps_the_watermark_above_it() {
        let f = fixture();
        let key = GroupKey::new("housing", "rent");
        f.source
            .add_items(
                key.clone(),
                [
                    CandidateItem::new("p1", day(2)),
                    CandidateItem::new("p3", day(5)),
                ],
            )
            .await;
        f.store.reject_writes_to("p3").await;

        let report = f.worker.process(&task(CrawlMode::Historical)).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.write_failures, 1);
        assert_eq!(report.new_watermark, None);
        assert_eq!(f.control.watermark(&key).await.unwrap(), None);
    }

    #[test]
    fn candidate_stays_beyond_every_failed_item() {
        let written = [day(2), day(4), day(6)];
        let failed = [day(3)];
        assert_eq!(
            watermark_candidate(CrawlMode::Historical, &written, &failed),
            Some(day(4))
        );
        assert_eq!(
            watermark_candidate(CrawlMode::Incremental, &written, &failed),
            Some(day(2))
        );
        assert_eq!(
            watermark_candidate(CrawlMode::Historical, &[day(2)], &[day(5)]),
            None
        );
        assert_eq!(
            watermark_candidate(CrawlMode::Incremental, &[day(6)], &[day(5)]),
            None
        );
        assert_eq!(
            watermark_candidate(CrawlMode::Historical, &written, &[]),
            Some(day(2))
        );
    }

    #[tokio::test]
    async fn incremental_failure_holds_the_watermark_before_it() {
        let f = fixture();
        let key = GroupKey::new("housing", "rent");
        f.source
            .add_items(
                key.clone(),
                [
                    CandidateItem::new("a", day(2)),
                    CandidateItem::new("b", day(4)),
                    CandidateItem::new("c", day(6)),
                ],
            )
            .await;
        f.store.reject_writes_to("b").await;

        let report = f.worker.process(&task(CrawlMode::Incremental)).await.unwrap();
        assert_eq!(report.write_failures, 1);
        assert_eq!(report.new_watermark, Some(day(2)));
        assert_eq!(f.control.watermark(&key).await.unwrap(), Some(day(2)));
    }

    #[tokio::test]
    async fn incremental_watermark_tracks_the_newest_item() {
        let f = fixture();
        f.source
            .add_items(
                GroupKey::new("housing", "rent"),
                [
                    CandidateItem::new("a", day(2)),
                    CandidateItem::new("b", day(6)),
                ],
            )
            .await;

        let report = f.worker.process(&task(CrawlMode::Incremental)).await.unwrap();
        assert_eq!(report.new_watermark, Some(day(6)));
    }

    #[tokio::test]
    async fn permanent_source_errors_fail_the_task() {
        let f = fixture();
        f.source
            .fail_next_search(crate::domain::SourceError::Permanent("private".into()))
            .await;
        let err = f
            .worker
            .process(&task(CrawlMode::Historical))
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Source(_)));
    }
}
