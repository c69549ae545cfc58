//! RetrySweeper - 長時間 pending のままの配送を再投入
//!
//! # フロー
//! 1. group の pending list を古い順に最大 `sweep_count` 件見る
//! 2. エントリを読み、タスクとして decode
//! 3. RetryDecider で判定
//! 4. Requeue なら ack してから `retry_count + 1` のコピーを append
//!    （同じタスクの生きたコピーは常に 1 つ）
//!
//! リトライ上限を超えたものは pending のまま残し、error ログで知らせます。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::domain::{
    HarvestTask, MessageId, QueueEnvelope, QueueError, RetryDecider, SweepDecision, TaskId,
};
use crate::ports::{Clock, WorkQueue};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub inspected: usize,
    pub fresh: usize,
    pub requeued: Vec<TaskId>,
    pub stuck: Vec<TaskId>,
    /// Pending ids whose entry was already trimmed away.
    pub orphaned: usize,
    /// Pending entries whose payload is not a valid task.
    pub malformed: usize,
}

pub struct RetrySweeper {
    queue: Arc<dyn WorkQueue>,
    clock: Arc<dyn Clock>,
    decider: Arc<dyn RetryDecider>,
    group: String,
    sweep_count: usize,
}

impl RetrySweeper {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        clock: Arc<dyn Clock>,
        decider: Arc<dyn RetryDecider>,
        group: impl Into<String>,
        sweep_count: usize,
    ) -> Self {
        Self {
            queue,
            clock,
            decider,
            group: group.into(),
            sweep_count,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, QueueError> {
        let mut report = SweepReport::default();
        let pending = self.queue.pending_range(&self.group, self.sweep_count).await?;

        for entry in pending {
            report.inspected += 1;
            let message_id = entry.message_id;

            let Some(envelope) = self.queue.read(message_id).await? else {
                warn!(%message_id, consumer = %entry.consumer, "pending entry no longer in stream; acking");
                self.queue.ack(&self.group, message_id).await?;
                report.orphaned += 1;
                continue;
            };

            let task = match envelope.decode_task() {
                Ok(task) => task,
                Err(e) => {
                    error!(%message_id, payload = %envelope.task_data, error = %e, "malformed payload in pending list; acking");
                    self.queue.ack(&self.group, message_id).await?;
                    report.malformed += 1;
                    continue;
                }
            };

            match self.decider.decide(entry.idle, &task) {
                SweepDecision::Fresh => {
                    report.fresh += 1;
                }
                SweepDecision::Stuck {
                    retry_count,
                    max_retries,
                } => {
                    error!(
                        task_id = %task.task_id,
                        %message_id,
                        group = %task.group,
                        keyword = %task.keyword,
                        retry_count,
                        max_retries,
                        idle_secs = entry.idle.as_secs(),
                        "task exceeded max retries; left pending for operator attention"
                    );
                    report.stuck.push(task.task_id.clone());
                }
                SweepDecision::Requeue { next_retry_count } => {
                    let retry = task.next_retry(self.clock.now());
                    debug_assert_eq!(retry.retry_count, next_retry_count);
                    self.requeue(message_id, entry.idle, &retry).await?;
                    report.requeued.push(task.task_id.clone());
                }
            }
        }

        if !report.requeued.is_empty() || !report.stuck.is_empty() {
            info!(
                inspected = report.inspected,
                requeued = report.requeued.len(),
                stuck = report.stuck.len(),
                "retry sweep finished"
            );
        }
        Ok(report)
    }

    async fn requeue(
        &self,
        message_id: MessageId,
        idle: Duration,
        retry: &HarvestTask,
    ) -> Result<(), QueueError> {
        let payload = match QueueEnvelope::from_task(retry) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(task_id = %retry.task_id, error = %e, "failed to encode retry copy; leaving delivery pending");
                return Ok(());
            }
        };

        self.queue.ack(&self.group, message_id).await?;
        match self.queue.append(payload.clone()).await {
            Ok(new_id) => {
                warn!(
                    task_id = %retry.task_id,
                    old_message_id = %message_id,
                    new_message_id = %new_id,
                    retry_count = retry.retry_count,
                    idle_secs = idle.as_secs(),
                    "requeued stale task"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    task_id = %retry.task_id,
                    payload = %payload.task_data,
                    error = %e,
                    "acked stale delivery but re-append failed"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CrawlMode, DefaultRetryDecider, Priority};
    use crate::impls::InMemoryWorkQueue;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    const GROUP: &str = "harvesters";

    fn task(retry_count: u32) -> HarvestTask {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        HarvestTask {
            task_id: TaskId::from_ulid(Ulid::new()),
            group: "housing".into(),
            keyword: "rent".into(),
            max_items: 200,
            start_time: t0,
            end_time: t0 + chrono::Duration::days(7),
            created_at: t0,
            priority: Priority::LOW,
            retry_count,
            max_retries: 3,
            mode: CrawlMode::Historical,
            requeued_at: None,
        }
    }

    async fn setup() -> (Arc<FixedClock>, Arc<InMemoryWorkQueue>, RetrySweeper) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ));
        let queue = Arc::new(InMemoryWorkQueue::new(clock.clone()));
        queue.ensure_group(GROUP).await.unwrap();
        let sweeper = RetrySweeper::new(
            queue.clone(),
            clock.clone(),
            Arc::new(DefaultRetryDecider::default()),
            GROUP,
            100,
        );
        (clock, queue, sweeper)
    }

    async fn deliver(queue: &InMemoryWorkQueue, task: &HarvestTask) {
        queue
            .append(QueueEnvelope::from_task(task).unwrap())
            .await
            .unwrap();
        queue
            .consume(GROUP, "crashed-worker", 1, Duration::ZERO)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_delivery_is_acked_and_reappended_once() {
        let (clock, queue, sweeper) = setup().await;
        let original = task(0);
        deliver(&queue, &original).await;

        clock.advance(chrono::Duration::minutes(11));
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.requeued, vec![original.task_id.clone()]);

        let info = queue.info().await.unwrap();
        assert_eq!(info.groups[0].pending, 0);
        assert_eq!(info.groups[0].lag, 1);

        let entries = queue.snapshot().await;
        let retried = entries.last().unwrap().1.decode_task().unwrap();
        assert_eq!(retried.task_id, original.task_id);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.requeued_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn fresh_deliveries_are_left_alone() {
        let (clock, queue, sweeper) = setup().await;
        deliver(&queue, &task(0)).await;

        clock.advance(chrono::Duration::minutes(9));
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.fresh, 1);
        assert!(report.requeued.is_empty());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn exhausted_tasks_stay_pending() {
        let (clock, queue, sweeper) = setup().await;
        let exhausted = task(3);
        deliver(&queue, &exhausted).await;

        clock.advance(chrono::Duration::hours(1));
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.stuck, vec![exhausted.task_id.clone()]);
        assert_eq!(queue.info().await.unwrap().groups[0].pending, 1);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn malformed_and_orphaned_entries_are_cleared() {
        let (clock, queue, sweeper) = setup().await;
        queue.append(QueueEnvelope::new("{not json")).await.unwrap();
        queue.consume(GROUP, "w", 1, Duration::ZERO).await.unwrap();
        deliver(&queue, &task(0)).await;
        queue.trim(1).await.unwrap();
        // 残っているのは 2 件目。1 件目（malformed）は trim 済みで orphan になる

        clock.advance(chrono::Duration::minutes(11));
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.orphaned, 1);
        assert_eq!(report.requeued.len(), 1);
        assert_eq!(report.malformed, 0);
    }

    #[tokio::test]
    async fn malformed_payload_is_acked() {
        let (clock, queue, sweeper) = setup().await;
        queue.append(QueueEnvelope::new("{not json")).await.unwrap();
        queue.consume(GROUP, "w", 1, Duration::ZERO).await.unwrap();

        clock.advance(chrono::Duration::minutes(11));
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.malformed, 1);
        assert_eq!(queue.info().await.unwrap().groups[0].pending, 0);
    }
}
