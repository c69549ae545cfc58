//! HarvestController - 1 回の起動で最大 N タスクを順番に処理
//!
//! # 設計原則
//! - 先に group 内の放置された配送（idle ≥ reclaim 閾値）を claim し、それから新規を consume
//! - 成功したタスクだけ ack。失敗したら残りは次回に回してバッチを止める
//!   （レート制限の連鎖を避ける）
//! - decode できないペイロードは二度と成功しないので ack し、失敗として報告する。
//!   バッチは止めない
//! - キューのエラーはそこでバッチを打ち切り、`error` ステータスで返す

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::app::worker::HarvestWorker;
use crate::config::{ControllerConfig, HarvestConfig};
use crate::domain::{BatchReport, QueueError, RunId, TaskReport};
use crate::ports::{Clock, Delivery, IdGenerator, WorkQueue};

/// Pending rows inspected when looking for abandoned deliveries.
const RECLAIM_SCAN: usize = 10;

pub struct HarvestController {
    queue: Arc<dyn WorkQueue>,
    worker: HarvestWorker,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    group: String,
    reclaim_idle: Duration,
    config: ControllerConfig,
}

impl HarvestController {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        worker: HarvestWorker,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: &HarvestConfig,
    ) -> Self {
        Self {
            queue,
            worker,
            clock,
            ids,
            group: config.queue.consumer_group.clone(),
            reclaim_idle: config.queue.reclaim_idle(),
            config: config.controller.clone(),
        }
    }

    fn consumer_name(&self, run_id: RunId) -> String {
        match &self.config.consumer_name {
            Some(name) => name.clone(),
            None => format!("{}-{}", self.config.consumer_prefix, run_id),
        }
    }

    pub async fn run_batch(&self) -> BatchReport {
        let run_id = self.ids.generate_run_id();
        let consumer = self.consumer_name(run_id);
        info!(%run_id, %consumer, max_tasks = self.config.max_tasks, "harvest batch started");

        let mut results = Vec::new();
        let interrupted = self
            .drain(&consumer, &mut results)
            .await
            .err()
            .map(|e| {
                error!(%run_id, %consumer, error = %e, "queue error; batch cut short");
                e.to_string()
            });

        let report = BatchReport::from_results(
            run_id,
            consumer,
            results,
            interrupted,
            self.clock.now(),
        );
        info!(
            %run_id,
            status = ?report.status,
            processed = report.tasks_processed,
            successful = report.successful_tasks,
            failed = report.failed_tasks,
            "harvest batch finished"
        );
        report
    }

    async fn drain(&self, consumer: &str, results: &mut Vec<TaskReport>) -> Result<(), QueueError> {
        self.queue.ensure_group(&self.group).await?;
        let mut reclaimed = self.reclaim(consumer).await?;

        while results.len() < self.config.max_tasks {
            let delivery = match reclaimed.pop_front() {
                Some(delivery) => delivery,
                None => {
                    let mut fresh = self
                        .queue
                        .consume(&self.group, consumer, 1, self.config.block())
                        .await?;
                    match fresh.pop() {
                        Some(delivery) => delivery,
                        None => break,
                    }
                }
            };

            let message_id = delivery.message_id;
            let task = match delivery.envelope.decode_task() {
                Ok(task) => task,
                Err(e) => {
                    error!(
                        %message_id,
                        %consumer,
                        payload = %delivery.envelope.task_data,
                        error = %e,
                        "malformed payload; acknowledging and skipping"
                    );
                    self.queue.ack(&self.group, message_id).await?;
                    results.push(TaskReport::malformed(message_id, e.to_string(), self.clock.now()));
                    continue;
                }
            };

            match self.worker.process(&task).await {
                Ok(report) => {
                    self.queue.ack(&self.group, message_id).await?;
                    results.push(report.with_message_id(message_id));
                }
                Err(e) => {
                    warn!(
                        task_id = %task.task_id,
                        %message_id,
                        %consumer,
                        group = %task.group,
                        keyword = %task.keyword,
                        delivery_count = delivery.delivery_count,
                        error = %e,
                        "task failed; leaving unacknowledged and stopping the batch"
                    );
                    results.push(
                        TaskReport::failure(&task, e.kind(), e.to_string(), self.clock.now())
                            .with_message_id(message_id),
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    /// Takes over deliveries abandoned by crashed or timed-out consumers.
    async fn reclaim(&self, consumer: &str) -> Result<VecDeque<Delivery>, QueueError> {
        let scan = RECLAIM_SCAN.max(self.config.max_tasks);
        let stale: Vec<_> = self
            .queue
            .pending_range(&self.group, scan)
            .await?
            .into_iter()
            .filter(|p| p.idle >= self.reclaim_idle && p.consumer != consumer)
            .take(self.config.max_tasks)
            .map(|p| p.message_id)
            .collect();
        if stale.is_empty() {
            return Ok(VecDeque::new());
        }

        let claimed = self
            .queue
            .claim(&self.group, consumer, self.reclaim_idle, &stale)
            .await?;
        if !claimed.is_empty() {
            info!(%consumer, claimed = claimed.len(), "reclaimed abandoned deliveries");
        }
        Ok(claimed.into())
    }
}
