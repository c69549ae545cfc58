//! TaskGenerator - 時間窓の計算とタスクの投入
//!
//! # 1 サイクルの流れ
//! 1. consumer group を用意（冪等）
//! 2. housekeeping trim
//! 3. retry sweep（長時間 pending の配送を再投入）
//! 4. キューの健全性を見て backpressure 判定。閉じていれば生成しない
//! 5. last generation から次の窓を計算。最小幅未満なら何もしない
//! 6. (group, keyword) ごとに 1 タスクを作り、priority 昇順で append
//! 7. バッチ全体の append が成功したときだけ last generation を更新
//!    （incremental は窓の end、historical は窓の start）
//! 8. emergency trim（生成判定とは独立）
//!
//! # 設計原則
//! - キュー・ストアのエラーはサイクル全体を中断し、last generation は変更しない
//! - 窓が小さすぎる場合は安全な no-op（状態も変えない）

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::app::backpressure::{Backpressure, Gate, QueueHealth, TrimReport};
use crate::app::control::ControlState;
use crate::app::sweeper::{RetrySweeper, SweepReport};
use crate::config::{GeneratorConfig, HarvestConfig};
use crate::domain::{
    CrawlMode, DefaultRetryDecider, GenerateError, HarvestTask, Priority, QueueEnvelope,
    RetryDecider, RunId, TaskId, TimeWindow,
};
use crate::ports::{Clock, IdGenerator, WorkQueue};

/// Next window for `mode` given the persisted last generation.
///
/// - incremental: `[now - lookback, now)` on a first run, else `[last - buffer, now)`
/// - historical: `[now - span, now)` on a first run, else `[last - span, last)`,
///   never starting before `historical_origin`
pub fn compute_window(
    config: &GeneratorConfig,
    last_generation: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> TimeWindow {
    match (config.mode, last_generation) {
        (CrawlMode::Incremental, None) => TimeWindow::new(now - config.lookback(), now),
        (CrawlMode::Incremental, Some(last)) => TimeWindow::new(last - config.buffer(), now),
        (CrawlMode::Historical, last) => {
            let end = last.unwrap_or(now);
            let window = TimeWindow::new(end - config.historical_span(), end);
            match config.historical_origin {
                Some(origin) => window.clamp_start(origin),
                None => window,
            }
        }
    }
}

/// 1 = group and keyword both prioritized, 2 = one of them, 3 = neither.
pub fn priority_for(config: &GeneratorConfig, group: &str, keyword: &str) -> Priority {
    let group_hit = config.priority_groups.iter().any(|g| g == group);
    let keyword_hit = config.priority_keywords.iter().any(|k| k == keyword);
    match (group_hit, keyword_hit) {
        (true, true) => Priority::HIGH,
        (true, false) | (false, true) => Priority::MEDIUM,
        (false, false) => Priority::LOW,
    }
}

/// One task per (group, keyword), in non-decreasing priority order.
pub fn build_batch(
    config: &GeneratorConfig,
    window: TimeWindow,
    ids: &dyn IdGenerator,
    now: DateTime<Utc>,
) -> Vec<HarvestTask> {
    let mut tasks = Vec::with_capacity(config.groups.len() * config.keywords.len());
    for group in &config.groups {
        for keyword in &config.keywords {
            tasks.push(HarvestTask {
                task_id: ids.generate_task_id(),
                group: group.clone(),
                keyword: keyword.clone(),
                max_items: config.max_items(),
                start_time: window.start,
                end_time: window.end,
                created_at: now,
                priority: priority_for(config, group, keyword),
                retry_count: 0,
                max_retries: config.max_retries,
                mode: config.mode,
                requeued_at: None,
            });
        }
    }
    // stable sort: 同じ priority 内では設定順を保つ
    tasks.sort_by_key(|t| t.priority);
    tasks
}

/// The boundary persisted as last generation once a batch is enqueued.
pub fn resume_point(mode: CrawlMode, window: TimeWindow) -> DateTime<Utc> {
    match mode {
        CrawlMode::Incremental => window.end,
        CrawlMode::Historical => window.start,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Enqueued,
    Backpressured,
    WindowTooSmall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationReport {
    pub run_id: RunId,
    pub mode: CrawlMode,
    pub status: GenerationStatus,
    pub housekeeping: Option<TrimReport>,
    pub sweep: SweepReport,
    pub health_before: QueueHealth,
    pub gate: Gate,
    pub window: Option<TimeWindow>,
    pub task_ids: Vec<TaskId>,
    /// Persisted resume point after this cycle, when it moved.
    pub last_generation: Option<DateTime<Utc>>,
    pub emergency_trim: Option<TrimReport>,
    pub health_after: QueueHealth,
    pub timestamp: DateTime<Utc>,
}

impl GenerationReport {
    pub fn tasks_enqueued(&self) -> usize {
        self.task_ids.len()
    }
}

pub struct TaskGenerator {
    queue: Arc<dyn WorkQueue>,
    control: ControlState,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    backpressure: Backpressure,
    sweeper: RetrySweeper,
    config: GeneratorConfig,
    group: String,
}

impl TaskGenerator {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        control: ControlState,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: &HarvestConfig,
    ) -> Self {
        let decider = Arc::new(DefaultRetryDecider::new(config.backpressure.stale_after()));
        Self::with_decider(queue, control, clock, ids, config, decider)
    }

    pub fn with_decider(
        queue: Arc<dyn WorkQueue>,
        control: ControlState,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: &HarvestConfig,
        decider: Arc<dyn RetryDecider>,
    ) -> Self {
        let group = config.queue.consumer_group.clone();
        Self {
            backpressure: Backpressure::new(queue.clone(), config.backpressure.clone()),
            sweeper: RetrySweeper::new(
                queue.clone(),
                clock.clone(),
                decider,
                group.clone(),
                config.backpressure.sweep_count,
            ),
            queue,
            control,
            clock,
            ids,
            config: config.generator.clone(),
            group,
        }
    }

    /// The window the next cycle would use, without touching any state.
    pub async fn plan(&self) -> Result<TimeWindow, GenerateError> {
        let last = self.control.last_generation(self.config.mode).await?;
        Ok(compute_window(&self.config, last, self.clock.now()))
    }

    pub async fn run_cycle(&self) -> Result<GenerationReport, GenerateError> {
        let run_id = self.ids.generate_run_id();
        let mode = self.config.mode;
        info!(%run_id, %mode, "generation cycle started");

        self.queue.ensure_group(&self.group).await?;
        let housekeeping = self.backpressure.housekeeping().await?;
        let sweep = self.sweeper.sweep().await?;

        let health_before = self.backpressure.inspect().await?;
        let gate = self.backpressure.gate(&health_before);
        debug!(?health_before, ?gate, "queue health");

        let mut window = None;
        let mut task_ids = Vec::new();
        let mut last_generation = None;

        let status = if !gate.is_open() {
            warn!(%run_id, ?gate, "backpressure: skipping generation this cycle");
            GenerationStatus::Backpressured
        } else {
            let now = self.clock.now();
            let last = self.control.last_generation(mode).await?;
            let next = compute_window(&self.config, last, now);
            window = Some(next);

            if next.duration() < self.config.min_window() {
                info!(%run_id, window = %next, min = ?self.config.min_window(), "window too small; nothing to generate");
                GenerationStatus::WindowTooSmall
            } else {
                let batch = build_batch(&self.config, next, self.ids.as_ref(), now);
                self.enqueue(&batch).await?;

                let resume = resume_point(mode, next);
                self.control.set_last_generation(mode, resume).await?;
                last_generation = Some(resume);
                task_ids = batch.iter().map(|t| t.task_id.clone()).collect();
                info!(%run_id, window = %next, tasks = task_ids.len(), "batch enqueued");
                GenerationStatus::Enqueued
            }
        };

        let emergency_trim = self.backpressure.emergency_trim().await?;
        let health_after = self.backpressure.inspect().await?;

        Ok(GenerationReport {
            run_id,
            mode,
            status,
            housekeeping,
            sweep,
            health_before,
            gate,
            window,
            task_ids,
            last_generation,
            emergency_trim,
            health_after,
            timestamp: self.clock.now(),
        })
    }

    async fn enqueue(&self, batch: &[HarvestTask]) -> Result<(), GenerateError> {
        // 先に全件 encode しておき、途中で encode に失敗して半端に投入しないようにする
        let envelopes = batch
            .iter()
            .map(|task| {
                QueueEnvelope::from_task(task).map_err(|source| GenerateError::Encode {
                    task_id: task.task_id.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (task, envelope) in batch.iter().zip(envelopes) {
            let message_id = self.queue.append(envelope).await?;
            debug!(
                task_id = %task.task_id,
                %message_id,
                group = %task.group,
                keyword = %task.keyword,
                priority = task.priority.get(),
                "task enqueued"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn config(mode: CrawlMode) -> GeneratorConfig {
        GeneratorConfig {
            mode,
            ..GeneratorConfig::default()
        }
    }

    #[test]
    fn historical_continuation_marches_backwards() {
        let cfg = config(CrawlMode::Historical);
        let last = at(2024, 6, 1);
        let w = compute_window(&cfg, Some(last), at(2024, 7, 1));
        assert_eq!(w, TimeWindow::new(at(2024, 5, 18), at(2024, 6, 1)));
        assert_eq!(resume_point(CrawlMode::Historical, w), at(2024, 5, 18));

        let next = compute_window(&cfg, Some(resume_point(CrawlMode::Historical, w)), at(2024, 7, 1));
        assert_eq!(next.end, w.start);
        assert!(next.start < w.start);
    }

    #[test]
    fn historical_first_run_ends_now() {
        let cfg = config(CrawlMode::Historical);
        let now = at(2024, 7, 1);
        assert_eq!(
            compute_window(&cfg, None, now),
            TimeWindow::new(now - Duration::weeks(2), now)
        );
    }

    #[test]
    fn incremental_windows_overlap_by_the_buffer() {
        let cfg = config(CrawlMode::Incremental);
        let now = at(2024, 7, 1);
        assert_eq!(
            compute_window(&cfg, None, now),
            TimeWindow::new(now - Duration::hours(6), now)
        );
        let last = now - Duration::hours(1);
        assert_eq!(
            compute_window(&cfg, Some(last), now),
            TimeWindow::new(last - Duration::minutes(5), now)
        );
    }

    #[test]
    fn historical_origin_clamps_and_eventually_empties() {
        let cfg = GeneratorConfig {
            historical_origin: Some(at(2024, 5, 25)),
            ..config(CrawlMode::Historical)
        };
        let w = compute_window(&cfg, Some(at(2024, 6, 1)), at(2024, 7, 1));
        assert_eq!(w.start, at(2024, 5, 25));

        let done = compute_window(&cfg, Some(at(2024, 5, 25)), at(2024, 7, 1));
        assert!(done.duration() < cfg.min_window());
    }

    #[rstest]
    #[case("Melbourne", "housing", 1)]
    #[case("housing", "affordability", 1)]
    #[case("Melbourne", "rent", 2)]
    #[case("sydney", "house prices", 2)]
    #[case("sydney", "rent", 3)]
    fn priority_table(#[case] group: &str, #[case] keyword: &str, #[case] expected: u8) {
        let cfg = GeneratorConfig::default();
        assert_eq!(priority_for(&cfg, group, keyword).get(), expected);
    }

    #[test]
    fn batch_is_one_task_per_pair_sorted_by_priority() {
        let cfg = GeneratorConfig {
            groups: vec!["sydney".into(), "Melbourne".into()],
            keywords: vec!["rent".into(), "housing".into()],
            ..config(CrawlMode::Historical)
        };
        let now = at(2024, 6, 1);
        let ids = UlidGenerator::new(FixedClock::new(now));
        let window = TimeWindow::new(at(2024, 5, 18), now);
        let batch = build_batch(&cfg, window, &ids, now);

        assert_eq!(batch.len(), 4);
        let priorities: Vec<u8> = batch.iter().map(|t| t.priority.get()).collect();
        assert_eq!(priorities, vec![1, 2, 2, 3]);
        assert_eq!(batch[0].group, "Melbourne");
        assert_eq!(batch[0].keyword, "housing");
        assert!(batch.iter().all(|t| t.max_items == 300 && t.window() == window));
        assert!(batch.iter().all(|t| t.mode == CrawlMode::Historical));
    }
}
