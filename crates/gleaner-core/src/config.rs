//! HarvestConfig - TOML 設定
//!
//! すべてのフィールドに既定値があるので、空ファイルでも有効な設定になります。
//! 既定値は運用中の定数（backpressure 30/50、trim 300→50、reclaim 60 秒 など）と同じです。
//!
//! ```toml
//! [generator]
//! mode = "historical"
//! groups = ["housing", "Melbourne"]
//! keywords = ["rent"]
//! window_weeks = 2
//! historical_origin = "2020-01-01T00:00:00Z"
//!
//! [controller]
//! max_tasks = 2
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::CrawlMode;

/// Upper bounds that keep every derived duration representable.
const MAX_LOOKBACK_HOURS: i64 = 24 * 366;
const MAX_BUFFER_MINUTES: i64 = 24 * 60;
const MAX_WINDOW_WEEKS: i64 = 520;
const MAX_FETCH_ATTEMPTS: u32 = 10;
const MAX_FETCH_MULTIPLIER: f64 = 10.0;
const MAX_FETCH_BASE_DELAY_MS: u64 = 10 * 60 * 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub queue: QueueConfig,
    pub generator: GeneratorConfig,
    pub backpressure: BackpressureConfig,
    pub worker: WorkerConfig,
    pub controller: ControllerConfig,
    pub control: ControlConfig,
}

impl HarvestConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: HarvestConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };
        let g = &self.generator;

        if g.groups.is_empty() || g.groups.iter().any(|s| s.trim().is_empty()) {
            return invalid("generator.groups must be non-empty and contain no blank names".into());
        }
        if g.keywords.is_empty() || g.keywords.iter().any(|s| s.trim().is_empty()) {
            return invalid("generator.keywords must be non-empty and contain no blank names".into());
        }
        if !(1..=MAX_LOOKBACK_HOURS).contains(&g.lookback_hours) {
            return invalid(format!("generator.lookback_hours must be in 1..={MAX_LOOKBACK_HOURS}"));
        }
        if !(1..=MAX_WINDOW_WEEKS).contains(&g.window_weeks) {
            return invalid(format!("generator.window_weeks must be in 1..={MAX_WINDOW_WEEKS}"));
        }
        if !(0..=MAX_BUFFER_MINUTES).contains(&g.buffer_minutes) {
            return invalid(format!("generator.buffer_minutes must be in 0..={MAX_BUFFER_MINUTES}"));
        }
        if !(0..=MAX_LOOKBACK_HOURS * 60).contains(&g.min_incremental_window_minutes)
            || !(0..=MAX_WINDOW_WEEKS * 7 * 24).contains(&g.min_historical_window_hours)
        {
            return invalid("generator minimum windows must be non-negative and within the window bounds".into());
        }
        if g.incremental_max_items == 0 || g.historical_max_items == 0 {
            return invalid("generator max_items budgets must be > 0".into());
        }

        let b = &self.backpressure;
        if b.max_effective_queue < b.max_pending {
            return invalid(format!(
                "backpressure.max_effective_queue ({}) must be >= max_pending ({})",
                b.max_effective_queue, b.max_pending
            ));
        }
        if b.emergency_keep >= b.emergency_ceiling {
            return invalid("backpressure.emergency_keep must be below emergency_ceiling".into());
        }
        for tier in &b.housekeeping {
            if tier.keep >= tier.above {
                return invalid(format!(
                    "housekeeping tier keeps {} of {}: keep must be below the threshold",
                    tier.keep, tier.above
                ));
            }
        }
        if b.sweep_count == 0 {
            return invalid("backpressure.sweep_count must be > 0".into());
        }

        let w = &self.worker;
        if w.flush_batch_size == 0 {
            return invalid("worker.flush_batch_size must be > 0".into());
        }
        if !(1..=MAX_FETCH_ATTEMPTS).contains(&w.fetch_max_attempts) {
            return invalid(format!("worker.fetch_max_attempts must be in 1..={MAX_FETCH_ATTEMPTS}"));
        }
        if !w.fetch_multiplier.is_finite() || !(1.0..=MAX_FETCH_MULTIPLIER).contains(&w.fetch_multiplier) {
            return invalid(format!("worker.fetch_multiplier must be a number in 1.0..={MAX_FETCH_MULTIPLIER}"));
        }
        if w.fetch_base_delay_ms > MAX_FETCH_BASE_DELAY_MS {
            return invalid(format!("worker.fetch_base_delay_ms must be <= {MAX_FETCH_BASE_DELAY_MS}"));
        }
        if w.posts_collection == w.comments_collection {
            return invalid("worker posts and comments collections must differ".into());
        }

        if self.controller.max_tasks == 0 {
            return invalid("controller.max_tasks must be > 0".into());
        }
        if self.queue.consumer_group.trim().is_empty() {
            return invalid("queue.consumer_group must not be blank".into());
        }
        if self.control.collection.trim().is_empty() {
            return invalid("control.collection must not be blank".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub consumer_group: String,
    /// Pending deliveries idle at least this long may be claimed by another consumer.
    pub reclaim_idle_ms: u64,
}

impl QueueConfig {
    pub fn reclaim_idle(&self) -> Duration {
        Duration::from_millis(self.reclaim_idle_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            consumer_group: "harvesters".to_string(),
            reclaim_idle_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub mode: CrawlMode,
    pub groups: Vec<String>,
    pub keywords: Vec<String>,
    pub priority_groups: Vec<String>,
    pub priority_keywords: Vec<String>,
    /// Incremental first run: `[now - lookback, now)`.
    pub lookback_hours: i64,
    /// Incremental overlap behind the last generation.
    pub buffer_minutes: i64,
    /// Historical window length.
    pub window_weeks: i64,
    pub min_incremental_window_minutes: i64,
    pub min_historical_window_hours: i64,
    /// Historical windows never start before this instant.
    pub historical_origin: Option<DateTime<Utc>>,
    pub incremental_max_items: u32,
    pub historical_max_items: u32,
    pub max_retries: u32,
}

impl GeneratorConfig {
    pub fn max_items(&self) -> u32 {
        match self.mode {
            CrawlMode::Incremental => self.incremental_max_items,
            CrawlMode::Historical => self.historical_max_items,
        }
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.lookback_hours)
    }

    pub fn buffer(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.buffer_minutes)
    }

    pub fn historical_span(&self) -> chrono::Duration {
        chrono::Duration::weeks(self.window_weeks)
    }

    /// Windows shorter than this are not worth a batch.
    pub fn min_window(&self) -> chrono::Duration {
        match self.mode {
            CrawlMode::Incremental => chrono::Duration::minutes(self.min_incremental_window_minutes),
            CrawlMode::Historical => chrono::Duration::hours(self.min_historical_window_hours),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            mode: CrawlMode::Incremental,
            groups: strings(&[
                "Australia",
                "Melbourne",
                "housing",
                "AusFinance",
                "sydney",
                "brisbane",
                "perth",
                "adelaide",
            ]),
            keywords: strings(&[
                "housing",
                "house prices",
                "affordability",
                "rent",
                "mortgage",
                "rental",
                "property",
            ]),
            priority_groups: strings(&["Melbourne", "housing", "AusFinance"]),
            priority_keywords: strings(&["housing", "house prices", "affordability"]),
            lookback_hours: 6,
            buffer_minutes: 5,
            window_weeks: 2,
            min_incremental_window_minutes: 5,
            min_historical_window_hours: 24,
            historical_origin: None,
            incremental_max_items: 200,
            historical_max_items: 300,
            max_retries: 3,
        }
    }
}

/// Trim to `keep` entries when the stream holds more than `above`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimTier {
    pub above: usize,
    pub keep: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Skip generation when pending deliveries exceed this.
    pub max_pending: usize,
    /// Skip generation when pending + lag exceeds this.
    pub max_effective_queue: usize,
    /// Checked first to last; the first matching tier wins.
    pub housekeeping: Vec<TrimTier>,
    pub emergency_ceiling: usize,
    pub emergency_keep: usize,
    /// Retry sweep: pending deliveries idle longer than this get requeued.
    pub stale_after_secs: u64,
    /// Retry sweep: pending rows inspected per cycle.
    pub sweep_count: usize,
}

impl BackpressureConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_pending: 30,
            max_effective_queue: 50,
            housekeeping: vec![
                TrimTier { above: 200, keep: 50 },
                TrimTier { above: 100, keep: 30 },
            ],
            emergency_ceiling: 300,
            emergency_keep: 50,
            stale_after_secs: 600,
            sweep_count: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub posts_collection: String,
    pub comments_collection: String,
    pub reply_limit: usize,
    pub flush_batch_size: usize,
    pub fetch_max_attempts: u32,
    pub fetch_base_delay_ms: u64,
    pub fetch_multiplier: f64,
    /// Upper bound on a single rate-limit sleep.
    pub max_rate_limit_wait_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            posts_collection: "posts".to_string(),
            comments_collection: "comments".to_string(),
            reply_limit: 50,
            flush_batch_size: 100,
            fetch_max_attempts: 3,
            fetch_base_delay_ms: 2_000,
            fetch_multiplier: 2.0,
            max_rate_limit_wait_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub max_tasks: usize,
    pub block_ms: u64,
    pub consumer_prefix: String,
    /// Fixed consumer name. When unset each run gets `<prefix>-<run id>`.
    pub consumer_name: Option<String>,
}

impl ControllerConfig {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_tasks: 2,
            block_ms: 1_000,
            consumer_prefix: "harvester".to_string(),
            consumer_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub collection: String,
    /// Refuse watermark writes that move against the crawl direction.
    pub enforce_monotonic: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            collection: "harvest-control".to_string(),
            enforce_monotonic: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[test]
    fn empty_file_is_the_default() {
        let config = HarvestConfig::from_toml_str("").unwrap();
        assert_eq!(config, HarvestConfig::default());
        assert_eq!(config.backpressure.max_pending, 30);
        assert_eq!(config.controller.max_tasks, 2);
        assert_eq!(config.queue.reclaim_idle(), Duration::from_secs(60));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = HarvestConfig::from_toml_str(
            r#"
            [generator]
            mode = "historical"
            groups = ["housing"]
            keywords = ["rent"]
            historical_origin = "2023-01-01T00:00:00Z"
            "#,
        )
        .unwrap();

        assert_eq!(config.generator.mode, CrawlMode::Historical);
        assert_eq!(config.generator.max_items(), 300);
        assert_eq!(config.generator.window_weeks, 2);
        assert_eq!(
            config.generator.historical_origin,
            Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(config.generator.min_window(), chrono::Duration::days(1));
    }

    #[test]
    fn housekeeping_tiers_parse_as_tables() {
        let config = HarvestConfig::from_toml_str(
            r#"
            [[backpressure.housekeeping]]
            above = 500
            keep = 100
            "#,
        )
        .unwrap();
        assert_eq!(
            config.backpressure.housekeeping,
            vec![TrimTier { above: 500, keep: 100 }]
        );
    }

    #[test]
    fn rejects_blank_groups() {
        let err = HarvestConfig::from_toml_str(
            r#"
            [generator]
            groups = ["housing", " "]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let err = HarvestConfig::from_toml_str(
            r#"
            [backpressure]
            max_pending = 60
            max_effective_queue = 50
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_effective_queue"));
    }

    #[rstest]
    #[case("[worker]\nfetch_multiplier = nan")]
    #[case("[worker]\nfetch_multiplier = inf")]
    #[case("[worker]\nfetch_multiplier = 0.5")]
    #[case("[worker]\nfetch_max_attempts = 4000000000")]
    #[case("[worker]\nfetch_base_delay_ms = 3600000")]
    #[case("[generator]\nwindow_weeks = 9223372036854775807")]
    #[case("[generator]\nlookback_hours = 9223372036854775807")]
    #[case("[generator]\nbuffer_minutes = -5")]
    #[case("[generator]\nmin_historical_window_hours = -1")]
    fn rejects_values_outside_the_supported_range(#[case] raw: &str) {
        let err = HarvestConfig::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{raw}: {err}");
    }

    #[test]
    fn syntax_errors_are_parse_errors() {
        let err = HarvestConfig::from_toml_str("[generator\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
