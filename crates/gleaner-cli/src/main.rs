//! # gleaner
//!
//! Operator CLI for the harvest task queue.
//!
//! ```bash
//! # Run three generate → drain cycles against in-memory collaborators
//! gleaner simulate --cycles 3 --config ./gleaner.toml
//!
//! # Show the next window for a given resume point, touching nothing
//! gleaner plan-window --mode historical --last-generation 2024-06-01T00:00:00Z
//!
//! # Print the effective configuration
//! gleaner show-config --config ./gleaner.toml
//! ```
//!
//! ログは `RUST_LOG` で絞れます（未設定なら `--log-level`）。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gleaner_core::HarvestConfig;
use gleaner_core::app::{
    ControlState, GenerationReport, HarvestController, HarvestWorker, TaskGenerator,
    compute_window,
};
use gleaner_core::domain::{BatchReport, BatchStatus, CandidateItem, CrawlMode, GroupKey, TimeWindow};
use gleaner_core::impls::{InMemoryDocumentStore, InMemoryWorkQueue, ScriptedContentSource};
use gleaner_core::ports::{Clock, FixedClock, UlidGenerator};

#[derive(Parser)]
#[command(name = "gleaner", version, about = "Distributed harvest task queue")]
struct Cli {
    /// TOML config file. Defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run generate → drain cycles against in-memory collaborators and print JSON reports.
    Simulate {
        #[arg(long, default_value_t = 3)]
        cycles: u32,

        /// Controller triggers per cycle.
        #[arg(long, default_value_t = 40)]
        drains: u32,

        /// Synthetic items per (group, keyword).
        #[arg(long, default_value_t = 20)]
        items_per_key: u32,

        /// Spacing between synthetic items.
        #[arg(long, default_value_t = 6)]
        spacing_hours: i64,

        /// Clock advance between cycles.
        #[arg(long, default_value_t = 60)]
        step_minutes: i64,

        /// Simulation start time (RFC 3339). Defaults to now.
        #[arg(long)]
        now: Option<DateTime<Utc>>,

        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Clear the last-generation cursor before this cycle, as an operator reset would.
        #[arg(long)]
        reset_before: Option<u32>,
    },

    /// Print the next generation window without touching any state.
    PlanWindow {
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Persisted resume point (RFC 3339). Omit for a first run.
        #[arg(long)]
        last_generation: Option<DateTime<Utc>>,

        #[arg(long)]
        now: Option<DateTime<Utc>>,
    },

    /// Print the effective configuration as JSON.
    ShowConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Incremental,
    Historical,
}

impl From<ModeArg> for CrawlMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Incremental => CrawlMode::Incremental,
            ModeArg::Historical => CrawlMode::Historical,
        }
    }
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<HarvestConfig> {
    match path {
        Some(path) => HarvestConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(HarvestConfig::default()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct WindowPlan {
    mode: CrawlMode,
    window: TimeWindow,
    duration_secs: i64,
    would_generate: bool,
}

#[derive(Serialize)]
struct CycleReport {
    cycle: u32,
    generation: GenerationReport,
    batches: Vec<BatchReport>,
    documents: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Simulate {
            cycles,
            drains,
            items_per_key,
            spacing_hours,
            step_minutes,
            now,
            mode,
            reset_before,
        } => {
            if let Some(mode) = mode {
                config.generator.mode = mode.into();
            }
            let start = now.unwrap_or_else(Utc::now);
            let settings = Simulation {
                cycles,
                drains,
                items_per_key,
                spacing: Duration::hours(spacing_hours),
                step: Duration::minutes(step_minutes),
                reset_before,
            };
            simulate(config, start, settings).await
        }
        Commands::PlanWindow {
            mode,
            last_generation,
            now,
        } => {
            if let Some(mode) = mode {
                config.generator.mode = mode.into();
            }
            let window = compute_window(
                &config.generator,
                last_generation,
                now.unwrap_or_else(Utc::now),
            );
            print_json(&WindowPlan {
                mode: config.generator.mode,
                window,
                duration_secs: window.duration().num_seconds(),
                would_generate: window.duration() >= config.generator.min_window(),
            })
        }
        Commands::ShowConfig => print_json(&config),
    }
}

struct Simulation {
    cycles: u32,
    drains: u32,
    items_per_key: u32,
    spacing: Duration,
    step: Duration,
    reset_before: Option<u32>,
}

async fn simulate(mut config: HarvestConfig, start: DateTime<Utc>, sim: Simulation) -> Result<()> {
    // シミュレーションでは待たない
    config.controller.block_ms = 0;
    config.worker.fetch_base_delay_ms = 0;
    config.worker.max_rate_limit_wait_secs = 0;
    config.validate()?;

    let clock = Arc::new(FixedClock::new(start));
    let queue = Arc::new(InMemoryWorkQueue::new(clock.clone()));
    let store = InMemoryDocumentStore::new();
    let source = ScriptedContentSource::new();
    let ids = Arc::new(UlidGenerator::new(clock.clone()));

    for group in &config.generator.groups {
        for keyword in &config.generator.keywords {
            let items = (0..sim.items_per_key).map(|i| {
                let id = format!("{group}-{keyword}-{i}").replace(' ', "_");
                CandidateItem::new(id, start - sim.spacing * i as i32)
                    .with_author(format!("user{}", i % 7))
                    .with_title(format!("{keyword} in {group} #{i}"))
                    .with_body("synthetic post")
            });
            source.add_items(GroupKey::new(group.clone(), keyword.clone()), items).await;
        }
    }

    let control = ControlState::new(Arc::new(store.clone()), clock.clone(), config.control.clone());
    let generator = TaskGenerator::new(queue.clone(), control.clone(), clock.clone(), ids.clone(), &config);
    let worker = HarvestWorker::new(
        Arc::new(source),
        Arc::new(store.clone()),
        control.clone(),
        clock.clone(),
        config.worker.clone(),
    );
    let controller = HarvestController::new(queue, worker, clock.clone(), ids, &config);

    let mut reports = Vec::new();
    for cycle in 1..=sim.cycles {
        if sim.reset_before == Some(cycle) {
            let cleared = control.reset(config.generator.mode).await?;
            info!(cycle, cleared, "last generation reset");
        }
        let generation = generator
            .run_cycle()
            .await
            .with_context(|| format!("generation cycle {cycle}"))?;

        let mut batches = Vec::new();
        for _ in 0..sim.drains {
            let batch = controller.run_batch().await;
            let done = batch.status == BatchStatus::NoTasks;
            batches.push(batch);
            if done {
                break;
            }
        }

        let documents = store.count(&config.worker.posts_collection).await
            + store.count(&config.worker.comments_collection).await;
        info!(cycle, status = ?generation.status, batches = batches.len(), documents, now = %clock.now(), "cycle finished");
        reports.push(CycleReport {
            cycle,
            generation,
            batches,
            documents,
        });
        clock.advance(sim.step);
    }

    print_json(&reports)
}
