//! Walk-forward k-NN calibration CLI
//!
//! Usage:
//!   knn-walkforward gridsearch --config config/usdjpy.toml --data data
//!   knn-walkforward select --config config/usdjpy.toml --data data
//!   knn-walkforward evaluate --config config/usdjpy.toml --data data
//!   knn-walkforward run --config config/usdjpy.toml --data data --asof 2024-06-30
//!
//! `--config` takes a TOML file or a frozen experiment directory.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveTime, Utc};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use knn_walkforward::config::ExperimentConfig;
use knn_walkforward::data::ArtifactStore;
use knn_walkforward::metrics::MetricsCalculator;
use knn_walkforward::walkforward::periods::last_completed_monday;
use knn_walkforward::walkforward::{
    GridScheduler, GridSearchEngine, ParameterSelector, ScheduleSummary, WalkForwardEvaluator, WeeklySplits,
};

#[derive(Parser)]
#[command(name = "knn-walkforward")]
#[command(about = "Walk-forward calibration and evaluation of nearest-neighbor signals")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Common {
    /// Configuration file or frozen experiment directory
    #[arg(short, long)]
    config: PathBuf,

    /// Data root containing digest/ and knn/
    #[arg(short, long, default_value = "data")]
    data: PathBuf,

    /// Number of TEST weeks (overrides test_weeks in the config)
    #[arg(short, long)]
    weeks: Option<usize>,

    /// Pin "now" to this date (YYYY-MM-DD) for reproducible runs
    #[arg(long)]
    asof: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute grid cubes for every DEV and TEST week
    Gridsearch {
        #[command(flatten)]
        common: Common,

        /// Recompute cubes that already exist
        #[arg(short, long)]
        force: bool,
    },

    /// Write a parameter manifest per TEST week
    Select {
        #[command(flatten)]
        common: Common,
    },

    /// Merge selected trade streams per TEST week and report
    Evaluate {
        #[command(flatten)]
        common: Common,
    },

    /// Grid search, selection and evaluation in one go
    Run {
        #[command(flatten)]
        common: Common,

        /// Recompute cubes that already exist
        #[arg(short, long)]
        force: bool,
    },
}

struct Session {
    config: ExperimentConfig,
    store: ArtifactStore,
    splits: WeeklySplits,
}

fn prepare(common: &Common) -> Result<Session> {
    let mut config = if common.config.is_dir() {
        ExperimentConfig::load_frozen(&common.config)
    } else {
        ExperimentConfig::load(&common.config)
    }
    .with_context(|| format!("Failed to load config {}", common.config.display()))?;

    if let Some(weeks) = common.weeks {
        config.test_weeks = weeks;
    }
    config.validate().context("Invalid configuration")?;

    let now = match &common.asof {
        Some(s) => {
            let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").context("Invalid asof date format")?;
            date.and_time(NaiveTime::MIN).and_utc() + chrono::Duration::days(1) - chrono::Duration::seconds(1)
        }
        None => Utc::now(),
    };
    let last_test_week = last_completed_monday(now);
    let splits = WeeklySplits::new((&config).into(), last_test_week);

    info!(
        "{}: {} TEST weeks ending {}, config {}",
        config.pair,
        config.test_weeks,
        last_test_week,
        config.content_hash()?
    );

    let plan = splits.generate();
    if let Some(split) = plan.iter().find(|s| s.looks_ahead()) {
        bail!("Split {} for TEST week {} reads its own or later weeks", split.split_num, split.test_week);
    }
    let needed_from = plan.first().map(|s| s.earliest_week());

    let store = ArtifactStore::new(&common.data);
    for &window in &config.windows {
        let available = store.list_mondays(&config.pair, window)?;
        info!(
            "Window {}: {} digest weeks on disk ({} to {})",
            window,
            available.len(),
            available.first().map_or("-".to_string(), |d| d.to_string()),
            available.last().map_or("-".to_string(), |d| d.to_string())
        );
        if let (Some(needed), Some(&first)) = (needed_from, available.first()) {
            if first > needed {
                warn!(
                    "Window {}: history starts {}, the first split reads from {}",
                    window, first, needed
                );
            }
        }
    }

    Ok(Session { config, store, splits })
}

fn cmd_gridsearch(ctx: &Session, force: bool) -> Result<ScheduleSummary> {
    let engine = GridSearchEngine::new(ctx.config.clone())?;
    let weeks = ctx.splits.grid_weeks();

    let pb = ProgressBar::new((weeks.len() * ctx.config.windows.len()) as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );
    pb.set_message("grid");

    let outcomes = GridScheduler::new(&engine, &ctx.store)
        .with_force(force)
        .run(&weeks, |outcome| {
            pb.set_message(format!("{} w{}", outcome.week, outcome.window));
            pb.inc(1);
        })?;
    pb.finish_with_message("grid complete");

    for outcome in outcomes.iter().filter(|o| o.is_failed()) {
        warn!("Grid unit {} window {} failed: {:?}", outcome.week, outcome.window, outcome.status);
    }
    Ok(ScheduleSummary::from_outcomes(&outcomes))
}

fn cmd_select(ctx: &Session) -> Result<usize> {
    let selector = ParameterSelector::new(ctx.config.clone())?;
    let results = selector.run(&ctx.store, &ctx.splits.test_weeks());
    Ok(results.iter().filter(|(_, r)| r.is_err()).count())
}

fn cmd_evaluate(ctx: &Session) -> Result<usize> {
    let evaluator = WalkForwardEvaluator::new(ctx.config.clone())?;
    let results = evaluator.run(&ctx.store, &ctx.splits.test_weeks());

    let summaries: Vec<_> = results.iter().filter_map(|(_, r)| r.as_ref().ok().cloned()).collect();
    let report = MetricsCalculator::evaluation_report(&summaries);
    println!("{}", report.summary());

    Ok(results.len() - summaries.len())
}

fn freeze_experiment(ctx: &Session, data: &Path) -> Result<()> {
    let hash = ctx.config.content_hash()?;
    let exp_dir = data.join("knn").join("experiments").join(&hash);
    ctx.config
        .freeze(&exp_dir)
        .with_context(|| format!("Failed to freeze experiment into {}", exp_dir.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("knn_walkforward=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Gridsearch { common, force } => {
            let ctx = prepare(&common)?;
            let summary = cmd_gridsearch(&ctx, force)?;
            if summary.failed > 0 {
                bail!("{} grid units failed", summary.failed);
            }
        }
        Commands::Select { common } => {
            let ctx = prepare(&common)?;
            let failed = cmd_select(&ctx)?;
            if failed > 0 {
                bail!("Selection failed for {} weeks", failed);
            }
        }
        Commands::Evaluate { common } => {
            let ctx = prepare(&common)?;
            let failed = cmd_evaluate(&ctx)?;
            if failed > 0 {
                bail!("Evaluation failed for {} weeks", failed);
            }
        }
        Commands::Run { common, force } => {
            let ctx = prepare(&common)?;
            freeze_experiment(&ctx, &common.data)?;

            let grid = cmd_gridsearch(&ctx, force)?;
            let select_failed = cmd_select(&ctx)?;
            let eval_failed = cmd_evaluate(&ctx)?;

            if grid.failed > 0 {
                warn!("{} grid units failed", grid.failed);
            }
            if select_failed > 0 {
                warn!("Selection failed for {} weeks", select_failed);
            }
            if eval_failed > 0 {
                bail!("Evaluation failed for {} weeks", eval_failed);
            }
        }
    }

    Ok(())
}
