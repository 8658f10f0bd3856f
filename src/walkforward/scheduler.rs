//! Parallel execution of grid units.
//!
//! Each (week, window) unit reads immutable digest files and writes to its
//! own output paths, so units run independently on a bounded rayon pool.
//! A failing unit is reported with its key and never stops its siblings.
//! An existing cube is reused only when it carries the current config hash.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::NaiveDate;
use rayon::prelude::*;
use tracing::{info, warn};

use super::gridsearch::{GridError, GridSearchEngine};
use crate::data::{ArtifactStore, Side};

/// What happened to one unit.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Computed { buy_trades: usize, sell_trades: usize },
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub week: NaiveDate,
    pub window: u32,
    pub status: TaskStatus,
}

impl TaskOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, TaskStatus::Failed(_))
    }
}

/// Counts of outcomes by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub computed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ScheduleSummary {
    pub fn from_outcomes(outcomes: &[TaskOutcome]) -> Self {
        outcomes.iter().fold(Self::default(), |mut s, o| {
            match o.status {
                TaskStatus::Computed { .. } => s.computed += 1,
                TaskStatus::Skipped(_) => s.skipped += 1,
                TaskStatus::Failed(_) => s.failed += 1,
            }
            s
        })
    }
}

pub struct GridScheduler<'a> {
    engine: &'a GridSearchEngine,
    store: &'a ArtifactStore,
    workers: usize,
    force: bool,
}

impl<'a> GridScheduler<'a> {
    /// Worker count comes from the engine's config (0 = one per core).
    pub fn new(engine: &'a GridSearchEngine, store: &'a ArtifactStore) -> Self {
        Self {
            engine,
            store,
            workers: engine.config().workers,
            force: false,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Recompute units whose cube already exists, even when it is current.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Run every (week, window) unit. Outcomes come back in task order
    /// (weeks as given, windows in config order); `on_done` is called as
    /// each unit finishes.
    pub fn run<F>(&self, weeks: &[NaiveDate], on_done: F) -> Result<Vec<TaskOutcome>, GridError>
    where
        F: Fn(&TaskOutcome) + Sync,
    {
        let windows = &self.engine.config().windows;
        let tasks: Vec<(NaiveDate, u32)> = weeks
            .iter()
            .flat_map(|&week| windows.iter().map(move |&window| (week, window)))
            .collect();
        let total = tasks.len();

        let pool = rayon::ThreadPoolBuilder::new().num_threads(self.workers).build()?;
        info!("Running {} grid units on {} workers", total, pool.current_num_threads());

        let completed = AtomicUsize::new(0);
        let outcomes: Vec<TaskOutcome> = pool.install(|| {
            tasks
                .par_iter()
                .map(|&(week, window)| {
                    let outcome = TaskOutcome {
                        week,
                        window,
                        status: self.run_unit(week, window),
                    };
                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    match &outcome.status {
                        TaskStatus::Failed(e) => warn!("[{}/{}] fail {} w{}: {}", done, total, week, window, e),
                        TaskStatus::Skipped(reason) => info!("[{}/{}] skip {} w{}: {}", done, total, week, window, reason),
                        TaskStatus::Computed { .. } => info!("[{}/{}] grid {} w{}", done, total, week, window),
                    }
                    on_done(&outcome);
                    outcome
                })
                .collect()
        });

        let summary = ScheduleSummary::from_outcomes(&outcomes);
        info!(
            "Grid search done: {} computed, {} skipped, {} failed",
            summary.computed, summary.skipped, summary.failed
        );
        Ok(outcomes)
    }

    fn run_unit(&self, week: NaiveDate, window: u32) -> TaskStatus {
        let pair = &self.engine.config().pair;
        if !self.force && self.store.grid_file(pair, week, window).exists() {
            match self.store.load_cube(pair, week, window) {
                Ok(cube) if cube.config_hash == self.engine.config_hash() => {
                    return TaskStatus::Skipped("cube exists".to_string());
                }
                Ok(cube) => info!(
                    "{} w{}: cube built with config {}, recomputing for {}",
                    week,
                    window,
                    cube.config_hash,
                    self.engine.config_hash()
                ),
                Err(e) => warn!("{} w{}: unreadable cube, recomputing: {}", week, window, e),
            }
        }

        let result = self
            .engine
            .run_week(self.store, week, window)
            .and_then(|outcome| {
                self.engine.persist(self.store, &outcome)?;
                Ok(outcome)
            });

        match result {
            Ok(outcome) => TaskStatus::Computed {
                buy_trades: outcome.cube.total_trades(Side::Buy),
                sell_trades: outcome.cube.total_trades(Side::Sell),
            },
            Err(e) if e.is_missing_input() => TaskStatus::Skipped(e.to_string()),
            Err(e) => TaskStatus::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentConfig;
    use crate::data::format_digest_line;
    use crate::data::types::fixtures::row;
    use crate::walkforward::periods::previous_mondays;
    use std::fs;
    use std::sync::Mutex;

    fn week() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn write_week(store: &ArtifactStore, monday: NaiveDate, window: u32, lines: &[String]) {
        let path = store.digest_file("USDJPY", monday, window);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, lines.join("\n")).unwrap();
    }

    fn rows(window: u32) -> Vec<String> {
        (0..20)
            .map(|i| {
                let t = i * 1_000;
                let (a, pl) = if i % 2 == 0 { (1.0, 40.0) } else { (-1.0, -40.0) };
                format_digest_line(&row(t, a, a, 0.9, pl, -pl, t + 10), window)
            })
            .collect()
    }

    fn engine() -> GridSearchEngine {
        GridSearchEngine::new(ExperimentConfig {
            windows: vec![30_000, 60_000],
            train_weeks: 2,
            k: 3,
            ns_week: vec![4],
            thetas: vec![0.5],
            gamma: 10.0,
            spacing_ms: 0,
            min_trades: 1,
            ..ExperimentConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_isolates_failures_and_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        for monday in previous_mondays(week(), 2).into_iter().chain([week()]) {
            write_week(&store, monday, 60_000, &rows(60_000));
        }
        // Window 30000 has a DEV week only: TRAIN is empty.
        write_week(&store, week(), 30_000, &rows(30_000));
        // A later week whose DEV file is garbage under the abort policy.
        let engine = GridSearchEngine::new(ExperimentConfig {
            malformed_rows: crate::data::MalformedRowPolicy::Abort,
            ..engine().config().clone()
        })
        .unwrap();
        let bad_week = week() + chrono::Duration::weeks(1);
        write_week(&store, bad_week, 30_000, &["not,a,row".to_string()]);

        let seen = Mutex::new(0);
        let outcomes = GridScheduler::new(&engine, &store)
            .with_workers(2)
            .run(&[bad_week, week()], |_| *seen.lock().unwrap() += 1)
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), 4);
        assert_eq!(outcomes.len(), 4);
        // Task order: (bad_week, 30000), (bad_week, 60000), (week, 30000), (week, 60000).
        assert!(outcomes[0].is_failed());
        assert!(matches!(outcomes[1].status, TaskStatus::Skipped(_)));
        assert!(matches!(outcomes[2].status, TaskStatus::Skipped(_)));
        assert!(matches!(outcomes[3].status, TaskStatus::Computed { .. }));
        assert!(store.grid_file("USDJPY", week(), 60_000).exists());

        let summary = ScheduleSummary::from_outcomes(&outcomes);
        assert_eq!(summary, ScheduleSummary { computed: 1, skipped: 2, failed: 1 });

        // Second pass skips the existing cube unless forced.
        let again = GridScheduler::new(&engine, &store)
            .run(&[week()], |_| {})
            .unwrap();
        assert_eq!(again[1].status, TaskStatus::Skipped("cube exists".to_string()));

        let forced = GridScheduler::new(&engine, &store)
            .with_force(true)
            .run(&[week()], |_| {})
            .unwrap();
        assert!(matches!(forced[1].status, TaskStatus::Computed { .. }));
    }

    #[test]
    fn test_recomputes_cube_from_other_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        for monday in previous_mondays(week(), 2).into_iter().chain([week()]) {
            write_week(&store, monday, 60_000, &rows(60_000));
        }
        let first = engine();
        GridScheduler::new(&first, &store).run(&[week()], |_| {}).unwrap();

        let second = GridSearchEngine::new(ExperimentConfig {
            gamma: 0.0,
            ..first.config().clone()
        })
        .unwrap();
        assert_ne!(first.config_hash(), second.config_hash());

        let outcomes = GridScheduler::new(&second, &store).run(&[week()], |_| {}).unwrap();
        assert!(matches!(outcomes[1].status, TaskStatus::Computed { .. }));
        let cube = store.load_cube("USDJPY", week(), 60_000).unwrap();
        assert_eq!(cube.config_hash, second.config_hash());

        // Once current, the cube is reused.
        let again = GridScheduler::new(&second, &store).run(&[week()], |_| {}).unwrap();
        assert_eq!(again[1].status, TaskStatus::Skipped("cube exists".to_string()));

        // A truncated cube is recomputed rather than trusted.
        fs::write(store.grid_file("USDJPY", week(), 60_000), "{").unwrap();
        let repaired = GridScheduler::new(&second, &store).run(&[week()], |_| {}).unwrap();
        assert!(matches!(repaired[1].status, TaskStatus::Computed { .. }));
    }
}
