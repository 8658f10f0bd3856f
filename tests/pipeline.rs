//! End-to-end grid -> select -> evaluate over synthetic digest weeks.

use std::fs;

use chrono::NaiveDate;
use knn_walkforward::data::format_digest_line;
use knn_walkforward::walkforward::{
    EvalError, GridScheduler, GridSearchEngine, ParameterSelector, ScheduleSummary, SelectionError,
    WalkForwardEvaluator, WeeklySplits,
};
use knn_walkforward::{ArtifactStore, DigestRow, ExperimentConfig, MetricsCalculator};

const WINDOW: u32 = 60_000;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn config() -> ExperimentConfig {
    ExperimentConfig {
        windows: vec![WINDOW],
        train_weeks: 2,
        dev_weeks: 2,
        test_weeks: 2,
        k: 3,
        ns_week: vec![4],
        thetas: vec![0.5, 0.9],
        gamma: 10.0,
        pl_limit: 20.0,
        spacing_ms: 0,
        spacing_buffer_ms: 0,
        min_trades: 1,
        workers: 2,
        ..ExperimentConfig::default()
    }
}

/// Two pure clusters: buys win near (1, 1), sells win near (-1, -1).
fn week_rows(corrupt: bool) -> Vec<DigestRow> {
    (0..20)
        .map(|i: i64| {
            let t = i * 1_000;
            let pl = 30.0 + (i % 3) as f64 * 10.0;
            let (a, buy_pl, sell_pl) = if i % 2 == 0 { (1.0, pl, -pl) } else { (-1.0, -pl, pl) };
            let (a, buy_pl, sell_pl, r2) = if corrupt {
                (-a * 3.0, -buy_pl, -sell_pl, 0.3)
            } else {
                (a, buy_pl, sell_pl, 0.9)
            };
            DigestRow {
                time_ms: t,
                a,
                b: a,
                c: 0.0,
                r2,
                buy_pl,
                sell_pl,
                buy_exit: t + 10,
                sell_exit: t + 10,
                buy_no_hit: false,
                sell_no_hit: false,
            }
        })
        .collect()
}

fn write_week(store: &ArtifactStore, monday: NaiveDate, rows: &[DigestRow]) {
    let path = store.digest_file("USDJPY", monday, WINDOW);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let lines: Vec<String> = rows.iter().map(|r| format_digest_line(r, WINDOW)).collect();
    fs::write(path, lines.join("\n")).unwrap();
}

/// Six weeks of history ending at the last TEST week, 2024-03-04.
fn seed(store: &ArtifactStore, corrupt_from: Option<NaiveDate>) {
    let mondays = [
        d(2024, 1, 29),
        d(2024, 2, 5),
        d(2024, 2, 12),
        d(2024, 2, 19),
        d(2024, 2, 26),
        d(2024, 3, 4),
    ];
    for monday in mondays {
        let corrupt = corrupt_from.map_or(false, |c| monday >= c);
        write_week(store, monday, &week_rows(corrupt));
    }
}

fn splits() -> WeeklySplits {
    WeeklySplits::new((&config()).into(), d(2024, 3, 4))
}

fn grid(store: &ArtifactStore) {
    let engine = GridSearchEngine::new(config()).unwrap();
    let outcomes = GridScheduler::new(&engine, store)
        .run(&splits().grid_weeks(), |_| {})
        .unwrap();
    assert_eq!(
        ScheduleSummary::from_outcomes(&outcomes),
        ScheduleSummary {
            computed: 4,
            skipped: 0,
            failed: 0
        }
    );
}

#[test]
fn test_full_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    seed(&store, None);

    grid(&store);
    assert_eq!(splits().test_weeks(), vec![d(2024, 2, 26), d(2024, 3, 4)]);

    let selector = ParameterSelector::new(config()).unwrap();
    let manifests = selector.run(&store, &splits().test_weeks());
    for (week, result) in &manifests {
        let manifest = result.as_ref().unwrap();
        assert_eq!(manifest.week, *week);
        assert_eq!(manifest.windows.len(), 1);
        let entry = &manifest.windows[0];
        assert_eq!(entry.window, WINDOW);
        assert_eq!(entry.n, 8);
        // Both θ trade every row of a pure cluster: the tie keeps the first.
        assert_eq!(entry.theta, 0.5);
        assert_eq!(entry.tau, 0.9);
        assert!(store.params_file("USDJPY", *week).exists());
    }

    let evaluator = WalkForwardEvaluator::new(config()).unwrap();
    let results = evaluator.run(&store, &splits().test_weeks());
    let summaries: Vec<_> = results.into_iter().map(|(_, r)| r.unwrap()).collect();
    for summary in &summaries {
        assert_eq!(summary.trades, 10);
        assert!(summary.pnl > 0.0);
        assert_eq!(summary.config_hash, config().content_hash().unwrap());
    }

    let report = MetricsCalculator::evaluation_report(&summaries);
    assert_eq!(report.weeks, 2);
    assert_eq!(report.total_trades, 20);
    assert_eq!(report.winning_weeks, 2);
    assert_eq!(report.drawdown.max_drawdown, 0.0);
}

#[test]
fn test_manifest_ignores_test_week_and_later_data() {
    let clean_dir = tempfile::tempdir().unwrap();
    let clean = ArtifactStore::new(clean_dir.path());
    seed(&clean, None);
    grid(&clean);

    let corrupt_dir = tempfile::tempdir().unwrap();
    let corrupt = ArtifactStore::new(corrupt_dir.path());
    seed(&corrupt, Some(d(2024, 3, 4)));
    grid(&corrupt);

    let selector = ParameterSelector::new(config()).unwrap();
    let test_week = d(2024, 3, 4);
    let a = selector.select_week(&clean, test_week).unwrap();
    let b = selector.select_week(&corrupt, test_week).unwrap();
    assert_eq!(a, b);

    // The corrupted week's own outcomes differ, so the check is not vacuous.
    let clean_cube = clean.load_cube("USDJPY", test_week, WINDOW).unwrap();
    let corrupt_cube = corrupt.load_cube("USDJPY", test_week, WINDOW).unwrap();
    assert_ne!(clean_cube.buy, corrupt_cube.buy);
}

#[test]
fn test_changed_parameters_never_reuse_old_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    seed(&store, None);
    grid(&store);
    let weeks = splits().test_weeks();
    ParameterSelector::new(config()).unwrap().run(&store, &weeks);

    let retuned = ExperimentConfig {
        gamma: 0.0,
        ..config()
    };
    let selector = ParameterSelector::new(retuned.clone()).unwrap();
    for (_, result) in selector.run(&store, &weeks) {
        assert!(matches!(result, Err(SelectionError::StaleCube { .. })));
    }
    let evaluator = WalkForwardEvaluator::new(retuned.clone()).unwrap();
    for (_, result) in evaluator.run(&store, &weeks) {
        assert!(matches!(result, Err(EvalError::StaleManifest { .. })));
    }

    // A plain rerun recomputes every cube built under the old parameters.
    let engine = GridSearchEngine::new(retuned.clone()).unwrap();
    let outcomes = GridScheduler::new(&engine, &store)
        .run(&splits().grid_weeks(), |_| {})
        .unwrap();
    assert_eq!(ScheduleSummary::from_outcomes(&outcomes).computed, 4);
    for week in splits().grid_weeks() {
        let cube = store.load_cube("USDJPY", week, WINDOW).unwrap();
        assert_eq!(cube.config_hash, retuned.content_hash().unwrap());
    }

    for (_, result) in selector.run(&store, &weeks) {
        assert_eq!(result.unwrap().config_hash, retuned.content_hash().unwrap());
    }
    for (_, result) in evaluator.run(&store, &weeks) {
        assert!(result.is_ok());
    }
}
