//! Cross-week parameter selection.
//!
//! For a TEST week X and a window, the cubes of the `dev_weeks` Mondays
//! before X are combined into one weighted t-statistic per (side, N, θ):
//!
//! ```text
//! score(N, θ) = Σ tstat·sqrt(trades) / Σ sqrt(trades)
//! ```
//!
//! summed over the weeks in which the cell met the minimum-trade bar. The
//! best cell of the better side wins, and τ is read from X's own cube, which
//! was calibrated on TRAIN weeks before X only.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::cube::GridCube;
use super::periods::previous_mondays;
use crate::config::{ConfigError, ExperimentConfig, ParameterUniverse};
use crate::data::{ArtifactStore, Side, StoreError};

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("No DEV cubes before week {week} for window {window}")]
    NoDevCubes { week: NaiveDate, window: u32 },

    #[error("Missing TEST cube for week {week} window {window}")]
    MissingTestCube { week: NaiveDate, window: u32 },

    #[error("Cube {week} window {window} does not match the configured parameter grid")]
    UniverseMismatch { week: NaiveDate, window: u32 },

    #[error("Cube {week} window {window} was built with config {found}, expected {expected}")]
    StaleCube {
        week: NaiveDate,
        window: u32,
        found: String,
        expected: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Chosen parameters for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub window: u32,
    pub side: Side,
    #[serde(rename = "N")]
    pub n: usize,
    pub theta: f64,
    pub tau: f64,
}

/// Parameters chosen for one TEST week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterManifest {
    pub week: NaiveDate,
    pub config_hash: String,
    pub windows: Vec<ManifestEntry>,
}

/// Winning cell of a weighted score grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellChoice {
    pub side: Side,
    pub i_n: usize,
    pub j_theta: usize,
    pub score: f64,
}

/// Weighted t-statistic per (N, θ) for one side.
///
/// `None` marks a cell that met the minimum-trade bar in no cube.
pub fn weighted_scores(cubes: &[GridCube], side: Side, min_trades: usize) -> Vec<Vec<Option<f64>>> {
    let Some(first) = cubes.first() else {
        return vec![];
    };
    let rows = first.ns.len();
    let cols = first.thetas.len();
    let mut sums = vec![vec![(0.0_f64, 0.0_f64); cols]; rows];

    for cube in cubes {
        for (i, row) in cube.side(side).iter().enumerate().take(rows) {
            for (j, cell) in row.iter().enumerate().take(cols) {
                if cell.is_reliable(min_trades) {
                    let w = (cell.trades as f64).sqrt();
                    sums[i][j].0 += cell.tstat * w;
                    sums[i][j].1 += w;
                }
            }
        }
    }

    sums.into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(num, den)| if den > 0.0 { Some(num / den) } else { None })
                .collect()
        })
        .collect()
}

/// Highest populated cell; ties keep the first in row-major order.
pub fn best_cell(scores: &[Vec<Option<f64>>], side: Side) -> Option<CellChoice> {
    let mut best: Option<CellChoice> = None;
    for (i_n, row) in scores.iter().enumerate() {
        for (j_theta, score) in row.iter().enumerate() {
            let Some(score) = *score else { continue };
            if best.map_or(true, |b| score > b.score) {
                best = Some(CellChoice {
                    side,
                    i_n,
                    j_theta,
                    score,
                });
            }
        }
    }
    best
}

/// Best cell across both sides; buy wins ties.
pub fn choose(dev_cubes: &[GridCube], min_trades: usize) -> Option<CellChoice> {
    Side::ALL
        .iter()
        .filter_map(|&side| best_cell(&weighted_scores(dev_cubes, side, min_trades), side))
        .fold(None, |acc: Option<CellChoice>, c| match acc {
            Some(a) if a.score >= c.score => Some(a),
            _ => Some(c),
        })
}

pub struct ParameterSelector {
    config: ExperimentConfig,
    config_hash: String,
    universe: ParameterUniverse,
}

impl ParameterSelector {
    pub fn new(config: ExperimentConfig) -> Result<Self, SelectionError> {
        let config_hash = config.content_hash()?;
        let universe = config.universe();
        Ok(Self {
            config,
            config_hash,
            universe,
        })
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    /// Build the manifest of `test_week` from the cubes already on disk.
    pub fn select_week(&self, store: &ArtifactStore, test_week: NaiveDate) -> Result<ParameterManifest, SelectionError> {
        let pair = &self.config.pair;
        let dev_weeks = previous_mondays(test_week, self.config.dev_weeks);
        let mut entries = Vec::with_capacity(self.config.windows.len());

        for &window in &self.config.windows {
            let mut dev_cubes = Vec::with_capacity(dev_weeks.len());
            for &dev_week in &dev_weeks {
                match store.load_cube(pair, dev_week, window) {
                    Ok(cube) => dev_cubes.push(self.checked(cube)?),
                    Err(StoreError::FileNotFound(_)) => {
                        warn!("{} window {}: no DEV cube for {}", test_week, window, dev_week)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if dev_cubes.is_empty() {
                return Err(SelectionError::NoDevCubes { week: test_week, window });
            }

            let test_cube = match store.load_cube(pair, test_week, window) {
                Ok(cube) => self.checked(cube)?,
                Err(StoreError::FileNotFound(_)) => {
                    return Err(SelectionError::MissingTestCube { week: test_week, window })
                }
                Err(e) => return Err(e.into()),
            };

            match self.select_window(&dev_cubes, &test_cube) {
                Some(entry) => entries.push(entry),
                None => warn!(
                    "{} window {}: no reliable cell in {} DEV cubes, window omitted",
                    test_week,
                    window,
                    dev_cubes.len()
                ),
            }
        }

        Ok(ParameterManifest {
            week: test_week,
            config_hash: self.config_hash.clone(),
            windows: entries,
        })
    }

    /// Pick (side, N, θ) from DEV cubes and read τ from the TEST cube.
    pub fn select_window(&self, dev_cubes: &[GridCube], test_cube: &GridCube) -> Option<ManifestEntry> {
        let choice = choose(dev_cubes, self.config.min_trades)?;
        let tau = test_cube.cell(choice.side, choice.i_n, choice.j_theta)?.tau;
        let entry = ManifestEntry {
            window: test_cube.window,
            side: choice.side,
            n: *test_cube.ns.get(choice.i_n)?,
            theta: *test_cube.thetas.get(choice.j_theta)?,
            tau,
        };
        debug!(
            "{} window {}: {} N={} theta={} score {:.3} tau {:.4}",
            test_cube.week, entry.window, entry.side, entry.n, entry.theta, choice.score, entry.tau
        );
        Some(entry)
    }

    /// Select and persist manifests for each TEST week.
    pub fn run(
        &self,
        store: &ArtifactStore,
        test_weeks: &[NaiveDate],
    ) -> Vec<(NaiveDate, Result<ParameterManifest, SelectionError>)> {
        test_weeks
            .iter()
            .map(|&week| {
                let result = self.select_week(store, week).and_then(|manifest| {
                    let path = store.save_manifest(&self.config.pair, &manifest)?;
                    info!("Params {}: {} windows -> {}", week, manifest.windows.len(), path.display());
                    Ok(manifest)
                });
                if let Err(e) = &result {
                    warn!("Selection failed for {}: {}", week, e);
                }
                (week, result)
            })
            .collect()
    }

    fn checked(&self, cube: GridCube) -> Result<GridCube, SelectionError> {
        if !cube.matches_universe(&self.universe) {
            return Err(SelectionError::UniverseMismatch {
                week: cube.week,
                window: cube.window,
            });
        }
        if cube.config_hash != self.config_hash {
            return Err(SelectionError::StaleCube {
                week: cube.week,
                window: cube.window,
                found: cube.config_hash,
                expected: self.config_hash.clone(),
            });
        }
        Ok(cube)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walkforward::cube::CellMetrics;
    use approx::assert_relative_eq;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn config() -> ExperimentConfig {
        ExperimentConfig {
            windows: vec![60_000],
            train_weeks: 1,
            dev_weeks: 2,
            ns_week: vec![10, 20],
            thetas: vec![0.1, 0.2],
            min_trades: 5,
            ..ExperimentConfig::default()
        }
    }

    fn cell(trades: usize, tstat: f64, tau: f64) -> CellMetrics {
        CellMetrics {
            trades,
            mean: 1.0,
            std: 1.0,
            tstat,
            tau,
        }
    }

    fn cube(week: NaiveDate) -> GridCube {
        let c = config();
        GridCube::new(&c.pair, 60_000, week, &c.content_hash().unwrap(), c.effective_ns(), c.thetas.clone())
    }

    #[test]
    fn test_weighted_example() {
        let mut w1 = cube(d(2024, 2, 19));
        let mut w2 = cube(d(2024, 2, 26));
        w1.set(Side::Buy, 0, 1, cell(9, 2.0, 0.9));
        w2.set(Side::Buy, 0, 1, cell(16, 3.0, 0.9));
        // Competitor: higher single-week t-stat but lower weighted score.
        w1.set(Side::Buy, 1, 0, cell(25, 2.5, 0.9));

        let scores = weighted_scores(&[w1.clone(), w2.clone()], Side::Buy, 5);
        assert_relative_eq!(scores[0][1].unwrap(), 18.0 / 7.0, epsilon = 1e-12);
        assert_relative_eq!(scores[1][0].unwrap(), 2.5, epsilon = 1e-12);
        assert_eq!(scores[0][0], None);

        let choice = choose(&[w1, w2], 5).unwrap();
        assert_eq!((choice.side, choice.i_n, choice.j_theta), (Side::Buy, 0, 1));
        assert_relative_eq!(choice.score, 2.571, epsilon = 1e-3);
    }

    #[test]
    fn test_unreliable_cells_are_ignored() {
        let mut w = cube(d(2024, 2, 26));
        w.set(Side::Sell, 0, 0, cell(4, 9.0, 0.9));
        w.set(Side::Sell, 1, 1, cell(5, 1.0, 0.9));
        let choice = choose(&[w], 5).unwrap();
        assert_eq!((choice.side, choice.i_n, choice.j_theta), (Side::Sell, 1, 1));

        assert!(choose(&[cube(d(2024, 2, 26))], 5).is_none());
    }

    #[test]
    fn test_negative_scores_still_selectable() {
        // Populated cells compete even when every score is negative.
        let mut w = cube(d(2024, 2, 26));
        w.set(Side::Buy, 1, 1, cell(9, -1.5, 0.9));
        let choice = choose(&[w], 5).unwrap();
        assert_eq!((choice.i_n, choice.j_theta), (1, 1));
        assert_relative_eq!(choice.score, -1.5);
    }

    #[test]
    fn test_ties_prefer_buy_and_row_major() {
        let mut w = cube(d(2024, 2, 26));
        w.set(Side::Buy, 1, 0, cell(9, 2.0, 0.9));
        w.set(Side::Buy, 0, 1, cell(9, 2.0, 0.9));
        w.set(Side::Sell, 0, 0, cell(9, 2.0, 0.9));
        let choice = choose(&[w], 5).unwrap();
        assert_eq!((choice.side, choice.i_n, choice.j_theta), (Side::Buy, 0, 1));
    }

    #[test]
    fn test_select_week_reads_tau_from_test_cube() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let test_week = d(2024, 3, 4);

        let mut dev = cube(d(2024, 2, 26));
        dev.set(Side::Sell, 1, 0, cell(12, 2.2, 0.80));
        store.save_cube(&dev).unwrap();
        // Earlier DEV week missing: logged and skipped.

        let mut test = cube(test_week);
        test.set(Side::Sell, 1, 0, cell(0, 0.0, 0.95));
        // A strong cell in the TEST week itself must not influence the choice.
        test.set(Side::Buy, 0, 0, cell(50, 9.0, 0.70));
        store.save_cube(&test).unwrap();

        let selector = ParameterSelector::new(config()).unwrap();
        let manifest = selector.select_week(&store, test_week).unwrap();
        assert_eq!(manifest.week, test_week);
        assert_eq!(manifest.config_hash, selector.config_hash());
        assert_eq!(
            manifest.windows,
            vec![ManifestEntry {
                window: 60_000,
                side: Side::Sell,
                n: 20,
                theta: 0.1,
                tau: 0.95,
            }]
        );

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["windows"][0]["N"], 20);
        assert_eq!(json["windows"][0]["side"], "sell");
    }

    #[test]
    fn test_select_week_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let selector = ParameterSelector::new(config()).unwrap();
        let test_week = d(2024, 3, 4);

        assert!(matches!(
            selector.select_week(&store, test_week),
            Err(SelectionError::NoDevCubes { window: 60_000, .. })
        ));

        store.save_cube(&cube(d(2024, 2, 26))).unwrap();
        assert!(matches!(
            selector.select_week(&store, test_week),
            Err(SelectionError::MissingTestCube { .. })
        ));

        // DEV cubes with nothing reliable: the window is omitted.
        store.save_cube(&cube(test_week)).unwrap();
        let manifest = selector.select_week(&store, test_week).unwrap();
        assert!(manifest.windows.is_empty());

        let mut drifted = cube(d(2024, 2, 19));
        drifted.thetas = vec![0.5, 0.6];
        store.save_cube(&drifted).unwrap();
        assert!(matches!(
            selector.select_week(&store, test_week),
            Err(SelectionError::UniverseMismatch { .. })
        ));
    }

    #[test]
    fn test_stale_cube_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let test_week = d(2024, 3, 4);

        let mut dev = cube(d(2024, 2, 26));
        dev.set(Side::Sell, 1, 0, cell(12, 2.2, 0.80));
        store.save_cube(&dev).unwrap();
        let mut test = cube(test_week);
        test.config_hash = "0123456789abcdef".to_string();
        store.save_cube(&test).unwrap();

        let selector = ParameterSelector::new(config()).unwrap();
        match selector.select_week(&store, test_week) {
            Err(SelectionError::StaleCube { week, found, expected, .. }) => {
                assert_eq!(week, test_week);
                assert_eq!(found, "0123456789abcdef");
                assert_eq!(expected, selector.config_hash());
            }
            other => panic!("expected a stale cube error, got {:?}", other),
        }
        assert!(!store.params_file("USDJPY", test_week).exists());
        let results = selector.run(&store, &[test_week]);
        assert!(matches!(results[0].1, Err(SelectionError::StaleCube { .. })));
        assert!(!store.params_file("USDJPY", test_week).exists());
    }
}
