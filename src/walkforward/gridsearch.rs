//! Grid search over (N, θ) for one (week, window) unit.
//!
//! TRAIN is the concatenation of the preceding `train_weeks` weeks, DEV is
//! the week itself. Per side and per N, τ is calibrated on TRAIN, the vote
//! model is fitted on the kept TRAIN rows, and every θ is replayed over DEV.

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::cube::{CellMetrics, GridCube};
use super::periods::previous_mondays;
use crate::config::{ConfigError, ExperimentConfig};
use crate::data::{ArtifactStore, DigestOptions, DigestRow, Side, StoreError, TradeRecord};
use crate::knn::{ModelError, NeighborScore, NeighborVoteModel, ThresholdCalibrator};
use crate::metrics::MetricsCalculator;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("No TRAIN rows for week {week} window {window}")]
    EmptyTrain { week: NaiveDate, window: u32 },

    #[error("No DEV rows for week {week} window {window}")]
    EmptyDev { week: NaiveDate, window: u32 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl GridError {
    /// Missing input rather than a malfunction.
    pub fn is_missing_input(&self) -> bool {
        matches!(self, Self::EmptyTrain { .. } | Self::EmptyDev { .. })
    }
}

/// Standardizes (a, b) with TRAIN statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureScaler {
    mean: [f64; 2],
    std: [f64; 2],
}

impl FeatureScaler {
    /// Mean and population std of TRAIN; a zero std becomes 1.
    pub fn fit(rows: &[DigestRow]) -> Self {
        let mut mean = [0.0; 2];
        let mut std = [1.0; 2];
        if rows.is_empty() {
            return Self { mean, std };
        }

        let n = rows.len() as f64;
        for axis in 0..2 {
            let m = rows.iter().map(|r| r.point()[axis]).sum::<f64>() / n;
            let var = rows.iter().map(|r| (r.point()[axis] - m).powi(2)).sum::<f64>() / n;
            let s = var.sqrt();
            mean[axis] = m;
            std[axis] = if s > 0.0 { s } else { 1.0 };
        }
        Self { mean, std }
    }

    pub fn transform(&self, row: &DigestRow) -> [f64; 2] {
        let p = row.point();
        [
            (p[0] - self.mean[0]) / self.std[0],
            (p[1] - self.mean[1]) / self.std[1],
        ]
    }
}

/// Why a DEV row did or did not trade in one (side, N, θ) replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    BelowTau,
    Spacing,
    LowConfidence,
    BelowTheta,
    Executed,
    /// τ calibration could not reach N rows; nothing was replayed.
    Degraded,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BelowTau => "below_tau",
            Self::Spacing => "spacing",
            Self::LowConfidence => "low_confidence",
            Self::BelowTheta => "below_theta",
            Self::Executed => "executed",
            Self::Degraded => "degraded",
        }
    }
}

/// One replay decision. Vote fields are zero unless this decision scored the row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuditRow {
    pub side: Side,
    pub n: usize,
    pub theta: f64,
    pub tau: f64,
    pub time_ms: i64,
    pub verdict: Verdict,
    pub cv: f64,
    pub wins: u32,
    pub draws: u32,
    pub losses: u32,
    pub edge: f64,
    pub signal: f64,
}

impl AuditRow {
    fn new(side: Side, n: usize, theta: f64, tau: f64, time_ms: i64, verdict: Verdict, score: Option<&NeighborScore>) -> Self {
        let (cv, wins, draws, losses, edge, signal) = match score {
            Some(s) => {
                let v = s.side(side);
                (s.cv, v.wins as u32, v.draws as u32, v.losses as u32, v.edge, v.signal)
            }
            None => (0.0, 0, 0, 0, 0.0, 0.0),
        };
        Self {
            side,
            n,
            theta,
            tau,
            time_ms,
            verdict,
            cv,
            wins,
            draws,
            losses,
            edge,
            signal,
        }
    }
}

/// Executed DEV trades of one (side, N, θ) cell.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeStream {
    pub side: Side,
    pub n: usize,
    pub theta: f64,
    pub trades: Vec<TradeRecord>,
}

/// Everything one grid unit produces.
#[derive(Debug, Clone)]
pub struct GridOutcome {
    pub cube: GridCube,
    pub streams: Vec<TradeStream>,
    pub audit: Vec<AuditRow>,
}

/// Grid search engine for one experiment configuration.
pub struct GridSearchEngine {
    config: ExperimentConfig,
    config_hash: String,
    calibrator: ThresholdCalibrator,
}

impl GridSearchEngine {
    pub fn new(config: ExperimentConfig) -> Result<Self, GridError> {
        let config_hash = config.content_hash()?;
        let calibrator = ThresholdCalibrator::from_config(&config);
        Ok(Self {
            config,
            config_hash,
            calibrator,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    /// Load TRAIN and DEV rows for `week` and run the grid.
    pub fn run_week(&self, store: &ArtifactStore, week: NaiveDate, window: u32) -> Result<GridOutcome, GridError> {
        let options = DigestOptions {
            policy: self.config.malformed_rows,
            time_base: self.config.time_base,
        };
        let pair = &self.config.pair;

        let train_weeks = previous_mondays(week, self.config.train_weeks);
        let train = store.load_weeks(pair, &train_weeks, window, options)?;
        let dev = match store.load_week(pair, week, window, options) {
            Ok(rows) => rows,
            Err(StoreError::FileNotFound(_)) => vec![],
            Err(e) => return Err(e.into()),
        };
        debug!(
            "{} window {}: {} TRAIN rows from {} weeks, {} DEV rows",
            week,
            window,
            train.len(),
            train_weeks.len(),
            dev.len()
        );

        self.run(&train, &dev, week, window)
    }

    /// Run the grid on preloaded, time-sorted TRAIN and DEV rows.
    pub fn run(&self, train: &[DigestRow], dev: &[DigestRow], week: NaiveDate, window: u32) -> Result<GridOutcome, GridError> {
        if train.is_empty() {
            return Err(GridError::EmptyTrain { week, window });
        }
        if dev.is_empty() {
            return Err(GridError::EmptyDev { week, window });
        }

        let scaler = FeatureScaler::fit(train);
        let train_points: Vec<[f64; 2]> = train.iter().map(|r| scaler.transform(r)).collect();
        let dev_points: Vec<[f64; 2]> = dev.iter().map(|r| scaler.transform(r)).collect();

        let ns = self.config.effective_ns();
        let thetas = self.config.thetas.clone();
        let mut cube = GridCube::new(&self.config.pair, window, week, &self.config_hash, ns.clone(), thetas.clone());
        let mut streams = Vec::with_capacity(2 * ns.len() * thetas.len());
        let mut audit = Vec::new();

        for side in Side::ALL {
            for (i_n, &n) in ns.iter().enumerate() {
                let calibration = self.calibrator.calibrate(train, n, side);
                let tau = calibration.tau;

                if calibration.degraded || calibration.kept.is_empty() {
                    warn!(
                        "{} window {} {} N={}: only {} TRAIN rows reachable, cells zeroed",
                        week,
                        window,
                        side,
                        n,
                        calibration.kept_count()
                    );
                    for (j_t, &theta) in thetas.iter().enumerate() {
                        cube.set(side, i_n, j_t, CellMetrics::empty(tau));
                        streams.push(TradeStream {
                            side,
                            n,
                            theta,
                            trades: vec![],
                        });
                        audit.extend(
                            dev.iter()
                                .map(|row| AuditRow::new(side, n, theta, tau, row.time_ms, Verdict::Degraded, None)),
                        );
                    }
                    continue;
                }

                let mut model = NeighborVoteModel::from_config(&self.config);
                model.fit(
                    calibration.kept.iter().map(|&i| train_points[i]).collect(),
                    calibration.kept.iter().map(|&i| (train[i].buy_pl, train[i].sell_pl)).collect(),
                )?;

                // Scores depend on the row only, so each is computed once per (side, N).
                let mut scores: Vec<Option<NeighborScore>> = vec![None; dev.len()];

                for (j_t, &theta) in thetas.iter().enumerate() {
                    let mut trades = Vec::new();
                    let mut last_exit: Option<i64> = None;

                    for (idx, row) in dev.iter().enumerate() {
                        let (verdict, scored) = if row.r2 < tau {
                            (Verdict::BelowTau, None)
                        } else if last_exit.map_or(false, |exit| row.time_ms < exit.saturating_add(self.config.spacing_ms)) {
                            (Verdict::Spacing, None)
                        } else {
                            let score = match scores[idx] {
                                Some(s) => s,
                                None => {
                                    let s = model.score(dev_points[idx])?;
                                    scores[idx] = Some(s);
                                    s
                                }
                            };
                            let verdict = if !score.passes_gate() {
                                Verdict::LowConfidence
                            } else if !score.tradeable(side, theta) {
                                Verdict::BelowTheta
                            } else {
                                Verdict::Executed
                            };
                            (verdict, Some(score))
                        };

                        if verdict == Verdict::Executed {
                            trades.push(TradeRecord::from_row(row, side));
                            last_exit = Some(row.exit(side));
                        }
                        audit.push(AuditRow::new(side, n, theta, tau, row.time_ms, verdict, scored.as_ref()));
                    }

                    let pls: Vec<f64> = trades.iter().map(|t| t.pl).collect();
                    let stats = MetricsCalculator::trade_stats(&pls, self.config.min_trades);
                    cube.set(side, i_n, j_t, CellMetrics::from_stats(&stats, tau));
                    streams.push(TradeStream {
                        side,
                        n,
                        theta,
                        trades,
                    });
                }
            }
        }

        Ok(GridOutcome { cube, streams, audit })
    }

    /// Write trade streams and the audit trail, then the cube.
    ///
    /// The cube goes last: its presence marks the unit as complete.
    pub fn persist(&self, store: &ArtifactStore, outcome: &GridOutcome) -> Result<(), GridError> {
        let cube = &outcome.cube;
        for stream in &outcome.streams {
            let path = store.trade_file(&cube.pair, cube.week, cube.window, stream.side, stream.n, stream.theta);
            store.save_trades(&path, &stream.trades)?;
        }
        store.save_audit(&store.audit_file(&cube.pair, cube.week, cube.window), &outcome.audit)?;
        let path = store.save_cube(cube)?;
        info!(
            "Grid {} window {}: {} buy / {} sell DEV trades -> {}",
            cube.week,
            cube.window,
            cube.total_trades(Side::Buy),
            cube.total_trades(Side::Sell),
            path.display()
        );
        Ok(())
    }
}
