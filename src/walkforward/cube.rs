//! Metric cube of one (week, window) grid unit.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::ParameterUniverse;
use crate::data::Side;
use crate::metrics::TradeStats;

/// Stored metrics of one (side, N, θ) cell.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CellMetrics {
    pub trades: usize,
    pub mean: f64,
    pub std: f64,
    pub tstat: f64,
    pub tau: f64,
}

impl CellMetrics {
    pub fn from_stats(stats: &TradeStats, tau: f64) -> Self {
        Self {
            trades: stats.trades,
            mean: stats.mean,
            std: stats.std,
            tstat: stats.tstat,
            tau,
        }
    }

    /// Zero metrics that still record the calibrated τ.
    pub fn empty(tau: f64) -> Self {
        Self {
            tau,
            ..Self::default()
        }
    }

    pub fn is_reliable(&self, min_trades: usize) -> bool {
        self.trades > 0 && self.trades >= min_trades
    }
}

/// Dense `[N][θ]` metrics for both sides of one (pair, window, week).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridCube {
    pub pair: String,
    pub window: u32,
    pub week: NaiveDate,
    pub config_hash: String,
    /// Effective calibration targets, row axis.
    pub ns: Vec<usize>,
    /// Decision thresholds, column axis.
    pub thetas: Vec<f64>,
    pub buy: Vec<Vec<CellMetrics>>,
    pub sell: Vec<Vec<CellMetrics>>,
}

impl GridCube {
    /// Zero-filled cube for the given axes.
    pub fn new(
        pair: &str,
        window: u32,
        week: NaiveDate,
        config_hash: &str,
        ns: Vec<usize>,
        thetas: Vec<f64>,
    ) -> Self {
        let blank = vec![vec![CellMetrics::default(); thetas.len()]; ns.len()];
        Self {
            pair: pair.to_string(),
            window,
            week,
            config_hash: config_hash.to_string(),
            ns,
            thetas,
            buy: blank.clone(),
            sell: blank,
        }
    }

    pub fn side(&self, side: Side) -> &[Vec<CellMetrics>] {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }

    pub fn cell(&self, side: Side, i_n: usize, j_theta: usize) -> Option<&CellMetrics> {
        self.side(side).get(i_n).and_then(|row| row.get(j_theta))
    }

    pub fn set(&mut self, side: Side, i_n: usize, j_theta: usize, metrics: CellMetrics) {
        let grid = match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        };
        if let Some(cell) = grid.get_mut(i_n).and_then(|row| row.get_mut(j_theta)) {
            *cell = metrics;
        }
    }

    /// Whether the cube axes are those of `universe` for this cube's window.
    pub fn matches_universe(&self, universe: &ParameterUniverse) -> bool {
        universe.windows.contains(&self.window)
            && self.ns == universe.ns
            && self.thetas.len() == universe.thetas.len()
            && self
                .thetas
                .iter()
                .zip(&universe.thetas)
                .all(|(a, b)| (a - b).abs() < 1e-12)
    }

    pub fn total_trades(&self, side: Side) -> usize {
        self.side(side).iter().flatten().map(|c| c.trades).sum()
    }
}
