//! R² threshold calibration under a time-spacing rule.
//!
//! For one side, a row survives threshold τ when `r2 >= τ` and it enters no
//! earlier than `spacing_ms` after the exit of the previously kept row.
//! The calibrator finds the largest τ whose survivor count still reaches a
//! target population size.

use tracing::debug;

use crate::config::ExperimentConfig;
use crate::data::{DigestRow, Side};

/// Result of one calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    /// Selected R² threshold.
    pub tau: f64,
    /// Indices of kept rows, in time order, at most the target count.
    pub kept: Vec<usize>,
    /// The target was unreachable even at τ = 0; `kept` is best effort.
    pub degraded: bool,
}

impl Calibration {
    pub fn kept_count(&self) -> usize {
        self.kept.len()
    }
}

/// Binary-search calibrator with a fixed iteration budget.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdCalibrator {
    spacing_ms: i64,
    iterations: u32,
}

impl ThresholdCalibrator {
    pub fn new(spacing_ms: i64, iterations: u32) -> Self {
        Self {
            spacing_ms,
            iterations,
        }
    }

    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self::new(config.spacing_ms, config.calibration_iters)
    }

    /// Number of rows surviving `tau`, stopping once `cap` is reached.
    ///
    /// Non-increasing in `tau` whenever exits are non-decreasing in entry
    /// time, which is the shape of rows produced with a fixed horizon.
    pub fn count_with_tau(&self, rows: &[DigestRow], side: Side, tau: f64, cap: usize) -> usize {
        self.scan(rows, side, tau, cap, |_| {})
    }

    /// Indices of the rows surviving `tau`, at most `cap` of them.
    pub fn kept_with_tau(&self, rows: &[DigestRow], side: Side, tau: f64, cap: usize) -> Vec<usize> {
        let mut kept = Vec::with_capacity(cap.min(rows.len()));
        self.scan(rows, side, tau, cap, |i| kept.push(i));
        kept
    }

    fn scan(&self, rows: &[DigestRow], side: Side, tau: f64, cap: usize, mut keep: impl FnMut(usize)) -> usize {
        let mut last_exit: Option<i64> = None;
        let mut count = 0;
        for (i, row) in rows.iter().enumerate() {
            if count >= cap {
                break;
            }
            if row.r2 < tau {
                continue;
            }
            if last_exit.map_or(true, |exit| row.time_ms >= exit.saturating_add(self.spacing_ms)) {
                keep(i);
                count += 1;
                last_exit = Some(row.exit(side));
            }
        }
        count
    }

    /// Largest τ keeping at least `n_target` rows for `side`.
    ///
    /// `rows` must be sorted by `time_ms`.
    pub fn calibrate(&self, rows: &[DigestRow], n_target: usize, side: Side) -> Calibration {
        if rows.is_empty() || n_target == 0 {
            return Calibration {
                tau: 0.0,
                kept: vec![],
                degraded: n_target > 0,
            };
        }

        let max_r2 = rows.iter().map(|r| r.r2).fold(0.0, f64::max);
        if self.count_with_tau(rows, side, max_r2, n_target) >= n_target {
            return Calibration {
                tau: max_r2,
                kept: self.kept_with_tau(rows, side, max_r2, n_target),
                degraded: false,
            };
        }

        if self.count_with_tau(rows, side, 0.0, n_target) < n_target {
            let kept = self.kept_with_tau(rows, side, 0.0, n_target);
            debug!(
                "{} calibration degraded: {} of {} rows reachable at tau=0",
                side,
                kept.len(),
                n_target
            );
            return Calibration {
                tau: 0.0,
                kept,
                degraded: true,
            };
        }

        let mut tau_lo = 0.0;
        let mut tau_hi = max_r2;
        for _ in 0..self.iterations {
            let mid = 0.5 * (tau_lo + tau_hi);
            if self.count_with_tau(rows, side, mid, n_target) >= n_target {
                tau_lo = mid;
            } else {
                tau_hi = mid;
            }
        }

        // The count only changes at row r2 values, so the smallest r2 at or
        // above tau_lo keeps the same rows.
        let mut tau = rows
            .iter()
            .map(|r| r.r2)
            .filter(|&r2| r2 >= tau_lo)
            .fold(max_r2, f64::min);

        // Bisection resolves τ only to max_r2 / 2^iterations. Step through
        // any closer r2 values above it while the target still holds.
        let mut above: Vec<f64> = rows.iter().map(|r| r.r2).filter(|&r2| r2 > tau).collect();
        above.sort_by(f64::total_cmp);
        above.dedup();
        for candidate in above {
            if self.count_with_tau(rows, side, candidate, n_target) < n_target {
                break;
            }
            tau = candidate;
        }

        Calibration {
            tau,
            kept: self.kept_with_tau(rows, side, tau, n_target),
            degraded: false,
        }
    }
}
