//! Performance metrics calculator.
//!
//! Trade statistics for grid cells and the aggregate report over evaluated
//! TEST weeks.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::walkforward::WeekSummary;

/// Aggregate statistics over one trade stream.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TradeStats {
    pub trades: usize,
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    /// mean / (std / sqrt(n)), 0 when std is 0.
    pub tstat: f64,
    /// Trade count met the minimum; otherwise mean, std and tstat are zero.
    pub reliable: bool,
}

/// Drawdown of cumulative weekly P/L.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrawdownAnalysis {
    pub max_drawdown: f64,
    pub peak_week: Option<NaiveDate>,
    pub trough_week: Option<NaiveDate>,
    pub drawdown_periods: usize,
}

/// Aggregate result over evaluated TEST weeks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub weeks: usize,
    pub total_trades: usize,
    pub total_pnl: f64,
    pub winning_weeks: usize,
    pub losing_weeks: usize,
    pub mean_weekly_pnl: f64,
    pub weekly_pnl_std: f64,
    pub best_week: Option<(NaiveDate, f64)>,
    pub worst_week: Option<(NaiveDate, f64)>,
    pub drawdown: DrawdownAnalysis,
}

impl EvaluationReport {
    /// Generate a summary report.
    pub fn summary(&self) -> String {
        let fmt_week = |w: &Option<(NaiveDate, f64)>| match w {
            Some((date, pnl)) => format!("{} ({:.1})", date, pnl),
            None => "-".to_string(),
        };
        format!(
            "Walk-Forward Evaluation\n\
             =======================\n\
             \n\
             Weeks: {} (W: {}, L: {})\n\
             Trades: {}\n\
             \n\
             Total P/L: {:.1}\n\
             Mean Weekly P/L: {:.2} (std {:.2})\n\
             Best Week: {}\n\
             Worst Week: {}\n\
             \n\
             Max Drawdown: {:.1}",
            self.weeks,
            self.winning_weeks,
            self.losing_weeks,
            self.total_trades,
            self.total_pnl,
            self.mean_weekly_pnl,
            self.weekly_pnl_std,
            fmt_week(&self.best_week),
            fmt_week(&self.worst_week),
            self.drawdown.max_drawdown,
        )
    }
}

/// Metrics calculator.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Statistics of a P/L series, zeroed when fewer than `min_trades`.
    pub fn trade_stats(pls: &[f64], min_trades: usize) -> TradeStats {
        let trades = pls.len();
        if trades == 0 || trades < min_trades {
            return TradeStats {
                trades,
                ..TradeStats::default()
            };
        }

        let mean = pls.mean();
        let std = pls.population_std_dev();
        let tstat = if std > 0.0 {
            mean / (std / (trades as f64).sqrt())
        } else {
            0.0
        };

        TradeStats {
            trades,
            mean,
            std,
            tstat,
            reliable: true,
        }
    }

    /// Build the aggregate report. Summaries are ordered by week first.
    pub fn evaluation_report(summaries: &[WeekSummary]) -> EvaluationReport {
        if summaries.is_empty() {
            return EvaluationReport::default();
        }

        let mut weeks: Vec<&WeekSummary> = summaries.iter().collect();
        weeks.sort_by_key(|s| s.week);

        let pnls: Vec<f64> = weeks.iter().map(|s| s.pnl).collect();
        let by_pnl = |better: fn(f64, f64) -> bool| {
            weeks
                .iter()
                .fold(None, |best: Option<(NaiveDate, f64)>, s| match best {
                    Some((_, p)) if !better(s.pnl, p) => best,
                    _ => Some((s.week, s.pnl)),
                })
        };

        EvaluationReport {
            weeks: weeks.len(),
            total_trades: weeks.iter().map(|s| s.trades).sum(),
            total_pnl: pnls.iter().sum(),
            winning_weeks: pnls.iter().filter(|&&p| p > 0.0).count(),
            losing_weeks: pnls.iter().filter(|&&p| p < 0.0).count(),
            mean_weekly_pnl: pnls.iter().mean(),
            weekly_pnl_std: if pnls.len() > 1 { pnls.iter().population_std_dev() } else { 0.0 },
            best_week: by_pnl(|a, b| a > b),
            worst_week: by_pnl(|a, b| a < b),
            drawdown: Self::analyze_drawdown(&weeks),
        }
    }

    /// Drawdown of the cumulative P/L curve, starting from zero.
    fn analyze_drawdown(weeks: &[&WeekSummary]) -> DrawdownAnalysis {
        let mut equity = 0.0;
        let mut peak = 0.0;
        let mut peak_week: Option<NaiveDate> = None;
        let mut analysis = DrawdownAnalysis::default();
        let mut in_drawdown = false;

        for s in weeks {
            equity += s.pnl;
            if equity >= peak {
                if in_drawdown && equity > peak {
                    analysis.drawdown_periods += 1;
                    in_drawdown = false;
                }
                peak = equity;
                peak_week = Some(s.week);
            } else {
                in_drawdown = true;
                let drawdown = peak - equity;
                if drawdown > analysis.max_drawdown {
                    analysis.max_drawdown = drawdown;
                    analysis.peak_week = peak_week;
                    analysis.trough_week = Some(s.week);
                }
            }
        }
        if in_drawdown {
            analysis.drawdown_periods += 1;
        }
        analysis
    }
}
