//! Performance metrics module.
//!
//! - Trade statistics per grid cell (mean, population std, t-statistic)
//! - Aggregate report over evaluated weeks (P/L, winning weeks, drawdown)

pub mod calculator;

pub use calculator::{DrawdownAnalysis, EvaluationReport, MetricsCalculator, TradeStats};
