//! Out-of-sample evaluation of a TEST week's manifest.
//!
//! Each manifest entry names one precomputed trade stream of the TEST
//! week's own grid unit. The streams are merged chronologically and a
//! single position is held at a time across all of them: a candidate is
//! taken only if it enters at least `spacing_buffer_ms` after the exit of
//! the last taken trade.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::selector::{ManifestEntry, ParameterManifest};
use crate::config::{ConfigError, ExperimentConfig, ParameterUniverse};
use crate::data::{ArtifactStore, Side, StoreError, TradeRecord};

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("Missing parameter manifest for week {week}")]
    MissingManifest { week: NaiveDate },

    #[error("Manifest for week {week} was built with config {found}, expected {expected}")]
    StaleManifest {
        week: NaiveDate,
        found: String,
        expected: String,
    },

    #[error("Missing trade stream for week {week}: {path}")]
    MissingTrades { week: NaiveDate, path: String },

    #[error("Week {week} manifest references window {window} N={n} theta={theta} outside the configured grid")]
    ParameterDrift {
        week: NaiveDate,
        window: u32,
        n: usize,
        theta: f64,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result row of one evaluated TEST week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeekSummary {
    pub week: NaiveDate,
    pub trades: usize,
    pub pnl: f64,
    pub config_hash: String,
}

/// An accepted trade with the parameters of the stream it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergedTrade {
    pub window: u32,
    pub side: Side,
    pub n: usize,
    pub theta: f64,
    pub trade: TradeRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeekEvaluation {
    pub summary: WeekSummary,
    pub log: Vec<MergedTrade>,
}

/// Next pending candidate of one stream.
#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    entry_ms: i64,
    stream: usize,
    pos: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.entry_ms == other.entry_ms && self.stream == other.stream
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse for min-heap; equal entries resolve to the earlier stream.
        other
            .entry_ms
            .cmp(&self.entry_ms)
            .then_with(|| other.stream.cmp(&self.stream))
    }
}

/// Merge time-ordered streams under one global spacing buffer.
///
/// Returns `(stream index, trade)` for every accepted candidate, in
/// acceptance order.
pub fn merge_streams(streams: &[Vec<TradeRecord>], spacing_buffer_ms: i64) -> Vec<(usize, TradeRecord)> {
    let mut heap: BinaryHeap<HeapEntry> = streams
        .iter()
        .enumerate()
        .filter_map(|(stream, trades)| {
            trades.first().map(|t| HeapEntry {
                entry_ms: t.entry_ms,
                stream,
                pos: 0,
            })
        })
        .collect();

    let mut accepted = Vec::new();
    let mut last_exit: Option<i64> = None;

    while let Some(HeapEntry { stream, pos, .. }) = heap.pop() {
        let trade = streams[stream][pos];
        if last_exit.map_or(true, |exit| trade.entry_ms >= exit.saturating_add(spacing_buffer_ms)) {
            last_exit = Some(trade.exit_ms);
            accepted.push((stream, trade));
        }
        if let Some(next) = streams[stream].get(pos + 1) {
            heap.push(HeapEntry {
                entry_ms: next.entry_ms,
                stream,
                pos: pos + 1,
            });
        }
    }
    accepted
}

pub struct WalkForwardEvaluator {
    config: ExperimentConfig,
    config_hash: String,
    universe: ParameterUniverse,
}

impl WalkForwardEvaluator {
    pub fn new(config: ExperimentConfig) -> Result<Self, EvalError> {
        let config_hash = config.content_hash()?;
        let universe = config.universe();
        Ok(Self {
            config,
            config_hash,
            universe,
        })
    }

    /// Merge the streams a manifest selects. Streams are given in manifest order.
    pub fn evaluate(&self, manifest: &ParameterManifest, streams: &[Vec<TradeRecord>]) -> WeekEvaluation {
        let accepted = merge_streams(streams, self.config.spacing_buffer_ms);
        let log: Vec<MergedTrade> = accepted
            .into_iter()
            .filter_map(|(idx, trade)| {
                manifest.windows.get(idx).map(|e| MergedTrade {
                    window: e.window,
                    side: e.side,
                    n: e.n,
                    theta: e.theta,
                    trade,
                })
            })
            .collect();

        WeekEvaluation {
            summary: WeekSummary {
                week: manifest.week,
                trades: log.len(),
                pnl: log.iter().map(|t| t.trade.pl).sum(),
                config_hash: self.config_hash.clone(),
            },
            log,
        }
    }

    /// Load the manifest and streams of `week`, merge, and persist the summary.
    pub fn evaluate_week(&self, store: &ArtifactStore, week: NaiveDate) -> Result<WeekEvaluation, EvalError> {
        let pair = &self.config.pair;
        let manifest = match store.load_manifest(pair, week) {
            Ok(m) => m,
            Err(StoreError::FileNotFound(_)) => return Err(EvalError::MissingManifest { week }),
            Err(e) => return Err(e.into()),
        };
        if manifest.config_hash != self.config_hash {
            return Err(EvalError::StaleManifest {
                week,
                found: manifest.config_hash,
                expected: self.config_hash.clone(),
            });
        }

        let streams = manifest
            .windows
            .iter()
            .map(|entry| self.load_stream(store, week, entry))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            "{}: merging {} streams with {} candidates",
            week,
            streams.len(),
            streams.iter().map(Vec::len).sum::<usize>()
        );

        let evaluation = self.evaluate(&manifest, &streams);
        store.save_summary(pair, &evaluation.summary)?;
        if self.config.write_trade_log {
            store.save_trade_log(pair, week, &evaluation.log)?;
        }
        info!(
            "TEST {}: trades={} pnl={:.1}",
            week, evaluation.summary.trades, evaluation.summary.pnl
        );
        Ok(evaluation)
    }

    /// Evaluate each week in order; a failing week does not stop the rest.
    pub fn run(&self, store: &ArtifactStore, weeks: &[NaiveDate]) -> Vec<(NaiveDate, Result<WeekSummary, EvalError>)> {
        weeks
            .iter()
            .map(|&week| {
                let result = self.evaluate_week(store, week).map(|e| e.summary);
                if let Err(e) = &result {
                    warn!("Evaluation failed for {}: {}", week, e);
                }
                (week, result)
            })
            .collect()
    }

    fn load_stream(&self, store: &ArtifactStore, week: NaiveDate, entry: &ManifestEntry) -> Result<Vec<TradeRecord>, EvalError> {
        if self.universe.locate(entry.window, entry.n, entry.theta).is_none() {
            return Err(EvalError::ParameterDrift {
                week,
                window: entry.window,
                n: entry.n,
                theta: entry.theta,
            });
        }

        let path = store.trade_file(&self.config.pair, week, entry.window, entry.side, entry.n, entry.theta);
        let mut trades = match store.load_trades(&path) {
            Ok(t) => t,
            Err(StoreError::FileNotFound(_)) => {
                return Err(EvalError::MissingTrades {
                    week,
                    path: path.display().to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        if trades.windows(2).any(|w| w[1].entry_ms < w[0].entry_ms) {
            warn!("{}: stream {} out of order, sorting", week, path.display());
            trades.sort_by_key(|t| t.entry_ms);
        }
        Ok(trades)
    }
}
