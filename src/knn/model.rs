//! Nearest-neighbor vote model over fit-coefficient space.
//!
//! The model indexes (a, b) points with their realized buy and sell P/L.
//! A query retrieves the k nearest points, tallies their outcomes per side,
//! and checks the dispersion of neighbor distances against the gamma gate.

use thiserror::Error;

use super::kdtree::KdTree;
use super::scoring::{LabeledNeighbor, ScoringStrategy, ScoringVariant, Tally};
use crate::config::ExperimentConfig;
use crate::data::Side;

#[derive(Error, Debug, PartialEq)]
pub enum ModelError {
    #[error("Model queried before fit")]
    NotFitted,

    #[error("Cannot fit on an empty training set")]
    EmptyTrainingSet,

    #[error("Label count {labels} does not match point count {points}")]
    LabelMismatch { points: usize, labels: usize },
}

/// Vote result for one side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SideVote {
    pub wins: usize,
    pub draws: usize,
    pub losses: usize,
    /// (wins − losses) / k.
    pub edge: f64,
    /// Value compared against θ; equals `edge` for tally strategies.
    pub signal: f64,
}

/// Full result of one query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborScore {
    /// Neighbors actually retrieved (k, or fewer if the model is small).
    pub k: usize,
    /// Coefficient of variation of neighbor distances.
    pub cv: f64,
    /// `cv <= gamma`.
    pub confident: bool,
    /// Whether a failed gate blocks trading under the active strategy.
    pub gate_enforced: bool,
    pub buy: SideVote,
    pub sell: SideVote,
}

impl NeighborScore {
    pub fn side(&self, side: Side) -> &SideVote {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }

    pub fn passes_gate(&self) -> bool {
        self.confident || !self.gate_enforced
    }

    /// Gate and threshold both pass for `side`.
    pub fn tradeable(&self, side: Side, theta: f64) -> bool {
        self.passes_gate() && self.side(side).signal >= theta
    }
}

pub struct NeighborVoteModel {
    k: usize,
    gamma: f64,
    pl_limit: f64,
    strategy: Box<dyn ScoringStrategy>,
    tree: Option<KdTree>,
    /// (buy P/L, sell P/L) parallel to the indexed points.
    labels: Vec<(f64, f64)>,
}

impl NeighborVoteModel {
    pub fn new(k: usize, gamma: f64, pl_limit: f64, variant: ScoringVariant) -> Self {
        Self {
            k,
            gamma,
            pl_limit,
            strategy: variant.strategy(),
            tree: None,
            labels: Vec::new(),
        }
    }

    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self::new(config.k, config.gamma, config.pl_limit, config.scoring)
    }

    pub fn variant(&self) -> ScoringVariant {
        self.strategy.variant()
    }

    pub fn is_fitted(&self) -> bool {
        self.tree.is_some()
    }

    /// Index `points` with their `(buy P/L, sell P/L)` labels, replacing any
    /// previous fit.
    pub fn fit(&mut self, points: Vec<[f64; 2]>, labels: Vec<(f64, f64)>) -> Result<(), ModelError> {
        if points.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        if points.len() != labels.len() {
            return Err(ModelError::LabelMismatch {
                points: points.len(),
                labels: labels.len(),
            });
        }
        self.tree = Some(KdTree::build(points));
        self.labels = labels;
        Ok(())
    }

    pub fn score(&self, query: [f64; 2]) -> Result<NeighborScore, ModelError> {
        let tree = self.tree.as_ref().ok_or(ModelError::NotFitted)?;
        let neighbors = tree.nearest(query, self.k);

        let distances: Vec<f64> = neighbors.iter().map(|n| n.distance).collect();
        let cv = coefficient_of_variation(&distances);

        let labeled = |side: Side| -> Vec<LabeledNeighbor> {
            neighbors
                .iter()
                .map(|n| {
                    let (buy, sell) = self.labels[n.index];
                    LabeledNeighbor {
                        distance: n.distance,
                        pl: match side {
                            Side::Buy => buy,
                            Side::Sell => sell,
                        },
                    }
                })
                .collect()
        };

        Ok(NeighborScore {
            k: neighbors.len(),
            cv,
            confident: cv <= self.gamma,
            gate_enforced: self.strategy.enforces_gate(),
            buy: self.vote(&labeled(Side::Buy)),
            sell: self.vote(&labeled(Side::Sell)),
        })
    }

    fn vote(&self, neighbors: &[LabeledNeighbor]) -> SideVote {
        let tally = Tally::from_neighbors(neighbors, self.pl_limit);
        SideVote {
            wins: tally.wins,
            draws: tally.draws,
            losses: tally.losses,
            edge: tally.edge(),
            signal: self.strategy.signal(neighbors, &tally, self.pl_limit),
        }
    }
}

/// Population std over mean; 0 when the mean is 0 or there are no values.
fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean
}
