//! Neighbor scoring strategies.
//!
//! Every strategy sees the same neighbor set and the same win/draw/loss
//! tally; they differ in the signal compared against θ and in whether the
//! dispersion gate applies.
//!
//! | Variant             | Signal                                   | Gate |
//! |---------------------|------------------------------------------|------|
//! | `gated_tally`       | edge = (wins − losses) / k               | yes  |
//! | `tally`             | edge                                     | no   |
//! | `distance_weighted` | 1/(d + 1e-9) weighted mean decisive P/L  | yes  |

use serde::{Deserialize, Serialize};

/// Offset keeping inverse-distance weights finite for exact matches.
const DISTANCE_EPS: f64 = 1e-9;

/// Scoring variant selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringVariant {
    /// Three-way tally with the dispersion gate.
    #[default]
    GatedTally,
    /// Three-way tally, gate reported but not enforced.
    Tally,
    /// Inverse-distance weighted mean P/L of decisive neighbors.
    DistanceWeighted,
}

impl ScoringVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GatedTally => "gated_tally",
            Self::Tally => "tally",
            Self::DistanceWeighted => "distance_weighted",
        }
    }

    pub fn strategy(&self) -> Box<dyn ScoringStrategy> {
        match self {
            Self::GatedTally => Box::new(GatedTally),
            Self::Tally => Box::new(PlainTally),
            Self::DistanceWeighted => Box::new(DistanceWeighted),
        }
    }
}

/// A retrieved neighbor with its realized P/L on the side being scored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabeledNeighbor {
    pub distance: f64,
    pub pl: f64,
}

/// Outcome class of one neighbor's P/L against the magnitude limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Win,
    Draw,
    Loss,
}

impl Outcome {
    pub fn classify(pl: f64, pl_limit: f64) -> Self {
        if pl > pl_limit {
            Self::Win
        } else if pl < -pl_limit {
            Self::Loss
        } else {
            Self::Draw
        }
    }
}

/// Win/draw/loss counts over one neighbor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tally {
    pub wins: usize,
    pub draws: usize,
    pub losses: usize,
}

impl Tally {
    pub fn from_neighbors(neighbors: &[LabeledNeighbor], pl_limit: f64) -> Self {
        let mut tally = Self::default();
        for n in neighbors {
            match Outcome::classify(n.pl, pl_limit) {
                Outcome::Win => tally.wins += 1,
                Outcome::Draw => tally.draws += 1,
                Outcome::Loss => tally.losses += 1,
            }
        }
        tally
    }

    pub fn total(&self) -> usize {
        self.wins + self.draws + self.losses
    }

    /// (wins − losses) / k, in [−1, 1]; 0 for an empty tally.
    pub fn edge(&self) -> f64 {
        let k = self.total();
        if k == 0 {
            return 0.0;
        }
        (self.wins as f64 - self.losses as f64) / k as f64
    }
}

/// Turns a neighbor set into the signal compared against θ.
pub trait ScoringStrategy: Send + Sync {
    fn variant(&self) -> ScoringVariant;

    /// Whether a failed dispersion gate blocks the trade.
    fn enforces_gate(&self) -> bool;

    fn signal(&self, neighbors: &[LabeledNeighbor], tally: &Tally, pl_limit: f64) -> f64;
}

pub struct GatedTally;

impl ScoringStrategy for GatedTally {
    fn variant(&self) -> ScoringVariant {
        ScoringVariant::GatedTally
    }

    fn enforces_gate(&self) -> bool {
        true
    }

    fn signal(&self, _neighbors: &[LabeledNeighbor], tally: &Tally, _pl_limit: f64) -> f64 {
        tally.edge()
    }
}

pub struct PlainTally;

impl ScoringStrategy for PlainTally {
    fn variant(&self) -> ScoringVariant {
        ScoringVariant::Tally
    }

    fn enforces_gate(&self) -> bool {
        false
    }

    fn signal(&self, _neighbors: &[LabeledNeighbor], tally: &Tally, _pl_limit: f64) -> f64 {
        tally.edge()
    }
}

/// Weighted mean P/L over decisive neighbors. θ is in P/L units here.
pub struct DistanceWeighted;

impl ScoringStrategy for DistanceWeighted {
    fn variant(&self) -> ScoringVariant {
        ScoringVariant::DistanceWeighted
    }

    fn enforces_gate(&self) -> bool {
        true
    }

    fn signal(&self, neighbors: &[LabeledNeighbor], _tally: &Tally, pl_limit: f64) -> f64 {
        let (weighted_sum, weight_sum) = neighbors
            .iter()
            .filter(|n| Outcome::classify(n.pl, pl_limit) != Outcome::Draw)
            .fold((0.0, 0.0), |(sum, wsum), n| {
                let w = 1.0 / (n.distance + DISTANCE_EPS);
                (sum + w * n.pl, wsum + w)
            });
        if weight_sum == 0.0 {
            0.0
        } else {
            weighted_sum / weight_sum
        }
    }
}
