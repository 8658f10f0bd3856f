//! Nearest-neighbor signal: threshold calibration, spatial index, vote
//! model and scoring strategies.

pub mod calibrate;
pub mod kdtree;
pub mod model;
pub mod scoring;

pub use calibrate::{Calibration, ThresholdCalibrator};
pub use kdtree::{KdTree, Neighbor};
pub use model::{ModelError, NeighborScore, NeighborVoteModel, SideVote};
pub use scoring::{ScoringStrategy, ScoringVariant, Tally};
