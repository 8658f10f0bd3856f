pub mod config;
pub mod data;
pub mod knn;
pub mod metrics;
pub mod walkforward;

// Re-export commonly used types
pub use config::{ExperimentConfig, ParameterUniverse};
pub use data::{ArtifactStore, DigestRow, MalformedRowPolicy, Side, TradeRecord};
pub use knn::{NeighborVoteModel, ScoringVariant, ThresholdCalibrator};
pub use metrics::{EvaluationReport, MetricsCalculator};
pub use walkforward::{
    GridCube, GridScheduler, GridSearchEngine, ParameterManifest, ParameterSelector, WalkForwardEvaluator,
    WeekSummary,
};
