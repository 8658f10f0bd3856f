//! Walk-forward calibration and evaluation.
//!
//! Every week is addressed by its Monday. The pipeline runs in three stages:
//! - Grid: per (week, window), calibrate on the preceding TRAIN weeks and
//!   replay the week itself into a metric cube and trade streams
//! - Select: per TEST week, aggregate the cubes of the preceding DEV weeks
//!   into one parameter manifest
//! - Evaluate: per TEST week, merge the selected streams under one global
//!   spacing buffer

pub mod cube;
pub mod evaluator;
pub mod gridsearch;
pub mod periods;
pub mod scheduler;
pub mod selector;

pub use cube::{CellMetrics, GridCube};
pub use evaluator::{merge_streams, EvalError, MergedTrade, WalkForwardEvaluator, WeekEvaluation, WeekSummary};
pub use gridsearch::{AuditRow, FeatureScaler, GridError, GridOutcome, GridSearchEngine, TradeStream, Verdict};
pub use periods::{WeekSplit, WeeklySplits, WeeklySplitsConfig};
pub use scheduler::{GridScheduler, ScheduleSummary, TaskOutcome, TaskStatus};
pub use selector::{CellChoice, ManifestEntry, ParameterManifest, ParameterSelector, SelectionError};
