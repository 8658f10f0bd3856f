//! Experiment configuration.
//!
//! Every component receives its parameters from one immutable
//! [`ExperimentConfig`]. The config carries a content hash that is written
//! next to every artifact, so each result traces back to the exact
//! parameters that produced it.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::data::{MalformedRowPolicy, TimeBase};
use crate::knn::ScoringVariant;

/// File names inside a frozen experiment directory.
const CONFIG_FILE: &str = "config.toml";
const HASH_FILE: &str = "config.sha256";

/// Length of the hex hash prefix used in artifacts.
const HASH_LEN: usize = 16;

/// Fields that change how work is scheduled or how many weeks are run, but
/// never what any single week computes.
const UNHASHED_FIELDS: &[&str] = &["workers", "write_trade_log", "test_weeks"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Experiment at {dir} already exists with different settings (stored {stored}, new {new})")]
    ExperimentExists { dir: String, stored: String, new: String },

    #[error("Hash mismatch in {path}: stored {stored}, computed {computed}")]
    HashMismatch { path: String, stored: String, computed: String },
}

/// Immutable parameters of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Currency pair, e.g. "USDJPY".
    pub pair: String,
    /// Fit window lengths in milliseconds.
    pub windows: Vec<u32>,
    /// Weeks of history concatenated into TRAIN.
    pub train_weeks: usize,
    /// DEV weeks aggregated by the selector.
    pub dev_weeks: usize,
    /// Number of TEST weeks evaluated.
    pub test_weeks: usize,

    /// Neighbors per query.
    pub k: usize,
    /// Candidate population sizes, per TRAIN week.
    pub ns_week: Vec<usize>,
    /// Multiply `ns_week` by `train_weeks` to get the calibration target.
    #[serde(default = "default_true")]
    pub use_week_scaling: bool,
    /// Candidate decision thresholds.
    pub thetas: Vec<f64>,
    /// Dispersion gate: queries with cv above this are not confident.
    pub gamma: f64,
    /// P/L magnitude separating wins and losses from draws.
    pub pl_limit: f64,

    /// Spacing between one candidate's exit and the next entry, per stream.
    pub spacing_ms: i64,
    /// Global spacing buffer used by the merge evaluator.
    pub spacing_buffer_ms: i64,
    /// Minimum trades for a grid cell to count as reliable.
    pub min_trades: usize,
    /// Fixed binary-search iteration budget for threshold calibration.
    #[serde(default = "default_calibration_iters")]
    pub calibration_iters: u32,

    #[serde(default)]
    pub scoring: ScoringVariant,
    #[serde(default)]
    pub malformed_rows: MalformedRowPolicy,
    #[serde(default)]
    pub time_base: TimeBase,

    /// Grid-search worker threads (0 = one per core).
    #[serde(default)]
    pub workers: usize,
    /// Persist the merged trade log next to each evaluation summary.
    #[serde(default = "default_true")]
    pub write_trade_log: bool,
}

fn default_true() -> bool {
    true
}

fn default_calibration_iters() -> u32 {
    25
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            pair: "USDJPY".to_string(),
            windows: vec![30_000, 60_000],
            train_weeks: 10,
            dev_weeks: 4,
            test_weeks: 26,
            k: 20,
            ns_week: vec![5, 10, 20, 40],
            use_week_scaling: true,
            thetas: vec![0.1, 0.2, 0.3, 0.4],
            gamma: 0.40,
            pl_limit: 30.0,
            spacing_ms: 80_000,
            spacing_buffer_ms: 80_000,
            min_trades: 5,
            calibration_iters: default_calibration_iters(),
            scoring: ScoringVariant::default(),
            malformed_rows: MalformedRowPolicy::default(),
            time_base: TimeBase::default(),
            workers: 0,
            write_trade_log: true,
        }
    }
}

impl ExperimentConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce meaningful output.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.pair.trim().is_empty() {
            return invalid("pair must not be empty".into());
        }
        if self.windows.is_empty() || has_duplicates(&self.windows) {
            return invalid(format!("windows must be non-empty and unique: {:?}", self.windows));
        }
        if self.ns_week.is_empty() || has_duplicates(&self.ns_week) || self.ns_week.contains(&0) {
            return invalid(format!("ns_week must be non-empty, unique and positive: {:?}", self.ns_week));
        }
        if self.thetas.is_empty() || self.thetas.iter().any(|t| !t.is_finite()) {
            return invalid(format!("thetas must be non-empty and finite: {:?}", self.thetas));
        }
        let mut sorted = self.thetas.clone();
        sorted.sort_by(f64::total_cmp);
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return invalid(format!("thetas must be unique: {:?}", self.thetas));
        }
        if self.k == 0 {
            return invalid("k must be positive".into());
        }
        if self.train_weeks == 0 || self.dev_weeks == 0 {
            return invalid("train_weeks and dev_weeks must be positive".into());
        }
        if self.spacing_ms < 0 || self.spacing_buffer_ms < 0 {
            return invalid("spacings must not be negative".into());
        }
        if !(self.gamma.is_finite() && self.gamma >= 0.0) {
            return invalid(format!("gamma must be finite and non-negative: {}", self.gamma));
        }
        if !(self.pl_limit.is_finite() && self.pl_limit >= 0.0) {
            return invalid(format!("pl_limit must be finite and non-negative: {}", self.pl_limit));
        }
        if self.calibration_iters == 0 {
            return invalid("calibration_iters must be positive".into());
        }
        Ok(())
    }

    /// Calibration targets actually searched, in `ns_week` order.
    pub fn effective_ns(&self) -> Vec<usize> {
        self.ns_week
            .iter()
            .map(|&n| if self.use_week_scaling { n * self.train_weeks } else { n })
            .collect()
    }

    /// Parameter universe used by the grid, the selector and the drift guard.
    pub fn universe(&self) -> ParameterUniverse {
        ParameterUniverse {
            windows: self.windows.clone(),
            ns: self.effective_ns(),
            thetas: self.thetas.clone(),
        }
    }

    /// Short SHA-256 content hash of every result-affecting field.
    pub fn content_hash(&self) -> Result<String, ConfigError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            for key in UNHASHED_FIELDS {
                map.remove(*key);
            }
        }
        // serde_json maps are key-sorted, so this string is canonical.
        let canonical = serde_json::to_string(&value)?;

        let mut hasher = Sha256::new();
        hasher.update(b"knn-walkforward-config-v1\n");
        hasher.update(canonical.as_bytes());
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(HASH_LEN);
        Ok(digest)
    }

    /// Write the config into `exp_dir`, refusing to overwrite different settings.
    pub fn freeze(&self, exp_dir: impl AsRef<Path>) -> Result<String, ConfigError> {
        let exp_dir = exp_dir.as_ref();
        let hash = self.content_hash()?;

        if exp_dir.join(CONFIG_FILE).exists() {
            let stored = Self::load_frozen(exp_dir)?;
            let stored_hash = stored.content_hash()?;
            if stored_hash != hash {
                return Err(ConfigError::ExperimentExists {
                    dir: exp_dir.display().to_string(),
                    stored: stored_hash,
                    new: hash,
                });
            }
            return Ok(hash);
        }

        fs::create_dir_all(exp_dir)?;
        fs::write(exp_dir.join(CONFIG_FILE), toml::to_string_pretty(self)?)?;
        fs::write(exp_dir.join(HASH_FILE), format!("{}\n", hash))?;
        info!("Froze experiment config {} at {}", hash, exp_dir.display());
        Ok(hash)
    }

    /// Resume a frozen experiment, verifying the stored hash.
    pub fn load_frozen(exp_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let exp_dir = exp_dir.as_ref();
        let config = Self::load(exp_dir.join(CONFIG_FILE))?;

        let hash_path = exp_dir.join(HASH_FILE);
        let stored = fs::read_to_string(&hash_path)?.trim().to_string();
        let computed = config.content_hash()?;
        if stored != computed {
            return Err(ConfigError::HashMismatch {
                path: hash_path.display().to_string(),
                stored,
                computed,
            });
        }
        Ok(config)
    }
}

fn has_duplicates<T: Ord + Clone>(values: &[T]) -> bool {
    let mut sorted = values.to_vec();
    sorted.sort();
    sorted.windows(2).any(|w| w[0] == w[1])
}

/// The (window, N, θ) axes a config searches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterUniverse {
    pub windows: Vec<u32>,
    pub ns: Vec<usize>,
    pub thetas: Vec<f64>,
}

impl ParameterUniverse {
    pub fn n_index(&self, n: usize) -> Option<usize> {
        self.ns.iter().position(|&x| x == n)
    }

    pub fn theta_index(&self, theta: f64) -> Option<usize> {
        self.thetas.iter().position(|&t| (t - theta).abs() <= 1e-12)
    }

    /// Grid indices of (N, θ) if `window`, `n` and `theta` all belong to the universe.
    pub fn locate(&self, window: u32, n: usize, theta: f64) -> Option<(usize, usize)> {
        if !self.windows.contains(&window) {
            return None;
        }
        Some((self.n_index(n)?, self.theta_index(theta)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ExperimentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.calibration_iters, 25);
    }

    #[test]
    fn test_effective_ns_week_scaling() {
        let mut config = ExperimentConfig {
            train_weeks: 4,
            ns_week: vec![5, 10],
            ..Default::default()
        };
        assert_eq!(config.effective_ns(), vec![20, 40]);

        config.use_week_scaling = false;
        assert_eq!(config.effective_ns(), vec![5, 10]);
    }

    #[test]
    fn test_validate_rejects_bad_axes() {
        let dup_thetas = ExperimentConfig {
            thetas: vec![0.1, 0.1],
            ..Default::default()
        };
        assert!(matches!(dup_thetas.validate(), Err(ConfigError::Invalid(_))));

        let no_windows = ExperimentConfig {
            windows: vec![],
            ..Default::default()
        };
        assert!(no_windows.validate().is_err());

        let zero_k = ExperimentConfig {
            k: 0,
            ..Default::default()
        };
        assert!(zero_k.validate().is_err());

        let negative_spacing = ExperimentConfig {
            spacing_ms: -1,
            ..Default::default()
        };
        assert!(negative_spacing.validate().is_err());
    }

    #[test]
    fn test_content_hash_tracks_parameters_only() {
        let base = ExperimentConfig::default();
        let hash = base.content_hash().unwrap();
        assert_eq!(hash.len(), HASH_LEN);
        assert_eq!(hash, base.content_hash().unwrap());

        let more_workers = ExperimentConfig {
            workers: 12,
            ..Default::default()
        };
        assert_eq!(hash, more_workers.content_hash().unwrap());

        let more_test_weeks = ExperimentConfig {
            test_weeks: base.test_weeks + 4,
            ..Default::default()
        };
        assert_eq!(hash, more_test_weeks.content_hash().unwrap());

        let other_gamma = ExperimentConfig {
            gamma: 0.25,
            ..Default::default()
        };
        assert_ne!(hash, other_gamma.content_hash().unwrap());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ExperimentConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ExperimentConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_freeze_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let exp_dir = dir.path().join("k20");

        let config = ExperimentConfig::default();
        let hash = config.freeze(&exp_dir).unwrap();

        let loaded = ExperimentConfig::load_frozen(&exp_dir).unwrap();
        assert_eq!(loaded, config);

        // Identical settings are accepted again.
        assert_eq!(config.freeze(&exp_dir).unwrap(), hash);

        // Different settings are refused.
        let changed = ExperimentConfig {
            k: 30,
            ..Default::default()
        };
        assert!(matches!(
            changed.freeze(&exp_dir),
            Err(ConfigError::ExperimentExists { .. })
        ));
    }

    #[test]
    fn test_load_frozen_detects_edits() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExperimentConfig::default();
        config.freeze(dir.path()).unwrap();

        let edited = ExperimentConfig {
            gamma: 0.9,
            ..Default::default()
        };
        fs::write(
            dir.path().join(CONFIG_FILE),
            toml::to_string_pretty(&edited).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            ExperimentConfig::load_frozen(dir.path()),
            Err(ConfigError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_universe_locate() {
        let config = ExperimentConfig {
            windows: vec![30_000],
            train_weeks: 2,
            ns_week: vec![5, 10],
            thetas: vec![0.1, 0.25],
            ..Default::default()
        };
        let universe = config.universe();
        assert_eq!(universe.locate(30_000, 20, 0.25), Some((1, 1)));
        assert_eq!(universe.locate(60_000, 20, 0.25), None);
        assert_eq!(universe.locate(30_000, 7, 0.25), None);
        assert_eq!(universe.locate(30_000, 10, 0.3), None);
    }
}
