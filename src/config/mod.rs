//! Experiment configuration.
//!
//! One immutable, validated and content-hashed configuration object is
//! passed into every component.

pub mod experiment;

pub use experiment::{ConfigError, ExperimentConfig, ParameterUniverse};
