//! Quiver Experiments
//!
//! A/B testing over live traffic: variants selected by a stable
//! participant hash, per-variant timing collection, periodic interim
//! analysis through the statistical kernel, and early-stopping rules.

pub mod analysis;
pub mod experiment;
pub mod variant;

pub use analysis::{AnalysisReport, Recommendation, VariantComparison};
pub use experiment::{Experiment, ExperimentResult, ExperimentSnapshot, ExperimentStatus};
pub use variant::{Variant, VariantImpl, VariantOutcome, VariantSnapshot, VariantStats};

use std::time::Duration;

/// Experiment configuration.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// Fraction of traffic admitted to the experiment, in (0, 1].
    pub traffic_allocation: f64,
    pub significance_level: f64,
    pub minimum_sample_size: usize,
    pub minimum_run_time: Duration,
    pub maximum_run_time: Duration,
    pub early_stopping_enabled: bool,
    /// p-value below which the experiment stops early.
    pub early_stopping_threshold: f64,
    /// Relative improvement a winner must reach.
    pub improvement_threshold: f64,
    pub primary_metric: String,
    /// Divide alpha by the number of comparisons (off by default,
    /// matching historical analysis behavior).
    pub bonferroni_correction: bool,
    pub analysis_interval: Duration,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            traffic_allocation: 1.0,
            significance_level: 0.05,
            minimum_sample_size: 100,
            minimum_run_time: Duration::from_secs(24 * 3600),
            maximum_run_time: Duration::from_secs(30 * 24 * 3600),
            early_stopping_enabled: true,
            early_stopping_threshold: 0.01,
            improvement_threshold: 0.05,
            primary_metric: "latency_ms".to_string(),
            bonferroni_correction: false,
            analysis_interval: Duration::from_secs(3600),
        }
    }
}
