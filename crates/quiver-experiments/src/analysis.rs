//! Interim analysis and stopping rules
//!
//! Each non-control variant is compared against the control (the first
//! variant) on the configured primary metric with the t-test and
//! Mann-Whitney U; Cohen's d gives the effect size. A comparison is
//! statistically significant only when both tests reject.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use quiver_core::{ControlError, ControlEvent, Result};
use quiver_statistical::{
    cohens_d, mann_whitney_u_with_alpha, t_test_with_alpha, CohensDResult, EffectMagnitude,
    MannWhitneyResult, TTestResult,
};

use crate::experiment::Experiment;

/// Control-vs-variant comparison on the primary metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantComparison {
    pub variant_id: String,
    pub control_id: String,
    pub t_test: TTestResult,
    pub mann_whitney: MannWhitneyResult,
    pub effect: CohensDResult,
    /// Relative improvement over control; positive means the variant's
    /// primary metric dropped (lower is better for latency-like
    /// metrics).
    pub relative_improvement: f64,
    pub statistically_significant: bool,
    pub practically_significant: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Implement,
    Continue,
    CollectMore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub experiment_id: String,
    pub generated_at: DateTime<Utc>,
    pub primary_metric: String,
    pub total_samples: usize,
    pub comparisons: Vec<VariantComparison>,
    pub winner: Option<String>,
    /// True when the winner comes from the practical-significance
    /// fallback rather than both tests rejecting.
    pub reduced_confidence: bool,
    pub recommendation: Recommendation,
}

impl Experiment {
    /// Run one analysis pass over the current samples and remember it.
    pub fn interim_analysis(&self) -> Result<AnalysisReport> {
        let variants = self.variant_list();
        let control = variants.first().ok_or_else(|| {
            ControlError::invalid("variants", "no variants registered")
        })?;
        let metric = self.config.primary_metric.clone();
        let control_samples = control.samples_for(&metric);

        // Optional Bonferroni correction across the comparisons.
        let comparisons_n = variants.len().saturating_sub(1).max(1);
        let alpha = if self.config.bonferroni_correction {
            self.config.significance_level / comparisons_n as f64
        } else {
            self.config.significance_level
        };

        let mut comparisons = Vec::new();
        let mut total_samples = control_samples.len();
        for variant in variants.iter().skip(1) {
            let samples = variant.samples_for(&metric);
            total_samples += samples.len();

            let t_test = match t_test_with_alpha(&control_samples, &samples, alpha) {
                Ok(result) => result,
                Err(err) => {
                    debug!(variant_id = %variant.id, error = %err, "comparison skipped");
                    continue;
                }
            };
            let mann_whitney = mann_whitney_u_with_alpha(&control_samples, &samples, alpha)?;
            let effect = cohens_d(&control_samples, &samples)?;

            let relative_improvement = if t_test.mean_x != 0.0 {
                (t_test.mean_x - t_test.mean_y) / t_test.mean_x
            } else {
                0.0
            };
            let statistically_significant = t_test.significant && mann_whitney.significant;
            let practically_significant = effect.magnitude != EffectMagnitude::Negligible
                && relative_improvement.abs() >= self.config.improvement_threshold;

            comparisons.push(VariantComparison {
                variant_id: variant.id.clone(),
                control_id: control.id.clone(),
                t_test,
                mann_whitney,
                effect,
                relative_improvement,
                statistically_significant,
                practically_significant,
            });
        }

        let (winner, reduced_confidence) = pick_winner(&comparisons, self.config.improvement_threshold);
        let recommendation = if total_samples < self.config.minimum_sample_size {
            Recommendation::CollectMore
        } else if winner.is_some() && !reduced_confidence {
            Recommendation::Implement
        } else {
            Recommendation::Continue
        };

        let report = AnalysisReport {
            experiment_id: self.id.clone(),
            generated_at: Utc::now(),
            primary_metric: metric,
            total_samples,
            comparisons,
            winner: winner.clone(),
            reduced_confidence,
            recommendation,
        };

        self.events.publish(ControlEvent::AnalysisUpdate {
            experiment_id: self.id.clone(),
            significant: report
                .comparisons
                .iter()
                .any(|c| c.statistically_significant),
            winner,
        });
        *self.last_analysis.lock() = Some(report.clone());
        Ok(report)
    }

    /// Early-stopping decision against the last analysis.
    ///
    /// Past the minimum run time, any comparison below the early
    /// stopping p-value ends the experiment; the maximum run time
    /// always does.
    pub fn should_stop_early(&self) -> Option<String> {
        let runtime = self.runtime()?;
        if runtime >= self.config.maximum_run_time {
            return Some("maximum run time reached".to_string());
        }
        if !self.config.early_stopping_enabled || runtime < self.config.minimum_run_time {
            return None;
        }
        let analysis = self.last_analysis.lock();
        let crossed = analysis.as_ref().is_some_and(|report| {
            report
                .comparisons
                .iter()
                .any(|c| c.t_test.p_value < self.config.early_stopping_threshold)
        });
        crossed.then(|| "early stopping threshold crossed".to_string())
    }
}

/// Winner: the largest absolute relative improvement among fully
/// significant comparisons meeting the threshold; otherwise the
/// practical-significance fallback at reduced confidence.
fn pick_winner(
    comparisons: &[VariantComparison],
    improvement_threshold: f64,
) -> (Option<String>, bool) {
    let best = |candidates: Vec<&VariantComparison>| {
        candidates
            .into_iter()
            .max_by(|a, b| {
                a.relative_improvement
                    .abs()
                    .partial_cmp(&b.relative_improvement.abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|c| c.variant_id.clone())
    };

    let fully_significant: Vec<&VariantComparison> = comparisons
        .iter()
        .filter(|c| {
            c.statistically_significant
                && c.relative_improvement.abs() >= improvement_threshold
        })
        .collect();
    if !fully_significant.is_empty() {
        return (best(fully_significant), false);
    }

    let practical: Vec<&VariantComparison> = comparisons
        .iter()
        .filter(|c| c.practically_significant)
        .collect();
    if !practical.is_empty() {
        return (best(practical), true);
    }
    (None, false)
}
