//! Two-sample comparison tests and effect sizes

use serde::{Deserialize, Serialize};

use crate::approx::{normal_cdf, p_value_of_t};
use crate::Summary;
use quiver_core::{ControlError, Result};

/// Default significance level for the comparison tests.
pub const DEFAULT_ALPHA: f64 = 0.05;

/// Pooled-variance two-sample t-test result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TTestResult {
    pub mean_x: f64,
    pub mean_y: f64,
    pub diff: f64,
    pub t: f64,
    pub df: f64,
    pub p_value: f64,
    pub significant: bool,
    /// Normal-approximation 95% CI on the mean difference.
    pub ci95: (f64, f64),
}

/// Mann-Whitney U result under the normal approximation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MannWhitneyResult {
    pub u: f64,
    pub z: f64,
    pub p_value: f64,
    pub significant: bool,
}

/// Effect size classification per Cohen's thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectMagnitude {
    Negligible,
    Small,
    Medium,
    Large,
}

impl EffectMagnitude {
    fn classify(d: f64) -> Self {
        let d = d.abs();
        if d < 0.2 {
            EffectMagnitude::Negligible
        } else if d < 0.5 {
            EffectMagnitude::Small
        } else if d < 0.8 {
            EffectMagnitude::Medium
        } else {
            EffectMagnitude::Large
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohensDResult {
    pub d: f64,
    pub magnitude: EffectMagnitude,
}

/// Pooled-variance two-sample t-test at the default significance level.
///
/// Pooled (not Welch): df = n1 + n2 - 2 with a pooled variance
/// estimate, matching the serving system's historical analysis
/// behavior even when sample variances differ.
pub fn t_test(x: &[f64], y: &[f64]) -> Result<TTestResult> {
    t_test_with_alpha(x, y, DEFAULT_ALPHA)
}

/// Pooled-variance two-sample t-test at significance level `alpha`.
pub fn t_test_with_alpha(x: &[f64], y: &[f64], alpha: f64) -> Result<TTestResult> {
    let sx = Summary::of(x).ok_or_else(|| insufficient("t-test"))?;
    let sy = Summary::of(y).ok_or_else(|| insufficient("t-test"))?;

    let df = (sx.n + sy.n) as f64 - 2.0;
    if df < 1.0 {
        return Err(insufficient("t-test"));
    }

    let pooled_var =
        ((sx.n - 1) as f64 * sx.variance + (sy.n - 1) as f64 * sy.variance) / df;
    let se = (pooled_var * (1.0 / sx.n as f64 + 1.0 / sy.n as f64)).sqrt();

    let diff = sx.mean - sy.mean;
    // Identical constant samples: no evidence either way.
    let (t, p_value) = if se > 0.0 {
        let t = diff / se;
        (t, p_value_of_t(t, df))
    } else if diff == 0.0 {
        (0.0, 1.0)
    } else {
        (f64::INFINITY * diff.signum(), 0.0)
    };

    Ok(TTestResult {
        mean_x: sx.mean,
        mean_y: sy.mean,
        diff,
        t,
        df,
        p_value,
        significant: p_value < alpha,
        ci95: (diff - 1.96 * se, diff + 1.96 * se),
    })
}

/// Mann-Whitney U test at the default significance level.
///
/// Ranks ascend with average ranks on ties. The normal approximation
/// is used without the continuity correction and without a tie
/// correction to sigma; both are deliberate simplifications that stay
/// within the kernel's 1e-3 precision contract for n >= 20.
pub fn mann_whitney_u(x: &[f64], y: &[f64]) -> Result<MannWhitneyResult> {
    mann_whitney_u_with_alpha(x, y, DEFAULT_ALPHA)
}

/// Mann-Whitney U test at significance level `alpha`.
pub fn mann_whitney_u_with_alpha(x: &[f64], y: &[f64], alpha: f64) -> Result<MannWhitneyResult> {
    if x.is_empty() || y.is_empty() {
        return Err(insufficient("mann-whitney"));
    }

    let n1 = x.len() as f64;
    let n2 = y.len() as f64;
    let ranks = average_ranks(x, y);

    // Rank sum of the first sample.
    let r1: f64 = ranks.iter().take(x.len()).sum();
    let u1 = r1 - n1 * (n1 + 1.0) / 2.0;
    let u2 = n1 * n2 - u1;
    let u = u1.min(u2);

    let mu = n1 * n2 / 2.0;
    let sigma = (n1 * n2 * (n1 + n2 + 1.0) / 12.0).sqrt();
    let z = if sigma > 0.0 { (u - mu) / sigma } else { 0.0 };
    let p_value = (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0);

    Ok(MannWhitneyResult {
        u,
        z,
        p_value,
        significant: p_value < alpha,
    })
}

/// Cohen's d with pooled standard deviation.
pub fn cohens_d(x: &[f64], y: &[f64]) -> Result<CohensDResult> {
    let sx = Summary::of(x).ok_or_else(|| insufficient("cohens-d"))?;
    let sy = Summary::of(y).ok_or_else(|| insufficient("cohens-d"))?;

    let df = (sx.n + sy.n) as f64 - 2.0;
    let d = if df < 1.0 {
        0.0
    } else {
        let pooled_sd =
            (((sx.n - 1) as f64 * sx.variance + (sy.n - 1) as f64 * sy.variance) / df).sqrt();
        if pooled_sd > 0.0 {
            (sx.mean - sy.mean) / pooled_sd
        } else {
            0.0
        }
    };

    Ok(CohensDResult {
        d,
        magnitude: EffectMagnitude::classify(d),
    })
}

/// Ranks of the concatenated samples (x then y), ascending, with tied
/// values receiving their average rank.
fn average_ranks(x: &[f64], y: &[f64]) -> Vec<f64> {
    let combined: Vec<f64> = x.iter().chain(y.iter()).copied().collect();
    let mut order: Vec<usize> = (0..combined.len()).collect();
    order.sort_by(|&a, &b| {
        combined[a]
            .partial_cmp(&combined[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut ranks = vec![0.0; combined.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && combined[order[j + 1]] == combined[order[i]] {
            j += 1;
        }
        // Positions i..=j share the same value; average their ranks.
        let avg = (i + j + 2) as f64 / 2.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg;
        }
        i = j + 1;
    }
    ranks
}

fn insufficient(test: &str) -> ControlError {
    ControlError::InsufficientSamples {
        test: test.to_string(),
    }
}
