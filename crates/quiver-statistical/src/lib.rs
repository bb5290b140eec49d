//! Quiver Statistical Kernel
//!
//! Pure, deterministic functions over finite numeric sequences: the
//! two-sample t-test, Mann-Whitney U, Cohen's d, and the CDF
//! approximations they rest on. No state, no I/O; everything here is
//! safe to call from any task.

pub mod approx;
pub mod compare;

pub use approx::{erf, normal_cdf, p_value_of_t, t_cdf};
pub use compare::{
    cohens_d, mann_whitney_u, mann_whitney_u_with_alpha, t_test, t_test_with_alpha, CohensDResult,
    EffectMagnitude, MannWhitneyResult, TTestResult, DEFAULT_ALPHA,
};

use serde::{Deserialize, Serialize};

/// Descriptive summary of one sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Summary {
    pub n: usize,
    pub mean: f64,
    /// Sample variance (n-1 denominator); zero for singleton samples.
    pub variance: f64,
    pub std_dev: f64,
}

impl Summary {
    /// Summarize a sample; `None` when it is empty.
    pub fn of(xs: &[f64]) -> Option<Summary> {
        if xs.is_empty() {
            return None;
        }
        let n = xs.len();
        let mean = xs.iter().sum::<f64>() / n as f64;
        let variance = if n > 1 {
            xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64
        } else {
            0.0
        };
        Some(Summary {
            n,
            mean,
            variance,
            std_dev: variance.sqrt(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_of_empty_is_none() {
        assert!(Summary::of(&[]).is_none());
    }

    #[test]
    fn summary_matches_hand_computation() {
        let s = Summary::of(&[2.0, 4.0, 6.0]).unwrap();
        assert_eq!(s.n, 3);
        assert!((s.mean - 4.0).abs() < 1e-12);
        assert!((s.variance - 4.0).abs() < 1e-12);
        assert!((s.std_dev - 2.0).abs() < 1e-12);
    }
}
