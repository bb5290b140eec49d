//! Experiment scenarios: stickiness, lifecycle gating, synthetic
//! analysis with a clear winner, early stopping.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use quiver_core::{ControlError, EventBus, Result, SearchRequest};
use quiver_experiments::{
    Experiment, ExperimentConfig, ExperimentStatus, Recommendation, VariantImpl, VariantOutcome,
};

struct Echo;

#[async_trait]
impl VariantImpl for Echo {
    async fn run(&self, _ctx: &SearchRequest, config: &Value) -> Result<VariantOutcome> {
        Ok(VariantOutcome::new(config.clone()))
    }
}

struct Failing;

#[async_trait]
impl VariantImpl for Failing {
    async fn run(&self, _ctx: &SearchRequest, _config: &Value) -> Result<VariantOutcome> {
        Err(ControlError::BackendFailure {
            node_id: "n/a".to_string(),
            reason: "variant blew up".to_string(),
        })
    }
}

fn config() -> ExperimentConfig {
    ExperimentConfig {
        minimum_run_time: Duration::ZERO,
        analysis_interval: Duration::from_secs(3600),
        ..ExperimentConfig::default()
    }
}

fn experiment_with(config: ExperimentConfig) -> Arc<Experiment> {
    let exp = Experiment::new("exp-1", "ranker-test", config, Arc::new(EventBus::default()))
        .unwrap();
    exp.add_variant("control", "Control", json!({"ranker": "v1"}), Arc::new(Echo))
        .unwrap();
    exp.add_variant("treatment", "Treatment", json!({"ranker": "v2"}), Arc::new(Echo))
        .unwrap();
    exp
}

/// Deterministic noise around a mean.
fn synthetic(mean: f64, spread: f64, n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let phase = i as f64 * 0.7390851;
            mean + spread * (phase.sin() + 0.31 * (3.1 * phase).cos())
        })
        .collect()
}

fn request(participant: &str) -> SearchRequest {
    SearchRequest::new("vector_search", json!({"k": 4})).with_participant(participant)
}

#[tokio::test]
async fn participant_assignment_is_sticky() {
    let exp = experiment_with(config());
    exp.start().unwrap();

    for participant in ["alice", "bob", "carol", "dave"] {
        let first = exp
            .execute(&request(participant))
            .await
            .unwrap()
            .expect("full allocation admits everyone")
            .variant_id;
        for _ in 0..10 {
            let again = exp
                .execute(&request(participant))
                .await
                .unwrap()
                .unwrap()
                .variant_id;
            assert_eq!(again, first, "assignment moved for {participant}");
        }
    }
    exp.stop("test over").unwrap();
}

#[tokio::test]
async fn assignment_spreads_across_variants() {
    let exp = experiment_with(config());
    exp.start().unwrap();

    let mut control = 0u32;
    let mut treatment = 0u32;
    for i in 0..500 {
        let result = exp
            .execute(&request(&format!("user-{i}")))
            .await
            .unwrap()
            .unwrap();
        match result.variant_id.as_str() {
            "control" => control += 1,
            "treatment" => treatment += 1,
            other => panic!("unknown variant {other}"),
        }
    }
    assert_eq!(exp.total_participants(), 500);
    // A uniform-looking hash keeps both arms populated.
    assert!(control > 150, "control = {control}");
    assert!(treatment > 150, "treatment = {treatment}");
}

#[tokio::test]
async fn lifecycle_is_gated() {
    let events = Arc::new(EventBus::default());
    let exp = Experiment::new("exp-2", "lifecycle", config(), events).unwrap();

    // Too few variants.
    exp.add_variant("only", "Only", Value::Null, Arc::new(Echo))
        .unwrap();
    assert!(exp.start().is_err());

    // Duplicate variant id.
    assert!(matches!(
        exp.add_variant("only", "Again", Value::Null, Arc::new(Echo)),
        Err(ControlError::Conflict { .. })
    ));

    exp.add_variant("second", "Second", Value::Null, Arc::new(Echo))
        .unwrap();
    exp.start().unwrap();
    assert_eq!(exp.status(), ExperimentStatus::Running);

    // No additions after start; no double start.
    assert!(exp
        .add_variant("third", "Third", Value::Null, Arc::new(Echo))
        .is_err());
    assert!(exp.start().is_err());

    exp.stop("done").unwrap();
    assert_eq!(exp.status(), ExperimentStatus::Stopped);
    assert!(exp.stop("again").is_err());
    assert!(exp.execute(&request("late")).await.is_err());
}

#[tokio::test]
async fn failing_variant_still_records_latency() {
    let events = Arc::new(EventBus::default());
    let exp = Experiment::new("exp-3", "failures", config(), events).unwrap();
    exp.add_variant("control", "Control", Value::Null, Arc::new(Failing))
        .unwrap();
    exp.add_variant("treatment", "Treatment", Value::Null, Arc::new(Failing))
        .unwrap();
    exp.start().unwrap();

    let err = exp.execute(&request("alice")).await.unwrap_err();
    assert!(matches!(err, ControlError::BackendFailure { .. }));

    let snapshot = exp.snapshot();
    let sampled: usize = snapshot.variants.iter().map(|v| v.sample_count).sum();
    assert_eq!(sampled, 1, "latency must be recorded despite the error");
}

#[tokio::test]
async fn clear_winner_is_significant_and_recommended() {
    let exp = experiment_with(config());
    exp.start().unwrap();

    // Synthetic load: control ~100 ms, treatment ~90 ms, sigma ~5 ms.
    let variants = exp.snapshot().variants;
    assert_eq!(variants.len(), 2);
    for (variant_id, mean) in [("control", 100.0), ("treatment", 90.0)] {
        let samples = synthetic(mean, 5.0, 1000);
        let variant = exp.variant(variant_id).unwrap();
        for value in samples {
            variant.record_sample(value);
        }
    }

    let report = exp.interim_analysis().unwrap();
    let comparison = &report.comparisons[0];
    assert!(comparison.statistically_significant);
    assert!(
        (comparison.relative_improvement - 0.10).abs() < 0.02,
        "improvement = {}",
        comparison.relative_improvement
    );
    assert_eq!(report.winner.as_deref(), Some("treatment"));
    assert!(!report.reduced_confidence);
    assert_eq!(report.recommendation, Recommendation::Implement);

    // With a p-value this small, early stopping triggers.
    assert!(exp.should_stop_early().is_some());
    exp.stop("winner found").unwrap();
    assert!(exp.last_analysis().is_some());
}

#[tokio::test]
async fn identical_variants_keep_collecting() {
    let mut cfg = config();
    cfg.minimum_sample_size = 10_000;
    let exp = experiment_with(cfg);
    exp.start().unwrap();

    for variant_id in ["control", "treatment"] {
        let variant = exp.variant(variant_id).unwrap();
        for value in synthetic(100.0, 5.0, 200) {
            variant.record_sample(value);
        }
    }

    let report = exp.interim_analysis().unwrap();
    assert!(report.winner.is_none());
    assert_eq!(report.recommendation, Recommendation::CollectMore);
    assert!(exp.should_stop_early().is_none());
}

#[tokio::test]
async fn traffic_allocation_gates_a_share_of_requests() {
    let cfg = ExperimentConfig {
        traffic_allocation: 0.2,
        minimum_run_time: Duration::ZERO,
        ..ExperimentConfig::default()
    };
    let exp = experiment_with(cfg);
    exp.start().unwrap();

    let mut admitted = 0u32;
    for i in 0..1000 {
        if exp
            .execute(&request(&format!("user-{i}")))
            .await
            .unwrap()
            .is_some()
        {
            admitted += 1;
        }
    }
    // ~200 expected; generous bounds against sampling noise.
    assert!((100..=320).contains(&admitted), "admitted = {admitted}");
}
