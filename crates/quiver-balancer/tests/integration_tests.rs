//! End-to-end balancer scenarios against a simulated backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quiver_balancer::{
    Backend, BalancerConfig, HealthProbe, LoadBalancer, NodeConfig, SelectionAlgorithm,
};
use quiver_core::{ControlError, EventBus, Result, SearchRequest};

/// Backend that answers instantly, or hangs/fails on demand.
struct SimBackend {
    hang: AtomicBool,
    fail: AtomicBool,
}

impl SimBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            hang: AtomicBool::new(false),
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Backend for SimBackend {
    async fn process(
        &self,
        node_id: &str,
        _endpoint: &str,
        _request: &SearchRequest,
    ) -> Result<serde_json::Value> {
        if self.hang.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.fail.load(Ordering::Relaxed) {
            return Err(ControlError::BackendFailure {
                node_id: node_id.to_string(),
                reason: "injected".to_string(),
            });
        }
        Ok(serde_json::json!({ "served_by": node_id }))
    }
}

struct AlwaysUp;

#[async_trait]
impl HealthProbe for AlwaysUp {
    async fn probe(&self, _node_id: &str, _endpoint: &str) -> Result<()> {
        Ok(())
    }
}

fn balancer(config: BalancerConfig, backend: Arc<SimBackend>) -> Arc<LoadBalancer> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    LoadBalancer::new(config, backend, Arc::new(AlwaysUp), Arc::new(EventBus::default()))
}

fn request() -> SearchRequest {
    SearchRequest::new("vector_search", serde_json::json!({ "k": 8 }))
}

#[tokio::test]
async fn weighted_dispatch_respects_weights() {
    let config = BalancerConfig {
        algorithm: SelectionAlgorithm::WeightedRoundRobin,
        ..BalancerConfig::default()
    };
    let lb = balancer(config, SimBackend::new());
    for (id, weight) in [("a", 1), ("b", 1), ("c", 2)] {
        lb.add_node(
            id,
            NodeConfig {
                endpoint: format!("http://{id}:9000"),
                weight,
                ..NodeConfig::default()
            },
        )
        .unwrap();
    }

    let mut counts: HashMap<String, u64> = HashMap::new();
    let draws = 10_000;
    for _ in 0..draws {
        let response = lb.dispatch(&request()).await.unwrap();
        *counts.entry(response.node_id).or_insert(0) += 1;
    }

    // Expected 2500 / 2500 / 5000; allow sampling noise.
    assert!((counts["a"] as i64 - 2500).abs() < 150, "a = {}", counts["a"]);
    assert!((counts["b"] as i64 - 2500).abs() < 150, "b = {}", counts["b"]);
    assert!((counts["c"] as i64 - 5000).abs() < 150, "c = {}", counts["c"]);

    let stats = lb.stats();
    assert_eq!(stats.total_requests, draws);
    assert_eq!(stats.total_successes, draws);
}

#[tokio::test]
async fn session_affinity_is_sticky_until_ineligible() {
    let config = BalancerConfig {
        algorithm: SelectionAlgorithm::RoundRobin,
        session_affinity: true,
        grace_period: Duration::from_millis(10),
        ..BalancerConfig::default()
    };
    let lb = balancer(config, SimBackend::new());
    for id in ["a", "b", "c"] {
        lb.add_node(id, NodeConfig::default()).unwrap();
    }

    let req = request().with_session("sess-7");
    let first = lb.dispatch(&req).await.unwrap().node_id;
    for _ in 0..20 {
        let again = lb.dispatch(&req).await.unwrap().node_id;
        assert_eq!(again, first, "affinity broke while the node was eligible");
    }

    // Once the bound node drains, the session re-binds elsewhere.
    lb.remove_node(&first).unwrap();
    let rebound = lb.dispatch(&req).await.unwrap().node_id;
    assert_ne!(rebound, first);
    for _ in 0..10 {
        assert_eq!(lb.dispatch(&req).await.unwrap().node_id, rebound);
    }
}

#[tokio::test]
async fn dispatch_times_out_and_pairs_accounting() {
    let backend = SimBackend::new();
    backend.hang.store(true, Ordering::Relaxed);
    let lb = balancer(BalancerConfig::default(), backend);
    lb.add_node("a", NodeConfig::default()).unwrap();

    let req = request().with_deadline(Duration::from_millis(50));
    let err = lb.dispatch(&req).await.unwrap_err();
    assert!(matches!(err, ControlError::Timeout { .. }));

    // on_request_end ran: no load left behind.
    let snapshot = lb.registry().get("a").unwrap();
    assert_eq!(snapshot.metrics.current_load, 0);
    assert_eq!(snapshot.metrics.failures, 1);
}

#[tokio::test]
async fn empty_pool_is_no_available_nodes() {
    let lb = balancer(BalancerConfig::default(), SimBackend::new());
    let err = lb.dispatch(&request()).await.unwrap_err();
    assert!(matches!(err, ControlError::NoAvailableNodes));
}

#[tokio::test]
async fn backend_failures_open_the_breaker_and_stop_dispatch() {
    let backend = SimBackend::new();
    backend.fail.store(true, Ordering::Relaxed);
    let lb = balancer(BalancerConfig::default(), backend.clone());
    lb.add_node("a", NodeConfig::default()).unwrap();

    for _ in 0..5 {
        let err = lb.dispatch(&request()).await.unwrap_err();
        assert!(matches!(err, ControlError::BackendFailure { .. }));
    }
    // Breaker is open; the pool is now empty.
    let err = lb.dispatch(&request()).await.unwrap_err();
    assert!(matches!(err, ControlError::NoAvailableNodes));
}

#[tokio::test]
async fn shutdown_drains_then_stops() {
    let config = BalancerConfig {
        grace_period: Duration::from_millis(30),
        ..BalancerConfig::default()
    };
    let lb = balancer(config, SimBackend::new());
    lb.add_node("a", NodeConfig::default()).unwrap();

    lb.shutdown().await;
    let err = lb.dispatch(&request()).await.unwrap_err();
    assert!(matches!(err, ControlError::NoAvailableNodes));
}
