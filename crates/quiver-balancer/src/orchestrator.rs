//! Load-balancing orchestrator
//!
//! Ties the registry, the policy engine, and the health monitor
//! together: one `dispatch` call per request, with session affinity,
//! deadline enforcement, and paired load accounting.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use quiver_core::{BackendResponse, ControlError, EventBus, Result, SearchRequest};

use crate::health::{HealthMonitor, HealthProbe};
use crate::node::{NodeConfig, NodeSnapshot};
use crate::policy::{PolicyEngine, SelectionContext};
use crate::registry::NodeRegistry;
use crate::BalancerConfig;

/// Downstream vector-search backend. Request processing is opaque to
/// the control plane; only the outcome matters here.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn process(
        &self,
        node_id: &str,
        endpoint: &str,
        request: &SearchRequest,
    ) -> Result<serde_json::Value>;
}

pub struct LoadBalancer {
    registry: Arc<NodeRegistry>,
    policy: PolicyEngine,
    backend: Arc<dyn Backend>,
    config: BalancerConfig,
    /// session id -> bound node id
    affinity: DashMap<String, String>,
    total_requests: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    latency_total_us: AtomicU64,
    started_at: Instant,
    shutdown_tx: watch::Sender<bool>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LoadBalancer {
    /// Build the balancer and start its health probe loop.
    pub fn new(
        config: BalancerConfig,
        backend: Arc<dyn Backend>,
        probe: Arc<dyn HealthProbe>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let registry = Arc::new(NodeRegistry::new(config.clone(), events));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            probe,
            config.health_check_interval,
            config.probe_timeout,
        );
        let health_handle = monitor.spawn(shutdown_rx);

        Arc::new(Self {
            registry,
            policy: PolicyEngine::new(config.algorithm, config.adaptive_weighting),
            backend,
            config,
            affinity: DashMap::new(),
            total_requests: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            latency_total_us: AtomicU64::new(0),
            started_at: Instant::now(),
            shutdown_tx,
            health_handle: Mutex::new(Some(health_handle)),
        })
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn add_node(&self, id: &str, cfg: NodeConfig) -> Result<()> {
        self.registry.add_node(id, cfg)
    }

    pub fn remove_node(self: &Arc<Self>, id: &str) -> Result<()> {
        self.registry.remove_node(id)
    }

    /// Dispatch one request to a selected node.
    ///
    /// Fails with `NoAvailableNodes` when the eligible set is empty,
    /// `Timeout` past the caller deadline, or the backend's own error.
    /// Load accounting is paired in every branch.
    pub async fn dispatch(&self, request: &SearchRequest) -> Result<BackendResponse> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let candidates = self.registry.eligible_snapshots();
        let Some((node_id, endpoint)) = self.pick_node(&candidates, request) else {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
            return Err(ControlError::NoAvailableNodes);
        };

        self.registry.on_request_start(&node_id)?;
        let deadline = request.deadline.unwrap_or(self.config.dispatch_timeout);
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(deadline, self.backend.process(&node_id, &endpoint, request))
                .await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(Ok(payload)) => {
                self.registry.on_request_end(&node_id, true, latency_ms);
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                self.latency_total_us
                    .fetch_add((latency_ms * 1000.0) as u64, Ordering::Relaxed);
                Ok(BackendResponse {
                    node_id,
                    latency_ms,
                    payload,
                })
            }
            Ok(Err(err)) => {
                self.registry.on_request_end(&node_id, false, latency_ms);
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                debug!(node_id = %node_id, error = %err, "backend failure");
                Err(err)
            }
            Err(_) => {
                self.registry.on_request_end(&node_id, false, latency_ms);
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                Err(ControlError::Timeout {
                    operation: "dispatch".to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    /// Affinity first when enabled, then the configured policy. A new
    /// binding is recorded whenever the previous node is ineligible.
    fn pick_node(
        &self,
        candidates: &[NodeSnapshot],
        request: &SearchRequest,
    ) -> Option<(String, String)> {
        let ctx = SelectionContext {
            data_size_bytes: request.data_size_bytes,
        };

        if self.config.session_affinity {
            if let Some(session_id) = &request.session_id {
                if let Some(bound) = self.affinity.get(session_id) {
                    if let Some(node) = candidates.iter().find(|n| n.id == *bound.value()) {
                        return Some((node.id.clone(), node.endpoint.clone()));
                    }
                }
                let chosen = self.policy.select(candidates, &ctx)?;
                self.affinity.insert(session_id.clone(), chosen.clone());
                let node = candidates.iter().find(|n| n.id == chosen)?;
                return Some((node.id.clone(), node.endpoint.clone()));
            }
        }

        let chosen = self.policy.select(candidates, &ctx)?;
        let node = candidates.iter().find(|n| n.id == chosen)?;
        Some((node.id.clone(), node.endpoint.clone()))
    }

    /// Registry plus global counters as one serializable snapshot.
    pub fn stats(&self) -> BalancerStats {
        let uptime = self.started_at.elapsed();
        let total = self.total_requests.load(Ordering::Relaxed);
        let successes = self.total_successes.load(Ordering::Relaxed);
        let throughput_rps = if uptime.as_secs_f64() > 0.0 {
            total as f64 / uptime.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency_ms = if successes > 0 {
            self.latency_total_us.load(Ordering::Relaxed) as f64 / 1000.0 / successes as f64
        } else {
            0.0
        };
        BalancerStats {
            total_requests: total,
            total_successes: successes,
            total_failures: self.total_failures.load(Ordering::Relaxed),
            uptime_secs: uptime.as_secs(),
            throughput_rps,
            avg_latency_ms,
            nodes: self.registry.snapshots(),
        }
    }

    /// Two-phase shutdown: drain every node, wait out the grace
    /// period, then stop the background loops.
    pub async fn shutdown(&self) {
        info!("balancer shutting down: draining nodes");
        self.registry.drain_all();
        tokio::time::sleep(self.config.grace_period).await;

        let _ = self.shutdown_tx.send(true);
        let handle = self.health_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("balancer shutdown complete");
    }
}

/// Snapshot of registry and global counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerStats {
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub uptime_secs: u64,
    pub throughput_rps: f64,
    pub avg_latency_ms: f64,
    pub nodes: Vec<NodeSnapshot>,
}
