//! Node registry - the single point of shared mutation
//!
//! Membership lives in a lock-free map; per-node counters are atomic;
//! breaker and health records sit behind short-lived locks. Everything
//! the policies read is a snapshot.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use quiver_core::{ControlError, ControlEvent, EventBus, Result};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::node::{Node, NodeConfig, NodeHealth, NodeSnapshot, NodeState, NodeStatus};
use crate::BalancerConfig;

pub struct NodeEntry {
    pub node: RwLock<Node>,
    pub state: NodeState,
    pub health: RwLock<NodeHealth>,
    pub breaker: Mutex<CircuitBreaker>,
}

pub struct NodeRegistry {
    nodes: DashMap<String, Arc<NodeEntry>>,
    config: BalancerConfig,
    events: Arc<EventBus>,
}

impl NodeRegistry {
    pub fn new(config: BalancerConfig, events: Arc<EventBus>) -> Self {
        Self {
            nodes: DashMap::new(),
            config,
            events,
        }
    }

    /// Register a node. Duplicate ids are a `Conflict`.
    pub fn add_node(&self, id: &str, cfg: NodeConfig) -> Result<()> {
        if id.is_empty() {
            return Err(ControlError::invalid("id", "node id must be non-empty"));
        }
        if cfg.weight == 0 {
            return Err(ControlError::invalid("weight", "weight must be >= 1"));
        }

        match self.nodes.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ControlError::Conflict {
                resource: "node".to_string(),
                id: id.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let node = Node::from_config(id, cfg);
                let endpoint = node.endpoint.clone();
                slot.insert(Arc::new(NodeEntry {
                    node: RwLock::new(node),
                    state: NodeState::default(),
                    health: RwLock::new(NodeHealth::default()),
                    breaker: Mutex::new(CircuitBreaker::new(
                        self.config.circuit_breaker_threshold,
                        self.config.circuit_breaker_open_duration,
                    )),
                }));
                info!(node_id = %id, endpoint = %endpoint, "node registered");
                self.events.publish(ControlEvent::NodeAdded {
                    node_id: id.to_string(),
                });
                Ok(())
            }
        }
    }

    /// Start draining a node; it is deleted after the grace period.
    /// Draining nodes are never selectable but finish in-flight work.
    pub fn remove_node(self: &Arc<Self>, id: &str) -> Result<()> {
        let entry = self.nodes.get(id).ok_or_else(|| ControlError::NotFound {
            resource: "node".to_string(),
            id: id.to_string(),
        })?;
        {
            let mut node = entry.node.write();
            if node.status != NodeStatus::Active {
                return Ok(());
            }
            node.status = NodeStatus::Draining;
        }
        info!(node_id = %id, grace_secs = self.config.grace_period.as_secs(), "node draining");

        let registry = Arc::clone(self);
        let node_id = id.to_string();
        let grace = self.config.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.finalize_removal(&node_id);
        });
        Ok(())
    }

    fn finalize_removal(&self, id: &str) {
        if let Some((_, entry)) = self.nodes.remove(id) {
            entry.node.write().status = NodeStatus::Removed;
            info!(node_id = %id, "node removed");
            self.events.publish(ControlEvent::NodeRemoved {
                node_id: id.to_string(),
            });
        }
    }

    /// Ids eligible for selection: active, healthy, breaker not open.
    /// Sorted for deterministic tie-breaking downstream.
    pub fn available_nodes(&self) -> Vec<String> {
        self.eligible_snapshots()
            .into_iter()
            .map(|s| s.id)
            .collect()
    }

    /// Eligible nodes as policy-ready snapshots, sorted by id.
    pub fn eligible_snapshots(&self) -> Vec<NodeSnapshot> {
        let now = Instant::now();
        let mut out: Vec<NodeSnapshot> = self
            .nodes
            .iter()
            .filter_map(|entry| {
                let eligible = {
                    let node = entry.node.read();
                    node.status == NodeStatus::Active
                } && entry.health.read().healthy
                    && entry.breaker.lock().check_eligible(now);
                eligible.then(|| Self::snapshot_entry(&entry))
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// All registered nodes, regardless of eligibility, sorted by id.
    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        let mut out: Vec<NodeSnapshot> = self
            .nodes
            .iter()
            .map(|entry| Self::snapshot_entry(&entry))
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn get(&self, id: &str) -> Option<NodeSnapshot> {
        self.nodes.get(id).map(|entry| Self::snapshot_entry(&entry))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Must be paired with `on_request_end`.
    pub fn on_request_start(&self, id: &str) -> Result<()> {
        let entry = self.nodes.get(id).ok_or_else(|| ControlError::NotFound {
            resource: "node".to_string(),
            id: id.to_string(),
        })?;
        entry.state.record_start();
        Ok(())
    }

    /// Completes the pair opened by `on_request_start` and routes the
    /// outcome into the circuit breaker.
    pub fn on_request_end(&self, id: &str, success: bool, latency_ms: f64) {
        let Some(entry) = self.nodes.get(id) else {
            // Node deleted while the request was in flight.
            debug!(node_id = %id, "request ended on unregistered node");
            return;
        };
        entry.state.record_end(success, latency_ms);

        let mut breaker = entry.breaker.lock();
        if success {
            breaker.record_success();
        } else if breaker.record_failure(Instant::now()) {
            let failures = breaker.failure_count();
            drop(breaker);
            warn!(node_id = %id, failures, "circuit breaker opened");
            self.events.publish(ControlEvent::BreakerOpened {
                node_id: id.to_string(),
                failure_count: failures,
            });
        }
    }

    /// Utilization report from an external monitor (values in [0, 1]).
    pub fn record_utilization(&self, id: &str, cpu: f64, mem: f64) -> Result<()> {
        let entry = self.nodes.get(id).ok_or_else(|| ControlError::NotFound {
            resource: "node".to_string(),
            id: id.to_string(),
        })?;
        entry.state.set_utilization(cpu, mem);
        Ok(())
    }

    /// Probe targets: active nodes only.
    pub fn probe_targets(&self) -> Vec<(String, String)> {
        self.nodes
            .iter()
            .filter_map(|entry| {
                let node = entry.node.read();
                (node.status == NodeStatus::Active)
                    .then(|| (node.id.clone(), node.endpoint.clone()))
            })
            .collect()
    }

    pub fn probe_succeeded(&self, id: &str) {
        if let Some(entry) = self.nodes.get(id) {
            {
                let mut health = entry.health.write();
                health.healthy = true;
                health.consecutive_failures = 0;
                health.last_error = None;
                health.last_probe_at = Some(Utc::now());
            }
            // Closes a half-open breaker; no-op while fully open.
            entry.breaker.lock().record_success();
        }
    }

    pub fn probe_failed(&self, id: &str, error: &str) {
        let Some(entry) = self.nodes.get(id) else {
            return;
        };
        let consecutive = {
            let mut health = entry.health.write();
            health.consecutive_failures += 1;
            health.last_error = Some(error.to_string());
            health.last_probe_at = Some(Utc::now());
            if health.consecutive_failures >= self.config.circuit_breaker_threshold {
                health.healthy = false;
            }
            health.consecutive_failures
        };
        debug!(node_id = %id, consecutive, error, "health probe failed");

        let opened = {
            let mut breaker = entry.breaker.lock();
            breaker
                .record_failure(Instant::now())
                .then(|| breaker.failure_count())
        };
        if let Some(failures) = opened {
            warn!(node_id = %id, "circuit breaker opened by health probes");
            self.events.publish(ControlEvent::BreakerOpened {
                node_id: id.to_string(),
                failure_count: failures,
            });
        }
    }

    /// Shutdown phase one: stop handing out every node.
    pub fn drain_all(&self) {
        for entry in self.nodes.iter() {
            let mut node = entry.node.write();
            if node.status == NodeStatus::Active {
                node.status = NodeStatus::Draining;
            }
        }
        info!(nodes = self.nodes.len(), "all nodes draining");
    }

    fn snapshot_entry(entry: &NodeEntry) -> NodeSnapshot {
        let node = entry.node.read();
        NodeSnapshot {
            id: node.id.clone(),
            endpoint: node.endpoint.clone(),
            weight: node.weight,
            capacity: node.capacity,
            tags: node.tags.clone(),
            topology: node.topology.clone(),
            status: node.status,
            metrics: entry.state.metrics(),
            healthy: entry.health.read().healthy,
            breaker_state: entry.breaker.lock().state(),
        }
    }
}
