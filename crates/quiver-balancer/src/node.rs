//! Node model - static configuration split from live counters
//!
//! The registry owns each node; selection policies only ever see
//! `NodeSnapshot` values taken from the live state, so the request
//! path stays lock-free.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::breaker::BreakerState;

/// Node lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    /// Finishing in-flight requests; never selectable.
    Draining,
    Removed,
}

/// Static configuration supplied when a node registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub endpoint: String,
    /// Selection weight, >= 1.
    pub weight: u32,
    /// Concurrent-request capacity used by resource scoring.
    pub capacity: u32,
    pub tags: Vec<String>,
    pub topology: Option<TopologyHints>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            weight: 1,
            capacity: 100,
            tags: Vec::new(),
            topology: None,
        }
    }
}

/// Placement hints for topology-aware selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyHints {
    pub local_accelerators: u32,
    pub interconnect_gbps: f64,
    pub peer_ids: Vec<String>,
    pub memory_capacity_bytes: u64,
    pub available_memory_bytes: u64,
}

/// A registered node (configuration + lifecycle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub endpoint: String,
    pub weight: u32,
    pub capacity: u32,
    pub tags: Vec<String>,
    pub topology: Option<TopologyHints>,
    pub status: NodeStatus,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn from_config(id: &str, cfg: NodeConfig) -> Self {
        Self {
            id: id.to_string(),
            endpoint: cfg.endpoint,
            weight: cfg.weight.max(1),
            capacity: cfg.capacity,
            tags: cfg.tags,
            topology: cfg.topology,
            status: NodeStatus::Active,
            created_at: Utc::now(),
        }
    }
}

/// Live per-node counters, lock-free on the request path.
#[derive(Debug, Default)]
pub struct NodeState {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    current_load: AtomicU32,
    /// Cumulative latency across successful requests, microseconds.
    success_latency_us: AtomicU64,
    cpu_util_bits: AtomicU64,
    mem_util_bits: AtomicU64,
    last_update_ms: AtomicU64,
}

impl NodeState {
    /// Must be paired with `record_end`.
    pub fn record_start(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.current_load.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_end(&self, success: bool, latency_ms: f64) {
        let _ = self
            .current_load
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |load| {
                Some(load.saturating_sub(1))
            });
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
            self.success_latency_us
                .fetch_add((latency_ms * 1000.0).max(0.0) as u64, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.touch();
    }

    pub fn set_utilization(&self, cpu: f64, mem: f64) {
        self.cpu_util_bits
            .store(cpu.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        self.mem_util_bits
            .store(mem.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        self.touch();
    }

    pub fn current_load(&self) -> u32 {
        self.current_load.load(Ordering::Relaxed)
    }

    /// Incremental mean over successful requests only.
    pub fn avg_response_time_ms(&self) -> f64 {
        let successes = self.successes.load(Ordering::Relaxed);
        if successes == 0 {
            return 0.0;
        }
        self.success_latency_us.load(Ordering::Relaxed) as f64 / 1000.0 / successes as f64
    }

    pub fn metrics(&self) -> NodeMetrics {
        NodeMetrics {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            current_load: self.current_load.load(Ordering::Relaxed),
            avg_response_time_ms: self.avg_response_time_ms(),
            cpu_util: f64::from_bits(self.cpu_util_bits.load(Ordering::Relaxed)),
            mem_util: f64::from_bits(self.mem_util_bits.load(Ordering::Relaxed)),
            last_update_ms: self.last_update_ms.load(Ordering::Relaxed),
        }
    }

    fn touch(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
    }
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub current_load: u32,
    pub avg_response_time_ms: f64,
    pub cpu_util: f64,
    pub mem_util: f64,
    pub last_update_ms: u64,
}

/// Probe-facing health record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    pub healthy: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            last_probe_at: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Read-only view handed to selection policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub endpoint: String,
    pub weight: u32,
    pub capacity: u32,
    pub tags: Vec<String>,
    pub topology: Option<TopologyHints>,
    pub status: NodeStatus,
    pub metrics: NodeMetrics,
    pub healthy: bool,
    pub breaker_state: BreakerState,
}

impl NodeSnapshot {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}
