//! Selection policies - pure over registry snapshots
//!
//! Every policy takes a pre-filtered, id-sorted candidate slice and
//! returns one node id. Ties break deterministically toward the lowest
//! id; the only internal state is the round-robin cursor.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::breaker::BreakerState;
use crate::node::NodeSnapshot;

/// Transfers above this size are placed by interconnect bandwidth.
const LARGE_TRANSFER_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectionAlgorithm {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
    ResourceScore,
    TopologyAware,
    AcceleratorAware,
}

/// Per-request hints consumed by the policies.
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub data_size_bytes: Option<u64>,
}

pub struct PolicyEngine {
    algorithm: SelectionAlgorithm,
    adaptive_weighting: bool,
    rr_cursor: AtomicU64,
}

impl PolicyEngine {
    pub fn new(algorithm: SelectionAlgorithm, adaptive_weighting: bool) -> Self {
        Self {
            algorithm,
            adaptive_weighting,
            rr_cursor: AtomicU64::new(0),
        }
    }

    pub fn algorithm(&self) -> SelectionAlgorithm {
        self.algorithm
    }

    /// Select one node from eligible, id-sorted candidates.
    ///
    /// Half-open nodes take a single trial request at a time, so settled
    /// peers are preferred whenever any exist.
    pub fn select(&self, candidates: &[NodeSnapshot], ctx: &SelectionContext) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let settled: Vec<&NodeSnapshot> = candidates
            .iter()
            .filter(|n| n.breaker_state != BreakerState::HalfOpen)
            .collect();
        let pool: Vec<&NodeSnapshot> = if settled.is_empty() {
            candidates.iter().collect()
        } else {
            settled
        };

        let chosen = match self.algorithm {
            SelectionAlgorithm::RoundRobin => self.round_robin(&pool),
            SelectionAlgorithm::WeightedRoundRobin => self.weighted(&pool),
            SelectionAlgorithm::LeastConnections => Self::least_connections(&pool),
            SelectionAlgorithm::LeastResponseTime => Self::least_response_time(&pool),
            SelectionAlgorithm::ResourceScore => Self::resource_score(&pool),
            SelectionAlgorithm::TopologyAware => Self::topology_aware(&pool, ctx),
            SelectionAlgorithm::AcceleratorAware => Self::accelerator_aware(&pool),
        };
        Some(chosen.id.clone())
    }

    fn round_robin<'a>(&self, pool: &[&'a NodeSnapshot]) -> &'a NodeSnapshot {
        let n = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
        pool[(n % pool.len() as u64) as usize]
    }

    /// Uniform draw in [0, total_weight) mapped through cumulative
    /// weights; equivalent to stride scheduling for integer weights.
    fn weighted<'a>(&self, pool: &[&'a NodeSnapshot]) -> &'a NodeSnapshot {
        let weights: Vec<f64> = pool.iter().map(|n| self.effective_weight(n, pool)).collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return self.round_robin(pool);
        }
        let mut draw = rand::thread_rng().gen_range(0.0..total);
        for (&node, weight) in pool.iter().zip(&weights) {
            if draw < *weight {
                return node;
            }
            draw -= weight;
        }
        pool[pool.len() - 1]
    }

    /// Configured weight, optionally scaled by inverse average latency
    /// relative to the pool mean. Nodes with no history keep their
    /// configured weight.
    fn effective_weight(&self, node: &NodeSnapshot, pool: &[&NodeSnapshot]) -> f64 {
        let base = f64::from(node.weight.max(1));
        if !self.adaptive_weighting {
            return base;
        }
        let avg = node.metrics.avg_response_time_ms;
        if avg <= 0.0 {
            return base;
        }
        let latencies: Vec<f64> = pool
            .iter()
            .map(|n| n.metrics.avg_response_time_ms)
            .filter(|&l| l > 0.0)
            .collect();
        if latencies.is_empty() {
            return base;
        }
        let pool_mean = latencies.iter().sum::<f64>() / latencies.len() as f64;
        base * (pool_mean / avg)
    }

    fn least_connections<'a>(pool: &[&'a NodeSnapshot]) -> &'a NodeSnapshot {
        argmin_by(pool, |n| f64::from(n.metrics.current_load))
    }

    /// Zero average latency means a node has not served yet; it goes
    /// first so new capacity warms up.
    fn least_response_time<'a>(pool: &[&'a NodeSnapshot]) -> &'a NodeSnapshot {
        argmin_by(pool, |n| {
            let avg = n.metrics.avg_response_time_ms;
            if avg == 0.0 {
                -1.0
            } else {
                avg
            }
        })
    }

    fn resource_score<'a>(pool: &[&'a NodeSnapshot]) -> &'a NodeSnapshot {
        argmax_by(pool, |n| Self::resource_score_of(n))
    }

    fn resource_score_of(node: &NodeSnapshot) -> f64 {
        let load_ratio = if node.capacity > 0 {
            (f64::from(node.metrics.current_load) / f64::from(node.capacity)).min(1.0)
        } else {
            1.0
        };
        0.4 * (1.0 - node.metrics.mem_util) + 0.3 * (1.0 - node.metrics.cpu_util)
            + 0.3 * (1.0 - load_ratio)
    }

    /// Mixes normalized available memory, inverse load, and either
    /// normalized interconnect bandwidth (large transfers) or inverse
    /// latency (small ones), weighted 0.4/0.3/0.3.
    fn topology_aware<'a>(pool: &[&'a NodeSnapshot], ctx: &SelectionContext) -> &'a NodeSnapshot {
        let large = ctx.data_size_bytes.unwrap_or(0) > LARGE_TRANSFER_BYTES;
        let max_mem = pool
            .iter()
            .filter_map(|n| n.topology.as_ref())
            .map(|t| t.available_memory_bytes)
            .max()
            .unwrap_or(0);
        let max_bw = pool
            .iter()
            .filter_map(|n| n.topology.as_ref())
            .map(|t| t.interconnect_gbps)
            .fold(0.0_f64, f64::max);

        argmax_by(pool, |n| {
            let mem_term = match (&n.topology, max_mem) {
                (Some(t), max) if max > 0 => t.available_memory_bytes as f64 / max as f64,
                _ => 0.0,
            };
            let load_term = 1.0 / (1.0 + f64::from(n.metrics.current_load));
            let third_term = if large {
                match (&n.topology, max_bw) {
                    (Some(t), max) if max > 0.0 => t.interconnect_gbps / max,
                    _ => 0.0,
                }
            } else {
                1.0 / (1.0 + n.metrics.avg_response_time_ms)
            };
            0.4 * mem_term + 0.3 * load_term + 0.3 * third_term
        })
    }

    /// Restricts to accelerator-capable nodes; falls back to resource
    /// scoring over the whole pool when none qualify.
    fn accelerator_aware<'a>(pool: &[&'a NodeSnapshot]) -> &'a NodeSnapshot {
        let capable: Vec<&NodeSnapshot> = pool
            .iter()
            .copied()
            .filter(|n| {
                n.has_tag("accelerator")
                    || n.topology
                        .as_ref()
                        .is_some_and(|t| t.local_accelerators > 0)
            })
            .collect();
        if capable.is_empty() {
            Self::resource_score(pool)
        } else {
            Self::resource_score(&capable)
        }
    }
}

/// First (lowest-id) element with the minimum key.
fn argmin_by<'a, F: Fn(&NodeSnapshot) -> f64>(
    pool: &[&'a NodeSnapshot],
    key: F,
) -> &'a NodeSnapshot {
    let mut best = pool[0];
    let mut best_key = key(best);
    for &node in &pool[1..] {
        let k = key(node);
        if k < best_key {
            best = node;
            best_key = k;
        }
    }
    best
}

/// First (lowest-id) element with the maximum key.
fn argmax_by<'a, F: Fn(&NodeSnapshot) -> f64>(
    pool: &[&'a NodeSnapshot],
    key: F,
) -> &'a NodeSnapshot {
    let mut best = pool[0];
    let mut best_key = key(best);
    for &node in &pool[1..] {
        let k = key(node);
        if k > best_key {
            best = node;
            best_key = k;
        }
    }
    best
}
