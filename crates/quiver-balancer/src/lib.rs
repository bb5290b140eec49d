//! Quiver Balancer
//!
//! Load-balancing orchestrator for a pool of vector-search nodes:
//! registry with health probes and per-node circuit breakers, seven
//! pluggable selection policies, session affinity, and deadline-aware
//! dispatch.
//!
//! # Architecture
//!
//! The registry is the single point of shared mutation. Per-node
//! counters are atomic, membership sits in a lock-free map, and the
//! policies only ever read id-sorted snapshots, so parallel dispatches
//! never contend on a global lock.

pub mod breaker;
pub mod health;
pub mod node;
pub mod orchestrator;
pub mod policy;
pub mod registry;

pub use breaker::{BreakerState, CircuitBreaker};
pub use health::{HealthMonitor, HealthProbe};
pub use node::{Node, NodeConfig, NodeHealth, NodeMetrics, NodeSnapshot, NodeStatus, TopologyHints};
pub use orchestrator::{Backend, BalancerStats, LoadBalancer};
pub use policy::{PolicyEngine, SelectionAlgorithm, SelectionContext};
pub use registry::NodeRegistry;

use std::time::Duration;

/// Load balancer configuration.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub algorithm: SelectionAlgorithm,
    pub health_check_interval: Duration,
    /// Upper bound on a single probe call.
    pub probe_timeout: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_open_duration: Duration,
    pub session_affinity: bool,
    /// How long a draining node keeps finishing in-flight work.
    pub grace_period: Duration,
    pub adaptive_weighting: bool,
    /// Default dispatch deadline when the request carries none.
    pub dispatch_timeout: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: SelectionAlgorithm::RoundRobin,
            health_check_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            circuit_breaker_threshold: 5,
            circuit_breaker_open_duration: Duration::from_secs(30),
            session_affinity: false,
            grace_period: Duration::from_secs(30),
            adaptive_weighting: false,
            dispatch_timeout: Duration::from_secs(30),
        }
    }
}
