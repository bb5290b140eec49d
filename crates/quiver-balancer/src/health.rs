//! Periodic health probe loop
//!
//! Probes run concurrently off the request path, each under a bounded
//! timeout. Outcomes feed the registry's health records and circuit
//! breakers; the loop itself never fails, it logs and continues.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use quiver_core::Result;

use crate::registry::NodeRegistry;

/// Probe transport. Implementations check one node and return Ok when
/// it is serving.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, node_id: &str, endpoint: &str) -> Result<()>;
}

pub struct HealthMonitor {
    registry: Arc<NodeRegistry>,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            probe,
            interval,
            probe_timeout,
        }
    }

    /// Spawn the probe loop; it exits when `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.probe_all().await,
                    changed = shutdown.changed() => {
                        // A dropped sender also means shutdown.
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("health monitor stopped");
        })
    }

    async fn probe_all(&self) {
        let targets = self.registry.probe_targets();
        let mut probes = Vec::with_capacity(targets.len());
        for (node_id, endpoint) in targets {
            let probe = Arc::clone(&self.probe);
            let registry = Arc::clone(&self.registry);
            let timeout = self.probe_timeout;
            probes.push(tokio::spawn(async move {
                match tokio::time::timeout(timeout, probe.probe(&node_id, &endpoint)).await {
                    Ok(Ok(())) => registry.probe_succeeded(&node_id),
                    Ok(Err(err)) => registry.probe_failed(&node_id, &err.to_string()),
                    Err(_) => registry.probe_failed(&node_id, "probe timed out"),
                }
            }));
        }
        for probe in probes {
            let _ = probe.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeConfig;
    use crate::BalancerConfig;
    use quiver_core::{ControlError, EventBus};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyProbe {
        failing: AtomicBool,
    }

    #[async_trait]
    impl HealthProbe for FlakyProbe {
        async fn probe(&self, _node_id: &str, _endpoint: &str) -> Result<()> {
            if self.failing.load(Ordering::Relaxed) {
                Err(ControlError::BackendFailure {
                    node_id: "a".to_string(),
                    reason: "simulated outage".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn probe_loop_opens_breaker_then_recovers() {
        let config = BalancerConfig {
            circuit_breaker_threshold: 3,
            circuit_breaker_open_duration: Duration::from_millis(100),
            ..BalancerConfig::default()
        };
        let registry = Arc::new(NodeRegistry::new(config, Arc::new(EventBus::default())));
        registry.add_node("a", NodeConfig::default()).unwrap();

        let probe = Arc::new(FlakyProbe {
            failing: AtomicBool::new(true),
        });
        let monitor = HealthMonitor::new(
            registry.clone(),
            probe.clone(),
            Duration::from_millis(20),
            Duration::from_millis(50),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = monitor.spawn(shutdown_rx);

        // Enough ticks to cross the failure threshold.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(registry.available_nodes().is_empty());

        // Recovery: probes succeed once the open interval elapses.
        probe.failing.store(false, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.available_nodes(), vec!["a".to_string()]);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
