//! Auto-scaling controller
//!
//! Periodically evaluates windowed utilization means and grows or
//! shrinks the instance pool within configured bounds, honoring a
//! cooldown between actions. Launch/terminate calls go through the
//! `InstanceProvisioner` seam; failures there are logged and retried
//! naturally on the next evaluation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quiver_core::{ControlError, ControlEvent, EventBus, Result};

use crate::window::MetricWindow;
use crate::AutoScaleConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Initializing,
    Running,
    Terminating,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleInstance {
    pub id: String,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
}

/// What one evaluation decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDecision {
    /// Inside the cooldown window.
    Cooldown,
    /// No samples in the metric window yet.
    NoData,
    Hold,
    ScaledUp { from: usize, to: usize },
    ScaledDown { from: usize, to: usize },
}

/// Orchestrator-facing seam that actually adds or removes capacity.
#[async_trait]
pub trait InstanceProvisioner: Send + Sync {
    async fn launch(&self, instance_id: &str) -> Result<()>;
    async fn terminate(&self, instance_id: &str) -> Result<()>;
}

/// No-op provisioner for tests and dry runs.
pub struct NullProvisioner;

#[async_trait]
impl InstanceProvisioner for NullProvisioner {
    async fn launch(&self, _instance_id: &str) -> Result<()> {
        Ok(())
    }

    async fn terminate(&self, _instance_id: &str) -> Result<()> {
        Ok(())
    }
}

struct Windows {
    cpu: MetricWindow,
    mem: MetricWindow,
    throughput: MetricWindow,
    response_time: MetricWindow,
}

pub struct AutoScaler {
    config: AutoScaleConfig,
    /// Insertion-ordered so "most recently added" is the back.
    instances: Mutex<Vec<ScaleInstance>>,
    windows: Mutex<Windows>,
    provisioner: Arc<dyn InstanceProvisioner>,
    events: Arc<EventBus>,
    last_scaling_at: Mutex<Option<Instant>>,
}

impl AutoScaler {
    pub fn new(
        config: AutoScaleConfig,
        provisioner: Arc<dyn InstanceProvisioner>,
        events: Arc<EventBus>,
    ) -> Result<Arc<Self>> {
        if config.min_instances > config.max_instances {
            return Err(ControlError::invalid(
                "min_instances",
                "min_instances must not exceed max_instances",
            ));
        }
        let retention = config.retention;
        Ok(Arc::new(Self {
            config,
            instances: Mutex::new(Vec::new()),
            windows: Mutex::new(Windows {
                cpu: MetricWindow::new(retention),
                mem: MetricWindow::new(retention),
                throughput: MetricWindow::new(retention),
                response_time: MetricWindow::new(retention),
            }),
            provisioner,
            events,
            last_scaling_at: Mutex::new(None),
        }))
    }

    /// Seed the pool to the minimum and spawn the evaluation loop.
    pub async fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let current = self.pool_size();
        if current < self.config.min_instances {
            self.add_instances(self.config.min_instances - current).await;
        }

        let scaler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scaler.config.eval_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match scaler.evaluate().await {
                            Ok(decision) => debug!(?decision, "autoscale evaluation"),
                            Err(err) => warn!(error = %err, "autoscale evaluation failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        // A dropped sender also means shutdown.
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("autoscaler stopped");
        })
    }

    /// Feed one utilization sample set into the rolling windows.
    /// `cpu` and `mem` are percentages in [0, 100].
    pub fn record_metrics(&self, cpu: f64, mem: f64, throughput: f64, response_time_ms: f64) {
        let mut windows = self.windows.lock();
        windows.cpu.record(cpu);
        windows.mem.record(mem);
        windows.throughput.record(throughput);
        windows.response_time.record(response_time_ms);
    }

    /// One evaluation pass: cooldown gate, windowed means, then the
    /// scale-up / scale-down target arithmetic.
    pub async fn evaluate(self: &Arc<Self>) -> Result<ScaleDecision> {
        if let Some(last) = *self.last_scaling_at.lock() {
            if last.elapsed() < self.config.cooldown {
                return Ok(ScaleDecision::Cooldown);
            }
        }

        let (cpu, mem, throughput, response_time) = {
            let windows = self.windows.lock();
            (
                windows.cpu.mean_over(self.config.metric_window),
                windows.mem.mean_over(self.config.metric_window),
                windows.throughput.mean_over(self.config.metric_window),
                windows.response_time.mean_over(self.config.metric_window),
            )
        };
        let Some(cpu) = cpu else {
            return Ok(ScaleDecision::NoData);
        };
        let mem = mem.unwrap_or(0.0);
        debug!(
            cpu,
            mem,
            throughput = throughput.unwrap_or(0.0),
            response_time_ms = response_time.unwrap_or(0.0),
            "windowed means"
        );

        let current = self.pool_size();
        if cpu > self.config.scale_up_threshold || mem > self.config.scale_up_threshold {
            let target = ((current as f64 * cpu / self.config.target_cpu).ceil() as usize)
                .min(self.config.max_instances);
            if target > current {
                info!(current, target, cpu, mem, "scaling up");
                self.add_instances(target - current).await;
                self.finish_scaling(current, target, "utilization above scale-up threshold");
                return Ok(ScaleDecision::ScaledUp {
                    from: current,
                    to: target,
                });
            }
            Ok(ScaleDecision::Hold)
        } else if cpu < self.config.scale_down_threshold && mem < self.config.scale_down_threshold
        {
            let target = ((current as f64 * cpu / self.config.target_cpu).floor() as usize)
                .max(self.config.min_instances);
            if target < current {
                info!(current, target, cpu, mem, "scaling down");
                self.remove_instances(current - target).await;
                self.finish_scaling(current, target, "utilization below scale-down threshold");
                return Ok(ScaleDecision::ScaledDown {
                    from: current,
                    to: target,
                });
            }
            Ok(ScaleDecision::Hold)
        } else {
            Ok(ScaleDecision::Hold)
        }
    }

    async fn add_instances(self: &Arc<Self>, count: usize) {
        for _ in 0..count {
            let id = format!("inst-{}", Uuid::new_v4());
            if let Err(err) = self.provisioner.launch(&id).await {
                warn!(instance_id = %id, error = %err, "instance launch failed");
                continue;
            }
            self.instances.lock().push(ScaleInstance {
                id: id.clone(),
                status: InstanceStatus::Initializing,
                created_at: Utc::now(),
            });

            // Startup delay, then the instance serves.
            let scaler = Arc::clone(self);
            let startup = self.config.startup_delay;
            tokio::spawn(async move {
                tokio::time::sleep(startup).await;
                let mut instances = scaler.instances.lock();
                if let Some(instance) = instances.iter_mut().find(|i| i.id == id) {
                    if instance.status == InstanceStatus::Initializing {
                        instance.status = InstanceStatus::Running;
                    }
                }
            });
        }
    }

    /// Terminate the most recently added surplus first.
    async fn remove_instances(self: &Arc<Self>, count: usize) {
        let victims: Vec<String> = {
            let mut instances = self.instances.lock();
            instances
                .iter_mut()
                .rev()
                .filter(|i| i.status != InstanceStatus::Terminating)
                .take(count)
                .map(|i| {
                    i.status = InstanceStatus::Terminating;
                    i.id.clone()
                })
                .collect()
        };

        for id in victims {
            if let Err(err) = self.provisioner.terminate(&id).await {
                warn!(instance_id = %id, error = %err, "instance terminate failed");
            }

            // Drain delay, then drop the record.
            let scaler = Arc::clone(self);
            let drain = self.config.drain_delay;
            tokio::spawn(async move {
                tokio::time::sleep(drain).await;
                scaler.instances.lock().retain(|i| i.id != id);
            });
        }
    }

    fn finish_scaling(&self, before: usize, after: usize, reason: &str) {
        *self.last_scaling_at.lock() = Some(Instant::now());
        self.events.publish(ControlEvent::ScalingCompleted {
            before,
            after,
            reason: reason.to_string(),
        });
    }

    /// Instances counted toward capacity (not yet terminating).
    pub fn pool_size(&self) -> usize {
        self.instances
            .lock()
            .iter()
            .filter(|i| i.status != InstanceStatus::Terminating)
            .count()
    }

    pub fn instances(&self) -> Vec<ScaleInstance> {
        self.instances.lock().clone()
    }

    pub fn status(&self) -> AutoScalerStatus {
        let instances = self.instances.lock();
        let count_by = |status: InstanceStatus| {
            instances.iter().filter(|i| i.status == status).count()
        };
        AutoScalerStatus {
            total: instances.len(),
            initializing: count_by(InstanceStatus::Initializing),
            running: count_by(InstanceStatus::Running),
            terminating: count_by(InstanceStatus::Terminating),
            in_cooldown: self
                .last_scaling_at
                .lock()
                .is_some_and(|at| at.elapsed() < self.config.cooldown),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoScalerStatus {
    pub total: usize,
    pub initializing: usize,
    pub running: usize,
    pub terminating: usize,
    pub in_cooldown: bool,
}
