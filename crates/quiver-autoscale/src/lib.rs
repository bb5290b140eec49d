//! Quiver Autoscale
//!
//! Elastic capacity for the serving pool: rolling utilization windows
//! feed a periodic evaluation that grows or shrinks the instance set
//! between configured bounds, with a cooldown between actions and a
//! startup/drain lifecycle per instance.

pub mod controller;
pub mod window;

pub use controller::{
    AutoScaler, AutoScalerStatus, InstanceProvisioner, InstanceStatus, NullProvisioner,
    ScaleDecision, ScaleInstance,
};
pub use window::MetricWindow;

use std::time::Duration;

/// Auto-scaler configuration.
#[derive(Debug, Clone)]
pub struct AutoScaleConfig {
    pub min_instances: usize,
    pub max_instances: usize,
    /// Utilization the pool is sized toward, percent.
    pub target_cpu: f64,
    pub target_mem: f64,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub eval_period: Duration,
    /// Minimum spacing between scaling actions.
    pub cooldown: Duration,
    /// Trailing slice the evaluation averages over.
    pub metric_window: Duration,
    /// How long samples stay in the rolling windows.
    pub retention: Duration,
    pub startup_delay: Duration,
    pub drain_delay: Duration,
}

impl Default for AutoScaleConfig {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 10,
            target_cpu: 70.0,
            target_mem: 80.0,
            scale_up_threshold: 85.0,
            scale_down_threshold: 30.0,
            eval_period: Duration::from_secs(300),
            cooldown: Duration::from_secs(600),
            metric_window: Duration::from_secs(300),
            retention: Duration::from_secs(600),
            startup_delay: Duration::from_secs(30),
            drain_delay: Duration::from_secs(30),
        }
    }
}
