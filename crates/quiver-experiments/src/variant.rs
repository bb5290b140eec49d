//! Experiment variants
//!
//! A variant pairs an opaque implementation with its accumulated
//! observations. The experiment owns the list; insertion order is the
//! assignment order and never changes after start.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use quiver_core::{Result, SearchRequest};

/// One arm's implementation: an opaque callable over the request and
/// the variant's configuration.
#[async_trait]
pub trait VariantImpl: Send + Sync {
    async fn run(&self, ctx: &SearchRequest, config: &Value) -> Result<VariantOutcome>;
}

/// What a variant implementation hands back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantOutcome {
    pub payload: Value,
    /// Extra per-request measurements, appended per key.
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    #[serde(default)]
    pub converted: bool,
}

impl VariantOutcome {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            metrics: HashMap::new(),
            converted: false,
        }
    }
}

/// Accumulated observations for one variant.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct VariantStats {
    pub participants: u64,
    pub conversions: u64,
    /// Wall latency per execution, milliseconds.
    pub samples: Vec<f64>,
    pub custom_metrics: HashMap<String, Vec<f64>>,
}

pub struct Variant {
    pub id: String,
    pub name: String,
    pub config: Value,
    pub started_at: DateTime<Utc>,
    implementation: Arc<dyn VariantImpl>,
    stats: Mutex<VariantStats>,
}

impl Variant {
    pub fn new(id: &str, name: &str, config: Value, implementation: Arc<dyn VariantImpl>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            config,
            started_at: Utc::now(),
            implementation,
            stats: Mutex::new(VariantStats::default()),
        }
    }

    pub fn implementation(&self) -> Arc<dyn VariantImpl> {
        Arc::clone(&self.implementation)
    }

    /// Record one execution. Latency lands in the samples even when
    /// the implementation failed.
    pub fn record_execution(&self, latency_ms: f64, outcome: Option<&VariantOutcome>) {
        let mut stats = self.stats.lock();
        stats.participants += 1;
        stats.samples.push(latency_ms);
        if let Some(outcome) = outcome {
            if outcome.converted {
                stats.conversions += 1;
            }
            for (key, value) in &outcome.metrics {
                stats
                    .custom_metrics
                    .entry(key.clone())
                    .or_default()
                    .push(*value);
            }
        }
    }

    /// Record a primary-metric observation directly, without running
    /// the implementation (offline or replayed traffic).
    pub fn record_sample(&self, value: f64) {
        let mut stats = self.stats.lock();
        stats.participants += 1;
        stats.samples.push(value);
    }

    /// Observations for the named metric: wall latency under
    /// `latency_ms`, otherwise the matching custom series.
    pub fn samples_for(&self, metric: &str) -> Vec<f64> {
        let stats = self.stats.lock();
        if metric == "latency_ms" {
            stats.samples.clone()
        } else {
            stats.custom_metrics.get(metric).cloned().unwrap_or_default()
        }
    }

    pub fn stats(&self) -> VariantStats {
        self.stats.lock().clone()
    }

    pub fn snapshot(&self) -> VariantSnapshot {
        let stats = self.stats.lock();
        let mean = if stats.samples.is_empty() {
            0.0
        } else {
            stats.samples.iter().sum::<f64>() / stats.samples.len() as f64
        };
        VariantSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            participants: stats.participants,
            conversions: stats.conversions,
            sample_count: stats.samples.len(),
            mean_sample: mean,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSnapshot {
    pub id: String,
    pub name: String,
    pub participants: u64,
    pub conversions: u64,
    pub sample_count: usize,
    pub mean_sample: f64,
}
