//! Experiment lifecycle and variant execution
//!
//! Assignment is sticky: the first execution for a participant fixes
//! the variant for the experiment's lifetime. The hash is md5 over
//! `"{participant}:{experiment}"` - stable and uniform-looking, with
//! no cryptographic claim.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use quiver_core::{ControlError, ControlEvent, EventBus, Result, SearchRequest};

use crate::analysis::AnalysisReport;
use crate::variant::{Variant, VariantImpl, VariantOutcome, VariantSnapshot};
use crate::ExperimentConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Created,
    Running,
    Stopped,
}

/// Result of one routed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub variant_id: String,
    pub variant_name: String,
    pub latency_ms: f64,
    pub outcome: VariantOutcome,
}

pub struct Experiment {
    pub id: String,
    pub name: String,
    pub(crate) config: ExperimentConfig,
    status: RwLock<ExperimentStatus>,
    variants: RwLock<Vec<Arc<Variant>>>,
    /// participant id -> variant id, fixed at first execution.
    assignments: DashMap<String, String>,
    total_participants: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    started_at_utc: Mutex<Option<DateTime<Utc>>>,
    stopped_at_utc: Mutex<Option<DateTime<Utc>>>,
    pub(crate) last_analysis: Mutex<Option<AnalysisReport>>,
    analysis_handle: Mutex<Option<JoinHandle<()>>>,
    pub(crate) events: Arc<EventBus>,
}

impl Experiment {
    pub fn new(
        id: &str,
        name: &str,
        config: ExperimentConfig,
        events: Arc<EventBus>,
    ) -> Result<Arc<Self>> {
        if !(config.traffic_allocation > 0.0 && config.traffic_allocation <= 1.0) {
            return Err(ControlError::invalid(
                "traffic_allocation",
                "must be in (0, 1]",
            ));
        }
        if !(config.significance_level > 0.0 && config.significance_level < 1.0) {
            return Err(ControlError::invalid(
                "significance_level",
                "must be in (0, 1)",
            ));
        }
        Ok(Arc::new(Self {
            id: id.to_string(),
            name: name.to_string(),
            config,
            status: RwLock::new(ExperimentStatus::Created),
            variants: RwLock::new(Vec::new()),
            assignments: DashMap::new(),
            total_participants: AtomicU64::new(0),
            started_at: Mutex::new(None),
            started_at_utc: Mutex::new(None),
            stopped_at_utc: Mutex::new(None),
            last_analysis: Mutex::new(None),
            analysis_handle: Mutex::new(None),
            events,
        }))
    }

    /// Add one arm. Only valid before start, so assignment stays
    /// stable; duplicates are a `Conflict`.
    pub fn add_variant(
        &self,
        id: &str,
        name: &str,
        config: Value,
        implementation: Arc<dyn VariantImpl>,
    ) -> Result<()> {
        if *self.status.read() != ExperimentStatus::Created {
            return Err(ControlError::invalid(
                "status",
                "variants can only be added before start",
            ));
        }
        let mut variants = self.variants.write();
        if variants.iter().any(|v| v.id == id) {
            return Err(ControlError::Conflict {
                resource: "variant".to_string(),
                id: id.to_string(),
            });
        }
        variants.push(Arc::new(Variant::new(id, name, config, implementation)));
        Ok(())
    }

    /// Transition to running and begin periodic interim analysis.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut status = self.status.write();
            if *status != ExperimentStatus::Created {
                return Err(ControlError::invalid("status", "experiment already started"));
            }
            if self.variants.read().len() < 2 {
                return Err(ControlError::invalid(
                    "variants",
                    "an experiment needs at least two variants",
                ));
            }
            *status = ExperimentStatus::Running;
        }
        *self.started_at.lock() = Some(Instant::now());
        *self.started_at_utc.lock() = Some(Utc::now());
        *self.analysis_handle.lock() = Some(self.spawn_analysis_loop());

        info!(experiment_id = %self.id, "experiment started");
        self.events.publish(ControlEvent::ExperimentStarted {
            experiment_id: self.id.clone(),
        });
        Ok(())
    }

    /// Periodic interim analysis; `stop` aborts the task.
    fn spawn_analysis_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let experiment = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(experiment.config.analysis_interval);
            ticker.tick().await; // interval fires immediately once
            loop {
                ticker.tick().await;
                if *experiment.status.read() != ExperimentStatus::Running {
                    break;
                }
                match experiment.interim_analysis() {
                    Ok(report) => debug!(
                        experiment_id = %experiment.id,
                        winner = ?report.winner,
                        "interim analysis"
                    ),
                    Err(err) => debug!(
                        experiment_id = %experiment.id,
                        error = %err,
                        "interim analysis skipped"
                    ),
                }
                if let Some(reason) = experiment.should_stop_early() {
                    if let Err(err) = experiment.stop(&reason) {
                        warn!(experiment_id = %experiment.id, error = %err, "early stop failed");
                    }
                    break;
                }
            }
        })
    }

    /// Finalize analysis and stop routing.
    pub fn stop(&self, reason: &str) -> Result<()> {
        {
            let mut status = self.status.write();
            if *status != ExperimentStatus::Running {
                return Err(ControlError::invalid("status", "experiment is not running"));
            }
            *status = ExperimentStatus::Stopped;
        }
        *self.stopped_at_utc.lock() = Some(Utc::now());

        // Final analysis; ignore an insufficient-samples outcome.
        if let Err(err) = self.interim_analysis() {
            debug!(experiment_id = %self.id, error = %err, "final analysis skipped");
        }
        if let Some(handle) = self.analysis_handle.lock().take() {
            handle.abort();
        }

        info!(experiment_id = %self.id, reason, "experiment stopped");
        self.events.publish(ControlEvent::ExperimentStopped {
            experiment_id: self.id.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Route one request through its assigned variant.
    ///
    /// Returns `None` when the traffic-allocation gate keeps the
    /// request out of the experiment. Latency is recorded even when
    /// the implementation errors; the error still propagates.
    pub async fn execute(&self, ctx: &SearchRequest) -> Result<Option<ExperimentResult>> {
        if *self.status.read() != ExperimentStatus::Running {
            return Err(ControlError::invalid("status", "experiment is not running"));
        }
        if self.config.traffic_allocation < 1.0
            && rand::thread_rng().gen::<f64>() >= self.config.traffic_allocation
        {
            return Ok(None);
        }

        let participant = ctx
            .participant_id
            .clone()
            .unwrap_or_else(|| ctx.request_id.to_string());
        let variant = self.assign(&participant)?;

        let started = Instant::now();
        let run = variant.implementation().run(ctx, &variant.config).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match run {
            Ok(outcome) => {
                variant.record_execution(latency_ms, Some(&outcome));
                Ok(Some(ExperimentResult {
                    variant_id: variant.id.clone(),
                    variant_name: variant.name.clone(),
                    latency_ms,
                    outcome,
                }))
            }
            Err(err) => {
                variant.record_execution(latency_ms, None);
                Err(err)
            }
        }
    }

    /// Sticky deterministic assignment for a participant.
    pub fn assign(&self, participant: &str) -> Result<Arc<Variant>> {
        let variants = self.variants.read();
        if variants.is_empty() {
            return Err(ControlError::invalid("variants", "no variants registered"));
        }

        if let Some(existing) = self.assignments.get(participant) {
            let id = existing.value().clone();
            drop(existing);
            return variants
                .iter()
                .find(|v| v.id == id)
                .cloned()
                .ok_or_else(|| ControlError::NotFound {
                    resource: "variant".to_string(),
                    id,
                });
        }

        let unit = Self::participant_unit(participant, &self.id);
        let index = ((unit * variants.len() as f64) as usize).min(variants.len() - 1);
        let chosen = Arc::clone(&variants[index]);

        // First writer wins under concurrent executions.
        let assigned_id = self
            .assignments
            .entry(participant.to_string())
            .or_insert_with(|| {
                self.total_participants.fetch_add(1, Ordering::Relaxed);
                chosen.id.clone()
            })
            .clone();

        if assigned_id == chosen.id {
            Ok(chosen)
        } else {
            variants
                .iter()
                .find(|v| v.id == assigned_id)
                .cloned()
                .ok_or_else(|| ControlError::NotFound {
                    resource: "variant".to_string(),
                    id: assigned_id,
                })
        }
    }

    /// Leading 32 bits of md5("{participant}:{experiment}") mapped
    /// into [0, 1).
    fn participant_unit(participant: &str, experiment_id: &str) -> f64 {
        let digest = md5::compute(format!("{participant}:{experiment_id}"));
        let lead = u32::from_be_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]]);
        f64::from(lead) / (f64::from(u32::MAX) + 1.0)
    }

    pub fn status(&self) -> ExperimentStatus {
        *self.status.read()
    }

    pub fn total_participants(&self) -> u64 {
        self.total_participants.load(Ordering::Relaxed)
    }

    pub(crate) fn variant_list(&self) -> Vec<Arc<Variant>> {
        self.variants.read().clone()
    }

    /// Look up one variant by id.
    pub fn variant(&self, id: &str) -> Option<Arc<Variant>> {
        self.variants.read().iter().find(|v| v.id == id).cloned()
    }

    pub fn runtime(&self) -> Option<Duration> {
        self.started_at.lock().map(|at| at.elapsed())
    }

    pub fn last_analysis(&self) -> Option<AnalysisReport> {
        self.last_analysis.lock().clone()
    }

    pub fn snapshot(&self) -> ExperimentSnapshot {
        ExperimentSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status(),
            started_at: *self.started_at_utc.lock(),
            stopped_at: *self.stopped_at_utc.lock(),
            total_participants: self.total_participants(),
            variants: self.variants.read().iter().map(|v| v.snapshot()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub id: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub total_participants: u64,
    pub variants: Vec<VariantSnapshot>,
}
