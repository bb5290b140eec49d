//! Streaming manager
//!
//! Owns every stream: admission against the concurrency cap, the
//! per-stream deadline, cooperative cancellation, and a watchdog that
//! prunes terminal metrics and watches heap pressure. Streams run
//! independently; this registry is the only shared structure.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quiver_core::{ControlError, ControlEvent, EventBus, Result};

use crate::batch::{RateMeter, ThroughputEstimator};
use crate::pipeline::{run_pipeline, PipelineEnd, PipelineOptions, StreamProgress};
use crate::record::{StreamFormat, VectorRecord};
use crate::StreamingConfig;

/// Watchdog cadence and how long terminal metrics linger.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);
const TERMINAL_RETENTION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        self != StreamStatus::Active
    }
}

/// Per-stream creation options; unset fields fall back to the manager
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub format: Option<StreamFormat>,
    pub batch_size: Option<usize>,
    pub compression: Option<bool>,
    pub priority: u8,
}

/// Serializable stream metadata snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMeta {
    pub stream_id: String,
    pub created_at: DateTime<Utc>,
    pub status: StreamStatus,
    pub priority: u8,
    pub format: StreamFormat,
    pub compression: bool,
    pub batch_size: usize,
    pub chunks_emitted: u64,
    pub vectors_emitted: u64,
    pub bytes_emitted: u64,
    pub error_count: u64,
}

struct StreamHandle {
    id: Uuid,
    created_at: DateTime<Utc>,
    status: Mutex<StreamStatus>,
    terminal_at: Mutex<Option<Instant>>,
    priority: u8,
    format: StreamFormat,
    compression: bool,
    batch_size: usize,
    progress: Arc<StreamProgress>,
    cancel_tx: watch::Sender<bool>,
}

impl StreamHandle {
    /// First terminal transition wins; later ones are ignored.
    fn mark_terminal(&self, status: StreamStatus) -> bool {
        let mut current = self.status.lock();
        if current.is_terminal() {
            return false;
        }
        *current = status;
        *self.terminal_at.lock() = Some(Instant::now());
        true
    }

    fn meta(&self) -> StreamMeta {
        StreamMeta {
            stream_id: self.id.to_string(),
            created_at: self.created_at,
            status: *self.status.lock(),
            priority: self.priority,
            format: self.format,
            compression: self.compression,
            batch_size: self.batch_size,
            chunks_emitted: self.progress.chunks_emitted.load(Ordering::Relaxed),
            vectors_emitted: self.progress.vectors_emitted.load(Ordering::Relaxed),
            bytes_emitted: self.progress.bytes_emitted.load(Ordering::Relaxed),
            error_count: self.progress.error_count.load(Ordering::Relaxed),
        }
    }
}

/// A freshly created stream: its id, the framed output, and metadata.
pub struct CreatedStream {
    pub stream_id: Uuid,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub meta: StreamMeta,
}

impl std::fmt::Debug for CreatedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedStream")
            .field("stream_id", &self.stream_id)
            .field("meta", &self.meta)
            .finish()
    }
}

/// Process heap introspection seam; injectable so tests fake pressure.
pub trait MemoryGauge: Send + Sync {
    fn heap_used_bytes(&self) -> u64;
}

/// Gauge that reports no usage; pressure checks become no-ops.
pub struct NullMemoryGauge;

impl MemoryGauge for NullMemoryGauge {
    fn heap_used_bytes(&self) -> u64 {
        0
    }
}

pub struct StreamManager {
    streams: DashMap<Uuid, Arc<StreamHandle>>,
    config: StreamingConfig,
    events: Arc<EventBus>,
    memory: Arc<dyn MemoryGauge>,
    active: AtomicUsize,
}

impl StreamManager {
    pub fn new(config: StreamingConfig, events: Arc<EventBus>) -> Arc<Self> {
        Self::with_memory_gauge(config, events, Arc::new(NullMemoryGauge))
    }

    pub fn with_memory_gauge(
        config: StreamingConfig,
        events: Arc<EventBus>,
        memory: Arc<dyn MemoryGauge>,
    ) -> Arc<Self> {
        Arc::new(Self {
            streams: DashMap::new(),
            config,
            events,
            memory,
            active: AtomicUsize::new(0),
        })
    }

    /// Admit a new stream over `source` and spawn its pipeline.
    ///
    /// Fails with `CapacityExceeded` at the concurrency cap and
    /// `InvalidInput` on unusable options.
    pub fn create_stream(
        self: &Arc<Self>,
        source: mpsc::Receiver<VectorRecord>,
        options: StreamOptions,
    ) -> Result<CreatedStream> {
        if self.active.load(Ordering::Relaxed) >= self.config.max_concurrent_streams {
            return Err(ControlError::CapacityExceeded {
                resource: "streams".to_string(),
                limit: self.config.max_concurrent_streams as u64,
            });
        }
        let batch_size = options.batch_size.unwrap_or(self.config.default_batch_size);
        if batch_size == 0 {
            return Err(ControlError::invalid("batch_size", "must be >= 1"));
        }

        let id = Uuid::new_v4();
        let format = options.format.unwrap_or(StreamFormat::Json);
        let compression = options.compression.unwrap_or(self.config.compression);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let progress = Arc::new(StreamProgress::default());

        // Frame buffer sized so outstanding records stay at or under
        // the back-pressure threshold.
        let sink_frames = (self.config.backpressure_threshold / batch_size).max(1);
        let (sink_tx, sink_rx) = mpsc::channel::<Vec<u8>>(sink_frames);

        let handle = Arc::new(StreamHandle {
            id,
            created_at: Utc::now(),
            status: Mutex::new(StreamStatus::Active),
            terminal_at: Mutex::new(None),
            priority: options.priority,
            format,
            compression,
            batch_size,
            progress: Arc::clone(&progress),
            cancel_tx,
        });
        self.streams.insert(id, Arc::clone(&handle));
        self.active.fetch_add(1, Ordering::Relaxed);
        info!(stream_id = %id, ?format, batch_size, "stream created");
        self.events.publish(ControlEvent::StreamCreated {
            stream_id: id.to_string(),
        });

        let manager = Arc::clone(self);
        let opts = PipelineOptions {
            format,
            compression,
            compression_level: self.config.compression_level,
            batch_size,
            adaptive: self.config.adaptive_streaming,
        };
        let estimator: Arc<dyn ThroughputEstimator> = Arc::new(RateMeter::new());
        let deadline = self.config.stream_timeout;
        let meta = handle.meta();
        tokio::spawn(async move {
            manager
                .drive_stream(handle, source, sink_tx, opts, estimator, progress, cancel_rx, deadline)
                .await;
        });

        Ok(CreatedStream {
            stream_id: id,
            output: sink_rx,
            meta,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_stream(
        &self,
        handle: Arc<StreamHandle>,
        source: mpsc::Receiver<VectorRecord>,
        sink: mpsc::Sender<Vec<u8>>,
        opts: PipelineOptions,
        estimator: Arc<dyn ThroughputEstimator>,
        progress: Arc<StreamProgress>,
        cancel_rx: watch::Receiver<bool>,
        deadline: Duration,
    ) {
        let stream_id = handle.id.to_string();
        let outcome = tokio::select! {
            end = run_pipeline(
                &stream_id,
                source,
                sink,
                opts,
                estimator,
                Arc::clone(&progress),
                cancel_rx,
                Arc::clone(&self.events),
            ) => end,
            () = tokio::time::sleep(deadline) => {
                Err(ControlError::Timeout {
                    operation: "stream".to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
        };

        match outcome {
            Ok(PipelineEnd::Completed) => {
                if handle.mark_terminal(StreamStatus::Completed) {
                    let meta = handle.meta();
                    info!(stream_id = %stream_id, vectors = meta.vectors_emitted, "stream completed");
                    self.events.publish(ControlEvent::StreamCompleted {
                        stream_id,
                        vectors: meta.vectors_emitted,
                        bytes: meta.bytes_emitted,
                    });
                }
            }
            Ok(PipelineEnd::Cancelled) => {
                // Status was already set by `cancel`; this also covers a
                // consumer that simply went away.
                handle.mark_terminal(StreamStatus::Cancelled);
                debug!(stream_id = %stream_id, "stream cancelled");
            }
            Err(err) => {
                progress.error_count.fetch_add(1, Ordering::Relaxed);
                if handle.mark_terminal(StreamStatus::Failed) {
                    warn!(stream_id = %stream_id, error = %err, "stream failed");
                    self.events.publish(ControlEvent::StreamFailed {
                        stream_id,
                        reason: err.to_string(),
                    });
                }
            }
        }
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Cancel a stream; idempotent. Returns true when the id is known.
    pub fn cancel(&self, stream_id: &Uuid) -> bool {
        let Some(handle) = self.streams.get(stream_id) else {
            return false;
        };
        if handle.mark_terminal(StreamStatus::Cancelled) {
            // Unblocks a producer waiting on back-pressure.
            let _ = handle.cancel_tx.send(true);
            info!(stream_id = %stream_id, "stream cancelled by caller");
        }
        true
    }

    pub fn get(&self, stream_id: &Uuid) -> Option<StreamMeta> {
        self.streams.get(stream_id).map(|handle| handle.meta())
    }

    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Aggregate stats across live and lingering terminal streams.
    pub fn stats(&self) -> StreamingStats {
        let mut stats = StreamingStats {
            active: self.active_streams(),
            ..StreamingStats::default()
        };
        for entry in self.streams.iter() {
            let meta = entry.meta();
            stats.total_tracked += 1;
            stats.chunks_emitted += meta.chunks_emitted;
            stats.vectors_emitted += meta.vectors_emitted;
            stats.bytes_emitted += meta.bytes_emitted;
            match meta.status {
                StreamStatus::Completed => stats.completed += 1,
                StreamStatus::Failed => stats.failed += 1,
                StreamStatus::Cancelled => stats.cancelled += 1,
                StreamStatus::Active => {}
            }
        }
        stats
    }

    /// Close every active stream; part of process shutdown after the
    /// balancer has drained.
    pub fn shutdown(&self) {
        let active: Vec<Uuid> = self
            .streams
            .iter()
            .filter(|entry| !entry.status.lock().is_terminal())
            .map(|entry| entry.id)
            .collect();
        for stream_id in active {
            self.cancel(&stream_id);
        }
        info!("stream manager shut down");
    }

    /// Spawn the periodic watchdog; exits when `shutdown` flips true.
    pub fn spawn_watchdog(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.watchdog_pass(),
                    changed = shutdown.changed() => {
                        // A dropped sender also means shutdown.
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("stream watchdog stopped");
        })
    }

    /// One watchdog pass: drop stale terminal metrics, then check heap
    /// pressure. Active streams are never evicted.
    fn watchdog_pass(&self) {
        let before = self.streams.len();
        self.streams.retain(|_, handle| {
            let terminal_at = *handle.terminal_at.lock();
            match terminal_at {
                Some(at) => at.elapsed() < TERMINAL_RETENTION,
                None => true,
            }
        });
        let pruned = before - self.streams.len();
        if pruned > 0 {
            debug!(pruned, "watchdog pruned terminal stream metrics");
        }

        let heap_used = self.memory.heap_used_bytes();
        let limit = self.config.max_memory_usage;
        if heap_used as f64 > self.config.gc_threshold * limit as f64 {
            warn!(heap_used, limit, "heap pressure above threshold");
            self.events.publish(ControlEvent::MemoryPressure {
                heap_used,
                limit,
            });
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamingStats {
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_tracked: usize,
    pub chunks_emitted: u64,
    pub vectors_emitted: u64,
    pub bytes_emitted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    struct FixedGauge(u64);

    impl MemoryGauge for FixedGauge {
        fn heap_used_bytes(&self) -> u64 {
            self.0
        }
    }

    fn drain_events(
        rx: &mut tokio::sync::broadcast::Receiver<ControlEvent>,
    ) -> Vec<&'static str> {
        let mut names = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => names.push(event.name()),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
        names
    }

    #[tokio::test]
    async fn watchdog_emits_memory_pressure_above_threshold() {
        let config = StreamingConfig {
            max_memory_usage: 1000,
            gc_threshold: 0.8,
            ..StreamingConfig::default()
        };
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let manager =
            StreamManager::with_memory_gauge(config, events, Arc::new(FixedGauge(900)));

        manager.watchdog_pass();
        assert!(drain_events(&mut rx).contains(&"memory_pressure"));
    }

    #[tokio::test]
    async fn watchdog_stays_quiet_below_threshold() {
        let config = StreamingConfig {
            max_memory_usage: 1000,
            gc_threshold: 0.8,
            ..StreamingConfig::default()
        };
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let manager =
            StreamManager::with_memory_gauge(config, events, Arc::new(FixedGauge(100)));

        manager.watchdog_pass();
        assert!(!drain_events(&mut rx).contains(&"memory_pressure"));
    }

    #[tokio::test]
    async fn watchdog_keeps_active_streams() {
        let manager =
            StreamManager::new(StreamingConfig::default(), Arc::new(EventBus::default()));
        let (_tx, rx) = mpsc::channel(1);
        let created = manager.create_stream(rx, StreamOptions::default()).unwrap();

        // An active stream is never pruned.
        manager.watchdog_pass();
        assert!(manager.get(&created.stream_id).is_some());
        assert_eq!(manager.active_streams(), 1);
    }
}
