//! Control-plane event bus
//!
//! Observability events flow to two kinds of consumers: named sinks
//! registered synchronously (metrics collectors, loggers) and async
//! subscribers on a broadcast tap. Publishing never blocks; a lagging
//! broadcast subscriber drops events rather than stalling the plane.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events emitted by the control plane for an external collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    NodeAdded {
        node_id: String,
    },
    NodeRemoved {
        node_id: String,
    },
    BreakerOpened {
        node_id: String,
        failure_count: u32,
    },
    ScalingCompleted {
        before: usize,
        after: usize,
        reason: String,
    },
    StreamCreated {
        stream_id: String,
    },
    StreamCompleted {
        stream_id: String,
        vectors: u64,
        bytes: u64,
    },
    StreamFailed {
        stream_id: String,
        reason: String,
    },
    Backpressure {
        stream_id: String,
    },
    MemoryPressure {
        heap_used: u64,
        limit: u64,
    },
    ExperimentStarted {
        experiment_id: String,
    },
    ExperimentStopped {
        experiment_id: String,
        reason: String,
    },
    AnalysisUpdate {
        experiment_id: String,
        significant: bool,
        winner: Option<String>,
    },
}

impl ControlEvent {
    /// Stable event name used as the pub/sub key.
    pub fn name(&self) -> &'static str {
        match self {
            ControlEvent::NodeAdded { .. } => "node_added",
            ControlEvent::NodeRemoved { .. } => "node_removed",
            ControlEvent::BreakerOpened { .. } => "breaker_opened",
            ControlEvent::ScalingCompleted { .. } => "scaling_completed",
            ControlEvent::StreamCreated { .. } => "stream_created",
            ControlEvent::StreamCompleted { .. } => "stream_completed",
            ControlEvent::StreamFailed { .. } => "stream_failed",
            ControlEvent::Backpressure { .. } => "backpressure",
            ControlEvent::MemoryPressure { .. } => "memory_pressure",
            ControlEvent::ExperimentStarted { .. } => "experiment_started",
            ControlEvent::ExperimentStopped { .. } => "experiment_stopped",
            ControlEvent::AnalysisUpdate { .. } => "analysis_update",
        }
    }
}

/// Synchronous event consumer. Implementations must be fast and
/// non-blocking; heavy consumers should subscribe to the broadcast tap
/// instead.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &ControlEvent);
}

/// Publish/subscribe surface for control events.
pub struct EventBus {
    sinks: RwLock<HashMap<String, Arc<dyn EventSink>>>,
    tap: broadcast::Sender<ControlEvent>,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(tap_capacity: usize) -> Self {
        let (tap, _) = broadcast::channel(tap_capacity);
        Self {
            sinks: RwLock::new(HashMap::new()),
            tap,
            published: AtomicU64::new(0),
        }
    }

    /// Register a named sink; an existing sink under the same name is
    /// replaced.
    pub fn register_sink(&self, name: impl Into<String>, sink: Arc<dyn EventSink>) {
        self.sinks.write().insert(name.into(), sink);
    }

    /// Remove a named sink. Returns true when a sink was registered.
    pub fn unregister_sink(&self, name: &str) -> bool {
        self.sinks.write().remove(name).is_some()
    }

    /// Subscribe to the async broadcast tap.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tap.subscribe()
    }

    /// Deliver an event to every sink and the broadcast tap.
    pub fn publish(&self, event: ControlEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        for sink in self.sinks.read().values() {
            sink.on_event(&event);
        }
        // No receivers is fine; the tap is best-effort.
        let _ = self.tap.send(event);
    }

    /// Total events published since creation.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl EventSink for Recorder {
        fn on_event(&self, event: &ControlEvent) {
            self.seen.lock().push(event.name().to_string());
        }
    }

    #[test]
    fn sinks_receive_published_events() {
        let bus = EventBus::default();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        bus.register_sink("recorder", recorder.clone());

        bus.publish(ControlEvent::NodeAdded {
            node_id: "gpu-0".to_string(),
        });
        bus.publish(ControlEvent::BreakerOpened {
            node_id: "gpu-0".to_string(),
            failure_count: 5,
        });

        let seen = recorder.seen.lock();
        assert_eq!(*seen, vec!["node_added", "breaker_opened"]);
        assert_eq!(bus.published(), 2);
    }

    #[test]
    fn unregistered_sink_stops_receiving() {
        let bus = EventBus::default();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        bus.register_sink("recorder", recorder.clone());
        assert!(bus.unregister_sink("recorder"));
        assert!(!bus.unregister_sink("recorder"));

        bus.publish(ControlEvent::NodeRemoved {
            node_id: "gpu-0".to_string(),
        });
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn broadcast_tap_delivers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(ControlEvent::StreamCreated {
            stream_id: "s-1".to_string(),
        });
        let event = rx.recv().await.expect("tap event");
        assert_eq!(event.name(), "stream_created");
    }
}
