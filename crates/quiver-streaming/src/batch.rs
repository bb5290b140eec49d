//! Record batching with adaptive sizing
//!
//! The batcher cuts the source sequence into `Batch` values. With
//! adaptive sizing on, the effective batch size doubles above the high
//! throughput mark and halves below the low one, inside fixed bounds.
//! Throughput comes from an injectable estimator so tests control the
//! clock.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::record::{Batch, VectorRecord};

/// Adaptive sizing bounds and thresholds (records, records/second).
pub const MAX_BATCH_SIZE: usize = 1000;
pub const MIN_BATCH_SIZE: usize = 10;
pub const HIGH_THROUGHPUT_RPS: f64 = 10_000.0;
pub const LOW_THROUGHPUT_RPS: f64 = 1_000.0;

/// Observed-throughput collaborator for adaptive batching.
pub trait ThroughputEstimator: Send + Sync {
    /// Account for `n` more records delivered.
    fn record(&self, n: usize);
    /// Current records-per-second estimate; zero means no signal yet.
    fn records_per_sec(&self) -> f64;
}

/// Lifetime rate meter: records delivered over wall time since the
/// first record.
pub struct RateMeter {
    count: AtomicU64,
    started: Mutex<Option<Instant>>,
}

impl RateMeter {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            started: Mutex::new(None),
        }
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputEstimator for RateMeter {
    fn record(&self, n: usize) {
        self.started.lock().get_or_insert_with(Instant::now);
        self.count.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn records_per_sec(&self) -> f64 {
        let Some(started) = *self.started.lock() else {
            return 0.0;
        };
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.count.load(Ordering::Relaxed) as f64 / elapsed
    }
}

pub struct Batcher {
    size: usize,
    adaptive: bool,
    estimator: Arc<dyn ThroughputEstimator>,
    buf: Vec<VectorRecord>,
    next_batch_id: u64,
}

impl Batcher {
    pub fn new(size: usize, adaptive: bool, estimator: Arc<dyn ThroughputEstimator>) -> Self {
        Self {
            size: size.max(1),
            adaptive,
            estimator,
            buf: Vec::new(),
            next_batch_id: 0,
        }
    }

    /// Accumulate one record; returns a batch when the boundary is hit.
    pub fn push(&mut self, record: VectorRecord) -> Option<Batch> {
        self.estimator.record(1);
        self.buf.push(record);
        (self.buf.len() >= self.size).then(|| self.cut())
    }

    /// Flush the trailing partial batch at end of stream.
    pub fn flush(&mut self) -> Option<Batch> {
        (!self.buf.is_empty()).then(|| self.cut())
    }

    /// Effective batch size after any adaptation.
    pub fn batch_size(&self) -> usize {
        self.size
    }

    fn cut(&mut self) -> Batch {
        let batch = Batch {
            batch_id: self.next_batch_id,
            vectors: std::mem::take(&mut self.buf),
        };
        self.next_batch_id += 1;
        if self.adaptive {
            self.retune();
        }
        batch
    }

    fn retune(&mut self) {
        let rps = self.estimator.records_per_sec();
        if rps > HIGH_THROUGHPUT_RPS {
            self.size = (self.size * 2).min(MAX_BATCH_SIZE);
        } else if rps > 0.0 && rps < LOW_THROUGHPUT_RPS {
            self.size = (self.size / 2).max(MIN_BATCH_SIZE);
        }
    }
}
