//! Stream transform pipeline
//!
//! One task per stream: pull records from the source, cut batches,
//! frame them, and push frames into a bounded sink. When the consumer
//! lags, the bounded channel blocks the producer cooperatively; a
//! back-pressure event fires as the sink saturates. Cancellation
//! unblocks a producer stuck on a full sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use quiver_core::{ControlEvent, EventBus, Result};

use crate::batch::{Batcher, ThroughputEstimator};
use crate::frame::FrameEncoder;
use crate::record::{Batch, StreamFormat, VectorRecord};

/// How one pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEnd {
    /// Source exhausted, every frame delivered.
    Completed,
    /// Cancelled, or the consumer went away.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub format: StreamFormat,
    pub compression: bool,
    pub compression_level: u32,
    pub batch_size: usize,
    pub adaptive: bool,
}

/// Shared live counters, read by the manager for stream metadata.
#[derive(Debug, Default)]
pub struct StreamProgress {
    pub chunks_emitted: AtomicU64,
    pub vectors_emitted: AtomicU64,
    pub bytes_emitted: AtomicU64,
    pub error_count: AtomicU64,
}

pub async fn run_pipeline(
    stream_id: &str,
    mut source: mpsc::Receiver<VectorRecord>,
    sink: mpsc::Sender<Vec<u8>>,
    opts: PipelineOptions,
    estimator: Arc<dyn ThroughputEstimator>,
    progress: Arc<StreamProgress>,
    mut cancel: watch::Receiver<bool>,
    events: Arc<EventBus>,
) -> Result<PipelineEnd> {
    let mut batcher = Batcher::new(opts.batch_size, opts.adaptive, estimator);
    let mut encoder = FrameEncoder::new(opts.format, opts.compression, opts.compression_level);

    loop {
        tokio::select! {
            // The cancel channel only ever carries `true`; a dropped
            // sender means the stream handle is gone, same outcome.
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    debug!(stream_id, "pipeline cancelled at source");
                    return Ok(PipelineEnd::Cancelled);
                }
            }
            next = source.recv() => match next {
                Some(record) => {
                    if let Some(batch) = batcher.push(record) {
                        if !emit(stream_id, &batch, &mut encoder, &sink, &progress, &mut cancel, &events).await? {
                            return Ok(PipelineEnd::Cancelled);
                        }
                    }
                }
                // Source exhausted.
                None => break,
            }
        }
    }

    if let Some(batch) = batcher.flush() {
        if !emit(stream_id, &batch, &mut encoder, &sink, &progress, &mut cancel, &events).await? {
            return Ok(PipelineEnd::Cancelled);
        }
    }

    let tail = encoder.finish();
    if !tail.is_empty() {
        let tail_len = tail.len() as u64;
        tokio::select! {
            sent = sink.send(tail) => {
                if sent.is_err() {
                    return Ok(PipelineEnd::Cancelled);
                }
            }
            _ = cancel.changed() => return Ok(PipelineEnd::Cancelled),
        }
        progress.bytes_emitted.fetch_add(tail_len, Ordering::Relaxed);
    }
    Ok(PipelineEnd::Completed)
}

/// Frame and deliver one batch. Returns false when the stream was
/// cancelled (or the consumer dropped) while waiting for sink space.
async fn emit(
    stream_id: &str,
    batch: &Batch,
    encoder: &mut FrameEncoder,
    sink: &mpsc::Sender<Vec<u8>>,
    progress: &StreamProgress,
    cancel: &mut watch::Receiver<bool>,
    events: &EventBus,
) -> Result<bool> {
    let frame = match encoder.encode(batch) {
        Ok(frame) => frame,
        Err(err) => {
            progress.error_count.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }
    };

    // Sink saturated: signal back-pressure before blocking on it.
    if sink.capacity() == 0 {
        events.publish(ControlEvent::Backpressure {
            stream_id: stream_id.to_string(),
        });
    }

    let frame_len = frame.len() as u64;
    tokio::select! {
        sent = sink.send(frame) => {
            if sent.is_err() {
                debug!(stream_id, "consumer dropped mid-stream");
                return Ok(false);
            }
        }
        // Only `true` ever arrives here; Err means the handle is gone.
        _ = cancel.changed() => {
            debug!(stream_id, "pipeline cancelled under back-pressure");
            return Ok(false);
        }
    }

    progress.chunks_emitted.fetch_add(1, Ordering::Relaxed);
    progress
        .vectors_emitted
        .fetch_add(batch.vectors.len() as u64, Ordering::Relaxed);
    progress.bytes_emitted.fetch_add(frame_len, Ordering::Relaxed);
    Ok(true)
}
