//! Quiver Streaming
//!
//! Turns large result collections into bounded, back-pressure-aware,
//! optionally compressed batches: a transform pipeline (batching,
//! compression, json/ndjson/binary framing) per stream, and a manager
//! owning stream lifecycle, deadlines, cancellation, and the memory
//! watchdog.

pub mod batch;
pub mod frame;
pub mod manager;
pub mod pipeline;
pub mod record;

pub use batch::{Batcher, RateMeter, ThroughputEstimator};
pub use frame::{
    decode_binary_stream, decode_json_stream, decode_ndjson_stream, id_hash, BinaryRecord,
    FrameEncoder,
};
pub use manager::{
    CreatedStream, MemoryGauge, NullMemoryGauge, StreamManager, StreamMeta, StreamOptions,
    StreamStatus, StreamingStats,
};
pub use pipeline::{PipelineEnd, PipelineOptions, StreamProgress};
pub use record::{Batch, BatchMetadata, BatchPayload, StreamFormat, VectorRecord};

use std::time::Duration;

/// Streaming configuration.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub default_batch_size: usize,
    pub max_concurrent_streams: usize,
    pub stream_timeout: Duration,
    /// Outstanding-record bound a slow consumer can hold the source to.
    pub backpressure_threshold: usize,
    pub compression: bool,
    pub compression_level: u32,
    /// Adaptive batch sizing from observed throughput.
    pub adaptive_streaming: bool,
    pub max_memory_usage: u64,
    /// Fraction of `max_memory_usage` that triggers a pressure event.
    pub gc_threshold: f64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 100,
            max_concurrent_streams: 50,
            stream_timeout: Duration::from_secs(300),
            backpressure_threshold: 1000,
            compression: false,
            compression_level: 6,
            adaptive_streaming: false,
            max_memory_usage: 1024 * 1024 * 1024,
            gc_threshold: 0.8,
        }
    }
}
