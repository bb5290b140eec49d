//! Stream record and batch types

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output framing for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFormat {
    /// Single JSON document `{"results":[batch, ...]}` spliced
    /// incrementally.
    Json,
    /// One batch JSON per line.
    NdJson,
    /// Little-endian packed frames, constant vector dimension.
    Binary,
}

/// One search result flowing through a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub similarity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl VectorRecord {
    pub fn new(id: &str, vector: Vec<f32>, similarity: f32) -> Self {
        Self {
            id: id.to_string(),
            vector,
            similarity,
            metadata: None,
        }
    }
}

/// A cut of consecutive records, emitted in source order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: u64,
    pub vectors: Vec<VectorRecord>,
}

/// Per-batch envelope fields carried by the textual framings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub batch_id: u64,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orig_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comp_size: Option<usize>,
}

/// Wire form of one batch inside a JSON/NDJSON stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchPayload {
    Compressed {
        compressed: bool,
        /// Base64-encoded deflate of the record array.
        data: String,
        metadata: BatchMetadata,
    },
    Plain {
        vectors: Vec<VectorRecord>,
        metadata: BatchMetadata,
    },
}
