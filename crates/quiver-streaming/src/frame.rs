//! Batch framing and compression
//!
//! Frames are byte-typed on the wire. Textual framings serialize each
//! batch to UTF-8 JSON before splicing; the binary framing packs
//! little-endian `(u32 count, u32 dim)` headers followed by
//! `(f32 similarity, u32 id_hash, f32[dim])` records. The vector
//! dimension is locked by the first binary batch; a change is an
//! error. Compression (deflate over the record array, base64 in the
//! envelope) applies to the textual framings; binary frames are
//! already packed and go out as-is.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use xxhash_rust::xxh3::xxh3_64;

use quiver_core::{ControlError, Result};

use crate::record::{Batch, BatchMetadata, BatchPayload, StreamFormat, VectorRecord};

/// Stable non-cryptographic hash of a record id for binary frames.
pub fn id_hash(id: &str) -> u32 {
    xxh3_64(id.as_bytes()) as u32
}

/// One record as decoded from a binary frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryRecord {
    pub similarity: f32,
    pub id_hash: u32,
    pub vector: Vec<f32>,
}

pub struct FrameEncoder {
    format: StreamFormat,
    compression: bool,
    compression_level: u32,
    /// Dimension locked by the first binary batch.
    binary_dim: Option<u32>,
    json_opened: bool,
}

impl FrameEncoder {
    pub fn new(format: StreamFormat, compression: bool, compression_level: u32) -> Self {
        Self {
            format,
            compression,
            compression_level,
            binary_dim: None,
            json_opened: false,
        }
    }

    /// Frame one batch into wire bytes.
    pub fn encode(&mut self, batch: &Batch) -> Result<Vec<u8>> {
        match self.format {
            StreamFormat::Json => {
                let body = self.payload_bytes(batch)?;
                let mut out = Vec::with_capacity(body.len() + 12);
                if self.json_opened {
                    out.push(b',');
                } else {
                    out.extend_from_slice(b"{\"results\":[");
                    self.json_opened = true;
                }
                out.extend_from_slice(&body);
                Ok(out)
            }
            StreamFormat::NdJson => {
                let mut out = self.payload_bytes(batch)?;
                out.push(b'\n');
                Ok(out)
            }
            StreamFormat::Binary => self.encode_binary(batch),
        }
    }

    /// Bytes that close the stream; empty for ndjson and binary.
    pub fn finish(&mut self) -> Vec<u8> {
        match self.format {
            StreamFormat::Json => {
                if self.json_opened {
                    b"]}".to_vec()
                } else {
                    b"{\"results\":[]}".to_vec()
                }
            }
            StreamFormat::NdJson | StreamFormat::Binary => Vec::new(),
        }
    }

    fn payload_bytes(&self, batch: &Batch) -> Result<Vec<u8>> {
        let payload = if self.compression {
            let raw = serde_json::to_vec(&batch.vectors)?;
            let packed = deflate(&raw, self.compression_level).map_err(|err| {
                ControlError::Internal {
                    reason: format!("deflate failed: {err}"),
                }
            })?;
            BatchPayload::Compressed {
                compressed: true,
                data: BASE64.encode(&packed),
                metadata: BatchMetadata {
                    batch_id: batch.batch_id,
                    count: batch.vectors.len(),
                    orig_size: Some(raw.len()),
                    comp_size: Some(packed.len()),
                },
            }
        } else {
            BatchPayload::Plain {
                vectors: batch.vectors.clone(),
                metadata: BatchMetadata {
                    batch_id: batch.batch_id,
                    count: batch.vectors.len(),
                    orig_size: None,
                    comp_size: None,
                },
            }
        };
        Ok(serde_json::to_vec(&payload)?)
    }

    fn encode_binary(&mut self, batch: &Batch) -> Result<Vec<u8>> {
        let dim = match (self.binary_dim, batch.vectors.first()) {
            (Some(dim), _) => dim,
            (None, Some(first)) => {
                let dim = first.vector.len() as u32;
                self.binary_dim = Some(dim);
                dim
            }
            (None, None) => 0,
        };

        let mut out =
            Vec::with_capacity(8 + batch.vectors.len() * (8 + dim as usize * 4));
        out.extend_from_slice(&(batch.vectors.len() as u32).to_le_bytes());
        out.extend_from_slice(&dim.to_le_bytes());

        for record in &batch.vectors {
            if record.vector.len() as u32 != dim {
                return Err(ControlError::invalid(
                    "vector",
                    format!(
                        "dimension changed mid-stream: expected {dim}, got {}",
                        record.vector.len()
                    ),
                ));
            }
            out.extend_from_slice(&record.similarity.to_le_bytes());
            out.extend_from_slice(&id_hash(&record.id).to_le_bytes());
            for component in &record.vector {
                out.extend_from_slice(&component.to_le_bytes());
            }
        }
        Ok(out)
    }
}

pub fn deflate(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn inflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Decode a complete JSON-framed stream back to its batches.
pub fn decode_json_stream(bytes: &[u8]) -> Result<Vec<Vec<VectorRecord>>> {
    #[derive(serde::Deserialize)]
    struct Doc {
        results: Vec<BatchPayload>,
    }
    let doc: Doc = serde_json::from_slice(bytes)?;
    doc.results.into_iter().map(unpack_payload).collect()
}

/// Decode a complete NDJSON-framed stream back to its batches.
pub fn decode_ndjson_stream(bytes: &[u8]) -> Result<Vec<Vec<VectorRecord>>> {
    let text = std::str::from_utf8(bytes).map_err(|err| ControlError::Internal {
        reason: format!("ndjson stream is not UTF-8: {err}"),
    })?;
    text.lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let payload: BatchPayload = serde_json::from_str(line)?;
            unpack_payload(payload)
        })
        .collect()
}

/// Decode a complete binary-framed stream back to its batches.
pub fn decode_binary_stream(bytes: &[u8]) -> Result<Vec<Vec<BinaryRecord>>> {
    let mut batches = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let count = read_u32(bytes, &mut pos)?;
        let dim = read_u32(bytes, &mut pos)? as usize;
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let similarity = f32::from_le_bytes(read_array(bytes, &mut pos)?);
            let id_hash = read_u32(bytes, &mut pos)?;
            let mut vector = Vec::with_capacity(dim);
            for _ in 0..dim {
                vector.push(f32::from_le_bytes(read_array(bytes, &mut pos)?));
            }
            records.push(BinaryRecord {
                similarity,
                id_hash,
                vector,
            });
        }
        batches.push(records);
    }
    Ok(batches)
}

fn unpack_payload(payload: BatchPayload) -> Result<Vec<VectorRecord>> {
    match payload {
        BatchPayload::Plain { vectors, .. } => Ok(vectors),
        BatchPayload::Compressed { data, .. } => {
            let packed = BASE64.decode(data).map_err(|err| ControlError::Internal {
                reason: format!("invalid base64 batch data: {err}"),
            })?;
            let raw = inflate(&packed).map_err(|err| ControlError::Internal {
                reason: format!("inflate failed: {err}"),
            })?;
            Ok(serde_json::from_slice(&raw)?)
        }
    }
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(bytes, pos)?))
}

fn read_array<const N: usize>(bytes: &[u8], pos: &mut usize) -> Result<[u8; N]> {
    let end = *pos + N;
    let slice = bytes.get(*pos..end).ok_or_else(|| ControlError::Internal {
        reason: "truncated binary frame".to_string(),
    })?;
    *pos = end;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(id: u64, start: usize, len: usize, dim: usize) -> Batch {
        Batch {
            batch_id: id,
            vectors: (start..start + len)
                .map(|i| {
                    VectorRecord::new(
                        &format!("rec-{i}"),
                        (0..dim).map(|d| (i * dim + d) as f32 * 0.25).collect(),
                        i as f32 / 100.0,
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn json_framing_splices_into_one_document() {
        let mut encoder = FrameEncoder::new(StreamFormat::Json, false, 6);
        let mut wire = Vec::new();
        wire.extend(encoder.encode(&batch(0, 0, 3, 4)).unwrap());
        wire.extend(encoder.encode(&batch(1, 3, 2, 4)).unwrap());
        wire.extend(encoder.finish());

        let decoded = decode_json_stream(&wire).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].len(), 3);
        assert_eq!(decoded[1].len(), 2);
        assert_eq!(decoded[1][0].id, "rec-3");
    }

    #[test]
    fn empty_json_stream_is_valid() {
        let mut encoder = FrameEncoder::new(StreamFormat::Json, false, 6);
        let wire = encoder.finish();
        assert_eq!(wire, b"{\"results\":[]}");
        assert!(decode_json_stream(&wire).unwrap().is_empty());
    }

    #[test]
    fn ndjson_round_trips_with_compression() {
        let mut encoder = FrameEncoder::new(StreamFormat::NdJson, true, 6);
        let source = batch(0, 0, 50, 8);
        let wire = encoder.encode(&source).unwrap();

        // Envelope records both sizes.
        let payload: BatchPayload =
            serde_json::from_slice(wire.strip_suffix(b"\n").unwrap()).unwrap();
        match &payload {
            BatchPayload::Compressed { metadata, .. } => {
                assert_eq!(metadata.count, 50);
                assert!(metadata.orig_size.unwrap() > metadata.comp_size.unwrap());
            }
            BatchPayload::Plain { .. } => panic!("expected compressed payload"),
        }

        let decoded = decode_ndjson_stream(&wire).unwrap();
        assert_eq!(decoded[0], source.vectors);
    }

    #[test]
    fn binary_preserves_similarity_bitwise_and_id_hash() {
        let mut encoder = FrameEncoder::new(StreamFormat::Binary, false, 6);
        let source = batch(0, 0, 10, 3);
        let wire = encoder.encode(&source).unwrap();

        let decoded = decode_binary_stream(&wire).unwrap();
        assert_eq!(decoded.len(), 1);
        for (orig, out) in source.vectors.iter().zip(&decoded[0]) {
            assert_eq!(orig.similarity.to_bits(), out.similarity.to_bits());
            assert_eq!(id_hash(&orig.id), out.id_hash);
            assert_eq!(orig.vector, out.vector);
        }
    }

    #[test]
    fn binary_dimension_is_locked_by_the_first_batch() {
        let mut encoder = FrameEncoder::new(StreamFormat::Binary, false, 6);
        encoder.encode(&batch(0, 0, 2, 4)).unwrap();
        let err = encoder.encode(&batch(1, 2, 2, 5)).unwrap_err();
        assert!(matches!(err, ControlError::InvalidInput { .. }));
    }

    #[test]
    fn deflate_inflate_round_trip() {
        let data = b"the same bytes come back out".repeat(20);
        let packed = deflate(&data, 6).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(inflate(&packed).unwrap(), data);
    }
}
