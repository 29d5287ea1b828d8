// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Serialization port for the wire envelope.
//!
//! The envelope serializer is separated from the messaging implementation:
//! it turns a [`MatsTrace`] into bytes plus a `meta` string describing how
//! the bytes were produced (compression, in particular). The `meta` must be
//! carried next to the bytes on the wire and handed back on
//! deserialization. All communicating parties must use the same serializer,
//! as it constitutes the wire representation of the protocol.
//!
//! User DTOs and state objects are the typed edge of the system; they are
//! (de)serialized with the generic helpers [`serialize_object`] /
//! [`deserialize_object`], which produce the opaque strings the envelope
//! carries.

use std::io::{Read, Write};
use std::time::Instant;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::trace::MatsTrace;

/// Key postfix under which the serializer `meta` is stored next to the
/// envelope bytes on the wire.
pub const META_KEY_POSTFIX: &str = ":meta";

/// Meta value for uncompressed envelopes: algorithm plus format version.
pub const META_PLAIN: &str = "plain:1";

/// Meta value for deflate-compressed envelopes: algorithm plus format
/// version.
pub const META_DEFLATE: &str = "deflate:1";

/// Errors raised by the serialization layer.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("failed to serialize envelope: {0}")]
    EnvelopeEncode(#[source] serde_json::Error),

    #[error("failed to deserialize envelope: {0}")]
    EnvelopeDecode(#[source] serde_json::Error),

    #[error("failed to serialize object: {0}")]
    ObjectEncode(#[source] serde_json::Error),

    #[error("failed to deserialize object: {0}")]
    ObjectDecode(#[source] serde_json::Error),

    #[error("unknown serializer meta: {0:?}")]
    UnknownMeta(String),

    #[error("compression failed: {0}")]
    Compress(#[source] std::io::Error),

    #[error("decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
}

/// The result of serializing an envelope: the wire bytes plus the `meta`
/// that must be echoed back on deserialization, and some timings for
/// logging.
#[derive(Debug, Clone)]
pub struct SerializedTrace {
    pub bytes: Vec<u8>,
    pub meta: String,
    /// Size before compression (equals `bytes.len()` when uncompressed).
    pub size_uncompressed: usize,
    pub millis_serialization: f64,
    /// Zero when no compression took place.
    pub millis_compression: f64,
}

/// The result of deserializing an envelope.
#[derive(Debug, Clone)]
pub struct DeserializedTrace {
    pub trace: MatsTrace,
    /// Size after decompression (equals the input length when the input was
    /// not compressed).
    pub size_decompressed: usize,
    pub millis_decompression: f64,
    pub millis_deserialization: f64,
}

/// The envelope serializer port.
pub trait MatsSerializer: Send + Sync + 'static {
    fn serialize_trace(&self, trace: &MatsTrace) -> Result<SerializedTrace, SerializationError>;

    fn deserialize_trace(
        &self,
        bytes: &[u8],
        meta: &str,
    ) -> Result<DeserializedTrace, SerializationError>;
}

/// JSON envelope serializer with optional deflate compression above a size
/// threshold.
#[derive(Debug, Clone)]
pub struct MatsSerializerJson {
    compression_threshold: usize,
}

impl MatsSerializerJson {
    /// Default threshold above which envelopes are deflate-compressed.
    pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

    pub fn new() -> Self {
        Self {
            compression_threshold: Self::DEFAULT_COMPRESSION_THRESHOLD,
        }
    }

    /// Set the compression threshold in bytes. `usize::MAX` disables
    /// compression.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }
}

impl Default for MatsSerializerJson {
    fn default() -> Self {
        Self::new()
    }
}

impl MatsSerializer for MatsSerializerJson {
    fn serialize_trace(&self, trace: &MatsTrace) -> Result<SerializedTrace, SerializationError> {
        let start = Instant::now();
        let plain = serde_json::to_vec(trace).map_err(SerializationError::EnvelopeEncode)?;
        let millis_serialization = millis_since(start);
        let size_uncompressed = plain.len();

        if size_uncompressed > self.compression_threshold {
            let start = Instant::now();
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&plain)
                .and_then(|_| encoder.finish())
                .map(|bytes| SerializedTrace {
                    bytes,
                    meta: META_DEFLATE.to_string(),
                    size_uncompressed,
                    millis_serialization,
                    millis_compression: millis_since(start),
                })
                .map_err(SerializationError::Compress)
        } else {
            Ok(SerializedTrace {
                bytes: plain,
                meta: META_PLAIN.to_string(),
                size_uncompressed,
                millis_serialization,
                millis_compression: 0.0,
            })
        }
    }

    fn deserialize_trace(
        &self,
        bytes: &[u8],
        meta: &str,
    ) -> Result<DeserializedTrace, SerializationError> {
        let (plain, millis_decompression) = match meta {
            META_PLAIN => (bytes.to_vec(), 0.0),
            META_DEFLATE => {
                let start = Instant::now();
                let mut decoder = DeflateDecoder::new(bytes);
                let mut plain = Vec::new();
                decoder
                    .read_to_end(&mut plain)
                    .map_err(SerializationError::Decompress)?;
                (plain, millis_since(start))
            }
            other => return Err(SerializationError::UnknownMeta(other.to_string())),
        };

        let start = Instant::now();
        let trace =
            serde_json::from_slice(&plain).map_err(SerializationError::EnvelopeDecode)?;
        Ok(DeserializedTrace {
            trace,
            size_decompressed: plain.len(),
            millis_decompression,
            millis_deserialization: millis_since(start),
        })
    }
}

fn millis_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Serialize a user DTO or state object to the opaque string form the
/// envelope carries.
pub fn serialize_object<T: Serialize>(value: &T) -> Result<String, SerializationError> {
    serde_json::to_string(value).map_err(SerializationError::ObjectEncode)
}

/// Deserialize a user DTO or state object from its opaque string form.
/// `None` deserializes as JSON `null`, which suits optional payloads.
pub fn deserialize_object<T: DeserializeOwned>(
    value: Option<&str>,
) -> Result<T, SerializationError> {
    serde_json::from_str(value.unwrap_or("null")).map_err(SerializationError::ObjectDecode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Channel, KeepTrace};

    fn sample_trace() -> MatsTrace {
        MatsTrace::new("round-trip", KeepTrace::Compact, true, false)
            .with_initiator_info("TestApp", "1.0", "host-1", "test.init", 1_700_000_000_000)
            .add_request_call(
                "test.init",
                Channel::queue("svc"),
                Channel::queue("term"),
                Some("{\"n\":1}".into()),
                Some("{\"seen\":2}".into()),
                None,
            )
    }

    #[test]
    fn test_round_trip_plain() {
        let serializer = MatsSerializerJson::new();
        let trace = sample_trace();
        let serialized = serializer.serialize_trace(&trace).unwrap();
        assert_eq!(serialized.meta, META_PLAIN);
        assert_eq!(serialized.size_uncompressed, serialized.bytes.len());

        let restored = serializer
            .deserialize_trace(&serialized.bytes, &serialized.meta)
            .unwrap();
        assert_eq!(restored.trace, trace);
    }

    #[test]
    fn test_round_trip_compressed() {
        let serializer = MatsSerializerJson::new().with_compression_threshold(16);
        let trace = sample_trace();
        let serialized = serializer.serialize_trace(&trace).unwrap();
        assert_eq!(serialized.meta, META_DEFLATE);
        assert!(serialized.size_uncompressed > serialized.bytes.len());

        let restored = serializer
            .deserialize_trace(&serialized.bytes, &serialized.meta)
            .unwrap();
        assert_eq!(restored.trace, trace);
        assert_eq!(restored.size_decompressed, serialized.size_uncompressed);
    }

    #[test]
    fn test_round_trip_preserves_current_view() {
        let serializer = MatsSerializerJson::new();
        let trace = sample_trace();
        let serialized = serializer.serialize_trace(&trace).unwrap();
        let restored = serializer
            .deserialize_trace(&serialized.bytes, &serialized.meta)
            .unwrap()
            .trace;

        let original_call = trace.current_call().unwrap();
        let restored_call = restored.current_call().unwrap();
        assert_eq!(original_call.data(), restored_call.data());
        assert_eq!(original_call.stack(), restored_call.stack());
        assert_eq!(trace.current_state(), restored.current_state());
    }

    #[test]
    fn test_unknown_meta_is_rejected() {
        let serializer = MatsSerializerJson::new();
        let err = serializer.deserialize_trace(b"{}", "gzip").unwrap_err();
        assert!(matches!(err, SerializationError::UnknownMeta(_)));
    }

    #[test]
    fn test_object_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
        struct Dto {
            n: i32,
        }
        let s = serialize_object(&Dto { n: 7 }).unwrap();
        let d: Dto = deserialize_object(Some(&s)).unwrap();
        assert_eq!(d, Dto { n: 7 });
    }

    #[test]
    fn test_absent_object_deserializes_as_null() {
        let d: Option<i32> = deserialize_object(None).unwrap();
        assert_eq!(d, None);
        let unit: () = deserialize_object(None).unwrap();
        let _ = unit;
    }
}
