//! Binary codec for telemetry records.
//!
//! Every stored record is a self-describing frame:
//!
//! ```text
//! ┌───────┬─────────┬──────┬───────┬──────────────┬─────────────────┐
//! │ "TO"  │ version │ kind │ flags │ crc32 (BE)   │ payload         │
//! │ 2 B   │ 1 B     │ 1 B  │ 1 B   │ 4 B          │ rest of frame   │
//! └───────┴─────────┴──────┴───────┴──────────────┴─────────────────┘
//! ```
//!
//! The payload is the record variant serialized as MessagePack with named
//! fields. When that is at least `compression_threshold` bytes it is
//! zstd-compressed and flag bit 0 is set. The checksum covers the stored
//! payload bytes, compressed or not.
//!
//! Encoding is deterministic: attribute and label maps are `BTreeMap`s, so
//! equal records always produce identical frames. Decoding either returns the
//! complete record or a [`CodecError`]; it never yields a partial value.
//!
//! ```
//! use tinyolly_common_storage::{Codec, RecordKind, TelemetryRecord, Timestamp};
//! use tinyolly_common_storage::model::{LogEntry, Severity};
//!
//! let codec = Codec::default();
//! let record = TelemetryRecord::Log(LogEntry {
//!     id: "l-1".into(),
//!     service_name: "api".into(),
//!     timestamp: Timestamp::from_secs(1_700_000_000),
//!     trace_id: None,
//!     span_id: None,
//!     severity: Severity::Info,
//!     body: "request served".into(),
//!     attributes: Default::default(),
//! });
//! let bytes = codec.encode(&record)?;
//! assert_eq!(codec.decode(&bytes, RecordKind::Log)?, record);
//! # Ok::<(), tinyolly_common_storage::CodecError>(())
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    config::CodecConfig,
    model::{LogEntry, MetricSample, RecordKind, Span, TelemetryRecord},
};

/// Frame magic.
pub const MAGIC: [u8; 2] = *b"TO";
/// Current frame version.
pub const VERSION: u8 = 1;
/// Flag bit: payload is zstd-compressed.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;
/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 9;

const KNOWN_FLAGS: u8 = FLAG_COMPRESSED;

/// Reasons a frame cannot be encoded or decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// The input is shorter than the frame header.
    #[error("frame truncated: need at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum frame length.
        expected: usize,
        /// Actual input length.
        actual: usize,
    },

    /// The input does not start with the frame magic.
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 2]),

    /// The frame was written by an unknown codec version.
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    /// The kind tag names no record kind.
    #[error("unknown record kind tag {0}")]
    UnknownKind(u8),

    /// The frame holds a different record kind than requested.
    #[error("expected a {expected} record, found {actual}")]
    KindMismatch {
        /// Requested kind.
        expected: RecordKind,
        /// Kind found in the frame.
        actual: RecordKind,
    },

    /// Reserved flag bits are set.
    #[error("unknown frame flags {0:#010b}")]
    UnknownFlags(u8),

    /// The payload checksum does not match.
    #[error("checksum mismatch: header {expected:#010x}, payload {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum stored in the header.
        expected: u32,
        /// Checksum of the payload as read.
        actual: u32,
    },

    /// The compressed payload could not be inflated.
    #[error("decompression failed: {0}")]
    Decompress(String),

    /// The payload is not a valid record of the frame's kind.
    #[error("payload deserialization failed: {0}")]
    Deserialize(String),

    /// The record could not be serialized or compressed.
    #[error("serialization failed: {0}")]
    Serialize(String),
}

/// Record encoder/decoder. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    config: CodecConfig,
}

impl Codec {
    /// Creates a codec with the given settings.
    #[must_use]
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Codec settings.
    #[must_use]
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Encodes a record into a frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialize`] if serialization or compression fails.
    pub fn encode(&self, record: &TelemetryRecord) -> Result<Bytes, CodecError> {
        let payload = match record {
            TelemetryRecord::Span(span) => rmp_serde::to_vec_named(span),
            TelemetryRecord::Log(log) => rmp_serde::to_vec_named(log),
            TelemetryRecord::Metric(metric) => rmp_serde::to_vec_named(metric),
        }
        .map_err(|e| CodecError::Serialize(e.to_string()))?;

        let (payload, flags) = if payload.len() >= self.config.compression_threshold {
            let compressed = zstd::bulk::compress(&payload, self.config.compression_level)
                .map_err(|e| CodecError::Serialize(format!("zstd: {e}")))?;
            (compressed, FLAG_COMPRESSED)
        } else {
            (payload, 0)
        };

        let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
        frame.put_slice(&MAGIC);
        frame.put_u8(VERSION);
        frame.put_u8(record.kind().tag());
        frame.put_u8(flags);
        frame.put_u32(crc32fast::hash(&payload));
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Decodes a frame that must hold a record of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::KindMismatch`] for a frame of another kind, or
    /// any header, checksum or payload error.
    pub fn decode(&self, bytes: &[u8], kind: RecordKind) -> Result<TelemetryRecord, CodecError> {
        let actual = peek_kind(bytes)?;
        if actual != kind {
            return Err(CodecError::KindMismatch { expected: kind, actual });
        }
        self.decode_any(bytes)
    }

    /// Decodes a frame of any kind.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] describing the first problem found.
    pub fn decode_any(&self, bytes: &[u8]) -> Result<TelemetryRecord, CodecError> {
        let kind = peek_kind(bytes)?;
        let flags = bytes[4];
        if flags & !KNOWN_FLAGS != 0 {
            return Err(CodecError::UnknownFlags(flags));
        }
        let expected = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        let stored = &bytes[HEADER_LEN..];
        let actual = crc32fast::hash(stored);
        if actual != expected {
            return Err(CodecError::ChecksumMismatch { expected, actual });
        }

        let inflated;
        let payload = if flags & FLAG_COMPRESSED != 0 {
            inflated = zstd::bulk::decompress(stored, self.config.max_decoded_size)
                .map_err(|e| CodecError::Decompress(e.to_string()))?;
            inflated.as_slice()
        } else {
            stored
        };

        let de = |e: rmp_serde::decode::Error| CodecError::Deserialize(e.to_string());
        Ok(match kind {
            RecordKind::Span => TelemetryRecord::Span(rmp_serde::from_slice::<Span>(payload).map_err(de)?),
            RecordKind::Log => TelemetryRecord::Log(rmp_serde::from_slice::<LogEntry>(payload).map_err(de)?),
            RecordKind::Metric => {
                TelemetryRecord::Metric(rmp_serde::from_slice::<MetricSample>(payload).map_err(de)?)
            },
        })
    }
}

/// Reads and validates the frame header, returning the record kind.
///
/// # Errors
///
/// Returns [`CodecError::Truncated`], [`CodecError::BadMagic`],
/// [`CodecError::UnsupportedVersion`] or [`CodecError::UnknownKind`].
pub fn peek_kind(bytes: &[u8]) -> Result<RecordKind, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated { expected: HEADER_LEN, actual: bytes.len() });
    }
    let magic = [bytes[0], bytes[1]];
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    if bytes[2] != VERSION {
        return Err(CodecError::UnsupportedVersion(bytes[2]));
    }
    RecordKind::from_tag(bytes[3]).ok_or(CodecError::UnknownKind(bytes[3]))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;
    use crate::{
        model::{AttributeValue, Attributes, MetricKind, Severity, Timestamp},
        testutil::{log_entry, metric_sample, span},
    };

    fn uncompressed() -> Codec {
        Codec::new(CodecConfig::builder().compression_threshold(usize::MAX).build())
    }

    fn always_compressed() -> Codec {
        Codec::new(CodecConfig::builder().compression_threshold(0).build())
    }

    #[test]
    fn test_roundtrip_each_kind() {
        let codec = Codec::default();
        for record in [
            TelemetryRecord::from(span("t1", "s1", None, "web", 10)),
            log_entry("l1", "api", 20).into(),
            metric_sample("m1", "api", "http.requests", 1.5, 30).into(),
        ] {
            let bytes = codec.encode(&record).unwrap();
            assert_eq!(peek_kind(&bytes).unwrap(), record.kind());
            assert_eq!(codec.decode(&bytes, record.kind()).unwrap(), record);
        }
    }

    #[test]
    fn test_compression_flag_and_roundtrip() {
        let mut log = log_entry("l1", "api", 20);
        log.body = "x".repeat(4096);
        let record = TelemetryRecord::Log(log);

        let compressed = always_compressed().encode(&record).unwrap();
        assert_eq!(compressed[4] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        assert!(compressed.len() < 4096);
        assert_eq!(Codec::default().decode_any(&compressed).unwrap(), record);

        let plain = uncompressed().encode(&record).unwrap();
        assert_eq!(plain[4], 0);
        assert_eq!(Codec::default().decode_any(&plain).unwrap(), record);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let mut log = log_entry("l1", "api", 20);
        for i in 0..32 {
            log.attributes.insert(format!("k{i}"), AttributeValue::Int(i));
        }
        let record = TelemetryRecord::Log(log);
        let codec = Codec::default();
        assert_eq!(codec.encode(&record).unwrap(), codec.encode(&record.clone()).unwrap());
    }

    #[test]
    fn test_special_floats_are_bit_exact() {
        let codec = uncompressed();
        for value in [f64::NAN, f64::INFINITY, -0.0, f64::MIN_POSITIVE, f64::MAX] {
            let record: TelemetryRecord = metric_sample("m", "svc", "g", value, 1).into();
            let TelemetryRecord::Metric(decoded) = codec.decode_any(&codec.encode(&record).unwrap()).unwrap()
            else {
                unreachable!("decoded a different kind");
            };
            assert_eq!(decoded.value.to_bits(), value.to_bits());
        }
    }

    #[test]
    fn test_kind_mismatch() {
        let codec = Codec::default();
        let bytes = codec.encode(&log_entry("l1", "api", 1).into()).unwrap();
        assert_eq!(
            codec.decode(&bytes, RecordKind::Span).unwrap_err(),
            CodecError::KindMismatch { expected: RecordKind::Span, actual: RecordKind::Log }
        );
    }

    #[test]
    fn test_header_errors() {
        let codec = Codec::default();
        let good = codec.encode(&log_entry("l1", "api", 1).into()).unwrap().to_vec();

        assert!(matches!(codec.decode_any(&good[..4]), Err(CodecError::Truncated { expected: 9, actual: 4 })));

        let mut bad = good.clone();
        bad[0] = b'X';
        assert!(matches!(codec.decode_any(&bad), Err(CodecError::BadMagic(_))));

        let mut bad = good.clone();
        bad[2] = 9;
        assert_eq!(codec.decode_any(&bad).unwrap_err(), CodecError::UnsupportedVersion(9));

        let mut bad = good.clone();
        bad[3] = 0;
        assert_eq!(codec.decode_any(&bad).unwrap_err(), CodecError::UnknownKind(0));

        let mut bad = good.clone();
        bad[4] = 0b1000_0000;
        assert_eq!(codec.decode_any(&bad).unwrap_err(), CodecError::UnknownFlags(0b1000_0000));
    }

    #[test]
    fn test_corruption_detected_by_checksum() {
        let codec = uncompressed();
        let mut bytes = codec.encode(&log_entry("l1", "api", 1).into()).unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(codec.decode_any(&bytes), Err(CodecError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_garbage_payload_with_valid_checksum() {
        let payload = [0xc1u8, 0xc1, 0xc1];
        let mut frame = vec![b'T', b'O', VERSION, RecordKind::Span.tag(), 0];
        frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
        frame.extend_from_slice(&payload);
        assert!(matches!(Codec::default().decode_any(&frame), Err(CodecError::Deserialize(_))));

        let mut frame = vec![b'T', b'O', VERSION, RecordKind::Span.tag(), FLAG_COMPRESSED];
        frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
        frame.extend_from_slice(&payload);
        assert!(matches!(Codec::default().decode_any(&frame), Err(CodecError::Decompress(_))));
    }

    fn arb_attributes() -> impl Strategy<Value = Attributes> {
        let value = prop_oneof![
            "[a-z ]{0,12}".prop_map(AttributeValue::Str),
            any::<i64>().prop_map(AttributeValue::Int),
            prop::num::f64::NORMAL.prop_map(AttributeValue::Double),
            any::<bool>().prop_map(AttributeValue::Bool),
        ];
        prop::collection::btree_map("[a-z.]{1,8}", value, 0..6)
    }

    fn arb_record() -> impl Strategy<Value = TelemetryRecord> {
        let log = (
            "[a-z0-9-]{1,12}",
            any::<u64>(),
            prop::option::of("[0-9a-f]{32}"),
            0usize..6,
            ".{0,64}",
            arb_attributes(),
        )
            .prop_map(|(id, ts, trace_id, sev, body, attributes)| {
                let severity = [
                    Severity::Trace,
                    Severity::Debug,
                    Severity::Info,
                    Severity::Warn,
                    Severity::Error,
                    Severity::Fatal,
                ][sev];
                TelemetryRecord::Log(LogEntry {
                    id,
                    service_name: "svc".into(),
                    timestamp: Timestamp::from_nanos(ts),
                    trace_id,
                    span_id: None,
                    severity,
                    body,
                    attributes,
                })
            });
        let metric = (
            "[a-z0-9-]{1,12}",
            "[a-z.]{1,16}",
            prop::num::f64::ANY.prop_filter("finite", |v| v.is_finite()),
            any::<u64>(),
            prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,6}", 0..4),
        )
            .prop_map(|(id, name, value, ts, labels): (String, String, f64, u64, BTreeMap<String, String>)| {
                TelemetryRecord::Metric(MetricSample {
                    id,
                    service_name: "svc".into(),
                    name,
                    value,
                    timestamp: Timestamp::from_nanos(ts),
                    labels,
                    kind: MetricKind::Counter,
                    unit: Some("1".into()),
                })
            });
        let spn = ("[0-9a-f]{16}", any::<u64>(), any::<u64>(), arb_attributes()).prop_map(
            |(span_id, start, duration, attributes)| {
                let mut s = span("trace-1", &span_id, Some("parent"), "svc", 0);
                s.start_time = Timestamp::from_nanos(start);
                s.duration_nanos = duration;
                s.attributes = attributes;
                TelemetryRecord::Span(s)
            },
        );
        prop_oneof![log, metric, spn]
    }

    proptest! {
        #[test]
        fn roundtrip_is_exact(record in arb_record(), threshold in prop_oneof![Just(0usize), Just(512), Just(usize::MAX)]) {
            let codec = Codec::new(CodecConfig::builder().compression_threshold(threshold).build());
            let bytes = codec.encode(&record).unwrap();
            prop_assert_eq!(codec.decode(&bytes, record.kind()).unwrap(), record);
        }

        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = Codec::default().decode_any(&bytes);
        }
    }
}
