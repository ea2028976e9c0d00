//! Structured fuzz target for frame payloads.
//!
//! Random bytes almost never pass the header and checksum checks, so this
//! target builds a well-formed header with a correct checksum around the
//! fuzzed payload. That drives the decompression and deserialization paths
//! directly.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tinyolly_common_storage::{
    Codec, CodecConfig, RecordKind,
    codec::FLAG_COMPRESSED,
    testutil::{log_entry, metric_sample, span},
};

#[derive(Debug, Arbitrary)]
struct FuzzedFrame {
    kind: u8,
    compressed: bool,
    payload: Vec<u8>,
}

/// Header bytes (magic, version, kind) of a real frame of `kind`.
fn header_prefix(codec: &Codec, kind: RecordKind) -> Vec<u8> {
    let record = match kind {
        RecordKind::Span => span("t", "s", None, "svc", 1).into(),
        RecordKind::Log => log_entry("l", "svc", 1).into(),
        RecordKind::Metric => metric_sample("m", "svc", "cpu", 1.0, 1).into(),
    };
    let frame = codec.encode(&record).expect("fixture encodes");
    frame[..4].to_vec()
}

fuzz_target!(|input: FuzzedFrame| {
    let codec = Codec::new(CodecConfig::builder().compression_threshold(usize::MAX).build());
    let kind = RecordKind::ALL[usize::from(input.kind) % RecordKind::ALL.len()];

    let mut frame = header_prefix(&codec, kind);
    frame.push(if input.compressed { FLAG_COMPRESSED } else { 0 });
    frame.extend_from_slice(&crc32fast::hash(&input.payload).to_be_bytes());
    frame.extend_from_slice(&input.payload);

    if let Ok(record) = codec.decode(&frame, kind) {
        assert_eq!(record.kind(), kind);
    }
});
