//! Fuzz target for record frame decoding.
//!
//! Feeds arbitrary bytes to the codec as if they had been read back from
//! the store. Every input must yield `Ok(record)` or `Err(CodecError)`;
//! panics and unbounded allocations are bugs.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tinyolly_common_storage::{Codec, RecordKind, codec::peek_kind};

fuzz_target!(|data: &[u8]| {
    let codec = Codec::default();

    let any = codec.decode_any(data);
    for kind in RecordKind::ALL {
        let typed = codec.decode(data, kind);
        // A typed decode succeeds exactly when the untyped one does and the
        // header names the same kind.
        assert_eq!(typed.is_ok(), any.is_ok() && peek_kind(data).ok() == Some(kind));
    }

    if let Ok(record) = any {
        let reencoded = codec.encode(&record).expect("decoded records re-encode");
        codec.decode(&reencoded, record.kind()).expect("re-encoded frame decodes");
    }
});
