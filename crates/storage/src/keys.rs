//! Backing-store key layout.
//!
//! Keys are colon-separated and namespaced by record kind:
//!
//! | Key | Holds |
//! |-----|-------|
//! | `span:{traceId}:{spanId}` | encoded [`Span`](crate::Span) |
//! | `log:{id}` | encoded [`LogEntry`](crate::LogEntry) |
//! | `metric:{name}:{timestamp}:{id}` | encoded [`MetricSample`](crate::MetricSample) |
//! | `idx:...` | index members, see [`index`](crate::index) |
//! | `catalog:service:{name}` | last-seen time of a service |
//! | `catalog:metric:{name}` | [`MetricMetadata`](crate::MetricMetadata) |
//! | `pending:index:{recordKey}` | reconciliation marker |
//!
//! Every variable component is escaped so it cannot contain `:`. Timestamps
//! are zero-padded to 20 digits and time buckets to 12, so lexicographic key
//! order equals numeric order.

use std::borrow::Cow;

use crate::model::{RecordKind, TelemetryRecord, Timestamp};

/// Prefix of span record keys.
pub const SPAN_PREFIX: &str = "span:";
/// Prefix of log record keys.
pub const LOG_PREFIX: &str = "log:";
/// Prefix of metric record keys.
pub const METRIC_PREFIX: &str = "metric:";
/// Prefix of all index member keys.
pub const INDEX_PREFIX: &str = "idx:";
/// Prefix of service catalog keys.
pub const SERVICE_CATALOG_PREFIX: &str = "catalog:service:";
/// Prefix of metric catalog keys.
pub const METRIC_CATALOG_PREFIX: &str = "catalog:metric:";
/// Prefix of reconciliation markers.
pub const PENDING_PREFIX: &str = "pending:index:";

/// Width of a zero-padded timestamp component.
pub const TIMESTAMP_WIDTH: usize = 20;
/// Width of a zero-padded bucket component.
pub const BUCKET_WIDTH: usize = 12;

/// Escapes `%` and `:` so a component never introduces a separator.
#[must_use]
pub fn escape(component: &str) -> Cow<'_, str> {
    if !component.contains(['%', ':']) {
        return Cow::Borrowed(component);
    }
    let mut out = String::with_capacity(component.len() + 8);
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// Reverses [`escape`]. Returns `None` for malformed escape sequences.
#[must_use]
pub fn unescape(component: &str) -> Option<Cow<'_, str>> {
    if !component.contains('%') {
        return Some(Cow::Borrowed(component));
    }
    let mut out = String::with_capacity(component.len());
    let mut rest = component;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3)?;
        match code {
            "25" => out.push('%'),
            "3A" => out.push(':'),
            _ => return None,
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(Cow::Owned(out))
}

/// Formats a timestamp as a fixed-width key component.
#[must_use]
pub fn format_timestamp(ts: Timestamp) -> String {
    format!("{:0width$}", ts.as_nanos(), width = TIMESTAMP_WIDTH)
}

/// Parses a component produced by [`format_timestamp`].
#[must_use]
pub fn parse_timestamp(component: &str) -> Option<Timestamp> {
    if component.len() != TIMESTAMP_WIDTH {
        return None;
    }
    component.parse().ok().map(Timestamp::from_nanos)
}

/// Formats a bucket number as a fixed-width key component.
#[must_use]
pub fn format_bucket(bucket: u64) -> String {
    format!("{bucket:0width$}", width = BUCKET_WIDTH)
}

/// Key of a span record.
#[must_use]
pub fn span_key(trace_id: &str, span_id: &str) -> String {
    format!("{SPAN_PREFIX}{}:{}", escape(trace_id), escape(span_id))
}

/// Key of a log record.
#[must_use]
pub fn log_key(id: &str) -> String {
    format!("{LOG_PREFIX}{}", escape(id))
}

/// Key of a metric sample.
///
/// The trailing id keeps two samples of the same metric taken in the same
/// nanosecond distinct.
#[must_use]
pub fn metric_key(name: &str, ts: Timestamp, id: &str) -> String {
    format!("{METRIC_PREFIX}{}:{}:{}", escape(name), format_timestamp(ts), escape(id))
}

/// Key of any record.
#[must_use]
pub fn record_key(record: &TelemetryRecord) -> String {
    match record {
        TelemetryRecord::Span(s) => span_key(&s.trace_id, &s.span_id),
        TelemetryRecord::Log(l) => log_key(&l.id),
        TelemetryRecord::Metric(m) => metric_key(&m.name, m.timestamp, &m.id),
    }
}

/// Record kind encoded in a record key's namespace.
#[must_use]
pub fn kind_of(record_key: &str) -> Option<RecordKind> {
    if record_key.starts_with(SPAN_PREFIX) {
        Some(RecordKind::Span)
    } else if record_key.starts_with(LOG_PREFIX) {
        Some(RecordKind::Log)
    } else if record_key.starts_with(METRIC_PREFIX) {
        Some(RecordKind::Metric)
    } else {
        None
    }
}

/// Trace id embedded in a span key.
#[must_use]
pub fn trace_id_of_span_key(record_key: &str) -> Option<String> {
    let rest = record_key.strip_prefix(SPAN_PREFIX)?;
    let (trace, _span) = rest.split_once(':')?;
    unescape(trace).map(Cow::into_owned)
}

/// Service catalog key.
#[must_use]
pub fn service_catalog_key(service: &str) -> String {
    format!("{SERVICE_CATALOG_PREFIX}{}", escape(service))
}

/// Metric catalog key.
#[must_use]
pub fn metric_catalog_key(name: &str) -> String {
    format!("{METRIC_CATALOG_PREFIX}{}", escape(name))
}

/// Reconciliation marker for a record whose index update failed.
#[must_use]
pub fn pending_key(record_key: &str) -> String {
    format!("{PENDING_PREFIX}{record_key}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_escape_plain_is_borrowed() {
        assert!(matches!(escape("checkout"), Cow::Borrowed("checkout")));
        assert_eq!(escape("a:b%c"), "a%3Ab%25c");
    }

    #[test]
    fn test_unescape_rejects_malformed() {
        assert_eq!(unescape("a%3Ab").unwrap(), "a:b");
        assert!(unescape("a%3").is_none());
        assert!(unescape("a%ZZ").is_none());
    }

    #[test]
    fn test_record_keys() {
        assert_eq!(span_key("t:1", "s1"), "span:t%3A1:s1");
        assert_eq!(log_key("l-1"), "log:l-1");
        assert_eq!(
            metric_key("http.requests", Timestamp::from_nanos(42), "m1"),
            "metric:http.requests:00000000000000000042:m1"
        );
        assert_eq!(kind_of("span:a:b"), Some(RecordKind::Span));
        assert_eq!(kind_of("idx:trace:a"), None);
        assert_eq!(trace_id_of_span_key(&span_key("t:1", "s1")).as_deref(), Some("t:1"));
    }

    #[test]
    fn test_timestamp_component() {
        let ts = Timestamp::from_nanos(1_700_000_000_000_000_000);
        let formatted = format_timestamp(ts);
        assert_eq!(formatted.len(), TIMESTAMP_WIDTH);
        assert_eq!(parse_timestamp(&formatted), Some(ts));
        assert_eq!(parse_timestamp("123"), None);
        assert_eq!(format_timestamp(Timestamp::MAX).len(), TIMESTAMP_WIDTH);
    }

    proptest! {
        #[test]
        fn escape_roundtrips(s in ".*") {
            let escaped = escape(&s);
            prop_assert!(!escaped.contains(':'));
            prop_assert_eq!(unescape(&escaped).unwrap(), s.as_str());
        }

        #[test]
        fn timestamp_order_matches_key_order(a in any::<u64>(), b in any::<u64>()) {
            let ka = format_timestamp(Timestamp::from_nanos(a));
            let kb = format_timestamp(Timestamp::from_nanos(b));
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }
    }
}
