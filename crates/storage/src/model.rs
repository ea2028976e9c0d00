//! Telemetry data model.
//!
//! A [`TelemetryRecord`] is one of three immutable variants: [`Span`],
//! [`LogEntry`] or [`MetricSample`]. Records are never updated in place; a
//! correction arrives as a new record. [`Trace`] and [`ServiceMap`] are derived
//! aggregates assembled on read.
//!
//! Attribute and label maps are [`BTreeMap`]s so encoding is deterministic.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    str::FromStr,
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// ───────────────────────────────────────────────────────────────────────────
// Timestamp / TimeRange
// ───────────────────────────────────────────────────────────────────────────

/// UTC instant with nanosecond precision, stored as nanoseconds since the
/// Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Self = Self(0);

    /// The largest representable instant.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a timestamp from nanoseconds since the epoch.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a timestamp from microseconds since the epoch.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros.saturating_mul(1_000))
    }

    /// Creates a timestamp from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Creates a timestamp from whole seconds since the epoch.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Converts from a chrono `DateTime`. Instants before the epoch clamp to it.
    #[must_use]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        match dt.timestamp_nanos_opt() {
            Some(nanos) => Self(u64::try_from(nanos).unwrap_or(0)),
            None if dt.timestamp() > 0 => Self::MAX,
            None => Self::EPOCH,
        }
    }

    /// Converts to a chrono `DateTime`.
    #[must_use]
    pub fn to_datetime(self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(i64::try_from(self.0).unwrap_or(i64::MAX))
    }

    /// Nanoseconds since the epoch.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns `self + duration`, saturating at [`Timestamp::MAX`].
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_nanos(duration)))
    }

    /// Returns `self - duration`, saturating at the epoch.
    #[must_use]
    pub fn saturating_sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_nanos(duration)))
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    #[must_use]
    pub fn duration_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_datetime().to_rfc3339_opts(SecondsFormat::Nanos, true))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

/// Converts a duration to whole nanoseconds, saturating at `u64::MAX`.
pub(crate) fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// A closed time interval. Missing bounds are open-ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive lower bound.
    pub start: Option<Timestamp>,
    /// Inclusive upper bound.
    pub end: Option<Timestamp>,
}

impl TimeRange {
    /// The unbounded range.
    #[must_use]
    pub const fn all() -> Self {
        Self { start: None, end: None }
    }

    /// `[start, end]`, both inclusive.
    #[must_use]
    pub const fn between(start: Timestamp, end: Timestamp) -> Self {
        Self { start: Some(start), end: Some(end) }
    }

    /// Everything at or after `start`.
    #[must_use]
    pub const fn since(start: Timestamp) -> Self {
        Self { start: Some(start), end: None }
    }

    /// The trailing `window` ending at `now`.
    #[must_use]
    pub fn last(window: Duration, now: Timestamp) -> Self {
        Self::between(now.saturating_sub(window), now)
    }

    /// Returns `true` if `ts` lies within the range.
    #[must_use]
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start.is_none_or(|s| ts >= s) && self.end.is_none_or(|e| ts <= e)
    }

    /// Returns `true` if both bounds are set.
    #[must_use]
    pub fn is_bounded(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }

    /// Returns `true` if no instant can satisfy the range.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!((self.start, self.end), (Some(s), Some(e)) if s > e)
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Attributes
// ───────────────────────────────────────────────────────────────────────────

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    /// UTF-8 string.
    Str(String),
    /// Signed integer.
    Int(i64),
    /// Double-precision float.
    Double(f64),
    /// Boolean.
    Bool(bool),
}

impl AttributeValue {
    /// Case-insensitive substring match against the value's text form.
    ///
    /// `needle` must already be lowercase.
    #[must_use]
    pub fn contains_text(&self, needle: &str) -> bool {
        match self {
            Self::Str(s) => s.to_lowercase().contains(needle),
            other => other.to_string().to_lowercase().contains(needle),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Attribute map attached to spans, span events and logs.
pub type Attributes = BTreeMap<String, AttributeValue>;

fn attributes_contain(attributes: &Attributes, needle: &str) -> bool {
    attributes.values().any(|v| v.contains_text(needle))
}

// ───────────────────────────────────────────────────────────────────────────
// Record kinds
// ───────────────────────────────────────────────────────────────────────────

/// Discriminant of a [`TelemetryRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// A [`Span`].
    Span,
    /// A [`LogEntry`].
    Log,
    /// A [`MetricSample`].
    Metric,
}

impl RecordKind {
    /// All kinds, in tag order.
    pub const ALL: [Self; 3] = [Self::Span, Self::Log, Self::Metric];

    /// Stable lowercase name used in keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Span => "span",
            Self::Log => "log",
            Self::Metric => "metric",
        }
    }

    /// Wire tag written into the codec frame header.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Span => 1,
            Self::Log => 2,
            Self::Metric => 3,
        }
    }

    /// Inverse of [`tag`](Self::tag).
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Span),
            2 => Some(Self::Log),
            3 => Some(Self::Metric),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Span
// ───────────────────────────────────────────────────────────────────────────

/// Completion status of a span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    /// No status was reported.
    #[default]
    Unset,
    /// The operation completed successfully.
    Ok,
    /// The operation failed.
    Error,
}

/// Role of a span in a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    /// Internal operation.
    #[default]
    Internal,
    /// Handles an inbound request.
    Server,
    /// Issues an outbound request.
    Client,
    /// Enqueues a message.
    Producer,
    /// Processes a message.
    Consumer,
}

/// A timestamped event recorded inside a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    /// Event name.
    pub name: String,
    /// When the event occurred.
    pub time: Timestamp,
    /// Event attributes.
    #[serde(default)]
    pub attributes: Attributes,
}

/// One timed operation within a distributed trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Identifier shared by every span in the trace.
    pub trace_id: String,
    /// Identifier of this span, unique within the trace.
    pub span_id: String,
    /// Parent span, absent for a root span.
    pub parent_span_id: Option<String>,
    /// Producing service.
    pub service_name: String,
    /// Operation name.
    pub operation_name: String,
    /// Start time.
    pub start_time: Timestamp,
    /// Duration in nanoseconds.
    pub duration_nanos: u64,
    /// Completion status.
    #[serde(default)]
    pub status: SpanStatus,
    /// Optional status description.
    #[serde(default)]
    pub status_message: Option<String>,
    /// Span role.
    #[serde(default)]
    pub kind: SpanKind,
    /// Span attributes.
    #[serde(default)]
    pub attributes: Attributes,
    /// Events and log references recorded during the span.
    #[serde(default)]
    pub events: Vec<SpanEvent>,
}

impl Span {
    /// End time (`start_time + duration`).
    #[must_use]
    pub fn end_time(&self) -> Timestamp {
        Timestamp::from_nanos(self.start_time.as_nanos().saturating_add(self.duration_nanos))
    }

    /// Returns `true` if the span reported an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == SpanStatus::Error
    }

    /// Parent id, treating an empty string as absent.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.parent_span_id.as_deref().filter(|p| !p.is_empty())
    }

    /// Case-insensitive free-text match over operation name, status message,
    /// attribute values and event names. `needle` must be lowercase.
    #[must_use]
    pub fn matches_text(&self, needle: &str) -> bool {
        self.operation_name.to_lowercase().contains(needle)
            || self.status_message.as_ref().is_some_and(|m| m.to_lowercase().contains(needle))
            || attributes_contain(&self.attributes, needle)
            || self.events.iter().any(|e| e.name.to_lowercase().contains(needle))
    }
}

// ───────────────────────────────────────────────────────────────────────────
// LogEntry
// ───────────────────────────────────────────────────────────────────────────

/// Log severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Finest-grained diagnostics.
    Trace,
    /// Debug diagnostics.
    Debug,
    /// Informational.
    #[default]
    Info,
    /// Warning.
    Warn,
    /// Error.
    Error,
    /// Unrecoverable error.
    Fatal,
}

impl Severity {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown severity name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown severity: {0}")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" | "information" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" | "err" => Ok(Self::Error),
            "fatal" | "critical" => Ok(Self::Fatal),
            _ => Err(UnknownSeverity(s.to_owned())),
        }
    }
}

/// A structured log line, optionally correlated with a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Globally unique identifier.
    pub id: String,
    /// Producing service.
    pub service_name: String,
    /// Emission time.
    pub timestamp: Timestamp,
    /// Correlated trace.
    #[serde(default)]
    pub trace_id: Option<String>,
    /// Correlated span.
    #[serde(default)]
    pub span_id: Option<String>,
    /// Severity.
    #[serde(default)]
    pub severity: Severity,
    /// Message body.
    pub body: String,
    /// Structured attributes.
    #[serde(default)]
    pub attributes: Attributes,
}

impl LogEntry {
    /// Correlated trace id, treating an empty string as absent.
    #[must_use]
    pub fn trace(&self) -> Option<&str> {
        self.trace_id.as_deref().filter(|t| !t.is_empty())
    }

    /// Case-insensitive free-text match over body and attribute values.
    /// `needle` must be lowercase.
    #[must_use]
    pub fn matches_text(&self, needle: &str) -> bool {
        self.body.to_lowercase().contains(needle) || attributes_contain(&self.attributes, needle)
    }
}

// ───────────────────────────────────────────────────────────────────────────
// MetricSample
// ───────────────────────────────────────────────────────────────────────────

/// Kind of metric instrument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic sum.
    Counter,
    /// Point-in-time value.
    #[default]
    Gauge,
    /// Distribution summary.
    Histogram,
}

/// A single metric observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Globally unique identifier.
    pub id: String,
    /// Producing service.
    pub service_name: String,
    /// Metric name.
    pub name: String,
    /// Observed value.
    pub value: f64,
    /// Sample time.
    pub timestamp: Timestamp,
    /// Label set.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Instrument kind.
    #[serde(default)]
    pub kind: MetricKind,
    /// Unit of measure.
    #[serde(default)]
    pub unit: Option<String>,
}

impl MetricSample {
    /// Case-insensitive free-text match over metric name and label values.
    /// `needle` must be lowercase.
    #[must_use]
    pub fn matches_text(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle)
            || self.labels.values().any(|v| v.to_lowercase().contains(needle))
    }
}

/// Catalog entry describing a metric name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricMetadata {
    /// Metric name.
    pub name: String,
    /// Instrument kind of the most recent sample.
    pub kind: MetricKind,
    /// Unit of the most recent sample.
    pub unit: Option<String>,
    /// Service that produced the most recent sample.
    pub last_service: String,
    /// Time of the most recent sample.
    pub last_seen: Timestamp,
}

// ───────────────────────────────────────────────────────────────────────────
// TelemetryRecord
// ───────────────────────────────────────────────────────────────────────────

/// A single ingested telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TelemetryRecord {
    /// A span.
    Span(Span),
    /// A log entry.
    Log(LogEntry),
    /// A metric sample.
    Metric(MetricSample),
}

impl TelemetryRecord {
    /// Discriminant.
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Span(_) => RecordKind::Span,
            Self::Log(_) => RecordKind::Log,
            Self::Metric(_) => RecordKind::Metric,
        }
    }

    /// Globally unique identifier. Spans are identified by `{traceId}:{spanId}`.
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Self::Span(s) => format!("{}:{}", s.trace_id, s.span_id),
            Self::Log(l) => l.id.clone(),
            Self::Metric(m) => m.id.clone(),
        }
    }

    /// Producing service.
    #[must_use]
    pub fn service_name(&self) -> &str {
        match self {
            Self::Span(s) => &s.service_name,
            Self::Log(l) => &l.service_name,
            Self::Metric(m) => &m.service_name,
        }
    }

    /// Record time: start time for spans, emission or sample time otherwise.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Span(s) => s.start_time,
            Self::Log(l) => l.timestamp,
            Self::Metric(m) => m.timestamp,
        }
    }

    /// Trace the record belongs to or is correlated with.
    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        match self {
            Self::Span(s) => Some(&s.trace_id),
            Self::Log(l) => l.trace(),
            Self::Metric(_) => None,
        }
    }

    /// Backing-store key of the record.
    #[must_use]
    pub fn record_key(&self) -> String {
        crate::keys::record_key(self)
    }

    /// Names the first missing required field, if any.
    #[must_use]
    pub fn missing_field(&self) -> Option<&'static str> {
        let required: Vec<(&'static str, &str)> = match self {
            Self::Span(s) => vec![
                ("trace_id", s.trace_id.as_str()),
                ("span_id", s.span_id.as_str()),
                ("service_name", s.service_name.as_str()),
                ("operation_name", s.operation_name.as_str()),
            ],
            Self::Log(l) => vec![("id", l.id.as_str()), ("service_name", l.service_name.as_str())],
            Self::Metric(m) => vec![
                ("id", m.id.as_str()),
                ("service_name", m.service_name.as_str()),
                ("name", m.name.as_str()),
            ],
        };
        required.iter().find(|(_, value)| value.trim().is_empty()).map(|(field, _)| *field)
    }
}

impl From<Span> for TelemetryRecord {
    fn from(span: Span) -> Self {
        Self::Span(span)
    }
}

impl From<LogEntry> for TelemetryRecord {
    fn from(log: LogEntry) -> Self {
        Self::Log(log)
    }
}

impl From<MetricSample> for TelemetryRecord {
    fn from(metric: MetricSample) -> Self {
        Self::Metric(metric)
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Trace
// ───────────────────────────────────────────────────────────────────────────

/// How a span's parent reference resolved during trace assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentLink {
    /// The span has no parent.
    Root,
    /// The parent is the span at this index of [`Trace::spans`].
    Resolved(usize),
    /// The parent id names a span that is not part of the trace.
    Dangling(String),
}

/// A span positioned within an assembled [`Trace`].
#[derive(Debug, Clone, PartialEq)]
pub struct TraceSpan {
    /// The span itself.
    pub span: Span,
    /// Resolved parent.
    pub parent: ParentLink,
    /// Distance from the nearest ancestor without a resolved parent.
    pub depth: usize,
}

/// All spans sharing a trace id, arranged as a call tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    /// Trace identifier.
    pub trace_id: String,
    /// Spans sorted by start time, ties broken by span id.
    pub spans: Vec<TraceSpan>,
    /// Index of the root span in [`spans`](Self::spans).
    pub root_index: usize,
    /// `true` if no span lacks a parent and the earliest span stands in as root.
    pub root_missing: bool,
    /// Earliest span start.
    pub start_time: Timestamp,
    /// Latest span end.
    pub end_time: Timestamp,
    /// Services that produced spans in this trace.
    pub services: BTreeSet<String>,
    /// Number of spans with error status.
    pub error_count: usize,
}

impl Trace {
    /// Assembles a trace from its spans, in any order.
    ///
    /// Duplicate span ids (from at-least-once writes) keep the first copy in
    /// start-time order. Returns `None` when `spans` is empty.
    #[must_use]
    pub fn assemble(trace_id: impl Into<String>, mut spans: Vec<Span>) -> Option<Self> {
        if spans.is_empty() {
            return None;
        }
        spans.sort_by(|a, b| {
            a.start_time.cmp(&b.start_time).then_with(|| a.span_id.cmp(&b.span_id))
        });
        let mut seen = BTreeSet::new();
        spans.retain(|s| seen.insert(s.span_id.clone()));

        let positions: HashMap<&str, usize> =
            spans.iter().enumerate().map(|(i, s)| (s.span_id.as_str(), i)).collect();
        let parents: Vec<ParentLink> = spans
            .iter()
            .map(|s| match s.parent() {
                None => ParentLink::Root,
                Some(parent) if parent == s.span_id => ParentLink::Dangling(parent.to_owned()),
                Some(parent) => match positions.get(parent) {
                    Some(&i) => ParentLink::Resolved(i),
                    None => ParentLink::Dangling(parent.to_owned()),
                },
            })
            .collect();

        let depths: Vec<usize> = (0..spans.len()).map(|i| depth_of(&parents, i)).collect();
        let (root_index, root_missing) =
            match parents.iter().position(|p| *p == ParentLink::Root) {
                Some(i) => (i, false),
                None => (0, true),
            };

        let start_time = spans.iter().map(|s| s.start_time).min().unwrap_or_default();
        let end_time = spans.iter().map(Span::end_time).max().unwrap_or_default();
        let services = spans.iter().map(|s| s.service_name.clone()).collect();
        let error_count = spans.iter().filter(|s| s.is_error()).count();

        let spans = spans
            .into_iter()
            .zip(parents)
            .zip(depths)
            .map(|((span, parent), depth)| TraceSpan { span, parent, depth })
            .collect();

        Some(Self {
            trace_id: trace_id.into(),
            spans,
            root_index,
            root_missing,
            start_time,
            end_time,
            services,
            error_count,
        })
    }

    /// The root span.
    #[must_use]
    pub fn root(&self) -> &Span {
        &self.spans[self.root_index].span
    }

    /// Aggregate duration from the earliest start to the latest end.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end_time.duration_since(self.start_time)
    }

    /// Number of spans.
    #[must_use]
    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// Returns `true` if every parent reference resolved.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        !self.spans.iter().any(|s| matches!(s.parent, ParentLink::Dangling(_)))
    }

    /// Spans whose parent id did not resolve.
    pub fn dangling(&self) -> impl Iterator<Item = &TraceSpan> {
        self.spans.iter().filter(|s| matches!(s.parent, ParentLink::Dangling(_)))
    }

    /// Indexes of the direct children of the span at `index`.
    #[must_use]
    pub fn children(&self, index: usize) -> Vec<usize> {
        self.spans
            .iter()
            .enumerate()
            .filter(|(_, s)| s.parent == ParentLink::Resolved(index))
            .map(|(i, _)| i)
            .collect()
    }

    /// Finds a span by id.
    #[must_use]
    pub fn span(&self, span_id: &str) -> Option<&TraceSpan> {
        self.spans.iter().find(|s| s.span.span_id == span_id)
    }

    /// Condensed list view of this trace.
    #[must_use]
    pub fn summary(&self) -> TraceSummary {
        let root = self.root();
        TraceSummary {
            trace_id: self.trace_id.clone(),
            root_service: root.service_name.clone(),
            root_operation: root.operation_name.clone(),
            start_time: self.start_time,
            duration_nanos: duration_nanos(self.duration()),
            span_count: self.spans.len(),
            error_count: self.error_count,
            root_missing: self.root_missing,
        }
    }
}

/// Walks resolved parents upward. Bounded by the span count so a cycle of
/// parent references terminates.
fn depth_of(parents: &[ParentLink], index: usize) -> usize {
    let mut depth = 0;
    let mut current = index;
    while let ParentLink::Resolved(parent) = parents[current] {
        depth += 1;
        if depth >= parents.len() {
            break;
        }
        current = parent;
    }
    depth
}

/// Condensed view of a trace for list queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSummary {
    /// Trace identifier.
    pub trace_id: String,
    /// Service of the root span.
    pub root_service: String,
    /// Operation of the root span.
    pub root_operation: String,
    /// Earliest span start.
    pub start_time: Timestamp,
    /// Aggregate duration.
    pub duration_nanos: u64,
    /// Number of spans.
    pub span_count: usize,
    /// Number of spans with error status.
    pub error_count: usize,
    /// Whether the root span was missing.
    pub root_missing: bool,
}

// ───────────────────────────────────────────────────────────────────────────
// Service map
// ───────────────────────────────────────────────────────────────────────────

/// Aggregated calls from one service to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceEdge {
    /// Calling service.
    pub caller: String,
    /// Called service.
    pub callee: String,
    /// Number of calls observed.
    pub call_count: u64,
    /// Number of those calls whose callee span failed.
    pub error_count: u64,
}

/// Service dependency graph over a time window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMap {
    /// Services that produced spans in the window.
    pub services: Vec<String>,
    /// Edges at or above the minimum call count, sorted by caller then callee.
    pub edges: Vec<ServiceEdge>,
    /// Window the map was computed over.
    pub window: TimeRange,
}

impl ServiceMap {
    /// Aggregates `(caller, callee, is_error)` call observations.
    ///
    /// Self-calls are ignored. Edges with fewer than `min_call_count` calls
    /// are dropped.
    #[must_use]
    pub fn aggregate<'a>(
        window: TimeRange,
        services: impl IntoIterator<Item = &'a str>,
        calls: impl IntoIterator<Item = (&'a str, &'a str, bool)>,
        min_call_count: u64,
    ) -> Self {
        let mut counts: BTreeMap<(&str, &str), (u64, u64)> = BTreeMap::new();
        for (caller, callee, is_error) in calls {
            if caller == callee {
                continue;
            }
            let entry = counts.entry((caller, callee)).or_default();
            entry.0 += 1;
            if is_error {
                entry.1 += 1;
            }
        }
        let edges = counts
            .into_iter()
            .filter(|(_, (calls, _))| *calls >= min_call_count)
            .map(|((caller, callee), (call_count, error_count))| ServiceEdge {
                caller: caller.to_owned(),
                callee: callee.to_owned(),
                call_count,
                error_count,
            })
            .collect();
        let services: BTreeSet<&str> = services.into_iter().collect();
        Self { services: services.into_iter().map(str::to_owned).collect(), edges, window }
    }
}
