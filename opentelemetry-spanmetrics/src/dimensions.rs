//! Turning spans into series keys.
use std::time::{Duration, SystemTime};

use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::{Key, KeyValue, Value};
use opentelemetry_sdk::trace::SpanData;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;

use crate::config::Dimension;

/// Name of the span name dimension.
pub const SPAN_NAME_KEY: &str = "span.name";
/// Name of the span kind dimension.
pub const SPAN_KIND_KEY: &str = "span.kind";
/// Name of the status code dimension.
pub const STATUS_CODE_KEY: &str = "status.code";

/// Dimensions present on every series, in key order.
pub const RESERVED_DIMENSIONS: [&str; 4] =
    [SERVICE_NAME, SPAN_NAME_KEY, SPAN_KIND_KEY, STATUS_CODE_KEY];

const UNKNOWN_SERVICE: &str = "unknown_service";

/// The parts of a finished span the connector aggregates on.
#[derive(Debug, Clone, Copy)]
pub struct SpanRecord<'a> {
    /// Span name.
    pub name: &'a str,
    /// Span kind.
    pub kind: &'a SpanKind,
    /// Span status.
    pub status: &'a Status,
    /// Start of the span.
    pub start_time: SystemTime,
    /// End of the span.
    pub end_time: SystemTime,
    /// Span attributes.
    pub attributes: &'a [KeyValue],
}

impl<'a> SpanRecord<'a> {
    /// Borrows the relevant fields of an exported SDK span.
    pub fn from_span_data(span: &'a SpanData) -> Self {
        SpanRecord {
            name: span.name.as_ref(),
            kind: &span.span_kind,
            status: &span.status,
            start_time: span.start_time,
            end_time: span.end_time,
            attributes: &span.attributes,
        }
    }

    /// Elapsed time between start and end, and whether the span ended before
    /// it started.
    pub(crate) fn elapsed(&self) -> (Duration, bool) {
        match self.end_time.duration_since(self.start_time) {
            Ok(elapsed) => (elapsed, false),
            Err(err) => (err.duration(), true),
        }
    }
}

/// One value of a [`SeriesKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DimensionValue {
    /// The attribute or its default resolved to this value.
    Present(String),
    /// Neither the span, the resource nor a default provided a value.
    Absent,
}

/// Identifies one metric series: dimension values in key order, reserved
/// dimensions first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey(Box<[DimensionValue]>);

impl SeriesKey {
    /// Builds a key from values already in key order.
    pub fn new(values: impl IntoIterator<Item = DimensionValue>) -> Self {
        SeriesKey(values.into_iter().collect())
    }

    /// The values of the key, reserved dimensions first.
    pub fn values(&self) -> &[DimensionValue] {
        &self.0
    }
}

/// Resolves span and resource attributes into [`SeriesKey`]s.
#[derive(Debug, Clone)]
pub struct DimensionExtractor {
    names: Vec<Key>,
    defaults: Vec<Option<String>>,
}

impl DimensionExtractor {
    /// An extractor for the reserved dimensions followed by `dimensions`.
    pub fn new(dimensions: &[Dimension]) -> Self {
        let names = RESERVED_DIMENSIONS
            .into_iter()
            .map(Key::from_static_str)
            .chain(dimensions.iter().map(|d| Key::new(d.name.clone())))
            .collect();
        let defaults = dimensions.iter().map(|d| d.default.clone()).collect();

        DimensionExtractor { names, defaults }
    }

    /// Dimension names in key order.
    pub fn names(&self) -> &[Key] {
        &self.names
    }

    /// Builds the key of the series `span` belongs to.
    pub fn extract(&self, span: &SpanRecord<'_>, resource: &Resource) -> SeriesKey {
        let service_name = resource
            .get(&Key::from_static_str(SERVICE_NAME))
            .map(|v| v.as_str().into_owned())
            .unwrap_or_else(|| UNKNOWN_SERVICE.to_string());

        let reserved = [
            service_name,
            span.name.to_string(),
            span_kind_str(span.kind).to_string(),
            status_code_str(span.status).to_string(),
        ]
        .into_iter()
        .map(DimensionValue::Present);

        let configured = self.names[RESERVED_DIMENSIONS.len()..]
            .iter()
            .zip(&self.defaults)
            .map(|(name, default)| {
                match find_attribute(span.attributes, name).or_else(|| resource.get(name)) {
                    Some(value) => DimensionValue::Present(value.as_str().into_owned()),
                    None => match default {
                        Some(default) => DimensionValue::Present(default.clone()),
                        None => DimensionValue::Absent,
                    },
                }
            });

        SeriesKey::new(reserved.chain(configured))
    }

    /// Renders `key` as attributes. Absent dimensions are left out.
    pub fn attributes(&self, key: &SeriesKey) -> Vec<KeyValue> {
        self.names
            .iter()
            .zip(key.values())
            .filter_map(|(name, value)| match value {
                DimensionValue::Present(v) => Some(KeyValue::new(name.clone(), v.clone())),
                DimensionValue::Absent => None,
            })
            .collect()
    }
}

fn find_attribute(attributes: &[KeyValue], name: &Key) -> Option<Value> {
    // Last write wins, as when attributes are set repeatedly on a span.
    attributes
        .iter()
        .rev()
        .find(|kv| &kv.key == name)
        .map(|kv| kv.value.clone())
}

pub(crate) fn span_kind_str(kind: &SpanKind) -> &'static str {
    match kind {
        SpanKind::Client => "SPAN_KIND_CLIENT",
        SpanKind::Server => "SPAN_KIND_SERVER",
        SpanKind::Producer => "SPAN_KIND_PRODUCER",
        SpanKind::Consumer => "SPAN_KIND_CONSUMER",
        SpanKind::Internal => "SPAN_KIND_INTERNAL",
    }
}

pub(crate) fn status_code_str(status: &Status) -> &'static str {
    match status {
        Status::Unset => "STATUS_CODE_UNSET",
        Status::Error { .. } => "STATUS_CODE_ERROR",
        Status::Ok => "STATUS_CODE_OK",
    }
}
