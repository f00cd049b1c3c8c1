//! Types for delivery of aggregated span metrics.

use std::borrow::Cow;
use std::time::SystemTime;

use opentelemetry::KeyValue;

use crate::config::Temporality;
use crate::histogram::HistogramSnapshot;

/// Name of the call counter, appended to the namespace.
pub const CALLS_METRIC: &str = "calls";
/// Name of the duration histogram, appended to the namespace.
pub const DURATION_METRIC: &str = "duration";

/// Everything emitted by one flush.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricBatch {
    /// Temporality of every data point in the batch.
    pub temporality: Temporality,
    /// Number of calls per series.
    pub calls: Metric<u64>,
    /// Span durations per series.
    pub duration: Metric<HistogramSnapshot>,
}

impl MetricBatch {
    /// Whether the batch carries no series.
    pub fn is_empty(&self) -> bool {
        self.calls.data_points.is_empty()
    }
}

/// One metric and its data points, one per series.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric<T> {
    /// Fully qualified metric name.
    pub name: Cow<'static, str>,
    /// Unit of the values.
    pub unit: Cow<'static, str>,
    /// Values per series.
    pub data_points: Vec<DataPoint<T>>,
}

/// The value of one series over one aggregation window.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint<T> {
    /// Dimension values of the series.
    pub attributes: Vec<KeyValue>,
    /// Start of the aggregation window.
    pub start_time: SystemTime,
    /// Time of the flush.
    pub time: SystemTime,
    /// Aggregated value.
    pub value: T,
}

pub(crate) fn metric_name(namespace: &str, name: &'static str) -> Cow<'static, str> {
    if namespace.is_empty() {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("{namespace}.{name}"))
    }
}
