//! # OpenTelemetry Span Metrics
//!
//! Derives Request, Error and Duration metrics from finished spans.
//!
//! Each span is reduced to a series keyed by its service name, span name,
//! span kind, status code and a configurable list of extra dimensions. Every
//! series counts its calls and records its durations in a histogram, either
//! with fixed bucket boundaries or with exponential buckets that adapt their
//! scale to the recorded range. The number of live series is bounded, the
//! least recently updated one being evicted first.
//!
//! Aggregations are flushed periodically to a [`MetricsSink`], as cumulative
//! totals or as deltas since the previous flush.
//!
//! ```
//! use std::time::Duration;
//!
//! use opentelemetry_spanmetrics::{
//!     Config, Dimension, InMemoryMetricsSink, SpanMetricsConnector, Temporality,
//! };
//!
//! let config = Config::default()
//!     .with_temporality(Temporality::Delta)
//!     .with_dimension(Dimension::new("http.method").with_default("GET"))
//!     .with_explicit_buckets(vec![
//!         Duration::from_millis(10),
//!         Duration::from_millis(100),
//!         Duration::from_millis(250),
//!     ]);
//!
//! let connector = SpanMetricsConnector::new(config, InMemoryMetricsSink::default())
//!     .expect("valid configuration");
//! # connector.shutdown().unwrap();
//! ```
//!
//! ## Crate Feature Flags
//!
//! * `internal-logs`: emits diagnostics through the `opentelemetry` internal
//!   logging macros. Enabled by default.
//! * `serde`: deserializes [`Config`] from any serde format.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod config;
mod connector;
mod data;
mod dimensions;
mod error;
mod exporter;
mod histogram;
mod scheduler;
mod store;

pub use config::{
    validate_dimensions, Config, Dimension, ExplicitHistogramConfig, ExponentialHistogramConfig,
    HistogramConfig, HistogramSettings, HistogramUnit, Temporality, DEFAULT_EXPONENTIAL_MAX_SIZE,
};
pub use connector::SpanMetricsConnector;
pub use data::{DataPoint, Metric, MetricBatch, CALLS_METRIC, DURATION_METRIC};
pub use dimensions::{
    DimensionExtractor, DimensionValue, SeriesKey, SpanRecord, RESERVED_DIMENSIONS, SPAN_KIND_KEY,
    SPAN_NAME_KEY, STATUS_CODE_KEY,
};
pub use error::{ConfigError, ConfigViolation, SinkError, SinkResult};
pub use exporter::{InMemoryMetricsSink, MetricsSink};
pub use histogram::{HistogramBuckets, HistogramSnapshot, EXPO_MAX_SCALE, EXPO_MIN_SCALE};
pub use scheduler::{FlushScheduler, FlushState, MetricProducer};
pub use store::{AggregationStore, CollectedSeries, Collection};
