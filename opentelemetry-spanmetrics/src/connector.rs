use std::borrow::Cow;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use opentelemetry::otel_info;
use opentelemetry_sdk::trace::SpanData;
use opentelemetry_sdk::Resource;

use crate::config::{Config, HistogramUnit, Temporality};
use crate::data::{metric_name, DataPoint, Metric, MetricBatch, CALLS_METRIC, DURATION_METRIC};
use crate::dimensions::{DimensionExtractor, SpanRecord};
use crate::error::{ConfigError, ConfigViolation, SinkResult};
use crate::exporter::MetricsSink;
use crate::histogram::HistogramFactory;
use crate::scheduler::{FlushScheduler, FlushState, MetricProducer};
use crate::store::AggregationStore;

/// Extraction and aggregation shared by the caller and the flush thread.
struct SpanMetricsPipeline {
    extractor: DimensionExtractor,
    store: AggregationStore,
    unit: HistogramUnit,
    temporality: Temporality,
    calls_name: Cow<'static, str>,
    duration_name: Cow<'static, str>,
}

impl SpanMetricsPipeline {
    fn record(&self, span: &SpanRecord<'_>, resource: &Resource) {
        let key = self.extractor.extract(span, resource);
        let (elapsed, inverted) = span.elapsed();
        let sample = self.unit.convert(elapsed);
        self.store
            .record(key, if inverted { -sample } else { sample });
    }
}

impl MetricProducer for SpanMetricsPipeline {
    fn produce(&self) -> MetricBatch {
        let collection = self.store.collect();

        let mut calls = Vec::with_capacity(collection.series.len());
        let mut durations = Vec::with_capacity(collection.series.len());
        for series in collection.series {
            let attributes = self.extractor.attributes(&series.key);
            calls.push(DataPoint {
                attributes: attributes.clone(),
                start_time: collection.start_time,
                time: collection.time,
                value: series.calls,
            });
            durations.push(DataPoint {
                attributes,
                start_time: collection.start_time,
                time: collection.time,
                value: series.histogram,
            });
        }

        MetricBatch {
            temporality: self.temporality,
            calls: Metric {
                name: self.calls_name.clone(),
                unit: Cow::Borrowed("1"),
                data_points: calls,
            },
            duration: Metric {
                name: self.duration_name.clone(),
                unit: Cow::Borrowed(self.unit.as_str()),
                data_points: durations,
            },
        }
    }
}

/// Derives request count and duration metrics from finished spans.
///
/// Every span is reduced to a series identified by the service name, span
/// name, span kind, status code and the configured dimensions. The calls
/// counter and duration histogram of each series are handed to the sink every
/// `metrics_flush_interval`.
///
/// # Example
///
/// ```
/// use std::time::{Duration, SystemTime};
///
/// use opentelemetry::trace::{SpanKind, Status};
/// use opentelemetry::KeyValue;
/// use opentelemetry_sdk::Resource;
/// use opentelemetry_spanmetrics::{
///     Config, Dimension, InMemoryMetricsSink, SpanMetricsConnector, SpanRecord,
/// };
///
/// let config = Config::default().with_dimension(Dimension::new("http.method"));
/// let sink = InMemoryMetricsSink::default();
/// let connector = SpanMetricsConnector::new(config, sink.clone()).unwrap();
///
/// let start = SystemTime::now();
/// let attributes = [KeyValue::new("http.method", "GET")];
/// let span = SpanRecord {
///     name: "GET /users",
///     kind: &SpanKind::Server,
///     status: &Status::Unset,
///     start_time: start,
///     end_time: start + Duration::from_millis(12),
///     attributes: &attributes,
/// };
/// let resource = Resource::builder_empty()
///     .with_attributes([KeyValue::new("service.name", "users")])
///     .build();
///
/// connector.consume_spans([span], &resource);
/// connector.shutdown().unwrap();
///
/// let batches = sink.get_finished_batches().unwrap();
/// assert_eq!(batches[0].calls.data_points[0].value, 1);
/// ```
pub struct SpanMetricsConnector<E: MetricsSink> {
    pipeline: Arc<SpanMetricsPipeline>,
    scheduler: FlushScheduler<E>,
}

impl<E: MetricsSink> fmt::Debug for SpanMetricsConnector<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanMetricsConnector")
            .field("extractor", &self.pipeline.extractor)
            .field("store", &self.pipeline.store)
            .field("unit", &self.pipeline.unit)
            .finish()
    }
}

impl<E: MetricsSink> SpanMetricsConnector<E> {
    /// Validates `config` and starts flushing to `sink`.
    ///
    /// # Errors
    ///
    /// Returns every rule `config` violates.
    pub fn new(config: Config, sink: E) -> Result<Self, ConfigError> {
        let settings = config.histogram_settings()?;
        let capacity = NonZeroUsize::new(config.dimensions_cache_size).ok_or(
            ConfigViolation::InvalidCacheSize(config.dimensions_cache_size),
        )?;

        let store = AggregationStore::new(
            capacity,
            HistogramFactory::from(&settings),
            config.aggregation_temporality,
            config.metrics_expiration,
        );
        let pipeline = Arc::new(SpanMetricsPipeline {
            extractor: DimensionExtractor::new(&config.dimensions),
            store,
            unit: settings.unit(),
            temporality: config.aggregation_temporality,
            calls_name: metric_name(&config.namespace, CALLS_METRIC),
            duration_name: metric_name(&config.namespace, DURATION_METRIC),
        });

        otel_info!(
            name: "SpanMetricsConnectorCreated",
            temporality = format!("{:?}", config.aggregation_temporality),
            dimensions = config.dimensions.len(),
            cache_size = capacity.get(),
            unit = settings.unit().as_str()
        );

        let producer: Arc<dyn MetricProducer> = pipeline.clone();
        let scheduler = FlushScheduler::start(producer, sink, config.metrics_flush_interval);

        Ok(SpanMetricsConnector {
            pipeline,
            scheduler,
        })
    }

    /// Aggregates a group of finished spans that share `resource`.
    pub fn consume_spans<'a>(
        &self,
        spans: impl IntoIterator<Item = SpanRecord<'a>>,
        resource: &Resource,
    ) {
        for span in spans {
            self.pipeline.record(&span, resource);
        }
    }

    /// Aggregates spans exported by the SDK.
    pub fn consume_span_data(&self, spans: &[SpanData], resource: &Resource) {
        self.consume_spans(spans.iter().map(SpanRecord::from_span_data), resource);
    }

    /// Collects the aggregation without handing it to the sink.
    ///
    /// With delta temporality the collected values are not reported again.
    pub fn collect(&self) -> MetricBatch {
        self.pipeline.produce()
    }

    /// Flushes to the sink now.
    pub fn force_flush(&self) -> SinkResult {
        self.scheduler.force_flush()
    }

    /// Flushes one last time and shuts the sink down.
    ///
    /// Spans consumed afterwards are still aggregated but never exported.
    pub fn shutdown(&self) -> SinkResult {
        self.scheduler.shutdown()
    }

    /// State of the flush cycle.
    pub fn flush_state(&self) -> FlushState {
        self.scheduler.state()
    }

    /// The underlying aggregation store.
    pub fn store(&self) -> &AggregationStore {
        &self.pipeline.store
    }

    /// The extractor turning spans into series keys.
    pub fn extractor(&self) -> &DimensionExtractor {
        &self.pipeline.extractor
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use opentelemetry::trace::{SpanKind, Status};
    use opentelemetry::KeyValue;
    use rstest::rstest;

    use super::*;
    use crate::config::Dimension;
    use crate::error::SinkError;
    use crate::exporter::InMemoryMetricsSink;
    use crate::histogram::HistogramBuckets;

    fn resource() -> Resource {
        Resource::builder_empty()
            .with_attributes([KeyValue::new("service.name", "checkout")])
            .build()
    }

    fn span<'a>(attributes: &'a [KeyValue], start: SystemTime, elapsed_ms: u64) -> SpanRecord<'a> {
        SpanRecord {
            name: "POST /pay",
            kind: &SpanKind::Server,
            status: &Status::Unset,
            start_time: start,
            end_time: start + Duration::from_millis(elapsed_ms),
            attributes,
        }
    }

    fn connector(config: Config) -> (SpanMetricsConnector<InMemoryMetricsSink>, InMemoryMetricsSink) {
        let sink = InMemoryMetricsSink::default();
        let connector = SpanMetricsConnector::new(
            config.with_flush_interval(Duration::from_secs(3600)),
            sink.clone(),
        )
        .unwrap();
        (connector, sink)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = Config::default()
            .with_unit("h")
            .with_dimensions_cache_size(0)
            .with_dimension(Dimension::new("span.kind"));

        let err = SpanMetricsConnector::new(config, InMemoryMetricsSink::default()).unwrap_err();

        assert_eq!(err.violations().len(), 3);
    }

    #[test]
    fn metric_names_and_units() {
        let (connector, _) = connector(
            Config::default()
                .with_namespace("spans")
                .with_unit("s"),
        );
        let start = SystemTime::now();
        connector.consume_spans([span(&[], start, 1500)], &resource());

        let batch = connector.collect();
        assert_eq!(batch.calls.name, "spans.calls");
        assert_eq!(batch.calls.unit, "1");
        assert_eq!(batch.duration.name, "spans.duration");
        assert_eq!(batch.duration.unit, "s");
        assert_eq!(batch.duration.data_points[0].value.sum, 1.5);
    }

    #[test]
    fn reserved_dimensions_are_emitted() {
        let (connector, _) = connector(Config::default());
        let start = SystemTime::now();
        connector.consume_spans([span(&[], start, 5)], &resource());

        let batch = connector.collect();
        assert_eq!(
            batch.calls.data_points[0].attributes,
            vec![
                KeyValue::new("service.name", "checkout"),
                KeyValue::new("span.name", "POST /pay"),
                KeyValue::new("span.kind", "SPAN_KIND_SERVER"),
                KeyValue::new("status.code", "STATUS_CODE_UNSET"),
            ]
        );
    }

    #[rstest]
    #[case::cumulative(Temporality::Cumulative, 2)]
    #[case::delta(Temporality::Delta, 1)]
    fn temporality_of_second_flush(#[case] temporality: Temporality, #[case] expected: u64) {
        let (connector, sink) = connector(Config::default().with_temporality(temporality));
        let start = SystemTime::now();

        connector.consume_spans([span(&[], start, 5)], &resource());
        connector.force_flush().unwrap();
        connector.consume_spans([span(&[], start, 5)], &resource());
        connector.force_flush().unwrap();

        let batches = sink.get_finished_batches().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].temporality, temporality);
        assert_eq!(batches[1].calls.data_points[0].value, expected);
    }

    #[test]
    fn inverted_span_is_dropped() {
        let (connector, sink) = connector(Config::default());
        let start = SystemTime::now();
        let inverted = SpanRecord {
            end_time: start - Duration::from_millis(5),
            ..span(&[], start, 0)
        };

        connector.consume_spans([inverted], &resource());
        connector.force_flush().unwrap();

        assert!(connector.store().is_empty());
        assert!(sink.get_finished_batches().unwrap().is_empty());
    }

    #[test]
    fn zero_duration_span_is_counted() {
        let (connector, _) = connector(Config::default());
        let start = SystemTime::now();
        connector.consume_spans([span(&[], start, 0)], &resource());

        let batch = connector.collect();
        let histogram = &batch.duration.data_points[0].value;
        assert_eq!(batch.calls.data_points[0].value, 1);
        assert_eq!(histogram.sum, 0.0);
        match &histogram.buckets {
            HistogramBuckets::Explicit { counts, .. } => assert_eq!(counts[0], 1),
            other => panic!("unexpected buckets {other:?}"),
        }
    }

    #[test]
    fn shutdown_is_final() {
        let (connector, sink) = connector(Config::default());
        let start = SystemTime::now();
        connector.consume_spans([span(&[], start, 5)], &resource());

        connector.shutdown().unwrap();

        assert_eq!(sink.get_finished_batches().unwrap().len(), 1);
        assert!(sink.is_shutdown());
        assert!(matches!(connector.shutdown(), Err(SinkError::AlreadyShutdown)));
        assert!(matches!(
            connector.force_flush(),
            Err(SinkError::AlreadyShutdown)
        ));
        assert_eq!(connector.flush_state(), FlushState::Idle);
    }
}
