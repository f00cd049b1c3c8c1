use std::thread;
use std::time::{Duration, Instant, SystemTime};

use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_spanmetrics::{
    Config, Dimension, HistogramBuckets, InMemoryMetricsSink, MetricBatch, SpanMetricsConnector,
    SpanRecord, Temporality, EXPO_MAX_SCALE,
};

fn resource(service: &'static str) -> Resource {
    Resource::builder_empty()
        .with_attributes([KeyValue::new("service.name", service)])
        .build()
}

fn span<'a>(
    name: &'a str,
    attributes: &'a [KeyValue],
    start: SystemTime,
    elapsed: Duration,
) -> SpanRecord<'a> {
    SpanRecord {
        name,
        kind: &SpanKind::Server,
        status: &Status::Unset,
        start_time: start,
        end_time: start + elapsed,
        attributes,
    }
}

fn explicit_config() -> Config {
    Config::default()
        .with_dimension(Dimension::new("http.method").with_default("GET"))
        .with_dimension(Dimension::new("http.status_code"))
        .with_explicit_buckets(vec![
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::from_millis(250),
        ])
        .with_flush_interval(Duration::from_secs(3600))
}

fn last_batch(sink: &InMemoryMetricsSink) -> MetricBatch {
    sink.get_finished_batches()
        .unwrap()
        .pop()
        .expect("at least one batch exported")
}

#[test]
fn spans_become_calls_and_durations() {
    let sink = InMemoryMetricsSink::default();
    let connector = SpanMetricsConnector::new(explicit_config(), sink.clone()).unwrap();

    let start = SystemTime::now();
    let attributes = [KeyValue::new("http.status_code", 200_i64)];
    let spans = [5, 50, 300]
        .map(|ms| span("GET /cart", &attributes, start, Duration::from_millis(ms)));
    connector.consume_spans(spans, &resource("cart"));
    connector.force_flush().unwrap();

    let names: Vec<&str> = connector.extractor().names().iter().map(|k| k.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "service.name",
            "span.name",
            "span.kind",
            "status.code",
            "http.method",
            "http.status_code",
        ]
    );

    let batch = last_batch(&sink);
    assert_eq!(batch.temporality, Temporality::Cumulative);
    assert_eq!(batch.calls.name, "traces.span.metrics.calls");
    assert_eq!(batch.calls.data_points.len(), 1);
    assert_eq!(batch.calls.data_points[0].value, 3);
    assert_eq!(
        batch.calls.data_points[0].attributes,
        vec![
            KeyValue::new("service.name", "cart"),
            KeyValue::new("span.name", "GET /cart"),
            KeyValue::new("span.kind", "SPAN_KIND_SERVER"),
            KeyValue::new("status.code", "STATUS_CODE_UNSET"),
            KeyValue::new("http.method", "GET"),
            KeyValue::new("http.status_code", "200"),
        ]
    );

    let histogram = &batch.duration.data_points[0].value;
    assert_eq!(histogram.count, 3);
    assert_eq!(histogram.sum, 355.0);
    assert_eq!(histogram.min, Some(5.0));
    assert_eq!(histogram.max, Some(300.0));
    assert_eq!(
        histogram.buckets,
        HistogramBuckets::Explicit {
            bounds: vec![10.0, 100.0, 250.0],
            counts: vec![1, 1, 0, 1],
        }
    );
}

#[test]
fn absent_dimension_is_omitted() {
    let sink = InMemoryMetricsSink::default();
    let connector = SpanMetricsConnector::new(explicit_config(), sink.clone()).unwrap();

    let start = SystemTime::now();
    connector.consume_spans(
        [span("GET /cart", &[], start, Duration::from_millis(5))],
        &resource("cart"),
    );
    connector.force_flush().unwrap();

    let attributes = &last_batch(&sink).calls.data_points[0].attributes;
    assert!(attributes.contains(&KeyValue::new("http.method", "GET")));
    assert!(!attributes.iter().any(|kv| kv.key.as_str() == "http.status_code"));
}

#[test]
fn distinct_services_are_distinct_series() {
    let sink = InMemoryMetricsSink::default();
    let connector = SpanMetricsConnector::new(explicit_config(), sink.clone()).unwrap();

    let start = SystemTime::now();
    let elapsed = Duration::from_millis(20);
    connector.consume_spans([span("GET /cart", &[], start, elapsed)], &resource("cart"));
    connector.consume_spans([span("GET /cart", &[], start, elapsed)], &resource("web"));
    connector.consume_spans([span("GET /cart", &[], start, elapsed)], &Resource::builder_empty().build());
    connector.force_flush().unwrap();

    let mut services: Vec<String> = last_batch(&sink)
        .calls
        .data_points
        .iter()
        .map(|dp| dp.attributes[0].value.as_str().into_owned())
        .collect();
    services.sort();
    assert_eq!(services, vec!["cart", "unknown_service", "web"]);
}

#[test]
fn delta_flushes_report_each_span_once() {
    let sink = InMemoryMetricsSink::default();
    let connector = SpanMetricsConnector::new(
        explicit_config().with_temporality(Temporality::Delta),
        sink.clone(),
    )
    .unwrap();

    let start = SystemTime::now();
    let elapsed = Duration::from_millis(5);
    connector.consume_spans([span("a", &[], start, elapsed); 2], &resource("cart"));
    connector.force_flush().unwrap();
    connector.consume_spans([span("a", &[], start, elapsed)], &resource("cart"));
    connector.force_flush().unwrap();
    connector.force_flush().unwrap();

    let batches = sink.get_finished_batches().unwrap();
    let calls: Vec<u64> = batches
        .iter()
        .map(|b| b.calls.data_points[0].value)
        .collect();
    assert_eq!(calls, vec![2, 1, 0]);
    assert_eq!(batches[1].calls.data_points[0].start_time, batches[0].calls.data_points[0].time);
}

#[test]
fn cache_size_bounds_the_series() {
    let sink = InMemoryMetricsSink::default();
    let connector = SpanMetricsConnector::new(
        explicit_config().with_dimensions_cache_size(2),
        sink.clone(),
    )
    .unwrap();

    let start = SystemTime::now();
    let elapsed = Duration::from_millis(5);
    for name in ["a", "b", "c"] {
        connector.consume_spans([span(name, &[], start, elapsed)], &resource("cart"));
    }
    connector.force_flush().unwrap();

    let batch = last_batch(&sink);
    let mut names: Vec<String> = batch
        .calls
        .data_points
        .iter()
        .map(|dp| dp.attributes[1].value.as_str().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["b", "c"]);
    assert_eq!(connector.store().len(), 2);
    assert_eq!(connector.store().capacity(), 2);
}

#[test]
fn exponential_histogram_adapts_its_scale() {
    let sink = InMemoryMetricsSink::default();
    let connector = SpanMetricsConnector::new(
        Config::default()
            .with_exponential_buckets(10)
            .with_flush_interval(Duration::from_secs(3600)),
        sink.clone(),
    )
    .unwrap();

    let start = SystemTime::now();
    let spans: Vec<SpanRecord<'_>> = [0, 1, 2, 4, 8, 1000, 60_000]
        .iter()
        .map(|ms| span("a", &[], start, Duration::from_millis(*ms)))
        .collect();
    connector.consume_spans(spans, &resource("cart"));
    connector.force_flush().unwrap();

    let histogram = &last_batch(&sink).duration.data_points[0].value;
    assert_eq!(histogram.count, 7);
    assert_eq!(histogram.buckets.total(), 7);
    match &histogram.buckets {
        HistogramBuckets::Exponential {
            scale,
            zero_count,
            counts,
            ..
        } => {
            assert!(*scale < EXPO_MAX_SCALE);
            assert_eq!(*zero_count, 1);
            assert!(counts.len() <= 10);
        }
        other => panic!("unexpected buckets {other:?}"),
    }
}

#[test]
fn flushes_periodically() {
    let sink = InMemoryMetricsSink::default();
    let connector = SpanMetricsConnector::new(
        explicit_config().with_flush_interval(Duration::from_millis(25)),
        sink.clone(),
    )
    .unwrap();

    let start = SystemTime::now();
    connector.consume_spans(
        [span("a", &[], start, Duration::from_millis(5))],
        &resource("cart"),
    );
    let deadline = Instant::now() + Duration::from_secs(10);
    while sink.get_finished_batches().unwrap().len() < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }

    assert!(sink.get_finished_batches().unwrap().len() >= 2);
    connector.shutdown().unwrap();
    assert!(sink.is_shutdown());
}

#[test]
fn longest_flush_interval_still_flushes_on_demand() {
    let sink = InMemoryMetricsSink::default();
    let connector = SpanMetricsConnector::new(
        explicit_config().with_flush_interval(Duration::MAX),
        sink.clone(),
    )
    .unwrap();

    let start = SystemTime::now();
    connector.consume_spans(
        [span("a", &[], start, Duration::from_millis(5))],
        &resource("cart"),
    );
    thread::sleep(Duration::from_millis(50));
    connector.force_flush().unwrap();
    connector.shutdown().unwrap();

    let batches = sink.get_finished_batches().unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1].calls.data_points[0].value, 1);
}

#[test]
fn concurrent_producers() {
    let sink = InMemoryMetricsSink::default();
    let connector = SpanMetricsConnector::new(explicit_config(), sink.clone()).unwrap();
    let resource = resource("cart");

    thread::scope(|s| {
        for t in 0..4 {
            let connector = &connector;
            let resource = &resource;
            s.spawn(move || {
                let start = SystemTime::now();
                let name = format!("op{}", t % 2);
                for i in 0..500 {
                    connector.consume_spans(
                        [span(&name, &[], start, Duration::from_millis(i % 300))],
                        resource,
                    );
                }
            });
        }
    });
    connector.shutdown().unwrap();

    let batch = last_batch(&sink);
    let calls: u64 = batch.calls.data_points.iter().map(|dp| dp.value).sum();
    assert_eq!(calls, 2000);
}
