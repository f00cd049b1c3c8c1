//! Bounded storage of per-series aggregations.
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use lru::LruCache;
use opentelemetry::{otel_debug, otel_info};

use crate::config::Temporality;
use crate::dimensions::SeriesKey;
use crate::histogram::{HistogramAccumulator, HistogramFactory, HistogramSnapshot};

/// Call count and duration histogram of one series.
#[derive(Debug)]
struct AggregationEntry {
    calls: u64,
    histogram: HistogramAccumulator,
    last_updated: Instant,
}

impl AggregationEntry {
    fn new(factory: &HistogramFactory, now: Instant) -> Self {
        AggregationEntry {
            calls: 0,
            histogram: HistogramAccumulator::new(factory),
            last_updated: now,
        }
    }

    fn record(&mut self, sample: f64, now: Instant) {
        self.calls += 1;
        self.histogram.add(sample);
        self.last_updated = now;
    }

    fn reset(&mut self) {
        self.calls = 0;
        self.histogram.reset();
    }
}

/// One series as seen by a [`AggregationStore::collect`] pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedSeries {
    /// Series identity.
    pub key: SeriesKey,
    /// Number of spans recorded.
    pub calls: u64,
    /// Durations of those spans.
    pub histogram: HistogramSnapshot,
}

/// Result of one [`AggregationStore::collect`] pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    /// Temporality the values were aggregated with.
    pub temporality: Temporality,
    /// Start of the aggregation window.
    pub start_time: SystemTime,
    /// Time of the collection.
    pub time: SystemTime,
    /// Every live series.
    pub series: Vec<CollectedSeries>,
}

struct StoreInner {
    cache: LruCache<SeriesKey, AggregationEntry>,
    start: SystemTime,
}

/// Maps series keys to their aggregations, keeping at most `capacity` series.
///
/// Inserting a new series into a full store evicts the least recently
/// recorded one, along with everything accumulated for it.
pub struct AggregationStore {
    inner: Mutex<StoreInner>,
    factory: HistogramFactory,
    temporality: Temporality,
    expiration: Option<Duration>,
}

impl fmt::Debug for AggregationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationStore")
            .field("temporality", &self.temporality)
            .field("expiration", &self.expiration)
            .finish()
    }
}

impl AggregationStore {
    pub(crate) fn new(
        capacity: NonZeroUsize,
        factory: HistogramFactory,
        temporality: Temporality,
        expiration: Duration,
    ) -> Self {
        AggregationStore {
            inner: Mutex::new(StoreInner {
                cache: LruCache::new(capacity),
                start: SystemTime::now(),
            }),
            factory,
            temporality,
            expiration: (!expiration.is_zero()).then_some(expiration),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Counts one call of `key` and adds `sample` to its histogram.
    ///
    /// Negative and non-finite samples are dropped.
    pub fn record(&self, key: SeriesKey, sample: f64) {
        if !sample.is_finite() || sample < 0.0 {
            otel_debug!(
                name: "SpanMetricsInvalidSampleDropped",
                sample = sample
            );
            return;
        }

        let now = Instant::now();
        let mut inner = self.lock();
        if let Some(entry) = inner.cache.get_mut(&key) {
            entry.record(sample, now);
            return;
        }

        let mut entry = AggregationEntry::new(&self.factory, now);
        entry.record(sample, now);
        if inner.cache.push(key, entry).is_some() {
            otel_debug!(
                name: "SpanMetricsSeriesEvicted",
                capacity = inner.cache.cap().get()
            );
        }
    }

    /// Snapshots every live series.
    ///
    /// With [`Temporality::Delta`] each series is reset in the same pass, so a
    /// concurrent [`record`](Self::record) is reported by exactly one collect.
    pub fn collect(&self) -> Collection {
        let time = SystemTime::now();
        let now = Instant::now();
        let mut inner = self.lock();

        if let Some(expiration) = self.expiration {
            let expired: Vec<SeriesKey> = inner
                .cache
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.last_updated) > expiration)
                .map(|(key, _)| key.clone())
                .collect();
            if !expired.is_empty() {
                otel_info!(
                    name: "SpanMetricsSeriesExpired",
                    count = expired.len()
                );
            }
            for key in expired {
                inner.cache.pop(&key);
            }
        }

        let reset = self.temporality == Temporality::Delta;
        let series = inner
            .cache
            .iter_mut()
            .map(|(key, entry)| {
                let collected = CollectedSeries {
                    key: key.clone(),
                    calls: entry.calls,
                    histogram: entry.histogram.snapshot(),
                };
                if reset {
                    entry.reset();
                }
                collected
            })
            .collect();

        let start_time = if reset {
            std::mem::replace(&mut inner.start, time)
        } else {
            inner.start
        };

        Collection {
            temporality: self.temporality,
            start_time,
            time,
            series,
        }
    }

    /// Number of live series.
    pub fn len(&self) -> usize {
        self.lock().cache.len()
    }

    /// Whether no series is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of live series.
    pub fn capacity(&self) -> usize {
        self.lock().cache.cap().get()
    }
}
