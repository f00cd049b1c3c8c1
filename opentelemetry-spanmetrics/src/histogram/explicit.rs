use std::sync::Arc;

use super::{HistogramBuckets, HistogramSnapshot};

/// Summarizes samples as a histogram with explicitly defined buckets.
#[derive(Debug)]
pub(crate) struct ExplicitBuckets {
    bounds: Arc<[f64]>,
    counts: Vec<u64>,
    count: u64,
    total: f64,
    min: f64,
    max: f64,
}

impl ExplicitBuckets {
    /// Returns buckets with `bounds.len() + 1` bins.
    pub(crate) fn new(bounds: Arc<[f64]>) -> Self {
        let n = bounds.len() + 1;
        ExplicitBuckets {
            bounds,
            counts: vec![0; n],
            count: 0,
            total: 0.0,
            min: f64::MAX,
            max: f64::MIN,
        }
    }

    pub(crate) fn record(&mut self, value: f64) {
        // This search will return an index in the range `[0, bounds.len()]`, where
        // it will return `bounds.len()` if value is greater than the last element
        // of `bounds`. This aligns with the buckets in that the length of buckets
        // is `bounds.len()+1`, with the last bucket representing:
        // `(bounds[bounds.len()-1], +∞)`.
        let idx = self.bounds.partition_point(|&x| x < value);
        self.counts[idx] += 1;
        self.count += 1;
        self.total += value;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    pub(crate) fn snapshot(&self) -> HistogramSnapshot {
        let has_value = self.count > 0;
        HistogramSnapshot {
            count: self.count,
            sum: self.total,
            min: has_value.then_some(self.min),
            max: has_value.then_some(self.max),
            buckets: HistogramBuckets::Explicit {
                bounds: self.bounds.to_vec(),
                counts: self.counts.clone(),
            },
        }
    }

    pub(crate) fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.count = 0;
        self.total = 0.0;
        self.min = f64::MAX;
        self.max = f64::MIN;
    }
}
