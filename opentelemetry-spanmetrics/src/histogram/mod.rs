//! Duration histograms.
//!
//! The strategy is picked once from [`HistogramSettings`] and every series of
//! a store uses the same one.
mod explicit;
mod exponential;

use std::sync::Arc;

pub(crate) use explicit::ExplicitBuckets;
pub use exponential::{EXPO_MAX_SCALE, EXPO_MIN_SCALE};
pub(crate) use exponential::ExpoHistogramDataPoint;

use crate::config::HistogramSettings;

/// Point-in-time content of a histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    /// Number of samples.
    pub count: u64,
    /// Sum of the samples.
    pub sum: f64,
    /// Smallest sample, if any.
    pub min: Option<f64>,
    /// Largest sample, if any.
    pub max: Option<f64>,
    /// Bucket layout and counts.
    pub buckets: HistogramBuckets,
}

/// Bucket counts of a [`HistogramSnapshot`].
#[derive(Debug, Clone, PartialEq)]
pub enum HistogramBuckets {
    /// Fixed buckets.
    Explicit {
        /// Upper bounds. `counts` has one more element, the overflow bucket.
        bounds: Vec<f64>,
        /// Sample count per bucket.
        counts: Vec<u64>,
    },
    /// Base-2 exponential buckets.
    Exponential {
        /// Resolution, bucket `i` covers `(2^(i/2^scale), 2^((i+1)/2^scale)]`.
        scale: i8,
        /// Samples equal to zero.
        zero_count: u64,
        /// Index of the first bucket in `counts`.
        offset: i32,
        /// Sample count per bucket, starting at `offset`.
        counts: Vec<u64>,
    },
}

impl HistogramBuckets {
    /// Sum of every bucket, including the zero bucket.
    pub fn total(&self) -> u64 {
        match self {
            HistogramBuckets::Explicit { counts, .. } => counts.iter().sum(),
            HistogramBuckets::Exponential {
                zero_count, counts, ..
            } => zero_count + counts.iter().sum::<u64>(),
        }
    }
}

/// Accumulates duration samples of one series.
#[derive(Debug)]
pub(crate) enum HistogramAccumulator {
    Explicit(ExplicitBuckets),
    Exponential(ExpoHistogramDataPoint),
}

impl HistogramAccumulator {
    pub(crate) fn new(factory: &HistogramFactory) -> Self {
        match factory {
            HistogramFactory::Explicit(bounds) => {
                HistogramAccumulator::Explicit(ExplicitBuckets::new(Arc::clone(bounds)))
            }
            HistogramFactory::Exponential(max_size) => {
                HistogramAccumulator::Exponential(ExpoHistogramDataPoint::new(*max_size))
            }
        }
    }

    /// Adds a non-negative finite sample.
    pub(crate) fn add(&mut self, value: f64) {
        match self {
            HistogramAccumulator::Explicit(h) => h.record(value),
            HistogramAccumulator::Exponential(h) => h.record(value),
        }
    }

    pub(crate) fn snapshot(&self) -> HistogramSnapshot {
        match self {
            HistogramAccumulator::Explicit(h) => h.snapshot(),
            HistogramAccumulator::Exponential(h) => h.snapshot(),
        }
    }

    pub(crate) fn reset(&mut self) {
        match self {
            HistogramAccumulator::Explicit(h) => h.reset(),
            HistogramAccumulator::Exponential(h) => h.reset(),
        }
    }
}

/// Creates empty accumulators for new series.
#[derive(Debug, Clone)]
pub(crate) enum HistogramFactory {
    Explicit(Arc<[f64]>),
    Exponential(i32),
}

impl From<&HistogramSettings> for HistogramFactory {
    fn from(settings: &HistogramSettings) -> Self {
        match settings {
            HistogramSettings::Explicit { bounds, .. } => {
                HistogramFactory::Explicit(bounds.as_slice().into())
            }
            HistogramSettings::Exponential { max_size, .. } => {
                HistogramFactory::Exponential(i32::try_from(*max_size).unwrap_or(i32::MAX))
            }
        }
    }
}
