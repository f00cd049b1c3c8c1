use std::f64::consts::LOG2_E;

use once_cell::sync::Lazy;
use opentelemetry::otel_warn;

use super::{HistogramBuckets, HistogramSnapshot};

/// Finest resolution, used until samples force a coarser one.
pub const EXPO_MAX_SCALE: i8 = 20;
/// Coarsest resolution.
pub const EXPO_MIN_SCALE: i8 = -10;

/// Durations of one series in base-2 exponential buckets.
///
/// Only non-negative samples are recorded, so there is no negative range.
#[derive(Debug, PartialEq)]
pub(crate) struct ExpoHistogramDataPoint {
    count: u64,
    min: f64,
    max: f64,
    sum: f64,

    max_size: i32,
    scale: i8,

    buckets: ExpoBuckets,
    zero_count: u64,
}

impl ExpoHistogramDataPoint {
    pub(crate) fn new(max_size: i32) -> Self {
        ExpoHistogramDataPoint {
            count: 0,
            min: f64::MAX,
            max: f64::MIN,
            sum: 0.0,
            max_size,
            scale: EXPO_MAX_SCALE,
            buckets: ExpoBuckets::default(),
            zero_count: 0,
        }
    }

    /// Adds a new measurement to the histogram.
    ///
    /// It will rescale the buckets if needed.
    pub(crate) fn record(&mut self, v: f64) {
        self.count += 1;
        if v < self.min {
            self.min = v;
        }
        if v > self.max {
            self.max = v;
        }
        self.sum += v;

        if v == 0.0 {
            self.zero_count += 1;
            return;
        }

        let mut bin = self.get_bin(v);

        // If the new bin would make the counts larger than `max_size`, we need to
        // downscale current measurements.
        let scale_delta = scale_change(
            self.max_size,
            bin,
            self.buckets.start_bin,
            self.buckets.counts.len() as i32,
        );
        if scale_delta > 0 {
            let mut delta = scale_delta;
            if i32::from(self.scale) - (delta as i32) < i32::from(EXPO_MIN_SCALE) {
                // Only reachable with a max size of 1. Stop at the coarsest
                // scale and let the buckets grow past the limit rather than
                // lose the sample.
                otel_warn!(
                    name: "ExpoHistogramScaleUnderflow",
                    max_size = self.max_size
                );
                delta = (self.scale - EXPO_MIN_SCALE) as u32;
            }
            self.scale -= delta as i8;
            self.buckets.downscale(delta);

            bin = self.get_bin(v);
        }

        self.buckets.record(bin)
    }

    /// the bin `v` should be recorded into.
    fn get_bin(&self, v: f64) -> i32 {
        let (frac, exp) = frexp(v);
        if self.scale <= 0 {
            // With negative scale `frac` is always 1 power of two higher than we want.
            let mut correction = 1;
            if frac == 0.5 {
                // If `v` is an exact power of two, `frac` will be `0.5` and the exp
                // will be then be two higher than we want.
                correction = 2;
            }
            return (exp - correction) >> -self.scale;
        }
        (exp << self.scale) + (frac.ln() * SCALE_FACTORS[self.scale as usize]) as i32 - 1
    }

    pub(crate) fn snapshot(&self) -> HistogramSnapshot {
        let has_value = self.count > 0;
        HistogramSnapshot {
            count: self.count,
            sum: self.sum,
            min: has_value.then_some(self.min),
            max: has_value.then_some(self.max),
            buckets: HistogramBuckets::Exponential {
                scale: self.scale,
                zero_count: self.zero_count,
                offset: self.buckets.start_bin,
                counts: self.buckets.counts.clone(),
            },
        }
    }

    /// Drops every sample and goes back to the finest scale.
    pub(crate) fn reset(&mut self) {
        *self = ExpoHistogramDataPoint::new(self.max_size);
    }
}

/// The magnitude of the scale change needed to fit bin in the bucket.
///
/// If no scale change is needed 0 is returned.
fn scale_change(max_size: i32, bin: i32, start_bin: i32, length: i32) -> u32 {
    if length == 0 {
        // No need to rescale if there are no buckets.
        return 0;
    }

    // Bins at opposite ends of the f64 range are further apart than i32 allows.
    let (mut low, mut high) = if start_bin >= bin {
        (i64::from(bin), i64::from(start_bin) + i64::from(length) - 1)
    } else {
        (i64::from(start_bin), i64::from(bin))
    };

    let mut count = 0u32;
    while high - low >= i64::from(max_size) {
        low >>= 1;
        high >>= 1;
        count += 1;

        if count > (EXPO_MAX_SCALE - EXPO_MIN_SCALE) as u32 {
            return count;
        }
    }

    count
}

/// Constants used in calculating the logarithm index.
static SCALE_FACTORS: Lazy<[f64; 21]> = Lazy::new(|| {
    let mut factors = [0f64; 21];
    for (scale, factor) in factors.iter_mut().enumerate() {
        *factor = LOG2_E * 2f64.powi(scale as i32);
    }
    factors
});

/// Breaks the number into a normalized fraction and a base-2 exponent.
///
/// This impl is necessary as rust removed this functionality from std in
/// <https://github.com/rust-lang/rust/pull/41437>
#[inline(always)]
fn frexp(x: f64) -> (f64, i32) {
    let mut y = x.to_bits();
    let ee = ((y >> 52) & 0x7ff) as i32;

    if ee == 0 {
        if x != 0.0 {
            let x1p64 = f64::from_bits(0x43f0000000000000);
            let (x, e) = frexp(x * x1p64);
            return (x, e - 64);
        }
        return (x, 0);
    } else if ee == 0x7ff {
        return (x, 0);
    }

    let e = ee - 0x3fe;
    y &= 0x800fffffffffffff;
    y |= 0x3fe0000000000000;

    (f64::from_bits(y), e)
}

/// A set of buckets in an exponential histogram.
#[derive(Default, Debug, PartialEq)]
struct ExpoBuckets {
    start_bin: i32,
    counts: Vec<u64>,
}

impl ExpoBuckets {
    /// Increments the count for the given bin, and expands the buckets if needed.
    ///
    /// Size changes must be done before calling this function.
    fn record(&mut self, bin: i32) {
        if self.counts.is_empty() {
            self.counts = vec![1];
            self.start_bin = bin;
            return;
        }

        let end_bin = self.start_bin + self.counts.len() as i32 - 1;

        // if the new bin is inside the current range
        if bin >= self.start_bin && bin <= end_bin {
            self.counts[(bin - self.start_bin) as usize] += 1;
            return;
        }

        // if the new bin is before the current start, prepend the slots in `self.counts`
        if bin < self.start_bin {
            let mut zeroes = vec![0; (end_bin - bin + 1) as usize];
            let shift = (self.start_bin - bin) as usize;
            zeroes[shift..].copy_from_slice(&self.counts);
            self.counts = zeroes;
            self.counts[0] = 1;
            self.start_bin = bin;
        } else if bin > end_bin {
            // if the new bin is after the end, initialize the slots up to the new bin
            self.counts.resize((bin - self.start_bin + 1) as usize, 0);
            self.counts[(bin - self.start_bin) as usize] = 1;
        }
    }

    /// Shrinks a bucket by a factor of 2*s.
    ///
    /// It will sum counts into the correct lower resolution bucket.
    fn downscale(&mut self, delta: u32) {
        // Example
        // delta = 2
        // original offset: -6
        // counts: [ 3,  1,  2,  3,  4,  5, 6, 7, 8, 9, 10]
        // bins:    -6  -5, -4, -3, -2, -1, 0, 1, 2, 3, 4
        // new bins:-2, -2, -1, -1, -1, -1, 0, 0, 0, 0, 1
        // new offset: -2
        // new counts: [4, 14, 30, 10]

        if self.counts.len() <= 1 || delta < 1 {
            self.start_bin >>= delta;
            return;
        }

        let steps = 1 << delta;
        let mut offset = self.start_bin % steps;
        offset = (offset + steps) % steps; // to make offset positive
        for i in 1..self.counts.len() {
            let idx = i + offset as usize;
            if idx % steps as usize == 0 {
                self.counts[idx / steps as usize] = self.counts[i];
                continue;
            }
            self.counts[idx / steps as usize] += self.counts[i];
        }

        let last_idx = (self.counts.len() as i32 - 1 + offset) / steps;
        self.counts.truncate(last_idx as usize + 1);
        self.start_bin >>= delta;
    }
}
