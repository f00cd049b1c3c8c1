//! Configuration of the span metrics connector.
//!
//! [`Config::default`] produces a valid configuration. The flush interval and
//! the cache size can be overridden with the following environment variables:
//!
//! * `OTEL_SPANMETRICS_FLUSH_INTERVAL`, in milliseconds
//! * `OTEL_SPANMETRICS_CACHE_SIZE`
//!
//! Values set through the `with_*` methods take precedence over the
//! environment.
use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::dimensions::RESERVED_DIMENSIONS;
use crate::error::{ConfigError, ConfigViolation};

/// Environment variable overriding the default flush interval, in milliseconds.
pub(crate) const OTEL_SPANMETRICS_FLUSH_INTERVAL: &str = "OTEL_SPANMETRICS_FLUSH_INTERVAL";
/// Default interval between two consecutive flushes.
pub(crate) const OTEL_SPANMETRICS_FLUSH_INTERVAL_DEFAULT: u64 = 15_000;
/// Environment variable overriding the default series cache capacity.
pub(crate) const OTEL_SPANMETRICS_CACHE_SIZE: &str = "OTEL_SPANMETRICS_CACHE_SIZE";
/// Default number of series kept in the cache.
pub(crate) const OTEL_SPANMETRICS_CACHE_SIZE_DEFAULT: usize = 1000;
/// Default prefix of the emitted metric names.
pub(crate) const DEFAULT_NAMESPACE: &str = "traces.span.metrics";
/// Default bucket count of exponential histograms.
pub const DEFAULT_EXPONENTIAL_MAX_SIZE: u32 = 160;

const DEFAULT_EXPLICIT_BUCKETS_MS: [u64; 16] = [
    2, 4, 6, 8, 10, 50, 100, 200, 400, 800, 1000, 1400, 2000, 5000, 10_000, 15_000,
];

/// Defines whether emitted values accumulate or reset every flush.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Temporality {
    /// Values accumulate for as long as the aggregation runs.
    #[default]
    Cumulative,

    /// Values are reset after every flush.
    Delta,
}

/// An additional attribute turned into a metric dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct Dimension {
    /// Attribute name, looked up on the span first and then on the resource.
    pub name: String,
    /// Value used when neither the span nor the resource carries the attribute.
    #[cfg_attr(feature = "serde", serde(default))]
    pub default: Option<String>,
}

impl Dimension {
    /// A dimension without default value.
    pub fn new(name: impl Into<String>) -> Self {
        Dimension {
            name: name.into(),
            default: None,
        }
    }

    /// Sets the value used when the attribute is missing.
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Histogram with fixed bucket boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct ExplicitHistogramConfig {
    /// Upper bounds of the buckets, ascending. An overflow bucket is implied.
    pub buckets: Vec<Duration>,
}

impl Default for ExplicitHistogramConfig {
    fn default() -> Self {
        ExplicitHistogramConfig {
            buckets: DEFAULT_EXPLICIT_BUCKETS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

/// Histogram with base-2 exponential buckets and an adaptive scale.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct ExponentialHistogramConfig {
    /// Maximum number of populated buckets.
    pub max_size: u32,
}

impl Default for ExponentialHistogramConfig {
    fn default() -> Self {
        ExponentialHistogramConfig {
            max_size: DEFAULT_EXPONENTIAL_MAX_SIZE,
        }
    }
}

/// Duration histogram settings. Exactly one of `explicit` and `exponential`
/// must be set.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct HistogramConfig {
    /// Unit of the recorded durations, `ms` or `s`.
    #[cfg_attr(feature = "serde", serde(default = "default_unit"))]
    pub unit: String,
    /// Fixed-boundary buckets.
    #[cfg_attr(feature = "serde", serde(default))]
    pub explicit: Option<ExplicitHistogramConfig>,
    /// Exponential buckets.
    #[cfg_attr(feature = "serde", serde(default))]
    pub exponential: Option<ExponentialHistogramConfig>,
}

fn default_unit() -> String {
    HistogramUnit::Milliseconds.as_str().to_string()
}

impl Default for HistogramConfig {
    fn default() -> Self {
        HistogramConfig {
            unit: default_unit(),
            explicit: Some(ExplicitHistogramConfig::default()),
            exponential: None,
        }
    }
}

/// Unit durations are expressed in once recorded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum HistogramUnit {
    /// Milliseconds, `ms`.
    #[default]
    Milliseconds,
    /// Seconds, `s`.
    Seconds,
}

impl HistogramUnit {
    /// The UCUM representation of the unit.
    pub fn as_str(&self) -> &'static str {
        match self {
            HistogramUnit::Milliseconds => "ms",
            HistogramUnit::Seconds => "s",
        }
    }

    /// Expresses `duration` in this unit.
    pub fn convert(&self, duration: Duration) -> f64 {
        match self {
            HistogramUnit::Milliseconds => duration.as_nanos() as f64 / 1e6,
            HistogramUnit::Seconds => duration.as_nanos() as f64 / 1e9,
        }
    }
}

impl FromStr for HistogramUnit {
    type Err = ConfigViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ms" => Ok(HistogramUnit::Milliseconds),
            "s" => Ok(HistogramUnit::Seconds),
            other => Err(ConfigViolation::InvalidUnit(other.to_string())),
        }
    }
}

/// Validated histogram strategy, selected once when the connector is built.
#[derive(Debug, Clone, PartialEq)]
pub enum HistogramSettings {
    /// Fixed bucket boundaries, already converted to `unit`.
    Explicit {
        /// Ascending upper bounds.
        bounds: Vec<f64>,
        /// Unit of the bounds and of recorded samples.
        unit: HistogramUnit,
    },
    /// Adaptive exponential buckets.
    Exponential {
        /// Maximum number of populated buckets.
        max_size: u32,
        /// Unit of recorded samples.
        unit: HistogramUnit,
    },
}

impl HistogramSettings {
    /// Unit of recorded samples.
    pub fn unit(&self) -> HistogramUnit {
        match self {
            HistogramSettings::Explicit { unit, .. } => *unit,
            HistogramSettings::Exponential { unit, .. } => *unit,
        }
    }
}

/// Configuration of the span metrics connector.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Whether emitted values accumulate or reset on every flush.
    pub aggregation_temporality: Temporality,
    /// Dimensions added after the reserved ones, in declaration order.
    pub dimensions: Vec<Dimension>,
    /// Maximum number of series kept; least recently used ones are evicted.
    pub dimensions_cache_size: usize,
    /// Interval between two flushes.
    pub metrics_flush_interval: Duration,
    /// Series not updated for this long are dropped on flush. Zero disables
    /// expiration.
    pub metrics_expiration: Duration,
    /// Duration histogram settings.
    pub histogram: HistogramConfig,
    /// Prefix of the emitted metric names.
    pub namespace: String,
}

impl Default for Config {
    /// Default configuration, with the flush interval and the cache size taken
    /// from `OTEL_SPANMETRICS_FLUSH_INTERVAL` and `OTEL_SPANMETRICS_CACHE_SIZE`
    /// when they hold valid values.
    fn default() -> Self {
        let metrics_flush_interval = env::var(OTEL_SPANMETRICS_FLUSH_INTERVAL)
            .ok()
            .and_then(|interval| u64::from_str(&interval).ok())
            .unwrap_or(OTEL_SPANMETRICS_FLUSH_INTERVAL_DEFAULT);
        let dimensions_cache_size = env::var(OTEL_SPANMETRICS_CACHE_SIZE)
            .ok()
            .and_then(|size| usize::from_str(&size).ok())
            .unwrap_or(OTEL_SPANMETRICS_CACHE_SIZE_DEFAULT);

        Config {
            aggregation_temporality: Temporality::default(),
            dimensions: Vec::new(),
            dimensions_cache_size,
            metrics_flush_interval: Duration::from_millis(metrics_flush_interval),
            metrics_expiration: Duration::ZERO,
            histogram: HistogramConfig::default(),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl Config {
    /// Sets the aggregation temporality.
    pub fn with_temporality(mut self, temporality: Temporality) -> Self {
        self.aggregation_temporality = temporality;
        self
    }

    /// Appends an additional dimension.
    pub fn with_dimension(mut self, dimension: Dimension) -> Self {
        self.dimensions.push(dimension);
        self
    }

    /// Sets the maximum number of series kept in memory.
    pub fn with_dimensions_cache_size(mut self, size: usize) -> Self {
        self.dimensions_cache_size = size;
        self
    }

    /// Sets the interval between two flushes.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.metrics_flush_interval = interval;
        self
    }

    /// Drops series that were not updated for `expiration`.
    pub fn with_metrics_expiration(mut self, expiration: Duration) -> Self {
        self.metrics_expiration = expiration;
        self
    }

    /// Replaces the histogram settings.
    pub fn with_histogram(mut self, histogram: HistogramConfig) -> Self {
        self.histogram = histogram;
        self
    }

    /// Uses fixed buckets with the given upper bounds.
    pub fn with_explicit_buckets(mut self, buckets: Vec<Duration>) -> Self {
        self.histogram.explicit = Some(ExplicitHistogramConfig { buckets });
        self.histogram.exponential = None;
        self
    }

    /// Uses exponential buckets holding at most `max_size` buckets.
    pub fn with_exponential_buckets(mut self, max_size: u32) -> Self {
        self.histogram.exponential = Some(ExponentialHistogramConfig { max_size });
        self.histogram.explicit = None;
        self
    }

    /// Sets the histogram unit, `ms` or `s`.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.histogram.unit = unit.into();
        self
    }

    /// Sets the prefix of the emitted metric names.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Checks every rule and reports all violations at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::from_violations(self.violations())
    }

    /// Validates the configuration and resolves the histogram strategy.
    pub fn histogram_settings(&self) -> Result<HistogramSettings, ConfigError> {
        self.validate()?;

        // The unit is known to parse once validation succeeded.
        let unit = HistogramUnit::from_str(&self.histogram.unit).unwrap_or_default();
        match (&self.histogram.explicit, &self.histogram.exponential) {
            (Some(explicit), None) => Ok(HistogramSettings::Explicit {
                bounds: explicit.buckets.iter().map(|b| unit.convert(*b)).collect(),
                unit,
            }),
            (None, Some(exponential)) => Ok(HistogramSettings::Exponential {
                max_size: exponential.max_size,
                unit,
            }),
            _ => Err(ConfigViolation::HistogramMode.into()),
        }
    }

    fn violations(&self) -> Vec<ConfigViolation> {
        let mut violations = Vec::new();

        match (&self.histogram.explicit, &self.histogram.exponential) {
            (Some(explicit), None) => {
                let ascending = explicit.buckets.windows(2).all(|w| w[0] < w[1]);
                let positive = explicit.buckets.iter().all(|b| !b.is_zero());
                if !ascending || !positive {
                    violations.push(ConfigViolation::InvalidBoundaries);
                }
            }
            (None, Some(exponential)) => {
                if exponential.max_size == 0 {
                    violations.push(ConfigViolation::InvalidMaxSize);
                }
            }
            _ => violations.push(ConfigViolation::HistogramMode),
        }

        if let Err(violation) = HistogramUnit::from_str(&self.histogram.unit) {
            violations.push(violation);
        }

        if let Err(violation) = validate_dimensions(&self.dimensions) {
            violations.push(violation);
        }

        if self.dimensions_cache_size == 0 {
            violations.push(ConfigViolation::InvalidCacheSize(
                self.dimensions_cache_size,
            ));
        }

        if self.metrics_flush_interval.is_zero() {
            violations.push(ConfigViolation::InvalidFlushInterval(
                self.metrics_flush_interval,
            ));
        }

        violations
    }
}

/// Checks that no dimension reuses a reserved name or the name of an earlier
/// dimension. The first offending name is reported.
pub fn validate_dimensions(dimensions: &[Dimension]) -> Result<(), ConfigViolation> {
    let mut seen: HashSet<&str> = RESERVED_DIMENSIONS.iter().copied().collect();
    for dimension in dimensions {
        if !seen.insert(dimension.name.as_str()) {
            return Err(ConfigViolation::DuplicateDimension(dimension.name.clone()));
        }
    }
    Ok(())
}
