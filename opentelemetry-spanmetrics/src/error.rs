use std::fmt;
use std::sync::PoisonError;
use std::time::Duration;

use thiserror::Error;

/// A single rule broken by a [`Config`](crate::Config).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigViolation {
    /// Neither or both of the explicit and exponential histogram settings were
    /// provided.
    #[error("use either explicit or exponential buckets histogram")]
    HistogramMode,
    /// The histogram unit is not one of the recognized duration units.
    #[error("allowed units are 'ms' and 's', got: '{0}'")]
    InvalidUnit(String),
    /// Two dimensions, reserved or configured, share a name.
    #[error("duplicate dimension name {0}")]
    DuplicateDimension(String),
    /// The series cache cannot hold a single entry.
    #[error(
        "invalid cache size: {0}, the maximum number of the items in the cache should be positive"
    )]
    InvalidCacheSize(usize),
    /// Metrics would never be flushed.
    #[error("invalid metrics flush interval: {0:?}, the interval must be positive")]
    InvalidFlushInterval(Duration),
    /// Explicit bucket boundaries must be usable as upper bounds.
    #[error("explicit histogram boundaries must be positive and strictly ascending")]
    InvalidBoundaries,
    /// The exponential histogram must be allowed at least one bucket.
    #[error("exponential histogram max size must be positive")]
    InvalidMaxSize,
}

/// Every rule a configuration violates, reported together.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    violations: Vec<ConfigViolation>,
}

impl ConfigError {
    pub(crate) fn from_violations(violations: Vec<ConfigViolation>) -> Result<(), Self> {
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { violations })
        }
    }

    /// The violated rules, in the order they were checked.
    pub fn violations(&self) -> &[ConfigViolation] {
        &self.violations
    }
}

impl From<ConfigViolation> for ConfigError {
    fn from(violation: ConfigViolation) -> Self {
        ConfigError {
            violations: vec![violation],
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.violations.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

/// A specialized `Result` type for [`MetricsSink`](crate::MetricsSink) operations.
pub type SinkResult = Result<(), SinkError>;

/// Errors returned by a metrics sink or by the flush machinery feeding it.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SinkError {
    /// Shutdown has already been invoked.
    #[error("Shutdown already invoked")]
    AlreadyShutdown,

    /// The operation did not complete within its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The sink or the flush thread failed internally.
    #[error("Operation failed: {0}")]
    InternalFailure(String),
}

impl<T> From<PoisonError<T>> for SinkError {
    fn from(err: PoisonError<T>) -> Self {
        SinkError::InternalFailure(err.to_string())
    }
}
