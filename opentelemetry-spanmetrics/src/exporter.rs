//! Interfaces for handing metric batches downstream.
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::data::MetricBatch;
use crate::error::{SinkError, SinkResult};

/// Receives the batches produced by every flush.
///
/// This is the boundary with the downstream metrics pipeline.
pub trait MetricsSink: Send + Sync + 'static {
    /// Delivers one batch.
    ///
    /// All retry logic must be contained in this function. Errors are logged
    /// by the flush scheduler and the batch is not offered again.
    fn export(&self, batch: &MetricBatch) -> impl Future<Output = SinkResult> + Send;

    /// Releases any held resources. Called once, after the final flush.
    fn shutdown(&self) -> SinkResult {
        Ok(())
    }
}

/// A sink keeping every batch in memory.
///
/// This sink is useful for testing and debugging purposes.
///
/// # Example
///
/// ```
/// use opentelemetry_spanmetrics::{Config, InMemoryMetricsSink, SpanMetricsConnector};
///
/// let sink = InMemoryMetricsSink::default();
/// let connector = SpanMetricsConnector::new(Config::default(), sink.clone()).unwrap();
///
/// // feed spans with `connector.consume_spans(..)`
///
/// connector.force_flush().unwrap();
/// let batches = sink.get_finished_batches().unwrap();
/// # drop(batches);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryMetricsSink {
    batches: Arc<Mutex<VecDeque<MetricBatch>>>,
    is_shutdown: Arc<Mutex<bool>>,
}

impl fmt::Debug for InMemoryMetricsSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryMetricsSink").finish()
    }
}

impl InMemoryMetricsSink {
    /// Returns the batches received so far, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a `SinkError` if the internal lock cannot be acquired.
    pub fn get_finished_batches(&self) -> Result<Vec<MetricBatch>, SinkError> {
        Ok(self.batches.lock()?.iter().cloned().collect())
    }

    /// Forgets every received batch.
    pub fn reset(&self) {
        let _ = self.batches.lock().map(|mut batches| batches.clear());
    }

    /// Whether [`MetricsSink::shutdown`] was called.
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.lock().map(|s| *s).unwrap_or(true)
    }
}

impl MetricsSink for InMemoryMetricsSink {
    async fn export(&self, batch: &MetricBatch) -> SinkResult {
        if self.is_shutdown() {
            return Err(SinkError::AlreadyShutdown);
        }
        self.batches.lock()?.push_back(batch.clone());
        Ok(())
    }

    fn shutdown(&self) -> SinkResult {
        *self.is_shutdown.lock()? = true;
        Ok(())
    }
}
