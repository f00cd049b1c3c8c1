//! Periodic collection of the aggregated metrics.
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use opentelemetry::{otel_debug, otel_error, otel_info, otel_warn};

use crate::data::MetricBatch;
use crate::error::{SinkError, SinkResult};
use crate::exporter::MetricsSink;

/// How long [`FlushScheduler::force_flush`] and [`FlushScheduler::shutdown`]
/// wait for the flush thread.
const FLUSH_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

const IDLE: u8 = 0;
const FLUSHING: u8 = 1;

/// Produces the batch handed to the sink on every flush.
pub trait MetricProducer: Send + Sync + 'static {
    /// Collects the current state of the aggregation.
    fn produce(&self) -> MetricBatch;
}

/// State of a [`FlushScheduler`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlushState {
    /// Waiting for the next tick.
    Idle,
    /// Collecting or exporting.
    Flushing,
}

enum Message {
    Flush(Sender<SinkResult>),
    Shutdown(Sender<SinkResult>),
}

struct SchedulerInner<E> {
    producer: Arc<dyn MetricProducer>,
    sink: E,
    state: AtomicU8,
}

impl<E: MetricsSink> SchedulerInner<E> {
    /// Runs one `Idle -> Flushing -> Idle` cycle.
    fn flush(&self) -> SinkResult {
        if self
            .state
            .compare_exchange(IDLE, FLUSHING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            otel_debug!(name: "FlushSchedulerFlushSkipped");
            return Ok(());
        }

        let batch = self.producer.produce();
        let result = if batch.is_empty() {
            otel_debug!(name: "FlushSchedulerNoSeriesCollected");
            Ok(())
        } else {
            futures_executor::block_on(self.sink.export(&batch))
        };

        self.state.store(IDLE, Ordering::Release);
        if let Err(err) = &result {
            otel_warn!(
                name: "FlushSchedulerExportError",
                error = format!("{err:?}")
            );
        }
        result
    }

    fn state(&self) -> FlushState {
        match self.state.load(Ordering::Acquire) {
            IDLE => FlushState::Idle,
            _ => FlushState::Flushing,
        }
    }
}

/// Collects the aggregation and hands it to a [`MetricsSink`] every
/// `interval`.
///
/// Flushes run on a dedicated thread, one at a time. When a flush outlasts
/// the interval the missed ticks are dropped and the next flush happens on
/// the following interval boundary.
pub struct FlushScheduler<E> {
    inner: Arc<SchedulerInner<E>>,
    message_sender: Mutex<Option<Sender<Message>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    is_shutdown: AtomicBool,
}

impl<E> fmt::Debug for FlushScheduler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushScheduler").finish()
    }
}

impl<E: MetricsSink> FlushScheduler<E> {
    /// Starts the flush thread.
    pub fn start(producer: Arc<dyn MetricProducer>, sink: E, interval: Duration) -> Self {
        let inner = Arc::new(SchedulerInner {
            producer,
            sink,
            state: AtomicU8::new(IDLE),
        });
        let (message_sender, message_receiver) = mpsc::channel();

        let worker = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("SpanMetrics.FlushScheduler".to_string())
            .spawn(move || run(worker, message_receiver, interval));

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                otel_error!(
                    name: "FlushSchedulerThreadStartError",
                    error = format!("{e:?}")
                );
                None
            }
        };

        FlushScheduler {
            inner,
            message_sender: Mutex::new(Some(message_sender)),
            handle: Mutex::new(handle),
            is_shutdown: AtomicBool::new(false),
        }
    }

    /// Current state of the flush cycle.
    pub fn state(&self) -> FlushState {
        self.inner.state()
    }

    /// Flushes now, on the flush thread, and waits for the result.
    pub fn force_flush(&self) -> SinkResult {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(SinkError::AlreadyShutdown);
        }
        self.request(Message::Flush)
    }

    /// Flushes one last time, stops the flush thread and shuts the sink down.
    pub fn shutdown(&self) -> SinkResult {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return Err(SinkError::AlreadyShutdown);
        }

        let flushed = self.request(Message::Shutdown);
        // Dropping the sender stops a thread that missed the message.
        self.message_sender.lock()?.take();
        if let Some(handle) = self.handle.lock()?.take() {
            if handle.join().is_err() {
                otel_error!(name: "FlushSchedulerThreadPanicked");
            }
        }

        let closed = self.inner.sink.shutdown();
        flushed.and(closed)
    }

    fn request(&self, message: fn(Sender<SinkResult>) -> Message) -> SinkResult {
        let (response_tx, response_rx) = mpsc::channel();
        self.message_sender
            .lock()?
            .as_ref()
            .ok_or(SinkError::AlreadyShutdown)?
            .send(message(response_tx))
            .map_err(|e| SinkError::InternalFailure(e.to_string()))?;

        match response_rx.recv_timeout(FLUSH_RESPONSE_TIMEOUT) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(SinkError::Timeout(FLUSH_RESPONSE_TIMEOUT)),
            Err(RecvTimeoutError::Disconnected) => Err(SinkError::InternalFailure(
                "flush thread is not running".into(),
            )),
        }
    }
}

impl<E> Drop for FlushScheduler<E> {
    fn drop(&mut self) {
        // Dropping the sender lets the flush thread exit on its own.
        if let Ok(mut sender) = self.message_sender.lock() {
            sender.take();
        }
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn run<E: MetricsSink>(
    inner: Arc<SchedulerInner<E>>,
    message_receiver: Receiver<Message>,
    interval: Duration,
) {
    otel_info!(
        name: "FlushSchedulerThreadStarted",
        interval_ms = interval.as_millis() as u64
    );
    let mut next_tick = Instant::now().checked_add(interval);
    loop {
        let received = match next_tick {
            Some(deadline) => {
                message_receiver.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            // The interval is too long to be represented, only messages wake the thread.
            None => message_receiver
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(Message::Flush(response)) => {
                otel_debug!(name: "FlushSchedulerFlushRequested");
                let _ = response.send(inner.flush());
            }
            Ok(Message::Shutdown(response)) => {
                otel_debug!(name: "FlushSchedulerFlushingDueToShutdown");
                let _ = response.send(inner.flush());
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                let _ = inner.flush();
                next_tick = next_tick.and_then(|previous| {
                    next_deadline(previous, interval, Instant::now())
                });
            }
            Err(RecvTimeoutError::Disconnected) => {
                otel_debug!(name: "FlushSchedulerFinalFlush");
                let _ = inner.flush();
                break;
            }
        }
    }
    otel_info!(name: "FlushSchedulerThreadStopped");
}

/// First interval boundary after `previous` that is still ahead of `now`.
///
/// Returns `None` when the boundary cannot be represented as an `Instant`.
fn next_deadline(previous: Instant, interval: Duration, now: Instant) -> Option<Instant> {
    let next = previous.checked_add(interval)?;
    if next > now {
        return Some(next);
    }

    let interval_nanos = interval.as_nanos().max(1);
    let behind = (now - next).as_nanos();
    otel_debug!(
        name: "FlushSchedulerTicksSkipped",
        missed = u64::try_from(behind / interval_nanos + 1).unwrap_or(u64::MAX)
    );
    let until_boundary = interval_nanos - behind % interval_nanos;
    now.checked_add(Duration::from_nanos(u64::try_from(until_boundary).ok()?))
}
