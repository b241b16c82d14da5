//! Batch Sink
//!
//! Accumulates converted samples per rate class and flushes them to the
//! time-series store in bulk, on whichever comes first:
//!
//! - the buffer reaching `max_entries`
//! - `max_age` elapsed since the last flush
//!
//! Pushes pass the batch gate first: while the gate is closed (no active
//! smelting batch) samples are counted as gated and discarded, otherwise
//! they are tagged with the batch code.
//!
//! A flush takes the whole buffer under its lock and leaves an empty one
//! behind, so pushes racing a flush land in the new buffer. A failed batch is
//! put back ahead of newer entries and retried on the next time trigger; the
//! buffer stays bounded by dropping (and counting) its oldest entries.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::log_classified;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{BatchTracker, BATCH_TAG};
use crate::error::SinkError;
pub use crate::schema::RateClass;

pub mod buffer;
pub mod influx;

pub use buffer::BatchBuffer;
pub use influx::{FieldValue, InfluxWriter, LineProtocolBuilder};

// ============================================================================
// Points and samples
// ============================================================================

/// One time-series point
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: Vec::new(),
            timestamp,
        }
    }

    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    pub fn to_line_protocol(&self) -> String {
        let mut builder = LineProtocolBuilder::new(&self.measurement);
        for (key, value) in &self.tags {
            builder = builder.tag(key, value);
        }
        for (key, value) in &self.fields {
            builder = builder.field(key, value.clone());
        }
        if let Some(ns) = self.timestamp.timestamp_nanos_opt() {
            builder = builder.timestamp(ns);
        }
        builder.build()
    }
}

/// Buffered unit: a point plus the block it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub block: String,
    pub point: Point,
}

impl Sample {
    pub fn new(block: impl Into<String>, point: Point) -> Self {
        Self {
            block: block.into(),
            point,
        }
    }
}

/// Destination of flushed batches
#[async_trait]
pub trait TimeSeriesWriter: Send + Sync {
    fn name(&self) -> &str;

    /// Write one batch; all-or-nothing from the caller's point of view
    async fn write(&self, points: &[Point]) -> Result<(), SinkError>;
}

/// Writer used when no store is configured: logs and discards
#[derive(Debug, Default)]
pub struct LogWriter;

#[async_trait]
impl TimeSeriesWriter for LogWriter {
    fn name(&self) -> &str {
        "log"
    }

    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        for point in points {
            debug!("{}", point.to_line_protocol());
        }
        Ok(())
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
pub struct BatchStats {
    pub pushed: AtomicU64,
    pub written: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_errors: AtomicU64,
    pub requeued: AtomicU64,
    pub dropped: AtomicU64,
    /// Discarded because no batch was active
    pub gated: AtomicU64,
}

impl BatchStats {
    pub fn snapshot(&self) -> BatchStatsSnapshot {
        BatchStatsSnapshot {
            pushed: self.pushed.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_errors: self.flush_errors.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            gated: self.gated.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BatchStatsSnapshot {
    pub pushed: u64,
    pub written: u64,
    pub flushes: u64,
    pub flush_errors: u64,
    pub requeued: u64,
    pub dropped: u64,
    pub gated: u64,
}

// ============================================================================
// Sink
// ============================================================================

/// Flush thresholds of one rate class
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub max_entries: usize,
    pub max_age: Duration,
    /// Hard bound on buffered samples
    pub capacity: usize,
}

impl BatchPolicy {
    pub fn fast() -> Self {
        Self {
            max_entries: 10,
            max_age: Duration::from_secs(2),
            capacity: 1000,
        }
    }

    pub fn normal() -> Self {
        Self {
            max_entries: 5,
            max_age: Duration::from_secs(10),
            capacity: 500,
        }
    }
}

struct RateBuffer {
    rate: RateClass,
    policy: BatchPolicy,
    buffer: Mutex<BatchBuffer>,
    last_flush: Mutex<Instant>,
    /// Serializes flushes so a requeue never reorders batches
    flushing: tokio::sync::Mutex<()>,
    notify: Notify,
    stats: BatchStats,
}

impl RateBuffer {
    fn new(rate: RateClass, policy: BatchPolicy) -> Self {
        Self {
            rate,
            buffer: Mutex::new(BatchBuffer::new(policy.capacity)),
            policy,
            last_flush: Mutex::new(Instant::now()),
            flushing: tokio::sync::Mutex::new(()),
            notify: Notify::new(),
            stats: BatchStats::default(),
        }
    }
}

/// Per-rate batching in front of a [`TimeSeriesWriter`]
pub struct BatchSink {
    fast: RateBuffer,
    normal: RateBuffer,
    writer: Arc<dyn TimeSeriesWriter>,
    write_timeout: Duration,
    batches: BatchTracker,
}

impl std::fmt::Debug for BatchSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSink")
            .field("writer", &self.writer.name())
            .field("fast", &self.fast.policy)
            .field("normal", &self.normal.policy)
            .finish()
    }
}

impl BatchSink {
    pub fn new(
        writer: Arc<dyn TimeSeriesWriter>,
        fast: BatchPolicy,
        normal: BatchPolicy,
        write_timeout: Duration,
    ) -> Self {
        Self {
            fast: RateBuffer::new(RateClass::Fast, fast),
            normal: RateBuffer::new(RateClass::Normal, normal),
            writer,
            write_timeout,
            batches: BatchTracker::ungated(),
        }
    }

    /// Gate pushes on the smelting batch context
    #[must_use]
    pub fn with_batches(mut self, batches: BatchTracker) -> Self {
        self.batches = batches;
        self
    }

    pub fn batches(&self) -> &BatchTracker {
        &self.batches
    }

    fn rate(&self, rate: RateClass) -> &RateBuffer {
        match rate {
            RateClass::Fast => &self.fast,
            RateClass::Normal => &self.normal,
        }
    }

    pub fn policy(&self, rate: RateClass) -> &BatchPolicy {
        &self.rate(rate).policy
    }

    pub fn stats(&self, rate: RateClass) -> BatchStatsSnapshot {
        self.rate(rate).stats.snapshot()
    }

    pub fn pending(&self, rate: RateClass) -> usize {
        self.rate(rate).buffer.lock().len()
    }

    /// Append a sample; wakes the flusher when the count trigger is reached
    ///
    /// Returns `false` when the batch gate discarded the sample.
    pub fn push(&self, rate: RateClass, mut sample: Sample) -> bool {
        let rb = self.rate(rate);
        match self.batches.current() {
            Some(batch) => {
                sample.point.tags.insert(BATCH_TAG.to_string(), batch.batch_code);
            }
            None if self.batches.is_gated() => {
                rb.stats.gated.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            None => {}
        }

        let (len, dropped) = {
            let mut buffer = rb.buffer.lock();
            let dropped = buffer.push(sample);
            (buffer.len(), dropped)
        };

        rb.stats.pushed.fetch_add(1, Ordering::Relaxed);
        if dropped > 0 {
            rb.stats
                .dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
            warn!(
                "{} buffer at capacity {}, dropped {} oldest samples",
                rate, rb.policy.capacity, dropped
            );
        }
        if len >= rb.policy.max_entries {
            rb.notify.notify_one();
        }
        true
    }

    /// Write out everything buffered for `rate`
    ///
    /// Returns the number of samples written. On failure the batch is put
    /// back at the head of the buffer.
    pub async fn flush(&self, rate: RateClass) -> Result<usize, SinkError> {
        let rb = self.rate(rate);
        let _flushing = rb.flushing.lock().await;

        let batch = rb.buffer.lock().take();
        *rb.last_flush.lock() = Instant::now();
        if batch.is_empty() {
            return Ok(0);
        }

        let points: Vec<Point> = batch.iter().map(|s| s.point.clone()).collect();
        let result = timeout(self.write_timeout, self.writer.write(&points))
            .await
            .unwrap_or(Err(SinkError::Timeout(self.write_timeout)));

        match result {
            Ok(()) => {
                rb.stats.flushes.fetch_add(1, Ordering::Relaxed);
                rb.stats
                    .written
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                debug!(
                    "Flushed {} {} samples to {}",
                    batch.len(),
                    rate,
                    self.writer.name()
                );
                Ok(batch.len())
            }
            Err(e) => {
                let count = batch.len() as u64;
                let dropped = rb.buffer.lock().requeue(batch);
                rb.stats.flush_errors.fetch_add(1, Ordering::Relaxed);
                rb.stats.requeued.fetch_add(count, Ordering::Relaxed);
                if dropped > 0 {
                    rb.stats
                        .dropped
                        .fetch_add(dropped as u64, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    /// Best-effort flush of both rate classes
    pub async fn flush_all(&self) {
        for rate in RateClass::ALL {
            match self.flush(rate).await {
                Ok(0) => {}
                Ok(n) => info!("Final flush wrote {} {} samples", n, rate),
                Err(e) => {
                    let pending = self.pending(rate);
                    warn!(
                        "Final flush of {} samples failed, {} samples not persisted: {}",
                        rate, pending, e
                    );
                }
            }
        }
    }

    /// Flush loop of one rate class; runs until cancelled
    ///
    /// While the writer is failing, count triggers are ignored and retries
    /// only happen on the time trigger.
    pub async fn run_flusher(self: Arc<Self>, rate: RateClass, cancel: CancellationToken) {
        let rb = self.rate(rate);
        let mut failing = false;
        debug!("{} flusher started ({:?})", rb.rate, rb.policy);

        loop {
            let deadline = *rb.last_flush.lock() + rb.policy.max_age;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep_until(deadline) => {}
                _ = rb.notify.notified(), if !failing => {}
            }

            match self.flush(rate).await {
                Ok(written) => {
                    if failing {
                        info!("{} flush recovered, wrote {} samples", rate, written);
                    }
                    failing = false;
                }
                Err(e) => {
                    if !failing {
                        log_classified(&e, &format!("{rate} flush failed, batch kept for retry"));
                    } else {
                        debug!("{} flush still failing: {}", rate, e);
                    }
                    failing = true;
                }
            }
        }

        debug!("{} flusher stopped", rate);
    }
}
