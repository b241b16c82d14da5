//! Shared fixtures for acqsrv integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use acqsrv::error::SinkError;
use acqsrv::sink::{BatchPolicy, BatchSink, Point, TimeSeriesWriter};

/// Writer that keeps every batch in memory and can be told to fail
#[derive(Debug, Default)]
pub struct RecordingWriter {
    batches: Mutex<Vec<Vec<Point>>>,
    failing: AtomicBool,
}

impl RecordingWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<Point>> {
        self.batches.lock().clone()
    }

    pub fn points(&self) -> Vec<Point> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl TimeSeriesWriter for RecordingWriter {
    fn name(&self) -> &str {
        "recording"
    }

    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Write("store unavailable".to_string()));
        }
        self.batches.lock().push(points.to_vec());
        Ok(())
    }
}

pub fn sink_with(writer: Arc<RecordingWriter>, fast: BatchPolicy, normal: BatchPolicy) -> Arc<BatchSink> {
    Arc::new(BatchSink::new(writer, fast, normal, Duration::from_secs(1)))
}

pub fn default_sink(writer: Arc<RecordingWriter>) -> Arc<BatchSink> {
    sink_with(writer, BatchPolicy::fast(), BatchPolicy::normal())
}

/// Integer value of a point field, as rendered in line protocol (`"42i"` → 42)
pub fn int_field(point: &Point, name: &str) -> Option<i64> {
    point
        .fields
        .iter()
        .find(|(key, _)| key == name)
        .and_then(|(_, value)| value.to_string().trim_end_matches('i').parse().ok())
}

pub fn has_field(point: &Point, name: &str) -> bool {
    point.fields.iter().any(|(key, _)| key == name)
}
