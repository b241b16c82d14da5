//! Smelting batch context
//!
//! ```text
//!          start(code)            pause
//!   Idle ──────────────▶ Running ──────▶ Paused
//!    ▲                      │  ◀──────────  │
//!    │         stop         │    resume     │ stop
//!    └──────────────────────┴───────────────┘
//! ```
//!
//! With the gate enabled, points reach the time-series store only while a
//! batch is running or paused; without it every point is persisted. Either
//! way an active batch code is attached to each point as the `batch_code`
//! tag. The context is published on a `watch` channel so the scheduler can
//! follow batch start and stop with the fast loop period.
//!
//! A configured state file is rewritten on every transition. An interrupted
//! batch (running or paused when the process died) resumes as running on the
//! next start, so a power cut does not end the batch.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::BatchError;

/// Tag carrying the active batch code on persisted points
pub const BATCH_TAG: &str = "batch_code";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmeltingState {
    Idle,
    Running,
    Paused,
}

impl SmeltingState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
        }
    }
}

impl fmt::Display for SmeltingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The batch in progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchContext {
    pub batch_code: String,
    /// `Running` or `Paused`
    pub state: SmeltingState,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedState {
    batch: Option<BatchContext>,
    last_batch_code: Option<String>,
    saved_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
    gated: bool,
    state_file: Option<PathBuf>,
    current: watch::Sender<Option<BatchContext>>,
    /// Serializes transitions; holds the code of the last finished batch
    last_code: Mutex<Option<String>>,
}

/// Shared handle to the batch context
#[derive(Debug, Clone)]
pub struct BatchTracker {
    inner: Arc<Inner>,
}

impl Default for BatchTracker {
    fn default() -> Self {
        Self::ungated()
    }
}

impl BatchTracker {
    /// Persist every point; tag with the batch code when one is active
    pub fn ungated() -> Self {
        Self::build(false, None, None, None)
    }

    /// Persist only while a batch is active, restoring from `state_file`
    pub fn gated(state_file: Option<PathBuf>) -> Self {
        let (batch, last_code) = match &state_file {
            Some(path) => restore(path),
            None => (None, None),
        };
        Self::build(true, state_file, batch, last_code)
    }

    fn build(
        gated: bool,
        state_file: Option<PathBuf>,
        batch: Option<BatchContext>,
        last_code: Option<String>,
    ) -> Self {
        let (current, _) = watch::channel(batch);
        Self {
            inner: Arc::new(Inner {
                gated,
                state_file,
                current,
                last_code: Mutex::new(last_code),
            }),
        }
    }

    pub fn is_gated(&self) -> bool {
        self.inner.gated
    }

    pub fn current(&self) -> Option<BatchContext> {
        self.inner.current.borrow().clone()
    }

    pub fn state(&self) -> SmeltingState {
        self.inner
            .current
            .borrow()
            .as_ref()
            .map_or(SmeltingState::Idle, |batch| batch.state)
    }

    /// Code of the most recently stopped batch
    pub fn last_batch_code(&self) -> Option<String> {
        self.inner.last_code.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<BatchContext>> {
        self.inner.current.subscribe()
    }

    /// Whether a point produced now may be persisted
    pub fn admits(&self) -> bool {
        !self.inner.gated || self.inner.current.borrow().is_some()
    }

    pub fn start(&self, batch_code: &str) -> Result<BatchContext, BatchError> {
        let code = batch_code.trim();
        if code.is_empty() {
            return Err(BatchError::EmptyCode);
        }
        let last_code = self.inner.last_code.lock();
        let state = self.state();
        if state != SmeltingState::Idle {
            return Err(BatchError::InvalidTransition {
                action: "start",
                state,
            });
        }

        let batch = BatchContext {
            batch_code: code.to_string(),
            state: SmeltingState::Running,
            started_at: Utc::now(),
        };
        if last_code.as_deref() == Some(code) {
            info!("Batch {} continued", code);
        } else {
            info!("Batch {} started", code);
        }
        self.inner.current.send_replace(Some(batch.clone()));
        self.save(last_code.as_deref());
        Ok(batch)
    }

    pub fn pause(&self) -> Result<BatchContext, BatchError> {
        self.switch("pause", SmeltingState::Running, SmeltingState::Paused)
    }

    pub fn resume(&self) -> Result<BatchContext, BatchError> {
        self.switch("resume", SmeltingState::Paused, SmeltingState::Running)
    }

    /// End the active batch; returns it as it was when stopped
    pub fn stop(&self) -> Result<BatchContext, BatchError> {
        let mut last_code = self.inner.last_code.lock();
        let Some(batch) = self.current() else {
            return Err(BatchError::InvalidTransition {
                action: "stop",
                state: SmeltingState::Idle,
            });
        };

        *last_code = Some(batch.batch_code.clone());
        self.inner.current.send_replace(None);
        self.save(last_code.as_deref());
        info!(
            "Batch {} stopped after {}s",
            batch.batch_code,
            (Utc::now() - batch.started_at).num_seconds()
        );
        Ok(batch)
    }

    fn switch(
        &self,
        action: &'static str,
        from: SmeltingState,
        to: SmeltingState,
    ) -> Result<BatchContext, BatchError> {
        let last_code = self.inner.last_code.lock();
        let batch = match self.current() {
            Some(mut batch) if batch.state == from => {
                batch.state = to;
                batch
            }
            other => {
                return Err(BatchError::InvalidTransition {
                    action,
                    state: other.map_or(SmeltingState::Idle, |b| b.state),
                })
            }
        };

        self.inner.current.send_replace(Some(batch.clone()));
        self.save(last_code.as_deref());
        info!("Batch {} {}", batch.batch_code, batch.state);
        Ok(batch)
    }

    fn save(&self, last_code: Option<&str>) {
        let Some(path) = &self.inner.state_file else {
            return;
        };
        let saved = SavedState {
            batch: self.current(),
            last_batch_code: last_code.map(str::to_string),
            saved_at: Utc::now(),
        };
        let result = serde_json::to_string_pretty(&saved)
            .map_err(std::io::Error::other)
            .and_then(|json| {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir)?;
                }
                std::fs::write(path, json)
            });
        match result {
            Ok(()) => debug!("Batch state saved to {:?}", path),
            Err(e) => warn!("Failed to save batch state to {:?}: {}", path, e),
        }
    }
}

/// Active batch and last code from a state file; unreadable files start idle
fn restore(path: &Path) -> (Option<BatchContext>, Option<String>) {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No batch state at {:?}, starting idle", path);
            return (None, None);
        }
        Err(e) => {
            warn!("Cannot read batch state {:?}: {}, starting idle", path, e);
            return (None, None);
        }
    };
    let saved: SavedState = match serde_json::from_str(&text) {
        Ok(saved) => saved,
        Err(e) => {
            warn!("Invalid batch state {:?}: {}, starting idle", path, e);
            return (None, None);
        }
    };

    let batch = saved.batch.map(|mut batch| {
        batch.state = SmeltingState::Running;
        info!(
            "Batch {} resumed after restart (saved {})",
            batch.batch_code, saved.saved_at
        );
        batch
    });
    (batch, saved.last_batch_code)
}
