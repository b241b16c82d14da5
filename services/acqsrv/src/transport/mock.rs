//! Mock fieldbus session
//!
//! In-memory controller image with scriptable failures, for exercising the
//! Connection Manager and poll loops without a network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{Area, FieldbusSession};
use crate::error::TransportError;

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    memory: HashMap<Area, Vec<u8>>,
    /// Number of upcoming connects that fail
    failing_connects: u32,
    /// Number of upcoming reads that fail
    failing_reads: u32,
    read_delay: Option<Duration>,
    connect_calls: u32,
    read_calls: u32,
    writes: Vec<(Area, u32, Vec<u8>)>,
}

/// Test-side handle to a [`MockSession`]
///
/// Stays valid after the session itself has been boxed into a manager.
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Replace the image of one area
    pub fn set_area(&self, area: Area, bytes: Vec<u8>) {
        self.state.lock().memory.insert(area, bytes);
    }

    /// Read back the current image of one area
    pub fn area(&self, area: Area) -> Option<Vec<u8>> {
        self.state.lock().memory.get(&area).cloned()
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.state.lock().failing_reads = count;
    }

    /// Delay every read (for timeout tests)
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.state.lock().read_delay = delay;
    }

    /// Simulate the peer dropping the connection
    pub fn drop_connection(&self) {
        self.state.lock().connected = false;
    }

    pub fn connect_calls(&self) -> u32 {
        self.state.lock().connect_calls
    }

    pub fn read_calls(&self) -> u32 {
        self.state.lock().read_calls
    }

    pub fn writes(&self) -> Vec<(Area, u32, Vec<u8>)> {
        self.state.lock().writes.clone()
    }
}

/// Scriptable in-memory session
#[derive(Debug, Default)]
pub struct MockSession {
    handle: MockHandle,
}

impl MockSession {
    pub fn new() -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

#[async_trait]
impl FieldbusSession for MockSession {
    fn endpoint(&self) -> String {
        "mock".to_string()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.handle.state.lock();
        state.connect_calls += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock connection refused",
            )));
        }
        state.connected = true;
        debug!("Mock session connected");
        Ok(())
    }

    async fn read_area(
        &mut self,
        area: Area,
        offset: u32,
        length: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let delay = {
            let mut state = self.handle.state.lock();
            state.read_calls += 1;
            if !state.connected {
                return Err(TransportError::NotOpen);
            }
            if state.failing_reads > 0 {
                state.failing_reads -= 1;
                state.connected = false;
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "mock connection reset",
                )));
            }
            state.read_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.handle.state.lock();
        let image = state.memory.get(&area).ok_or_else(|| TransportError::ItemError {
            area: area.to_string(),
            code: 0x0A,
            description: "Object does not exist",
        })?;
        let start = offset as usize;
        let end = (start + length).min(image.len());
        Ok(image.get(start..end).map(<[u8]>::to_vec).unwrap_or_default())
    }

    async fn write_area(
        &mut self,
        area: Area,
        offset: u32,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.handle.state.lock();
        if !state.connected {
            return Err(TransportError::NotOpen);
        }
        let start = offset as usize;
        let image = state.memory.entry(area).or_default();
        if image.len() < start + data.len() {
            image.resize(start + data.len(), 0);
        }
        image[start..start + data.len()].copy_from_slice(data);
        state.writes.push((area, offset, data.to_vec()));
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.handle.state.lock().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.handle.state.lock().connected
    }
}
