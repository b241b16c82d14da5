//! Connection Manager
//!
//! Owns the single fieldbus session and its lifecycle:
//!
//! ```text
//! Disconnected ──connect ok──▶ Connected ──I/O failure──▶ Faulted
//!                                  ▲                         │
//!                                  └──ok── Connecting ◀──────┘
//!                                             │    backoff elapsed
//!                                             └──fail──▶ Faulted (longer backoff)
//! ```
//!
//! All session I/O goes through one `tokio::sync::Mutex`; acquiring it and
//! every call made while holding it are bounded by timeouts. Reads and writes
//! against a session that is not `Connected` fail immediately with
//! [`ConnectionError::NotConnected`], so a poll loop never stalls on a dead
//! device.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use errors::{log_classified, ClassifiedError};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::MutexGuard;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, TransportError};
use crate::transport::{Area, FieldbusSession};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Spread delays by ±25%
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(base_delay_ms: u64, max_delay_ms: u64, jitter: bool) -> Self {
        Self {
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            jitter,
        }
    }

    /// `min(base × 2^n, cap)`
    pub fn delay(&self, n: u32) -> Duration {
        let factor = 2u32.checked_pow(n).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Wait before the next attempt after `consecutive_failures` failures
    pub fn retry_delay(&self, consecutive_failures: u32) -> Duration {
        let delay = self.delay(consecutive_failures.saturating_sub(1));
        if !self.jitter {
            return delay;
        }
        let range = delay.as_millis() as f64 * 0.25;
        if range < 1.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(-range..range);
        Duration::from_millis((delay.as_millis() as f64 + jitter).max(0.0) as u64)
    }
}

/// Timeouts applied around the session
#[derive(Debug, Clone)]
pub struct SessionTimeouts {
    pub connect: Duration,
    pub io: Duration,
    pub lock: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            io: Duration::from_secs(2),
            lock: Duration::from_secs(1),
        }
    }
}

/// Point-in-time health report
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub endpoint: String,
    pub state: ConnectionState,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub connect_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    /// Remaining backoff before the next reconnect attempt
    pub retry_in: Option<Duration>,
}

#[derive(Debug)]
struct Health {
    state: ConnectionState,
    last_success: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    connect_count: u64,
    error_count: u64,
    last_error: Option<String>,
    next_attempt: Option<Instant>,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_success: None,
            consecutive_failures: 0,
            connect_count: 0,
            error_count: 0,
            last_error: None,
            next_attempt: None,
        }
    }
}

enum Gate {
    Ready,
    BackingOff(Duration),
    Attempt,
}

/// Serialized, self-healing access to one fieldbus session
pub struct ConnectionManager {
    session: tokio::sync::Mutex<Box<dyn FieldbusSession>>,
    health: Mutex<Health>,
    policy: ReconnectPolicy,
    timeouts: SessionTimeouts,
    endpoint: String,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.endpoint)
            .field("state", &self.health.lock().state)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        session: Box<dyn FieldbusSession>,
        policy: ReconnectPolicy,
        timeouts: SessionTimeouts,
    ) -> Self {
        let endpoint = session.endpoint();
        Self {
            session: tokio::sync::Mutex::new(session),
            health: Mutex::new(Health::default()),
            policy,
            timeouts,
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.health.lock().state
    }

    pub fn status(&self) -> ConnectionStatus {
        let health = self.health.lock();
        let retry_in = match health.state {
            ConnectionState::Connected => None,
            _ => health
                .next_attempt
                .map(|at| at.saturating_duration_since(Instant::now())),
        };
        ConnectionStatus {
            endpoint: self.endpoint.clone(),
            state: health.state,
            last_success: health.last_success,
            consecutive_failures: health.consecutive_failures,
            connect_count: health.connect_count,
            error_count: health.error_count,
            last_error: health.last_error.clone(),
            retry_in,
        }
    }

    /// Connect now, ignoring any backoff window
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut session = self.lock_session().await?;
        if self.state() == ConnectionState::Connected && session.is_connected() {
            return Ok(());
        }
        self.connect_locked(&mut session).await
    }

    /// Connect if needed; fails fast while a backoff window is open
    pub async fn ensure_connected(&self) -> Result<(), ConnectionError> {
        match self.gate() {
            Gate::Ready => return Ok(()),
            Gate::BackingOff(remaining) => return Err(ConnectionError::BackingOff { remaining }),
            Gate::Attempt => {}
        }

        let mut session = self.lock_session().await?;
        // Another caller may have reconnected while we waited for the lock
        match self.gate() {
            Gate::Ready => Ok(()),
            Gate::BackingOff(remaining) => Err(ConnectionError::BackingOff { remaining }),
            Gate::Attempt => self.connect_locked(&mut session).await,
        }
    }

    /// Read `length` bytes of data block `db` starting at `offset`
    pub async fn read_block(
        &self,
        db: u16,
        offset: u32,
        length: usize,
    ) -> Result<Vec<u8>, ConnectionError> {
        self.read_area(Area::DataBlock(db), offset, length).await
    }

    /// Read from the process output image
    pub async fn read_outputs(&self, offset: u32, length: usize) -> Result<Vec<u8>, ConnectionError> {
        self.read_area(Area::Outputs, offset, length).await
    }

    pub async fn read_area(
        &self,
        area: Area,
        offset: u32,
        length: usize,
    ) -> Result<Vec<u8>, ConnectionError> {
        self.fail_fast()?;
        let mut session = self.lock_session().await?;
        self.fail_fast()?;

        let result = timeout(self.timeouts.io, session.read_area(area, offset, length))
            .await
            .unwrap_or_else(|_| Err(TransportError::timeout("block read", self.timeouts.io)));

        match result {
            Ok(bytes) => {
                self.record_success();
                Ok(bytes)
            }
            Err(e) => Err(self.failed(&mut session, e).await),
        }
    }

    /// Write `data` into data block `db` at `offset`
    pub async fn write_block(&self, db: u16, offset: u32, data: &[u8]) -> Result<(), ConnectionError> {
        self.fail_fast()?;
        let mut session = self.lock_session().await?;
        self.fail_fast()?;

        let area = Area::DataBlock(db);
        let result = timeout(self.timeouts.io, session.write_area(area, offset, data))
            .await
            .unwrap_or_else(|_| Err(TransportError::timeout("block write", self.timeouts.io)));

        match result {
            Ok(()) => {
                self.record_success();
                debug!("Wrote {} bytes to {}.{}", data.len(), area, offset);
                Ok(())
            }
            Err(e) => Err(self.failed(&mut session, e).await),
        }
    }

    /// Close the session; the next `ensure_connected` reconnects immediately
    pub async fn disconnect(&self) {
        match timeout(self.timeouts.lock, self.session.lock()).await {
            Ok(mut session) => session.disconnect().await,
            Err(_) => warn!(
                "Session lock busy during disconnect from {}, marking disconnected",
                self.endpoint
            ),
        }
        let mut health = self.health.lock();
        health.state = ConnectionState::Disconnected;
        health.next_attempt = None;
        info!("Disconnected from {}", self.endpoint);
    }

    // ------------------------------------------------------------------------

    fn gate(&self) -> Gate {
        let health = self.health.lock();
        if health.state == ConnectionState::Connected {
            return Gate::Ready;
        }
        match health.next_attempt {
            Some(at) if at > Instant::now() => Gate::BackingOff(at - Instant::now()),
            _ => Gate::Attempt,
        }
    }

    fn fail_fast(&self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            state => Err(ConnectionError::NotConnected { state }),
        }
    }

    async fn lock_session(
        &self,
    ) -> Result<MutexGuard<'_, Box<dyn FieldbusSession>>, ConnectionError> {
        timeout(self.timeouts.lock, self.session.lock())
            .await
            .map_err(|_| ConnectionError::LockTimeout(self.timeouts.lock))
    }

    async fn connect_locked(
        &self,
        session: &mut MutexGuard<'_, Box<dyn FieldbusSession>>,
    ) -> Result<(), ConnectionError> {
        self.health.lock().state = ConnectionState::Connecting;
        debug!("Connecting to {}", self.endpoint);

        let result = timeout(self.timeouts.connect, session.connect())
            .await
            .unwrap_or_else(|_| Err(TransportError::timeout("connect", self.timeouts.connect)));

        match result {
            Ok(()) => {
                let mut health = self.health.lock();
                let was_failing = health.consecutive_failures;
                health.state = ConnectionState::Connected;
                health.consecutive_failures = 0;
                health.connect_count += 1;
                health.last_success = Some(Utc::now());
                health.next_attempt = None;
                if was_failing > 0 {
                    info!(
                        "Reconnected to {} after {} failures",
                        self.endpoint, was_failing
                    );
                } else {
                    info!("Connected to {}", self.endpoint);
                }
                Ok(())
            }
            Err(e) => {
                self.fault(session, &e).await;
                Err(ConnectionError::ConnectFailed {
                    endpoint: self.endpoint.clone(),
                    source: e,
                })
            }
        }
    }

    /// Fault the session only for link-level failures
    ///
    /// A rejected item (unknown DB, address out of range) is an answer from a
    /// healthy device: it fails this call alone and leaves the session to the
    /// other callers.
    async fn failed(
        &self,
        session: &mut MutexGuard<'_, Box<dyn FieldbusSession>>,
        error: TransportError,
    ) -> ConnectionError {
        if error.is_retryable() {
            self.fault(session, &error).await;
            return ConnectionError::Io(error);
        }

        {
            let mut health = self.health.lock();
            health.error_count += 1;
            health.last_error = Some(error.to_string());
        }
        debug!(
            code = error.error_code(),
            "Request to {} rejected, session kept: {}", self.endpoint, error
        );
        ConnectionError::Rejected(error)
    }

    fn record_success(&self) {
        let mut health = self.health.lock();
        health.consecutive_failures = 0;
        health.last_success = Some(Utc::now());
    }

    async fn fault(
        &self,
        session: &mut MutexGuard<'_, Box<dyn FieldbusSession>>,
        error: &TransportError,
    ) {
        session.disconnect().await;

        let (failures, delay) = {
            let mut health = self.health.lock();
            health.state = ConnectionState::Faulted;
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.error_count += 1;
            health.last_error = Some(error.to_string());
            let delay = self.policy.retry_delay(health.consecutive_failures);
            health.next_attempt = Some(Instant::now() + delay);
            (health.consecutive_failures, delay)
        };

        if failures == 1 {
            log_classified(error, &format!("Session to {} faulted", self.endpoint));
        }
        debug!(
            code = error.error_code(),
            "Session to {} faulted ({} consecutive), retry in {:?}",
            self.endpoint,
            failures,
            delay
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::mock::{MockHandle, MockSession};

    fn manager() -> (Arc<ConnectionManager>, MockHandle) {
        let (session, handle) = MockSession::new();
        handle.set_area(Area::DataBlock(1), vec![1, 2, 3, 4]);
        let manager = ConnectionManager::new(
            Box::new(session),
            ReconnectPolicy::default(),
            SessionTimeouts {
                connect: Duration::from_millis(500),
                io: Duration::from_millis(200),
                lock: Duration::from_millis(100),
            },
        );
        (Arc::new(manager), handle)
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| policy.retry_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(policy.delay(200), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_before_connect_fails_fast() {
        let (manager, handle) = manager();
        let err = manager.read_block(1, 0, 4).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::NotConnected {
                state: ConnectionState::Disconnected
            }
        ));
        assert_eq!(handle.read_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_read() {
        let (manager, _handle) = manager();
        manager.ensure_connected().await.unwrap();
        assert_eq!(manager.read_block(1, 1, 2).await.unwrap(), vec![2, 3]);

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.connect_count, 1);
        assert!(status.last_success.is_some());
        assert!(status.retry_in.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_io_failure_faults_and_backs_off() {
        let (manager, handle) = manager();
        manager.connect().await.unwrap();
        handle.fail_next_reads(1);

        let err = manager.read_block(1, 0, 4).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Io(_)));
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Faulted);
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.retry_in, Some(Duration::from_secs(1)));

        let err = manager.ensure_connected().await.unwrap_err();
        assert!(matches!(err, ConnectionError::BackingOff { .. }));
        assert_eq!(handle.connect_calls(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        manager.ensure_connected().await.unwrap();
        assert_eq!(manager.read_block(1, 0, 4).await.unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(manager.status().consecutive_failures, 0);
        assert_eq!(manager.status().connect_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_item_keeps_session_connected() {
        let (manager, handle) = manager();
        manager.connect().await.unwrap();

        let err = manager.read_block(99, 0, 4).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Rejected(TransportError::ItemError { code: 0x0A, .. })
        ));

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.error_count, 1);
        assert!(status.last_error.unwrap().contains("DB99"));

        // Same session serves the next caller without a reconnect
        assert_eq!(manager.read_block(1, 0, 4).await.unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(handle.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnects_lengthen_backoff() {
        let (manager, handle) = manager();
        handle.fail_next_connects(3);

        let mut waits = Vec::new();
        for _ in 0..3 {
            assert!(manager.ensure_connected().await.is_err());
            let wait = manager.status().retry_in.unwrap();
            waits.push(wait.as_secs());
            tokio::time::advance(wait).await;
        }
        assert_eq!(waits, vec![1, 2, 4]);

        manager.ensure_connected().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.status().error_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_read_times_out() {
        let (manager, handle) = manager();
        manager.connect().await.unwrap();
        handle.set_read_delay(Some(Duration::from_secs(5)));

        let err = manager.read_block(1, 0, 4).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Io(TransportError::Timeout { .. })
        ));
        assert_eq!(manager.state(), ConnectionState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_session_lock_times_out() {
        let (session, handle) = MockSession::new();
        handle.set_area(Area::DataBlock(1), vec![0; 4]);
        handle.set_read_delay(Some(Duration::from_secs(1)));
        let manager = Arc::new(ConnectionManager::new(
            Box::new(session),
            ReconnectPolicy::default(),
            SessionTimeouts {
                connect: Duration::from_secs(1),
                io: Duration::from_secs(5),
                lock: Duration::from_millis(100),
            },
        ));
        manager.connect().await.unwrap();

        let slow = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.read_block(1, 0, 4).await })
        };
        tokio::task::yield_now().await;

        let err = manager.read_block(1, 0, 4).await.unwrap_err();
        assert!(matches!(err, ConnectionError::LockTimeout(_)));
        assert!(slow.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_and_outputs() {
        let (manager, handle) = manager();
        handle.set_area(Area::Outputs, vec![0b0000_1000]);
        manager.connect().await.unwrap();

        manager.write_block(1, 2, &[9, 9]).await.unwrap();
        assert_eq!(handle.area(Area::DataBlock(1)).unwrap(), vec![1, 2, 9, 9]);
        assert_eq!(manager.read_outputs(0, 1).await.unwrap(), vec![0b0000_1000]);

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.status().retry_in.is_none());
    }
}
