//! Serial link client (RS-485)
//!
//! A thin byte-stream client: open, write a request, read back up to an
//! expected number of bytes before a deadline. Framing and validation live in
//! the protocol layer (`crate::weighing`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_serial::{DataBits, SerialPortBuilderExt, StopBits};
use tracing::debug;

use crate::error::TransportError;

/// Parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    #[default]
    Even,
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// Serial port parameters
#[derive(Debug, Clone)]
pub struct SerialSettings {
    /// Port path ("/dev/ttyUSB0", "COM1")
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    /// Bound on a single write
    pub write_timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 19200,
            data_bits: 8,
            parity: Parity::Even,
            stop_bits: 1,
            write_timeout: Duration::from_millis(500),
        }
    }
}

fn data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

/// Any async byte stream usable as a serial link
pub trait SerialStreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialStreamIo for T {}

/// Serial link client
pub struct SerialClient {
    settings: SerialSettings,
    stream: Option<Box<dyn SerialStreamIo>>,
}

impl std::fmt::Debug for SerialClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialClient")
            .field("settings", &self.settings)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl SerialClient {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            stream: None,
        }
    }

    /// Client over an already open stream (bridges, tests)
    pub fn with_stream(settings: SerialSettings, stream: impl SerialStreamIo + 'static) -> Self {
        Self {
            settings,
            stream: Some(Box::new(stream)),
        }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Open the configured port; no-op if already open
    pub fn open(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let s = &self.settings;
        let port = tokio_serial::new(&s.port, s.baud_rate)
            .data_bits(data_bits(s.data_bits))
            .parity(s.parity.into())
            .stop_bits(stop_bits(s.stop_bits))
            .timeout(s.write_timeout)
            .open_native_async()
            .map_err(|e| TransportError::Io(e.into()))?;
        debug!(
            "Serial port open: {} @ {} {}{:?}{}",
            s.port, s.baud_rate, s.data_bits, s.parity, s.stop_bits
        );
        self.stream = Some(Box::new(port));
        Ok(())
    }

    /// Write a whole frame
    pub async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let write_timeout = self.settings.write_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        timeout(write_timeout, async {
            stream.write_all(frame).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| TransportError::timeout("serial write", write_timeout))??;
        Ok(())
    }

    /// Read until `expected` bytes arrived or `wait` elapsed
    ///
    /// Returns whatever was received, possibly nothing; the caller decides
    /// whether a short read is an error.
    pub async fn read_with_timeout(
        &mut self,
        expected: usize,
        wait: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        let deadline = Instant::now() + wait;
        let mut buf = vec![0u8; expected];
        let mut filled = 0;

        while filled < expected {
            match timeout_at(deadline, stream.read(&mut buf[filled..])).await {
                Err(_) => break,
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        buf.truncate(filled);
        Ok(buf)
    }

    /// Drop the port; the next `open` starts from a clean line state
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Serial port closed: {}", self.settings.port);
        }
    }
}
