//! Serial weighing protocol
//!
//! One request/response exchange per reading over the RS-485 link:
//!
//! ```text
//! request:  addr | 0x03 | register (BE16) | count (BE16) | crc16 (LE)
//! response: addr | 0x03 | byte count | registers (BE16 ...) | crc16 (LE)
//! ```
//!
//! A response is accepted only after every check in [`validate_response`]
//! passes. Any failure yields no reading for the tick; a zero weight is a real
//! reading, never a placeholder.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::WeighError;
use crate::parser::combine_words;
use crate::transport::SerialClient;

/// Read holding registers
pub const FUNCTION_READ: u8 = 0x03;

/// CRC16 with the reflected 0xA001 polynomial, init 0xFFFF
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Check a frame whose last two bytes are its little-endian CRC
pub fn verify_crc16(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    crc16(body) == u16::from_le_bytes([tail[0], tail[1]])
}

/// Request addressing for one instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeighRequest {
    pub station: u8,
    pub register: u16,
    pub count: u16,
}

impl Default for WeighRequest {
    fn default() -> Self {
        Self {
            station: 1,
            register: 2,
            count: 2,
        }
    }
}

impl WeighRequest {
    /// Fixed response length for the requested register count
    pub fn expected_response_len(&self) -> usize {
        5 + 2 * usize::from(self.count)
    }

    pub fn encode(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(8);
        frame.put_u8(self.station);
        frame.put_u8(FUNCTION_READ);
        frame.put_u16(self.register);
        frame.put_u16(self.count);
        let crc = crc16(&frame);
        frame.put_u16_le(crc);
        frame.freeze()
    }
}

/// Build a read request frame
pub fn build_read_request(station: u8, register: u16, count: u16) -> Bytes {
    WeighRequest {
        station,
        register,
        count,
    }
    .encode()
}

/// Validate a response and return its register values
///
/// Checks run in order: empty, short, station, exception, function, byte
/// count, CRC. Bytes past the expected length are ignored.
pub fn validate_response(
    request: &WeighRequest,
    response: &[u8],
    timeout: Duration,
) -> Result<Vec<u16>, WeighError> {
    if response.is_empty() {
        return Err(WeighError::NoResponse { timeout });
    }

    let expected = request.expected_response_len();
    if response.len() < expected {
        return Err(WeighError::Incomplete {
            expected,
            actual: response.len(),
        });
    }
    let frame = &response[..expected];

    if frame[0] != request.station {
        return Err(WeighError::AddressMismatch {
            expected: request.station,
            actual: frame[0],
        });
    }

    let function = frame[1];
    if function & 0x80 != 0 {
        return Err(WeighError::Exception {
            function,
            code: frame[2],
        });
    }
    if function != FUNCTION_READ {
        return Err(WeighError::FunctionMismatch {
            expected: FUNCTION_READ,
            actual: function,
        });
    }

    let byte_count = request.count.saturating_mul(2) as u8;
    if frame[2] != byte_count {
        return Err(WeighError::ByteCountMismatch {
            expected: byte_count,
            actual: frame[2],
        });
    }

    let (body, tail) = frame.split_at(expected - 2);
    let computed = crc16(body);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    if computed != received {
        return Err(WeighError::ChecksumError { computed, received });
    }

    Ok(body[3..]
        .chunks_exact(2)
        .map(|w| u16::from_be_bytes([w[0], w[1]]))
        .collect())
}

/// Combined 32-bit value of the first two registers
pub fn combined_value(registers: &[u16]) -> Option<u32> {
    match registers {
        [high, low, ..] => Some(combine_words(*high, *low)),
        [single] => Some(u32::from(*single)),
        [] => None,
    }
}

/// Reads the instrument over an owned serial client
///
/// The port is closed after any failure and reopened by the next read, so a
/// garbled exchange never leaves stale bytes in the line buffer.
#[derive(Debug)]
pub struct WeighingReader {
    client: SerialClient,
    request: WeighRequest,
    frame: Bytes,
    timeout: Duration,
}

impl WeighingReader {
    pub fn new(client: SerialClient, request: WeighRequest, timeout: Duration) -> Self {
        Self {
            client,
            frame: request.encode(),
            request,
            timeout,
        }
    }

    pub fn request(&self) -> &WeighRequest {
        &self.request
    }

    /// One exchange; the raw combined register value on success
    pub async fn read(&mut self) -> Result<u32, WeighError> {
        let result = self.exchange().await;
        if result.is_err() {
            self.client.close();
        }
        result
    }

    async fn exchange(&mut self) -> Result<u32, WeighError> {
        self.client.open()?;
        self.client.write(&self.frame).await?;
        let response = self
            .client
            .read_with_timeout(self.request.expected_response_len(), self.timeout)
            .await?;
        debug!("Weighing response: {:02X?}", response);

        let registers = validate_response(&self.request, &response, self.timeout)?;
        combined_value(&registers).ok_or(WeighError::Incomplete {
            expected: self.request.expected_response_len(),
            actual: response.len(),
        })
    }

    pub fn close(&mut self) {
        self.client.close();
    }
}
