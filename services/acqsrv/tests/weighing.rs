//! Weighing exchange over an in-memory serial link
//!
//! `tokio::io::duplex` stands in for the RS-485 line; the test side plays
//! the instrument.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use acqsrv::error::WeighError;
use acqsrv::transport::{SerialClient, SerialSettings};
use acqsrv::weighing::{WeighRequest, WeighingReader};

const REQUEST: [u8; 8] = [0x01, 0x03, 0x00, 0x02, 0x00, 0x02, 0x65, 0xCB];
const RESPONSE_290: [u8; 9] = [0x01, 0x03, 0x04, 0x00, 0x00, 0x01, 0x22, 0x7B, 0xBA];
const RESPONSE_1234: [u8; 9] = [0x01, 0x03, 0x04, 0x00, 0x00, 0x04, 0xD2, 0x78, 0xAE];

fn reader() -> (WeighingReader, DuplexStream) {
    let (line, device) = tokio::io::duplex(64);
    let settings = SerialSettings {
        port: "/dev/acqsrv-test-missing".to_string(),
        ..SerialSettings::default()
    };
    let client = SerialClient::with_stream(settings, line);
    let reader = WeighingReader::new(client, WeighRequest::default(), Duration::from_millis(300));
    (reader, device)
}

/// Instrument side: expect the standard request, answer with `reply`
async fn answer(device: &mut DuplexStream, reply: &[u8]) {
    let mut request = [0u8; 8];
    device.read_exact(&mut request).await.unwrap();
    assert_eq!(request, REQUEST);
    device.write_all(reply).await.unwrap();
}

#[tokio::test]
async fn test_reads_consecutive_weights() {
    let (mut reader, mut device) = reader();

    let instrument = tokio::spawn(async move {
        answer(&mut device, &RESPONSE_290).await;
        answer(&mut device, &RESPONSE_1234).await;
        device
    });

    assert_eq!(reader.read().await.unwrap(), 290);
    assert_eq!(reader.read().await.unwrap(), 1234);
    instrument.await.unwrap();
}

#[tokio::test]
async fn test_response_in_fragments_is_reassembled() {
    let (mut reader, mut device) = reader();

    let instrument = tokio::spawn(async move {
        let mut request = [0u8; 8];
        device.read_exact(&mut request).await.unwrap();
        device.write_all(&RESPONSE_290[..4]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        device.write_all(&RESPONSE_290[4..]).await.unwrap();
        device
    });

    assert_eq!(reader.read().await.unwrap(), 290);
    instrument.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_silent_instrument_is_no_response() {
    let (mut reader, mut device) = reader();

    let instrument = tokio::spawn(async move {
        let mut request = [0u8; 8];
        device.read_exact(&mut request).await.unwrap();
        device
    });

    let err = reader.read().await.unwrap_err();
    assert!(matches!(err, WeighError::NoResponse { .. }));
    let _device = instrument.await.unwrap();
}

#[tokio::test]
async fn test_corrupt_frame_closes_port() {
    let (mut reader, mut device) = reader();
    let mut corrupt = RESPONSE_290;
    corrupt[6] ^= 0x01;

    let instrument = tokio::spawn(async move {
        answer(&mut device, &corrupt).await;
        device
    });

    let err = reader.read().await.unwrap_err();
    assert!(matches!(err, WeighError::ChecksumError { .. }));
    let _device = instrument.await.unwrap();

    // The in-memory line was dropped; reopening hits the (missing) configured port
    let err = reader.read().await.unwrap_err();
    assert!(matches!(err, WeighError::Transport(_)));
}

#[tokio::test]
async fn test_short_exception_frame_is_incomplete() {
    let (mut reader, mut device) = reader();

    let instrument = tokio::spawn(async move {
        answer(&mut device, &[0x01, 0x83, 0x02, 0xC0, 0xF1]).await;
        device
    });

    let err = reader.read().await.unwrap_err();
    assert!(matches!(err, WeighError::Incomplete { expected: 9, actual: 5 }));
    let _device = instrument.await.unwrap();
}
