//! S7 session client over ISO-on-TCP (RFC 1006)
//!
//! Frame layering for every request and response:
//!
//! ```text
//! TPKT (4) | COTP (3 for DT, 18 for CR/CC) | S7 header (10 job / 12 ack) | params | data
//! ```
//!
//! Only what the acquisition core needs is implemented: connection request,
//! setup-communication (PDU negotiation), and single-item read/write of a
//! data block or the output image. All multi-byte fields are big-endian.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{Area, FieldbusSession};
use crate::error::TransportError;

/// Well-known ISO-on-TCP port
pub const ISO_TCP_PORT: u16 = 102;

const TPKT_VERSION: u8 = 0x03;
const TPKT_HEADER_LEN: usize = 4;

const COTP_CR: u8 = 0xE0;
const COTP_CC: u8 = 0xD0;
const COTP_DT: u8 = 0xF0;
const COTP_DT_HEADER: [u8; 3] = [0x02, COTP_DT, 0x80];
const LOCAL_TSAP: u16 = 0x0100;

const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK_DATA: u8 = 0x03;
const JOB_HEADER_LEN: usize = 10;
const ACK_HEADER_LEN: usize = 12;

const FN_SETUP_COMM: u8 = 0xF0;
const FN_READ_VAR: u8 = 0x04;
const FN_WRITE_VAR: u8 = 0x05;

const AREA_OUTPUTS: u8 = 0x82;
const AREA_DATA_BLOCK: u8 = 0x84;

const SYNTAX_S7ANY: u8 = 0x10;
const TS_BYTE: u8 = 0x02;
const DATA_TS_BIT: u8 = 0x03;
const DATA_TS_BYTE_WORD_DWORD: u8 = 0x04;
const DATA_TS_INTEGER: u8 = 0x05;
const RETURN_SUCCESS: u8 = 0xFF;

/// Overhead of a read response around its payload (ack header + params + item header)
const READ_OVERHEAD: usize = ACK_HEADER_LEN + 2 + 4;
/// Overhead of a write request around its payload (job header + params + item header)
const WRITE_OVERHEAD: usize = JOB_HEADER_LEN + 14 + 4;

/// Connection parameters for one controller
#[derive(Debug, Clone)]
pub struct S7Settings {
    pub host: String,
    pub port: u16,
    pub rack: u8,
    pub slot: u8,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    /// Requested PDU size; the controller may negotiate it down
    pub pdu_size: u16,
}

impl Default for S7Settings {
    fn default() -> Self {
        Self {
            host: "192.168.0.1".to_string(),
            port: ISO_TCP_PORT,
            rack: 0,
            slot: 1,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(2),
            pdu_size: 480,
        }
    }
}

fn area_code(area: Area) -> u8 {
    match area {
        Area::DataBlock(_) => AREA_DATA_BLOCK,
        Area::Outputs => AREA_OUTPUTS,
    }
}

/// Describe an item return code
pub fn item_error_description(code: u8) -> &'static str {
    match code {
        0x01 => "Hardware fault",
        0x03 => "Accessing the object not allowed",
        0x05 => "Address out of range",
        0x06 => "Data type not supported",
        0x07 => "Data type inconsistent",
        0x0A => "Object does not exist",
        _ => "Unknown item error",
    }
}

fn tpkt(payload: &[u8]) -> Bytes {
    let total = payload.len() + TPKT_HEADER_LEN;
    let mut frame = BytesMut::with_capacity(total);
    frame.put_u8(TPKT_VERSION);
    frame.put_u8(0x00);
    frame.put_u16(total as u16);
    frame.put_slice(payload);
    frame.freeze()
}

/// COTP connection request addressed to `rack`/`slot`
pub(crate) fn connection_request(rack: u8, slot: u8) -> Bytes {
    let remote_tsap = 0x0100 | (u16::from(rack) << 5) | u16::from(slot & 0x1F);
    let mut cotp = BytesMut::with_capacity(18);
    cotp.put_u8(17); // length indicator, excludes itself
    cotp.put_u8(COTP_CR);
    cotp.put_u16(0x0000); // destination reference
    cotp.put_u16(0x0001); // source reference
    cotp.put_u8(0x00); // class 0
    cotp.put_slice(&[0xC0, 0x01, 0x0A]); // TPDU size 1024
    cotp.put_slice(&[0xC1, 0x02]);
    cotp.put_u16(LOCAL_TSAP);
    cotp.put_slice(&[0xC2, 0x02]);
    cotp.put_u16(remote_tsap);
    tpkt(&cotp)
}

fn job(pdu_ref: u16, params: &[u8], data: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(3 + JOB_HEADER_LEN + params.len() + data.len());
    body.put_slice(&COTP_DT_HEADER);
    body.put_u8(S7_PROTOCOL_ID);
    body.put_u8(ROSCTR_JOB);
    body.put_u16(0x0000);
    body.put_u16(pdu_ref);
    body.put_u16(params.len() as u16);
    body.put_u16(data.len() as u16);
    body.put_slice(params);
    body.put_slice(data);
    tpkt(&body)
}

/// Setup-communication request proposing `pdu_size`
pub(crate) fn setup_request(pdu_ref: u16, pdu_size: u16) -> Bytes {
    let mut params = BytesMut::with_capacity(8);
    params.put_u8(FN_SETUP_COMM);
    params.put_u8(0x00);
    params.put_u16(1); // max AmQ calling
    params.put_u16(1); // max AmQ called
    params.put_u16(pdu_size);
    job(pdu_ref, &params, &[])
}

fn item_spec(params: &mut BytesMut, area: Area, offset: u32, length: usize) {
    params.put_u8(0x12); // variable specification
    params.put_u8(0x0A); // length of the remaining item
    params.put_u8(SYNTAX_S7ANY);
    params.put_u8(TS_BYTE);
    params.put_u16(length as u16);
    params.put_u16(area.db_number());
    params.put_u8(area_code(area));
    let bit_address = offset << 3;
    params.put_u8(((bit_address >> 16) & 0xFF) as u8);
    params.put_u8(((bit_address >> 8) & 0xFF) as u8);
    params.put_u8((bit_address & 0xFF) as u8);
}

/// Read-var request for one byte range
pub(crate) fn read_request(pdu_ref: u16, area: Area, offset: u32, length: usize) -> Bytes {
    let mut params = BytesMut::with_capacity(14);
    params.put_u8(FN_READ_VAR);
    params.put_u8(1);
    item_spec(&mut params, area, offset, length);
    job(pdu_ref, &params, &[])
}

/// Write-var request for one byte range
pub(crate) fn write_request(pdu_ref: u16, area: Area, offset: u32, data: &[u8]) -> Bytes {
    let mut params = BytesMut::with_capacity(14);
    params.put_u8(FN_WRITE_VAR);
    params.put_u8(1);
    item_spec(&mut params, area, offset, data.len());

    let mut payload = BytesMut::with_capacity(4 + data.len());
    payload.put_u8(0x00);
    payload.put_u8(DATA_TS_BYTE_WORD_DWORD);
    payload.put_u16((data.len() * 8) as u16);
    payload.put_slice(data);
    job(pdu_ref, &params, &payload)
}

/// Parsed ack-data message: parameter and data sections
#[derive(Debug)]
struct AckData<'a> {
    params: &'a [u8],
    data: &'a [u8],
}

/// Validate COTP DT + S7 ack header and split the sections
///
/// `payload` is everything after the TPKT header.
fn parse_ack(payload: &[u8], expected_ref: u16) -> Result<AckData<'_>, TransportError> {
    if payload.len() < 3 || payload[1] != COTP_DT {
        return Err(TransportError::protocol("expected COTP data transfer"));
    }
    let s7 = &payload[3..];
    if s7.len() < ACK_HEADER_LEN {
        return Err(TransportError::protocol(format!(
            "S7 header truncated ({} bytes)",
            s7.len()
        )));
    }
    if s7[0] != S7_PROTOCOL_ID {
        return Err(TransportError::protocol(format!(
            "unexpected protocol id 0x{:02X}",
            s7[0]
        )));
    }
    if s7[1] != ROSCTR_ACK_DATA {
        return Err(TransportError::protocol(format!(
            "unexpected message type 0x{:02X}",
            s7[1]
        )));
    }
    let pdu_ref = u16::from_be_bytes([s7[4], s7[5]]);
    if pdu_ref != expected_ref {
        return Err(TransportError::protocol(format!(
            "PDU reference mismatch: sent {expected_ref}, got {pdu_ref}"
        )));
    }
    let (error_class, error_code) = (s7[10], s7[11]);
    if error_class != 0 || error_code != 0 {
        return Err(TransportError::protocol(format!(
            "controller rejected job: class 0x{error_class:02X} code 0x{error_code:02X}"
        )));
    }
    let param_len = usize::from(u16::from_be_bytes([s7[6], s7[7]]));
    let data_len = usize::from(u16::from_be_bytes([s7[8], s7[9]]));
    let body = &s7[ACK_HEADER_LEN..];
    if body.len() < param_len + data_len {
        return Err(TransportError::protocol("S7 message shorter than declared"));
    }
    Ok(AckData {
        params: &body[..param_len],
        data: &body[param_len..param_len + data_len],
    })
}

/// Negotiated PDU size from a setup-communication ack
pub(crate) fn parse_setup_response(payload: &[u8], pdu_ref: u16) -> Result<u16, TransportError> {
    let ack = parse_ack(payload, pdu_ref)?;
    if ack.params.len() < 8 || ack.params[0] != FN_SETUP_COMM {
        return Err(TransportError::protocol("malformed setup-communication ack"));
    }
    Ok(u16::from_be_bytes([ack.params[6], ack.params[7]]))
}

/// Payload bytes of a single-item read ack
pub(crate) fn parse_read_response(
    payload: &[u8],
    pdu_ref: u16,
    area: Area,
    expected: usize,
) -> Result<Vec<u8>, TransportError> {
    let ack = parse_ack(payload, pdu_ref)?;
    if ack.params.first() != Some(&FN_READ_VAR) {
        return Err(TransportError::protocol("read ack carries wrong function"));
    }
    let item = ack.data;
    let Some(&return_code) = item.first() else {
        return Err(TransportError::protocol("read ack carries no item"));
    };
    if return_code != RETURN_SUCCESS {
        return Err(TransportError::ItemError {
            area: area.to_string(),
            code: return_code,
            description: item_error_description(return_code),
        });
    }
    if item.len() < 4 {
        return Err(TransportError::protocol("read item header truncated"));
    }
    let declared = usize::from(u16::from_be_bytes([item[2], item[3]]));
    let byte_len = match item[1] {
        DATA_TS_BIT | DATA_TS_BYTE_WORD_DWORD | DATA_TS_INTEGER => declared.div_ceil(8),
        _ => declared,
    };
    let bytes = &item[4..];
    if byte_len != expected || bytes.len() < byte_len {
        return Err(TransportError::protocol(format!(
            "read returned {byte_len} bytes, expected {expected}"
        )));
    }
    Ok(bytes[..byte_len].to_vec())
}

/// Validate a single-item write ack
pub(crate) fn parse_write_response(
    payload: &[u8],
    pdu_ref: u16,
    area: Area,
) -> Result<(), TransportError> {
    let ack = parse_ack(payload, pdu_ref)?;
    if ack.params.first() != Some(&FN_WRITE_VAR) {
        return Err(TransportError::protocol("write ack carries wrong function"));
    }
    match ack.data.first() {
        Some(&RETURN_SUCCESS) => Ok(()),
        Some(&code) => Err(TransportError::ItemError {
            area: area.to_string(),
            code,
            description: item_error_description(code),
        }),
        None => Err(TransportError::protocol("write ack carries no item")),
    }
}

/// S7 client holding one TCP session
#[derive(Debug)]
pub struct S7Client {
    settings: S7Settings,
    stream: Option<TcpStream>,
    pdu_size: u16,
    pdu_ref: u16,
}

impl S7Client {
    pub fn new(settings: S7Settings) -> Self {
        let pdu_size = settings.pdu_size;
        Self {
            settings,
            stream: None,
            pdu_size,
            pdu_ref: 0,
        }
    }

    /// PDU size in effect (negotiated once connected)
    pub fn pdu_size(&self) -> u16 {
        self.pdu_size
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let io_timeout = self.settings.io_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        timeout(io_timeout, stream.write_all(frame))
            .await
            .map_err(|_| TransportError::timeout("S7 send", io_timeout))??;
        Ok(())
    }

    /// Receive one TPKT and return everything after its header
    async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        let io_timeout = self.settings.io_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;

        let mut header = [0u8; TPKT_HEADER_LEN];
        timeout(io_timeout, stream.read_exact(&mut header))
            .await
            .map_err(|_| TransportError::timeout("S7 receive", io_timeout))??;
        if header[0] != TPKT_VERSION {
            return Err(TransportError::protocol(format!(
                "bad TPKT version 0x{:02X}",
                header[0]
            )));
        }
        let total = usize::from(u16::from_be_bytes([header[2], header[3]]));
        if total < TPKT_HEADER_LEN + 3 {
            return Err(TransportError::protocol(format!("bad TPKT length {total}")));
        }

        let mut payload = vec![0u8; total - TPKT_HEADER_LEN];
        timeout(io_timeout, stream.read_exact(&mut payload))
            .await
            .map_err(|_| TransportError::timeout("S7 receive", io_timeout))??;
        Ok(payload)
    }

    /// Send a frame and wait for its reply; any failure closes the socket
    async fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let result = async {
            self.send(frame).await?;
            self.receive().await
        }
        .await;
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    async fn handshake(&mut self) -> Result<(), TransportError> {
        let reply = self
            .exchange(&connection_request(self.settings.rack, self.settings.slot))
            .await?;
        if reply.len() < 2 || reply[1] != COTP_CC {
            return Err(TransportError::protocol("connection request refused"));
        }

        let pdu_ref = self.next_ref();
        let reply = self
            .exchange(&setup_request(pdu_ref, self.settings.pdu_size))
            .await?;
        let negotiated = parse_setup_response(&reply, pdu_ref)?;
        // A read needs room for its own overhead plus at least one byte
        if usize::from(negotiated) <= WRITE_OVERHEAD {
            return Err(TransportError::protocol(format!(
                "negotiated PDU size {negotiated} is too small"
            )));
        }
        self.pdu_size = negotiated.min(self.settings.pdu_size);
        Ok(())
    }

    fn max_read_chunk(&self) -> usize {
        usize::from(self.pdu_size).saturating_sub(READ_OVERHEAD)
    }

    fn max_write_chunk(&self) -> usize {
        usize::from(self.pdu_size).saturating_sub(WRITE_OVERHEAD)
    }
}

#[async_trait]
impl FieldbusSession for S7Client {
    fn endpoint(&self) -> String {
        format!(
            "{}:{} (rack {}, slot {})",
            self.settings.host, self.settings.port, self.settings.rack, self.settings.slot
        )
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.stream = None;
        let address = format!("{}:{}", self.settings.host, self.settings.port);
        debug!("Connecting S7 session to {}", address);

        let stream = timeout(self.settings.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| TransportError::timeout("S7 connect", self.settings.connect_timeout))??;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", address, e);
        }
        self.stream = Some(stream);

        if let Err(e) = self.handshake().await {
            self.stream = None;
            return Err(e);
        }
        info!("S7 session open: {} (PDU {})", self.endpoint(), self.pdu_size);
        Ok(())
    }

    async fn read_area(
        &mut self,
        area: Area,
        offset: u32,
        length: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let chunk = self.max_read_chunk();
        let mut out = Vec::with_capacity(length);
        let mut done = 0usize;
        while done < length {
            let len = chunk.min(length - done);
            let start = offset + done as u32;
            let pdu_ref = self.next_ref();
            let reply = self
                .exchange(&read_request(pdu_ref, area, start, len))
                .await?;
            out.extend_from_slice(&parse_read_response(&reply, pdu_ref, area, len)?);
            done += len;
        }
        Ok(out)
    }

    async fn write_area(
        &mut self,
        area: Area,
        offset: u32,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let chunk = self.max_write_chunk();
        for (index, part) in data.chunks(chunk.max(1)).enumerate() {
            let start = offset + (index * chunk) as u32;
            let pdu_ref = self.next_ref();
            let reply = self
                .exchange(&write_request(pdu_ref, area, start, part))
                .await?;
            parse_write_response(&reply, pdu_ref, area)?;
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("S7 session closed: {}", self.endpoint());
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn ack(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
        let mut body = COTP_DT_HEADER.to_vec();
        body.extend_from_slice(&[S7_PROTOCOL_ID, ROSCTR_ACK_DATA, 0, 0]);
        body.extend_from_slice(&pdu_ref.to_be_bytes());
        body.extend_from_slice(&(params.len() as u16).to_be_bytes());
        body.extend_from_slice(&(data.len() as u16).to_be_bytes());
        body.extend_from_slice(&[0, 0]);
        body.extend_from_slice(params);
        body.extend_from_slice(data);
        body
    }

    #[test]
    fn test_connection_request_layout() {
        let frame = connection_request(0, 1);
        assert_eq!(frame.len(), 22);
        assert_eq!(&frame[..4], &[0x03, 0x00, 0x00, 0x16]);
        assert_eq!(frame[5], COTP_CR);
        // remote TSAP: connection type 1, rack 0 slot 1
        assert_eq!(&frame[20..22], &[0x01, 0x01]);

        let frame = connection_request(1, 3);
        assert_eq!(&frame[20..22], &[0x01, 0x23]);
    }

    #[test]
    fn test_read_request_addresses_db_bit_offset() {
        let frame = read_request(7, Area::DataBlock(32), 4, 29);
        assert_eq!(frame.len(), 31);
        // S7 header: job, ref 7, params 14, data 0
        assert_eq!(&frame[7..17], &[0x32, 0x01, 0, 0, 0, 7, 0, 14, 0, 0]);
        let params = &frame[17..];
        assert_eq!(params[0], FN_READ_VAR);
        assert_eq!(u16::from_be_bytes([params[6], params[7]]), 29);
        assert_eq!(u16::from_be_bytes([params[8], params[9]]), 32);
        assert_eq!(params[10], AREA_DATA_BLOCK);
        // byte 4 -> bit address 32
        assert_eq!(&params[11..14], &[0x00, 0x00, 0x20]);
    }

    #[test]
    fn test_outputs_area_uses_db_zero() {
        let frame = read_request(1, Area::Outputs, 3, 2);
        let params = &frame[17..];
        assert_eq!(u16::from_be_bytes([params[8], params[9]]), 0);
        assert_eq!(params[10], AREA_OUTPUTS);
    }

    #[test]
    fn test_write_request_carries_bit_length() {
        let frame = write_request(2, Area::DataBlock(1), 0, &[0xAB, 0xCD]);
        let data = &frame[frame.len() - 6..];
        assert_eq!(data, &[0x00, DATA_TS_BYTE_WORD_DWORD, 0x00, 0x10, 0xAB, 0xCD]);
    }

    #[test]
    fn test_parse_read_response_success() {
        let payload = ack(5, &[FN_READ_VAR, 1], &[0xFF, 0x04, 0x00, 0x20, 0, 0, 0x04, 0xD2]);
        let bytes = parse_read_response(&payload, 5, Area::DataBlock(1), 4).unwrap();
        assert_eq!(bytes, vec![0, 0, 0x04, 0xD2]);
    }

    #[test]
    fn test_parse_read_response_item_error() {
        let payload = ack(5, &[FN_READ_VAR, 1], &[0x0A, 0x00, 0x00, 0x00]);
        let err = parse_read_response(&payload, 5, Area::DataBlock(99), 4).unwrap_err();
        match err {
            TransportError::ItemError { code, area, .. } => {
                assert_eq!(code, 0x0A);
                assert_eq!(area, "DB99");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_ack_rejects_wrong_reference() {
        let payload = ack(9, &[FN_READ_VAR, 1], &[0xFF, 0x04, 0x00, 0x08, 0x01]);
        assert!(parse_read_response(&payload, 8, Area::DataBlock(1), 1).is_err());
    }

    #[test]
    fn test_parse_setup_response() {
        let payload = ack(1, &[FN_SETUP_COMM, 0, 0, 1, 0, 1, 0x00, 0xF0], &[]);
        assert_eq!(parse_setup_response(&payload, 1).unwrap(), 240);
    }

    /// Minimal controller: accepts CR, setup, then serves reads from `memory`
    async fn serve_once(listener: TcpListener, memory: Vec<u8>, pdu: u16) {
        let (mut socket, _) = listener.accept().await.unwrap();
        loop {
            let mut header = [0u8; 4];
            if socket.read_exact(&mut header).await.is_err() {
                return;
            }
            let len = u16::from_be_bytes([header[2], header[3]]) as usize;
            let mut body = vec![0u8; len - 4];
            socket.read_exact(&mut body).await.unwrap();

            let reply = if body[1] == COTP_CR {
                let mut cc = body.clone();
                cc[1] = COTP_CC;
                cc
            } else {
                let s7 = &body[3..];
                let pdu_ref = u16::from_be_bytes([s7[4], s7[5]]);
                let params = &s7[10..];
                match params[0] {
                    FN_SETUP_COMM => {
                        let mut p = params[..8].to_vec();
                        p[6..8].copy_from_slice(&pdu.to_be_bytes());
                        ack(pdu_ref, &p, &[])
                    },
                    FN_READ_VAR => {
                        let count = u16::from_be_bytes([params[6], params[7]]) as usize;
                        let addr = ((params[11] as usize) << 16
                            | (params[12] as usize) << 8
                            | params[13] as usize)
                            >> 3;
                        let mut data = vec![0xFF, DATA_TS_BYTE_WORD_DWORD];
                        data.extend_from_slice(&((count * 8) as u16).to_be_bytes());
                        data.extend_from_slice(&memory[addr..addr + count]);
                        ack(pdu_ref, &[FN_READ_VAR, 1], &data)
                    },
                    _ => return,
                }
            };
            socket.write_all(&tpkt(&reply)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_read_is_chunked_by_negotiated_pdu() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let memory: Vec<u8> = (0..200u16).map(|v| v as u8).collect();
        let server = tokio::spawn(serve_once(listener, memory.clone(), 64));

        let mut client = S7Client::new(S7Settings {
            host: "127.0.0.1".into(),
            port,
            ..S7Settings::default()
        });
        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.pdu_size(), 64);

        // 64 - 18 = 46 byte chunks: 182 bytes need 4 round trips
        let bytes = client.read_area(Area::DataBlock(1), 0, 182).await.unwrap();
        assert_eq!(bytes, memory[..182].to_vec());

        client.disconnect().await;
        assert!(!client.is_connected());
        server.abort();
    }

    #[tokio::test]
    async fn test_connect_refused_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = S7Client::new(S7Settings {
            host: "127.0.0.1".into(),
            port,
            connect_timeout: Duration::from_millis(500),
            ..S7Settings::default()
        });
        let err = client.connect().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Io(_) | TransportError::Timeout { .. }
        ));
        assert!(!client.is_connected());
    }
}
