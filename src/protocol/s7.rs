//! S7 transport over ISO-on-TCP (TPKT + COTP).
//!
//! Only the data-block area is addressed: read-var and write-var with a
//! single item per request. Reads larger than the negotiated PDU are split
//! into several requests; writes are never split.

use super::{check_span, ProtocolError, Transport};
use crate::config::PlcConfig;

use async_trait::async_trait;
use socket2::SockRef;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const TPKT_VERSION: u8 = 0x03;
const TPKT_HEADER_LEN: usize = 4;

const COTP_CONNECT_REQUEST: u8 = 0xE0;
const COTP_CONNECT_CONFIRM: u8 = 0xD0;
const COTP_DATA: u8 = 0xF0;
const COTP_DATA_HEADER: [u8; 3] = [0x02, COTP_DATA, 0x80];

const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK: u8 = 0x02;
const ROSCTR_ACK_DATA: u8 = 0x03;

const FN_SETUP: u8 = 0xF0;
const FN_READ: u8 = 0x04;
const FN_WRITE: u8 = 0x05;

const AREA_DB: u8 = 0x84;
const TRANSPORT_BYTE: u8 = 0x02;
const DATA_BYTE_BITS: u8 = 0x04;
const ITEM_OK: u8 = 0xFF;

/// S7 header, parameters and data-item header around a read payload.
const READ_OVERHEAD: usize = 18;
/// Same for a write request.
const WRITE_OVERHEAD: usize = 35;

/// A connection to one S7 controller.
pub struct S7Transport {
    endpoint: String,
    rack: u8,
    slot: u8,
    timeout: Duration,
    requested_pdu: u16,
    link: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    pdu_size: AtomicU16,
    pdu_ref: AtomicU16,
}

impl S7Transport {
    /// `address` may carry an explicit port; otherwise the configured S7 port is used.
    pub fn new(address: &str, rack: u8, slot: u8, config: &PlcConfig) -> Self {
        let endpoint = if address.contains(':') {
            address.to_string()
        } else {
            format!("{}:{}", address, config.s7_port)
        };

        Self {
            endpoint,
            rack,
            slot,
            timeout: config.connect_timeout,
            requested_pdu: config.pdu_size,
            link: Mutex::new(None),
            connected: AtomicBool::new(false),
            pdu_size: AtomicU16::new(config.pdu_size),
            pdu_ref: AtomicU16::new(rand::random()),
        }
    }

    /// PDU size agreed with the controller during setup.
    pub fn pdu_size(&self) -> usize {
        self.pdu_size.load(Ordering::Relaxed) as usize
    }

    fn next_ref(&self) -> u16 {
        self.pdu_ref.fetch_add(1, Ordering::Relaxed)
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<u16, ProtocolError> {
        let reply = round_trip(stream, &connection_request(self.rack, self.slot)).await?;
        check_connection_confirm(&reply)?;

        let pdu_ref = self.next_ref();
        let reply = round_trip(stream, &setup_request(pdu_ref, self.requested_pdu)).await?;
        let ack = parse_ack(&reply, pdu_ref)?;
        parse_setup(ack.params)
    }

    async fn exchange(&self, stream: &mut TcpStream, request: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        tokio::time::timeout(self.timeout, round_trip(stream, request))
            .await
            .map_err(|_| ProtocolError::Timeout(self.timeout))?
    }

    async fn read_chunks(
        &self,
        stream: &mut TcpStream,
        db: u16,
        start: u32,
        len: usize,
    ) -> Result<Vec<u8>, ProtocolError> {
        let max_chunk = self.pdu_size().saturating_sub(READ_OVERHEAD).max(1);
        let mut out = Vec::with_capacity(len);

        while out.len() < len {
            let n = (len - out.len()).min(max_chunk);
            let offset = start + out.len() as u32;
            let pdu_ref = self.next_ref();

            let request = read_request(pdu_ref, db, offset, n)?;
            let reply = self.exchange(stream, &request).await?;
            let ack = parse_ack(&reply, pdu_ref)?;
            let data = parse_read_item(ack.data)?;
            if data.len() != n {
                return Err(ProtocolError::MalformedResponse(format!(
                    "asked for {} bytes at DB{}.DBB{}, got {}",
                    n,
                    db,
                    offset,
                    data.len()
                )));
            }
            out.extend_from_slice(data);
        }

        Ok(out)
    }

    fn drop_link(&self, link: &mut Option<TcpStream>, err: &ProtocolError) {
        if err.is_link_failure() && link.take().is_some() {
            self.connected.store(false, Ordering::SeqCst);
            tracing::warn!("S7 link to {} dropped: {}", self.endpoint, err);
        }
    }
}

#[async_trait]
impl Transport for S7Transport {
    async fn connect(&self) -> Result<(), ProtocolError> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            return Ok(());
        }

        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| ProtocolError::Timeout(self.timeout))??;
        stream.set_nodelay(true)?;
        SockRef::from(&stream).set_keepalive(true)?;

        let negotiated = tokio::time::timeout(self.timeout, self.handshake(&mut stream))
            .await
            .map_err(|_| ProtocolError::Timeout(self.timeout))??;
        let pdu = negotiated.min(self.requested_pdu);
        if (pdu as usize) <= WRITE_OVERHEAD {
            return Err(ProtocolError::MalformedResponse(format!(
                "negotiated PDU of {} bytes is too small",
                pdu
            )));
        }

        self.pdu_size.store(pdu, Ordering::Relaxed);
        *link = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!("S7 link to {} established (PDU {})", self.endpoint, pdu);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        if let Some(mut stream) = link.take() {
            let _ = stream.shutdown().await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read(&self, db: u16, start: u32, len: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut link = self.link.lock().await;
        let Some(stream) = link.as_mut() else {
            return Err(ProtocolError::NotConnected);
        };

        let result = self.read_chunks(stream, db, start, len).await;
        if let Err(e) = &result {
            self.drop_link(&mut link, e);
        }
        result
    }

    async fn write(&self, db: u16, start: u32, data: &[u8]) -> Result<(), ProtocolError> {
        let limit = self.pdu_size().saturating_sub(WRITE_OVERHEAD);
        if data.len() > limit {
            return Err(ProtocolError::TooLarge {
                size: data.len(),
                limit,
            });
        }

        let mut link = self.link.lock().await;
        let Some(stream) = link.as_mut() else {
            return Err(ProtocolError::NotConnected);
        };

        let pdu_ref = self.next_ref();
        let request = write_request(pdu_ref, db, start, data)?;
        let result = match self.exchange(stream, &request).await {
            Ok(reply) => parse_ack(&reply, pdu_ref).and_then(|ack| parse_write_item(ack.data)),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.drop_link(&mut link, e);
        }
        result
    }

    /// Detects a peer that closed the socket without waiting on a request.
    async fn probe(&self) -> Result<(), ProtocolError> {
        let mut link = self.link.lock().await;
        let Some(stream) = link.as_mut() else {
            return Err(ProtocolError::NotConnected);
        };

        let mut buf = [0u8; 1];
        let err = match tokio::time::timeout(Duration::ZERO, stream.peek(&mut buf)).await {
            // nothing pending: the link is idle and open
            Err(_) => return Ok(()),
            Ok(Ok(0)) => ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "controller closed the connection",
            )),
            Ok(Ok(_)) => ProtocolError::MalformedResponse("unsolicited data on idle link".to_string()),
            Ok(Err(e)) => ProtocolError::Io(e),
        };
        self.drop_link(&mut link, &err);
        Err(err)
    }
}

// --- Framing ---

/// Wrap a payload in a TPKT header.
pub(crate) fn tpkt(payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + TPKT_HEADER_LEN) as u16;
    let mut frame = Vec::with_capacity(len as usize);
    frame.extend_from_slice(&[TPKT_VERSION, 0x00]);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// COTP connection request; the remote TSAP encodes rack and slot.
pub(crate) fn connection_request(rack: u8, slot: u8) -> Vec<u8> {
    tpkt(&[
        0x11, // length of the rest of the COTP header
        COTP_CONNECT_REQUEST,
        0x00, 0x00, // destination reference
        0x00, 0x01, // source reference
        0x00, // class 0
        0xC0, 0x01, 0x0A, // TPDU size 1024
        0xC1, 0x02, 0x01, 0x00, // local TSAP
        0xC2, 0x02, 0x01, (rack << 5) | (slot & 0x1F), // remote TSAP
    ])
}

fn job_header(pdu_ref: u16, param_len: u16, data_len: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&COTP_DATA_HEADER);
    out.extend_from_slice(&[S7_PROTOCOL_ID, ROSCTR_JOB, 0x00, 0x00]);
    out.extend_from_slice(&pdu_ref.to_be_bytes());
    out.extend_from_slice(&param_len.to_be_bytes());
    out.extend_from_slice(&data_len.to_be_bytes());
    out
}

fn db_item(db: u16, start: u32, len: usize) -> Result<[u8; 12], ProtocolError> {
    check_span(db, start, len)?;
    let len = u16::try_from(len)
        .map_err(|_| ProtocolError::TooLarge { size: len, limit: u16::MAX as usize })?;
    let bit_addr = start * 8;
    Ok([
        0x12, 0x0A, 0x10, // variable specification, any-pointer syntax
        TRANSPORT_BYTE,
        (len >> 8) as u8,
        len as u8,
        (db >> 8) as u8,
        db as u8,
        AREA_DB,
        (bit_addr >> 16) as u8,
        (bit_addr >> 8) as u8,
        bit_addr as u8,
    ])
}

pub(crate) fn setup_request(pdu_ref: u16, pdu_size: u16) -> Vec<u8> {
    let mut payload = job_header(pdu_ref, 8, 0);
    payload.extend_from_slice(&[FN_SETUP, 0x00, 0x00, 0x01, 0x00, 0x01]);
    payload.extend_from_slice(&pdu_size.to_be_bytes());
    tpkt(&payload)
}

pub(crate) fn read_request(pdu_ref: u16, db: u16, start: u32, len: usize) -> Result<Vec<u8>, ProtocolError> {
    let item = db_item(db, start, len)?;
    let mut payload = job_header(pdu_ref, 14, 0);
    payload.extend_from_slice(&[FN_READ, 0x01]);
    payload.extend_from_slice(&item);
    Ok(tpkt(&payload))
}

pub(crate) fn write_request(pdu_ref: u16, db: u16, start: u32, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let item = db_item(db, start, data.len())?;
    let mut payload = job_header(pdu_ref, 14, (data.len() + 4) as u16);
    payload.extend_from_slice(&[FN_WRITE, 0x01]);
    payload.extend_from_slice(&item);
    payload.extend_from_slice(&[0x00, DATA_BYTE_BITS]);
    payload.extend_from_slice(&((data.len() * 8) as u16).to_be_bytes());
    payload.extend_from_slice(data);
    Ok(tpkt(&payload))
}

/// Read one TPKT frame and return its payload.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut header = [0u8; TPKT_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    if header[0] != TPKT_VERSION {
        return Err(ProtocolError::MalformedResponse(format!(
            "unexpected TPKT version 0x{:02X}",
            header[0]
        )));
    }
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    if len < TPKT_HEADER_LEN + 2 {
        return Err(ProtocolError::MalformedResponse(format!("TPKT length {} too short", len)));
    }
    let mut payload = vec![0u8; len - TPKT_HEADER_LEN];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn round_trip<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    request: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    stream.write_all(request).await?;
    read_frame(stream).await
}

fn check_connection_confirm(payload: &[u8]) -> Result<(), ProtocolError> {
    match payload.get(1) {
        Some(&COTP_CONNECT_CONFIRM) => Ok(()),
        Some(other) => Err(ProtocolError::Rejected(format!(
            "connection refused (COTP 0x{:02X}); check rack and slot",
            other
        ))),
        None => Err(ProtocolError::MalformedResponse("empty COTP reply".to_string())),
    }
}

/// Parameter and data sections of an acknowledgement.
pub(crate) struct Ack<'a> {
    pub params: &'a [u8],
    pub data: &'a [u8],
}

pub(crate) fn parse_ack(payload: &[u8], expected_ref: u16) -> Result<Ack<'_>, ProtocolError> {
    let malformed = |what: &str| ProtocolError::MalformedResponse(what.to_string());

    let cotp_len = *payload.first().ok_or_else(|| malformed("empty frame"))? as usize;
    if payload.len() <= cotp_len || payload.get(1) != Some(&COTP_DATA) {
        return Err(malformed("expected COTP data frame"));
    }

    let s7 = &payload[cotp_len + 1..];
    if s7.len() < 12 || s7[0] != S7_PROTOCOL_ID {
        return Err(malformed("missing S7 header"));
    }
    if s7[1] != ROSCTR_ACK && s7[1] != ROSCTR_ACK_DATA {
        return Err(ProtocolError::MalformedResponse(format!(
            "unexpected S7 message type 0x{:02X}",
            s7[1]
        )));
    }

    let pdu_ref = u16::from_be_bytes([s7[4], s7[5]]);
    if pdu_ref != expected_ref {
        return Err(ProtocolError::MalformedResponse(format!(
            "reply for request {} while waiting for {}",
            pdu_ref, expected_ref
        )));
    }

    let (class, code) = (s7[10], s7[11]);
    if class != 0 || code != 0 {
        return Err(ProtocolError::Rejected(format!(
            "error class 0x{:02X} code 0x{:02X}",
            class, code
        )));
    }

    let param_len = u16::from_be_bytes([s7[6], s7[7]]) as usize;
    let data_len = u16::from_be_bytes([s7[8], s7[9]]) as usize;
    if s7.len() < 12 + param_len + data_len {
        return Err(malformed("S7 reply shorter than its header claims"));
    }

    Ok(Ack {
        params: &s7[12..12 + param_len],
        data: &s7[12 + param_len..12 + param_len + data_len],
    })
}

fn parse_setup(params: &[u8]) -> Result<u16, ProtocolError> {
    match params {
        [FN_SETUP, _, _, _, _, _, hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(ProtocolError::MalformedResponse(
            "bad setup-communication reply".to_string(),
        )),
    }
}

fn parse_read_item(data: &[u8]) -> Result<&[u8], ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::MalformedResponse("read item truncated".to_string()));
    }
    if data[0] != ITEM_OK {
        return Err(ProtocolError::Rejected(item_error(data[0]).to_string()));
    }
    let raw_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    // bit, byte and int transport sizes report their length in bits
    let len = match data[1] {
        0x03..=0x05 => raw_len.div_ceil(8),
        _ => raw_len,
    };
    data.get(4..4 + len)
        .ok_or_else(|| ProtocolError::MalformedResponse("read item shorter than declared".to_string()))
}

fn parse_write_item(data: &[u8]) -> Result<(), ProtocolError> {
    match data.first() {
        Some(&ITEM_OK) => Ok(()),
        Some(code) => Err(ProtocolError::Rejected(item_error(*code).to_string())),
        None => Err(ProtocolError::MalformedResponse("write reply has no item".to_string())),
    }
}

fn item_error(code: u8) -> &'static str {
    match code {
        0x01 => "hardware fault",
        0x03 => "access denied",
        0x05 => "address out of range",
        0x06 => "data type not supported",
        0x07 => "data type inconsistent",
        0x0A => "object does not exist",
        _ => "unknown item error",
    }
}
