//! Optional reliable framing layer.
//!
//! Wraps any [`Transport`] and implements [`Transport`] itself, so the I/O
//! engine can sit on either. Outbound bytes are packed into frames carrying
//! a preamble, a CRC-4-protected length header and an optional CRC-8 over
//! the payload; a background reader validates inbound frames and feeds the
//! surviving payloads to `read`.
//!
//! Frame shape:
//!
//! ```text
//! byte 0:       preamble = 0x5A
//! byte 1:       payload_len bits 0..7
//! byte 2:       payload_len bits 8..10 | crc_present | header CRC-4
//! bytes 3..:    payload
//! last byte:    payload CRC-8, present iff crc_present
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{error, warn};

use crate::constants::{
    CRC_PRESENT_FLAG, MAX_PAYLOAD_LENGTH, PAYLOAD_LENGTH_MASK, PREAMBLE_BYTE, RELIABLE_HEADER_SIZE,
};
use crate::error::TransportError;
use crate::transport::{Transport, read_exact};

/// CRC-4 with polynomial x⁴+x+1 over the given number of nibbles,
/// high nibble of each byte first. Initialized to 0xA, the CRC of the
/// preamble byte, so the preamble itself stays out of the data.
/// Recomputing across a valid header (including its CRC nibble) yields 0.
pub fn crc4(data: &[u8], nibbles: usize) -> u8 {
    const TABLE: [u8; 16] = [
        0x0, 0x7, 0xe, 0x9, 0x5, 0x2, 0xb, 0xc, 0xa, 0xd, 0x4, 0x3, 0xf, 0x8, 0x1, 0x6,
    ];
    let mut crc = 0xa;
    for i in 0..nibbles {
        let shift = if i % 2 == 0 { 4 } else { 0 };
        let nibble = (data[i / 2] >> shift) & 0x0f;
        crc = TABLE[(crc ^ nibble) as usize];
    }
    crc
}

/// CRC-8 with polynomial x⁸+x²+x+1, processed most-significant-bit first.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u32 = 0;
    for &byte in data {
        crc ^= (byte as u32) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc ^= 0x1070 << 3;
            }
            crc <<= 1;
        }
    }
    (crc >> 8) as u8
}

/// Assemble a complete reliable frame around `data`.
pub fn pack_frame(data: &[u8], append_crc: bool) -> Result<Vec<u8>, TransportError> {
    if data.len() > MAX_PAYLOAD_LENGTH {
        return Err(TransportError::PacketTooLarge(data.len()));
    }
    let mut frame = Vec::with_capacity(RELIABLE_HEADER_SIZE + data.len() + 1);
    frame.push(PREAMBLE_BYTE);
    frame.push(data.len() as u8);
    let mut flags = ((data.len() >> 3) as u8) & PAYLOAD_LENGTH_MASK;
    if append_crc {
        flags |= CRC_PRESENT_FLAG;
    }
    flags |= crc4(&[frame[1], flags], 3);
    frame.push(flags);
    frame.extend_from_slice(data);
    if append_crc {
        frame.push(crc8(data));
    }
    Ok(frame)
}

/// A [`Transport`] adding frame integrity on top of another transport.
///
/// `write` sends one frame per call; `read` returns validated payload bytes,
/// buffering partial payloads across calls. Corrupted inbound data is
/// dropped by the background reader, never surfaced to the consumer.
pub struct ReliableTransport<T: Transport> {
    inner: Arc<T>,
    append_crc: bool,
    stop: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    payload_tx: Sender<Vec<u8>>,
    payload_rx: Receiver<Vec<u8>>,
    buffer: Mutex<Vec<u8>>,
    read_timeout: Mutex<Option<Duration>>,
}

impl<T: Transport + 'static> ReliableTransport<T> {
    pub fn new(inner: T) -> Self {
        let (payload_tx, payload_rx) = unbounded();
        ReliableTransport {
            inner: Arc::new(inner),
            append_crc: true,
            stop: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            payload_tx,
            payload_rx,
            buffer: Mutex::new(Vec::new()),
            read_timeout: Mutex::new(None),
        }
    }

    /// Send frames without the payload CRC-8. The header CRC-4 is always
    /// present.
    pub fn without_payload_crc(mut self) -> Self {
        self.append_crc = false;
        self
    }
}

impl<T: Transport + 'static> Transport for ReliableTransport<T> {
    fn open(&self) -> Result<(), TransportError> {
        let mut reader = self.reader.lock().unwrap();
        if reader.is_some() {
            return Ok(());
        }
        self.inner.open()?;
        self.stop.store(false, Ordering::SeqCst);
        let inner = self.inner.clone();
        let stop = self.stop.clone();
        let payloads = self.payload_tx.clone();
        *reader = Some(thread::spawn(move || run_reader(inner, stop, payloads)));
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        let mut reader = self.reader.lock().unwrap();
        if let Some(handle) = reader.take() {
            self.stop.store(true, Ordering::SeqCst);
            let _ = handle.join();
            self.inner.close()?;
        }
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.inner.write(&pack_frame(data, self.append_crc)?)
    }

    fn read(&self, size: usize) -> Result<Vec<u8>, TransportError> {
        let timeout = *self.read_timeout.lock().unwrap();
        let mut buffer = self.buffer.lock().unwrap();
        while buffer.len() < size {
            let received = match timeout {
                Some(timeout) => self.payload_rx.recv_timeout(timeout).ok(),
                None => self.payload_rx.recv().ok(),
            };
            match received {
                Some(payload) => buffer.extend_from_slice(&payload),
                None => break,
            }
        }
        let size = size.min(buffer.len());
        Ok(buffer.drain(..size).collect())
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        *self.read_timeout.lock().unwrap() = timeout;
        self.inner.set_read_timeout(timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.inner.set_write_timeout(timeout)
    }
}

/// Byte-oriented resynchronizing reader: find a preamble, verify the header
/// CRC, then take the payload and its optional CRC. Anything that fails a
/// check is discarded one byte (bad header) or one frame (bad payload CRC)
/// at a time.
fn run_reader<T: Transport>(conn: Arc<T>, stop: Arc<AtomicBool>, payloads: Sender<Vec<u8>>) {
    let mut header: Vec<u8> = Vec::with_capacity(RELIABLE_HEADER_SIZE);
    while !stop.load(Ordering::SeqCst) {
        let data = match read_exact(conn.as_ref(), &stop, RELIABLE_HEADER_SIZE - header.len()) {
            Ok(Some(data)) => data,
            Ok(None) => continue,
            Err(e) => {
                error!("reliable reader terminated: {}", e);
                return;
            }
        };
        header.extend_from_slice(&data);

        let Some(preamble) = header.iter().position(|&b| b == PREAMBLE_BYTE) else {
            header.clear();
            continue;
        };
        if preamble > 0 {
            header.drain(..preamble);
            continue;
        }
        if crc4(&header[1..], 4) != 0 {
            // The real preamble may be hiding further into the buffer
            header.remove(0);
            continue;
        }

        let payload_len = header[1] as usize | ((header[2] & PAYLOAD_LENGTH_MASK) as usize) << 3;
        let crc_expected = header[2] & CRC_PRESENT_FLAG != 0;
        header.clear();

        let payload = match read_exact(conn.as_ref(), &stop, payload_len) {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(e) => {
                error!("reliable reader terminated: {}", e);
                return;
            }
        };
        if crc_expected {
            let crc = match read_exact(conn.as_ref(), &stop, 1) {
                Ok(Some(crc)) => crc,
                Ok(None) => continue,
                Err(e) => {
                    error!("reliable reader terminated: {}", e);
                    return;
                }
            };
            if crc[0] != crc8(&payload) {
                warn!("dropping frame of {} bytes with invalid payload CRC", payload.len());
                continue;
            }
        }
        if payloads.send(payload).is_err() {
            return;
        }
    }
}
