use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::TransportError;

/// A byte-oriented duplex link to the device: a serial line, a TCP or Unix
/// socket, or the reliable framing layer wrapping one of those.
///
/// Methods take `&self`: the engine reads from its background thread while
/// commands are written from caller threads, so implementations are expected
/// to be full-duplex (interior mutability where the underlying handle needs
/// it).
pub trait Transport: Send + Sync {
    fn open(&self) -> Result<(), TransportError>;

    /// Close the link. Must be idempotent and must unblock an in-progress
    /// read.
    fn close(&self) -> Result<(), TransportError>;

    fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Read up to `size` bytes. May return fewer (or none) when the read
    /// timeout expires first; a timeout is not a failure here.
    fn read(&self, size: usize) -> Result<Vec<u8>, TransportError>;

    /// `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError>;

    fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError>;
}

/// Accumulate exactly `size` bytes across short bounded reads, polling the
/// stop flag between them. Returns `Ok(None)` when stopped mid-read; read
/// timeouts just mean another poll round.
pub(crate) fn read_exact<T: Transport + ?Sized>(
    conn: &T,
    stop: &AtomicBool,
    size: usize,
) -> Result<Option<Vec<u8>>, TransportError> {
    let mut data = Vec::with_capacity(size);
    while data.len() < size {
        if stop.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match conn.read(size - data.len()) {
            Ok(chunk) => data.extend_from_slice(&chunk),
            Err(TransportError::Timeout) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Some(data))
}
