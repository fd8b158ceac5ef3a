//! Duplex I/O engine.
//!
//! Owns one open transport: a background reader thread frames inbound
//! bytes, classifies them as command responses or events, and either fills
//! the single-slot response channel or hands events to the configured sink.
//! Outbound commands are written from the caller's thread; the command lock
//! held by the facade guarantees at most one command is in flight, so one
//! bounded(1) channel with one arming flag is the whole response path.
//!
//! The reader never raises into user code. Stray bytes, undecodable frames
//! and unexpected responses are logged and dropped; command-level failures
//! surface synchronously from [`Engine::send_command`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, error, trace, warn};

use crate::api::ApiRegistry;
use crate::codec::{self, FrameHeader, MessageKind};
use crate::constants::{ENGINE_READ_TIMEOUT, ENGINE_WRITE_TIMEOUT};
use crate::error::{BgError, TransportError};
use crate::message::{BgCommand, BgEvent, BgResponse};
use crate::transport::{Transport, read_exact};

/// Where the reader delivers unsolicited events.
pub enum EventSink {
    /// Push onto an unbounded queue the application drains.
    Queue(Sender<BgEvent>),
    /// Invoke a callback on the reader thread.
    Handler(Arc<dyn Fn(BgEvent) + Send + Sync>),
}

pub struct Engine {
    transport: Arc<dyn Transport>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    awaiting: Arc<AtomicBool>,
    response_rx: Receiver<BgResponse>,
}

impl Engine {
    /// Take ownership of an already-open transport and spawn the reader.
    pub fn start(
        transport: Arc<dyn Transport>,
        registry: Arc<ApiRegistry>,
        sink: EventSink,
    ) -> Result<Self, BgError> {
        transport.set_read_timeout(Some(ENGINE_READ_TIMEOUT))?;
        transport.set_write_timeout(Some(ENGINE_WRITE_TIMEOUT))?;

        let stop = Arc::new(AtomicBool::new(false));
        let awaiting = Arc::new(AtomicBool::new(false));
        let (response_tx, response_rx) = bounded(1);

        let reader = thread::spawn({
            let transport = transport.clone();
            let stop = stop.clone();
            let awaiting = awaiting.clone();
            move || run_reader(transport, registry, stop, awaiting, response_tx, sink)
        });

        Ok(Engine {
            transport,
            stop,
            reader: Some(reader),
            awaiting,
            response_rx,
        })
    }

    /// Signal the reader and wait for it; the stop flag is observed within
    /// one read-timeout period.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }

    /// Write one serialized command and, unless the command is declared
    /// `no_return`, wait for its response.
    ///
    /// A response whose identity differs from the outgoing command fails
    /// with [`BgError::WrongResponse`]; a matching response with a non-zero
    /// errorcode return fails with [`BgError::CommandFailed`] carrying the
    /// full response.
    pub fn send_command(
        &self,
        command: &BgCommand,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<Option<BgResponse>, BgError> {
        let wants_response = !command.no_response();
        if wants_response {
            // Drop anything a previous command left behind before arming
            while self.response_rx.try_recv().is_ok() {}
            self.awaiting.store(true, Ordering::SeqCst);
        }

        trace!("TX [{} bytes]: {:02x?}", frame.len(), frame);
        if let Err(e) = self.transport.write(frame) {
            self.awaiting.store(false, Ordering::SeqCst);
            return Err(match e {
                TransportError::Timeout => BgError::SendTimeout,
                other => other.into(),
            });
        }
        if !wants_response {
            return Ok(None);
        }

        let received = self.response_rx.recv_timeout(timeout);
        // A response arriving past this point is stray and gets dropped
        self.awaiting.store(false, Ordering::SeqCst);
        let response = received.map_err(|_| BgError::NoResponse(timeout))?;

        if response.message().identity() != command.message().identity() {
            return Err(BgError::WrongResponse {
                expected: command.message().qualified("rsp"),
                received: response.message().qualified("rsp"),
            });
        }
        let failure = response
            .errorcode()
            .filter(|(_, errorcode)| *errorcode != 0)
            .map(|(field, errorcode)| (field.to_owned(), errorcode));
        if let Some((field, errorcode)) = failure {
            return Err(BgError::CommandFailed {
                response,
                field,
                errorcode,
            });
        }
        Ok(Some(response))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_reader(
    transport: Arc<dyn Transport>,
    registry: Arc<ApiRegistry>,
    stop: Arc<AtomicBool>,
    awaiting: Arc<AtomicBool>,
    responses: Sender<BgResponse>,
    sink: EventSink,
) {
    while !stop.load(Ordering::SeqCst) {
        // First header byte, or nothing within one poll period
        let first = match read_exact(transport.as_ref(), &stop, 1) {
            Ok(Some(first)) => first,
            Ok(None) => continue,
            Err(e) => {
                error!("engine reader terminated: {}", e);
                return;
            }
        };

        // Resynchronization heuristic: a byte whose device-id field matches
        // no loaded API cannot start a frame, so drop it and keep scanning.
        let device_id = FrameHeader::device_id_of(first[0]);
        if !registry.contains_id(device_id) {
            trace!("discarding stray byte {:#04x}", first[0]);
            continue;
        }

        let rest = match read_exact(transport.as_ref(), &stop, 3) {
            Ok(Some(rest)) => rest,
            Ok(None) => continue,
            Err(e) => {
                error!("engine reader terminated: {}", e);
                return;
            }
        };
        let header = [first[0], rest[0], rest[1], rest[2]];

        let payload_len = FrameHeader::from_bytes(header).payload_len() as usize;
        let payload = match read_exact(transport.as_ref(), &stop, payload_len) {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(e) => {
                error!("engine reader terminated: {}", e);
                return;
            }
        };
        trace!("RX [{} bytes]: {:02x?} {:02x?}", header.len() + payload.len(), header, payload);

        let decoded = match codec::decode(&registry, header, &payload, false, true) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("dropping undecodable frame: {}", e);
                continue;
            }
        };
        match decoded.header.kind {
            MessageKind::Command => {
                let response = BgResponse::new(decoded.message, decoded.values, decoded.warnings);
                if awaiting.load(Ordering::SeqCst) {
                    if let Err(e) = responses.try_send(response) {
                        warn!("response slot unavailable: {}", e);
                    }
                } else {
                    // A late answer to a command that already timed out
                    warn!("received unexpected response '{}'", response);
                }
            }
            MessageKind::Event => {
                let event = BgEvent::new(decoded.message, decoded.values, decoded.warnings);
                debug!("< {}", event);
                match &sink {
                    EventSink::Queue(queue) => {
                        if queue.send(event).is_err() {
                            warn!("event queue disconnected");
                        }
                    }
                    EventSink::Handler(handler) => handler(event),
                }
            }
        }
    }
}
