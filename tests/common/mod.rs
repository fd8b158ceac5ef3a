//! Common test utilities and shared imports

// Shared across multiple test files; not every item is used in every file
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub use bgapi::api::{ApiRegistry, DeviceApi};
pub use bgapi::codec::{DecodeWarning, FrameHeader, decode, encode_command};
pub use bgapi::error::{BgError, TransportError};
pub use bgapi::host::BgHost;
pub use bgapi::value::Value;

pub const TEST_API_XML: &str = include_str!("../fixtures/test_api.xml");

/// Route crate logs into the test harness; `RUST_LOG=bgapi=trace` shows the
/// reader's frame-level decisions.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_api() -> DeviceApi {
    DeviceApi::from_xml(TEST_API_XML).expect("fixture API should parse")
}

pub fn test_registry() -> ApiRegistry {
    ApiRegistry::new([test_api()]).expect("fixture registry should build")
}

pub fn hex_to_bytes(hex_data: &str) -> Vec<u8> {
    hex::decode(hex_data).expect("Failed to decode hex")
}

/// Payload filled with a recognizable incrementing pattern.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

/// Complete command/response frame for `class.command` around `payload`.
pub fn make_command_frame(api: &DeviceApi, class_name: &str, command_name: &str, payload: &[u8]) -> Vec<u8> {
    let class = api.class(class_name).expect("class in fixture");
    let command = class.command(command_name).expect("command in fixture");
    let header = FrameHeader::new()
        .with_event(false)
        .with_device_id(api.device_id)
        .with_payload_len(payload.len() as u16)
        .with_class_id(class.index)
        .with_message_id(command.index);
    let mut frame = header.into_bytes().to_vec();
    frame.extend_from_slice(payload);
    frame
}

/// Complete event frame for `class.event` around `payload`.
pub fn make_event_frame(api: &DeviceApi, class_name: &str, event_name: &str, payload: &[u8]) -> Vec<u8> {
    let class = api.class(class_name).expect("class in fixture");
    let event = class.event(event_name).expect("event in fixture");
    let header = FrameHeader::new()
        .with_event(true)
        .with_device_id(api.device_id)
        .with_payload_len(payload.len() as u16)
        .with_class_id(class.index)
        .with_message_id(event.index);
    let mut frame = header.into_bytes().to_vec();
    frame.extend_from_slice(payload);
    frame
}

enum Step {
    /// The next write must carry exactly these bytes.
    Expect(Vec<u8>),
    /// Bytes served to subsequent reads.
    Feed(VecDeque<u8>),
    /// Delay before later steps become visible, measured from the first
    /// read that encounters it.
    Pause(Duration),
    PauseUntil(Instant),
}

struct ScriptState {
    steps: VecDeque<Step>,
}

/// Scripted in-memory transport.
///
/// Test code enqueues a script of expected writes, fed read bytes and
/// pauses. Reads only see bytes once every earlier step has been consumed,
/// so "device responds after the command went out" ordering is enforced by
/// construction. Clones share the same script, letting tests keep a handle
/// after handing the transport to the host.
#[derive(Clone)]
pub struct ScriptedTransport {
    state: Arc<(Mutex<ScriptState>, Condvar)>,
    read_timeout: Arc<Mutex<Option<Duration>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        ScriptedTransport {
            state: Arc::new((
                Mutex::new(ScriptState { steps: VecDeque::new() }),
                Condvar::new(),
            )),
            // Short default poll so background readers never park forever
            // before the engine configures its own timeout
            read_timeout: Arc::new(Mutex::new(Some(Duration::from_millis(10)))),
        }
    }

    pub fn expect_write(&self, frame: &[u8]) {
        let (lock, cond) = &*self.state;
        lock.lock().unwrap().steps.push_back(Step::Expect(frame.to_vec()));
        cond.notify_all();
    }

    pub fn feed(&self, bytes: &[u8]) {
        let (lock, cond) = &*self.state;
        lock.lock()
            .unwrap()
            .steps
            .push_back(Step::Feed(bytes.iter().copied().collect()));
        cond.notify_all();
    }

    pub fn pause(&self, delay: Duration) {
        let (lock, cond) = &*self.state;
        lock.lock().unwrap().steps.push_back(Step::Pause(delay));
        cond.notify_all();
    }

    /// True once the whole script has been consumed.
    pub fn is_drained(&self) -> bool {
        let (lock, _) = &*self.state;
        lock.lock().unwrap().steps.is_empty()
    }
}

impl bgapi::transport::Transport for ScriptedTransport {
    fn open(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let (lock, cond) = &*self.state;
        let mut state = lock.lock().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match state.steps.front() {
                Some(Step::Expect(_)) => break,
                None => panic!("unexpected write: {:02x?}", data),
                Some(_) => {
                    // A reader must drain earlier feed/pause steps first
                    let now = Instant::now();
                    assert!(now < deadline, "write stalled behind unconsumed read steps");
                    let (guard, _) = cond.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                }
            }
        }
        let Some(Step::Expect(expected)) = state.steps.pop_front() else {
            unreachable!()
        };
        assert_eq!(
            data, &expected[..],
            "write does not match the next expected frame"
        );
        cond.notify_all();
        Ok(())
    }

    fn read(&self, size: usize) -> Result<Vec<u8>, TransportError> {
        let timeout = *self.read_timeout.lock().unwrap();
        let deadline = timeout.map(|t| Instant::now() + t);
        let (lock, cond) = &*self.state;
        let mut state = lock.lock().unwrap();
        let mut out = Vec::new();
        loop {
            // Resolve pauses and serve any leading feed data
            loop {
                let starting_pause = match state.steps.front() {
                    Some(Step::Pause(delay)) => Some(Instant::now() + *delay),
                    _ => None,
                };
                if let Some(until) = starting_pause {
                    state.steps[0] = Step::PauseUntil(until);
                    continue;
                }
                match state.steps.front_mut() {
                    Some(Step::PauseUntil(until)) if Instant::now() >= *until => {
                        state.steps.pop_front();
                        cond.notify_all();
                    }
                    Some(Step::Feed(bytes)) if out.len() < size => {
                        while out.len() < size {
                            match bytes.pop_front() {
                                Some(byte) => out.push(byte),
                                None => break,
                            }
                        }
                        if bytes.is_empty() {
                            state.steps.pop_front();
                            cond.notify_all();
                        }
                    }
                    _ => break,
                }
            }
            if !out.is_empty() {
                // A transport may return fewer bytes than requested
                return Ok(out);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(out);
            }

            // Blocked on an expect step, an unelapsed pause, or an empty
            // script: sleep until something can change
            let pause_until = match state.steps.front() {
                Some(Step::PauseUntil(until)) => Some(*until),
                _ => None,
            };
            let wake = match (pause_until, deadline) {
                (Some(p), Some(d)) => Some(p.min(d)),
                (Some(p), None) => Some(p),
                (None, Some(d)) => Some(d),
                (None, None) => None,
            };
            state = match wake {
                Some(wake) => {
                    let now = Instant::now();
                    if wake <= now {
                        continue;
                    }
                    cond.wait_timeout(state, wake - now).unwrap().0
                }
                None => cond.wait(state).unwrap(),
            };
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        *self.read_timeout.lock().unwrap() = timeout;
        Ok(())
    }

    fn set_write_timeout(&self, _timeout: Option<Duration>) -> Result<(), TransportError> {
        Ok(())
    }
}
