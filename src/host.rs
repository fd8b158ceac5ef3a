//! Command dispatch facade.
//!
//! [`BgHost`] ties the pieces together: it owns the transport and the loaded
//! API dictionary, runs the engine while open, serializes command traffic
//! through a single command lock, and exposes the event stream either
//! through a polling queue or a registered handler callback.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, warn};

use crate::api::ApiRegistry;
use crate::codec;
use crate::constants::DEFAULT_RESPONSE_TIMEOUT;
use crate::engine::{Engine, EventSink};
use crate::error::BgError;
use crate::message::{BgCommand, BgEvent, BgResponse, MessageRef};
use crate::transport::Transport;
use crate::value::Value;

/// Hook notified with `1` before each command and `0` once its response is
/// in. For `no_return` commands the trailing `0` is skipped, keeping the
/// device awake until the next command completes.
pub type KeepAwakeHook = Box<dyn Fn(u8) + Send + Sync>;

pub struct BgHost {
    transport: Arc<dyn Transport>,
    registry: Arc<ApiRegistry>,
    engine: Mutex<Option<Engine>>,
    command_lock: Mutex<()>,
    keep_awake: Mutex<Option<KeepAwakeHook>>,
    handler: Option<Arc<dyn Fn(BgEvent) + Send + Sync>>,
    event_tx: Sender<BgEvent>,
    event_rx: Receiver<BgEvent>,
    response_timeout: Duration,
    log_id: Option<String>,
}

impl BgHost {
    /// Build a host over a transport and the loaded APIs. The transport is
    /// brought to a known-closed state; call [`open`](Self::open) to start.
    ///
    /// Events go to the polling queue unless a handler is configured with
    /// [`with_event_handler`](Self::with_event_handler).
    pub fn new(transport: impl Transport + 'static, registry: ApiRegistry) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let _ = transport.close();
        let (event_tx, event_rx) = unbounded();
        BgHost {
            transport,
            registry: Arc::new(registry),
            engine: Mutex::new(None),
            command_lock: Mutex::new(()),
            keep_awake: Mutex::new(None),
            handler: None,
            event_tx,
            event_rx,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            log_id: None,
        }
    }

    /// Deliver events to a callback on the reader thread instead of the
    /// polling queue.
    pub fn with_event_handler(mut self, handler: impl Fn(BgEvent) + Send + Sync + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Label prefixed to command/response log lines, useful when several
    /// hosts run in one process.
    pub fn with_log_id(mut self, log_id: impl Into<String>) -> Self {
        self.log_id = Some(log_id.into());
        self
    }

    pub fn registry(&self) -> &ApiRegistry {
        &self.registry
    }

    /// Install or clear the keep-awake hook.
    pub fn set_keep_device_awake(&self, hook: Option<KeepAwakeHook>) {
        *self.keep_awake.lock().unwrap() = hook;
    }

    pub fn is_open(&self) -> bool {
        self.engine.lock().unwrap().is_some()
    }

    /// Open the transport and start the engine. A no-op when already open;
    /// re-opening after [`close`](Self::close) is supported.
    pub fn open(&self) -> Result<(), BgError> {
        let mut engine = self.engine.lock().unwrap();
        if engine.is_some() {
            return Ok(());
        }
        self.transport.open().map_err(BgError::from)?;
        self.fire_keep_awake(0);
        let sink = match &self.handler {
            Some(handler) => EventSink::Handler(handler.clone()),
            None => EventSink::Queue(self.event_tx.clone()),
        };
        match Engine::start(self.transport.clone(), self.registry.clone(), sink) {
            Ok(started) => {
                *engine = Some(started);
                Ok(())
            }
            Err(e) => {
                let _ = self.transport.close();
                Err(e)
            }
        }
    }

    /// Stop the engine and close the transport. Idempotent.
    pub fn close(&self) {
        let mut engine = self.engine.lock().unwrap();
        if let Some(mut running) = engine.take() {
            running.stop();
            if let Err(e) = self.transport.close() {
                warn!("transport close failed: {}", e);
            }
        }
    }

    /// Invoke `device.class.command` with the given ordered arguments.
    ///
    /// Returns `Ok(None)` for `no_return` commands, `Ok(Some(response))`
    /// otherwise. The command lock serializes concurrent callers; the
    /// keep-awake hook fires around the exchange.
    pub fn call(
        &self,
        device: &str,
        class_name: &str,
        command_name: &str,
        args: &[Value],
    ) -> Result<Option<BgResponse>, BgError> {
        let api = self
            .registry
            .by_name(device)
            .ok_or_else(|| BgError::DeviceNotLoaded(device.to_owned()))?;
        let class = api.class(class_name).ok_or_else(|| BgError::ClassNotDefined {
            device: device.to_owned(),
            class: class_name.to_owned(),
        })?;
        let command = class.command(command_name).ok_or_else(|| BgError::CommandNotDefined {
            class: class_name.to_owned(),
            command: command_name.to_owned(),
        })?;
        if !self.is_open() {
            return Err(BgError::Closed);
        }

        let frame = codec::encode_command(api, class, command, args)?;
        let msg = MessageRef::for_command(api.clone(), class_name, command_name).ok_or_else(|| {
            BgError::CommandNotDefined {
                class: class_name.to_owned(),
                command: command_name.to_owned(),
            }
        })?;
        let cmd = BgCommand::new(msg, args.to_vec());
        debug!("{} > {}", self.label(), cmd);

        let guard = self.command_lock.lock().unwrap();
        self.fire_keep_awake(1);
        let result = {
            let engine = self.engine.lock().unwrap();
            match engine.as_ref() {
                Some(engine) => engine.send_command(&cmd, &frame, self.response_timeout),
                None => Err(BgError::Closed),
            }
        };
        if !command.no_return {
            self.fire_keep_awake(0);
        }
        drop(guard);

        match &result {
            Ok(Some(response)) => debug!("{} < {}", self.label(), response),
            Ok(None) => {}
            Err(e) => debug!("{} ! {}", self.label(), e),
        }
        result
    }

    /// Pop one event from the polling queue. `None` as timeout blocks until
    /// an event arrives; with a handler configured the queue stays empty.
    pub fn get_event(&self, timeout: Option<Duration>) -> Option<BgEvent> {
        match timeout {
            Some(timeout) => self.event_rx.recv_timeout(timeout).ok(),
            None => self.event_rx.recv().ok(),
        }
    }

    /// Collect events until one of the bounds is hit. At least one bound
    /// must be finite or the call could never return.
    pub fn get_events(
        &self,
        timeout: Option<Duration>,
        max_events: Option<usize>,
        max_time: Option<Duration>,
    ) -> Result<Vec<BgEvent>, BgError> {
        if timeout.is_none() && max_events.is_none() && max_time.is_none() {
            return Err(BgError::UnboundedEventQuery);
        }
        Ok(self.events(timeout, max_events, max_time).collect())
    }

    /// Lazy event sequence: yields events as they arrive, ending when the
    /// per-event timeout expires, `max_events` have been yielded, or
    /// `max_time` has elapsed overall.
    pub fn events(
        &self,
        timeout: Option<Duration>,
        max_events: Option<usize>,
        max_time: Option<Duration>,
    ) -> EventIter<'_> {
        EventIter {
            host: self,
            timeout,
            remaining: max_events,
            deadline: max_time.map(|t| Instant::now() + t),
        }
    }

    fn fire_keep_awake(&self, keep_awake: u8) {
        if let Some(hook) = self.keep_awake.lock().unwrap().as_ref() {
            hook(keep_awake);
        }
    }

    fn label(&self) -> &str {
        self.log_id.as_deref().unwrap_or("bgapi")
    }
}

impl Drop for BgHost {
    fn drop(&mut self) {
        self.close();
    }
}

/// Iterator returned by [`BgHost::events`].
pub struct EventIter<'a> {
    host: &'a BgHost,
    timeout: Option<Duration>,
    remaining: Option<usize>,
    deadline: Option<Instant>,
}

impl Iterator for EventIter<'_> {
    type Item = BgEvent;

    fn next(&mut self) -> Option<BgEvent> {
        if self.remaining == Some(0) {
            return None;
        }
        let wait = match self.deadline {
            Some(deadline) => {
                let left = deadline.checked_duration_since(Instant::now())?;
                Some(self.timeout.map_or(left, |t| t.min(left)))
            }
            None => self.timeout,
        };
        let event = self.host.get_event(wait)?;
        if let Some(remaining) = &mut self.remaining {
            *remaining -= 1;
        }
        Some(event)
    }
}
