//! Decoded command, response and event messages.
//!
//! A message is a pair of (descriptor, ordered value vector). The descriptor
//! is a [`MessageRef`] pointing into the immutable API dictionary, so field
//! names, validators and the errorcode convention are resolved by lookup
//! rather than by materializing per-command record types.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::api::{ApiClass, Command, DeviceApi, Event, Param};
use crate::codec::{DecodeWarning, MessageKind};
use crate::value::Value;

/// Reference to one command or event descriptor of a loaded device API.
#[derive(Debug, Clone)]
pub struct MessageRef {
    api: Arc<DeviceApi>,
    class_pos: usize,
    kind: MessageKind,
    msg_pos: usize,
}

impl MessageRef {
    pub fn for_command(api: Arc<DeviceApi>, class_name: &str, command_name: &str) -> Option<Self> {
        let class_pos = api.class_position_by_name(class_name)?;
        let msg_pos = api.classes()[class_pos].command_position_by_name(command_name)?;
        Some(MessageRef {
            api,
            class_pos,
            kind: MessageKind::Command,
            msg_pos,
        })
    }

    pub fn for_event(api: Arc<DeviceApi>, class_name: &str, event_name: &str) -> Option<Self> {
        let class_pos = api.class_position_by_name(class_name)?;
        let msg_pos = api.classes()[class_pos].event_position_by_name(event_name)?;
        Some(MessageRef {
            api,
            class_pos,
            kind: MessageKind::Event,
            msg_pos,
        })
    }

    pub(crate) fn from_wire(api: Arc<DeviceApi>, kind: MessageKind, class_id: u8, message_id: u8) -> Option<Self> {
        let class_pos = api.class_position(class_id)?;
        let class = &api.classes()[class_pos];
        let msg_pos = match kind {
            MessageKind::Command => class.command_position(message_id)?,
            MessageKind::Event => class.event_position(message_id)?,
        };
        Some(MessageRef {
            api,
            class_pos,
            kind,
            msg_pos,
        })
    }

    pub fn api(&self) -> &DeviceApi {
        &self.api
    }

    pub fn class(&self) -> &ApiClass {
        &self.api.classes()[self.class_pos]
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn command(&self) -> Option<&Command> {
        match self.kind {
            MessageKind::Command => Some(&self.class().commands()[self.msg_pos]),
            MessageKind::Event => None,
        }
    }

    pub fn event(&self) -> Option<&Event> {
        match self.kind {
            MessageKind::Event => Some(&self.class().events()[self.msg_pos]),
            MessageKind::Command => None,
        }
    }

    pub fn name(&self) -> &str {
        match self.kind {
            MessageKind::Command => &self.class().commands()[self.msg_pos].name,
            MessageKind::Event => &self.class().events()[self.msg_pos].name,
        }
    }

    pub fn params(&self) -> &[Param] {
        match self.kind {
            MessageKind::Command => &self.class().commands()[self.msg_pos].params,
            MessageKind::Event => &self.class().events()[self.msg_pos].params,
        }
    }

    pub fn returns(&self) -> &[Param] {
        self.command().map(|c| c.returns.as_slice()).unwrap_or_default()
    }

    pub fn no_return(&self) -> bool {
        self.command().is_some_and(|c| c.no_return)
    }

    /// Wire identity: (device id, kind, class index, command/event index).
    pub fn identity(&self) -> (u8, MessageKind, u8, u8) {
        let index = match self.kind {
            MessageKind::Command => self.class().commands()[self.msg_pos].index,
            MessageKind::Event => self.class().events()[self.msg_pos].index,
        };
        (self.api.device_id, self.kind, self.class().index, index)
    }

    /// Log-friendly qualified name, e.g. `bt_rsp_system_hello`.
    pub(crate) fn qualified(&self, direction: &str) -> String {
        format!(
            "{}_{}_{}_{}",
            self.api.device_name,
            direction,
            self.class().name,
            self.name()
        )
    }
}

fn write_fields(f: &mut fmt::Formatter<'_>, params: &[Param], values: &[Value]) -> fmt::Result {
    for (i, (param, value)) in params.iter().zip(values.iter()).enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}={}", param.name, value)?;
    }
    Ok(())
}

/// An outbound command invocation: descriptor plus the caller's arguments.
#[derive(Debug, Clone)]
pub struct BgCommand {
    msg: MessageRef,
    values: Vec<Value>,
    timestamp: DateTime<Utc>,
}

impl BgCommand {
    pub fn new(msg: MessageRef, values: Vec<Value>) -> Self {
        BgCommand {
            msg,
            values,
            timestamp: Utc::now(),
        }
    }

    pub fn message(&self) -> &MessageRef {
        &self.msg
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.msg
            .params()
            .iter()
            .position(|p| p.name == name)
            .and_then(|i| self.values.get(i))
    }

    pub fn no_response(&self) -> bool {
        self.msg.no_return()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl fmt::Display for BgCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.msg.qualified("cmd"))?;
        write_fields(f, self.msg.params(), &self.values)?;
        write!(f, ")")
    }
}

/// A decoded command response. Values follow the command's return-parameter
/// order.
#[derive(Debug, Clone)]
pub struct BgResponse {
    msg: MessageRef,
    values: Vec<Value>,
    warnings: Vec<DecodeWarning>,
    timestamp: DateTime<Utc>,
}

impl BgResponse {
    pub(crate) fn new(msg: MessageRef, values: Vec<Value>, warnings: Vec<DecodeWarning>) -> Self {
        BgResponse {
            msg,
            values,
            warnings,
            timestamp: Utc::now(),
        }
    }

    pub fn message(&self) -> &MessageRef {
        &self.msg
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.msg
            .returns()
            .iter()
            .position(|p| p.name == name)
            .and_then(|i| self.values.get(i))
    }

    pub fn warnings(&self) -> &[DecodeWarning] {
        &self.warnings
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The response's errorcode field, if its command declares one: the
    /// return parameter whose datatype is named `errorcode`.
    pub fn errorcode(&self) -> Option<(&str, u64)> {
        for (param, value) in self.msg.returns().iter().zip(self.values.iter()) {
            if param.datatype.as_ref().is_some_and(|d| d.name == "errorcode") {
                let code = value.as_number()?;
                return Some((param.name.as_str(), code as u64));
            }
        }
        None
    }
}

impl fmt::Display for BgResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.msg.qualified("rsp"))?;
        write_fields(f, self.msg.returns(), &self.values)?;
        write!(f, ")")
    }
}

/// A decoded unsolicited event.
#[derive(Debug, Clone)]
pub struct BgEvent {
    msg: MessageRef,
    values: Vec<Value>,
    warnings: Vec<DecodeWarning>,
    timestamp: DateTime<Utc>,
}

impl BgEvent {
    pub(crate) fn new(msg: MessageRef, values: Vec<Value>, warnings: Vec<DecodeWarning>) -> Self {
        BgEvent {
            msg,
            values,
            warnings,
            timestamp: Utc::now(),
        }
    }

    pub fn message(&self) -> &MessageRef {
        &self.msg
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.msg
            .params()
            .iter()
            .position(|p| p.name == name)
            .and_then(|i| self.values.get(i))
    }

    pub fn warnings(&self) -> &[DecodeWarning] {
        &self.warnings
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// True when this event is `class_name.event_name` of the given device.
    pub fn is(&self, device: &str, class_name: &str, event_name: &str) -> bool {
        self.msg.api().device_name == device && self.msg.class().name == class_name && self.msg.name() == event_name
    }
}

impl fmt::Display for BgEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.msg.qualified("evt"))?;
        write_fields(f, self.msg.params(), &self.values)?;
        write!(f, ")")
    }
}
