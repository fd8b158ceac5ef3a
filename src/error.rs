use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::message::BgResponse;

/// Errors raised by a [`Transport`](crate::transport::Transport) implementation.
///
/// Timeouts are a distinct kind so callers can poll with short read timeouts
/// without treating an idle line as a failure.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,

    #[error("transport is closed")]
    Closed,

    #[error("payload of {0} bytes exceeds the reliable frame limit")]
    PacketTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The primary error type of the `bgapi` crate.
#[derive(Error, Debug)]
pub enum BgError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("send timeout while writing command")]
    SendTimeout,

    #[error("no response received within {0:?}")]
    NoResponse(Duration),

    #[error("wrong response: expected {expected}, received {received}")]
    WrongResponse { expected: String, received: String },

    #[error("command returned '{field}' parameter with non-zero errorcode: {errorcode:#x}")]
    CommandFailed {
        response: BgResponse,
        field: String,
        errorcode: u64,
    },

    #[error("no API definition for device id {0}")]
    UnknownDevice(u8),

    #[error("no event definition with index {event_id} for class {class_id}")]
    UnknownEvent { class_id: u8, event_id: u8 },

    #[error("no command definition with index {command_id} for class {class_id}")]
    UnknownCommand { class_id: u8, command_id: u8 },

    #[error("payload of {size} bytes exceeds the 2047-byte BGAPI limit")]
    PacketTooLarge { size: usize },

    #[error("expected {expected} arguments, {given} given")]
    ArgumentCount { expected: usize, given: usize },

    #[error("invalid argument for '{param}': {reason}")]
    InvalidArgument { param: String, reason: String },

    #[error("connection is closed")]
    Closed,

    #[error("device '{0}' is not loaded")]
    DeviceNotLoaded(String),

    #[error("class '{class}' is not defined for device '{device}'")]
    ClassNotDefined { device: String, class: String },

    #[error("command '{command}' is not defined in class '{class}'")]
    CommandNotDefined { class: String, command: String },

    #[error("at least one of timeout, max_events or max_time must be given")]
    UnboundedEventQuery,

    #[error("API description error: {0}")]
    ApiDescription(String),

    #[error("failed to parse API XML: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("failed to read API file: {0}")]
    Io(#[from] io::Error),
}
