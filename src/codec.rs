//! Wire codec: the 4-byte BGAPI frame header, command serialization against
//! the API dictionary, and response/event deserialization.
//!
//! All multi-byte scalars are little-endian. The payload length is an 11-bit
//! field split across the first two header bytes, capping payloads at 2047
//! bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};
use tracing::warn;

use crate::api::{ApiClass, ApiRegistry, Command, DeviceApi, Param, ParamType, ValidatorKind};
use crate::constants::{HEADER_LENGTH, MAX_PAYLOAD_LENGTH};
use crate::error::BgError;
use crate::message::MessageRef;
use crate::value::{Value, parse_number};

/// 4-byte BGAPI frame header.
///
/// The first byte packs the high payload-length bits, the device id and the
/// message-kind bit; byte 1 is the low eight payload-length bits.
#[bitfield(bytes = 4)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub length_high: B3,
    pub device_id: B4,
    pub event: bool,
    pub length_low: u8,
    pub class_id: u8,
    pub message_id: u8,
}

impl FrameHeader {
    pub fn payload_len(&self) -> u16 {
        ((self.length_high() as u16) << 8) | self.length_low() as u16
    }

    /// Callers must keep `len` within the 11-bit field (≤ 2047).
    pub fn with_payload_len(self, len: u16) -> Self {
        self.with_length_high((len >> 8) as u8).with_length_low(len as u8)
    }

    /// Candidate device id of a first header byte, used by the reader to
    /// discard stray bytes before committing to a full header read.
    pub fn device_id_of(first_byte: u8) -> u8 {
        (first_byte & 0x78) >> 3
    }
}

/// Direction-independent message kind carried in the header's top bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    #[num_enum(default)]
    Command = 0,
    Event = 1,
}

/// Header fields of one inbound or outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedHeader {
    pub kind: MessageKind,
    pub device_id: u8,
    pub payload_len: u16,
    pub class_id: u8,
    pub message_id: u8,
}

impl DecodedHeader {
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        let header = FrameHeader::from_bytes(bytes);
        DecodedHeader {
            kind: MessageKind::from_primitive(u8::from(header.event())),
            device_id: header.device_id(),
            payload_len: header.payload_len(),
            class_id: header.class_id(),
            message_id: header.message_id(),
        }
    }
}

/// Annotation attached to a decoded message whose payload did not match the
/// API definition exactly. The reader never rejects such frames; it decodes
/// what is there and records what was off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeWarning {
    /// The payload ended before these parameters; their slots hold
    /// [`Value::Missing`].
    MissingParameters { params: Vec<String> },
    /// The payload carried this many bytes beyond the last parameter.
    ExtraPayload { bytes: usize },
}

/// Result of decoding one frame: the resolved descriptor, the raw header
/// fields, the ordered values and any mismatch annotations.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub message: MessageRef,
    pub header: DecodedHeader,
    pub values: Vec<Value>,
    pub warnings: Vec<DecodeWarning>,
}

/// Serialize one command invocation to a complete frame (header + payload).
pub fn encode_command(
    api: &DeviceApi,
    class: &ApiClass,
    command: &Command,
    args: &[Value],
) -> Result<Bytes, BgError> {
    if args.len() != command.params.len() {
        return Err(BgError::ArgumentCount {
            expected: command.params.len(),
            given: args.len(),
        });
    }

    let mut payload = BytesMut::new();
    for (param, value) in command.params.iter().zip(args) {
        encode_value(&mut payload, class, param, value)?;
    }
    if payload.len() > MAX_PAYLOAD_LENGTH {
        return Err(BgError::PacketTooLarge { size: payload.len() });
    }

    let header = FrameHeader::new()
        .with_event(false)
        .with_device_id(api.device_id)
        .with_payload_len(payload.len() as u16)
        .with_class_id(class.index)
        .with_message_id(command.index);

    let mut frame = BytesMut::with_capacity(HEADER_LENGTH + payload.len());
    frame.extend_from_slice(&header.into_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame.freeze())
}

/// Decode one frame against the loaded APIs.
///
/// `from_host` selects the parameter list for command-kind frames: `params`
/// for frames the host sent, `returns` for responses coming back. With
/// `resolve_symbols`, scalar values whose parameter names an enum or define
/// validator are rendered as member names.
pub fn decode(
    registry: &ApiRegistry,
    header: [u8; 4],
    payload: &[u8],
    from_host: bool,
    resolve_symbols: bool,
) -> Result<Decoded, BgError> {
    let parsed = DecodedHeader::from_bytes(header);
    let api = registry
        .by_id(parsed.device_id)
        .ok_or(BgError::UnknownDevice(parsed.device_id))?;
    let message = MessageRef::from_wire(api.clone(), parsed.kind, parsed.class_id, parsed.message_id).ok_or(
        match parsed.kind {
            MessageKind::Command => BgError::UnknownCommand {
                class_id: parsed.class_id,
                command_id: parsed.message_id,
            },
            MessageKind::Event => BgError::UnknownEvent {
                class_id: parsed.class_id,
                event_id: parsed.message_id,
            },
        },
    )?;

    let (params, direction) = match parsed.kind {
        MessageKind::Event => (message.params(), "evt"),
        MessageKind::Command if from_host => (message.params(), "cmd"),
        MessageKind::Command => (message.returns(), "rsp"),
    };

    let mut values = Vec::with_capacity(params.len());
    let mut warnings = Vec::new();
    let mut pos = 0usize;
    let mut truncated = false;
    for (i, param) in params.iter().enumerate() {
        match take_value(param, &payload[pos..]) {
            Some((value, consumed)) => {
                values.push(value);
                pos += consumed;
            }
            None => {
                let missing: Vec<String> = params[i..].iter().map(|p| p.name.clone()).collect();
                warn!(
                    "received message '{}' with parameter(s) {} missing",
                    message.qualified(direction),
                    missing.iter().map(|p| format!("'{}'", p)).collect::<Vec<_>>().join(", "),
                );
                warnings.push(DecodeWarning::MissingParameters { params: missing });
                values.resize(params.len(), Value::Missing);
                truncated = true;
                break;
            }
        }
    }
    if !truncated && pos < payload.len() {
        let extra = payload.len() - pos;
        warn!(
            "received message '{}' with {} byte(s) extra payload",
            message.qualified(direction),
            extra
        );
        warnings.push(DecodeWarning::ExtraPayload { bytes: extra });
    }

    if resolve_symbols {
        let class = message.class();
        for (param, value) in params.iter().zip(values.iter_mut()) {
            resolve_symbol(class, param, value);
        }
    }

    Ok(Decoded {
        header: parsed,
        values,
        warnings,
        message,
    })
}

/// Decode one parameter from the front of `remaining`, returning the value
/// and the number of bytes consumed, or `None` when the payload cannot hold
/// the parameter (not even the array length prefix).
fn take_value(param: &Param, remaining: &[u8]) -> Option<(Value, usize)> {
    if let Some(size) = param.format.fixed_size() {
        if remaining.len() < size {
            return None;
        }
        let mut cur = remaining;
        let value = match param.format {
            ParamType::Int8 => Value::Int(cur.get_i8().into()),
            ParamType::Uint8 => Value::Uint(cur.get_u8().into()),
            ParamType::Int16 => Value::Int(cur.get_i16_le().into()),
            ParamType::Uint16 => Value::Uint(cur.get_u16_le().into()),
            ParamType::Int32 => Value::Int(cur.get_i32_le().into()),
            ParamType::Uint32 => Value::Uint(cur.get_u32_le().into()),
            ParamType::Int64 => Value::Int(cur.get_i64_le()),
            ParamType::Uint64 => Value::Uint(cur.get_u64_le()),
            ParamType::BdAddr => Value::Text(render_addr(&remaining[..6], true)),
            ParamType::HwAddr => Value::Text(render_addr(&remaining[..6], false)),
            ParamType::Ipv4 => Value::Text(
                remaining[..4].iter().map(u8::to_string).collect::<Vec<_>>().join("."),
            ),
            ParamType::Uuid128 | ParamType::AesKey128 | ParamType::Uuid64 | ParamType::Uuid16 => {
                Value::Binary(remaining[..size].to_vec())
            }
            ParamType::Uint8Array | ParamType::Uint16Array | ParamType::ByteArray => unreachable!(),
        };
        return Some((value, size));
    }

    match param.format {
        ParamType::Uint8Array => {
            let len = *remaining.first()? as usize;
            if remaining.len() < 1 + len {
                return None;
            }
            Some((Value::Binary(remaining[1..1 + len].to_vec()), 1 + len))
        }
        ParamType::Uint16Array => {
            if remaining.len() < 2 {
                return None;
            }
            let len = u16::from_le_bytes([remaining[0], remaining[1]]) as usize;
            if remaining.len() < 2 + len {
                return None;
            }
            Some((Value::Binary(remaining[2..2 + len].to_vec()), 2 + len))
        }
        ParamType::ByteArray => {
            let len = param.datatype.as_ref().map_or(0, |d| d.length);
            if remaining.len() < len {
                return None;
            }
            Some((Value::Binary(remaining[..len].to_vec()), len))
        }
        _ => unreachable!(),
    }
}

fn render_addr(bytes: &[u8], reversed: bool) -> String {
    let mut parts: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    if reversed {
        parts.reverse();
    }
    parts.join(":")
}

/// Replace a numeric value with the symbolic rendering its validator names:
/// the matching enum member, or the `|`-joined define members whose bits are
/// set. Values with no matching member are left numeric.
fn resolve_symbol(class: &ApiClass, param: &Param, value: &mut Value) {
    let Some(validator) = &param.validator else {
        return;
    };
    let Some(number) = value.as_number().and_then(|n| i64::try_from(n).ok()) else {
        return;
    };
    match validator.kind {
        ValidatorKind::Enum => {
            if let Some(member) = class
                .enum_group(&validator.group)
                .and_then(|g| g.member_by_value(number))
            {
                *value = Value::Text(member.name.clone());
            }
        }
        ValidatorKind::Define => {
            if let Some(group) = class.define_group(&validator.group) {
                let names: Vec<&str> = group
                    .members()
                    .iter()
                    .filter(|m| m.value & number != 0)
                    .map(|m| m.name.as_str())
                    .collect();
                if !names.is_empty() {
                    *value = Value::Text(names.join("|"));
                }
            }
        }
    }
}

fn encode_value(payload: &mut BytesMut, class: &ApiClass, param: &Param, value: &Value) -> Result<(), BgError> {
    match param.format {
        ParamType::Int8 => {
            let v: i8 = scalar_arg(class, param, value)?;
            payload.put_i8(v);
        }
        ParamType::Uint8 => {
            let v: u8 = scalar_arg(class, param, value)?;
            payload.put_u8(v);
        }
        ParamType::Int16 => {
            let v: i16 = scalar_arg(class, param, value)?;
            payload.put_i16_le(v);
        }
        ParamType::Uint16 => {
            let v: u16 = scalar_arg(class, param, value)?;
            payload.put_u16_le(v);
        }
        ParamType::Int32 => {
            let v: i32 = scalar_arg(class, param, value)?;
            payload.put_i32_le(v);
        }
        ParamType::Uint32 => {
            let v: u32 = scalar_arg(class, param, value)?;
            payload.put_u32_le(v);
        }
        ParamType::Int64 => {
            let v: i64 = scalar_arg(class, param, value)?;
            payload.put_i64_le(v);
        }
        ParamType::Uint64 => {
            let v: u64 = scalar_arg(class, param, value)?;
            payload.put_u64_le(v);
        }
        ParamType::Uint8Array => {
            let bytes = bytes_arg(param, value)?;
            if bytes.len() > u8::MAX as usize {
                return Err(invalid(param, format!("array of {} bytes exceeds uint8array", bytes.len())));
            }
            payload.put_u8(bytes.len() as u8);
            payload.extend_from_slice(&bytes);
        }
        ParamType::Uint16Array => {
            let bytes = bytes_arg(param, value)?;
            if bytes.len() > u16::MAX as usize {
                return Err(invalid(param, format!("array of {} bytes exceeds uint16array", bytes.len())));
            }
            payload.put_u16_le(bytes.len() as u16);
            payload.extend_from_slice(&bytes);
        }
        ParamType::BdAddr => {
            let addr = addr_arg(param, value)?;
            payload.extend(addr.iter().rev());
        }
        ParamType::HwAddr => {
            let addr = addr_arg(param, value)?;
            payload.extend_from_slice(&addr);
        }
        ParamType::Ipv4 => {
            let text = text_arg(param, value)?;
            let octets = text
                .split('.')
                .map(|part| part.parse::<u8>().ok())
                .collect::<Option<Vec<u8>>>()
                .filter(|octets| octets.len() == 4)
                .ok_or_else(|| invalid(param, format!("'{}' is not a dotted IPv4 address", text)))?;
            payload.extend_from_slice(&octets);
        }
        ParamType::Uuid128 | ParamType::AesKey128 => {
            payload.extend_from_slice(&exact_bytes_arg(param, value, 16)?);
        }
        ParamType::Uuid64 => {
            payload.extend_from_slice(&exact_bytes_arg(param, value, 8)?);
        }
        ParamType::Uuid16 => {
            payload.extend_from_slice(&exact_bytes_arg(param, value, 2)?);
        }
        ParamType::ByteArray => {
            let expected = param.datatype.as_ref().map_or(0, |d| d.length);
            payload.extend_from_slice(&exact_bytes_arg(param, value, expected)?);
        }
    }
    Ok(())
}

fn scalar_arg<T>(class: &ApiClass, param: &Param, value: &Value) -> Result<T, BgError>
where
    T: TryFrom<i128>,
{
    let number = numeric_arg(class, param, value)?;
    T::try_from(number).map_err(|_| {
        invalid(
            param,
            format!("value {} out of range for {}", number, param.format.name()),
        )
    })
}

fn numeric_arg(class: &ApiClass, param: &Param, value: &Value) -> Result<i128, BgError> {
    match value {
        Value::Int(v) => Ok(*v as i128),
        Value::Uint(v) => Ok(*v as i128),
        Value::Text(text) => textual_numeric(class, param, text),
        Value::Binary(_) => Err(invalid(param, "expected a number, got raw bytes".to_owned())),
        Value::Missing => Err(invalid(param, "expected a number, got no value".to_owned())),
    }
}

/// Convert a textual argument to its numeric wire value.
///
/// Numeric literals (leading ASCII digit, `0x`/`0b` prefixes included)
/// bypass the validator; anything else is looked up as an enum member or a
/// `|`-separated combination of define members.
fn textual_numeric(class: &ApiClass, param: &Param, text: &str) -> Result<i128, BgError> {
    let parse = |text: &str| {
        parse_number(text).ok_or_else(|| invalid(param, format!("'{}' is not a number", text)))
    };
    let Some(validator) = &param.validator else {
        return parse(text);
    };
    if text.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return parse(text);
    }
    match validator.kind {
        ValidatorKind::Enum => class
            .enum_group(&validator.group)
            .and_then(|g| g.member(text))
            .map(|m| m.value as i128)
            .ok_or_else(|| {
                invalid(
                    param,
                    format!("unknown enum member '{}' in group '{}'", text, validator.group),
                )
            }),
        ValidatorKind::Define => {
            let group = class
                .define_group(&validator.group)
                .ok_or_else(|| invalid(param, format!("unknown define group '{}'", validator.group)))?;
            let mut combined = 0i128;
            for part in text.split('|') {
                let member = group.member(part).ok_or_else(|| {
                    invalid(
                        param,
                        format!("unknown define member '{}' in group '{}'", part, validator.group),
                    )
                })?;
                combined |= member.value as i128;
            }
            Ok(combined)
        }
    }
}

fn bytes_arg(param: &Param, value: &Value) -> Result<Vec<u8>, BgError> {
    match value {
        Value::Binary(bytes) => Ok(bytes.clone()),
        Value::Text(text) => Ok(text.as_bytes().to_vec()),
        other => Err(invalid(param, format!("expected bytes, got {}", other))),
    }
}

fn exact_bytes_arg(param: &Param, value: &Value, expected: usize) -> Result<Vec<u8>, BgError> {
    let bytes = bytes_arg(param, value)?;
    if bytes.len() != expected {
        return Err(invalid(
            param,
            format!("expected exactly {} bytes, got {}", expected, bytes.len()),
        ));
    }
    Ok(bytes)
}

fn text_arg<'a>(param: &Param, value: &'a Value) -> Result<&'a str, BgError> {
    value
        .as_text()
        .ok_or_else(|| invalid(param, format!("expected text, got {}", value)))
}

/// Parse a colon-separated hardware address into its six bytes, in textual
/// order.
fn addr_arg(param: &Param, value: &Value) -> Result<[u8; 6], BgError> {
    let text = text_arg(param, value)?;
    let bytes = hex::decode(text.replace(':', ""))
        .map_err(|_| invalid(param, format!("'{}' is not a hardware address", text)))?;
    <[u8; 6]>::try_from(bytes)
        .map_err(|_| invalid(param, format!("'{}' is not a 6-byte hardware address", text)))
}

fn invalid(param: &Param, reason: String) -> BgError {
    BgError::InvalidArgument {
        param: param.name.clone(),
        reason,
    }
}
