pub mod api;
pub mod codec;
pub mod constants;
pub mod engine;
pub mod error;
pub mod host;
pub mod message;
pub mod reliable;
pub mod transport;
pub mod value;

// Re-export commonly used types
pub use api::{ApiClass, ApiRegistry, Command, Datatype, DeviceApi, Event, Param, ParamType, SymbolGroup, ValidatorKind};
pub use codec::{Decoded, DecodeWarning, DecodedHeader, FrameHeader, MessageKind, decode, encode_command};
pub use engine::{Engine, EventSink};
pub use error::{BgError, TransportError};
pub use host::{BgHost, EventIter, KeepAwakeHook};
pub use message::{BgCommand, BgEvent, BgResponse, MessageRef};
pub use reliable::{ReliableTransport, crc4, crc8, pack_frame};
pub use transport::Transport;
pub use value::Value;
