// Protocol constants for BGAPI framing

use std::time::Duration;

/// Size of the BGAPI frame header (4 bytes)
pub const HEADER_LENGTH: usize = 4;

/// Maximum BGAPI payload length (11-bit length field)
pub const MAX_PAYLOAD_LENGTH: usize = 2047;

/// Poll interval of the background reader; the stop flag is observed
/// within one such period
pub const ENGINE_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Write timeout applied to the transport while the engine owns it
pub const ENGINE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default time a command waits for its response
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Sentinel byte that starts every reliable frame
pub const PREAMBLE_BYTE: u8 = 0x5A;

/// Size of the reliable frame header (preamble + length + flags/CRC)
pub const RELIABLE_HEADER_SIZE: usize = 3;

/// Flag bit in the third reliable header byte: payload CRC-8 follows the payload
pub const CRC_PRESENT_FLAG: u8 = 0b0001_0000;

/// Bits of the third reliable header byte holding payload length bits 8..10
pub const PAYLOAD_LENGTH_MASK: u8 = 0b1110_0000;
