//! Modbus TCP constants and the fixed register map of the supported devices

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header length on the wire, excluding the unit id:
/// Transaction ID(2) + Protocol ID(2) + Length(2)
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU size per Modbus specification
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Size of every request frame built here (MBAP + unit + fc + addr + qty/value)
pub const REQUEST_FRAME_LEN: usize = mbap_frame_size(5);

/// Shortest response that can be parsed (MBAP + unit + fc + one byte)
pub const MIN_RESPONSE_LEN: usize = mbap_frame_size(2);

/// Protocol identifier, always zero for Modbus
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Coil ON value for FC05
pub const COIL_ON: u16 = 0xFF00;

/// Coil OFF value for FC05
pub const COIL_OFF: u16 = 0x0000;

/// Default per-call deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Temperature sensor (KLT-18B20-6H1) register map, holding registers
// ============================================================================

/// First of six temperature channels (0x0000..=0x0005)
pub const SENSOR_TEMPERATURE_BASE: u16 = 0x0000;
pub const SENSOR_CHANNEL_COUNT: u16 = 6;
pub const SENSOR_DEVICE_TYPE: u16 = 0x0010;
pub const SENSOR_DEVICE_ADDRESS: u16 = 0x0011;
pub const SENSOR_BAUD_RATE: u16 = 0x0012;
pub const SENSOR_CRC_ORDER: u16 = 0x0013;

/// Device type code reported by the only supported sensor family
pub const SENSOR_SUPPORTED_TYPE: u16 = 19;

// ============================================================================
// Breaker register map
// ============================================================================

/// Input register: high byte local lock, low byte switch state
pub const BREAKER_STATUS_INPUT: u16 = 0x0000;
/// Holding register: bit0 auto/manual, bit1 remote lock
pub const BREAKER_CONTROL_REGISTER: u16 = 0x000C;
/// Remote open/close coil (switch-control breakers)
pub const BREAKER_SWITCH_COIL: u16 = 0x0001;
/// Remote lock coil (switch-control breakers)
pub const BREAKER_SWITCH_LOCK_COIL: u16 = 0x0002;
/// Remote lock coil (lock-control breakers)
pub const BREAKER_LOCK_COIL: u16 = 0x0003;

pub const CONTROL_AUTO_BIT: u16 = 0x0001;
pub const CONTROL_REMOTE_LOCK_BIT: u16 = 0x0002;

pub const STATUS_LOCAL_LOCK_FLAG: u8 = 0x01;
pub const STATUS_SWITCH_CLOSED: u8 = 0xF0;
pub const STATUS_SWITCH_OPEN: u8 = 0x0F;

/// Calculate total Modbus TCP frame size (MBAP header + unit id + PDU)
#[inline]
pub const fn mbap_frame_size(pdu_len: usize) -> usize {
    MBAP_HEADER_LEN + 1 + pdu_len
}
