//! Modbus TCP framing
//!
//! Builds request frames for the four supported function codes and validates
//! responses against the request they answer.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use super::constants::{
    COIL_OFF, COIL_ON, MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MIN_RESPONSE_LEN,
    MODBUS_PROTOCOL_ID, REQUEST_FRAME_LEN,
};
use super::pdu::{ModbusPdu, PduBuilder};
use crate::error::{DevSrvError, Result};

/// Function codes used by the device protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
}

impl FunctionCode {
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn is_read(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters
        )
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = DevSrvError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x05 => Ok(FunctionCode::WriteSingleCoil),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            other => Err(DevSrvError::protocol(format!(
                "Unsupported function code 0x{other:02X}"
            ))),
        }
    }
}

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Always 0 for Modbus
    pub protocol_id: u16,
    /// Bytes following the length field (unit id + PDU)
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Decode the first seven bytes of a frame
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < MBAP_HEADER_LEN + 1 {
            return Err(DevSrvError::protocol(format!(
                "MBAP header too short: {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        })
    }

    /// Length of the body that follows the six fixed header bytes
    pub fn body_len(&self) -> Result<usize> {
        let length = self.length as usize;
        if !(2..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(DevSrvError::protocol(format!(
                "Invalid MBAP length field: {length}"
            )));
        }
        Ok(length)
    }
}

/// A single-register request: address plus quantity (reads) or value (writes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusRequest {
    pub function: FunctionCode,
    pub address: u16,
    pub value: u16,
}

impl ModbusRequest {
    pub fn read_holding(address: u16, quantity: u16) -> Self {
        Self {
            function: FunctionCode::ReadHoldingRegisters,
            address,
            value: quantity,
        }
    }

    pub fn read_input(address: u16, quantity: u16) -> Self {
        Self {
            function: FunctionCode::ReadInputRegisters,
            address,
            value: quantity,
        }
    }

    pub fn write_coil(address: u16, on: bool) -> Self {
        Self {
            function: FunctionCode::WriteSingleCoil,
            address,
            value: if on { COIL_ON } else { COIL_OFF },
        }
    }

    pub fn write_register(address: u16, value: u16) -> Self {
        Self {
            function: FunctionCode::WriteSingleRegister,
            address,
            value,
        }
    }

    pub fn pdu(&self) -> Result<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(self.function.code())?
            .address(self.address)?
            .word(self.value)?
            .build())
    }
}

/// Decoded frame, either direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusFrame {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
    pub function_code: u8,
    /// PDU bytes after the function code
    pub payload: Bytes,
}

impl ModbusFrame {
    /// Decode a complete frame; the MBAP length must be fully present
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_RESPONSE_LEN {
            return Err(DevSrvError::protocol(format!(
                "Response too short: {} bytes (min {})",
                data.len(),
                MIN_RESPONSE_LEN
            )));
        }

        let header = MbapHeader::decode(data)?;
        let end = MBAP_HEADER_LEN + header.body_len()?;
        if data.len() < end {
            return Err(DevSrvError::protocol(format!(
                "Truncated frame: length field says {} bytes, got {}",
                end,
                data.len()
            )));
        }

        Ok(Self {
            transaction_id: header.transaction_id,
            protocol_id: header.protocol_id,
            length: header.length,
            unit_id: header.unit_id,
            function_code: data[7],
            payload: Bytes::copy_from_slice(&data[8..end]),
        })
    }
}

/// Successful response content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Registers decoded from a 0x03/0x04 response, big-endian
    Registers(Vec<u16>),
    /// Echo of a 0x05/0x06 request
    WriteEcho { address: u16, value: u16 },
}

impl ResponseBody {
    /// First register of a read response
    pub fn first_register(&self) -> Result<u16> {
        match self {
            ResponseBody::Registers(regs) => regs
                .first()
                .copied()
                .ok_or_else(|| DevSrvError::protocol("Empty register response")),
            ResponseBody::WriteEcho { .. } => {
                Err(DevSrvError::protocol("Expected register data, got write echo"))
            },
        }
    }
}

/// Frame encoder/decoder with transaction id allocation
#[derive(Debug)]
pub struct FrameCodec {
    next_transaction_id: u16,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            next_transaction_id: 1,
        }
    }

    /// Allocate the next transaction id; wraps and skips 0
    pub fn next_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        if self.next_transaction_id == 0 {
            self.next_transaction_id = 1;
        }
        id
    }

    /// Encode a request with a fresh transaction id
    pub fn encode(&mut self, unit_id: u8, request: &ModbusRequest) -> Result<(u16, Bytes)> {
        let transaction_id = self.next_transaction_id();
        let frame = Self::encode_with_id(transaction_id, unit_id, request)?;
        Ok((transaction_id, frame))
    }

    /// Encode a request with an explicit transaction id
    pub fn encode_with_id(
        transaction_id: u16,
        unit_id: u8,
        request: &ModbusRequest,
    ) -> Result<Bytes> {
        let pdu = request.pdu()?;
        let length = (pdu.len() + 1) as u16;

        let mut frame = BytesMut::with_capacity(REQUEST_FRAME_LEN);
        frame.put_u16(transaction_id);
        frame.put_u16(MODBUS_PROTOCOL_ID);
        frame.put_u16(length);
        frame.put_u8(unit_id);
        frame.put_slice(pdu.as_slice());

        debug!(
            "TX tid={:04X} unit={} fc={:02X} addr=0x{:04X} value=0x{:04X}",
            transaction_id,
            unit_id,
            request.function.code(),
            request.address,
            request.value
        );
        Ok(frame.freeze())
    }

    /// Validate a response against its request and extract the body
    pub fn parse_response(
        transaction_id: u16,
        unit_id: u8,
        request: &ModbusRequest,
        data: &[u8],
    ) -> Result<ResponseBody> {
        let frame = ModbusFrame::decode(data)?;

        if frame.transaction_id != transaction_id {
            return Err(DevSrvError::protocol(format!(
                "Transaction id mismatch: expected {:04X}, got {:04X}",
                transaction_id, frame.transaction_id
            )));
        }
        if frame.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(DevSrvError::protocol(format!(
                "Invalid protocol id: {}",
                frame.protocol_id
            )));
        }
        if frame.unit_id != unit_id {
            return Err(DevSrvError::protocol(format!(
                "Unit id mismatch: expected {}, got {}",
                unit_id, frame.unit_id
            )));
        }

        // Function code onwards, bounded by the length field
        let pdu_end = MBAP_HEADER_LEN + frame.length as usize;
        let pdu = ModbusPdu::from_slice(&data[MBAP_HEADER_LEN + 1..pdu_end])?;
        if pdu.is_exception() {
            let code = pdu
                .exception_code()
                .ok_or_else(|| DevSrvError::protocol("Exception response without code"))?;
            debug!(
                "RX tid={:04X} exception on {} code={:02X}",
                frame.transaction_id,
                ModbusPdu::function_code_description(frame.function_code),
                code
            );
            return Err(DevSrvError::DeviceException { code });
        }

        let function = FunctionCode::try_from(frame.function_code)?;
        if function != request.function {
            return Err(DevSrvError::protocol(format!(
                "Function code mismatch: expected {:02X}, got {:02X}",
                request.function.code(),
                function.code()
            )));
        }

        let body = if request.function.is_read() {
            Self::parse_registers(&frame.payload)?
        } else {
            Self::parse_write_echo(&frame.payload, request)?
        };
        debug!("RX tid={:04X} {:?}", frame.transaction_id, body);
        Ok(body)
    }

    fn parse_registers(payload: &[u8]) -> Result<ResponseBody> {
        let Some((&byte_count, data)) = payload.split_first() else {
            return Err(DevSrvError::protocol("Missing byte count"));
        };
        let byte_count = byte_count as usize;
        if byte_count == 0 || byte_count % 2 != 0 {
            return Err(DevSrvError::protocol(format!(
                "Invalid byte count: {byte_count}"
            )));
        }
        if data.len() < byte_count {
            return Err(DevSrvError::protocol(format!(
                "Register data truncated: expected {} bytes, got {}",
                byte_count,
                data.len()
            )));
        }

        let registers = data[..byte_count]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Ok(ResponseBody::Registers(registers))
    }

    fn parse_write_echo(payload: &[u8], request: &ModbusRequest) -> Result<ResponseBody> {
        if payload.len() < 4 {
            return Err(DevSrvError::protocol(format!(
                "Write echo too short: {} bytes",
                payload.len()
            )));
        }
        let address = u16::from_be_bytes([payload[0], payload[1]]);
        let value = u16::from_be_bytes([payload[2], payload[3]]);
        if address != request.address || value != request.value {
            return Err(DevSrvError::protocol(format!(
                "Write echo mismatch: sent 0x{:04X}=0x{:04X}, got 0x{:04X}=0x{:04X}",
                request.address, request.value, address, value
            )));
        }
        Ok(ResponseBody::WriteEcho { address, value })
    }
}
