//! Modbus TCP client
//!
//! Only the four function codes the field devices need are supported:
//! read holding/input register, write single coil, write single register.

pub mod constants;
pub mod frame;
pub mod pdu;
pub mod session;

pub use frame::{FrameCodec, FunctionCode, MbapHeader, ModbusFrame, ModbusRequest, ResponseBody};
pub use pdu::{ModbusPdu, PduBuilder};
pub use session::{DeviceEndpoint, ModbusSession, RegisterClient, SessionFactory, TcpSessionFactory};
