//! Field protocols

pub mod modbus;
