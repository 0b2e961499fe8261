//! KLT-18B20-6H1 six-channel temperature sensor
//!
//! Open-circuit and out-of-range channels are data states carried on the
//! reading, not errors. Callers decide whether to skip them.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DevSrvError, Result};
use crate::protocols::modbus::constants::{
    SENSOR_BAUD_RATE, SENSOR_CHANNEL_COUNT, SENSOR_CRC_ORDER, SENSOR_DEVICE_ADDRESS,
    SENSOR_DEVICE_TYPE, SENSOR_SUPPORTED_TYPE, SENSOR_TEMPERATURE_BASE,
};
use crate::protocols::modbus::{DeviceEndpoint, RegisterClient, SessionFactory};

/// Raw values the sensor uses to report a disconnected probe
const OPEN_CIRCUIT_SENTINELS: [u16; 4] = [0xF8CE, 63694, 65535, 32767];
/// Anything above this is treated as a fault, before sign conversion
const OPEN_CIRCUIT_THRESHOLD: u16 = 30000;

pub const MIN_TEMPERATURE: f64 = -55.0;
pub const MAX_TEMPERATURE: f64 = 125.0;

pub const SUPPORTED_MODEL: &str = "KLT-18B20-6H1";
pub const UNKNOWN: &str = "未知";
pub const CRC_HIGH_BYTE_FIRST: &str = "高字节在前";
pub const CRC_LOW_BYTE_FIRST: &str = "低字节在前";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingStatus {
    Ok,
    OpenCircuit,
    OutOfRange,
}

/// One decoded channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    /// 1..=6
    pub channel: u8,
    pub raw_value: u16,
    /// Degrees Celsius, present only when `status` is `Ok`
    pub value: Option<f64>,
    pub status: ReadingStatus,
}

impl TemperatureReading {
    /// Decode a raw register value
    ///
    /// Sentinel and overflow checks run before the signed conversion; the
    /// range check applies only to values that passed them.
    pub fn decode(channel: u8, raw_value: u16) -> Self {
        let (value, status) = decode_raw(raw_value);
        Self {
            channel,
            raw_value,
            value,
            status,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReadingStatus::Ok
    }

    /// The temperature, or a validation error for fault states
    pub fn require_value(&self) -> Result<f64> {
        match (self.status, self.value) {
            (ReadingStatus::Ok, Some(value)) => Ok(value),
            (status, _) => Err(DevSrvError::validation(format!(
                "channel {} has no valid temperature (raw 0x{:04X}, {:?})",
                self.channel, self.raw_value, status
            ))),
        }
    }
}

fn decode_raw(raw: u16) -> (Option<f64>, ReadingStatus) {
    if OPEN_CIRCUIT_SENTINELS.contains(&raw) || raw > OPEN_CIRCUIT_THRESHOLD {
        return (None, ReadingStatus::OpenCircuit);
    }

    let celsius = if raw > 32767 {
        (f64::from(raw) - 65536.0) / 10.0
    } else {
        f64::from(raw) / 10.0
    };

    if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&celsius) {
        return (None, ReadingStatus::OutOfRange);
    }
    (Some(celsius), ReadingStatus::Ok)
}

/// Baud-rate register code to display string
pub fn baud_rate_label(code: u16) -> String {
    let baud = match code {
        0 => 300,
        1 => 600,
        2 => 1200,
        3 => 2400,
        4 => 4800,
        5 => 9600,
        6 => 19200,
        7 => 38400,
        8 => 115200,
        _ => return UNKNOWN.to_string(),
    };
    baud.to_string()
}

/// CRC byte-order register value to display string
pub fn crc_order_label(code: u16) -> &'static str {
    if code == 0 {
        CRC_HIGH_BYTE_FIRST
    } else {
        CRC_LOW_BYTE_FIRST
    }
}

/// Read and decode channels 1..=6 on an open client
pub async fn read_temperatures(client: &mut dyn RegisterClient) -> Result<Vec<TemperatureReading>> {
    let mut readings = Vec::with_capacity(SENSOR_CHANNEL_COUNT as usize);
    for offset in 0..SENSOR_CHANNEL_COUNT {
        let raw = client.read_holding(SENSOR_TEMPERATURE_BASE + offset).await?;
        let reading = TemperatureReading::decode(offset as u8 + 1, raw);
        debug!(
            "Channel {} raw=0x{:04X} -> {:?}",
            reading.channel, raw, reading.status
        );
        readings.push(reading);
    }
    Ok(readings)
}

/// Outcome of probing an address for a supported sensor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Model name, set when the type register was readable
    pub device_type: Option<String>,
    pub device_address: Option<u16>,
    pub baud_rate: Option<String>,
    pub crc_order: Option<String>,
    pub temperatures: Vec<TemperatureReading>,
    pub connection_ok: bool,
    pub device_type_ok: bool,
    pub temperature_ok: bool,
    pub response_time_ms: u64,
}

/// Sensor discovery over Modbus TCP
pub struct SensorProtocol {
    factory: Arc<dyn SessionFactory>,
}

impl SensorProtocol {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self { factory }
    }

    /// Probe `address:port` at `station`
    ///
    /// Never fails: every problem is reflected in the result flags.
    pub async fn detect(&self, address: &str, port: u16, station: u8) -> DetectionResult {
        let endpoint = DeviceEndpoint::new(address, port, station);
        let started = Instant::now();
        let mut result = DetectionResult::default();

        let mut client = match self.factory.open(&endpoint).await {
            Ok(client) => client,
            Err(e) => {
                warn!("Sensor detection: cannot connect to {}: {}", endpoint, e);
                result.response_time_ms = elapsed_ms(started);
                return result;
            },
        };
        result.connection_ok = true;

        match client.read_holding(SENSOR_DEVICE_TYPE).await {
            Ok(code) => {
                result.device_type_ok = code == SENSOR_SUPPORTED_TYPE;
                result.device_type = Some(if result.device_type_ok {
                    SUPPORTED_MODEL.to_string()
                } else {
                    format!("{UNKNOWN}({code})")
                });
            },
            Err(e) => warn!("Sensor detection: device type read failed on {}: {}", endpoint, e),
        }

        match client.read_holding(SENSOR_DEVICE_ADDRESS).await {
            Ok(value) => result.device_address = Some(value),
            Err(e) => debug!("Device address read failed: {}", e),
        }
        match client.read_holding(SENSOR_BAUD_RATE).await {
            Ok(code) => result.baud_rate = Some(baud_rate_label(code)),
            Err(e) => debug!("Baud rate read failed: {}", e),
        }
        match client.read_holding(SENSOR_CRC_ORDER).await {
            Ok(code) => result.crc_order = Some(crc_order_label(code).to_string()),
            Err(e) => debug!("CRC order read failed: {}", e),
        }

        if result.device_type_ok {
            match read_temperatures(client.as_mut()).await {
                Ok(readings) => {
                    result.temperature_ok = readings.iter().any(TemperatureReading::is_ok);
                    result.temperatures = readings;
                },
                Err(e) => warn!("Temperature read failed on {}: {}", endpoint, e),
            }
        }

        result.response_time_ms = elapsed_ms(started);
        info!(
            "Sensor detection on {}: connection={} type={} temperature={} ({} ms)",
            endpoint,
            result.connection_ok,
            result.device_type_ok,
            result.temperature_ok,
            result.response_time_ms
        );
        result
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::testing::{MockRegisters, MockSessionFactory};

    #[test]
    fn test_decode_table() {
        let r = TemperatureReading::decode(1, 250);
        assert_eq!(r.status, ReadingStatus::Ok);
        assert_eq!(r.value, Some(25.0));

        let r = TemperatureReading::decode(2, 65360);
        assert_eq!(r.status, ReadingStatus::Ok);
        assert!((r.value.unwrap() - (-17.6)).abs() < 1e-9);

        assert_eq!(
            TemperatureReading::decode(3, 0xF8CE).status,
            ReadingStatus::OpenCircuit
        );
        // Over the fault threshold before the range check applies
        assert_eq!(
            TemperatureReading::decode(4, 40000).status,
            ReadingStatus::OpenCircuit
        );

        let r = TemperatureReading::decode(5, 2000);
        assert_eq!(r.status, ReadingStatus::OutOfRange);
        assert_eq!(r.value, None);
    }

    #[test]
    fn test_sentinels_and_boundaries() {
        for raw in [63694, 65535, 32767, 30001] {
            assert_eq!(
                TemperatureReading::decode(1, raw).status,
                ReadingStatus::OpenCircuit,
                "raw {raw}"
            );
        }
        assert_eq!(TemperatureReading::decode(1, 1250).value, Some(125.0));
        assert_eq!(
            TemperatureReading::decode(1, 1251).status,
            ReadingStatus::OutOfRange
        );
        assert_eq!(TemperatureReading::decode(1, 0).value, Some(0.0));
    }

    #[test]
    fn test_require_value() {
        assert_eq!(TemperatureReading::decode(1, 215).require_value().unwrap(), 21.5);
        assert!(matches!(
            TemperatureReading::decode(6, 0xF8CE).require_value(),
            Err(DevSrvError::ValidationError(ref m)) if m.contains("channel 6")
        ));
    }

    #[test]
    fn test_labels() {
        assert_eq!(baud_rate_label(5), "9600");
        assert_eq!(baud_rate_label(8), "115200");
        assert_eq!(baud_rate_label(9), UNKNOWN);
        assert_eq!(crc_order_label(0), CRC_HIGH_BYTE_FIRST);
        assert_eq!(crc_order_label(1), CRC_LOW_BYTE_FIRST);
    }

    fn sensor_registers() -> MockRegisters {
        let registers = MockRegisters::new();
        registers.set_holding(SENSOR_DEVICE_TYPE, 19);
        registers.set_holding(SENSOR_DEVICE_ADDRESS, 3);
        registers.set_holding(SENSOR_BAUD_RATE, 5);
        registers.set_holding(SENSOR_CRC_ORDER, 0);
        for (offset, raw) in [250u16, 65360, 0xF8CE, 40000, 2000, 215].iter().enumerate() {
            registers.set_holding(offset as u16, *raw);
        }
        registers
    }

    #[tokio::test]
    async fn test_detect_supported_sensor() {
        let factory = Arc::new(MockSessionFactory::new(sensor_registers()));
        let result = SensorProtocol::new(factory).detect("10.0.0.9", 502, 3).await;

        assert!(result.connection_ok);
        assert!(result.device_type_ok);
        assert!(result.temperature_ok);
        assert_eq!(result.device_type.as_deref(), Some(SUPPORTED_MODEL));
        assert_eq!(result.device_address, Some(3));
        assert_eq!(result.baud_rate.as_deref(), Some("9600"));
        assert_eq!(result.crc_order.as_deref(), Some(CRC_HIGH_BYTE_FIRST));
        assert_eq!(result.temperatures.len(), 6);
        assert_eq!(
            result.temperatures.iter().filter(|r| r.is_ok()).count(),
            3
        );
    }

    #[tokio::test]
    async fn test_detect_unsupported_type_skips_channels() {
        let registers = MockRegisters::new();
        registers.set_holding(SENSOR_DEVICE_TYPE, 7);
        let factory = Arc::new(MockSessionFactory::new(registers));

        let result = SensorProtocol::new(factory).detect("10.0.0.9", 502, 1).await;
        assert!(result.connection_ok);
        assert!(!result.device_type_ok);
        assert!(!result.temperature_ok);
        assert!(result.temperatures.is_empty());
        // Missing registers are non-fatal
        assert_eq!(result.device_address, None);
        assert_eq!(result.baud_rate, None);
    }

    #[tokio::test]
    async fn test_detect_unreachable() {
        let factory = Arc::new(MockSessionFactory::unreachable());
        let result = SensorProtocol::new(factory).detect("10.0.0.9", 502, 1).await;
        assert!(!result.connection_ok);
        assert!(!result.device_type_ok);
    }
}
