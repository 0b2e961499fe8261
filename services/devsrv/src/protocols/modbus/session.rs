//! Modbus TCP session
//!
//! A [`ModbusSession`] owns one TCP connection and runs strictly one
//! request/response exchange at a time. Device protocols talk to it through
//! the [`RegisterClient`] trait so they can be driven by mocks in tests.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::constants::{DEFAULT_TIMEOUT, MBAP_HEADER_LEN};
use super::frame::{FrameCodec, MbapHeader, ModbusRequest, ResponseBody};
use crate::error::{DevSrvError, ErrorExt, Result};

/// Network address and station of a Modbus device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

fn default_unit_id() -> u8 {
    1
}

impl DeviceEndpoint {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
        }
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.host, self.port, self.unit_id)
    }
}

/// Register-level primitives shared by all device protocols
#[async_trait]
pub trait RegisterClient: Send {
    /// Read one holding register (FC 0x03)
    async fn read_holding(&mut self, address: u16) -> Result<u16>;

    /// Read one input register (FC 0x04)
    async fn read_input(&mut self, address: u16) -> Result<u16>;

    /// Write one coil (FC 0x05), `0xFF00` for on and `0x0000` for off
    async fn write_coil(&mut self, address: u16, on: bool) -> Result<()>;

    /// Write one holding register (FC 0x06)
    async fn write_register(&mut self, address: u16, value: u16) -> Result<()>;
}

/// Opens connected clients for device endpoints
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn RegisterClient>>;
}

/// Single-connection Modbus TCP client
pub struct ModbusSession {
    endpoint: DeviceEndpoint,
    connect_timeout: Duration,
    request_timeout: Duration,
    stream: Option<TcpStream>,
    codec: FrameCodec,
}

impl fmt::Debug for ModbusSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusSession")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}

impl ModbusSession {
    /// Create a disconnected session with the default 5 s deadlines
    pub fn new(endpoint: DeviceEndpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: DEFAULT_TIMEOUT,
            request_timeout: DEFAULT_TIMEOUT,
            stream: None,
            codec: FrameCodec::new(),
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, request_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.request_timeout = request_timeout;
        self
    }

    /// Create a session and connect it, using `timeout` for both deadlines
    pub async fn connect_to(
        host: &str,
        port: u16,
        unit_id: u8,
        timeout: Duration,
    ) -> Result<Self> {
        let mut session =
            Self::new(DeviceEndpoint::new(host, port, unit_id)).with_timeouts(timeout, timeout);
        session.connect().await?;
        Ok(session)
    }

    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let addr = format!("{}:{}", self.endpoint.host, self.endpoint.port);
        debug!("Connecting to Modbus TCP endpoint {}", addr);

        match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(connected) => {
                let stream = connected.connection_error(&format!("Failed to connect to {addr}"))?;
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY on {}: {}", addr, e);
                }
                info!("Connected to {}", self.endpoint);
                self.stream = Some(stream);
                Ok(())
            },
            Err(_) => Err(DevSrvError::connection(format!(
                "Connection to {addr} timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Disconnected from {}", self.endpoint);
        }
    }

    /// Run one request/response exchange
    ///
    /// Any failure other than a device exception drops the connection so the
    /// next call starts on a fresh stream.
    pub async fn request(&mut self, request: ModbusRequest) -> Result<ResponseBody> {
        self.connect().await?;

        let unit_id = self.endpoint.unit_id;
        let (transaction_id, frame) = self.codec.encode(unit_id, &request)?;

        let result = match self.exchange(&frame).await {
            Ok(raw) => FrameCodec::parse_response(transaction_id, unit_id, &request, &raw),
            Err(e) => Err(e),
        };

        if let Err(ref e) = result {
            if !matches!(e, DevSrvError::DeviceException { .. }) {
                warn!("Request to {} failed, dropping connection: {}", self.endpoint, e);
                self.stream = None;
            }
        }
        result
    }

    async fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let deadline = self.request_timeout;
        let stream = self.stream.as_mut().ok_or_else(DevSrvError::not_connected)?;

        timeout(deadline, stream.write_all(frame))
            .await
            .map_err(|_| DevSrvError::timeout(format!("Write timed out after {deadline:?}")))??;

        let mut header = [0u8; MBAP_HEADER_LEN + 1];
        timeout(deadline, stream.read_exact(&mut header))
            .await
            .map_err(|_| DevSrvError::timeout(format!("Read timed out after {deadline:?}")))??;

        let body_len = MbapHeader::decode(&header)?.body_len()?;
        let mut raw = Vec::with_capacity(MBAP_HEADER_LEN + body_len);
        raw.extend_from_slice(&header);
        raw.resize(MBAP_HEADER_LEN + body_len, 0);

        timeout(deadline, stream.read_exact(&mut raw[MBAP_HEADER_LEN + 1..]))
            .await
            .map_err(|_| DevSrvError::timeout(format!("Read timed out after {deadline:?}")))??;

        Ok(raw)
    }
}

#[async_trait]
impl RegisterClient for ModbusSession {
    async fn read_holding(&mut self, address: u16) -> Result<u16> {
        self.request(ModbusRequest::read_holding(address, 1))
            .await?
            .first_register()
    }

    async fn read_input(&mut self, address: u16) -> Result<u16> {
        self.request(ModbusRequest::read_input(address, 1))
            .await?
            .first_register()
    }

    async fn write_coil(&mut self, address: u16, on: bool) -> Result<()> {
        self.request(ModbusRequest::write_coil(address, on)).await?;
        Ok(())
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<()> {
        self.request(ModbusRequest::write_register(address, value))
            .await?;
        Ok(())
    }
}

/// Production factory: one fresh TCP session per call
#[derive(Debug, Clone)]
pub struct TcpSessionFactory {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Default for TcpSessionFactory {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_TIMEOUT)
    }
}

impl TcpSessionFactory {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

#[async_trait]
impl SessionFactory for TcpSessionFactory {
    async fn open(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn RegisterClient>> {
        let mut session = ModbusSession::new(endpoint.clone())
            .with_timeouts(self.connect_timeout, self.request_timeout);
        session.connect().await?;
        Ok(Box::new(session))
    }
}
