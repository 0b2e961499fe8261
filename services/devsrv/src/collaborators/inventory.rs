//! Device inventory
//!
//! Resolves the numeric ids used by shutdown sequences into network targets.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::devices::breaker::BreakerModel;
use crate::error::{DevSrvError, Result};
use crate::protocols::modbus::DeviceEndpoint;

pub type ServerId = u64;
pub type BreakerId = u64;
pub type SensorId = u64;

/// SSH login material
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_path", &self.key_path)
            .finish()
    }
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerTarget {
    pub id: ServerId,
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub credentials: Credentials,
    /// Overrides the global shutdown command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerTarget {
    pub id: BreakerId,
    pub name: String,
    pub endpoint: DeviceEndpoint,
    pub model: BreakerModel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorTarget {
    pub id: SensorId,
    pub name: String,
    pub endpoint: DeviceEndpoint,
}

pub trait Inventory: Send + Sync {
    fn server(&self, id: ServerId) -> Result<ServerTarget>;
    fn breaker(&self, id: BreakerId) -> Result<BreakerTarget>;
}

/// Inventory fixed at construction, usually from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    servers: HashMap<ServerId, ServerTarget>,
    breakers: HashMap<BreakerId, BreakerTarget>,
}

impl StaticInventory {
    pub fn new(
        servers: impl IntoIterator<Item = ServerTarget>,
        breakers: impl IntoIterator<Item = BreakerTarget>,
    ) -> Self {
        Self {
            servers: servers.into_iter().map(|s| (s.id, s)).collect(),
            breakers: breakers.into_iter().map(|b| (b.id, b)).collect(),
        }
    }
}

impl Inventory for StaticInventory {
    fn server(&self, id: ServerId) -> Result<ServerTarget> {
        self.servers
            .get(&id)
            .cloned()
            .ok_or_else(|| DevSrvError::not_found(format!("server {id}")))
    }

    fn breaker(&self, id: BreakerId) -> Result<BreakerTarget> {
        self.breakers
            .get(&id)
            .cloned()
            .ok_or_else(|| DevSrvError::not_found(format!("breaker {id}")))
    }
}
