//! Service configuration
//!
//! Layers, lowest priority first: built-in defaults, a YAML/TOML/JSON file
//! chosen by extension, then `DEVSRV_` environment variables with `__`
//! separating nested keys (`DEVSRV_SHUTDOWN__DELAY_SECS=10`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::collaborators::inventory::{BreakerTarget, SensorTarget, ServerTarget, StaticInventory};
use crate::devices::breaker::BreakerTiming;
use crate::error::{DevSrvError, Result};
use crate::retry::PollPolicy;
use crate::shutdown::ShutdownSettings;

pub const ENV_PREFIX: &str = "DEVSRV_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: Option<String>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            request_timeout_ms: 5000,
        }
    }
}

impl ModbusConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Wait before reading back a lock-control write
    pub verify_delay_ms: u64,
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            verify_delay_ms: 2000,
            poll_attempts: 10,
            poll_interval_ms: 1000,
        }
    }
}

impl BreakerConfig {
    pub fn timing(&self) -> BreakerTiming {
        BreakerTiming {
            verify_delay: Duration::from_millis(self.verify_delay_ms),
            poll: PollPolicy::new(
                self.poll_attempts,
                Duration::from_millis(self.poll_interval_ms),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub delay_secs: u64,
    pub retry_backoff_secs: u64,
    pub max_retries: u32,
    /// Used for servers without their own `shutdown_command`
    pub command: String,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            delay_secs: 30,
            retry_backoff_secs: 5,
            max_retries: 3,
            command: "sudo shutdown -h now".to_string(),
        }
    }
}

impl ShutdownConfig {
    pub fn settings(&self) -> ShutdownSettings {
        ShutdownSettings {
            delay: Duration::from_secs(self.delay_secs),
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            max_retries: self.max_retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub connect_attempts: u32,
    pub connect_interval_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            connect_attempts: 3,
            connect_interval_ms: 1000,
        }
    }
}

impl CollectorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn connect_policy(&self) -> PollPolicy {
        PollPolicy::new(
            self.connect_attempts,
            Duration::from_millis(self.connect_interval_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub binary: String,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            connect_timeout_secs: 10,
            command_timeout_secs: 60,
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevsrvConfig {
    pub logging: LoggingConfig,
    pub modbus: ModbusConfig,
    pub breaker: BreakerConfig,
    pub shutdown: ShutdownConfig,
    pub collector: CollectorConfig,
    pub ssh: SshConfig,
    pub servers: Vec<ServerTarget>,
    pub breakers: Vec<BreakerTarget>,
    pub sensors: Vec<SensorTarget>,
}

impl DevsrvConfig {
    /// Load and validate configuration
    ///
    /// A missing `path` yields defaults plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(DevsrvConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(DevSrvError::config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            debug!("Loading configuration from {}", path.display());
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("toml") => figment.merge(Toml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                other => {
                    return Err(DevSrvError::config(format!(
                        "unsupported configuration format: {}",
                        other.unwrap_or("<none>")
                    )));
                },
            };
        }

        let config: DevsrvConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would misbehave at runtime
    pub fn validate(&self) -> Result<()> {
        check_unique("server", self.servers.iter().map(|s| s.id))?;
        check_unique("breaker", self.breakers.iter().map(|b| b.id))?;
        check_unique("sensor", self.sensors.iter().map(|s| s.id))?;

        if self.breaker.poll_attempts == 0 {
            return Err(DevSrvError::config("breaker.poll_attempts must be at least 1"));
        }
        if self.collector.connect_attempts == 0 {
            return Err(DevSrvError::config(
                "collector.connect_attempts must be at least 1",
            ));
        }
        if self.collector.enabled && self.collector.interval_secs == 0 {
            return Err(DevSrvError::config("collector.interval_secs must be positive"));
        }

        for server in &self.servers {
            if server.host.trim().is_empty() {
                return Err(DevSrvError::config(format!("server {} has no host", server.id)));
            }
            if server.credentials.password.is_some() {
                warn!(
                    "Server {} has a password configured; only key authentication is used",
                    server.id
                );
            }
        }
        Ok(())
    }

    pub fn inventory(&self) -> StaticInventory {
        StaticInventory::new(self.servers.clone(), self.breakers.clone())
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        common::logging::resolve_log_dir(self.logging.dir.as_deref())
    }
}

fn check_unique(kind: &str, ids: impl Iterator<Item = u64>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(DevSrvError::config(format!("duplicate {kind} id {id}")));
        }
    }
    Ok(())
}
