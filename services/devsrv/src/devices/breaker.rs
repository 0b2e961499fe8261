//! Circuit breakers
//!
//! Two device families are supported:
//! - lock control: remote lock via coil 0x0003 with a control-register fallback
//! - switch control: open/close via coil 0x0001, advisory lock via coil 0x0002
//!
//! [`BreakerService`] opens one session per operation and picks the variant
//! from the configured [`BreakerModel`].

pub mod lock_control;
pub mod switch_control;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

pub use lock_control::LockControlBreaker;
pub use switch_control::SwitchControlBreaker;

use crate::collaborators::events::{EventPublisher, BREAKER_STATE_CHANGED};
use crate::collaborators::inventory::BreakerTarget;
use crate::error::{DevSrvError, Result};
use crate::protocols::modbus::constants::{
    CONTROL_AUTO_BIT, CONTROL_REMOTE_LOCK_BIT, STATUS_LOCAL_LOCK_FLAG, STATUS_SWITCH_CLOSED,
};
use crate::protocols::modbus::SessionFactory;
use crate::retry::PollPolicy;

/// Which register layout a breaker uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerModel {
    LockControl,
    SwitchControl,
}

impl FromStr for BreakerModel {
    type Err = DevSrvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lock" | "lock_control" | "lock-control" => Ok(BreakerModel::LockControl),
            "switch" | "switch_control" | "switch-control" => Ok(BreakerModel::SwitchControl),
            other => Err(DevSrvError::config(format!("Unknown breaker model: {other}"))),
        }
    }
}

impl fmt::Display for BreakerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerModel::LockControl => write!(f, "lock_control"),
            BreakerModel::SwitchControl => write!(f, "switch_control"),
        }
    }
}

/// Whether an operation touched the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied,
    AlreadyInState,
}

/// Confirmation timing for breaker operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTiming {
    /// Wait after a lock write before reading back
    pub verify_delay: Duration,
    /// Open/close confirmation polling
    pub poll: PollPolicy,
}

impl Default for BreakerTiming {
    fn default() -> Self {
        Self {
            verify_delay: Duration::from_secs(2),
            poll: PollPolicy::new(10, Duration::from_secs(1)),
        }
    }
}

/// Control register 0x000C
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlWord(pub u16);

impl ControlWord {
    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn auto_mode(self) -> bool {
        self.0 & CONTROL_AUTO_BIT != 0
    }

    pub fn remote_locked(self) -> bool {
        self.0 & CONTROL_REMOTE_LOCK_BIT != 0
    }

    /// The register value with the remote-lock bit set or cleared
    pub fn with_remote_lock(self, locked: bool) -> u16 {
        if locked {
            self.0 | CONTROL_REMOTE_LOCK_BIT
        } else {
            self.0 & !CONTROL_REMOTE_LOCK_BIT
        }
    }
}

/// Switch-control breaker snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub closed: bool,
    pub local_locked: bool,
    pub remote_locked: bool,
    pub raw_status: u16,
    pub control_bits: u16,
    pub timestamp: DateTime<Utc>,
}

impl BreakerStatus {
    pub fn decode(raw_status: u16, control_bits: u16) -> Self {
        let [high, low] = raw_status.to_be_bytes();
        Self {
            closed: low == STATUS_SWITCH_CLOSED,
            local_locked: high & STATUS_LOCAL_LOCK_FLAG != 0,
            remote_locked: ControlWord(control_bits).remote_locked(),
            raw_status,
            control_bits,
            timestamp: Utc::now(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.local_locked || self.remote_locked
    }
}

/// Status as reported by either model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum BreakerState {
    LockControl {
        control_bits: u16,
        auto_mode: bool,
        remote_locked: bool,
    },
    SwitchControl(BreakerStatus),
}

impl From<ControlWord> for BreakerState {
    fn from(word: ControlWord) -> Self {
        BreakerState::LockControl {
            control_bits: word.bits(),
            auto_mode: word.auto_mode(),
            remote_locked: word.remote_locked(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerAction {
    Open,
    Close,
    Lock,
    Unlock,
}

impl BreakerAction {
    fn as_str(self) -> &'static str {
        match self {
            BreakerAction::Open => "open",
            BreakerAction::Close => "close",
            BreakerAction::Lock => "lock",
            BreakerAction::Unlock => "unlock",
        }
    }
}

/// Breaker operations against configured targets
pub struct BreakerService {
    factory: Arc<dyn SessionFactory>,
    timing: BreakerTiming,
    publisher: Arc<dyn EventPublisher>,
}

impl BreakerService {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        timing: BreakerTiming,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            factory,
            timing,
            publisher,
        }
    }

    pub async fn status(&self, target: &BreakerTarget) -> Result<BreakerState> {
        let mut client = self.factory.open(&target.endpoint).await?;
        match target.model {
            BreakerModel::LockControl => {
                let word = LockControlBreaker::new(client.as_mut(), self.timing)
                    .read_status()
                    .await?;
                Ok(word.into())
            },
            BreakerModel::SwitchControl => {
                let status = SwitchControlBreaker::new(client.as_mut(), self.timing)
                    .read_status()
                    .await?;
                Ok(BreakerState::SwitchControl(status))
            },
        }
    }

    pub async fn open(&self, target: &BreakerTarget) -> Result<ActionOutcome> {
        self.run(target, BreakerAction::Open).await
    }

    pub async fn close(&self, target: &BreakerTarget) -> Result<ActionOutcome> {
        self.run(target, BreakerAction::Close).await
    }

    pub async fn lock(&self, target: &BreakerTarget) -> Result<ActionOutcome> {
        self.run(target, BreakerAction::Lock).await
    }

    pub async fn unlock(&self, target: &BreakerTarget) -> Result<ActionOutcome> {
        self.run(target, BreakerAction::Unlock).await
    }

    /// Remove power downstream of the breaker
    ///
    /// Switch-control breakers are opened; lock-control breakers have no
    /// switch coil and are remote-locked instead.
    pub async fn cut_power(&self, target: &BreakerTarget) -> Result<ActionOutcome> {
        match target.model {
            BreakerModel::SwitchControl => self.open(target).await,
            BreakerModel::LockControl => self.lock(target).await,
        }
    }

    async fn run(&self, target: &BreakerTarget, action: BreakerAction) -> Result<ActionOutcome> {
        let mut client = self.factory.open(&target.endpoint).await?;

        let outcome = match target.model {
            BreakerModel::LockControl => {
                let mut breaker = LockControlBreaker::new(client.as_mut(), self.timing);
                match action {
                    BreakerAction::Lock => breaker.lock().await?,
                    BreakerAction::Unlock => breaker.unlock().await?,
                    BreakerAction::Open | BreakerAction::Close => {
                        return Err(DevSrvError::state(format!(
                            "breaker {} is lock-control and cannot {}",
                            target.id,
                            action.as_str()
                        )));
                    },
                }
            },
            BreakerModel::SwitchControl => {
                let mut breaker = SwitchControlBreaker::new(client.as_mut(), self.timing);
                match action {
                    BreakerAction::Open => breaker.open().await?,
                    BreakerAction::Close => breaker.close().await?,
                    BreakerAction::Lock => {
                        breaker.lock().await?;
                        ActionOutcome::Applied
                    },
                    BreakerAction::Unlock => {
                        breaker.unlock().await?;
                        ActionOutcome::Applied
                    },
                }
            },
        };

        info!(
            "Breaker {} ({}) {}: {:?}",
            target.id,
            target.name,
            action.as_str(),
            outcome
        );
        if outcome == ActionOutcome::Applied {
            self.publisher.publish(
                BREAKER_STATE_CHANGED,
                json!({
                    "breaker_id": target.id,
                    "name": target.name,
                    "model": target.model,
                    "action": action.as_str(),
                }),
            );
        }
        Ok(outcome)
    }
}
