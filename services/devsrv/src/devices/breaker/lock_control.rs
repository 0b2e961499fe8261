//! Lock-control breaker
//!
//! Remote lock is driven through coil 0x0003. Some firmware acknowledges the
//! coil write without acting on it, so an unverified coil path falls back to
//! writing bit1 of the control register directly. Both paths are confirmed by
//! reading the control register back.

use tracing::{debug, info, warn};

use super::{ActionOutcome, BreakerTiming, ControlWord};
use crate::error::{DevSrvError, Result};
use crate::protocols::modbus::constants::{BREAKER_CONTROL_REGISTER, BREAKER_LOCK_COIL};
use crate::protocols::modbus::RegisterClient;

pub struct LockControlBreaker<'a> {
    client: &'a mut dyn RegisterClient,
    timing: BreakerTiming,
}

impl<'a> LockControlBreaker<'a> {
    pub fn new(client: &'a mut dyn RegisterClient, timing: BreakerTiming) -> Self {
        Self { client, timing }
    }

    pub async fn read_status(&mut self) -> Result<ControlWord> {
        let bits = self.client.read_holding(BREAKER_CONTROL_REGISTER).await?;
        Ok(ControlWord(bits))
    }

    /// Lock unless already locked
    pub async fn lock(&mut self) -> Result<ActionOutcome> {
        if self.read_status().await?.remote_locked() {
            debug!("Breaker already remote-locked");
            return Ok(ActionOutcome::AlreadyInState);
        }
        self.perform_lock().await?;
        Ok(ActionOutcome::Applied)
    }

    /// Unlock unless already unlocked
    pub async fn unlock(&mut self) -> Result<ActionOutcome> {
        if !self.read_status().await?.remote_locked() {
            debug!("Breaker already unlocked");
            return Ok(ActionOutcome::AlreadyInState);
        }
        self.perform_unlock().await?;
        Ok(ActionOutcome::Applied)
    }

    pub async fn perform_lock(&mut self) -> Result<()> {
        self.set_remote_lock(true).await
    }

    pub async fn perform_unlock(&mut self) -> Result<()> {
        self.set_remote_lock(false).await
    }

    /// Flip the remote lock; returns the new locked state
    pub async fn smart_toggle(&mut self) -> Result<bool> {
        if self.read_status().await?.remote_locked() {
            self.perform_unlock().await?;
            Ok(false)
        } else {
            self.perform_lock().await?;
            Ok(true)
        }
    }

    async fn set_remote_lock(&mut self, locked: bool) -> Result<()> {
        let op = if locked { "lock" } else { "unlock" };

        let after_coil = match self.client.write_coil(BREAKER_LOCK_COIL, locked).await {
            Ok(()) => {
                let word = self.read_back().await?;
                if word.remote_locked() == locked {
                    info!("Remote {} confirmed via coil 0x{:04X}", op, BREAKER_LOCK_COIL);
                    return Ok(());
                }
                warn!("Remote {} via coil not confirmed, trying control register", op);
                word
            },
            Err(e) => {
                warn!("Remote {} coil write failed ({}), trying control register", op, e);
                self.read_status().await?
            },
        };

        let value = after_coil.with_remote_lock(locked);
        self.client
            .write_register(BREAKER_CONTROL_REGISTER, value)
            .await?;
        if self.read_back().await?.remote_locked() == locked {
            info!(
                "Remote {} confirmed via control register (0x{:04X})",
                op, value
            );
            return Ok(());
        }

        Err(DevSrvError::verification(format!("{op} operation failed")))
    }

    /// Wait the verification delay, then read the control word once
    async fn read_back(&mut self) -> Result<ControlWord> {
        tokio::time::sleep(self.timing.verify_delay).await;
        self.read_status().await
    }
}
