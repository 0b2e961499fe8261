//! Switch-control breaker
//!
//! Status input 0x0000 carries the local lock (high byte) and the switch
//! position (low byte). Closing is refused while either lock is engaged.

use tracing::{debug, info, warn};

use super::{ActionOutcome, BreakerStatus, BreakerTiming};
use crate::error::{DevSrvError, Result};
use crate::protocols::modbus::constants::{
    BREAKER_CONTROL_REGISTER, BREAKER_STATUS_INPUT, BREAKER_SWITCH_COIL, BREAKER_SWITCH_LOCK_COIL,
};
use crate::protocols::modbus::RegisterClient;
use crate::retry::{poll_until, PollOutcome};

pub struct SwitchControlBreaker<'a> {
    client: &'a mut dyn RegisterClient,
    timing: BreakerTiming,
}

async fn read_switch_status(client: &mut dyn RegisterClient) -> Result<BreakerStatus> {
    let raw_status = client.read_input(BREAKER_STATUS_INPUT).await?;
    let control_bits = client.read_holding(BREAKER_CONTROL_REGISTER).await?;
    Ok(BreakerStatus::decode(raw_status, control_bits))
}

impl<'a> SwitchControlBreaker<'a> {
    pub fn new(client: &'a mut dyn RegisterClient, timing: BreakerTiming) -> Self {
        Self { client, timing }
    }

    pub async fn read_status(&mut self) -> Result<BreakerStatus> {
        read_switch_status(&mut *self.client).await
    }

    /// Close the breaker and wait for the status to confirm it
    pub async fn close(&mut self) -> Result<ActionOutcome> {
        let status = self.read_status().await?;
        if status.closed {
            debug!("Breaker already closed");
            return Ok(ActionOutcome::AlreadyInState);
        }
        if status.local_locked {
            return Err(DevSrvError::locked("cannot close: local lock engaged"));
        }
        if status.remote_locked {
            return Err(DevSrvError::locked("cannot close: remote lock engaged"));
        }

        self.client.write_coil(BREAKER_SWITCH_COIL, true).await?;
        self.confirm(true).await?;
        Ok(ActionOutcome::Applied)
    }

    /// Open the breaker and wait for the status to confirm it
    pub async fn open(&mut self) -> Result<ActionOutcome> {
        let status = self.read_status().await?;
        if !status.closed {
            debug!("Breaker already open");
            return Ok(ActionOutcome::AlreadyInState);
        }

        self.client.write_coil(BREAKER_SWITCH_COIL, false).await?;
        self.confirm(false).await?;
        Ok(ActionOutcome::Applied)
    }

    /// Engage the remote lock; not confirmed by read-back
    pub async fn lock(&mut self) -> Result<()> {
        self.client
            .write_coil(BREAKER_SWITCH_LOCK_COIL, true)
            .await?;
        info!("Remote lock command sent");
        Ok(())
    }

    /// Release the remote lock; not confirmed by read-back
    pub async fn unlock(&mut self) -> Result<()> {
        self.client
            .write_coil(BREAKER_SWITCH_LOCK_COIL, false)
            .await?;
        info!("Remote unlock command sent");
        Ok(())
    }

    async fn confirm(&mut self, closed: bool) -> Result<()> {
        let policy = self.timing.poll;
        let target = if closed { "closed" } else { "open" };

        let outcome = poll_until(policy, &mut *self.client, |client| {
            Box::pin(async move { Ok(read_switch_status(client).await?.closed == closed) })
        })
        .await;

        match outcome {
            PollOutcome::Reached => {
                info!("Breaker confirmed {}", target);
                Ok(())
            },
            PollOutcome::Exhausted { last_error } => {
                warn!(
                    "Breaker did not report {} after {} polls",
                    target, policy.attempts
                );
                let detail = last_error
                    .map(|e| format!(" (last read error: {e})"))
                    .unwrap_or_default();
                Err(DevSrvError::timeout(format!(
                    "breaker did not report {target} within {:?}{detail}",
                    policy.budget()
                )))
            },
        }
    }
}
