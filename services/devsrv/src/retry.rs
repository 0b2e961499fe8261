//! Bounded polling and retry helpers
//!
//! Breaker confirmation polling and sensor connection
//! attempts share these instead of each carrying its own sleep loop.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DevSrvError, Result};

/// Fixed-interval policy: at most `attempts` tries, `interval` apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Total time a fully exhausted poll will wait
    pub fn budget(&self) -> Duration {
        self.interval * self.attempts
    }
}

/// How a bounded poll ended
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Reached,
    /// Attempts ran out; carries the most recent probe error, if any
    Exhausted { last_error: Option<DevSrvError> },
}

/// Sleep, probe, repeat until the probe reports `true` or attempts run out
///
/// Probe errors are logged and count as "not yet".
pub async fn poll_until<S, P>(policy: PollPolicy, state: &mut S, mut probe: P) -> PollOutcome
where
    S: ?Sized + Send,
    P: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<bool>>,
{
    let mut last_error = None;
    for attempt in 1..=policy.attempts {
        tokio::time::sleep(policy.interval).await;
        match probe(state).await {
            Ok(true) => {
                debug!("Condition met on attempt {}/{}", attempt, policy.attempts);
                return PollOutcome::Reached;
            },
            Ok(false) => {
                debug!("Condition not met, attempt {}/{}", attempt, policy.attempts);
            },
            Err(e) => {
                warn!("Probe failed on attempt {}/{}: {}", attempt, policy.attempts, e);
                last_error = Some(e);
            },
        }
    }
    PollOutcome::Exhausted { last_error }
}

/// Run `op` up to `attempts` times with `interval` between failures
///
/// Returns the first success or the last error.
pub async fn retry<T, F, Fut>(policy: PollPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            },
        }
    }
}

/// Sleep for `duration` unless the token fires first
pub async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(DevSrvError::cancelled("cancelled while waiting")),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
