//! Shutdown sequence model
//!
//! A sequence is built once from `(name, breaker, servers)` and its steps are
//! never reordered: every server shutdown, then one delay, then exactly one
//! breaker-off step.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ShutdownSettings;
use crate::collaborators::inventory::{BreakerId, ServerId};
use crate::error::{DevSrvError, Result};

pub type SequenceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SequenceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SequenceStatus::Completed | SequenceStatus::Failed | SequenceStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// What a step does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    ServerShutdown {
        server_id: ServerId,
    },
    Delay {
        #[serde(rename = "duration_ms", with = "duration_ms")]
        duration: Duration,
    },
    BreakerOff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownStep {
    /// 1-based position in the sequence
    pub id: u32,
    pub name: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ShutdownStep {
    fn new(id: u32, name: String, kind: StepKind, max_retries: u32) -> Self {
        Self {
            id,
            name,
            kind,
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            retry_count: 0,
            max_retries,
            error: None,
        }
    }

    fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.start_time = None;
        self.end_time = None;
        self.retry_count = 0;
        self.error = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownSequence {
    pub id: SequenceId,
    pub name: String,
    pub breaker_id: BreakerId,
    pub server_ids: Vec<ServerId>,
    pub steps: Vec<ShutdownStep>,
    pub status: SequenceStatus,
    /// 0..=100
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl ShutdownSequence {
    pub fn build(
        id: SequenceId,
        name: impl Into<String>,
        breaker_id: BreakerId,
        server_ids: Vec<ServerId>,
        settings: &ShutdownSettings,
    ) -> Self {
        let mut steps = Vec::with_capacity(server_ids.len() + 2);
        for server_id in &server_ids {
            let step_id = steps.len() as u32 + 1;
            steps.push(ShutdownStep::new(
                step_id,
                format!("Shutdown server {server_id}"),
                StepKind::ServerShutdown {
                    server_id: *server_id,
                },
                settings.max_retries,
            ));
        }

        let step_id = steps.len() as u32 + 1;
        steps.push(ShutdownStep::new(
            step_id,
            format!("Wait {}s for servers to power down", settings.delay.as_secs()),
            StepKind::Delay {
                duration: settings.delay,
            },
            0,
        ));

        let step_id = steps.len() as u32 + 1;
        steps.push(ShutdownStep::new(
            step_id,
            format!("Cut power on breaker {breaker_id}"),
            StepKind::BreakerOff,
            settings.max_retries,
        ));

        Self {
            id,
            name: name.into(),
            breaker_id,
            server_ids,
            steps,
            status: SequenceStatus::Created,
            progress: 0,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            error_message: None,
        }
    }

    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    /// Return every step to `pending` for a fresh run
    pub(crate) fn reset(&mut self) {
        for step in &mut self.steps {
            step.reset();
        }
        self.status = SequenceStatus::Created;
        self.progress = 0;
        self.start_time = None;
        self.end_time = None;
        self.error_message = None;
    }

    /// `Ok` for a completed sequence, `SequenceAbort` for failed or cancelled
    pub fn outcome(&self) -> Result<()> {
        match self.status {
            SequenceStatus::Completed => Ok(()),
            SequenceStatus::Failed | SequenceStatus::Cancelled => {
                Err(DevSrvError::sequence_abort(format!(
                    "sequence {} {}: {}",
                    self.id,
                    if self.status == SequenceStatus::Failed {
                        "failed"
                    } else {
                        "cancelled"
                    },
                    self.error_message.as_deref().unwrap_or("no details")
                )))
            },
            SequenceStatus::Created | SequenceStatus::Running => Err(DevSrvError::state(format!(
                "sequence {} has not finished",
                self.id
            ))),
        }
    }
}

/// `round(100 * done / total)`
pub(crate) fn progress_for(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 * 100.0) / total as f64).round().min(100.0) as u8
}
