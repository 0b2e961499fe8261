//! Shutdown orchestration
//!
//! Each executing sequence runs on its own task. The sequence table is the
//! only shared state; its lock is never held across an await point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor::StepExecutor;
use super::sequence::{
    progress_for, SequenceId, SequenceStatus, ShutdownSequence, StepKind, StepStatus,
};
use super::ShutdownSettings;
use crate::collaborators::events::{
    EventPublisher, SEQUENCE_CANCELLED, SEQUENCE_COMPLETED, SEQUENCE_FAILED, SEQUENCE_STARTED,
    STEP_COMPLETED, STEP_FAILED,
};
use crate::collaborators::inventory::{BreakerId, ServerId};
use crate::error::{DevSrvError, Result};
use crate::retry::sleep_or_cancel;

struct SequenceEntry {
    sequence: ShutdownSequence,
    cancel: CancellationToken,
}

struct Inner {
    sequences: RwLock<HashMap<SequenceId, SequenceEntry>>,
    next_id: AtomicU64,
    executor: Arc<dyn StepExecutor>,
    publisher: Arc<dyn EventPublisher>,
    settings: ShutdownSettings,
}

/// Creates, runs and cancels shutdown sequences
#[derive(Clone)]
pub struct ShutdownOrchestrator {
    inner: Arc<Inner>,
}

impl ShutdownOrchestrator {
    pub fn new(
        executor: Arc<dyn StepExecutor>,
        publisher: Arc<dyn EventPublisher>,
        settings: ShutdownSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sequences: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                executor,
                publisher,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &ShutdownSettings {
        &self.inner.settings
    }

    /// Build and register a new sequence in the `created` state
    pub fn create_sequence(
        &self,
        name: &str,
        breaker_id: BreakerId,
        server_ids: Vec<ServerId>,
    ) -> Result<ShutdownSequence> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DevSrvError::validation("sequence name must not be empty"));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let sequence =
            ShutdownSequence::build(id, name, breaker_id, server_ids, &self.inner.settings);

        info!(
            "Created shutdown sequence {} '{}': {} servers, breaker {}",
            id,
            sequence.name,
            sequence.server_ids.len(),
            breaker_id
        );
        self.inner.sequences.write().insert(
            id,
            SequenceEntry {
                sequence: sequence.clone(),
                cancel: CancellationToken::new(),
            },
        );
        Ok(sequence)
    }

    /// Start a sequence on a background task
    ///
    /// The sequence is `running` when this returns. A sequence that already
    /// finished is reset and runs again from its first step.
    pub fn execute(&self, id: SequenceId) -> Result<JoinHandle<SequenceStatus>> {
        let (token, snapshot) = {
            let mut sequences = self.inner.sequences.write();
            let entry = sequences
                .get_mut(&id)
                .ok_or_else(|| DevSrvError::not_found(format!("sequence {id}")))?;

            match entry.sequence.status {
                SequenceStatus::Running => {
                    return Err(DevSrvError::state(format!(
                        "sequence {id} is already running"
                    )));
                },
                status if status.is_terminal() => {
                    debug!("Resetting sequence {} from {:?}", id, status);
                    entry.sequence.reset();
                    entry.cancel = CancellationToken::new();
                },
                _ => {},
            }

            entry.sequence.status = SequenceStatus::Running;
            entry.sequence.start_time = Some(Utc::now());
            (entry.cancel.clone(), entry.sequence.clone())
        };

        info!("Executing shutdown sequence {} '{}'", id, snapshot.name);
        self.inner.publisher.publish(
            SEQUENCE_STARTED,
            json!({
                "sequence_id": id,
                "name": snapshot.name,
                "breaker_id": snapshot.breaker_id,
                "server_ids": snapshot.server_ids,
                "total_steps": snapshot.steps.len(),
            }),
        );

        let inner = Arc::clone(&self.inner);
        Ok(tokio::spawn(async move { inner.run(id, token).await }))
    }

    /// Request cancellation of a running sequence
    ///
    /// A delay or retry backoff in progress ends at once. A device step
    /// already in flight completes, and no later step starts.
    pub fn cancel(&self, id: SequenceId) -> Result<()> {
        let sequences = self.inner.sequences.read();
        let entry = sequences
            .get(&id)
            .ok_or_else(|| DevSrvError::not_found(format!("sequence {id}")))?;

        if entry.sequence.status != SequenceStatus::Running {
            return Err(DevSrvError::state(format!(
                "sequence {id} is not running ({:?})",
                entry.sequence.status
            )));
        }

        info!("Cancelling shutdown sequence {}", id);
        entry.cancel.cancel();
        Ok(())
    }

    /// Snapshot of one sequence
    pub fn get_sequence(&self, id: SequenceId) -> Result<ShutdownSequence> {
        self.inner
            .sequences
            .read()
            .get(&id)
            .map(|e| e.sequence.clone())
            .ok_or_else(|| DevSrvError::not_found(format!("sequence {id}")))
    }

    /// Snapshots of all sequences, oldest first
    pub fn list_sequences(&self) -> Vec<ShutdownSequence> {
        let mut list: Vec<_> = self
            .inner
            .sequences
            .read()
            .values()
            .map(|e| e.sequence.clone())
            .collect();
        list.sort_by_key(|s| s.id);
        list
    }
}

impl Inner {
    fn update<R>(&self, id: SequenceId, f: impl FnOnce(&mut ShutdownSequence) -> R) -> Option<R> {
        self.sequences
            .write()
            .get_mut(&id)
            .map(|entry| f(&mut entry.sequence))
    }

    async fn run(&self, id: SequenceId, token: CancellationToken) -> SequenceStatus {
        let Some((total, breaker_id)) = self.update(id, |s| (s.steps.len(), s.breaker_id)) else {
            error!("Sequence {} vanished before it started", id);
            return SequenceStatus::Failed;
        };

        for index in 0..total {
            if token.is_cancelled() {
                return self.finish_cancelled(id, None);
            }

            let Some((step_id, step_name, kind)) = self.update(id, |s| {
                let step = &mut s.steps[index];
                step.status = StepStatus::Running;
                step.start_time = Some(Utc::now());
                (step.id, step.name.clone(), step.kind.clone())
            }) else {
                return SequenceStatus::Failed;
            };
            info!("Sequence {} step {}/{}: {}", id, step_id, total, step_name);

            match self.run_step(id, index, &kind, breaker_id, &token).await {
                Ok(()) => {
                    let progress = progress_for(index + 1, total);
                    self.update(id, |s| {
                        let step = &mut s.steps[index];
                        step.status = StepStatus::Completed;
                        step.end_time = Some(Utc::now());
                        s.progress = progress;
                    });
                    self.publisher.publish(
                        STEP_COMPLETED,
                        json!({
                            "sequence_id": id,
                            "step_id": step_id,
                            "name": step_name,
                            "progress": progress,
                        }),
                    );
                },
                Err(e) if e.is_cancelled() || token.is_cancelled() => {
                    self.fail_step(id, index, &e);
                    return self.finish_cancelled(id, Some(step_id));
                },
                Err(e) => {
                    let retries = self.fail_step(id, index, &e);
                    let message = format!(
                        "step {step_id} ({step_name}) failed after {retries} retries: {e}"
                    );
                    error!("Sequence {} aborted: {}", id, message);

                    self.update(id, |s| {
                        s.status = SequenceStatus::Failed;
                        s.end_time = Some(Utc::now());
                        s.error_message = Some(message.clone());
                    });
                    self.publisher.publish(
                        STEP_FAILED,
                        json!({
                            "sequence_id": id,
                            "step_id": step_id,
                            "name": step_name,
                            "retry_count": retries,
                            "error": e.to_string(),
                        }),
                    );
                    self.publisher.publish(
                        SEQUENCE_FAILED,
                        json!({"sequence_id": id, "error": message}),
                    );
                    return SequenceStatus::Failed;
                },
            }
        }

        self.update(id, |s| {
            s.status = SequenceStatus::Completed;
            s.progress = 100;
            s.end_time = Some(Utc::now());
        });
        info!("Shutdown sequence {} completed", id);
        self.publisher
            .publish(SEQUENCE_COMPLETED, json!({"sequence_id": id}));
        SequenceStatus::Completed
    }

    /// Run one step, retrying device steps up to the step's `max_retries`
    async fn run_step(
        &self,
        id: SequenceId,
        index: usize,
        kind: &StepKind,
        breaker_id: BreakerId,
        token: &CancellationToken,
    ) -> Result<()> {
        loop {
            let result = match kind {
                // Device steps run to completion; cancellation takes effect before the next step
                StepKind::ServerShutdown { server_id } => {
                    self.executor.shutdown_server(*server_id).await
                },
                StepKind::Delay { duration } => sleep_or_cancel(*duration, token).await,
                StepKind::BreakerOff => self.executor.cut_breaker(breaker_id).await,
            };

            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if err.is_cancelled() {
                return Err(err);
            }

            let attempt = self
                .update(id, |s| {
                    let step = &mut s.steps[index];
                    if step.retry_count < step.max_retries {
                        step.retry_count += 1;
                        Some(step.retry_count)
                    } else {
                        None
                    }
                })
                .flatten();

            match attempt {
                Some(n) => {
                    warn!(
                        "Sequence {} step {} failed ({}), retry {} in {:?}",
                        id,
                        index + 1,
                        err,
                        n,
                        self.settings.retry_backoff
                    );
                    sleep_or_cancel(self.settings.retry_backoff, token).await?;
                },
                None => return Err(err),
            }
        }
    }

    /// Mark a step failed and return its retry count
    fn fail_step(&self, id: SequenceId, index: usize, err: &DevSrvError) -> u32 {
        self.update(id, |s| {
            let step = &mut s.steps[index];
            step.status = StepStatus::Failed;
            step.end_time = Some(Utc::now());
            step.error = Some(err.to_string());
            step.retry_count
        })
        .unwrap_or_default()
    }

    fn finish_cancelled(&self, id: SequenceId, at_step: Option<u32>) -> SequenceStatus {
        let message = match at_step {
            Some(step_id) => format!("cancelled during step {step_id}"),
            None => "cancelled between steps".to_string(),
        };
        warn!("Shutdown sequence {} {}", id, message);

        self.update(id, |s| {
            s.status = SequenceStatus::Cancelled;
            s.end_time = Some(Utc::now());
            s.error_message = Some(message.clone());
        });
        self.publisher.publish(
            SEQUENCE_CANCELLED,
            json!({"sequence_id": id, "reason": message}),
        );
        SequenceStatus::Cancelled
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::testing::{RecordingPublisher, ScriptedExecutor, StepCall};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn settings() -> ShutdownSettings {
        ShutdownSettings {
            delay: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(1),
            max_retries: 3,
        }
    }

    fn orchestrator(
        executor: ScriptedExecutor,
    ) -> (
        ShutdownOrchestrator,
        Arc<ScriptedExecutor>,
        Arc<RecordingPublisher>,
    ) {
        let executor = Arc::new(executor);
        let publisher = Arc::new(RecordingPublisher::new());
        let orch = ShutdownOrchestrator::new(executor.clone(), publisher.clone(), settings());
        (orch, executor, publisher)
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let (orch, _, _) = orchestrator(ScriptedExecutor::new());
        assert!(matches!(
            orch.create_sequence("  ", 1, vec![1]),
            Err(DevSrvError::ValidationError(_))
        ));
        assert!(orch.list_sequences().is_empty());
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_increasing() {
        let (orch, _, _) = orchestrator(ScriptedExecutor::new());
        let a = orch.create_sequence("a", 1, vec![]).unwrap();
        let b = orch.create_sequence("b", 1, vec![]).unwrap();
        assert!(b.id > a.id);
        let ids: Vec<_> = orch.list_sequences().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_happy_path_runs_steps_in_order() {
        let (orch, executor, publisher) = orchestrator(ScriptedExecutor::new());
        let seq = orch.create_sequence("rack-a", 9, vec![1, 2]).unwrap();

        let handle = orch.execute(seq.id).unwrap();
        assert_eq!(handle.await.unwrap(), SequenceStatus::Completed);

        assert_eq!(
            executor.calls(),
            vec![
                StepCall::ShutdownServer(1),
                StepCall::ShutdownServer(2),
                StepCall::CutBreaker(9),
            ]
        );
        let done = orch.get_sequence(seq.id).unwrap();
        assert_eq!(done.progress, 100);
        assert_eq!(done.completed_steps(), 4);
        assert!(done.start_time.is_some() && done.end_time.is_some());
        assert!(done.outcome().is_ok());

        let types = publisher.event_types();
        assert_eq!(types.first().map(String::as_str), Some(SEQUENCE_STARTED));
        assert_eq!(types.last().map(String::as_str), Some(SEQUENCE_COMPLETED));
        let progress: Vec<_> = publisher
            .of_type(STEP_COMPLETED)
            .iter()
            .map(|p| p["progress"].as_u64().unwrap())
            .collect();
        assert_eq!(progress, vec![25, 50, 75, 100]);
    }

    #[tokio::test]
    async fn test_server_failure_never_cuts_breaker() {
        let (orch, executor, publisher) =
            orchestrator(ScriptedExecutor::new().fail_server_always(2));
        let seq = orch.create_sequence("rack-a", 9, vec![1, 2, 3]).unwrap();

        let status = orch.execute(seq.id).unwrap().await.unwrap();
        assert_eq!(status, SequenceStatus::Failed);
        assert_eq!(executor.breaker_cuts(), 0);
        assert!(!executor.calls().contains(&StepCall::ShutdownServer(3)));

        let done = orch.get_sequence(seq.id).unwrap();
        assert_eq!(done.steps[1].status, StepStatus::Failed);
        assert_eq!(done.steps[1].retry_count, 3);
        assert_eq!(done.steps[2].status, StepStatus::Pending);
        assert!(done.error_message.unwrap().contains("step 2"));
        assert_eq!(publisher.of_type(SEQUENCE_FAILED).len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_transient_failure_recovers_with_retries() {
        let (orch, executor, _) = orchestrator(ScriptedExecutor::new().fail_server(1, 2));
        let seq = orch.create_sequence("rack-a", 9, vec![1]).unwrap();

        let status = orch.execute(seq.id).unwrap().await.unwrap();
        assert_eq!(status, SequenceStatus::Completed);

        let done = orch.get_sequence(seq.id).unwrap();
        assert_eq!(done.steps[0].retry_count, 2);
        assert_eq!(executor.breaker_cuts(), 1);
        assert!(logs_contain("retry 2 in"));
    }

    #[tokio::test]
    async fn test_execute_twice_while_running_rejected() {
        let (orch, _, _) = orchestrator(ScriptedExecutor::new());
        let seq = orch.create_sequence("rack-a", 9, vec![]).unwrap();

        let handle = orch.execute(seq.id).unwrap();
        assert!(matches!(orch.execute(seq.id), Err(DevSrvError::StateError(_))));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_sequence() {
        let (orch, _, _) = orchestrator(ScriptedExecutor::new());
        assert!(matches!(orch.execute(42), Err(DevSrvError::NotFound(_))));
        assert!(matches!(orch.cancel(42), Err(DevSrvError::NotFound(_))));
        assert!(matches!(orch.get_sequence(42), Err(DevSrvError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_requires_running() {
        let (orch, _, _) = orchestrator(ScriptedExecutor::new());
        let seq = orch.create_sequence("rack-a", 9, vec![]).unwrap();
        assert!(matches!(orch.cancel(seq.id), Err(DevSrvError::StateError(_))));
    }

    #[tokio::test]
    async fn test_cancel_during_delay_skips_breaker() {
        let executor = Arc::new(ScriptedExecutor::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let orch = ShutdownOrchestrator::new(
            executor.clone(),
            publisher.clone(),
            ShutdownSettings {
                delay: Duration::from_secs(30),
                ..settings()
            },
        );
        let seq = orch.create_sequence("rack-a", 9, vec![1]).unwrap();

        let handle = orch.execute(seq.id).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        orch.cancel(seq.id).unwrap();

        let status = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, SequenceStatus::Cancelled);
        assert_eq!(executor.breaker_cuts(), 0);

        let done = orch.get_sequence(seq.id).unwrap();
        assert_eq!(done.steps[0].status, StepStatus::Completed);
        assert_eq!(done.steps[1].status, StepStatus::Failed);
        assert_eq!(done.steps[2].status, StepStatus::Pending);
        assert!(done.outcome().is_err());
        assert_eq!(publisher.of_type(SEQUENCE_CANCELLED).len(), 1);
    }

    #[tokio::test]
    async fn test_finished_sequence_can_run_again() {
        let (orch, executor, _) = orchestrator(ScriptedExecutor::new().fail_server(1, 4));
        let seq = orch.create_sequence("rack-a", 9, vec![1]).unwrap();

        let first = orch.execute(seq.id).unwrap().await.unwrap();
        assert_eq!(first, SequenceStatus::Failed);

        // One scripted failure remains; the reset run absorbs it with a retry
        let second = orch.execute(seq.id).unwrap().await.unwrap();
        assert_eq!(second, SequenceStatus::Completed);

        let done = orch.get_sequence(seq.id).unwrap();
        assert_eq!(done.steps[0].retry_count, 1);
        assert!(done.error_message.is_none());
        assert_eq!(executor.breaker_cuts(), 1);
    }
}
