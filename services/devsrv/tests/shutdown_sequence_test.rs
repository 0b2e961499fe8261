//! Orchestrator scenarios driven through the public API

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::Duration;

use devsrv::collaborators::events::{
    BREAKER_STATE_CHANGED, SEQUENCE_CANCELLED, SEQUENCE_FAILED, STEP_FAILED,
};
use devsrv::collaborators::{BreakerTarget, Credentials, ServerTarget, StaticInventory};
use devsrv::devices::{BreakerModel, BreakerService, BreakerTiming};
use devsrv::protocols::modbus::DeviceEndpoint;
use devsrv::retry::PollPolicy;
use devsrv::shutdown::{
    DeviceStepExecutor, SequenceStatus, ShutdownOrchestrator, ShutdownSettings, StepKind,
    StepStatus,
};
use devsrv::testing::{
    MockRegisters, MockSessionFactory, RecordingPublisher, RecordingShell, ScriptedExecutor,
    StepCall,
};
use devsrv::DevSrvError;

fn fast_settings() -> ShutdownSettings {
    ShutdownSettings {
        delay: Duration::from_millis(20),
        retry_backoff: Duration::from_millis(2),
        max_retries: 3,
    }
}

fn orchestrator_with(
    executor: Arc<ScriptedExecutor>,
    settings: ShutdownSettings,
) -> (ShutdownOrchestrator, Arc<RecordingPublisher>) {
    let publisher = Arc::new(RecordingPublisher::new());
    let orch = ShutdownOrchestrator::new(executor, publisher.clone(), settings);
    (orch, publisher)
}

#[tokio::test]
async fn test_sequence_construction() {
    let (orch, _) = orchestrator_with(Arc::new(ScriptedExecutor::new()), fast_settings());
    let seq = orch.create_sequence("test", 9, vec![1, 2]).unwrap();

    assert_eq!(seq.status, SequenceStatus::Created);
    assert_eq!(seq.steps.len(), 4);
    assert_eq!(seq.steps[3].kind, StepKind::BreakerOff);
    assert!(matches!(seq.steps[2].kind, StepKind::Delay { .. }));
    assert_eq!(orch.get_sequence(seq.id).unwrap(), seq);
}

#[tokio::test]
async fn test_first_step_failure_stops_everything() {
    let executor = Arc::new(ScriptedExecutor::new().fail_server_always(1));
    let (orch, publisher) = orchestrator_with(executor.clone(), fast_settings());
    let seq = orch.create_sequence("test", 9, vec![1, 2]).unwrap();

    let status = orch.execute(seq.id).unwrap().await.unwrap();
    assert_eq!(status, SequenceStatus::Failed);

    // Only the first server was ever attempted, once plus three retries
    assert_eq!(executor.calls(), vec![StepCall::ShutdownServer(1); 4]);

    let done = orch.get_sequence(seq.id).unwrap();
    assert_eq!(done.steps[0].status, StepStatus::Failed);
    assert_eq!(done.steps[0].retry_count, done.steps[0].max_retries);
    for step in &done.steps[1..] {
        assert_eq!(step.status, StepStatus::Pending);
    }
    assert!(done.error_message.as_deref().unwrap().contains("step 1"));
    assert!(matches!(done.outcome(), Err(DevSrvError::SequenceAbort(_))));

    assert_eq!(publisher.of_type(STEP_FAILED)[0]["retry_count"], 3);
    assert_eq!(publisher.of_type(SEQUENCE_FAILED).len(), 1);
}

#[tokio::test]
async fn test_breaker_failure_is_retried() {
    let executor = Arc::new(ScriptedExecutor::new().fail_breaker(2));
    let (orch, _) = orchestrator_with(executor.clone(), fast_settings());
    let seq = orch.create_sequence("test", 9, vec![1]).unwrap();

    let status = orch.execute(seq.id).unwrap().await.unwrap();
    assert_eq!(status, SequenceStatus::Completed);
    assert_eq!(executor.breaker_cuts(), 3);
    assert_eq!(orch.get_sequence(seq.id).unwrap().steps[2].retry_count, 2);
}

#[tokio::test]
async fn test_cancel_during_delay_never_cuts_breaker() {
    let executor = Arc::new(ScriptedExecutor::new());
    let (orch, publisher) = orchestrator_with(
        executor.clone(),
        ShutdownSettings {
            delay: Duration::from_secs(60),
            ..fast_settings()
        },
    );
    let seq = orch.create_sequence("test", 9, vec![1, 2]).unwrap();
    let handle = orch.execute(seq.id).unwrap();

    // Wait until both servers are down and the delay is running
    for _ in 0..100 {
        if orch.get_sequence(seq.id).unwrap().steps[2].status == StepStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    orch.cancel(seq.id).unwrap();

    let status = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, SequenceStatus::Cancelled);
    assert_eq!(executor.breaker_cuts(), 0);

    let done = orch.get_sequence(seq.id).unwrap();
    assert_eq!(done.status, SequenceStatus::Cancelled);
    assert_eq!(done.steps[3].status, StepStatus::Pending);
    assert!(done.end_time.is_some());
    assert_eq!(publisher.of_type(SEQUENCE_CANCELLED).len(), 1);

    // Cancelling a finished sequence is a state error
    assert!(matches!(orch.cancel(seq.id), Err(DevSrvError::StateError(_))));
}

#[tokio::test]
async fn test_cancel_lets_running_server_step_finish() {
    let executor = Arc::new(ScriptedExecutor::new().with_latency(Duration::from_millis(100)));
    let (orch, publisher) = orchestrator_with(executor.clone(), fast_settings());
    let seq = orch.create_sequence("test", 9, vec![1, 2]).unwrap();

    let handle = orch.execute(seq.id).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    orch.cancel(seq.id).unwrap();

    let status = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, SequenceStatus::Cancelled);

    // The in-flight shutdown of server 1 completed; server 2 never started
    assert_eq!(executor.calls(), vec![StepCall::ShutdownServer(1)]);
    let done = orch.get_sequence(seq.id).unwrap();
    assert_eq!(done.steps[0].status, StepStatus::Completed);
    assert_eq!(done.steps[1].status, StepStatus::Pending);
    assert_eq!(done.progress, 25);
    assert_eq!(publisher.of_type(SEQUENCE_CANCELLED)[0]["reason"], "cancelled between steps");
}

#[tokio::test]
async fn test_concurrent_sequences_are_independent() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .fail_server_always(13)
            .with_latency(Duration::from_millis(5)),
    );
    let (orch, _) = orchestrator_with(executor.clone(), fast_settings());

    let good = orch.create_sequence("rack-a", 1, vec![11, 12]).unwrap();
    let bad = orch.create_sequence("rack-b", 2, vec![13]).unwrap();
    let good_handle = orch.execute(good.id).unwrap();
    let bad_handle = orch.execute(bad.id).unwrap();

    let listed: Vec<_> = orch.list_sequences().iter().map(|s| s.status).collect();
    assert_eq!(listed, vec![SequenceStatus::Running, SequenceStatus::Running]);

    assert_eq!(good_handle.await.unwrap(), SequenceStatus::Completed);
    assert_eq!(bad_handle.await.unwrap(), SequenceStatus::Failed);

    let calls = executor.calls();
    assert!(calls.contains(&StepCall::CutBreaker(1)));
    assert!(!calls.contains(&StepCall::CutBreaker(2)));
}

#[tokio::test]
async fn test_device_executor_end_to_end() {
    let inventory = StaticInventory::new(
        [ServerTarget {
            id: 1,
            name: "app-1".into(),
            host: "10.0.1.1".into(),
            ssh_port: 22,
            credentials: Credentials {
                username: "ops".into(),
                ..Default::default()
            },
            shutdown_command: None,
        }],
        [BreakerTarget {
            id: 9,
            name: "rack-a".into(),
            endpoint: DeviceEndpoint::new("10.0.2.9", 502, 1),
            model: BreakerModel::LockControl,
        }],
    );
    let registers = MockRegisters::lock_breaker(false, true);
    let publisher = Arc::new(RecordingPublisher::new());
    let breakers = BreakerService::new(
        Arc::new(MockSessionFactory::new(registers.clone())),
        BreakerTiming {
            verify_delay: Duration::from_millis(1),
            poll: PollPolicy::new(3, Duration::from_millis(1)),
        },
        publisher.clone(),
    );
    let shell = Arc::new(RecordingShell::new(0));
    let executor = DeviceStepExecutor::new(
        Arc::new(inventory),
        shell.clone(),
        Arc::new(breakers),
        "sudo shutdown -h now",
    );
    let orch = ShutdownOrchestrator::new(Arc::new(executor), publisher.clone(), fast_settings());

    let seq = orch.create_sequence("rack-a", 9, vec![1]).unwrap();
    let status = orch.execute(seq.id).unwrap().await.unwrap();

    assert_eq!(status, SequenceStatus::Completed);
    assert_eq!(shell.commands().len(), 1);
    // Lock-control breakers are cut by engaging the remote lock
    assert_eq!(registers.coil_writes(), vec![(0x0003, true)]);
    assert_eq!(publisher.of_type(BREAKER_STATE_CHANGED).len(), 1);
}

#[tokio::test]
async fn test_unknown_server_fails_sequence() {
    let inventory = StaticInventory::new(Vec::<ServerTarget>::new(), Vec::<BreakerTarget>::new());
    let executor = DeviceStepExecutor::new(
        Arc::new(inventory),
        Arc::new(RecordingShell::new(0)),
        Arc::new(BreakerService::new(
            Arc::new(MockSessionFactory::unreachable()),
            BreakerTiming::default(),
            Arc::new(RecordingPublisher::new()),
        )),
        "true",
    );
    let orch = ShutdownOrchestrator::new(
        Arc::new(executor),
        Arc::new(RecordingPublisher::new()),
        fast_settings(),
    );

    let seq = orch.create_sequence("ghost", 9, vec![77]).unwrap();
    let status = orch.execute(seq.id).unwrap().await.unwrap();
    assert_eq!(status, SequenceStatus::Failed);

    let done = orch.get_sequence(seq.id).unwrap();
    assert!(done.error_message.unwrap().contains("server 77"));
}
