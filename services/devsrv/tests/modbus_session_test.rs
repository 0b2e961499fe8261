//! Modbus TCP session against the in-process device simulator

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod support;

use std::sync::Arc;
use std::time::Duration;

use devsrv::collaborators::{BreakerTarget, NoopPublisher};
use devsrv::devices::{
    ActionOutcome, BreakerModel, BreakerService, BreakerState, BreakerTiming, ReadingStatus,
    SensorProtocol,
};
use devsrv::protocols::modbus::constants::{
    BREAKER_CONTROL_REGISTER, BREAKER_LOCK_COIL, BREAKER_STATUS_INPUT, BREAKER_SWITCH_COIL,
    CONTROL_REMOTE_LOCK_BIT,
};
use devsrv::protocols::modbus::{
    DeviceEndpoint, ModbusRequest, ModbusSession, RegisterClient, ResponseBody, TcpSessionFactory,
};
use devsrv::retry::PollPolicy;
use devsrv::DevSrvError;
use support::{Behavior, ModbusTcpSimulator};

const TIMEOUT: Duration = Duration::from_millis(300);

fn session(sim: &ModbusTcpSimulator, unit_id: u8) -> ModbusSession {
    ModbusSession::new(DeviceEndpoint::new(sim.host(), sim.port(), unit_id))
        .with_timeouts(TIMEOUT, TIMEOUT)
}

fn factory() -> Arc<TcpSessionFactory> {
    Arc::new(TcpSessionFactory::new(TIMEOUT, TIMEOUT))
}

#[tokio::test]
async fn test_read_holding_round_trip() {
    let sim = ModbusTcpSimulator::start().await;
    sim.set_holding(0x0010, 19);
    sim.set_input(0x0000, 0x00F0);

    let mut session = session(&sim, 1);
    assert_eq!(session.read_holding(0x0010).await.unwrap(), 19);
    assert_eq!(session.read_input(0x0000).await.unwrap(), 0x00F0);
    assert!(session.is_connected());
    assert_eq!(sim.connections(), 1);
}

#[tokio::test]
async fn test_multi_register_read() {
    let sim = ModbusTcpSimulator::start().await;
    for (offset, value) in [250u16, 251, 252].iter().enumerate() {
        sim.set_holding(offset as u16, *value);
    }

    let mut session = session(&sim, 3);
    let body = session
        .request(ModbusRequest::read_holding(0, 3))
        .await
        .unwrap();
    assert_eq!(body, ResponseBody::Registers(vec![250, 251, 252]));
}

#[tokio::test]
async fn test_writes_are_echoed() {
    let sim = ModbusTcpSimulator::start().await;
    let mut session = session(&sim, 1);

    session.write_coil(BREAKER_LOCK_COIL, true).await.unwrap();
    session
        .write_register(BREAKER_CONTROL_REGISTER, 0x0003)
        .await
        .unwrap();

    assert_eq!(sim.coil(BREAKER_LOCK_COIL), Some(true));
    assert_eq!(sim.holding(BREAKER_CONTROL_REGISTER), Some(0x0003));
}

#[tokio::test]
async fn test_exception_keeps_connection() {
    let sim = ModbusTcpSimulator::start().await;
    let mut session = session(&sim, 1);

    // Unmapped address
    let err = session.read_holding(0x0100).await.unwrap_err();
    assert_eq!(err, DevSrvError::DeviceException { code: 0x02 });
    assert!(session.is_connected());

    sim.set_behavior(Behavior::Exception(0x04));
    let err = session.write_coil(1, true).await.unwrap_err();
    assert_eq!(err, DevSrvError::DeviceException { code: 0x04 });
    assert_eq!(sim.connections(), 1);
}

#[tokio::test]
async fn test_timeout_then_reconnect() {
    let sim = ModbusTcpSimulator::start().await;
    sim.set_holding(0x0010, 7);
    sim.set_behavior(Behavior::Silent);

    let mut session = session(&sim, 1);
    let err = session.read_holding(0x0010).await.unwrap_err();
    assert!(matches!(err, DevSrvError::TimeoutError(_)));
    assert!(!session.is_connected());

    // The next request dials a fresh connection
    sim.set_behavior(Behavior::Normal);
    assert_eq!(session.read_holding(0x0010).await.unwrap(), 7);
    assert_eq!(sim.connections(), 2);
}

#[tokio::test]
async fn test_connect_to_helper() {
    let sim = ModbusTcpSimulator::start().await;
    let session = ModbusSession::connect_to(&sim.host(), sim.port(), 1, TIMEOUT)
        .await
        .unwrap();
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_sensor_detection_over_tcp() {
    let sim = ModbusTcpSimulator::start().await;
    sim.set_holding(0x10, 19);
    sim.set_holding(0x11, 1);
    sim.set_holding(0x12, 3);
    sim.set_holding(0x13, 0);
    for (channel, raw) in [250u16, 65360, 0xF8CE, 2000, 215, 300].iter().enumerate() {
        sim.set_holding(channel as u16, *raw);
    }

    let result = SensorProtocol::new(factory())
        .detect(&sim.host(), sim.port(), 1)
        .await;

    assert!(result.connection_ok);
    assert!(result.device_type_ok);
    assert!(result.temperature_ok);
    assert_eq!(result.device_address, Some(1));
    assert_eq!(result.temperatures.len(), 6);
    assert_eq!(result.temperatures[0].value, Some(25.0));
    assert_eq!(result.temperatures[2].status, ReadingStatus::OpenCircuit);
    assert_eq!(result.temperatures[3].status, ReadingStatus::OutOfRange);
}

#[tokio::test]
async fn test_sensor_detection_unreachable() {
    let sim = ModbusTcpSimulator::start().await;
    let port = sim.port();
    sim.stop();
    drop(sim);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let result = SensorProtocol::new(factory())
        .detect("127.0.0.1", port, 1)
        .await;
    assert!(!result.connection_ok);
    assert!(!result.device_type_ok);
    assert!(result.temperatures.is_empty());
}

fn timing() -> BreakerTiming {
    BreakerTiming {
        verify_delay: Duration::from_millis(5),
        poll: PollPolicy::new(10, Duration::from_millis(5)),
    }
}

fn breaker(sim: &ModbusTcpSimulator, model: BreakerModel) -> BreakerTarget {
    BreakerTarget {
        id: 9,
        name: "rack-a".into(),
        endpoint: DeviceEndpoint::new(sim.host(), sim.port(), 1),
        model,
    }
}

#[tokio::test]
async fn test_switch_breaker_close_and_open_over_tcp() {
    let sim = ModbusTcpSimulator::start().await;
    sim.set_input(BREAKER_STATUS_INPUT, 0x000F);
    sim.set_holding(BREAKER_CONTROL_REGISTER, 0);
    sim.on_coil(|bank, address, on| {
        if address == BREAKER_SWITCH_COIL {
            bank.input
                .insert(BREAKER_STATUS_INPUT, if on { 0x00F0 } else { 0x000F });
        }
    });

    let service = BreakerService::new(factory(), timing(), Arc::new(NoopPublisher));
    let target = breaker(&sim, BreakerModel::SwitchControl);

    assert_eq!(service.close(&target).await.unwrap(), ActionOutcome::Applied);
    assert_eq!(
        service.close(&target).await.unwrap(),
        ActionOutcome::AlreadyInState
    );
    match service.status(&target).await.unwrap() {
        BreakerState::SwitchControl(status) => assert!(status.closed),
        other => panic!("unexpected state {other:?}"),
    }

    assert_eq!(service.cut_power(&target).await.unwrap(), ActionOutcome::Applied);
    assert_eq!(sim.input(BREAKER_STATUS_INPUT), Some(0x000F));
}

#[tokio::test]
async fn test_lock_breaker_register_fallback_over_tcp() {
    let sim = ModbusTcpSimulator::start().await;
    // Auto mode on, unlocked; the lock coil is accepted but has no effect
    sim.set_holding(BREAKER_CONTROL_REGISTER, 0x0001);

    let service = BreakerService::new(factory(), timing(), Arc::new(NoopPublisher));
    let target = breaker(&sim, BreakerModel::LockControl);

    assert_eq!(service.lock(&target).await.unwrap(), ActionOutcome::Applied);
    assert_eq!(sim.coil(BREAKER_LOCK_COIL), Some(true));
    assert_eq!(
        sim.holding(BREAKER_CONTROL_REGISTER),
        Some(0x0001 | CONTROL_REMOTE_LOCK_BIT)
    );

    let err = service.close(&target).await.unwrap_err();
    assert!(matches!(err, DevSrvError::StateError(_)));
}
