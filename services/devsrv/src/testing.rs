//! Test doubles for the device protocols and the orchestrator
//!
//! Shared by the unit tests and the integration tests under `tests/`.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::collaborators::events::{Event, EventPublisher};
use crate::collaborators::inventory::{BreakerId, Credentials, ServerId};
use crate::collaborators::remote::{CommandOutput, RemoteShell};
use crate::error::{DevSrvError, Result};
use crate::protocols::modbus::constants::{
    BREAKER_CONTROL_REGISTER, BREAKER_LOCK_COIL, BREAKER_STATUS_INPUT, BREAKER_SWITCH_COIL,
    BREAKER_SWITCH_LOCK_COIL, CONTROL_REMOTE_LOCK_BIT, STATUS_SWITCH_CLOSED, STATUS_SWITCH_OPEN,
};
use crate::protocols::modbus::{DeviceEndpoint, RegisterClient, SessionFactory};
use crate::shutdown::StepExecutor;

// ============================================================================
// Register-level mock
// ============================================================================

/// Register contents of a simulated device
#[derive(Debug, Default, Clone)]
pub struct RegisterBank {
    pub holding: HashMap<u16, u16>,
    pub input: HashMap<u16, u16>,
    pub coils: HashMap<u16, bool>,
}

/// A write the client attempted, successful or not
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteRecord {
    Coil { address: u16, on: bool },
    Register { address: u16, value: u16 },
}

type WriteHook = Box<dyn FnMut(&mut RegisterBank, &WriteRecord) + Send>;

#[derive(Default)]
struct MockState {
    bank: RegisterBank,
    writes: Vec<WriteRecord>,
    reads: usize,
    hook: Option<WriteHook>,
    rejected_coils: HashSet<u16>,
    failure: Option<DevSrvError>,
    fail_after_write: Option<DevSrvError>,
}

/// In-memory [`RegisterClient`]; clones share state
///
/// Unmapped registers answer with exception 0x02 like a real device.
#[derive(Clone, Default)]
pub struct MockRegisters {
    state: Arc<Mutex<MockState>>,
}

impl MockRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_holding(&self, address: u16, value: u16) {
        self.state.lock().bank.holding.insert(address, value);
    }

    pub fn set_input(&self, address: u16, value: u16) {
        self.state.lock().bank.input.insert(address, value);
    }

    pub fn holding(&self, address: u16) -> Option<u16> {
        self.state.lock().bank.holding.get(&address).copied()
    }

    pub fn input(&self, address: u16) -> Option<u16> {
        self.state.lock().bank.input.get(&address).copied()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    pub fn coil_writes(&self) -> Vec<(u16, bool)> {
        self.writes()
            .into_iter()
            .filter_map(|w| match w {
                WriteRecord::Coil { address, on } => Some((address, on)),
                WriteRecord::Register { .. } => None,
            })
            .collect()
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    /// Run `hook` after every accepted write to model device behavior
    pub fn on_write(&self, hook: impl FnMut(&mut RegisterBank, &WriteRecord) + Send + 'static) {
        self.state.lock().hook = Some(Box::new(hook));
    }

    /// Answer writes to `address` with exception 0x04
    pub fn reject_coil(&self, address: u16) {
        self.state.lock().rejected_coils.insert(address);
    }

    /// Fail every call with `error` until [`MockRegisters::recover`]
    pub fn fail_with(&self, error: DevSrvError) {
        self.state.lock().failure = Some(error);
    }

    /// Accept the next write, then fail every call with `error`
    pub fn fail_after_next_write(&self, error: DevSrvError) {
        self.state.lock().fail_after_write = Some(error);
    }

    pub fn recover(&self) {
        self.state.lock().failure = None;
    }

    /// Switch-control breaker whose switch follows coil 0x0001 and whose
    /// remote lock follows coil 0x0002
    pub fn switch_breaker(closed: bool, local_locked: bool, remote_locked: bool) -> Self {
        let registers = Self::new();
        let high = if local_locked { 0x0100 } else { 0 };
        let low = if closed {
            STATUS_SWITCH_CLOSED
        } else {
            STATUS_SWITCH_OPEN
        };
        registers.set_input(BREAKER_STATUS_INPUT, high | u16::from(low));
        registers.set_holding(
            BREAKER_CONTROL_REGISTER,
            if remote_locked { CONTROL_REMOTE_LOCK_BIT } else { 0 },
        );
        registers.on_write(|bank, write| {
            if let WriteRecord::Coil { address, on } = *write {
                if address == BREAKER_SWITCH_COIL {
                    let status = bank.input.entry(BREAKER_STATUS_INPUT).or_default();
                    let state = if on {
                        STATUS_SWITCH_CLOSED
                    } else {
                        STATUS_SWITCH_OPEN
                    };
                    *status = (*status & 0xFF00) | u16::from(state);
                } else if address == BREAKER_SWITCH_LOCK_COIL {
                    set_lock_bit(bank, on);
                }
            }
        });
        registers
    }

    /// Lock-control breaker; when `coil_effective` is false the lock coil is
    /// acknowledged but ignored, so only the register path works
    pub fn lock_breaker(locked: bool, coil_effective: bool) -> Self {
        let registers = Self::new();
        registers.set_holding(
            BREAKER_CONTROL_REGISTER,
            if locked { CONTROL_REMOTE_LOCK_BIT } else { 0 },
        );
        registers.on_write(move |bank, write| {
            if let WriteRecord::Coil { address, on } = *write {
                if address == BREAKER_LOCK_COIL && coil_effective {
                    set_lock_bit(bank, on);
                }
            }
        });
        registers
    }

    fn check_failure(state: &MockState) -> Result<()> {
        match &state.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn record_write(&self, write: WriteRecord) -> Result<()> {
        let mut state = self.state.lock();
        state.writes.push(write);
        Self::check_failure(&state)?;

        match write {
            WriteRecord::Coil { address, on } => {
                if state.rejected_coils.contains(&address) {
                    return Err(DevSrvError::DeviceException { code: 0x04 });
                }
                state.bank.coils.insert(address, on);
            },
            WriteRecord::Register { address, value } => {
                state.bank.holding.insert(address, value);
            },
        }

        if let Some(mut hook) = state.hook.take() {
            hook(&mut state.bank, &write);
            state.hook = Some(hook);
        }
        if let Some(err) = state.fail_after_write.take() {
            state.failure = Some(err);
        }
        Ok(())
    }
}

fn set_lock_bit(bank: &mut RegisterBank, locked: bool) {
    let control = bank.holding.entry(BREAKER_CONTROL_REGISTER).or_default();
    if locked {
        *control |= CONTROL_REMOTE_LOCK_BIT;
    } else {
        *control &= !CONTROL_REMOTE_LOCK_BIT;
    }
}

#[async_trait]
impl RegisterClient for MockRegisters {
    async fn read_holding(&mut self, address: u16) -> Result<u16> {
        let mut state = self.state.lock();
        state.reads += 1;
        Self::check_failure(&state)?;
        state
            .bank
            .holding
            .get(&address)
            .copied()
            .ok_or(DevSrvError::DeviceException { code: 0x02 })
    }

    async fn read_input(&mut self, address: u16) -> Result<u16> {
        let mut state = self.state.lock();
        state.reads += 1;
        Self::check_failure(&state)?;
        state
            .bank
            .input
            .get(&address)
            .copied()
            .ok_or(DevSrvError::DeviceException { code: 0x02 })
    }

    async fn write_coil(&mut self, address: u16, on: bool) -> Result<()> {
        self.record_write(WriteRecord::Coil { address, on })
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<()> {
        self.record_write(WriteRecord::Register { address, value })
    }
}

/// Hands out [`MockRegisters`] per endpoint
#[derive(Default)]
pub struct MockSessionFactory {
    fallback: Option<MockRegisters>,
    devices: Mutex<HashMap<DeviceEndpoint, MockRegisters>>,
    unreachable: Mutex<HashSet<DeviceEndpoint>>,
    opened: AtomicUsize,
}

impl MockSessionFactory {
    /// Every endpoint resolves to `registers`
    pub fn new(registers: MockRegisters) -> Self {
        Self {
            fallback: Some(registers),
            ..Default::default()
        }
    }

    /// No endpoint is reachable unless added with [`MockSessionFactory::with_device`]
    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn with_device(self, endpoint: DeviceEndpoint, registers: MockRegisters) -> Self {
        self.devices.lock().insert(endpoint, registers);
        self
    }

    pub fn set_reachable(&self, endpoint: &DeviceEndpoint, reachable: bool) {
        let mut unreachable = self.unreachable.lock();
        if reachable {
            unreachable.remove(endpoint);
        } else {
            unreachable.insert(endpoint.clone());
        }
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn open(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn RegisterClient>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.lock().contains(endpoint) {
            return Err(DevSrvError::connection(format!("{endpoint} unreachable")));
        }
        let registers = self
            .devices
            .lock()
            .get(endpoint)
            .cloned()
            .or_else(|| self.fallback.clone());
        match registers {
            Some(registers) => Ok(Box::new(registers)),
            None => Err(DevSrvError::connection(format!(
                "Failed to connect to {endpoint}: connection refused"
            ))),
        }
    }
}

// ============================================================================
// Event recording
// ============================================================================

#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<Event>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    pub fn of_type(&self, event_type: &str) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .map(|e| e.payload.clone())
            .collect()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event_type: &str, payload: Value) {
        self.events.lock().push(Event::new(event_type, payload));
    }
}

// ============================================================================
// Orchestrator doubles
// ============================================================================

/// A call made to a [`ScriptedExecutor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCall {
    ShutdownServer(ServerId),
    CutBreaker(BreakerId),
}

/// Step executor whose failures and latency are scripted per target
#[derive(Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<StepCall>>,
    /// Remaining failures per server; `u32::MAX` fails forever
    server_failures: Mutex<HashMap<ServerId, u32>>,
    breaker_failures: Mutex<u32>,
    latency: Mutex<Duration>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_server(self, server_id: ServerId, times: u32) -> Self {
        self.server_failures.lock().insert(server_id, times);
        self
    }

    pub fn fail_server_always(self, server_id: ServerId) -> Self {
        self.fail_server(server_id, u32::MAX)
    }

    pub fn fail_breaker(self, times: u32) -> Self {
        *self.breaker_failures.lock() = times;
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    pub fn calls(&self) -> Vec<StepCall> {
        self.calls.lock().clone()
    }

    pub fn breaker_cuts(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, StepCall::CutBreaker(_)))
            .count()
    }

    fn take_failure(counter: &mut u32) -> bool {
        match *counter {
            0 => false,
            u32::MAX => true,
            _ => {
                *counter -= 1;
                true
            },
        }
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn shutdown_server(&self, server_id: ServerId) -> Result<()> {
        self.calls.lock().push(StepCall::ShutdownServer(server_id));
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let fail = self
            .server_failures
            .lock()
            .get_mut(&server_id)
            .is_some_and(Self::take_failure);
        if fail {
            return Err(DevSrvError::remote_command(format!(
                "server {server_id}: shutdown exited with 255"
            )));
        }
        Ok(())
    }

    async fn cut_breaker(&self, breaker_id: BreakerId) -> Result<()> {
        self.calls.lock().push(StepCall::CutBreaker(breaker_id));
        if Self::take_failure(&mut self.breaker_failures.lock()) {
            return Err(DevSrvError::timeout(format!(
                "breaker {breaker_id} did not confirm open"
            )));
        }
        Ok(())
    }
}

/// Remote shell that records commands and returns a fixed exit code
#[derive(Debug, Default)]
pub struct RecordingShell {
    commands: Mutex<Vec<(String, u16, String)>>,
    exit_code: i32,
}

impl RecordingShell {
    pub fn new(exit_code: i32) -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            exit_code,
        }
    }

    /// `(host, port, command)` per call
    pub fn commands(&self) -> Vec<(String, u16, String)> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl RemoteShell for RecordingShell {
    async fn execute_command(
        &self,
        host: &str,
        port: u16,
        _credentials: &Credentials,
        command: &str,
    ) -> Result<CommandOutput> {
        self.commands
            .lock()
            .push((host.to_string(), port, command.to_string()));
        Ok(CommandOutput {
            output: String::new(),
            exit_code: self.exit_code,
            duration_ms: 0,
        })
    }
}
