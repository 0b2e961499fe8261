//! Modbus TCP device simulator for integration tests
//!
//! Serves FC 03/04/05/06 for any unit id from one shared register bank.
//! Unmapped addresses answer with exception 0x02.

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const ILLEGAL_FUNCTION: u8 = 0x01;
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// How the simulator answers requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Normal,
    /// Read requests but never reply
    Silent,
    /// Reply with this exception code to everything
    Exception(u8),
}

type CoilHook = Box<dyn FnMut(&mut Bank, u16, bool) + Send>;

#[derive(Debug, Default)]
pub struct Bank {
    pub holding: HashMap<u16, u16>,
    pub input: HashMap<u16, u16>,
    pub coils: HashMap<u16, bool>,
}

struct State {
    bank: Bank,
    behavior: Behavior,
    on_coil: Option<CoilHook>,
}

pub struct ModbusTcpSimulator {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    connections: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    token: CancellationToken,
}

impl ModbusTcpSimulator {
    /// Bind to an ephemeral localhost port and start serving
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State {
            bank: Bank::default(),
            behavior: Behavior::Normal,
            on_coil: None,
        }));
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        info!("Modbus TCP simulator listening on {}", addr);
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&state),
            Arc::clone(&connections),
            Arc::clone(&requests),
            token.clone(),
        ));

        Self {
            addr,
            state,
            connections,
            requests,
            token,
        }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
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

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.state.lock().bank.coils.get(&address).copied()
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        self.state.lock().behavior = behavior;
    }

    /// Run `hook` after every accepted coil write
    pub fn on_coil(&self, hook: impl FnMut(&mut Bank, u16, bool) + Send + 'static) {
        self.state.lock().on_coil = Some(Box::new(hook));
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for ModbusTcpSimulator {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<Mutex<State>>,
    connections: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    },
                };
                debug!("Simulator connection from {}", peer);
                connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle_client(
                    stream,
                    Arc::clone(&state),
                    Arc::clone(&requests),
                    token.clone(),
                ));
            },
        }
    }
}

async fn handle_client(
    mut stream: TcpStream,
    state: Arc<Mutex<State>>,
    requests: Arc<AtomicUsize>,
    token: CancellationToken,
) {
    let mut buffer = BytesMut::with_capacity(260);

    loop {
        let read = tokio::select! {
            _ = token.cancelled() => return,
            read = stream.read_buf(&mut buffer) => read,
        };
        match read {
            Ok(0) | Err(_) => return,
            Ok(_) => {},
        }

        // Complete MBAP frames only
        while buffer.len() >= 7 {
            let length = u16::from_be_bytes([buffer[4], buffer[5]]) as usize;
            if buffer.len() < 6 + length {
                break;
            }
            let frame = buffer.split_to(6 + length);
            requests.fetch_add(1, Ordering::SeqCst);

            let Some(response) = process_request(&frame, &state) else {
                continue;
            };
            if stream.write_all(&response).await.is_err() {
                return;
            }
        }
    }
}

fn process_request(frame: &[u8], state: &Mutex<State>) -> Option<Vec<u8>> {
    let mut header = &frame[..7];
    let transaction_id = header.get_u16();
    let _protocol_id = header.get_u16();
    let _length = header.get_u16();
    let unit_id = header.get_u8();
    let pdu = &frame[7..];
    let function = *pdu.first()?;

    let mut state = state.lock();
    let response_pdu = match state.behavior {
        Behavior::Silent => return None,
        Behavior::Exception(code) => vec![function | 0x80, code],
        Behavior::Normal => execute(&mut state, pdu),
    };

    let mut response = Vec::with_capacity(7 + response_pdu.len());
    response.extend_from_slice(&transaction_id.to_be_bytes());
    response.extend_from_slice(&0u16.to_be_bytes());
    response.extend_from_slice(&((response_pdu.len() + 1) as u16).to_be_bytes());
    response.push(unit_id);
    response.extend_from_slice(&response_pdu);
    Some(response)
}

fn execute(state: &mut State, pdu: &[u8]) -> Vec<u8> {
    let function = pdu[0];
    if pdu.len() < 5 {
        return vec![function | 0x80, ILLEGAL_FUNCTION];
    }
    let address = u16::from_be_bytes([pdu[1], pdu[2]]);
    let value = u16::from_be_bytes([pdu[3], pdu[4]]);

    match function {
        0x03 | 0x04 => {
            let table = if function == 0x03 {
                &state.bank.holding
            } else {
                &state.bank.input
            };
            let mut body = vec![function, (value * 2) as u8];
            for offset in 0..value {
                match table.get(&(address + offset)) {
                    Some(v) => body.extend_from_slice(&v.to_be_bytes()),
                    None => return vec![function | 0x80, ILLEGAL_DATA_ADDRESS],
                }
            }
            body
        },
        0x05 => {
            let on = value == 0xFF00;
            state.bank.coils.insert(address, on);
            if let Some(hook) = state.on_coil.as_mut() {
                hook(&mut state.bank, address, on);
            }
            pdu[..5].to_vec()
        },
        0x06 => {
            state.bank.holding.insert(address, value);
            pdu[..5].to_vec()
        },
        _ => vec![function | 0x80, ILLEGAL_FUNCTION],
    }
}
