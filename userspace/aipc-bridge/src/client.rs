// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process-side bridging client
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - BridgeClient::connect(): attach a process to its broker endpoint
//!   - BridgeClient::register() / unregister(): publish or withdraw a program
//!   - BridgeClient::serve(): block until the connection ends
//!   - BridgeClient::close(): model process exit
//!
//! INVARIANTS:
//!   - A handler is installed before REGISTER leaves the process, so the first relayed
//!     request always finds it; a rejected registration removes it again
//!   - Every REQUEST is answered with exactly one RESULT
//!   - Register/unregister round-trips are serialized per client

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::connection::Endpoint;
use crate::datagram::{
    BridgeStatus, Datagram, MessageType, RESULT_INVALID_ARGUMENT, RESULT_OK,
    RESULT_PROCEDURE_CODE_BASE, RESULT_PROCEDURE_FAILED, RESULT_PROCEDURE_UNAVAILABLE,
    RESULT_PROGRAM_UNAVAILABLE,
};
use crate::descriptor::{ProgramDescriptor, RpcArgs};
use crate::{BridgeError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Serves the procedures of one registered program.
///
/// Called with the procedure id and its arguments; `Err(code)` is sent back as the RPC
/// status of the reply.
pub type ProgramHandler =
    Arc<dyn Fn(u32, RpcArgs) -> core::result::Result<RpcArgs, u32> + Send + Sync>;

struct Served {
    table: ProgramDescriptor,
    handler: ProgramHandler,
}

struct ClientInner {
    pid: u32,
    endpoint: Endpoint,
    programs: RwLock<HashMap<u32, Served>>,
    acks: Mutex<HashMap<u32, BridgeStatus>>,
    ack_ready: Condvar,
    exchange: Mutex<()>,
    closing: AtomicBool,
    disconnected: AtomicBool,
}

/// A process's connection to the broker.
pub struct BridgeClient {
    inner: Arc<ClientInner>,
    reader: Mutex<Option<JoinHandle<()>>>,
    ack_timeout: Duration,
}

impl BridgeClient {
    /// Attaches process `pid` to `endpoint` and starts serving relayed requests.
    pub fn connect(pid: u32, endpoint: Endpoint) -> Result<Self> {
        let inner = Arc::new(ClientInner {
            pid,
            endpoint,
            programs: RwLock::new(HashMap::new()),
            acks: Mutex::new(HashMap::new()),
            ack_ready: Condvar::new(),
            exchange: Mutex::new(()),
            closing: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        });
        let reader = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name(format!("aipc-bridge-{pid}"))
                .spawn(move || reader_loop(&inner))
                .map_err(|_| BridgeError::Disconnected)?
        };
        debug!("aipc-bridge: pid {pid} connected");
        Ok(Self { inner, reader: Mutex::new(Some(reader)), ack_timeout: DEFAULT_ACK_TIMEOUT })
    }

    /// Overrides how long register/unregister wait for the broker's STATUS.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Process id this client speaks for.
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Program ids currently served by this process.
    pub fn programs(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.inner.programs.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Publishes `table`, answering its requests with `handler`.
    pub fn register<F>(&self, table: ProgramDescriptor, handler: F) -> Result<()>
    where
        F: Fn(u32, RpcArgs) -> core::result::Result<RpcArgs, u32> + Send + Sync + 'static,
    {
        let _exchange = self.inner.exchange.lock();
        let program_id = table.program_id;
        let request = Datagram::register(self.inner.pid, &table)?;
        {
            let mut programs = self.inner.programs.write();
            if programs.contains_key(&program_id) {
                return Err(BridgeError::AlreadyRegistered);
            }
            programs.insert(program_id, Served { table, handler: Arc::new(handler) });
        }
        let outcome = self.round_trip(program_id, &request);
        match outcome {
            Ok(()) => info!("aipc-bridge: pid {} registered program {program_id:#x}", self.inner.pid),
            Err(err) => {
                self.inner.programs.write().remove(&program_id);
                warn!("aipc-bridge: pid {} register {program_id:#x} failed: {err}", self.inner.pid);
            }
        }
        outcome
    }

    /// Withdraws `program_id`.
    pub fn unregister(&self, program_id: u32) -> Result<()> {
        let _exchange = self.inner.exchange.lock();
        let outcome = self.round_trip(program_id, &Datagram::unregister(self.inner.pid, program_id));
        if matches!(outcome, Ok(()) | Err(BridgeError::NotFound)) {
            self.inner.programs.write().remove(&program_id);
        }
        outcome
    }

    /// Blocks until the connection ends (broker gone or [`BridgeClient::close`]).
    pub fn serve(&self) {
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.join();
        }
    }

    /// Ends the connection. The broker treats this as the process exiting.
    pub fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.endpoint.close();
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            if reader.thread().id() != thread::current().id() {
                let _ = reader.join();
            }
        }
        debug!("aipc-bridge: pid {} closed", self.inner.pid);
    }

    fn round_trip(&self, program_id: u32, request: &Datagram) -> Result<()> {
        self.inner.acks.lock().remove(&program_id);
        self.inner.endpoint.send(&request.encode())?;
        let deadline = Instant::now() + self.ack_timeout;
        let mut acks = self.inner.acks.lock();
        loop {
            if let Some(status) = acks.remove(&program_id) {
                return status.into_result();
            }
            if self.inner.disconnected.load(Ordering::Acquire) {
                return Err(BridgeError::Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::Timeout);
            }
            self.inner.ack_ready.wait_for(&mut acks, deadline - now);
        }
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn reader_loop(inner: &ClientInner) {
    loop {
        if inner.closing.load(Ordering::Acquire) {
            break;
        }
        let frame = match inner.endpoint.recv(Some(POLL_INTERVAL)) {
            Ok(frame) => frame,
            Err(BridgeError::Timeout) | Err(BridgeError::WouldBlock) => continue,
            Err(_) => break,
        };
        let datagram = match Datagram::decode(&frame) {
            Ok(datagram) => datagram,
            Err(err) => {
                warn!("aipc-bridge: pid {} dropped frame: {err}", inner.pid);
                continue;
            }
        };
        match datagram.kind {
            MessageType::Request => serve_request(inner, &datagram),
            MessageType::Status => match BridgeStatus::from_u32(datagram.status) {
                Some(status) => {
                    inner.acks.lock().insert(datagram.program_id, status);
                    inner.ack_ready.notify_all();
                }
                None => warn!("aipc-bridge: pid {} unknown status {}", inner.pid, datagram.status),
            },
            other => warn!("aipc-bridge: pid {} unexpected {other:?} from broker", inner.pid),
        }
    }
    inner.disconnected.store(true, Ordering::Release);
    let _acks = inner.acks.lock();
    inner.ack_ready.notify_all();
}

fn serve_request(inner: &ClientInner, request: &Datagram) {
    let (status, result) = run_request(inner, request);
    let reply = Datagram::result(request, status, &result);
    if let Err(err) = inner.endpoint.send(&reply.encode()) {
        warn!(
            "aipc-bridge: pid {} could not answer txn {}: {err}",
            inner.pid, request.transaction_id
        );
    }
}

fn run_request(inner: &ClientInner, request: &Datagram) -> (u32, RpcArgs) {
    let (handler, spec) = {
        let programs = inner.programs.read();
        let Some(served) = programs.get(&request.program_id) else {
            return (RESULT_PROGRAM_UNAVAILABLE, RpcArgs::default());
        };
        if served.table.version != request.version {
            return (RESULT_PROGRAM_UNAVAILABLE, RpcArgs::default());
        }
        let Some(spec) = served.table.procedure(request.procedure_id) else {
            return (RESULT_PROCEDURE_UNAVAILABLE, RpcArgs::default());
        };
        (Arc::clone(&served.handler), spec.clone())
    };
    let args = match request.args() {
        Ok(args) if spec.check_args(&args).is_ok() => args,
        _ => {
            warn!("aipc-bridge: pid {} malformed args for {}", inner.pid, spec.name);
            return (RESULT_INVALID_ARGUMENT, RpcArgs::default());
        }
    };
    match handler(request.procedure_id, args) {
        Ok(result) => match spec.check_result(&result) {
            Ok(()) => (RESULT_OK, result),
            Err(mismatch) => {
                warn!("aipc-bridge: pid {} {} returned bad result: {mismatch}", inner.pid, spec.name);
                (RESULT_PROCEDURE_FAILED, RpcArgs::default())
            }
        },
        Err(code) if code < RESULT_PROCEDURE_CODE_BASE => {
            warn!("aipc-bridge: pid {} {} reported reserved code {code:#x}", inner.pid, spec.name);
            (RESULT_PROCEDURE_FAILED, RpcArgs::default())
        }
        Err(code) => (code, RpcArgs::default()),
    }
}
