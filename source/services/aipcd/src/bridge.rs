// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel-resident broker between the RPC engine and user-space servers
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - Broker::connect(): accept a process connection, returns the process endpoint
//!   - Broker::process_exited(): drop a process's programs and fail its pending calls
//!   - UserSpaceRelay for Broker: forward a request as a REQUEST datagram
//!
//! INVARIANTS:
//!   - A process can only register ids at or above the dynamic minimum, and only
//!     unregister programs it registered itself
//!   - Every relayed request is answered exactly once: by the process's RESULT, or with
//!     PROGRAM_UNAVAILABLE when the process goes away first
//!   - Relaying never blocks the notification context
//!   - A connection owns its reader thread; retiring the connection reaps the reader

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use aipc_bridge::{
    connection_pair, BridgeError, BridgeStatus, BrokerEndpoint, Datagram, MessageType, ProcessEndpoint, RpcArgs,
};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::deferred::ReplySink;
use crate::error::{AipcError, Result};
use crate::rpc::{CallHeader, Registry, UserSpaceRelay};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Counters kept by a [`Broker`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// REQUEST datagrams sent to processes.
    pub relayed: u64,
    /// RESULT datagrams forwarded to the peer core.
    pub results: u64,
    /// Pending requests failed because their process went away.
    pub orphaned: u64,
    /// Datagrams dropped (undecodable, wrong pid, unexpected kind, unmatched result).
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    relayed: AtomicU64,
    results: AtomicU64,
    orphaned: AtomicU64,
    dropped: AtomicU64,
}

struct Connection {
    endpoint: Arc<BrokerEndpoint>,
    reader: Option<JoinHandle<()>>,
}

/// Bridges user-space processes onto one core's RPC engine.
pub struct Broker {
    registry: Arc<Registry>,
    sink: Arc<dyn ReplySink>,
    connections: Mutex<HashMap<u32, Connection>>,
    pending: Mutex<HashMap<CallHeader, u32>>,
    stopping: AtomicBool,
    counters: Counters,
}

impl Broker {
    /// Broker registering into `registry` and answering the peer through `sink`.
    pub fn new(registry: Arc<Registry>, sink: Arc<dyn ReplySink>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            sink,
            connections: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    /// Accepts a connection from process `pid`.
    ///
    /// Fails with `InvalidArgument` if `pid` is already connected.
    pub fn connect(self: &Arc<Self>, pid: u32) -> Result<ProcessEndpoint> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(AipcError::TransportDown);
        }
        let (process, broker) = connection_pair();
        let endpoint = Arc::new(broker);
        {
            let mut connections = self.connections.lock();
            if connections.contains_key(&pid) {
                return Err(AipcError::InvalidArgument);
            }
            connections.insert(pid, Connection { endpoint: Arc::clone(&endpoint), reader: None });
        }
        let reader = {
            let broker = Arc::clone(self);
            let endpoint = Arc::clone(&endpoint);
            thread::Builder::new()
                .name(format!("aipc-broker-{pid}"))
                .spawn(move || broker.reader_loop(pid, &endpoint))
        };
        match reader {
            Ok(reader) => {
                let mut connections = self.connections.lock();
                // The reader may already have retired its own connection.
                if let Some(conn) = connections.get_mut(&pid).filter(|c| Arc::ptr_eq(&c.endpoint, &endpoint)) {
                    conn.reader = Some(reader);
                }
            }
            Err(_) => {
                self.connections.lock().remove(&pid);
                return Err(AipcError::Busy);
            }
        }
        debug!("aipcd: broker accepted pid {pid}");
        Ok(process)
    }

    /// Connected process ids, sorted.
    pub fn connected(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.connections.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Relayed requests still waiting for their RESULT.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Forgets process `pid`: closes its connection, reaps its reader, unregisters its
    /// programs and answers its pending requests with `ProgramUnavailable`.
    pub fn process_exited(&self, pid: u32) {
        self.retire(pid, |_| true);
    }

    /// Closes every connection and joins the reader threads.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections: Vec<Connection> = self.connections.lock().drain().map(|(_, conn)| conn).collect();
        for conn in &connections {
            conn.endpoint.close();
        }
        for conn in connections {
            reap(conn);
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            relayed: self.counters.relayed.load(Ordering::Relaxed),
            results: self.counters.results.load(Ordering::Relaxed),
            orphaned: self.counters.orphaned.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    fn reader_loop(&self, pid: u32, endpoint: &Arc<BrokerEndpoint>) {
        loop {
            if self.stopping.load(Ordering::Acquire) {
                return;
            }
            let frame = match endpoint.recv(Some(POLL_INTERVAL)) {
                Ok(frame) => frame,
                Err(BridgeError::Timeout) | Err(BridgeError::WouldBlock) => continue,
                Err(_) => break,
            };
            match Datagram::decode(&frame) {
                Ok(datagram) if datagram.pid == pid => self.handle(pid, endpoint, datagram),
                Ok(datagram) => self.drop_datagram(pid, &format!("claims pid {}", datagram.pid)),
                Err(err) => self.drop_datagram(pid, &err.to_string()),
            }
        }
        if !self.stopping.load(Ordering::Acquire) {
            self.retire(pid, |conn| Arc::ptr_eq(&conn.endpoint, endpoint));
        }
    }

    /// Removes `pid`'s connection if `owned` accepts it, then cleans up after the process.
    ///
    /// Programs are dropped under the connection lock so a reconnecting process cannot
    /// register before the old registrations are gone.
    fn retire(&self, pid: u32, owned: impl Fn(&Connection) -> bool) {
        let (conn, removed, orphaned) = {
            let mut connections = self.connections.lock();
            if !connections.get(&pid).is_some_and(|conn| owned(conn)) {
                return;
            }
            let conn = connections.remove(&pid);
            let removed = self.registry.remove_process(pid);
            let mut pending = self.pending.lock();
            let orphaned: Vec<CallHeader> =
                pending.iter().filter(|(_, owner)| **owner == pid).map(|(call, _)| *call).collect();
            for call in &orphaned {
                pending.remove(call);
            }
            (conn, removed, orphaned)
        };
        if let Some(conn) = conn {
            conn.endpoint.close();
            reap(conn);
        }
        for call in &orphaned {
            self.sink.reply(*call, Err(AipcError::ProgramUnavailable));
        }
        self.counters.orphaned.fetch_add(orphaned.len() as u64, Ordering::Relaxed);
        info!(
            "aipcd: pid {pid} gone, removed {} programs, failed {} pending calls",
            removed.len(),
            orphaned.len()
        );
    }

    fn drop_datagram(&self, pid: u32, why: &str) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        warn!("aipcd: broker dropped datagram from pid {pid}: {why}");
    }

    fn handle(&self, pid: u32, endpoint: &BrokerEndpoint, datagram: Datagram) {
        match datagram.kind {
            MessageType::Register => {
                let status = match datagram.table() {
                    Ok(table) => match self.registry.register_user(pid, table) {
                        Ok(()) => BridgeStatus::Registered,
                        Err(AipcError::AlreadyRegistered) => BridgeStatus::AlreadyRegistered,
                        Err(_) => BridgeStatus::Invalid,
                    },
                    Err(err) => {
                        warn!("aipcd: pid {pid} sent a bad table: {err}");
                        BridgeStatus::Invalid
                    }
                };
                self.acknowledge(pid, endpoint, datagram.program_id, status);
            }
            MessageType::Unregister => {
                let status = match self.registry.unregister_owned(pid, datagram.program_id) {
                    Ok(()) => BridgeStatus::Ok,
                    Err(_) => BridgeStatus::NotFound,
                };
                self.acknowledge(pid, endpoint, datagram.program_id, status);
            }
            MessageType::Result => self.forward_result(pid, datagram),
            other => self.drop_datagram(pid, &format!("unexpected {other:?}")),
        }
    }

    fn acknowledge(&self, pid: u32, endpoint: &BrokerEndpoint, program_id: u32, status: BridgeStatus) {
        if let Err(err) = endpoint.send(&Datagram::status(pid, program_id, status).encode()) {
            debug!("aipcd: status for pid {pid} not delivered: {err}");
        }
    }

    fn forward_result(&self, pid: u32, datagram: Datagram) {
        let call = CallHeader {
            program_id: datagram.program_id,
            version: datagram.version,
            procedure_id: datagram.procedure_id,
            transaction_id: datagram.transaction_id,
        };
        let owner = self.pending.lock().remove(&call);
        if owner != Some(pid) {
            if let Some(owner) = owner {
                self.pending.lock().insert(call, owner);
            }
            return self.drop_datagram(pid, &format!("unmatched result txn {}", call.transaction_id));
        }
        let outcome = match AipcError::from_status(datagram.status) {
            None => datagram.args().map_err(|_| AipcError::Malformed),
            Some(err) => Err(err),
        };
        self.counters.results.fetch_add(1, Ordering::Relaxed);
        self.sink.reply(call, outcome);
    }
}

impl UserSpaceRelay for Broker {
    fn relay(&self, pid: u32, call: CallHeader, args: RpcArgs) -> Result<()> {
        let endpoint = self
            .connections
            .lock()
            .get(&pid)
            .map(|conn| Arc::clone(&conn.endpoint))
            .ok_or(AipcError::ProgramUnavailable)?;
        self.pending.lock().insert(call, pid);
        let request = Datagram::request(
            pid,
            call.program_id,
            call.version,
            call.procedure_id,
            call.transaction_id,
            &args,
        );
        if endpoint.send(&request.encode()).is_err() {
            self.pending.lock().remove(&call);
            return Err(AipcError::ProgramUnavailable);
        }
        self.counters.relayed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Joins a retired connection's reader, or detaches it when called from that reader.
fn reap(conn: Connection) {
    if let Some(reader) = conn.reader {
        if reader.thread().id() != thread::current().id() {
            let _ = reader.join();
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
