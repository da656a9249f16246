// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: RPC dispatch engine of one core
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - RpcEngine::register_program() / unregister_program(): privileged program table
//!   - RpcEngine::declare_remote(): procedure tables of programs served by the peer
//!   - RpcEngine::call(): blocking client stub
//!   - RpcEngine::dispatch_incoming(): server/reply path, run from the notification context
//!
//! INVARIANTS:
//!   - `dispatch_incoming` never blocks: deferred procedures are queued, user-space
//!     programs are relayed, every send from this path is non-blocking
//!   - Every request gets exactly one reply (result, error status, or BUSY)
//!   - A call returns within its timeout, or earlier with TRANSPORT_DOWN
//!   - Unmatched replies and malformed frames are dropped, counted and logged
//!
//! ERROR CONDITIONS:
//!   - TransportDown: channel down before or during the call
//!   - Timeout: no reply within the procedure's timeout
//!   - ProgramUnavailable / ProcedureUnavailable: target not registered on the peer
//!   - InvalidArgument: arguments do not match the declared procedure

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use aipc_bridge::{ProcedureSpec, ProgramDescriptor, RpcArgs};
use aipc_mailbox::{Channel, CoreId, Transport, Wait};
use log::{debug, error, info, warn};
use parking_lot::RwLock;

use crate::config::SubstrateConfig;
use crate::deferred::{DeferredQueue, ReplySink};
use crate::error::{AipcError, Result, PROCEDURE_CODE_BASE};
use crate::rpc::procedure::{LocalProgram, Procedure};
use crate::rpc::registry::{Registration, Registry};
use crate::rpc::transaction::TransactionTable;
use crate::rpc::wire::{CallHeader, RpcMessage, MAX_BODY};

/// Forwards requests for user-space programs to their owning process.
pub trait UserSpaceRelay: Send + Sync {
    /// Relays `call` to process `pid`. The reply arrives later through a reply sink.
    ///
    /// Must not block.
    fn relay(&self, pid: u32, call: CallHeader, args: RpcArgs) -> Result<()>;
}

/// Counters kept by an [`RpcEngine`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Calls issued by this core.
    pub calls: u64,
    /// Calls that ended in a timeout.
    pub timeouts: u64,
    /// Replies matched to an in-flight call.
    pub replies_matched: u64,
    /// Replies with no matching call, dropped.
    pub unmatched_replies: u64,
    /// Incoming frames that could not be decoded, dropped.
    pub malformed: u64,
    /// Requests answered by this core.
    pub requests_served: u64,
    /// Requests relayed to user space.
    pub relayed: u64,
    /// Requests answered BUSY because the deferred queue was full.
    pub busy_rejections: u64,
    /// Replies that could not be sent.
    pub reply_send_failures: u64,
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    timeouts: AtomicU64,
    replies_matched: AtomicU64,
    unmatched_replies: AtomicU64,
    malformed: AtomicU64,
    requests_served: AtomicU64,
    relayed: AtomicU64,
    busy_rejections: AtomicU64,
    reply_send_failures: AtomicU64,
}

/// Frames replies and sends them on the RPC channel.
struct ReplyPath {
    channel: Channel,
    wait: Wait,
    counters: Arc<Counters>,
}

impl ReplySink for ReplyPath {
    fn reply(&self, call: CallHeader, outcome: Result<RpcArgs>) {
        let outcome = outcome.map_err(|err| match err {
            AipcError::Procedure(code) if code < PROCEDURE_CODE_BASE => {
                warn!("aipcd: {:#x}/{} reported reserved code {code:#x}", call.program_id, call.procedure_id);
                AipcError::ProcedureFailed
            }
            other => other,
        });
        let body = outcome.map(|result| result.encode()).and_then(|body| {
            if body.len() > MAX_BODY {
                warn!("aipcd: result of {:#x}/{} does not fit a slot", call.program_id, call.procedure_id);
                Err(AipcError::ProcedureFailed)
            } else {
                Ok(body)
            }
        });
        let frame = RpcMessage::reply(call, body).encode();
        if let Err(err) = self.channel.send(&frame, self.wait) {
            self.counters.reply_send_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                "aipcd: reply for {:#x}/{} txn {} not delivered: {err}",
                call.program_id, call.procedure_id, call.transaction_id
            );
        }
    }
}

/// One core's RPC dispatch engine.
pub struct RpcEngine {
    core: CoreId,
    channel: Channel,
    registry: Arc<Registry>,
    transactions: Arc<TransactionTable>,
    remote: RwLock<HashMap<u32, Arc<ProgramDescriptor>>>,
    deferred: Arc<DeferredQueue>,
    relay: RwLock<Option<Arc<dyn UserSpaceRelay>>>,
    inline_reply: ReplyPath,
    worker_reply: Arc<ReplyPath>,
    default_timeout: Duration,
    counters: Arc<Counters>,
}

impl RpcEngine {
    /// Builds the engine for `core` on `channel`.
    ///
    /// In-flight calls fail with `TransportDown` as soon as the channel goes down.
    pub fn new(
        core: CoreId,
        channel: Channel,
        registry: Arc<Registry>,
        deferred: Arc<DeferredQueue>,
        config: &SubstrateConfig,
    ) -> Self {
        let counters = Arc::new(Counters::default());
        let transactions = Arc::new(TransactionTable::new());
        {
            let transactions = Arc::clone(&transactions);
            channel.on_down(move || {
                let failed = transactions.fail_all(AipcError::TransportDown);
                warn!("aipcd: {core} rpc transport down, failed {failed} in-flight calls");
            });
        }
        Self {
            core,
            inline_reply: ReplyPath {
                channel: channel.clone(),
                wait: Wait::NonBlocking,
                counters: Arc::clone(&counters),
            },
            worker_reply: Arc::new(ReplyPath {
                channel: channel.clone(),
                wait: Wait::Timeout(config.send_budget()),
                counters: Arc::clone(&counters),
            }),
            channel,
            registry,
            transactions,
            remote: RwLock::new(HashMap::new()),
            deferred,
            relay: RwLock::new(None),
            default_timeout: config.call_timeout(),
            counters,
        }
    }

    /// Core this engine serves.
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Program registry shared with the broker.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Reply sink usable from contexts that may block (workers, broker threads).
    pub fn reply_sink(&self) -> Arc<dyn ReplySink> {
        self.worker_reply.clone()
    }

    /// Routes requests for user-space programs through `relay`.
    pub fn attach_relay(&self, relay: Arc<dyn UserSpaceRelay>) {
        *self.relay.write() = Some(relay);
    }

    /// Registers a privileged program.
    pub fn register_program(&self, program: LocalProgram) -> Result<()> {
        self.registry.register_local(program)
    }

    /// Removes a program, privileged or user-space.
    pub fn unregister_program(&self, program_id: u32) -> Result<()> {
        self.registry.unregister(program_id).map(|_| ())
    }

    /// Records the procedure table of a program served by the peer.
    ///
    /// Calls to a declared program are checked against its table and use its timeouts.
    pub fn declare_remote(&self, table: ProgramDescriptor) -> Result<()> {
        table.validate().map_err(|_| AipcError::InvalidArgument)?;
        debug!("aipcd: {} declared remote program {:#x}", self.core, table.program_id);
        self.remote.write().insert(table.program_id, Arc::new(table));
        Ok(())
    }

    /// Calls `procedure_id` of `program_id`/`version` on the peer and waits for its reply.
    pub fn call(&self, program_id: u32, version: u32, procedure_id: u32, args: &RpcArgs) -> Result<RpcArgs> {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        if !self.channel.is_up() {
            return Err(AipcError::TransportDown);
        }
        let spec = self.declared_spec(program_id, version, procedure_id)?;
        if let Some(spec) = &spec {
            spec.check_args(args).map_err(|mismatch| {
                debug!("aipcd: call to {program_id:#x}/{procedure_id} rejected: {mismatch}");
                AipcError::InvalidArgument
            })?;
        }
        let timeout = spec.as_ref().and_then(|s| s.timeout).unwrap_or(self.default_timeout);
        let body = args.encode();
        if body.len() > MAX_BODY {
            return Err(AipcError::InvalidArgument);
        }

        let deadline = Instant::now() + timeout;
        let (header, pending) = self.transactions.begin(program_id, version, procedure_id)?;
        let frame = RpcMessage::request(header, body).encode();
        if let Err(err) = self.channel.send(&frame, Wait::Timeout(timeout)) {
            self.transactions.expire(header, &pending);
            let err = AipcError::from(err);
            if err == AipcError::Timeout {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            return Err(err);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = match pending.wait(remaining) {
            Some(outcome) => outcome,
            None => match self.transactions.expire(header, &pending) {
                Some(outcome) => outcome,
                None => {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "aipcd: call {program_id:#x}/{procedure_id} txn {} timed out",
                        header.transaction_id
                    );
                    return Err(AipcError::Timeout);
                }
            },
        };
        let result = RpcArgs::decode(&outcome?).map_err(|_| AipcError::Malformed)?;
        if let Some(spec) = &spec {
            spec.check_result(&result).map_err(|_| AipcError::Malformed)?;
        }
        Ok(result)
    }

    fn declared_spec(&self, program_id: u32, version: u32, procedure_id: u32) -> Result<Option<ProcedureSpec>> {
        let remote = self.remote.read();
        let Some(table) = remote.get(&program_id) else {
            return Ok(None);
        };
        if table.version != version {
            return Err(AipcError::ProgramUnavailable);
        }
        table.procedure(procedure_id).cloned().map(Some).ok_or(AipcError::ProcedureUnavailable)
    }

    /// Drains every message the peer produced on `channel`.
    pub fn drain(&self, channel: &Channel) {
        while let Some(envelope) = channel.try_recv() {
            if envelope.sender != self.core.peer() {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("aipcd: {} dropped rpc frame from {}", self.core, envelope.sender);
                continue;
            }
            self.dispatch_incoming(&envelope.payload);
        }
    }

    /// Handles one incoming RPC message. Never blocks.
    pub fn dispatch_incoming(&self, payload: &[u8]) {
        let message = match RpcMessage::decode(payload) {
            Ok(message) => message,
            Err(_) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("aipcd: {} dropped malformed rpc frame ({} bytes)", self.core, payload.len());
                return;
            }
        };
        if message.is_reply {
            self.complete(message);
        } else {
            self.serve(message);
        }
    }

    fn complete(&self, message: RpcMessage) {
        let outcome = match AipcError::from_status(message.status) {
            None => Ok(message.body),
            Some(err) => Err(err),
        };
        if self.transactions.complete(message.header, outcome) {
            self.counters.replies_matched.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.unmatched_replies.fetch_add(1, Ordering::Relaxed);
            warn!(
                "aipcd: {} dropped unmatched reply {:#x}/{} txn {}",
                self.core, message.header.program_id, message.header.procedure_id, message.header.transaction_id
            );
        }
    }

    fn serve(&self, message: RpcMessage) {
        self.counters.requests_served.fetch_add(1, Ordering::Relaxed);
        let call = message.header;
        let args = match RpcArgs::decode(&message.body) {
            Ok(args) => args,
            Err(_) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("aipcd: {} malformed args for {:#x}/{}", self.core, call.program_id, call.procedure_id);
                return self.inline_reply.reply(call, Err(AipcError::Malformed));
            }
        };
        let Some(registration) = self.registry.lookup(call.program_id) else {
            debug!("aipcd: {} has no program {:#x}", self.core, call.program_id);
            return self.inline_reply.reply(call, Err(AipcError::ProgramUnavailable));
        };
        let descriptor = registration.descriptor();
        if descriptor.version != call.version {
            warn!(
                "aipcd: {} version mismatch for {:#x}: have {}, asked {}",
                self.core, call.program_id, descriptor.version, call.version
            );
            return self.inline_reply.reply(call, Err(AipcError::ProgramUnavailable));
        }
        let Some(spec) = descriptor.procedure(call.procedure_id) else {
            return self.inline_reply.reply(call, Err(AipcError::ProcedureUnavailable));
        };
        if let Err(mismatch) = spec.check_args(&args) {
            warn!("aipcd: {} rejected args for {}: {mismatch}", self.core, spec.name);
            return self.inline_reply.reply(call, Err(AipcError::InvalidArgument));
        }

        match &registration {
            Registration::Local(program) => {
                let Some((spec, procedure)) = program.resolve(call.procedure_id) else {
                    return self.inline_reply.reply(call, Err(AipcError::ProcedureUnavailable));
                };
                if spec.deferred {
                    let job_spec = spec.clone();
                    let job = Box::new(move || run_procedure(&job_spec, procedure.as_ref(), &args));
                    if let Err(err) = self.deferred.enqueue(call, job, self.reply_sink()) {
                        if err == AipcError::Busy {
                            self.counters.busy_rejections.fetch_add(1, Ordering::Relaxed);
                        }
                        warn!("aipcd: {} could not defer {}: {err}", self.core, spec.name);
                        self.inline_reply.reply(call, Err(err));
                    }
                } else {
                    let outcome = run_procedure(spec, procedure.as_ref(), &args);
                    self.inline_reply.reply(call, outcome);
                }
            }
            Registration::UserSpace { pid, .. } => {
                let relay = self.relay.read().clone();
                let outcome = match relay {
                    Some(relay) => relay.relay(*pid, call, args),
                    None => Err(AipcError::ProgramUnavailable),
                };
                match outcome {
                    Ok(()) => {
                        self.counters.relayed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => self.inline_reply.reply(call, Err(err)),
                }
            }
        }
    }

    /// Number of calls waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.transactions.in_flight()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            calls: c.calls.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            replies_matched: c.replies_matched.load(Ordering::Relaxed),
            unmatched_replies: c.unmatched_replies.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            requests_served: c.requests_served.load(Ordering::Relaxed),
            relayed: c.relayed.load(Ordering::Relaxed),
            busy_rejections: c.busy_rejections.load(Ordering::Relaxed),
            reply_send_failures: c.reply_send_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for RpcEngine {
    fn drop(&mut self) {
        info!("aipcd: {} rpc engine stopped", self.core);
    }
}

fn run_procedure(spec: &ProcedureSpec, procedure: &dyn Procedure, args: &RpcArgs) -> Result<RpcArgs> {
    let result = panic::catch_unwind(AssertUnwindSafe(|| procedure.invoke(args))).map_err(|_| {
        error!("aipcd: procedure {} panicked", spec.name);
        AipcError::ProcedureFailed
    })??;
    if let Err(mismatch) = spec.check_result(&result) {
        error!("aipcd: procedure {} returned a bad result: {mismatch}", spec.name);
        return Err(AipcError::ProcedureFailed);
    }
    Ok(result)
}
