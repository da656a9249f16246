// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deferred-execution queue for procedures that may block
//!
//! OWNERS: @runtime
//!
//! The notification context only enqueues; a single worker thread drains the queue in
//! FIFO order, runs each job and hands its outcome to the job's reply sink.
//!
//! INVARIANTS:
//!   - Every accepted item produces exactly one reply, even if its job panics
//!   - A full queue rejects with `Busy` immediately so the caller can reply in place
//!   - Shutdown drains items already accepted before the worker exits

use core::sync::atomic::{AtomicU64, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use aipc_bridge::RpcArgs;
use aipc_mailbox::CoreId;
use log::{debug, error, info};
use parking_lot::Mutex;

use crate::error::{AipcError, Result};
use crate::rpc::CallHeader;

/// Receives the outcome of a call served away from the notification context.
pub trait ReplySink: Send + Sync {
    /// Sends the reply for `call`.
    fn reply(&self, call: CallHeader, outcome: Result<RpcArgs>);
}

/// Work executed by the deferred worker.
pub type Job = Box<dyn FnOnce() -> Result<RpcArgs> + Send>;

struct WorkItem {
    call: CallHeader,
    job: Job,
    sink: Arc<dyn ReplySink>,
}

/// Counters kept by a [`DeferredQueue`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeferredStats {
    /// Items accepted.
    pub enqueued: u64,
    /// Items whose reply was handed to the sink.
    pub completed: u64,
    /// Items rejected because the queue was full.
    pub rejected_busy: u64,
    /// Jobs that panicked.
    pub panicked: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    rejected_busy: AtomicU64,
    panicked: AtomicU64,
}

/// Bounded FIFO queue drained by one worker thread.
pub struct DeferredQueue {
    core: CoreId,
    tx: Mutex<Option<SyncSender<WorkItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl DeferredQueue {
    /// Starts the worker for `core` with room for `depth` items.
    pub fn start(core: CoreId, depth: usize) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<WorkItem>(depth);
        let counters = Arc::new(Counters::default());
        let worker = {
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name(format!("aipc-deferred-{core}"))
                .spawn(move || worker_loop(core, rx, &counters))
                .map_err(|_| AipcError::TransportDown)?
        };
        Ok(Self { core, tx: Mutex::new(Some(tx)), worker: Mutex::new(Some(worker)), counters })
    }

    /// Queues `job`; its outcome is sent to `sink` as the reply to `call`.
    ///
    /// Never blocks. Fails with `Busy` when full and `TransportDown` after shutdown.
    pub fn enqueue(&self, call: CallHeader, job: Job, sink: Arc<dyn ReplySink>) -> Result<()> {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(AipcError::TransportDown);
        };
        match tx.try_send(WorkItem { call, job, sink }) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.counters.rejected_busy.fetch_add(1, Ordering::Relaxed);
                Err(AipcError::Busy)
            }
            Err(TrySendError::Disconnected(_)) => Err(AipcError::TransportDown),
        }
    }

    /// Stops accepting work, drains what was accepted and joins the worker.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> DeferredStats {
        DeferredStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            rejected_busy: self.counters.rejected_busy.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }
}

impl Drop for DeferredQueue {
    fn drop(&mut self) {
        self.shutdown();
        debug!("aipcd: {} deferred queue stopped", self.core);
    }
}

fn worker_loop(core: CoreId, rx: Receiver<WorkItem>, counters: &Counters) {
    info!("aipcd: {core} deferred worker running");
    for item in rx {
        let WorkItem { call, job, sink } = item;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(outcome) => outcome,
            Err(_) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    "aipcd: deferred procedure {:#x}/{} panicked (txn {})",
                    call.program_id, call.procedure_id, call.transaction_id
                );
                Err(AipcError::ProcedureFailed)
            }
        };
        sink.reply(call, outcome);
        counters.completed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use std::sync::mpsc::Sender;

    struct Collect(Mutex<Sender<(u32, Result<RpcArgs>)>>);

    impl ReplySink for Collect {
        fn reply(&self, call: CallHeader, outcome: Result<RpcArgs>) {
            let _ = self.0.lock().send((call.transaction_id, outcome));
        }
    }

    fn call(txn: u32) -> CallHeader {
        CallHeader { program_id: 0x20, version: 1, procedure_id: 1, transaction_id: txn }
    }

    fn sink() -> (Arc<dyn ReplySink>, Receiver<(u32, Result<RpcArgs>)>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Collect(Mutex::new(tx))), rx)
    }

    #[test]
    fn runs_in_submission_order() {
        let queue = DeferredQueue::start(CoreId::Local, 8).unwrap();
        let (sink, rx) = sink();
        for txn in 0..5u32 {
            queue
                .enqueue(call(txn), Box::new(move || Ok(RpcArgs::from_words(&[u64::from(txn)]))), Arc::clone(&sink))
                .unwrap();
        }
        for txn in 0..5u32 {
            let (got, outcome) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(got, txn);
            assert_eq!(outcome.unwrap().word(0), Some(u64::from(txn)));
        }
    }

    #[test]
    fn panicking_job_still_replies() {
        let queue = DeferredQueue::start(CoreId::Remote, 2).unwrap();
        let (sink, rx) = sink();
        queue.enqueue(call(1), Box::new(|| -> Result<RpcArgs> { panic!("driver fault") }), sink).unwrap();
        let (_, outcome) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(outcome, Err(AipcError::ProcedureFailed));
        assert_eq!(queue.stats().panicked, 1);
    }

    #[test]
    fn full_queue_answers_busy() {
        let queue = DeferredQueue::start(CoreId::Local, 1).unwrap();
        let (sink, rx) = sink();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        queue
            .enqueue(
                call(1),
                Box::new(move || {
                    let _ = started_tx.send(());
                    let _ = gate_rx.recv();
                    Ok(RpcArgs::default())
                }),
                Arc::clone(&sink),
            )
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        queue.enqueue(call(2), Box::new(|| Ok(RpcArgs::default())), Arc::clone(&sink)).unwrap();
        let rejected = queue.enqueue(call(3), Box::new(|| Ok(RpcArgs::default())), Arc::clone(&sink));
        assert_eq!(rejected, Err(AipcError::Busy));
        gate_tx.send(()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().0, 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().0, 2);
        assert_eq!(queue.stats().rejected_busy, 1);
    }

    #[test]
    fn shutdown_drains_accepted_items() {
        let queue = DeferredQueue::start(CoreId::Local, 4).unwrap();
        let (sink, rx) = sink();
        for txn in 0..3u32 {
            queue
                .enqueue(
                    call(txn),
                    Box::new(|| {
                        std::thread::sleep(Duration::from_millis(5));
                        Ok(RpcArgs::default())
                    }),
                    Arc::clone(&sink),
                )
                .unwrap();
        }
        queue.shutdown();
        assert_eq!(rx.try_iter().count(), 3);
        assert_eq!(
            queue.enqueue(call(9), Box::new(|| Ok(RpcArgs::default())), sink),
            Err(AipcError::TransportDown)
        );
    }
}
