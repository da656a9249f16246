// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-flight call table of one core
//!
//! OWNERS: @runtime
//!
//! INVARIANTS:
//!   - A transaction id is unique among this core's in-flight calls
//!   - A reply completes at most one call, and only on an exact 4-tuple match
//!   - After `fail_all`, no new call can start and every waiter has been woken

use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{AipcError, Result};
use crate::rpc::wire::CallHeader;

/// Raw outcome of a call: the reply body, or the error status it carried.
pub type Outcome = core::result::Result<Vec<u8>, AipcError>;

/// Hand-off point between the waiting caller and the reply path.
#[derive(Default)]
pub struct PendingCall {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

impl PendingCall {
    fn fulfil(&self, outcome: Outcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.ready.notify_all();
    }

    /// Waits up to `timeout` for the outcome.
    pub fn wait(&self, timeout: Duration) -> Option<Outcome> {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            self.ready.wait_while_for(&mut slot, |slot| slot.is_none(), timeout);
        }
        slot.take()
    }

    fn take(&self) -> Option<Outcome> {
        self.outcome.lock().take()
    }
}

#[derive(Default)]
struct Table {
    calls: HashMap<CallHeader, Arc<PendingCall>>,
    down: Option<AipcError>,
}

/// Outstanding calls keyed by their full identity.
pub struct TransactionTable {
    next_id: AtomicU32,
    table: Mutex<Table>,
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionTable {
    /// Empty table; ids start at 1.
    pub fn new() -> Self {
        Self { next_id: AtomicU32::new(1), table: Mutex::new(Table::default()) }
    }

    /// Records a new call and returns its identity.
    ///
    /// Fails with the recorded error once the table was failed.
    pub fn begin(&self, program_id: u32, version: u32, procedure_id: u32) -> Result<(CallHeader, Arc<PendingCall>)> {
        let mut table = self.table.lock();
        if let Some(err) = table.down {
            return Err(err);
        }
        loop {
            let header = CallHeader {
                program_id,
                version,
                procedure_id,
                transaction_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            };
            if table.calls.contains_key(&header) {
                continue;
            }
            let pending = Arc::new(PendingCall::default());
            table.calls.insert(header, Arc::clone(&pending));
            return Ok((header, pending));
        }
    }

    /// Delivers a reply. Returns `false` if no call matches.
    pub fn complete(&self, header: CallHeader, outcome: Outcome) -> bool {
        let pending = self.table.lock().calls.remove(&header);
        match pending {
            Some(pending) => {
                pending.fulfil(outcome);
                true
            }
            None => false,
        }
    }

    /// Gives up on `header` after its caller stopped waiting.
    ///
    /// Returns an outcome that raced in between the wait and the removal.
    pub fn expire(&self, header: CallHeader, pending: &PendingCall) -> Option<Outcome> {
        if self.table.lock().calls.remove(&header).is_some() {
            return None;
        }
        pending.take()
    }

    /// Fails every in-flight call with `err` and refuses new ones.
    pub fn fail_all(&self, err: AipcError) -> usize {
        let drained: Vec<Arc<PendingCall>> = {
            let mut table = self.table.lock();
            table.down = Some(err);
            table.calls.drain().map(|(_, pending)| pending).collect()
        };
        for pending in &drained {
            pending.fulfil(Err(err));
        }
        drained.len()
    }

    /// Number of calls waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.table.lock().calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn reply_matches_only_the_full_identity() {
        let table = TransactionTable::new();
        let (header, pending) = table.begin(0x20, 1, 3).unwrap();
        let mut wrong = header;
        wrong.version = 2;
        assert!(!table.complete(wrong, Ok(vec![])));
        assert!(table.complete(header, Ok(vec![9])));
        assert!(!table.complete(header, Ok(vec![9])), "matched twice");
        assert_eq!(pending.wait(Duration::from_millis(1)), Some(Ok(vec![9])));
    }

    #[test]
    fn ids_are_unique_among_in_flight_calls() {
        let table = TransactionTable::new();
        let a = table.begin(1, 1, 1).unwrap().0;
        let b = table.begin(1, 1, 1).unwrap().0;
        assert_ne!(a.transaction_id, b.transaction_id);
        assert_eq!(table.in_flight(), 2);
    }

    #[test]
    fn expired_call_drops_late_reply() {
        let table = TransactionTable::new();
        let (header, pending) = table.begin(1, 1, 1).unwrap();
        assert_eq!(pending.wait(Duration::from_millis(5)), None);
        assert_eq!(table.expire(header, &pending), None);
        assert!(!table.complete(header, Ok(vec![])));
    }

    #[test]
    fn reply_racing_the_expiry_is_kept() {
        let table = TransactionTable::new();
        let (header, pending) = table.begin(1, 1, 1).unwrap();
        assert!(table.complete(header, Ok(vec![1])));
        assert_eq!(table.expire(header, &pending), Some(Ok(vec![1])));
    }

    #[test]
    fn fail_all_wakes_waiters_and_blocks_new_calls() {
        let table = Arc::new(TransactionTable::new());
        let (_, pending) = table.begin(1, 1, 1).unwrap();
        let waiter = thread::spawn(move || pending.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(table.fail_all(AipcError::TransportDown), 1);
        assert_eq!(waiter.join().unwrap(), Some(Err(AipcError::TransportDown)));
        assert_eq!(table.begin(1, 1, 1).err(), Some(AipcError::TransportDown));
    }
}
