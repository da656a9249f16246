// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Distributed mutexes contested by both cores
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - MutexTable: fixed array of shared cells, one per mutex id
//!   - MutexManager::acquire() / release() / lock(): per-core view of the table
//!   - MutexManager::on_wake(): notification handler for the mutex wake channel
//!   - MutexManager::snapshot(): owner / waiter / refcount diagnostics
//!
//! INVARIANTS:
//!   - `owner` is free, local or remote; only the owner clears it
//!   - A core sets only its own waiter bit, and only while it does not own the id
//!   - Every read-modify-write of a shared cell happens under its `lock_word`
//!   - N local acquisitions need exactly N releases before the cross-core lock is
//!     relinquished
//!
//! ERROR CONDITIONS:
//!   - InvalidArgument: id outside the table
//!   - MutexNonOwnerRelease: release without a matching acquire; the id is disabled on
//!     this core and later calls fail with MutexPoisoned
//!   - TransportDown: shared memory lost while waiting

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use core::time::Duration;
use std::sync::Arc;

use aipc_mailbox::{Channel, CoreId, SharedRegion, Transport, Wait};
use aipc_sync::SpinWord;
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::SubstrateConfig;
use crate::error::{AipcError, Result};

const OWNER_FREE: u8 = 0;

/// Shared record of one distributed mutex: `{lock_word, owner, waiter_bitmask, reserved}`.
#[repr(C)]
pub struct SharedMutexCell {
    lock_word: SpinWord,
    owner: AtomicU8,
    waiter_bitmask: AtomicU8,
    _reserved: AtomicU16,
}

impl SharedMutexCell {
    const fn new() -> Self {
        Self {
            lock_word: SpinWord::new(),
            owner: AtomicU8::new(OWNER_FREE),
            waiter_bitmask: AtomicU8::new(0),
            _reserved: AtomicU16::new(0),
        }
    }

    fn owner(&self) -> Option<CoreId> {
        CoreId::from_tag(u32::from(self.owner.load(Ordering::Acquire)))
    }
}

/// The fixed mutex array living in shared memory.
pub struct MutexTable {
    cells: Box<[SharedMutexCell]>,
}

impl MutexTable {
    /// Allocates `count` free mutexes.
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self { cells: (0..count).map(|_| SharedMutexCell::new()).collect() })
    }

    /// Number of mutex ids.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns `true` when the table has no ids.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn cell(&self, id: u32) -> Result<&SharedMutexCell> {
        self.cells.get(id as usize).ok_or(AipcError::InvalidArgument)
    }
}

/// Diagnostic view of one mutex as seen from one core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutexSnapshot {
    /// Current owner in shared memory.
    pub owner: Option<CoreId>,
    /// Waiter bitmask in shared memory (`CoreId::bit` values).
    pub waiters: u8,
    /// Outstanding local acquisitions on this core.
    pub local_refcount: u32,
    /// Disabled on this core after a non-owner release.
    pub poisoned: bool,
}

impl MutexSnapshot {
    /// Returns `true` if `core` is recorded as waiting.
    pub fn is_waiting(&self, core: CoreId) -> bool {
        self.waiters & core.bit() != 0
    }
}

/// Counters kept by a [`MutexManager`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MutexStats {
    /// Acquisitions that found the peer holding the id.
    pub contended: u64,
    /// Wake notifications sent to the peer.
    pub wakes_sent: u64,
    /// Wake notifications received from the peer.
    pub wakes_received: u64,
    /// Wake notifications that could not be sent.
    pub wake_send_failures: u64,
}

#[derive(Default)]
struct LocalState {
    refcount: u32,
    poisoned: bool,
}

/// Per-core state of one id. `held` and `disabled` mirror the gated state so
/// diagnostics can read it while an acquirer holds the gate.
#[derive(Default)]
struct LocalMutex {
    gate: Mutex<LocalState>,
    held: AtomicU32,
    disabled: AtomicBool,
    wake_seq: Mutex<u64>,
    woken: Condvar,
}

impl LocalMutex {
    fn publish(&self, state: &LocalState) {
        self.held.store(state.refcount, Ordering::Release);
        self.disabled.store(state.poisoned, Ordering::Release);
    }

    fn wake_all(&self) {
        let mut seq = self.wake_seq.lock();
        *seq = seq.wrapping_add(1);
        self.woken.notify_all();
    }
}

#[derive(Default)]
struct Counters {
    contended: AtomicU64,
    wakes_sent: AtomicU64,
    wakes_received: AtomicU64,
    wake_send_failures: AtomicU64,
}

/// One core's view of the distributed mutex table.
pub struct MutexManager {
    core: CoreId,
    table: Arc<MutexTable>,
    region: Arc<SharedRegion>,
    locals: Box<[LocalMutex]>,
    wake: Channel,
    retry: Duration,
    send_budget: Duration,
    counters: Counters,
}

impl MutexManager {
    /// Binds `core` to `table`, signalling the peer over `wake`.
    pub fn new(
        core: CoreId,
        table: Arc<MutexTable>,
        region: Arc<SharedRegion>,
        wake: Channel,
        config: &SubstrateConfig,
    ) -> Self {
        let locals = (0..table.len()).map(|_| LocalMutex::default()).collect();
        Self {
            core,
            table,
            region,
            locals,
            wake,
            retry: config.mutex_retry(),
            send_budget: config.send_budget(),
            counters: Counters::default(),
        }
    }

    /// Number of mutex ids.
    pub fn len(&self) -> usize {
        self.locals.len()
    }

    /// Returns `true` when there are no mutex ids.
    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }

    /// Acquires `id` for this core, waiting while the peer owns it.
    ///
    /// Re-entrant on this core: a second acquisition only bumps the local refcount.
    pub fn acquire(&self, id: u32) -> Result<()> {
        let cell = self.table.cell(id)?;
        let local = &self.locals[id as usize];
        let mut state = local.gate.lock();
        if state.poisoned {
            return Err(AipcError::MutexPoisoned);
        }
        if state.refcount > 0 {
            state.refcount += 1;
            local.publish(&state);
            return Ok(());
        }
        let me = self.core.bit();
        let peer = self.core.peer().bit();
        loop {
            if self.region.is_failed() {
                return Err(AipcError::TransportDown);
            }
            let seen = *local.wake_seq.lock();
            {
                let _word = cell.lock_word.lock(self.core.tag());
                if cell.owner.load(Ordering::Acquire) != peer {
                    cell.owner.store(me, Ordering::Release);
                    cell.waiter_bitmask.fetch_and(!me, Ordering::AcqRel);
                    break;
                }
                cell.waiter_bitmask.fetch_or(me, Ordering::AcqRel);
            }
            self.counters.contended.fetch_add(1, Ordering::Relaxed);
            let mut seq = local.wake_seq.lock();
            if *seq == seen {
                local.woken.wait_for(&mut seq, self.retry);
            }
        }
        state.refcount = 1;
        local.publish(&state);
        debug!("aipcd: mutex {id} owned by {}", self.core);
        Ok(())
    }

    /// Releases one local acquisition of `id`.
    ///
    /// The last release frees the id and wakes the peer if it is waiting.
    pub fn release(&self, id: u32) -> Result<()> {
        let cell = self.table.cell(id)?;
        let local = &self.locals[id as usize];
        let mut state = local.gate.lock();
        if state.poisoned {
            return Err(AipcError::MutexPoisoned);
        }
        let me = self.core.bit();
        if state.refcount == 0 || cell.owner.load(Ordering::Acquire) != me {
            state.poisoned = true;
            local.publish(&state);
            error!("aipcd: mutex {id} released by non-owner on {} core; id disabled", self.core);
            return Err(AipcError::MutexNonOwnerRelease);
        }
        state.refcount -= 1;
        local.publish(&state);
        if state.refcount > 0 {
            return Ok(());
        }
        let peer_waiting = {
            let _word = cell.lock_word.lock(self.core.tag());
            cell.owner.store(OWNER_FREE, Ordering::Release);
            cell.waiter_bitmask.load(Ordering::Acquire) & self.core.peer().bit() != 0
        };
        drop(state);
        debug!("aipcd: mutex {id} freed by {}", self.core);
        if peer_waiting {
            self.signal_peer(id);
        }
        Ok(())
    }

    /// Acquires `id` and returns a guard that releases it on drop.
    pub fn lock(&self, id: u32) -> Result<MutexGuard<'_>> {
        self.acquire(id)?;
        Ok(MutexGuard { manager: self, id })
    }

    /// Drains the wake channel and wakes local waiters of every id the peer may have freed.
    ///
    /// Runs in the notification context; never blocks.
    pub fn on_wake(&self, channel: &Channel) {
        while let Some(envelope) = channel.try_recv() {
            self.counters.wakes_received.fetch_add(1, Ordering::Relaxed);
            if envelope.payload.len() != 4 {
                warn!("aipcd: malformed mutex wake ({} bytes)", envelope.payload.len());
            }
        }
        let me = self.core.bit();
        for (cell, local) in self.table.cells.iter().zip(self.locals.iter()) {
            if cell.waiter_bitmask.load(Ordering::Acquire) & me != 0 {
                local.wake_all();
            }
        }
    }

    /// Current state of `id`. Never waits, even while an acquirer of `id` is blocked.
    pub fn snapshot(&self, id: u32) -> Result<MutexSnapshot> {
        let cell = self.table.cell(id)?;
        let local = &self.locals[id as usize];
        Ok(MutexSnapshot {
            owner: cell.owner(),
            waiters: cell.waiter_bitmask.load(Ordering::Acquire),
            local_refcount: local.held.load(Ordering::Acquire),
            poisoned: local.disabled.load(Ordering::Acquire),
        })
    }

    /// Counter snapshot.
    pub fn stats(&self) -> MutexStats {
        MutexStats {
            contended: self.counters.contended.load(Ordering::Relaxed),
            wakes_sent: self.counters.wakes_sent.load(Ordering::Relaxed),
            wakes_received: self.counters.wakes_received.load(Ordering::Relaxed),
            wake_send_failures: self.counters.wake_send_failures.load(Ordering::Relaxed),
        }
    }

    fn signal_peer(&self, id: u32) {
        match self.wake.send(&id.to_le_bytes(), Wait::Timeout(self.send_budget)) {
            Ok(()) => {
                self.counters.wakes_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                // The peer re-checks on its own bounded retry.
                self.counters.wake_send_failures.fetch_add(1, Ordering::Relaxed);
                warn!("aipcd: mutex {id} wake to {} failed: {err}", self.core.peer());
            }
        }
    }
}

/// Holds one local acquisition of a mutex; released on drop.
pub struct MutexGuard<'a> {
    manager: &'a MutexManager,
    id: u32,
}

impl MutexGuard<'_> {
    /// Mutex id held by this guard.
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.manager.release(self.id) {
            error!("aipcd: mutex {} guard release failed: {err}", self.id);
        }
    }
}
