// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cross-core notification line.
//!
//! Each core owns one doorbell with a pending bit per channel address. Raising a line
//! never blocks the raiser; coalesced raises collapse into one pending bit, which is why
//! handlers must drain their ring completely.

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Pending bit reserved for region-level events (failure, shutdown kicks).
pub(crate) const REGION_EVENT: u32 = 63;

pub(crate) struct Doorbell {
    pending: AtomicU64,
    park: Mutex<()>,
    wake: Condvar,
}

impl Doorbell {
    pub(crate) fn new() -> Self {
        Self { pending: AtomicU64::new(0), park: Mutex::new(()), wake: Condvar::new() }
    }

    pub(crate) fn raise(&self, line: u32) {
        self.pending.fetch_or(1u64 << line, Ordering::AcqRel);
        let _park = self.park.lock();
        self.wake.notify_one();
    }

    /// Waits up to `timeout` for any line and returns (and clears) the pending set.
    pub(crate) fn wait(&self, timeout: Duration) -> u64 {
        let mut park = self.park.lock();
        loop {
            let bits = self.pending.swap(0, Ordering::AcqRel);
            if bits != 0 {
                return bits;
            }
            if self.wake.wait_for(&mut park, timeout).timed_out() {
                return self.pending.swap(0, Ordering::AcqRel);
            }
        }
    }
}
