// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fixed-depth slot ring for one direction of one channel.
//!
//! The producer writes the body and then flips `in_use`; the consumer copies the body out
//! and clears it. Producers (and consumers) on the same core are serialized through the
//! ring's busy-wait words, so at most one producer and one consumer touch a slot at a time.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use aipc_sync::{SpinLock, SpinWord};

use crate::{CoreId, Envelope, MailboxError, Result};

/// Largest payload a slot carries.
pub const SLOT_PAYLOAD_MAX: usize = 480;

/// Counters kept per ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Messages written into the ring.
    pub produced: u64,
    /// Messages taken out of the ring.
    pub consumed: u64,
    /// Sends rejected because the next slot was still in use.
    pub rejected_full: u64,
}

struct SlotBody {
    sender: u32,
    len: u32,
    data: [u8; SLOT_PAYLOAD_MAX],
}

impl SlotBody {
    const EMPTY: Self = Self { sender: 0, len: 0, data: [0u8; SLOT_PAYLOAD_MAX] };
}

struct Slot {
    in_use: AtomicBool,
    body: SpinLock<SlotBody>,
}

impl Slot {
    fn new() -> Self {
        Self { in_use: AtomicBool::new(false), body: SpinLock::new(SlotBody::EMPTY) }
    }
}

pub(crate) struct Ring {
    slots: Box<[Slot]>,
    head: AtomicU32,
    tail: AtomicU32,
    produce: SpinWord,
    consume: SpinWord,
    produced: AtomicU64,
    consumed: AtomicU64,
    rejected_full: AtomicU64,
}

impl Ring {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            slots: (0..depth).map(|_| Slot::new()).collect(),
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            produce: SpinWord::new(),
            consume: SpinWord::new(),
            produced: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            rejected_full: AtomicU64::new(0),
        }
    }

    fn slot(&self, cursor: u32) -> &Slot {
        &self.slots[cursor as usize % self.slots.len()]
    }

    /// Writes `payload` into the next slot, or fails with `WouldBlock` if it is still in use.
    pub(crate) fn produce(&self, sender: CoreId, payload: &[u8]) -> Result<()> {
        if payload.len() > SLOT_PAYLOAD_MAX {
            return Err(MailboxError::TooLarge);
        }
        let _claim = self.produce.lock(sender.tag());
        let cursor = self.head.load(Ordering::Acquire);
        let slot = self.slot(cursor);
        if slot.in_use.load(Ordering::Acquire) {
            self.rejected_full.fetch_add(1, Ordering::Relaxed);
            return Err(MailboxError::WouldBlock);
        }
        {
            let mut body = slot.body.lock();
            body.sender = sender.tag();
            body.len = payload.len() as u32;
            body.data[..payload.len()].copy_from_slice(payload);
        }
        slot.in_use.store(true, Ordering::Release);
        self.head.store(cursor.wrapping_add(1), Ordering::Release);
        self.produced.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Takes the oldest marked slot, if any.
    ///
    /// A slot whose sender tag is not a known core is released and reported as malformed.
    pub(crate) fn consume(&self, consumer: CoreId) -> Option<Result<Envelope>> {
        let _claim = self.consume.lock(consumer.tag());
        let cursor = self.tail.load(Ordering::Acquire);
        let slot = self.slot(cursor);
        if !slot.in_use.load(Ordering::Acquire) {
            return None;
        }
        let decoded = {
            let body = slot.body.lock();
            let len = (body.len as usize).min(SLOT_PAYLOAD_MAX);
            CoreId::from_tag(body.sender)
                .map(|sender| Envelope { sender, payload: body.data[..len].to_vec() })
                .ok_or(MailboxError::Malformed)
        };
        slot.in_use.store(false, Ordering::Release);
        self.tail.store(cursor.wrapping_add(1), Ordering::Release);
        self.consumed.fetch_add(1, Ordering::Relaxed);
        Some(decoded)
    }

    /// Number of slots currently marked in use.
    pub(crate) fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use.load(Ordering::Acquire)).count()
    }

    pub(crate) fn stats(&self) -> RingStats {
        RingStats {
            produced: self.produced.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            rejected_full: self.rejected_full.load(Ordering::Relaxed),
        }
    }
}
