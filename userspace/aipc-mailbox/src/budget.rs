// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Wait budget for sends into a full ring
//!
//! OWNERS: @runtime
//!
//! The peer frees ring slots without telling us, so a sender that may wait polls
//! `try_send`. Polling backs off in three stages: spin, yield, then short naps. A
//! [`Wait::Timeout`] budget turns into a deadline; [`Wait::Blocking`] has none and ends
//! only when a slot frees up or the channel goes down.

use core::time::Duration;
use std::time::Instant;

use crate::{MailboxError, Result, Wait};

/// Attempts that only spin before the sender starts yielding.
const SPIN_ATTEMPTS: u32 = 64;
/// Attempts that yield before the sender starts napping.
const YIELD_ATTEMPTS: u32 = 256;
/// Nap between attempts once the ring has stayed full for a while.
const NAP: Duration = Duration::from_micros(200);

/// Time source and pause primitive for [`SendBudget`].
pub trait Clock {
    /// Time elapsed since the clock was created.
    fn elapsed(&self) -> Duration;
    /// Pauses before retry number `attempt` (starting at 1).
    fn pause(&self, attempt: u32);
}

/// Wall clock using the spin / yield / nap backoff.
#[derive(Clone, Copy, Debug)]
pub struct HostClock {
    origin: Instant,
}

impl HostClock {
    /// Clock starting now.
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    fn pause(&self, attempt: u32) {
        if attempt <= SPIN_ATTEMPTS {
            core::hint::spin_loop();
        } else if attempt <= SPIN_ATTEMPTS + YIELD_ATTEMPTS {
            std::thread::yield_now();
        } else {
            std::thread::sleep(NAP);
        }
    }
}

/// How long one send may keep retrying a full ring.
#[derive(Debug)]
pub struct SendBudget<C: Clock> {
    clock: C,
    deadline: Option<Duration>,
    single_shot: bool,
}

impl<C: Clock> SendBudget<C> {
    /// Budget implied by `wait`, measured on `clock`.
    pub fn new(clock: C, wait: Wait) -> Self {
        let (deadline, single_shot) = match wait {
            Wait::NonBlocking => (None, true),
            Wait::Timeout(limit) => (Some(clock.elapsed().saturating_add(limit)), false),
            Wait::Blocking => (None, false),
        };
        Self { clock, deadline, single_shot }
    }

    /// Returns `true` once a timed budget has run out. Untimed budgets never expire.
    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| self.clock.elapsed() >= deadline)
    }

    /// Runs `attempt` until it stops reporting a full ring.
    ///
    /// `WouldBlock` is retried while budget remains; when a timed budget runs out the
    /// send fails with `Timeout`. Every other error ends the send at once. A
    /// non-blocking budget makes exactly one attempt and passes `WouldBlock` through.
    pub fn run<T>(&self, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
        let mut retries: u32 = 0;
        loop {
            match attempt() {
                Err(MailboxError::WouldBlock) if self.single_shot => return Err(MailboxError::WouldBlock),
                Err(MailboxError::WouldBlock) => {
                    if self.expired() {
                        return Err(MailboxError::Timeout);
                    }
                    retries = retries.saturating_add(1);
                    self.clock.pause(retries);
                }
                outcome => return outcome,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    /// Clock that advances a fixed step on every pause and records the attempts.
    #[derive(Default)]
    struct StepClock {
        now: Cell<Duration>,
        step: Duration,
        pauses: Cell<u32>,
    }

    impl Clock for &StepClock {
        fn elapsed(&self) -> Duration {
            self.now.get()
        }

        fn pause(&self, attempt: u32) {
            assert_eq!(attempt, self.pauses.get() + 1);
            self.pauses.set(attempt);
            self.now.set(self.now.get() + self.step);
        }
    }

    fn stepping(step_ms: u64) -> StepClock {
        StepClock { step: Duration::from_millis(step_ms), ..StepClock::default() }
    }

    #[test]
    fn slot_freed_inside_the_budget_is_used() {
        let clock = stepping(1);
        let budget = SendBudget::new(&clock, Wait::Timeout(Duration::from_millis(10)));
        let mut full_for = 4;
        let sent = budget.run(|| {
            if full_for == 0 {
                Ok("sent")
            } else {
                full_for -= 1;
                Err(MailboxError::WouldBlock)
            }
        });
        assert_eq!(sent, Ok("sent"));
        assert_eq!(clock.pauses.get(), 4);
    }

    #[test]
    fn ring_full_past_the_deadline_times_out() {
        let clock = stepping(1);
        let budget = SendBudget::new(&clock, Wait::Timeout(Duration::from_millis(3)));
        assert_eq!(budget.run(|| -> Result<()> { Err(MailboxError::WouldBlock) }), Err(MailboxError::Timeout));
        assert_eq!(clock.pauses.get(), 3);
        assert!(budget.expired());
    }

    #[test]
    fn non_blocking_makes_one_attempt() {
        let clock = stepping(1);
        let budget = SendBudget::new(&clock, Wait::NonBlocking);
        let mut attempts = 0;
        let sent = budget.run(|| -> Result<()> {
            attempts += 1;
            Err(MailboxError::WouldBlock)
        });
        assert_eq!(sent, Err(MailboxError::WouldBlock));
        assert_eq!((attempts, clock.pauses.get()), (1, 0));
        assert!(!budget.expired());
    }

    #[test]
    fn blocking_waits_until_the_channel_goes_down() {
        let clock = stepping(1_000);
        let budget = SendBudget::new(&clock, Wait::Blocking);
        let mut attempts = 0;
        let sent = budget.run(|| -> Result<()> {
            attempts += 1;
            if attempts < 500 {
                Err(MailboxError::WouldBlock)
            } else {
                Err(MailboxError::TransportDown)
            }
        });
        assert_eq!(sent, Err(MailboxError::TransportDown));
        assert_eq!(clock.pauses.get(), 499);
        assert!(!budget.expired());
    }

    #[test]
    fn host_clock_backs_off_to_naps() {
        let clock = HostClock::new();
        let started = Instant::now();
        for attempt in 1..=SPIN_ATTEMPTS + YIELD_ATTEMPTS {
            clock.pause(attempt);
        }
        let before_naps = started.elapsed();
        clock.pause(SPIN_ATTEMPTS + YIELD_ATTEMPTS + 1);
        assert!(started.elapsed() - before_naps >= NAP);
    }
}
