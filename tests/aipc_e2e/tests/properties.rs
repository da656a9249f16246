// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: AIPC end-to-end properties
//! INTENT: Bounded calls, registration races, mutual exclusion, channel idempotence, backpressure
//! DEPS: aipcd, aipc-mailbox, proptest
//! TESTS: random call targets, register/call/unregister race, cross-core mutex exclusion, reopen, saturation

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use aipc_bridge::{ProcedureSpec, RpcArgs};
use aipc_e2e::{pair, test_config};
use aipc_mailbox::{CoreId, Mailbox, MailboxError, RegionLayout, SharedRegion, Transport, Wait};
use aipcd::rpc::LocalProgram;
use aipcd::AipcError;
use proptest::test_runner::{Config, TestRunner};

const TARGET: u32 = 0x60;

fn target_program() -> LocalProgram {
    LocalProgram::new(TARGET, 2)
        .with_procedure(ProcedureSpec::new(1, "inc").args(8, 0).results(8, 0), |args| {
            Ok(RpcArgs::from_words(&[args.word(0).unwrap_or(0) + 1]))
        })
        .with_procedure(ProcedureSpec::new(2, "inc-deferred").args(8, 0).results(8, 0).deferred(), |args| {
            Ok(RpcArgs::from_words(&[args.word(0).unwrap_or(0) + 1]))
        })
}

#[test]
fn every_call_resolves_to_a_result_or_a_defined_error() {
    let pair = pair();
    pair.remote.register_program(target_program()).unwrap();
    let bound = Duration::from_millis(test_config().call_timeout_ms) + Duration::from_millis(150);

    let mut runner = TestRunner::new(Config { cases: 48, ..Config::default() });
    runner
        .run(&(TARGET - 1..=TARGET + 1, 1u32..=3, 0u32..=4, any_word()), |(program, version, procedure, word)| {
            let started = Instant::now();
            let outcome = pair.local.call(program, version, procedure, &RpcArgs::from_words(&[word]));
            let elapsed = started.elapsed();
            assert!(elapsed <= bound, "call took {elapsed:?}");
            match outcome {
                Ok(result) => {
                    assert_eq!((program, version), (TARGET, 2));
                    assert!(procedure == 1 || procedure == 2);
                    assert_eq!(result.word(0), Some(word.wrapping_add(1)));
                }
                Err(AipcError::ProgramUnavailable) => assert!(program != TARGET || version != 2),
                Err(AipcError::ProcedureUnavailable) => assert!(!(1..=2).contains(&procedure)),
                Err(other) => panic!("unexpected {other:?}"),
            }
            Ok(())
        })
        .unwrap();
}

fn any_word() -> std::ops::Range<u64> {
    0..u64::MAX
}

#[test]
fn concurrent_unregistration_never_exposes_a_half_torn_table() {
    let pair = pair();
    let stop = AtomicBool::new(false);
    let completed = AtomicU64::new(0);
    let unavailable = AtomicU64::new(0);

    thread::scope(|scope| {
        scope.spawn(|| {
            for _ in 0..40 {
                pair.remote.register_program(target_program()).unwrap();
                thread::sleep(Duration::from_millis(2));
                pair.remote.unregister_program(TARGET).unwrap();
                thread::sleep(Duration::from_millis(1));
            }
            stop.store(true, Ordering::Release);
        });
        for _ in 0..2 {
            scope.spawn(|| {
                let mut word = 0u64;
                while !stop.load(Ordering::Acquire) {
                    match pair.local.call(TARGET, 2, 1, &RpcArgs::from_words(&[word])) {
                        Ok(result) => {
                            assert_eq!(result.word(0), Some(word + 1));
                            completed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(AipcError::ProgramUnavailable) => {
                            unavailable.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(other) => panic!("unexpected {other:?}"),
                    }
                    word += 1;
                }
            });
        }
    });
    assert!(completed.load(Ordering::Relaxed) + unavailable.load(Ordering::Relaxed) > 0);
    assert_eq!(pair.local.engine().in_flight(), 0);
}

#[test]
fn contended_mutex_is_held_by_one_core_at_a_time() {
    let pair = pair();
    let inside = AtomicBool::new(false);
    let entries = AtomicU64::new(0);

    thread::scope(|scope| {
        for substrate in [&pair.local, &pair.remote] {
            let inside = &inside;
            let entries = &entries;
            scope.spawn(move || {
                for _ in 0..50 {
                    let guard = substrate.mutexes().lock(7).unwrap();
                    let snapshot = substrate.mutexes().snapshot(guard.id()).unwrap();
                    assert_eq!(snapshot.owner, Some(substrate.core()));
                    assert!(!inside.swap(true, Ordering::AcqRel), "two holders");
                    entries.fetch_add(1, Ordering::Relaxed);
                    thread::yield_now();
                    inside.store(false, Ordering::Release);
                    drop(guard);
                }
            });
        }
    });
    assert_eq!(entries.load(Ordering::Relaxed), 100);
    assert_eq!(pair.local.mutexes().snapshot(7).unwrap().owner, None);
}

#[test]
fn n_local_acquisitions_need_n_releases() {
    let pair = pair();
    let local = pair.local.mutexes();
    let remote = Arc::clone(pair.remote.mutexes());
    for _ in 0..4 {
        local.acquire(2).unwrap();
    }
    let waiter = thread::spawn(move || {
        remote.acquire(2).unwrap();
        remote.release(2).unwrap();
    });
    for remaining in (1..4).rev() {
        local.release(2).unwrap();
        assert_eq!(local.snapshot(2).unwrap().local_refcount, remaining);
        assert_eq!(local.snapshot(2).unwrap().owner, Some(CoreId::Local));
    }
    local.release(2).unwrap();
    waiter.join().unwrap();
    assert_eq!(local.release(2), Err(AipcError::MutexNonOwnerRelease));
    assert_eq!(local.acquire(2), Err(AipcError::MutexPoisoned));
    assert_eq!(pair.remote.mutexes().lock(2).map(|guard| guard.id()), Ok(2));
}

#[test]
fn reopening_a_channel_reuses_its_rings() {
    let region = SharedRegion::new(RegionLayout { ring_depth: 4, channel_count: 4 });
    let config = test_config();
    let local = Mailbox::new(CoreId::Local, Arc::clone(&region), config.mailbox()).unwrap();
    let first = local.open_channel("sensors").unwrap();
    let second = local.open_channel("sensors").unwrap();
    assert!(first.same_as(&second));
    let other = local.open_channel("audio").unwrap();
    assert_ne!(other.address(), first.address());
}

#[test]
fn saturated_ring_refuses_instead_of_overwriting() {
    let region = SharedRegion::new(RegionLayout { ring_depth: 2, channel_count: 4 });
    let config = test_config();
    let local = Mailbox::new(CoreId::Local, Arc::clone(&region), config.mailbox()).unwrap();
    let remote = Mailbox::new(CoreId::Remote, Arc::clone(&region), config.mailbox()).unwrap();
    let tx = local.open_channel("bulk").unwrap();
    let rx = remote.open_channel("bulk").unwrap();

    tx.send(b"one", Wait::NonBlocking).unwrap();
    tx.send(b"two", Wait::NonBlocking).unwrap();
    assert_eq!(tx.send(b"three", Wait::NonBlocking), Err(MailboxError::WouldBlock));
    assert_eq!(tx.send(b"three", Wait::Timeout(Duration::from_millis(20))), Err(MailboxError::Timeout));

    assert_eq!(rx.try_recv().unwrap().payload, b"one");
    assert_eq!(rx.try_recv().unwrap().payload, b"two");
    assert!(rx.try_recv().is_none());
    tx.send(b"three", Wait::NonBlocking).unwrap();
    assert_eq!(rx.try_recv().unwrap().payload, b"three");
}
