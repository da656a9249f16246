// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: AIPC end-to-end scenarios
//! INTENT: Cross-core allocation, mutex hand-over, user-space bridging, transport loss
//! DEPS: aipcd, aipc-bridge
//! TESTS: deferred allocation, mutex owner transitions, relay + process exit, down mid-call

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use aipc_bridge::{BridgeClient, ProcedureSpec, ProgramDescriptor, RpcArgs};
use aipc_e2e::{eventually, pair, test_config};
use aipc_mailbox::CoreId;
use aipcd::rpc::LocalProgram;
use aipcd::AipcError;
use parking_lot::Mutex;

const ALLOCATOR: u32 = 0x51;
const PROC_VMALLOC: u32 = 1;
const PROC_VFREE: u32 = 2;

/// Remote-core allocator whose procedures may sleep, so both run deferred.
fn allocator(heap: Arc<Mutex<HashMap<u64, Vec<u8>>>>) -> LocalProgram {
    let next = Arc::new(Mutex::new(0x8000_0000u64));
    let alloc_heap = Arc::clone(&heap);
    LocalProgram::new(ALLOCATOR, 1)
        .with_procedure(ProcedureSpec::new(PROC_VMALLOC, "vmalloc").args(8, 0).results(8, 0).deferred(), move |args| {
            let size = args.word(0).ok_or(AipcError::InvalidArgument)?;
            if size == 0 {
                return Err(AipcError::InvalidArgument);
            }
            let handle = {
                let mut next = next.lock();
                let handle = *next;
                *next += size;
                handle
            };
            alloc_heap.lock().insert(handle, vec![0; size as usize]);
            Ok(RpcArgs::from_words(&[handle]))
        })
        .with_procedure(ProcedureSpec::new(PROC_VFREE, "vfree").args(8, 0).deferred(), move |args| {
            let handle = args.word(0).ok_or(AipcError::InvalidArgument)?;
            heap.lock().remove(&handle).map(|_| RpcArgs::default()).ok_or(AipcError::Procedure(0x101))
        })
}

#[test]
fn scenario_a_remote_allocation_runs_deferred() {
    let pair = pair();
    let heap = Arc::new(Mutex::new(HashMap::new()));
    pair.remote.register_program(allocator(Arc::clone(&heap))).unwrap();

    let started = Instant::now();
    let reply = pair.local.call(ALLOCATOR, 1, PROC_VMALLOC, &RpcArgs::from_words(&[4096])).unwrap();
    assert!(started.elapsed() < Duration::from_millis(400));
    let handle = reply.word(0).unwrap();
    assert_eq!(heap.lock().get(&handle).map(Vec::len), Some(4096));
    assert_eq!(pair.remote.stats().deferred.completed, 1);

    pair.local.call(ALLOCATOR, 1, PROC_VFREE, &RpcArgs::from_words(&[handle])).unwrap();
    assert!(heap.lock().is_empty());
    assert_eq!(
        pair.local.call(ALLOCATOR, 1, PROC_VFREE, &RpcArgs::from_words(&[handle])),
        Err(AipcError::Procedure(0x101))
    );
}

#[test]
fn scenario_b_mutex_hands_over_to_the_waiting_core() {
    let pair = pair();
    let local = Arc::clone(pair.local.mutexes());
    let remote = Arc::clone(pair.remote.mutexes());
    let mut owners = vec![local.snapshot(3).unwrap().owner];

    local.acquire(3).unwrap();
    owners.push(local.snapshot(3).unwrap().owner);

    let waiter = {
        let remote = Arc::clone(&remote);
        thread::spawn(move || {
            remote.acquire(3).unwrap();
            let owner = remote.snapshot(3).unwrap().owner;
            remote.release(3).unwrap();
            owner
        })
    };
    eventually("remote waiter bit", || local.snapshot(3).unwrap().is_waiting(CoreId::Remote));

    local.release(3).unwrap();
    owners.push(None);
    owners.push(waiter.join().unwrap());

    assert_eq!(owners, vec![None, Some(CoreId::Local), None, Some(CoreId::Remote)]);
    assert!(pair.local.stats().mutex.wakes_sent >= 1);
    assert_eq!(remote.snapshot(3).unwrap().owner, None);
    assert!(!remote.snapshot(3).unwrap().is_waiting(CoreId::Remote));
}

#[test]
fn scenario_c_process_program_is_reachable_until_exit() {
    const PROGRAM: u32 = 0x1000_0001;
    let pair = pair();
    let client = BridgeClient::connect(314, pair.local.connect_process(314).unwrap()).unwrap();
    let table = ProgramDescriptor::new(PROGRAM, 1).with(ProcedureSpec::new(1, "greet").args(0, 1).results(0, 1));
    client
        .register(table, |_, args| {
            let mut greeting = b"hello, ".to_vec();
            greeting.extend_from_slice(&args.descriptors[0]);
            Ok(RpcArgs::default().with_descriptor(greeting))
        })
        .unwrap();

    let reply = pair.remote.call(PROGRAM, 1, 1, &RpcArgs::default().with_descriptor(b"remote".to_vec())).unwrap();
    assert_eq!(reply.descriptors, vec![b"hello, remote".to_vec()]);

    client.close();
    eventually("unregistration", || pair.local.engine().registry().lookup(PROGRAM).is_none());
    assert_eq!(pair.remote.call(PROGRAM, 1, 1, &RpcArgs::default()), Err(AipcError::ProgramUnavailable));
}

#[test]
fn scenario_d_transport_loss_mid_call_fails_within_the_timeout() {
    let pair = pair();
    pair.remote
        .register_program(LocalProgram::new(0x52, 1).with_procedure(
            ProcedureSpec::new(1, "stall").deferred(),
            |_| {
                thread::sleep(Duration::from_secs(1));
                Ok(RpcArgs::default())
            },
        ))
        .unwrap();

    let timeout = Duration::from_millis(test_config().call_timeout_ms);
    let outcome = thread::scope(|scope| {
        let caller = scope.spawn(|| {
            let started = Instant::now();
            (pair.local.call(0x52, 1, 1, &RpcArgs::default()), started.elapsed())
        });
        eventually("call in flight", || pair.local.engine().in_flight() == 1);
        pair.shared.fail();
        caller.join().unwrap()
    });
    let (result, elapsed) = outcome;
    assert_eq!(result, Err(AipcError::TransportDown));
    assert!(elapsed < timeout, "took {elapsed:?}");
    assert_eq!(pair.local.call(0x52, 1, 1, &RpcArgs::default()), Err(AipcError::TransportDown));
    assert_eq!(pair.local.mutexes().acquire(0), Err(AipcError::TransportDown));
}
