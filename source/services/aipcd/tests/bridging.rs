// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User-space programs reached from the peer core through the broker.

use std::time::{Duration, Instant};

use aipc_bridge::{BridgeClient, BridgeError, ProcedureSpec, ProgramDescriptor, RpcArgs};
use aipcd::rpc::LocalProgram;
use aipcd::{start_pair, AipcError, SubstrateConfig};

const USER_PROGRAM: u32 = 0x1000_0042;

fn table() -> ProgramDescriptor {
    ProgramDescriptor::new(USER_PROGRAM, 2)
        .with(ProcedureSpec::new(1, "sum").args(16, 0).results(8, 0))
        .with(ProcedureSpec::new(2, "fail"))
        .with(ProcedureSpec::new(3, "len").args(0, 1).results(8, 0))
        .with(ProcedureSpec::new(4, "reserved-code"))
}

fn serve(procedure: u32, args: RpcArgs) -> Result<RpcArgs, u32> {
    match procedure {
        1 => Ok(RpcArgs::from_words(&[args.word(0).unwrap_or(0) + args.word(1).unwrap_or(0)])),
        3 => Ok(RpcArgs::from_words(&[args.descriptors[0].len() as u64])),
        4 => Err(2),
        _ => Err(0x1234),
    }
}

fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn remote_caller_reaches_a_process() {
    let pair = start_pair(&SubstrateConfig::default()).unwrap();
    let client = BridgeClient::connect(42, pair.local.connect_process(42).unwrap()).unwrap();
    client.register(table(), serve).unwrap();

    let sum = pair.remote.call(USER_PROGRAM, 2, 1, &RpcArgs::from_words(&[40, 2])).unwrap();
    assert_eq!(sum.word(0), Some(42));
    let len = pair.remote.call(USER_PROGRAM, 2, 3, &RpcArgs::default().with_descriptor(vec![7; 33])).unwrap();
    assert_eq!(len.word(0), Some(33));
    assert_eq!(pair.remote.call(USER_PROGRAM, 2, 2, &RpcArgs::default()), Err(AipcError::Procedure(0x1234)));
    assert_eq!(pair.remote.call(USER_PROGRAM, 1, 1, &RpcArgs::default()), Err(AipcError::ProgramUnavailable));
    assert_eq!(pair.remote.call(USER_PROGRAM, 2, 9, &RpcArgs::default()), Err(AipcError::ProcedureUnavailable));

    let stats = pair.local.stats();
    assert_eq!(stats.engine.relayed, 3);
    assert_eq!(stats.broker.results, 3);
    assert_eq!(pair.local.broker().pending_requests(), 0);
}

#[test]
fn process_failure_codes_cannot_impersonate_substrate_errors() {
    let pair = start_pair(&SubstrateConfig::default()).unwrap();
    let client = BridgeClient::connect(43, pair.local.connect_process(43).unwrap()).unwrap();
    client.register(table(), serve).unwrap();

    assert_eq!(pair.remote.call(USER_PROGRAM, 2, 4, &RpcArgs::default()), Err(AipcError::ProcedureFailed));
    let oversized = RpcArgs::from_words(&[1, 2, 3]);
    assert_eq!(pair.remote.call(USER_PROGRAM, 2, 1, &oversized), Err(AipcError::InvalidArgument));
}

#[test]
fn process_cannot_claim_privileged_or_taken_ids() {
    let pair = start_pair(&SubstrateConfig::default()).unwrap();
    pair.local
        .register_program(LocalProgram::new(0x40, 1).with_procedure(ProcedureSpec::new(1, "noop"), |a| Ok(a.clone())))
        .unwrap();
    let client = BridgeClient::connect(5, pair.local.connect_process(5).unwrap()).unwrap();
    assert_eq!(client.register(ProgramDescriptor::new(0x40, 1), serve), Err(BridgeError::Invalid));
    client.register(table(), serve).unwrap();

    let other = BridgeClient::connect(6, pair.local.connect_process(6).unwrap()).unwrap();
    assert_eq!(other.register(table(), serve), Err(BridgeError::AlreadyRegistered));
    assert_eq!(pair.local.unregister_program(0x1000_0099), Err(AipcError::NotFound));
}

#[test]
fn exit_unregisters_and_later_calls_fail() {
    let pair = start_pair(&SubstrateConfig::default()).unwrap();
    let client = BridgeClient::connect(42, pair.local.connect_process(42).unwrap()).unwrap();
    client.register(table(), serve).unwrap();
    assert!(pair.remote.call(USER_PROGRAM, 2, 1, &RpcArgs::from_words(&[1, 1])).is_ok());

    drop(client);
    eventually("process cleanup", || pair.local.engine().registry().lookup(USER_PROGRAM).is_none());
    assert_eq!(
        pair.remote.call(USER_PROGRAM, 2, 1, &RpcArgs::from_words(&[1, 1])),
        Err(AipcError::ProgramUnavailable)
    );
}

#[test]
fn explicit_exit_hook_fails_in_flight_relays() {
    let pair = start_pair(&SubstrateConfig::default()).unwrap();
    let client = BridgeClient::connect(42, pair.local.connect_process(42).unwrap()).unwrap();
    client
        .register(table(), |procedure, args| {
            std::thread::sleep(Duration::from_millis(300));
            serve(procedure, args)
        })
        .unwrap();

    let remote = std::thread::scope(|scope| {
        let call = scope.spawn(|| pair.remote.call(USER_PROGRAM, 2, 1, &RpcArgs::from_words(&[1, 2])));
        eventually("relay", || pair.local.broker().pending_requests() == 1);
        pair.local.process_exited(42);
        call.join().unwrap()
    });
    assert_eq!(remote, Err(AipcError::ProgramUnavailable));
    assert!(pair.local.engine().registry().lookup(USER_PROGRAM).is_none());
}
