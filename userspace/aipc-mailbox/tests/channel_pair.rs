// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for a two-core mailbox pair sharing one region
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 3 integration tests
//!
//! TEST_SCENARIOS:
//!   - saturated_ring_preserves_order(): producer outruns the consumer, nothing is lost or reordered
//!   - handshake_marks_peer_connected(): the peer learns about a channel through the control ring
//!   - reopen_does_not_claim_a_second_ring(): second open keeps the directory unchanged

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use aipc_mailbox::{
    CoreId, Mailbox, MailboxConfig, MailboxError, RegionLayout, SharedRegion, Transport, Wait,
};

fn attach(layout: RegionLayout) -> (Mailbox, Mailbox) {
    let region = SharedRegion::new(layout);
    let local = Mailbox::new(CoreId::Local, Arc::clone(&region), MailboxConfig::default())
        .expect("attach local");
    let remote =
        Mailbox::new(CoreId::Remote, region, MailboxConfig::default()).expect("attach remote");
    (local, remote)
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn saturated_ring_preserves_order() {
    let (local, remote) = attach(RegionLayout { ring_depth: 4, channel_count: 4 });
    let tx_side = local.open_channel("bulk").expect("open local");
    let rx_side = remote.open_channel("bulk").expect("open remote");

    let (tx, rx) = mpsc::channel();
    remote.on_notify(&rx_side, move |channel| {
        while let Some(envelope) = channel.try_recv() {
            let _ = tx.send(envelope.payload);
        }
    });

    let mut rejected = 0u32;
    for i in 0u32..200 {
        loop {
            match tx_side.send(&i.to_le_bytes(), Wait::NonBlocking) {
                Ok(()) => break,
                Err(MailboxError::WouldBlock) => {
                    rejected += 1;
                    thread::yield_now();
                }
                Err(err) => panic!("unexpected send error: {err}"),
            }
        }
    }

    for expected in 0u32..200 {
        let payload = rx.recv_timeout(Duration::from_secs(2)).expect("message delivered");
        assert_eq!(payload, expected.to_le_bytes());
    }
    let stats = local.region().ring_stats(tx_side.address(), CoreId::Local).expect("ring");
    assert_eq!(stats.produced, 200);
    assert_eq!(u64::from(rejected), stats.rejected_full);
}

#[test]
fn handshake_marks_peer_connected() {
    let (local, remote) = attach(RegionLayout::default());
    let l = local.open_channel("aipc-rpc").expect("open local");
    let r = remote.open_channel("aipc-rpc").expect("open remote");
    assert!(wait_for(|| l.peer_connected()), "local never saw remote handshake");
    assert!(wait_for(|| r.peer_connected()), "remote never saw local handshake");
}

#[test]
fn reopen_does_not_claim_a_second_ring() {
    let (local, remote) = attach(RegionLayout { ring_depth: 2, channel_count: 3 });
    let first = local.open_channel("only").expect("first open");
    let again = local.open_channel("only").expect("second open");
    assert!(first.same_as(&again));
    // Directory has control + "only" + one free entry; the free entry is still claimable.
    let other = remote.open_channel("other").expect("free entry left");
    assert_ne!(other.address(), first.address());
}
