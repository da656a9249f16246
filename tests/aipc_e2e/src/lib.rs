// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared helpers for the AIPC end-to-end harness
//! INTENT: Two cores over one shared window, driven from the test thread
//! DEPS: aipcd (substrate), aipc-bridge (user-space client), aipc-mailbox (transport)

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use aipcd::{start_pair, SubstratePair, SubstrateConfig};

/// Configuration used by the scenarios: short timeouts so failures surface quickly.
pub fn test_config() -> SubstrateConfig {
    SubstrateConfig {
        call_timeout_ms: 400,
        mutex_retry_ms: 5,
        link_ack_timeout_ms: 300,
        ..SubstrateConfig::default()
    }
}

/// Starts both cores with [`test_config`].
pub fn pair() -> SubstratePair {
    start_pair(&test_config()).expect("start substrate pair")
}

/// Polls `cond` until it holds or two seconds pass.
pub fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}
