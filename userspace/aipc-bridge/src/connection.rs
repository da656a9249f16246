// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process <-> broker bridging connection
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - connection_pair(): process endpoint + broker endpoint backed by in-memory queues
//!   - Endpoint::send() / Endpoint::recv(): frame-preserving exchange
//!   - Endpoint::close(): drop the send side; the peer observes `Disconnected`
//!
//! ERROR CONDITIONS:
//!   - BridgeError::Disconnected: peer closed or dropped its endpoint
//!   - BridgeError::WouldBlock / Timeout: nothing to receive
//!
//! DEPENDENCIES:
//!   - std::sync::mpsc: one queue per direction
//!   - parking_lot::Mutex: receiver ownership and the closable send side

use core::time::Duration;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};

use parking_lot::Mutex;

use crate::{BridgeError, Result};

/// Process-side endpoint.
pub type ProcessEndpoint = Endpoint;
/// Broker-side endpoint.
pub type BrokerEndpoint = Endpoint;

/// Creates a connected process/broker endpoint pair.
pub fn connection_pair() -> (ProcessEndpoint, BrokerEndpoint) {
    let (up_tx, up_rx) = mpsc::channel::<Vec<u8>>();
    let (down_tx, down_rx) = mpsc::channel::<Vec<u8>>();
    (Endpoint::new(up_tx, down_rx), Endpoint::new(down_tx, up_rx))
}

/// One end of a bridging connection.
pub struct Endpoint {
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    rx: Mutex<Receiver<Vec<u8>>>,
}

impl Endpoint {
    fn new(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        Self { tx: Mutex::new(Some(tx)), rx: Mutex::new(rx) }
    }

    /// Sends one frame.
    pub fn send(&self, frame: &[u8]) -> Result<()> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(frame.to_vec()).map_err(|_| BridgeError::Disconnected),
            None => Err(BridgeError::Disconnected),
        }
    }

    /// Receives one frame; `None` blocks until a frame or disconnect arrives.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let receiver = self.rx.lock();
        match timeout {
            None => receiver.recv().map_err(|_| BridgeError::Disconnected),
            Some(timeout) if timeout.is_zero() => receiver.try_recv().map_err(|err| match err {
                TryRecvError::Empty => BridgeError::WouldBlock,
                TryRecvError::Disconnected => BridgeError::Disconnected,
            }),
            Some(timeout) => receiver.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => BridgeError::Timeout,
                RecvTimeoutError::Disconnected => BridgeError::Disconnected,
            }),
        }
    }

    /// Closes the send side. Idempotent.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Returns `true` until [`Endpoint::close`] ran.
    pub fn is_open(&self) -> bool {
        self.tx.lock().is_some()
    }
}
