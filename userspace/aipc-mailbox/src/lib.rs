// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared-memory mailbox transport between the application core and the
//! companion real-time core
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests per module + `tests/channel_pair.rs`
//!
//! PUBLIC API:
//!   - SharedRegion: the memory window both cores map (rings, channel directory, doorbells)
//!   - Mailbox: one core's view of the region, owning its notification context
//!   - Channel: named ring pair obtained via `Mailbox::open_channel`
//!   - Transport trait: send side used by the mutex manager and the RPC engine
//!   - Wait enum, MailboxError
//!
//! DEPENDENCIES:
//!   - aipc-sync: busy-wait words guarding every shared read-modify-write
//!   - parking_lot: local-only locking (channel tables, doorbell parking)
//!
//! INVARIANTS:
//!   - Per-direction delivery follows production order
//!   - A full ring rejects the producer; an in-use slot is never overwritten
//!   - Once a channel is down it stays down; every later send fails with `TransportDown`

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use core::fmt;
use core::time::Duration;

pub mod budget;
mod channel;
mod doorbell;
mod region;
mod ring;

pub use channel::{Channel, Handshake, Mailbox, MailboxConfig, HANDSHAKE_REOPEN};
pub use region::{RegionLayout, SharedRegion, CHANNEL_NAME_LEN, CONTROL_CHANNEL};
pub use ring::{RingStats, SLOT_PAYLOAD_MAX};

/// Result type returned by mailbox operations.
pub type Result<T> = core::result::Result<T, MailboxError>;

/// One of the two execution domains sharing the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CoreId {
    /// Application processor.
    Local,
    /// Companion real-time processor.
    Remote,
}

impl CoreId {
    /// The other core.
    pub const fn peer(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }

    /// Bit used for this core in shared bitmasks.
    pub const fn bit(self) -> u8 {
        match self {
            Self::Local => 0b01,
            Self::Remote => 0b10,
        }
    }

    /// Non-zero tag written into lock words held by this core.
    pub const fn tag(self) -> u32 {
        self.bit() as u32
    }

    /// Index into per-core arrays.
    pub const fn index(self) -> usize {
        match self {
            Self::Local => 0,
            Self::Remote => 1,
        }
    }

    /// Decodes a tag produced by [`CoreId::tag`].
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0b01 => Some(Self::Local),
            0b10 => Some(Self::Remote),
            _ => None,
        }
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// Behaviour of a send when the outbound ring is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Retry until a slot frees up or the channel goes down.
    Blocking,
    /// Fail with [`MailboxError::WouldBlock`] if no slot is free.
    NonBlocking,
    /// Retry until a slot frees up or the timeout expires.
    Timeout(Duration),
}

/// Errors produced by the mailbox transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MailboxError {
    /// No free slot right now.
    #[error("ring full")]
    WouldBlock,
    /// No free slot within the requested budget.
    #[error("send timed out")]
    Timeout,
    /// Shared memory lost or channel failed; permanent for this channel.
    #[error("transport down")]
    TransportDown,
    /// Payload or channel name exceeds the fixed slot/name size.
    #[error("payload too large")]
    TooLarge,
    /// A control frame could not be decoded.
    #[error("malformed frame")]
    Malformed,
    /// The channel directory has no free entry.
    #[error("no free channel")]
    NoChannel,
}

/// Message taken out of a slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Core that produced the message.
    pub sender: CoreId,
    /// Message bytes; `payload.len()` is the envelope's payload length.
    pub payload: Vec<u8>,
}

/// Send side of a cross-core connection.
pub trait Transport: Send + Sync {
    /// Copies `payload` into the next free outbound slot and notifies the peer.
    fn send(&self, payload: &[u8], wait: Wait) -> Result<()>;

    /// Returns `false` once the connection went down.
    fn is_up(&self) -> bool;
}
