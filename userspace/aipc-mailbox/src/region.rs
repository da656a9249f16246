// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The shared memory window: channel directory, one ring per direction per channel, and a
//! doorbell per core.
//!
//! On hardware this is a carve-out both cores map at boot. Here it is an `Arc` handed to
//! both [`crate::Mailbox`] instances; nothing else is shared between them.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aipc_sync::SpinLock;
use log::{info, warn};

use crate::doorbell::{Doorbell, REGION_EVENT};
use crate::ring::{Ring, RingStats};
use crate::{CoreId, MailboxError, Result};

/// Fixed size of a channel name in the directory and in handshakes.
pub const CHANNEL_NAME_LEN: usize = 32;

/// Address of the control channel carrying handshakes.
pub const CONTROL_CHANNEL: u32 = 0;

pub(crate) const CONTROL_NAME: &str = "aipc-ctrl";

// Doorbell bit 63 is reserved for region events.
const MAX_CHANNELS: usize = REGION_EVENT as usize;

type Name = [u8; CHANNEL_NAME_LEN];

/// Geometry of a shared region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionLayout {
    /// Slots per ring.
    pub ring_depth: usize,
    /// Directory entries, including the control channel.
    pub channel_count: usize,
}

impl Default for RegionLayout {
    fn default() -> Self {
        Self { ring_depth: 16, channel_count: 8 }
    }
}

impl RegionLayout {
    fn normalized(self) -> Self {
        Self {
            ring_depth: self.ring_depth.max(1),
            channel_count: self.channel_count.clamp(2, MAX_CHANNELS),
        }
    }
}

/// Memory visible to both cores.
pub struct SharedRegion {
    layout: RegionLayout,
    failed: AtomicBool,
    directory: SpinLock<Vec<Option<Name>>>,
    rings: Box<[[Ring; 2]]>,
    doorbells: [Doorbell; 2],
}

impl SharedRegion {
    /// Lays out a fresh region. Depth and channel count are clamped to usable values.
    pub fn new(layout: RegionLayout) -> Arc<Self> {
        let layout = layout.normalized();
        let mut directory = vec![None; layout.channel_count];
        directory[CONTROL_CHANNEL as usize] = encode_name(CONTROL_NAME).ok();
        let rings = (0..layout.channel_count)
            .map(|_| [Ring::new(layout.ring_depth), Ring::new(layout.ring_depth)])
            .collect();
        info!(
            "aipc-mailbox: region ready depth={} channels={}",
            layout.ring_depth, layout.channel_count
        );
        Arc::new(Self {
            layout,
            failed: AtomicBool::new(false),
            directory: SpinLock::new(directory),
            rings,
            doorbells: [Doorbell::new(), Doorbell::new()],
        })
    }

    /// Geometry in effect.
    pub fn layout(&self) -> RegionLayout {
        self.layout
    }

    /// Marks the region as lost. Every channel on both cores goes down.
    pub fn fail(&self) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            warn!("aipc-mailbox: shared region failed");
        }
        for bell in &self.doorbells {
            bell.raise(REGION_EVENT);
        }
    }

    /// Returns `true` once [`SharedRegion::fail`] was called.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Counters of the ring carrying `producer`'s messages on `address`.
    pub fn ring_stats(&self, address: u32, producer: CoreId) -> Option<RingStats> {
        self.rings.get(address as usize).map(|pair| pair[producer.index()].stats())
    }

    /// Slots currently marked in use on the ring carrying `producer`'s messages.
    pub fn occupied(&self, address: u32, producer: CoreId) -> usize {
        self.rings.get(address as usize).map_or(0, |pair| pair[producer.index()].occupied())
    }

    /// Finds the directory entry for `name`, claiming a free one if needed.
    pub(crate) fn claim(&self, name: &str) -> Result<u32> {
        let encoded = encode_name(name)?;
        let mut directory = self.directory.lock();
        if let Some(address) = directory.iter().position(|entry| entry.as_ref() == Some(&encoded)) {
            return Ok(address as u32);
        }
        let address = directory.iter().position(Option::is_none).ok_or(MailboxError::NoChannel)?;
        directory[address] = Some(encoded);
        Ok(address as u32)
    }

    /// Name recorded for `address`, if the entry is claimed.
    pub(crate) fn name_of(&self, address: u32) -> Option<String> {
        let directory = self.directory.lock();
        directory.get(address as usize).copied().flatten().and_then(|name| decode_name(&name).ok())
    }

    pub(crate) fn ring(&self, address: u32, producer: CoreId) -> Option<&Ring> {
        self.rings.get(address as usize).map(|pair| &pair[producer.index()])
    }

    pub(crate) fn doorbell(&self, core: CoreId) -> &Doorbell {
        &self.doorbells[core.index()]
    }
}

pub(crate) fn encode_name(name: &str) -> Result<Name> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.contains(&0) {
        return Err(MailboxError::Malformed);
    }
    if bytes.len() > CHANNEL_NAME_LEN {
        return Err(MailboxError::TooLarge);
    }
    let mut out = [0u8; CHANNEL_NAME_LEN];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

pub(crate) fn decode_name(raw: &[u8]) -> Result<String> {
    let len = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    if len == 0 {
        return Err(MailboxError::Malformed);
    }
    core::str::from_utf8(&raw[..len]).map(str::to_string).map_err(|_| MailboxError::Malformed)
}
