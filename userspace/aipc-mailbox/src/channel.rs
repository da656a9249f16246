// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Named channels, the open handshake, and the per-core notification context
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - Mailbox::new(): attach one core to a region and start its notification thread
//!   - Mailbox::open_channel(): claim (or re-announce) a named ring pair
//!   - Mailbox::on_notify(): install the drain handler for a channel
//!   - Channel::send() / Channel::try_recv(): produce / consume one message
//!   - Channel::on_down(): observe the channel going down
//!
//! ERROR CONDITIONS:
//!   - MailboxError::TransportDown: region failed or repeated send timeouts
//!   - MailboxError::WouldBlock / Timeout: ring full (back-pressure)
//!   - MailboxError::TooLarge: payload does not fit a slot
//!
//! Handlers run on the core's notification thread. They must not block: anything slow is
//! handed to a worker by the component that installed the handler.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use core::time::Duration;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::budget::{HostClock, SendBudget};
use crate::doorbell::REGION_EVENT;
use crate::region::{decode_name, encode_name, CONTROL_NAME};
use crate::{
    CoreId, Envelope, MailboxError, Result, SharedRegion, Transport, Wait, CHANNEL_NAME_LEN,
    CONTROL_CHANNEL,
};

/// Handshake flag: the sender had already opened this channel.
pub const HANDSHAKE_REOPEN: u32 = 1 << 0;

const HANDSHAKE_LEN: usize = 4 + CHANNEL_NAME_LEN + 4;
const IRQ_IDLE_WAIT: Duration = Duration::from_millis(50);

type NotifyHandler = Arc<dyn Fn(&Channel) + Send + Sync>;
type DownHandler = Box<dyn FnOnce() + Send>;

/// Tunables for one core's mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MailboxConfig {
    /// Budget applied to sends that must not fail on a briefly full ring (handshakes).
    pub send_budget: Duration,
    /// Consecutive send timeouts after which a channel is declared down.
    pub max_send_failures: u32,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self { send_budget: Duration::from_millis(100), max_send_failures: 3 }
    }
}

/// Channel-open announcement sent on the control channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// Directory address of the channel's ring pair.
    pub destination_address: u32,
    /// Channel name.
    pub channel_name: String,
    /// `HANDSHAKE_*` flags.
    pub flags: u32,
}

impl Handshake {
    /// Encodes as `address:u32le | name[32] (NUL padded) | flags:u32le`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let name = encode_name(&self.channel_name)?;
        let mut out = Vec::with_capacity(HANDSHAKE_LEN);
        out.extend_from_slice(&self.destination_address.to_le_bytes());
        out.extend_from_slice(&name);
        out.extend_from_slice(&self.flags.to_le_bytes());
        Ok(out)
    }

    /// Decodes a frame produced by [`Handshake::encode`].
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() != HANDSHAKE_LEN {
            return Err(MailboxError::Malformed);
        }
        let (address, rest) = frame.split_at(4);
        let (name, flags) = rest.split_at(CHANNEL_NAME_LEN);
        Ok(Self {
            destination_address: u32::from_le_bytes([address[0], address[1], address[2], address[3]]),
            channel_name: decode_name(name)?,
            flags: u32::from_le_bytes([flags[0], flags[1], flags[2], flags[3]]),
        })
    }
}

struct ChannelInner {
    name: String,
    address: u32,
    core: CoreId,
    region: Arc<SharedRegion>,
    config: MailboxConfig,
    peer_connected: AtomicBool,
    down: AtomicBool,
    send_failures: AtomicU32,
    down_handlers: Mutex<Vec<DownHandler>>,
}

/// One core's handle on a named ring pair. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    fn new(
        name: String,
        address: u32,
        core: CoreId,
        region: Arc<SharedRegion>,
        config: MailboxConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name,
                address,
                core,
                region,
                config,
                peer_connected: AtomicBool::new(false),
                down: AtomicBool::new(false),
                send_failures: AtomicU32::new(0),
                down_handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Directory address (the handshake's destination address).
    pub fn address(&self) -> u32 {
        self.inner.address
    }

    /// Core this handle belongs to.
    pub fn core(&self) -> CoreId {
        self.inner.core
    }

    /// Returns `true` once the peer announced this channel.
    pub fn peer_connected(&self) -> bool {
        self.inner.peer_connected.load(Ordering::Acquire)
    }

    /// Returns `true` if both handles refer to the same ring pair on the same core.
    pub fn same_as(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Takes the oldest message the peer produced on this channel.
    ///
    /// Slots with a corrupt sender tag are released and skipped.
    pub fn try_recv(&self) -> Option<Envelope> {
        let ring = self.inner.region.ring(self.inner.address, self.inner.core.peer())?;
        loop {
            match ring.consume(self.inner.core)? {
                Ok(envelope) => return Some(envelope),
                Err(_) => warn!("aipc-mailbox: {} dropped slot with bad sender tag", self.inner.name),
            }
        }
    }

    /// Registers `handler` to run once when the channel goes down.
    ///
    /// Runs immediately if the channel is already down.
    pub fn on_down(&self, handler: impl FnOnce() + Send + 'static) {
        let mut handlers = self.inner.down_handlers.lock();
        if self.inner.down.load(Ordering::Acquire) {
            drop(handlers);
            handler();
            return;
        }
        handlers.push(Box::new(handler));
    }

    /// Declares the channel down and runs the down handlers once.
    pub fn bring_down(&self) {
        if self.inner.down.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("aipc-mailbox: channel {} down", self.inner.name);
        let handlers = core::mem::take(&mut *self.inner.down_handlers.lock());
        for handler in handlers {
            handler();
        }
    }

    fn try_send(&self, payload: &[u8]) -> Result<()> {
        if !self.is_up() {
            return Err(MailboxError::TransportDown);
        }
        let ring = self
            .inner
            .region
            .ring(self.inner.address, self.inner.core)
            .ok_or(MailboxError::TransportDown)?;
        ring.produce(self.inner.core, payload)?;
        self.inner.region.doorbell(self.inner.core.peer()).raise(self.inner.address);
        Ok(())
    }

    fn note_send_failure(&self) -> MailboxError {
        let failures = self.inner.send_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.inner.config.max_send_failures {
            warn!("aipc-mailbox: {} failed {failures} sends in a row", self.inner.name);
            self.bring_down();
            return MailboxError::TransportDown;
        }
        MailboxError::Timeout
    }
}

impl Transport for Channel {
    fn send(&self, payload: &[u8], wait: Wait) -> Result<()> {
        match SendBudget::new(HostClock::new(), wait).run(|| self.try_send(payload)) {
            Ok(()) => {
                self.inner.send_failures.store(0, Ordering::Release);
                Ok(())
            }
            Err(MailboxError::Timeout) => Err(self.note_send_failure()),
            Err(err) => Err(err),
        }
    }

    fn is_up(&self) -> bool {
        !self.inner.down.load(Ordering::Acquire) && !self.inner.region.is_failed()
    }
}

struct MailboxInner {
    core: CoreId,
    region: Arc<SharedRegion>,
    config: MailboxConfig,
    channels: Mutex<HashMap<String, Channel>>,
    by_address: RwLock<HashMap<u32, Channel>>,
    handlers: RwLock<HashMap<u32, NotifyHandler>>,
    announced: Mutex<HashSet<u32>>,
    stopping: AtomicBool,
}

/// One core's attachment to a [`SharedRegion`].
///
/// Owns the core's notification thread; dropping the mailbox stops it.
pub struct Mailbox {
    inner: Arc<MailboxInner>,
    control: Channel,
    irq: Option<JoinHandle<()>>,
}

impl Mailbox {
    /// Attaches `core` to `region` and starts its notification thread.
    pub fn new(core: CoreId, region: Arc<SharedRegion>, config: MailboxConfig) -> Result<Self> {
        let control = Channel::new(
            CONTROL_NAME.to_string(),
            CONTROL_CHANNEL,
            core,
            Arc::clone(&region),
            config,
        );
        let inner = Arc::new(MailboxInner {
            core,
            region,
            config,
            channels: Mutex::new(HashMap::new()),
            by_address: RwLock::new(HashMap::from([(CONTROL_CHANNEL, control.clone())])),
            handlers: RwLock::new(HashMap::new()),
            announced: Mutex::new(HashSet::new()),
            stopping: AtomicBool::new(false),
        });
        let irq = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name(format!("aipc-irq-{core}"))
                .spawn(move || irq_loop(&inner))
                .map_err(|_| MailboxError::TransportDown)?
        };
        info!("aipc-mailbox: {core} core attached");
        Ok(Self { inner, control, irq: Some(irq) })
    }

    /// Core this mailbox belongs to.
    pub fn core(&self) -> CoreId {
        self.inner.core
    }

    /// Region this mailbox is attached to.
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.inner.region
    }

    /// Opens `name`, announcing it to the peer.
    ///
    /// Opening a name twice returns the existing handle and re-sends the handshake with
    /// [`HANDSHAKE_REOPEN`]; no second ring pair is claimed.
    pub fn open_channel(&self, name: &str) -> Result<Channel> {
        if self.inner.region.is_failed() {
            return Err(MailboxError::TransportDown);
        }
        let (channel, flags) = {
            let mut channels = self.inner.channels.lock();
            match channels.get(name) {
                Some(existing) => (existing.clone(), HANDSHAKE_REOPEN),
                None => {
                    let address = self.inner.region.claim(name)?;
                    let channel = Channel::new(
                        name.to_string(),
                        address,
                        self.inner.core,
                        Arc::clone(&self.inner.region),
                        self.inner.config,
                    );
                    if self.inner.announced.lock().contains(&address) {
                        channel.inner.peer_connected.store(true, Ordering::Release);
                    }
                    channels.insert(name.to_string(), channel.clone());
                    self.inner.by_address.write().insert(address, channel.clone());
                    info!("aipc-mailbox: {} opened {name} at {address}", self.inner.core);
                    (channel, 0)
                }
            }
        };
        let handshake = Handshake {
            destination_address: channel.address(),
            channel_name: name.to_string(),
            flags,
        };
        self.control.send(&handshake.encode()?, Wait::Timeout(self.inner.config.send_budget))?;
        Ok(channel)
    }

    /// Installs the drain handler for `channel`, replacing any previous one.
    ///
    /// The handler runs on the notification thread and must consume every marked slot.
    pub fn on_notify(&self, channel: &Channel, handler: impl Fn(&Channel) + Send + Sync + 'static) {
        self.inner.handlers.write().insert(channel.address(), Arc::new(handler));
        // Drain anything that arrived before the handler existed.
        self.inner.region.doorbell(self.inner.core).raise(channel.address());
    }

    /// Declares every channel of this core down.
    pub fn bring_down(&self) {
        bring_down_all(&self.inner);
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.region.doorbell(self.inner.core).raise(REGION_EVENT);
        if let Some(irq) = self.irq.take() {
            if irq.thread().id() != thread::current().id() {
                let _ = irq.join();
            }
        }
        self.inner.handlers.write().clear();
    }
}

fn bring_down_all(inner: &MailboxInner) {
    let channels: Vec<Channel> = inner.by_address.read().values().cloned().collect();
    for channel in channels {
        channel.bring_down();
    }
}

fn irq_loop(inner: &MailboxInner) {
    let bell = inner.region.doorbell(inner.core);
    while !inner.stopping.load(Ordering::Acquire) {
        let pending = bell.wait(IRQ_IDLE_WAIT);
        if inner.region.is_failed() {
            bring_down_all(inner);
        }
        if pending == 0 {
            continue;
        }
        for line in 0..REGION_EVENT {
            if pending & (1u64 << line) == 0 {
                continue;
            }
            if line == CONTROL_CHANNEL {
                drain_control(inner);
                continue;
            }
            let handler = inner.handlers.read().get(&line).cloned();
            let channel = inner.by_address.read().get(&line).cloned();
            match (handler, channel) {
                (Some(handler), Some(channel)) => handler(&channel),
                _ => debug!("aipc-mailbox: {} line {line} raised with no handler", inner.core),
            }
        }
    }
}

fn drain_control(inner: &MailboxInner) {
    let Some(control) = inner.by_address.read().get(&CONTROL_CHANNEL).cloned() else {
        return;
    };
    while let Some(envelope) = control.try_recv() {
        match Handshake::decode(&envelope.payload) {
            Ok(handshake) => {
                debug!(
                    "aipc-mailbox: {} saw handshake for {} at {} flags={:#x}",
                    inner.core, handshake.channel_name, handshake.destination_address, handshake.flags
                );
                let address = handshake.destination_address;
                inner.announced.lock().insert(address);
                if let Some(channel) = inner.by_address.read().get(&address) {
                    channel.inner.peer_connected.store(true, Ordering::Release);
                }
            }
            Err(err) => warn!("aipc-mailbox: {} dropped control frame: {err}", inner.core),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RegionLayout;
    use std::sync::mpsc;

    fn pair(depth: usize) -> (Mailbox, Mailbox) {
        let region = SharedRegion::new(RegionLayout { ring_depth: depth, channel_count: 4 });
        let local = Mailbox::new(CoreId::Local, Arc::clone(&region), MailboxConfig::default()).unwrap();
        let remote = Mailbox::new(CoreId::Remote, region, MailboxConfig::default()).unwrap();
        (local, remote)
    }

    #[test]
    fn handshake_roundtrip() {
        let hs = Handshake { destination_address: 3, channel_name: "aipc-rpc".into(), flags: HANDSHAKE_REOPEN };
        let frame = hs.encode().unwrap();
        assert_eq!(frame.len(), HANDSHAKE_LEN);
        assert_eq!(Handshake::decode(&frame).unwrap(), hs);
        assert_eq!(Handshake::decode(&frame[..10]), Err(MailboxError::Malformed));
    }

    #[test]
    fn reopen_returns_existing_channel() {
        let (local, _remote) = pair(4);
        let first = local.open_channel("aipc-rpc").unwrap();
        let second = local.open_channel("aipc-rpc").unwrap();
        assert!(first.same_as(&second));
        assert_eq!(first.address(), second.address());
    }

    #[test]
    fn both_sides_bind_the_same_ring_pair() {
        let (local, remote) = pair(4);
        let l = local.open_channel("aipc-rpc").unwrap();
        let r = remote.open_channel("aipc-rpc").unwrap();
        assert_eq!(l.address(), r.address());
    }

    #[test]
    fn notify_handler_drains_messages() {
        let (local, remote) = pair(4);
        let l = local.open_channel("data").unwrap();
        let r = remote.open_channel("data").unwrap();
        let (tx, rx) = mpsc::channel();
        remote.on_notify(&r, move |channel| {
            while let Some(envelope) = channel.try_recv() {
                let _ = tx.send(envelope);
            }
        });
        l.send(b"hello", Wait::NonBlocking).unwrap();
        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.sender, CoreId::Local);
        assert_eq!(got.payload, b"hello");
    }

    #[test]
    fn full_ring_applies_backpressure() {
        let (local, _remote) = pair(2);
        let l = local.open_channel("data").unwrap();
        l.send(b"1", Wait::NonBlocking).unwrap();
        l.send(b"2", Wait::NonBlocking).unwrap();
        assert_eq!(l.send(b"3", Wait::NonBlocking), Err(MailboxError::WouldBlock));
        assert!(l.is_up());
    }

    #[test]
    fn repeated_timeouts_bring_channel_down() {
        let (local, _remote) = pair(1);
        let l = local.open_channel("data").unwrap();
        let (tx, rx) = mpsc::channel();
        l.on_down(move || {
            let _ = tx.send(());
        });
        l.send(b"fill", Wait::NonBlocking).unwrap();
        let budget = Wait::Timeout(Duration::from_millis(5));
        assert_eq!(l.send(b"x", budget), Err(MailboxError::Timeout));
        assert_eq!(l.send(b"x", budget), Err(MailboxError::Timeout));
        assert_eq!(l.send(b"x", budget), Err(MailboxError::TransportDown));
        assert!(!l.is_up());
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(l.send(b"x", Wait::NonBlocking), Err(MailboxError::TransportDown));
    }

    #[test]
    fn region_failure_brings_channels_down() {
        let (local, _remote) = pair(4);
        let l = local.open_channel("data").unwrap();
        let (tx, rx) = mpsc::channel();
        l.on_down(move || {
            let _ = tx.send(());
        });
        local.region().fail();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(l.send(b"x", Wait::NonBlocking), Err(MailboxError::TransportDown));
        assert_eq!(local.open_channel("other").err(), Some(MailboxError::TransportDown));
    }
}
