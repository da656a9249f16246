// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Link-control protocol for cross-core lifecycle coordination
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - LinkControl::hibernate(): PREPARE, wait for ACK or EXIT, then ENTER or EXIT
//!   - LinkControl::resume() / suspend(): lifecycle notifications
//!   - LinkControl::hand_off_gpios(): announce GPIOs now owned by this core only
//!   - LinkControl::publish_region() / query_peer_regions(): shared memory-region tables
//!   - PowerHooks: implemented by the power-management collaborator
//!
//! The protocol is an ordinary RPC program served by both cores. Commands that reach
//! the power-management hooks run on the deferred worker; answers to a PREPARE are
//! handled inline since they only wake the waiting initiator.
//!
//! INVARIANTS:
//!   - IDLE -> PREPARE_SENT -> (ENTER_SENT | EXIT_SENT) -> IDLE
//!   - PREPARE_SENT is left only on the matching ACK or EXIT; without an answer inside
//!     the ack timeout the hooks are told to abort, never to proceed
//!   - With the transport down every operation fails fast with TRANSPORT_DOWN

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::sync::{Arc, Weak};
use std::time::Instant;

use aipc_bridge::{ProcedureSpec, ProgramDescriptor, RpcArgs};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::SubstrateConfig;
use crate::error::{AipcError, Result};
use crate::rpc::{LocalProgram, RpcEngine};

/// Program id of the link-control program on both cores.
pub const LINK_PROGRAM_ID: u32 = 0x4C4B;
/// Link-control program version.
pub const LINK_VERSION: u32 = 1;
/// Lifecycle commands that may reach the power-management hooks.
pub const PROC_COMMAND: u32 = 1;
/// GPIO ownership hand-off; the id list travels as one descriptor buffer.
pub const PROC_GPIO_HANDOFF: u32 = 2;
/// Memory-region query; the table comes back as one descriptor buffer.
pub const PROC_REGION_QUERY: u32 = 3;
/// ACK or EXIT answering a PREPARE.
pub const PROC_ANSWER: u32 = 4;

/// Encoded size of a [`CommandFrame`].
pub const COMMAND_FRAME_LEN: usize = 4 + 8 + 8;

/// Link-control command vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum LinkCommand {
    /// Peer is about to hibernate; answer with ACK or EXIT.
    HibernatePrepare = 1,
    /// Peer is entering hibernation now.
    HibernateEnter = 2,
    /// Peer left (or refused) hibernation.
    HibernateExit = 3,
    /// Peer agrees to a hibernate transition.
    HibernateAck = 4,
    /// Peer is suspending.
    Suspend = 5,
    /// The listed GPIOs are now owned by the sender only.
    GpioOwnedLocal = 6,
    /// Ask the peer for its published memory regions.
    MemRegionQuery = 7,
    /// Sender published a memory region (`param1` base, `param2` size).
    MemRegionPublish = 8,
}

impl LinkCommand {
    fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::HibernatePrepare,
            2 => Self::HibernateEnter,
            3 => Self::HibernateExit,
            4 => Self::HibernateAck,
            5 => Self::Suspend,
            6 => Self::GpioOwnedLocal,
            7 => Self::MemRegionQuery,
            8 => Self::MemRegionPublish,
            _ => return None,
        })
    }
}

/// `{command:u32, param1:u64, param2:u64}`, little-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandFrame {
    /// Command.
    pub command: LinkCommand,
    /// First parameter.
    pub param1: u64,
    /// Second parameter.
    pub param2: u64,
}

impl CommandFrame {
    /// Frame with both parameters.
    pub fn new(command: LinkCommand, param1: u64, param2: u64) -> Self {
        Self { command, param1, param2 }
    }

    /// Encodes the frame.
    pub fn encode(&self) -> [u8; COMMAND_FRAME_LEN] {
        let mut out = [0u8; COMMAND_FRAME_LEN];
        out[..4].copy_from_slice(&(self.command as u32).to_le_bytes());
        out[4..12].copy_from_slice(&self.param1.to_le_bytes());
        out[12..].copy_from_slice(&self.param2.to_le_bytes());
        out
    }

    /// Decodes an encoded frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; COMMAND_FRAME_LEN] = bytes.try_into().map_err(|_| AipcError::InvalidArgument)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[..4]);
        let command = LinkCommand::from_u32(u32::from_le_bytes(word)).ok_or(AipcError::InvalidArgument)?;
        let mut param = [0u8; 8];
        param.copy_from_slice(&bytes[4..12]);
        let param1 = u64::from_le_bytes(param);
        param.copy_from_slice(&bytes[12..]);
        let param2 = u64::from_le_bytes(param);
        Ok(Self { command, param1, param2 })
    }

    fn args(&self) -> RpcArgs {
        RpcArgs::new(self.encode().to_vec())
    }
}

/// Hibernate transition state of the initiating side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// No transition in progress.
    Idle,
    /// PREPARE sent, waiting for ACK or EXIT.
    PrepareSent,
    /// Peer acknowledged; ENTER sent.
    EnterSent,
    /// Peer refused; EXIT sent.
    ExitSent,
}

/// Shared memory region published by one core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRegion {
    /// Base address.
    pub base: u64,
    /// Size in bytes.
    pub size: u64,
}

/// Power-management collaborator. Hooks triggered by the peer run on the deferred worker.
pub trait PowerHooks: Send + Sync {
    /// Peer wants to hibernate; `true` agrees (ACK), `false` refuses (EXIT).
    fn peer_prepare(&self) -> bool {
        true
    }
    /// Peer is entering hibernation.
    fn peer_enter(&self) {}
    /// Peer left hibernation.
    fn peer_exit(&self) {}
    /// Peer is suspending.
    fn peer_suspend(&self) {}
    /// A transition started by this core failed; undo any preparation.
    fn transition_aborted(&self) {}
    /// Peer now owns `gpios` exclusively.
    fn peer_owns_gpios(&self, _gpios: &[u32]) {}
}

/// Hooks that accept every transition and do nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPowerHooks;

impl PowerHooks for NoopPowerHooks {}

struct Transition {
    state: LinkState,
    sequence: u64,
    answer: Option<LinkCommand>,
}

/// One core's link-control endpoint.
pub struct LinkControl {
    engine: Arc<RpcEngine>,
    hooks: Arc<dyn PowerHooks>,
    ack_timeout: Duration,
    transition: Mutex<Transition>,
    answered: Condvar,
    next_sequence: AtomicU64,
    local_regions: Mutex<Vec<MemRegion>>,
    peer_regions: Mutex<Vec<MemRegion>>,
    peer_gpios: Mutex<Vec<u32>>,
}

impl LinkControl {
    /// Link-control endpoint calling the peer through `engine`.
    pub fn new(engine: Arc<RpcEngine>, hooks: Arc<dyn PowerHooks>, config: &SubstrateConfig) -> Arc<Self> {
        Arc::new(Self {
            engine,
            hooks,
            ack_timeout: config.link_ack_timeout(),
            transition: Mutex::new(Transition { state: LinkState::Idle, sequence: 0, answer: None }),
            answered: Condvar::new(),
            next_sequence: AtomicU64::new(1),
            local_regions: Mutex::new(Vec::new()),
            peer_regions: Mutex::new(Vec::new()),
            peer_gpios: Mutex::new(Vec::new()),
        })
    }

    /// Procedure table of the link-control program.
    pub fn descriptor(config: &SubstrateConfig) -> ProgramDescriptor {
        let timeout = config.link_ack_timeout();
        let frame = COMMAND_FRAME_LEN as u32;
        ProgramDescriptor::new(LINK_PROGRAM_ID, LINK_VERSION)
            .with(ProcedureSpec::new(PROC_COMMAND, "link-command").args(frame, 0).timeout(timeout).deferred())
            .with(ProcedureSpec::new(PROC_GPIO_HANDOFF, "link-gpio-handoff").args(frame, 1).timeout(timeout).deferred())
            .with(
                ProcedureSpec::new(PROC_REGION_QUERY, "link-region-query")
                    .args(frame, 0)
                    .results(0, 1)
                    .timeout(timeout)
                    .deferred(),
            )
            .with(ProcedureSpec::new(PROC_ANSWER, "link-answer").args(frame, 0).timeout(timeout))
    }

    /// Server side of the protocol, to be registered with this core's engine.
    pub fn program(self: &Arc<Self>, config: &SubstrateConfig) -> LocalProgram {
        let table = Self::descriptor(config);
        let mut program = LocalProgram::new(LINK_PROGRAM_ID, LINK_VERSION);
        for spec in table.procedures {
            let link = Arc::downgrade(self);
            let procedure_id = spec.procedure_id;
            program = program.with_procedure(spec, move |args| serve(&link, procedure_id, args));
        }
        program
    }

    /// Current transition state.
    pub fn state(&self) -> LinkState {
        self.transition.lock().state
    }

    /// Runs a hibernate transition with the peer.
    ///
    /// Returns `LinkAborted` if the peer refused or did not answer in time.
    pub fn hibernate(&self) -> Result<()> {
        let sequence = {
            let mut transition = self.transition.lock();
            if transition.state != LinkState::Idle {
                return Err(AipcError::Busy);
            }
            let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            *transition = Transition { state: LinkState::PrepareSent, sequence, answer: None };
            sequence
        };
        info!("aipcd: {} hibernate prepare seq {sequence}", self.engine.core());
        let deadline = Instant::now() + self.ack_timeout;
        if let Err(err) = self.command(PROC_COMMAND, CommandFrame::new(LinkCommand::HibernatePrepare, sequence, 0)) {
            return Err(self.abort(err));
        }

        let answer = {
            let mut transition = self.transition.lock();
            while transition.answer.is_none() {
                if self.answered.wait_until(&mut transition, deadline).timed_out() {
                    break;
                }
            }
            match transition.answer {
                Some(LinkCommand::HibernateAck) => {
                    transition.state = LinkState::EnterSent;
                    Some(LinkCommand::HibernateAck)
                }
                Some(_) => {
                    transition.state = LinkState::ExitSent;
                    Some(LinkCommand::HibernateExit)
                }
                None => None,
            }
        };
        match answer {
            Some(LinkCommand::HibernateAck) => {
                let sent = self.command(PROC_COMMAND, CommandFrame::new(LinkCommand::HibernateEnter, sequence, 0));
                match sent {
                    Ok(()) => {
                        self.set_idle();
                        info!("aipcd: {} hibernate entered seq {sequence}", self.engine.core());
                        Ok(())
                    }
                    Err(err) => Err(self.abort(err)),
                }
            }
            Some(_) => {
                warn!("aipcd: {} peer refused hibernate seq {sequence}", self.engine.core());
                let exit = CommandFrame::new(LinkCommand::HibernateExit, sequence, 0);
                if let Err(err) = self.command(PROC_COMMAND, exit) {
                    warn!("aipcd: {} hibernate exit for seq {sequence} not delivered: {err}", self.engine.core());
                }
                Err(self.abort(AipcError::LinkAborted))
            }
            None => {
                warn!("aipcd: {} no hibernate answer for seq {sequence}", self.engine.core());
                Err(self.abort(AipcError::LinkAborted))
            }
        }
    }

    fn abort(&self, err: AipcError) -> AipcError {
        self.set_idle();
        self.hooks.transition_aborted();
        match err {
            AipcError::TransportDown => AipcError::TransportDown,
            _ => AipcError::LinkAborted,
        }
    }

    fn set_idle(&self) {
        let mut transition = self.transition.lock();
        transition.state = LinkState::Idle;
        transition.answer = None;
    }

    /// Tells the peer this core left hibernation.
    pub fn resume(&self) -> Result<()> {
        self.command(PROC_COMMAND, CommandFrame::new(LinkCommand::HibernateExit, 0, 0))
    }

    /// Tells the peer this core is suspending.
    pub fn suspend(&self) -> Result<()> {
        self.command(PROC_COMMAND, CommandFrame::new(LinkCommand::Suspend, 0, 0))
    }

    /// Announces that `gpios` are now owned by this core only.
    pub fn hand_off_gpios(&self, gpios: &[u32]) -> Result<()> {
        let list: Vec<u8> = gpios.iter().flat_map(|id| id.to_le_bytes()).collect();
        let frame = CommandFrame::new(LinkCommand::GpioOwnedLocal, gpios.len() as u64, 0);
        let args = frame.args().with_descriptor(list);
        self.engine.call(LINK_PROGRAM_ID, LINK_VERSION, PROC_GPIO_HANDOFF, &args).map(|_| ())
    }

    /// Publishes `region` locally and to the peer.
    pub fn publish_region(&self, region: MemRegion) -> Result<()> {
        self.local_regions.lock().push(region);
        self.command(PROC_COMMAND, CommandFrame::new(LinkCommand::MemRegionPublish, region.base, region.size))
    }

    /// Fetches the peer's published regions and records them.
    pub fn query_peer_regions(&self) -> Result<Vec<MemRegion>> {
        let args = CommandFrame::new(LinkCommand::MemRegionQuery, 0, 0).args();
        let result = self.engine.call(LINK_PROGRAM_ID, LINK_VERSION, PROC_REGION_QUERY, &args)?;
        let table = result.descriptors.first().ok_or(AipcError::Malformed)?;
        let regions = decode_regions(table)?;
        *self.peer_regions.lock() = regions.clone();
        Ok(regions)
    }

    /// Regions this core published.
    pub fn local_regions(&self) -> Vec<MemRegion> {
        self.local_regions.lock().clone()
    }

    /// Peer regions known so far.
    pub fn peer_regions(&self) -> Vec<MemRegion> {
        self.peer_regions.lock().clone()
    }

    /// GPIOs the peer announced as its own.
    pub fn peer_owned_gpios(&self) -> Vec<u32> {
        self.peer_gpios.lock().clone()
    }

    fn command(&self, procedure_id: u32, frame: CommandFrame) -> Result<()> {
        self.engine.call(LINK_PROGRAM_ID, LINK_VERSION, procedure_id, &frame.args()).map(|_| ())
    }

    fn on_command(&self, frame: CommandFrame) -> Result<RpcArgs> {
        debug!("aipcd: {} link command {:?}", self.engine.core(), frame.command);
        match frame.command {
            LinkCommand::HibernatePrepare => {
                let answer = if self.hooks.peer_prepare() {
                    LinkCommand::HibernateAck
                } else {
                    LinkCommand::HibernateExit
                };
                self.command(PROC_ANSWER, CommandFrame::new(answer, frame.param1, 0))?;
            }
            LinkCommand::HibernateEnter => self.hooks.peer_enter(),
            LinkCommand::HibernateExit => self.hooks.peer_exit(),
            LinkCommand::Suspend => self.hooks.peer_suspend(),
            LinkCommand::MemRegionPublish => {
                self.peer_regions.lock().push(MemRegion { base: frame.param1, size: frame.param2 });
            }
            LinkCommand::HibernateAck | LinkCommand::GpioOwnedLocal | LinkCommand::MemRegionQuery => {
                return Err(AipcError::InvalidArgument);
            }
        }
        Ok(RpcArgs::default())
    }

    fn on_answer(&self, frame: CommandFrame) -> Result<RpcArgs> {
        if !matches!(frame.command, LinkCommand::HibernateAck | LinkCommand::HibernateExit) {
            return Err(AipcError::InvalidArgument);
        }
        let mut transition = self.transition.lock();
        if transition.state != LinkState::PrepareSent || transition.sequence != frame.param1 {
            warn!(
                "aipcd: {} stray {:?} for seq {} (state {:?})",
                self.engine.core(),
                frame.command,
                frame.param1,
                transition.state
            );
            return Err(AipcError::InvalidArgument);
        }
        transition.answer = Some(frame.command);
        self.answered.notify_all();
        Ok(RpcArgs::default())
    }

    fn on_gpio_handoff(&self, frame: CommandFrame, args: &RpcArgs) -> Result<RpcArgs> {
        if frame.command != LinkCommand::GpioOwnedLocal {
            return Err(AipcError::InvalidArgument);
        }
        let list = args.descriptors.first().ok_or(AipcError::InvalidArgument)?;
        if list.len() % 4 != 0 || (list.len() / 4) as u64 != frame.param1 {
            return Err(AipcError::InvalidArgument);
        }
        let gpios: Vec<u32> =
            list.chunks_exact(4).map(|id| u32::from_le_bytes([id[0], id[1], id[2], id[3]])).collect();
        self.hooks.peer_owns_gpios(&gpios);
        *self.peer_gpios.lock() = gpios;
        Ok(RpcArgs::default())
    }

    fn on_region_query(&self, frame: CommandFrame) -> Result<RpcArgs> {
        if frame.command != LinkCommand::MemRegionQuery {
            return Err(AipcError::InvalidArgument);
        }
        let table: Vec<u8> = self
            .local_regions
            .lock()
            .iter()
            .flat_map(|r| r.base.to_le_bytes().into_iter().chain(r.size.to_le_bytes()))
            .collect();
        Ok(RpcArgs::default().with_descriptor(table))
    }
}

fn serve(link: &Weak<LinkControl>, procedure_id: u32, args: &RpcArgs) -> Result<RpcArgs> {
    let link = link.upgrade().ok_or(AipcError::ProgramUnavailable)?;
    let frame = CommandFrame::decode(&args.fixed)?;
    match procedure_id {
        PROC_COMMAND => link.on_command(frame),
        PROC_ANSWER => link.on_answer(frame),
        PROC_GPIO_HANDOFF => link.on_gpio_handoff(frame, args),
        PROC_REGION_QUERY => link.on_region_query(frame),
        _ => Err(AipcError::ProcedureUnavailable),
    }
}

fn decode_regions(table: &[u8]) -> Result<Vec<MemRegion>> {
    if table.len() % 16 != 0 {
        return Err(AipcError::Malformed);
    }
    Ok(table
        .chunks_exact(16)
        .map(|entry| {
            let mut base = [0u8; 8];
            let mut size = [0u8; 8];
            base.copy_from_slice(&entry[..8]);
            size.copy_from_slice(&entry[8..]);
            MemRegion { base: u64::from_le_bytes(base), size: u64::from_le_bytes(size) }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_is_twenty_bytes() {
        let frame = CommandFrame::new(LinkCommand::MemRegionPublish, 0x2000_0000, 0x1000);
        let bytes = frame.encode();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[..4], &8u32.to_le_bytes());
        assert_eq!(CommandFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn bad_frames_are_rejected() {
        assert_eq!(CommandFrame::decode(&[0; 19]), Err(AipcError::InvalidArgument));
        let mut bytes = CommandFrame::new(LinkCommand::Suspend, 0, 0).encode();
        bytes[0] = 99;
        assert_eq!(CommandFrame::decode(&bytes), Err(AipcError::InvalidArgument));
    }

    #[test]
    fn region_table_rejects_partial_entries() {
        assert_eq!(decode_regions(&[0; 17]), Err(AipcError::Malformed));
        let mut table = 0x1000u64.to_le_bytes().to_vec();
        table.extend_from_slice(&0x200u64.to_le_bytes());
        assert_eq!(decode_regions(&table).unwrap(), vec![MemRegion { base: 0x1000, size: 0x200 }]);
    }

    #[test]
    fn descriptor_defers_everything_but_answers() {
        let table = LinkControl::descriptor(&SubstrateConfig::default());
        table.validate().unwrap();
        for spec in &table.procedures {
            assert_eq!(spec.deferred, spec.procedure_id != PROC_ANSWER, "{}", spec.name);
            assert_eq!(spec.timeout, Some(Duration::from_millis(500)));
        }
    }
}
