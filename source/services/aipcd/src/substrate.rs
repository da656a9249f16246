// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Composition of one core's substrate over the shared memory window
//!
//! OWNERS: @runtime
//!
//! `SharedMemory` stands in for the physical window both cores map: the mailbox region
//! and the distributed mutex array. Each core starts its own `Substrate` on it; the two
//! instances only ever talk through that window.
//!
//! Start order: mailbox, channels, deferred worker, registry + engine, broker, mutex
//! manager, link-control program, notification handlers. Teardown stops the broker and
//! the deferred worker before the notification thread goes away.

use std::sync::Arc;

use aipc_bridge::{ProcessEndpoint, RpcArgs};
use aipc_mailbox::{Channel, CoreId, Mailbox, SharedRegion, Transport};
use log::{error, info};

use crate::bridge::{Broker, BrokerStats};
use crate::config::SubstrateConfig;
use crate::deferred::{DeferredQueue, DeferredStats};
use crate::error::{AipcError, Result};
use crate::link::{LinkControl, NoopPowerHooks, PowerHooks};
use crate::mutex::{MutexManager, MutexStats, MutexTable};
use crate::rpc::{EngineStats, LocalProgram, Registry, RpcEngine};

/// Memory visible to both cores.
pub struct SharedMemory {
    region: Arc<SharedRegion>,
    mutexes: Arc<MutexTable>,
}

impl SharedMemory {
    /// Lays out the mailbox region and the mutex array described by `config`.
    pub fn new(config: &SubstrateConfig) -> Self {
        Self { region: SharedRegion::new(config.region_layout()), mutexes: MutexTable::new(config.mutex_count) }
    }

    /// Mailbox region.
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Distributed mutex array.
    pub fn mutexes(&self) -> &Arc<MutexTable> {
        &self.mutexes
    }

    /// Simulates loss of the shared window; both cores see TRANSPORT_DOWN.
    pub fn fail(&self) {
        self.region.fail();
    }
}

/// Counter snapshot of one core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubstrateStats {
    /// RPC engine counters.
    pub engine: EngineStats,
    /// Distributed mutex counters.
    pub mutex: MutexStats,
    /// Deferred queue counters.
    pub deferred: DeferredStats,
    /// Broker counters.
    pub broker: BrokerStats,
}

/// One core's running substrate.
pub struct Substrate {
    core: CoreId,
    config: SubstrateConfig,
    rpc_channel: Channel,
    engine: Arc<RpcEngine>,
    mutexes: Arc<MutexManager>,
    deferred: Arc<DeferredQueue>,
    broker: Arc<Broker>,
    link: Arc<LinkControl>,
    mailbox: Mailbox,
}

impl Substrate {
    /// Starts `core` on `shared` with `config`, reporting lifecycle events to `hooks`.
    pub fn start(
        core: CoreId,
        shared: &SharedMemory,
        config: SubstrateConfig,
        hooks: Arc<dyn PowerHooks>,
    ) -> Result<Self> {
        if let Err(err) = config.validate() {
            error!("aipcd: {core} refused to start: {err}");
            return Err(AipcError::Config);
        }
        let mailbox = Mailbox::new(core, Arc::clone(&shared.region), config.mailbox())?;
        let rpc_channel = mailbox.open_channel(&config.rpc_channel)?;
        let wake_channel = mailbox.open_channel(&config.mutex_channel)?;

        let deferred = Arc::new(DeferredQueue::start(core, config.deferred_queue_depth)?);
        let registry = Arc::new(Registry::new(config.dynamic_program_min));
        let engine = Arc::new(RpcEngine::new(
            core,
            rpc_channel.clone(),
            registry,
            Arc::clone(&deferred),
            &config,
        ));
        let broker = Broker::new(Arc::clone(engine.registry()), engine.reply_sink());
        engine.attach_relay(broker.clone());

        let mutexes = Arc::new(MutexManager::new(
            core,
            Arc::clone(&shared.mutexes),
            Arc::clone(&shared.region),
            wake_channel.clone(),
            &config,
        ));

        let link = LinkControl::new(Arc::clone(&engine), hooks, &config);
        engine.register_program(link.program(&config))?;
        engine.declare_remote(LinkControl::descriptor(&config))?;

        {
            let engine = Arc::clone(&engine);
            mailbox.on_notify(&rpc_channel, move |channel| engine.drain(channel));
        }
        {
            let mutexes = Arc::clone(&mutexes);
            mailbox.on_notify(&wake_channel, move |channel| mutexes.on_wake(channel));
        }
        info!(
            "aipcd: {core} substrate up (rpc={}, mutex={}, mutexes={})",
            config.rpc_channel,
            config.mutex_channel,
            mutexes.len()
        );
        Ok(Self { core, config, rpc_channel, engine, mutexes, deferred, broker, link, mailbox })
    }

    /// Core this substrate runs on.
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Configuration in effect.
    pub fn config(&self) -> &SubstrateConfig {
        &self.config
    }

    /// RPC engine.
    pub fn engine(&self) -> &Arc<RpcEngine> {
        &self.engine
    }

    /// Distributed mutexes.
    pub fn mutexes(&self) -> &Arc<MutexManager> {
        &self.mutexes
    }

    /// User-space broker.
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Link-control endpoint.
    pub fn link(&self) -> &Arc<LinkControl> {
        &self.link
    }

    /// Returns `false` once the RPC channel went down.
    pub fn is_up(&self) -> bool {
        self.rpc_channel.is_up()
    }

    /// Registers a privileged program.
    pub fn register_program(&self, program: LocalProgram) -> Result<()> {
        self.engine.register_program(program)
    }

    /// Removes a program.
    pub fn unregister_program(&self, program_id: u32) -> Result<()> {
        self.engine.unregister_program(program_id)
    }

    /// Calls a procedure on the peer core.
    pub fn call(&self, program_id: u32, version: u32, procedure_id: u32, args: &RpcArgs) -> Result<RpcArgs> {
        self.engine.call(program_id, version, procedure_id, args)
    }

    /// Accepts a user-space process connection.
    pub fn connect_process(&self, pid: u32) -> Result<ProcessEndpoint> {
        self.broker.connect(pid)
    }

    /// Process-exit hook of the host environment.
    pub fn process_exited(&self, pid: u32) {
        self.broker.process_exited(pid);
    }

    /// Declares every channel of this core down.
    pub fn bring_down(&self) {
        self.mailbox.bring_down();
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SubstrateStats {
        SubstrateStats {
            engine: self.engine.stats(),
            mutex: self.mutexes.stats(),
            deferred: self.deferred.stats(),
            broker: self.broker.stats(),
        }
    }
}

impl Drop for Substrate {
    fn drop(&mut self) {
        self.broker.shutdown();
        self.deferred.shutdown();
        info!("aipcd: {} substrate down", self.core);
    }
}

/// Both cores started on fresh shared memory, with no-op power hooks.
pub struct SubstratePair {
    /// Shared window.
    pub shared: SharedMemory,
    /// Application-core substrate.
    pub local: Substrate,
    /// Companion-core substrate.
    pub remote: Substrate,
}

/// Starts a local/remote pair over one [`SharedMemory`].
pub fn start_pair(config: &SubstrateConfig) -> Result<SubstratePair> {
    let shared = SharedMemory::new(config);
    let local = Substrate::start(CoreId::Local, &shared, config.clone(), Arc::new(NoopPowerHooks))?;
    let remote = Substrate::start(CoreId::Remote, &shared, config.clone(), Arc::new(NoopPowerHooks))?;
    Ok(SubstratePair { shared, local, remote })
}
