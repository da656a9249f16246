// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: AIPC substrate daemon: RPC, distributed mutexes and link control between
//! the application core and the companion real-time core
//! OWNERS: @runtime
//! STATUS: Functional (host mode)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, integration tests in tests/
//!
//! PUBLIC API:
//!   - Substrate / SharedMemory / start_pair(): per-core composition
//!   - rpc::RpcEngine: registration, blocking calls, incoming dispatch
//!   - mutex::MutexManager: distributed mutexes
//!   - bridge::Broker: user-space program bridging
//!   - link::LinkControl: hibernate/suspend/GPIO/memory-region coordination
//!   - service_main_loop(): daemon entry used by `main`
//!
//! DEPENDENCIES:
//!   - aipc-mailbox: shared region, channels, notification context
//!   - aipc-bridge: user-space datagrams and program tables
//!   - aipc-sync: lock words inside the shared mutex array
//!   - serde/toml: configuration

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod bridge;
pub mod config;
pub mod deferred;
pub mod error;
pub mod link;
pub mod mutex;
pub mod rpc;
pub mod substrate;

use std::io::BufRead;
use std::path::PathBuf;

use aipc_bridge::{ProcedureSpec, RpcArgs};
use log::info;
use thiserror::Error;

pub use config::{ConfigError, SubstrateConfig};
pub use error::{AipcError, Result};
pub use substrate::{start_pair, SharedMemory, Substrate, SubstratePair, SubstrateStats};

/// Program id of the self-check echo program.
pub const SELF_CHECK_PROGRAM: u32 = 0x0100;

/// Errors that end the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Command line could not be parsed.
    #[error("usage: {0}")]
    Usage(String),
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The substrate failed.
    #[error("substrate: {0}")]
    Substrate(#[from] AipcError),
}

/// Command-line options of the daemon.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DaemonOptions {
    /// TOML configuration file; defaults apply when absent.
    pub config: Option<PathBuf>,
    /// Exit after the self-check instead of serving until stdin closes.
    pub self_check: bool,
}

impl DaemonOptions {
    /// Parses `--config <path>` and `--self-check` (program name already stripped).
    pub fn from_args<I>(args: I) -> core::result::Result<Self, DaemonError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut options = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let path = args
                        .next()
                        .ok_or_else(|| DaemonError::Usage("--config needs a path".into()))?;
                    options.config = Some(PathBuf::from(path));
                }
                "--self-check" => options.self_check = true,
                other => return Err(DaemonError::Usage(format!("unknown argument {other}"))),
            }
        }
        Ok(options)
    }
}

/// Notifies init when the service is ready.
pub struct ReadyNotifier(Box<dyn FnOnce() + Send>);

impl ReadyNotifier {
    /// Creates a notifier from `func`.
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(func))
    }

    /// Emits the ready marker.
    pub fn notify(self) {
        (self.0)();
    }
}

/// Loads the configuration, brings up both cores and verifies a round trip.
///
/// Serves until stdin reaches end-of-file unless `options.self_check` is set.
pub fn service_main_loop(
    notifier: ReadyNotifier,
    options: DaemonOptions,
) -> core::result::Result<(), DaemonError> {
    let config = match &options.config {
        Some(path) => SubstrateConfig::load(path)?,
        None => SubstrateConfig::default(),
    };
    let pair = start_pair(&config)?;
    self_check(&pair)?;
    notifier.notify();
    println!("aipcd: ready");
    if !options.self_check {
        for line in std::io::stdin().lock().lines() {
            if line.is_err() {
                break;
            }
        }
    }
    let stats = pair.local.stats();
    info!(
        "aipcd: shutting down (calls={}, timeouts={}, unmatched={}, malformed={})",
        stats.engine.calls,
        stats.engine.timeouts,
        stats.engine.unmatched_replies,
        stats.engine.malformed
    );
    Ok(())
}

fn self_check(pair: &SubstratePair) -> Result<()> {
    let echo = rpc::LocalProgram::new(SELF_CHECK_PROGRAM, 1).with_procedure(
        ProcedureSpec::new(1, "echo").args(8, 0).results(8, 0),
        |args| Ok(args.clone()),
    );
    pair.remote.register_program(echo)?;
    let sample = RpcArgs::from_words(&[0x5eed]);
    let reply = pair.local.call(SELF_CHECK_PROGRAM, 1, 1, &sample)?;
    if reply != sample {
        return Err(AipcError::Malformed);
    }
    pair.local.link().query_peer_regions()?;
    info!("aipcd: self-check passed");
    Ok(())
}
