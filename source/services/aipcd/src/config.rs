// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Substrate configuration loaded from TOML
//!
//! OWNERS: @runtime
//!
//! Every key is optional; an empty document yields [`SubstrateConfig::default`]. Unknown
//! keys are rejected so typos do not silently fall back to defaults.
//!
//! ```toml
//! ring_depth = 16
//! channel_count = 8
//! mutex_count = 32
//! call_timeout_ms = 1000
//! rpc_channel = "aipc-rpc"
//! ```

use core::time::Duration;
use std::fs;
use std::path::{Path, PathBuf};

use aipc_mailbox::{MailboxConfig, RegionLayout, CHANNEL_NAME_LEN};
use serde::Deserialize;
use thiserror::Error;

/// Largest number of distributed mutexes a region carries.
pub const MAX_MUTEXES: usize = 256;
const MAX_CHANNELS: usize = 63;
const RESERVED_CHANNEL: &str = "aipc-ctrl";

/// Errors raised while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid TOML or has unknown keys.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables of one substrate instance.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubstrateConfig {
    /// Slots per ring direction.
    pub ring_depth: usize,
    /// Channel directory entries, including the control channel.
    pub channel_count: usize,
    /// Distributed mutex slots.
    pub mutex_count: usize,
    /// Default per-call timeout.
    pub call_timeout_ms: u64,
    /// Budget for sends that may wait on a full ring.
    pub send_budget_ms: u64,
    /// Consecutive send timeouts before a channel is declared down.
    pub max_send_failures: u32,
    /// Bounded wait between cross-core mutex retries.
    pub mutex_retry_ms: u64,
    /// Deferred-execution queue capacity.
    pub deferred_queue_depth: usize,
    /// Bounded wait for a link-control acknowledgement.
    pub link_ack_timeout_ms: u64,
    /// First program id available to user-space registrations.
    pub dynamic_program_min: u32,
    /// Channel carrying RPC requests and replies.
    pub rpc_channel: String,
    /// Channel carrying mutex wake notifications.
    pub mutex_channel: String,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            ring_depth: 16,
            channel_count: 8,
            mutex_count: 32,
            call_timeout_ms: 1_000,
            send_budget_ms: 100,
            max_send_failures: 3,
            mutex_retry_ms: 20,
            deferred_queue_depth: 32,
            link_ack_timeout_ms: 500,
            dynamic_program_min: 0x1000_0000,
            rpc_channel: "aipc-rpc".to_string(),
            mutex_channel: "aipc-mutex".to_string(),
        }
    }
}

impl SubstrateConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&raw)
    }

    /// Rejects values the substrate cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.ring_depth == 0 {
            return invalid("ring_depth must be at least 1".into());
        }
        if !(3..=MAX_CHANNELS).contains(&self.channel_count) {
            return invalid(format!("channel_count must be within 3..={MAX_CHANNELS}"));
        }
        if self.mutex_count > MAX_MUTEXES {
            return invalid(format!("mutex_count must not exceed {MAX_MUTEXES}"));
        }
        if self.deferred_queue_depth == 0 {
            return invalid("deferred_queue_depth must be at least 1".into());
        }
        if self.call_timeout_ms == 0 || self.link_ack_timeout_ms == 0 || self.mutex_retry_ms == 0 {
            return invalid("timeouts must be non-zero".into());
        }
        if self.max_send_failures == 0 {
            return invalid("max_send_failures must be at least 1".into());
        }
        if self.dynamic_program_min == 0 {
            return invalid("dynamic_program_min must be non-zero".into());
        }
        for name in [&self.rpc_channel, &self.mutex_channel] {
            if name.is_empty() || name.len() > CHANNEL_NAME_LEN || name.contains('\0') {
                return invalid(format!("channel name {name:?} is not usable"));
            }
            if name == RESERVED_CHANNEL {
                return invalid(format!("channel name {name:?} is reserved"));
            }
        }
        if self.rpc_channel == self.mutex_channel {
            return invalid("rpc_channel and mutex_channel must differ".into());
        }
        Ok(())
    }

    /// Default timeout for calls whose procedure does not set one.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Budget for sends that may wait on a full ring.
    pub fn send_budget(&self) -> Duration {
        Duration::from_millis(self.send_budget_ms)
    }

    /// Wait between cross-core mutex retries.
    pub fn mutex_retry(&self) -> Duration {
        Duration::from_millis(self.mutex_retry_ms)
    }

    /// Bounded wait for a link-control acknowledgement.
    pub fn link_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.link_ack_timeout_ms)
    }

    /// Shared region geometry.
    pub fn region_layout(&self) -> RegionLayout {
        RegionLayout { ring_depth: self.ring_depth, channel_count: self.channel_count }
    }

    /// Per-core mailbox tunables.
    pub fn mailbox(&self) -> MailboxConfig {
        MailboxConfig { send_budget: self.send_budget(), max_send_failures: self.max_send_failures }
    }
}
