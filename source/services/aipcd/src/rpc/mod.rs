// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RPC dispatch: wire format, program registry, transaction table and the engine that
//! ties them to the mailbox.

mod engine;
mod procedure;
mod registry;
mod transaction;
mod wire;

pub use engine::{EngineStats, RpcEngine, UserSpaceRelay};
pub use procedure::{LocalProgram, Procedure};
pub use registry::{Registration, Registry};
pub use transaction::{Outcome, PendingCall, TransactionTable};
pub use wire::{CallHeader, RpcMessage, HEADER_LEN, MAX_BODY};
