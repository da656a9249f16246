// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-space side of the AIPC bridging layer
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests per module
//!
//! A process on the application core publishes RPC programs to the kernel-resident
//! broker; remote calls for those programs arrive here as REQUEST datagrams and are
//! answered with RESULT datagrams.
//!
//! PUBLIC API:
//!   - ProgramDescriptor / ProcedureSpec: program tables (also used by the privileged side)
//!   - RpcArgs: fixed part + descriptor buffers carried by calls and replies
//!   - Datagram: bridging wire format (REQUEST/RESULT/REGISTER/UNREGISTER/STATUS)
//!   - connection_pair(): process/broker endpoint pair
//!   - BridgeClient: register programs and serve their requests
//!
//! DEPENDENCIES:
//!   - std::sync::mpsc: endpoint pair
//!   - parking_lot: handler table

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod client;
mod connection;
mod datagram;
mod descriptor;
mod wire;

pub use client::{BridgeClient, ProgramHandler};
pub use connection::{connection_pair, BrokerEndpoint, Endpoint, ProcessEndpoint};
pub use datagram::{
    BridgeStatus, Datagram, MessageType, RESULT_INVALID_ARGUMENT, RESULT_OK,
    RESULT_PROCEDURE_CODE_BASE, RESULT_PROCEDURE_FAILED, RESULT_PROCEDURE_UNAVAILABLE,
    RESULT_PROGRAM_UNAVAILABLE,
};
pub use descriptor::{ArgsMismatch, ProcedureSpec, ProgramDescriptor, RpcArgs, PROCEDURE_NAME_MAX};

/// Result alias for bridging operations.
pub type Result<T> = core::result::Result<T, BridgeError>;

/// Errors surfaced by the bridging layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The other end of the connection is gone.
    #[error("bridge connection closed")]
    Disconnected,
    /// No datagram arrived within the requested time.
    #[error("bridge operation timed out")]
    Timeout,
    /// Nothing to receive right now.
    #[error("bridge operation would block")]
    WouldBlock,
    /// A frame could not be decoded.
    #[error("malformed bridge frame: {0}")]
    Malformed(&'static str),
    /// The broker already has a registration for this program id.
    #[error("program already registered")]
    AlreadyRegistered,
    /// The broker has no registration for this program id.
    #[error("program not found")]
    NotFound,
    /// The broker rejected the request (reserved id range, bad table).
    #[error("invalid registration")]
    Invalid,
}
