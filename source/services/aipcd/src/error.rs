// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Substrate error taxonomy and its wire status codes
//!
//! OWNERS: @runtime
//!
//! Errors cross the mailbox as `u32` status words in reply messages. Codes below
//! [`PROCEDURE_CODE_BASE`] belong to the substrate; procedures report their own failures
//! with codes at or above it.

use aipc_bridge::{
    RESULT_INVALID_ARGUMENT, RESULT_OK, RESULT_PROCEDURE_CODE_BASE, RESULT_PROCEDURE_FAILED,
    RESULT_PROCEDURE_UNAVAILABLE, RESULT_PROGRAM_UNAVAILABLE,
};
use aipc_mailbox::MailboxError;

/// Result alias for substrate operations.
pub type Result<T> = core::result::Result<T, AipcError>;

/// Status of a successful reply.
pub const STATUS_OK: u32 = RESULT_OK;

/// First status code available to procedure-specific errors.
pub const PROCEDURE_CODE_BASE: u32 = RESULT_PROCEDURE_CODE_BASE;

const STATUS_TRANSPORT_DOWN: u32 = 1;
const STATUS_TIMEOUT: u32 = 2;
const STATUS_PROGRAM_UNAVAILABLE: u32 = RESULT_PROGRAM_UNAVAILABLE;
const STATUS_PROCEDURE_UNAVAILABLE: u32 = RESULT_PROCEDURE_UNAVAILABLE;
const STATUS_ALREADY_REGISTERED: u32 = 5;
const STATUS_NOT_FOUND: u32 = 6;
const STATUS_INVALID_ARGUMENT: u32 = RESULT_INVALID_ARGUMENT;
const STATUS_MUTEX_NON_OWNER_RELEASE: u32 = 8;
const STATUS_MUTEX_POISONED: u32 = 9;
const STATUS_BUSY: u32 = 10;
const STATUS_MALFORMED: u32 = 11;
const STATUS_LINK_ABORTED: u32 = 12;
const STATUS_PROCEDURE_FAILED: u32 = RESULT_PROCEDURE_FAILED;
const STATUS_CONFIG: u32 = 14;

/// Errors surfaced by the substrate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AipcError {
    /// The channel is unusable; every call on it fails until it is re-established.
    #[error("transport down")]
    TransportDown,
    /// No reply within the call's bound.
    #[error("call timed out")]
    Timeout,
    /// No such program (or version) is registered on the target core.
    #[error("program unavailable")]
    ProgramUnavailable,
    /// The program exists but does not define the procedure.
    #[error("procedure unavailable")]
    ProcedureUnavailable,
    /// The program id is already registered.
    #[error("program already registered")]
    AlreadyRegistered,
    /// The program id is not registered.
    #[error("program not found")]
    NotFound,
    /// Id outside the caller's range or arguments not matching the procedure table.
    #[error("invalid argument")]
    InvalidArgument,
    /// A mutex was released by a core or thread that does not hold it.
    #[error("mutex released by non-owner")]
    MutexNonOwnerRelease,
    /// The mutex id was disabled after a protocol violation.
    #[error("mutex poisoned")]
    MutexPoisoned,
    /// The target could not accept more work right now.
    #[error("busy")]
    Busy,
    /// A frame could not be decoded.
    #[error("malformed message")]
    Malformed,
    /// A link-control transition was abandoned.
    #[error("link transition aborted")]
    LinkAborted,
    /// The procedure panicked, or reported a code from the reserved range.
    #[error("procedure failed")]
    ProcedureFailed,
    /// The substrate configuration is invalid.
    #[error("invalid configuration")]
    Config,
    /// Procedure-specific failure code, at or above [`PROCEDURE_CODE_BASE`].
    #[error("procedure error {0:#x}")]
    Procedure(u32),
}

impl AipcError {
    /// Folds a procedure code from the reserved range into [`AipcError::ProcedureFailed`].
    pub const fn normalized(self) -> Self {
        match self {
            Self::Procedure(code) if code < PROCEDURE_CODE_BASE => Self::ProcedureFailed,
            other => other,
        }
    }

    /// Wire status carried in replies. A reserved procedure code never reaches the wire.
    pub const fn status(self) -> u32 {
        match self.normalized() {
            Self::TransportDown => STATUS_TRANSPORT_DOWN,
            Self::Timeout => STATUS_TIMEOUT,
            Self::ProgramUnavailable => STATUS_PROGRAM_UNAVAILABLE,
            Self::ProcedureUnavailable => STATUS_PROCEDURE_UNAVAILABLE,
            Self::AlreadyRegistered => STATUS_ALREADY_REGISTERED,
            Self::NotFound => STATUS_NOT_FOUND,
            Self::InvalidArgument => STATUS_INVALID_ARGUMENT,
            Self::MutexNonOwnerRelease => STATUS_MUTEX_NON_OWNER_RELEASE,
            Self::MutexPoisoned => STATUS_MUTEX_POISONED,
            Self::Busy => STATUS_BUSY,
            Self::Malformed => STATUS_MALFORMED,
            Self::LinkAborted => STATUS_LINK_ABORTED,
            Self::ProcedureFailed => STATUS_PROCEDURE_FAILED,
            Self::Config => STATUS_CONFIG,
            Self::Procedure(code) => code,
        }
    }

    /// Decodes a reply status; `None` for [`STATUS_OK`].
    pub const fn from_status(status: u32) -> Option<Self> {
        Some(match status {
            STATUS_OK => return None,
            STATUS_TRANSPORT_DOWN => Self::TransportDown,
            STATUS_TIMEOUT => Self::Timeout,
            STATUS_PROGRAM_UNAVAILABLE => Self::ProgramUnavailable,
            STATUS_PROCEDURE_UNAVAILABLE => Self::ProcedureUnavailable,
            STATUS_ALREADY_REGISTERED => Self::AlreadyRegistered,
            STATUS_NOT_FOUND => Self::NotFound,
            STATUS_INVALID_ARGUMENT => Self::InvalidArgument,
            STATUS_MUTEX_NON_OWNER_RELEASE => Self::MutexNonOwnerRelease,
            STATUS_MUTEX_POISONED => Self::MutexPoisoned,
            STATUS_BUSY => Self::Busy,
            STATUS_MALFORMED => Self::Malformed,
            STATUS_LINK_ABORTED => Self::LinkAborted,
            STATUS_PROCEDURE_FAILED => Self::ProcedureFailed,
            STATUS_CONFIG => Self::Config,
            code => Self::Procedure(code),
        })
    }
}

impl From<MailboxError> for AipcError {
    fn from(err: MailboxError) -> Self {
        match err {
            MailboxError::WouldBlock => Self::Busy,
            MailboxError::Timeout => Self::Timeout,
            MailboxError::TransportDown | MailboxError::NoChannel => Self::TransportDown,
            MailboxError::TooLarge => Self::InvalidArgument,
            MailboxError::Malformed => Self::Malformed,
        }
    }
}

impl From<aipc_bridge::BridgeError> for AipcError {
    fn from(err: aipc_bridge::BridgeError) -> Self {
        use aipc_bridge::BridgeError;
        match err {
            BridgeError::Disconnected => Self::ProgramUnavailable,
            BridgeError::Timeout => Self::Timeout,
            BridgeError::WouldBlock => Self::Busy,
            BridgeError::Malformed(_) => Self::Malformed,
            BridgeError::AlreadyRegistered => Self::AlreadyRegistered,
            BridgeError::NotFound => Self::NotFound,
            BridgeError::Invalid => Self::InvalidArgument,
        }
    }
}
