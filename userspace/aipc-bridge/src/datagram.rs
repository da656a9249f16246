// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bridging datagram exchanged between a process and the broker
//!
//! OWNERS: @runtime
//!
//! Frame layout (little-endian):
//!   magic "AB" | wire version:u8 | kind:u8 | program_id:u32 | version:u32 |
//!   procedure_id:u32 | transaction_id:u32 | pid:u32 | status:u32 |
//!   payload_len:u32 | payload
//!
//! Payload per kind:
//!   - REQUEST / RESULT: encoded `RpcArgs`; RESULT carries the RPC status in `status`
//!   - REGISTER: encoded `ProgramDescriptor`
//!   - UNREGISTER: empty
//!   - STATUS: empty; `status` carries a `BridgeStatus`

use crate::descriptor::{ProgramDescriptor, RpcArgs};
use crate::wire::Reader;
use crate::{BridgeError, Result};

const MAGIC: [u8; 2] = *b"AB";
const WIRE_VERSION: u8 = 1;
const HEADER_LEN: usize = 2 + 1 + 1 + 4 * 7;

/// RPC status of a successful RESULT.
pub const RESULT_OK: u32 = 0;
/// RPC status of a RESULT for a program the process no longer serves.
pub const RESULT_PROGRAM_UNAVAILABLE: u32 = 3;
/// RPC status of a RESULT for a procedure the program does not define.
pub const RESULT_PROCEDURE_UNAVAILABLE: u32 = 4;
/// RPC status of a RESULT whose arguments do not match the procedure table.
pub const RESULT_INVALID_ARGUMENT: u32 = 7;
/// RPC status of a RESULT for a procedure that failed without a usable code.
pub const RESULT_PROCEDURE_FAILED: u32 = 13;
/// First RPC status available to procedure-specific failures. Lower codes are reserved.
pub const RESULT_PROCEDURE_CODE_BASE: u32 = 0x100;

/// Datagram kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Broker -> process: run a procedure.
    Request = 1,
    /// Process -> broker: outcome of a REQUEST.
    Result = 2,
    /// Process -> broker: publish a program table.
    Register = 3,
    /// Process -> broker: withdraw a program.
    Unregister = 4,
    /// Broker -> process: outcome of REGISTER / UNREGISTER.
    Status = 5,
}

impl MessageType {
    fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Request,
            2 => Self::Result,
            3 => Self::Register,
            4 => Self::Unregister,
            5 => Self::Status,
            _ => return None,
        })
    }
}

/// Acknowledgement carried by STATUS datagrams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BridgeStatus {
    /// UNREGISTER accepted.
    Ok = 0,
    /// REGISTER accepted.
    Registered = 1,
    /// Program id already taken.
    AlreadyRegistered = 2,
    /// Program id not registered by this process.
    NotFound = 3,
    /// Rejected table or reserved id.
    Invalid = 4,
}

impl BridgeStatus {
    /// Decodes a raw status word.
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Ok,
            1 => Self::Registered,
            2 => Self::AlreadyRegistered,
            3 => Self::NotFound,
            4 => Self::Invalid,
            _ => return None,
        })
    }

    /// Maps the acknowledgement onto the client-side result.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Ok | Self::Registered => Ok(()),
            Self::AlreadyRegistered => Err(BridgeError::AlreadyRegistered),
            Self::NotFound => Err(BridgeError::NotFound),
            Self::Invalid => Err(BridgeError::Invalid),
        }
    }
}

/// One bridging datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    /// Kind of datagram.
    pub kind: MessageType,
    /// Target program.
    pub program_id: u32,
    /// Program version.
    pub version: u32,
    /// Procedure within the program.
    pub procedure_id: u32,
    /// Transaction id of the remote call being relayed.
    pub transaction_id: u32,
    /// Process the datagram belongs to.
    pub pid: u32,
    /// RPC status (RESULT) or [`BridgeStatus`] (STATUS).
    pub status: u32,
    /// Kind-specific payload.
    pub payload: Vec<u8>,
}

impl Datagram {
    /// REQUEST relaying a remote call to the serving process.
    pub fn request(
        pid: u32,
        program_id: u32,
        version: u32,
        procedure_id: u32,
        transaction_id: u32,
        args: &RpcArgs,
    ) -> Self {
        Self {
            kind: MessageType::Request,
            program_id,
            version,
            procedure_id,
            transaction_id,
            pid,
            status: RESULT_OK,
            payload: args.encode(),
        }
    }

    /// RESULT answering `request`.
    pub fn result(request: &Datagram, status: u32, result: &RpcArgs) -> Self {
        Self {
            kind: MessageType::Result,
            status,
            payload: if status == RESULT_OK { result.encode() } else { Vec::new() },
            ..request.clone_header()
        }
    }

    /// REGISTER publishing `table`.
    pub fn register(pid: u32, table: &ProgramDescriptor) -> Result<Self> {
        Ok(Self {
            kind: MessageType::Register,
            program_id: table.program_id,
            version: table.version,
            procedure_id: 0,
            transaction_id: 0,
            pid,
            status: 0,
            payload: table.encode()?,
        })
    }

    /// UNREGISTER withdrawing `program_id`.
    pub fn unregister(pid: u32, program_id: u32) -> Self {
        Self {
            kind: MessageType::Unregister,
            program_id,
            version: 0,
            procedure_id: 0,
            transaction_id: 0,
            pid,
            status: 0,
            payload: Vec::new(),
        }
    }

    /// STATUS acknowledging a REGISTER / UNREGISTER for `program_id`.
    pub fn status(pid: u32, program_id: u32, status: BridgeStatus) -> Self {
        Self {
            kind: MessageType::Status,
            program_id,
            version: 0,
            procedure_id: 0,
            transaction_id: 0,
            pid,
            status: status as u32,
            payload: Vec::new(),
        }
    }

    fn clone_header(&self) -> Self {
        Self { payload: Vec::new(), ..self.clone() }
    }

    /// Decodes the payload as call arguments or results.
    pub fn args(&self) -> Result<RpcArgs> {
        RpcArgs::decode(&self.payload)
    }

    /// Decodes the payload of a REGISTER.
    pub fn table(&self) -> Result<ProgramDescriptor> {
        let table = ProgramDescriptor::decode(&self.payload)?;
        if table.program_id != self.program_id || table.version != self.version {
            return Err(BridgeError::Malformed("table does not match header"));
        }
        Ok(table)
    }

    /// Encodes the datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&MAGIC);
        out.push(WIRE_VERSION);
        out.push(self.kind as u8);
        for word in [
            self.program_id,
            self.version,
            self.procedure_id,
            self.transaction_id,
            self.pid,
            self.status,
            self.payload.len() as u32,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decodes a frame produced by [`Datagram::encode`].
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(frame);
        if reader.bytes(2)? != MAGIC {
            return Err(BridgeError::Malformed("bad magic"));
        }
        if reader.u8()? != WIRE_VERSION {
            return Err(BridgeError::Malformed("unsupported wire version"));
        }
        let kind = MessageType::from_u8(reader.u8()?).ok_or(BridgeError::Malformed("unknown kind"))?;
        let program_id = reader.u32()?;
        let version = reader.u32()?;
        let procedure_id = reader.u32()?;
        let transaction_id = reader.u32()?;
        let pid = reader.u32()?;
        let status = reader.u32()?;
        let len = reader.u32()? as usize;
        let payload = reader.rest();
        if payload.len() != len {
            return Err(BridgeError::Malformed("payload length mismatch"));
        }
        Ok(Self {
            kind,
            program_id,
            version,
            procedure_id,
            transaction_id,
            pid,
            status,
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProcedureSpec;
    use proptest::prelude::*;

    #[test]
    fn request_and_result_share_the_call_identity() {
        let args = RpcArgs::from_words(&[7]);
        let request = Datagram::request(42, 0x1000_0001, 1, 2, 99, &args);
        let decoded = Datagram::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.args().unwrap(), args);

        let result = Datagram::result(&decoded, RESULT_OK, &RpcArgs::from_words(&[8]));
        assert_eq!(result.kind, MessageType::Result);
        assert_eq!(
            (result.program_id, result.version, result.procedure_id, result.transaction_id, result.pid),
            (0x1000_0001, 1, 2, 99, 42)
        );
        assert_eq!(result.args().unwrap().word(0), Some(8));
    }

    #[test]
    fn error_results_carry_no_payload() {
        let request = Datagram::request(1, 5, 1, 1, 1, &RpcArgs::default());
        let result = Datagram::result(&request, RESULT_PROGRAM_UNAVAILABLE, &RpcArgs::from_words(&[1]));
        assert!(result.payload.is_empty());
    }

    #[test]
    fn register_carries_the_table() {
        let table = ProgramDescriptor::new(0x1000_0001, 3).with(ProcedureSpec::new(1, "ping"));
        let frame = Datagram::register(9, &table).unwrap().encode();
        let decoded = Datagram::decode(&frame).unwrap();
        assert_eq!(decoded.kind, MessageType::Register);
        assert_eq!(decoded.table().unwrap(), table);
    }

    #[test]
    fn register_header_must_match_table() {
        let table = ProgramDescriptor::new(0x1000_0001, 3);
        let mut dgram = Datagram::register(9, &table).unwrap();
        dgram.program_id = 0x1000_0002;
        assert_eq!(dgram.table(), Err(BridgeError::Malformed("table does not match header")));
    }

    #[test]
    fn status_maps_to_client_errors() {
        assert_eq!(BridgeStatus::Registered.into_result(), Ok(()));
        assert_eq!(BridgeStatus::AlreadyRegistered.into_result(), Err(BridgeError::AlreadyRegistered));
        assert_eq!(BridgeStatus::from_u32(3), Some(BridgeStatus::NotFound));
        assert_eq!(BridgeStatus::from_u32(77), None);
    }

    #[test]
    fn rejects_bad_frames() {
        let mut frame = Datagram::unregister(1, 2).encode();
        assert!(Datagram::decode(&frame[..HEADER_LEN - 1]).is_err());
        frame[0] = b'X';
        assert_eq!(Datagram::decode(&frame), Err(BridgeError::Malformed("bad magic")));
        let mut frame = Datagram::unregister(1, 2).encode();
        frame.push(0);
        assert_eq!(Datagram::decode(&frame), Err(BridgeError::Malformed("payload length mismatch")));
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = Datagram::decode(&bytes);
        }
    }
}
