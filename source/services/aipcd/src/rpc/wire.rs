// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RPC message carried in a mailbox slot.
//!
//! Layout (little-endian): `program_id:u32 | version:u32 | procedure_id:u32 |
//! transaction_id:u32 | is_reply:u8 | status:u32 | body`. The body is an encoded
//! `RpcArgs` (arguments on requests, results on successful replies).

use aipc_mailbox::SLOT_PAYLOAD_MAX;

use crate::error::{AipcError, Result, STATUS_OK};

/// Bytes preceding the body.
pub const HEADER_LEN: usize = 4 * 4 + 1 + 4;

/// Largest body that fits one slot.
pub const MAX_BODY: usize = SLOT_PAYLOAD_MAX - HEADER_LEN;

/// Identity of one call; a reply matches a call only on all four fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallHeader {
    /// Target program.
    pub program_id: u32,
    /// Program version.
    pub version: u32,
    /// Procedure within the program.
    pub procedure_id: u32,
    /// Caller-assigned transaction id.
    pub transaction_id: u32,
}

/// Decoded RPC message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcMessage {
    /// Call identity.
    pub header: CallHeader,
    /// `true` for replies.
    pub is_reply: bool,
    /// Reply status; `STATUS_OK` on requests.
    pub status: u32,
    /// Encoded arguments or results.
    pub body: Vec<u8>,
}

impl RpcMessage {
    /// Request for `header` carrying `body`.
    pub fn request(header: CallHeader, body: Vec<u8>) -> Self {
        Self { header, is_reply: false, status: STATUS_OK, body }
    }

    /// Reply to `header`; errors carry no body.
    pub fn reply(header: CallHeader, outcome: core::result::Result<Vec<u8>, AipcError>) -> Self {
        match outcome {
            Ok(body) => Self { header, is_reply: true, status: STATUS_OK, body },
            Err(err) => Self { header, is_reply: true, status: err.status(), body: Vec::new() },
        }
    }

    /// Encodes the message.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.extend_from_slice(&self.header.program_id.to_le_bytes());
        out.extend_from_slice(&self.header.version.to_le_bytes());
        out.extend_from_slice(&self.header.procedure_id.to_le_bytes());
        out.extend_from_slice(&self.header.transaction_id.to_le_bytes());
        out.push(u8::from(self.is_reply));
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Decodes a slot payload.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(AipcError::Malformed);
        }
        let word = |at: usize| u32::from_le_bytes([frame[at], frame[at + 1], frame[at + 2], frame[at + 3]]);
        let is_reply = match frame[16] {
            0 => false,
            1 => true,
            _ => return Err(AipcError::Malformed),
        };
        Ok(Self {
            header: CallHeader {
                program_id: word(0),
                version: word(4),
                procedure_id: word(8),
                transaction_id: word(12),
            },
            is_reply,
            status: word(17),
            body: frame[HEADER_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CALL: CallHeader = CallHeader { program_id: 0x20, version: 2, procedure_id: 5, transaction_id: 77 };

    #[test]
    fn request_decodes_back() {
        let msg = RpcMessage::request(CALL, vec![1, 2, 3]);
        assert_eq!(RpcMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn error_reply_has_status_and_no_body() {
        let msg = RpcMessage::reply(CALL, Err(AipcError::Busy));
        let decoded = RpcMessage::decode(&msg.encode()).unwrap();
        assert!(decoded.is_reply);
        assert_eq!(AipcError::from_status(decoded.status), Some(AipcError::Busy));
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn short_or_corrupt_frames_are_malformed() {
        let mut frame = RpcMessage::request(CALL, Vec::new()).encode();
        assert_eq!(RpcMessage::decode(&frame[..HEADER_LEN - 1]), Err(AipcError::Malformed));
        frame[16] = 9;
        assert_eq!(RpcMessage::decode(&frame), Err(AipcError::Malformed));
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = RpcMessage::decode(&bytes);
        }
    }
}
