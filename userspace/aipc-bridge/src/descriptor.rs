// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Program/procedure tables and the argument container
//!
//! OWNERS: @runtime
//!
//! A procedure's `arg_size` bounds the fixed part of its arguments and
//! `arg_descriptor_count` is the exact number of variable-length buffers that follow;
//! results are described the same way. Both sides check frames against the table before
//! touching them.
//!
//! INVARIANTS:
//!   - Procedure ids are unique within a program
//!   - Names are at most `PROCEDURE_NAME_MAX` bytes
//!   - Decoding never panics on malformed input

use core::fmt;
use core::time::Duration;

use crate::wire::Reader;
use crate::{BridgeError, Result};

/// Longest procedure name carried in a table.
pub const PROCEDURE_NAME_MAX: usize = 32;

const FLAG_DEFERRED: u8 = 1 << 0;

/// Arguments or results of one call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RpcArgs {
    /// Fixed-size part, at most the procedure's declared size.
    pub fixed: Vec<u8>,
    /// Variable-length buffers, one per declared descriptor.
    pub descriptors: Vec<Vec<u8>>,
}

impl RpcArgs {
    /// Arguments with only a fixed part.
    pub fn new(fixed: impl Into<Vec<u8>>) -> Self {
        Self { fixed: fixed.into(), descriptors: Vec::new() }
    }

    /// Fixed part made of little-endian `u64` words.
    pub fn from_words(words: &[u64]) -> Self {
        Self::new(words.iter().flat_map(|w| w.to_le_bytes()).collect::<Vec<u8>>())
    }

    /// Appends a descriptor buffer.
    pub fn with_descriptor(mut self, buf: impl Into<Vec<u8>>) -> Self {
        self.descriptors.push(buf.into());
        self
    }

    /// Reads the `index`-th little-endian `u64` word of the fixed part.
    pub fn word(&self, index: usize) -> Option<u64> {
        let start = index.checked_mul(8)?;
        let end = start.checked_add(8)?;
        let raw = self.fixed.get(start..end)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(raw);
        Some(u64::from_le_bytes(b))
    }

    /// Encodes as `fixed_len:u32 | fixed | count:u16 | (len:u32 | bytes)*`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&(self.fixed.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.fixed);
        out.extend_from_slice(&(self.descriptors.len() as u16).to_le_bytes());
        for buf in &self.descriptors {
            out.extend_from_slice(&(buf.len() as u32).to_le_bytes());
            out.extend_from_slice(buf);
        }
        out
    }

    /// Size of [`RpcArgs::encode`]'s output.
    pub fn encoded_len(&self) -> usize {
        4 + self.fixed.len() + 2 + self.descriptors.iter().map(|d| 4 + d.len()).sum::<usize>()
    }

    /// Decodes a buffer produced by [`RpcArgs::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(buf);
        let args = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(args)
    }

    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let fixed_len = reader.u32()? as usize;
        let fixed = reader.bytes(fixed_len)?.to_vec();
        let count = reader.u16()?;
        let mut descriptors = Vec::new();
        for _ in 0..count {
            let len = reader.u32()? as usize;
            descriptors.push(reader.bytes(len)?.to_vec());
        }
        Ok(Self { fixed, descriptors })
    }
}

/// Why a set of arguments does not match a procedure table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgsMismatch {
    /// Fixed part longer than declared.
    FixedTooLarge {
        /// Declared bound.
        declared: u32,
        /// Bytes supplied.
        got: usize,
    },
    /// Wrong number of descriptor buffers.
    DescriptorCount {
        /// Declared count.
        declared: u16,
        /// Buffers supplied.
        got: usize,
    },
}

impl fmt::Display for ArgsMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixedTooLarge { declared, got } => {
                write!(f, "fixed part {got} bytes exceeds declared {declared}")
            }
            Self::DescriptorCount { declared, got } => {
                write!(f, "{got} descriptors supplied, {declared} declared")
            }
        }
    }
}

/// One procedure table entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcedureSpec {
    /// Procedure number within the program.
    pub procedure_id: u32,
    /// Diagnostic name.
    pub name: String,
    /// Upper bound of the fixed argument part.
    pub arg_size: u32,
    /// Exact number of argument descriptor buffers.
    pub arg_descriptor_count: u16,
    /// Upper bound of the fixed result part.
    pub result_size: u32,
    /// Exact number of result descriptor buffers.
    pub result_descriptor_count: u16,
    /// Call timeout; `None` uses the substrate default.
    pub timeout: Option<Duration>,
    /// Must run on the deferred worker rather than in the notification context.
    pub deferred: bool,
}

impl ProcedureSpec {
    /// Entry taking and returning nothing, with the default timeout.
    pub fn new(procedure_id: u32, name: impl Into<String>) -> Self {
        Self {
            procedure_id,
            name: name.into(),
            arg_size: 0,
            arg_descriptor_count: 0,
            result_size: 0,
            result_descriptor_count: 0,
            timeout: None,
            deferred: false,
        }
    }

    /// Declares the argument shape.
    pub fn args(mut self, size: u32, descriptors: u16) -> Self {
        self.arg_size = size;
        self.arg_descriptor_count = descriptors;
        self
    }

    /// Declares the result shape.
    pub fn results(mut self, size: u32, descriptors: u16) -> Self {
        self.result_size = size;
        self.result_descriptor_count = descriptors;
        self
    }

    /// Overrides the call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Marks the procedure as needing deferred execution.
    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }

    /// Checks `args` against the declared argument shape.
    pub fn check_args(&self, args: &RpcArgs) -> core::result::Result<(), ArgsMismatch> {
        check_shape(args, self.arg_size, self.arg_descriptor_count)
    }

    /// Checks `result` against the declared result shape.
    pub fn check_result(&self, result: &RpcArgs) -> core::result::Result<(), ArgsMismatch> {
        check_shape(result, self.result_size, self.result_descriptor_count)
    }

    fn write(&self, out: &mut Vec<u8>) {
        let timeout_ms = self.timeout.map_or(0, |t| t.as_millis().min(u32::MAX as u128) as u32);
        out.extend_from_slice(&self.procedure_id.to_le_bytes());
        out.extend_from_slice(&self.arg_size.to_le_bytes());
        out.extend_from_slice(&self.arg_descriptor_count.to_le_bytes());
        out.extend_from_slice(&self.result_size.to_le_bytes());
        out.extend_from_slice(&self.result_descriptor_count.to_le_bytes());
        out.extend_from_slice(&timeout_ms.to_le_bytes());
        out.push(if self.deferred { FLAG_DEFERRED } else { 0 });
        out.push(self.name.len() as u8);
        out.extend_from_slice(self.name.as_bytes());
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let procedure_id = reader.u32()?;
        let arg_size = reader.u32()?;
        let arg_descriptor_count = reader.u16()?;
        let result_size = reader.u32()?;
        let result_descriptor_count = reader.u16()?;
        let timeout_ms = reader.u32()?;
        let flags = reader.u8()?;
        let name_len = reader.u8()? as usize;
        let name = core::str::from_utf8(reader.bytes(name_len)?)
            .map_err(|_| BridgeError::Malformed("procedure name not utf-8"))?
            .to_string();
        Ok(Self {
            procedure_id,
            name,
            arg_size,
            arg_descriptor_count,
            result_size,
            result_descriptor_count,
            timeout: (timeout_ms != 0).then(|| Duration::from_millis(u64::from(timeout_ms))),
            deferred: flags & FLAG_DEFERRED != 0,
        })
    }
}

fn check_shape(args: &RpcArgs, size: u32, descriptors: u16) -> core::result::Result<(), ArgsMismatch> {
    if args.fixed.len() > size as usize {
        return Err(ArgsMismatch::FixedTooLarge { declared: size, got: args.fixed.len() });
    }
    if args.descriptors.len() != descriptors as usize {
        return Err(ArgsMismatch::DescriptorCount { declared: descriptors, got: args.descriptors.len() });
    }
    Ok(())
}

/// A program table: id, version, and its procedures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramDescriptor {
    /// Program number.
    pub program_id: u32,
    /// Program version.
    pub version: u32,
    /// Procedure table.
    pub procedures: Vec<ProcedureSpec>,
}

impl ProgramDescriptor {
    /// Empty table for `program_id`/`version`.
    pub fn new(program_id: u32, version: u32) -> Self {
        Self { program_id, version, procedures: Vec::new() }
    }

    /// Adds a procedure entry.
    pub fn with(mut self, procedure: ProcedureSpec) -> Self {
        self.procedures.push(procedure);
        self
    }

    /// Looks up a procedure entry.
    pub fn procedure(&self, procedure_id: u32) -> Option<&ProcedureSpec> {
        self.procedures.iter().find(|p| p.procedure_id == procedure_id)
    }

    /// Rejects duplicate procedure ids and oversized names.
    pub fn validate(&self) -> Result<()> {
        for (i, proc_a) in self.procedures.iter().enumerate() {
            if proc_a.name.len() > PROCEDURE_NAME_MAX {
                return Err(BridgeError::Malformed("procedure name too long"));
            }
            if self.procedures[i + 1..].iter().any(|b| b.procedure_id == proc_a.procedure_id) {
                return Err(BridgeError::Malformed("duplicate procedure id"));
            }
        }
        Ok(())
    }

    /// Encodes the table carried by REGISTER datagrams.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let count = u16::try_from(self.procedures.len())
            .map_err(|_| BridgeError::Malformed("too many procedures"))?;
        let mut out = Vec::new();
        out.extend_from_slice(&self.program_id.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        for procedure in &self.procedures {
            procedure.write(&mut out);
        }
        Ok(out)
    }

    /// Decodes a table produced by [`ProgramDescriptor::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(buf);
        let program_id = reader.u32()?;
        let version = reader.u32()?;
        let count = reader.u16()?;
        let mut procedures = Vec::new();
        for _ in 0..count {
            procedures.push(ProcedureSpec::read(&mut reader)?);
        }
        reader.finish()?;
        let table = Self { program_id, version, procedures };
        table.validate()?;
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn alloc_program() -> ProgramDescriptor {
        ProgramDescriptor::new(0x1000_0001, 1)
            .with(ProcedureSpec::new(1, "alloc").args(8, 0).results(8, 0).deferred())
            .with(
                ProcedureSpec::new(2, "write")
                    .args(8, 1)
                    .timeout(Duration::from_millis(250)),
            )
    }

    #[test]
    fn table_survives_the_wire() {
        let table = alloc_program();
        let decoded = ProgramDescriptor::decode(&table.encode().unwrap()).unwrap();
        assert_eq!(decoded, table);
        assert!(decoded.procedure(1).unwrap().deferred);
        assert_eq!(decoded.procedure(2).unwrap().timeout, Some(Duration::from_millis(250)));
        assert!(decoded.procedure(3).is_none());
    }

    #[test]
    fn duplicate_procedures_are_rejected() {
        let table = ProgramDescriptor::new(7, 1)
            .with(ProcedureSpec::new(1, "a"))
            .with(ProcedureSpec::new(1, "b"));
        assert_eq!(table.validate(), Err(BridgeError::Malformed("duplicate procedure id")));
        assert!(table.encode().is_err());
    }

    #[test]
    fn args_are_checked_against_declared_shape() {
        let program = alloc_program();
        let write = program.procedure(2).unwrap();
        let ok = RpcArgs::from_words(&[0x1000]).with_descriptor(b"payload".to_vec());
        assert_eq!(write.check_args(&ok), Ok(()));
        let missing = RpcArgs::from_words(&[0x1000]);
        assert_eq!(
            write.check_args(&missing),
            Err(ArgsMismatch::DescriptorCount { declared: 1, got: 0 })
        );
        let oversized = RpcArgs::from_words(&[1, 2]).with_descriptor(Vec::new());
        assert_eq!(
            write.check_args(&oversized),
            Err(ArgsMismatch::FixedTooLarge { declared: 8, got: 16 })
        );
    }

    #[test]
    fn words_read_back() {
        let args = RpcArgs::from_words(&[4096, u64::MAX]);
        assert_eq!(args.word(0), Some(4096));
        assert_eq!(args.word(1), Some(u64::MAX));
        assert_eq!(args.word(2), None);
        assert_eq!(RpcArgs::decode(&args.encode()).unwrap(), args);
    }

    #[test]
    fn out_of_range_word_indices_are_none() {
        let args = RpcArgs::from_words(&[1]);
        assert_eq!(args.word(usize::MAX / 8), None);
        assert_eq!(args.word(usize::MAX / 8 + 1), None);
        assert_eq!(args.word(usize::MAX), None);
    }

    proptest! {
        #[test]
        fn decoders_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = RpcArgs::decode(&bytes);
            let _ = ProgramDescriptor::decode(&bytes);
        }

        #[test]
        fn word_never_panics(words in proptest::collection::vec(any::<u64>(), 0..4), index in any::<usize>()) {
            let args = RpcArgs::from_words(&words);
            prop_assert_eq!(args.word(index), words.get(index).copied());
        }
    }
}
