// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Server-side procedures and the programs that group them.

use std::collections::HashMap;
use std::sync::Arc;

use aipc_bridge::{ProcedureSpec, ProgramDescriptor, RpcArgs};

use crate::error::Result;

/// A callable server procedure.
pub trait Procedure: Send + Sync {
    /// Runs the procedure. Arguments have already been checked against its table entry.
    fn invoke(&self, args: &RpcArgs) -> Result<RpcArgs>;
}

impl<F> Procedure for F
where
    F: Fn(&RpcArgs) -> Result<RpcArgs> + Send + Sync,
{
    fn invoke(&self, args: &RpcArgs) -> Result<RpcArgs> {
        self(args)
    }
}

/// A program served in the privileged context: its table plus one procedure per entry.
pub struct LocalProgram {
    descriptor: ProgramDescriptor,
    procedures: HashMap<u32, Arc<dyn Procedure>>,
}

impl LocalProgram {
    /// Empty program.
    pub fn new(program_id: u32, version: u32) -> Self {
        Self { descriptor: ProgramDescriptor::new(program_id, version), procedures: HashMap::new() }
    }

    /// Adds `spec` served by `procedure`.
    pub fn with_procedure<F>(self, spec: ProcedureSpec, procedure: F) -> Self
    where
        F: Fn(&RpcArgs) -> Result<RpcArgs> + Send + Sync + 'static,
    {
        self.with_procedure_object(spec, Arc::new(procedure))
    }

    /// Adds `spec` served by an existing procedure object.
    pub fn with_procedure_object(mut self, spec: ProcedureSpec, procedure: Arc<dyn Procedure>) -> Self {
        self.procedures.insert(spec.procedure_id, procedure);
        self.descriptor.procedures.retain(|p| p.procedure_id != spec.procedure_id);
        self.descriptor.procedures.push(spec);
        self
    }

    /// Program id.
    pub fn program_id(&self) -> u32 {
        self.descriptor.program_id
    }

    /// Program version.
    pub fn version(&self) -> u32 {
        self.descriptor.version
    }

    /// Procedure table.
    pub fn descriptor(&self) -> &ProgramDescriptor {
        &self.descriptor
    }

    pub(crate) fn resolve(&self, procedure_id: u32) -> Option<(&ProcedureSpec, Arc<dyn Procedure>)> {
        let spec = self.descriptor.procedure(procedure_id)?;
        let procedure = self.procedures.get(&procedure_id)?;
        Some((spec, Arc::clone(procedure)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AipcError;

    #[test]
    fn later_entry_replaces_earlier_one() {
        let program = LocalProgram::new(0x20, 1)
            .with_procedure(ProcedureSpec::new(1, "old"), |_| Err(AipcError::Busy))
            .with_procedure(ProcedureSpec::new(1, "new"), |args| Ok(args.clone()));
        assert_eq!(program.descriptor().procedures.len(), 1);
        let (spec, procedure) = program.resolve(1).unwrap();
        assert_eq!(spec.name, "new");
        assert_eq!(procedure.invoke(&RpcArgs::new(vec![4])).unwrap().fixed, vec![4]);
        assert!(program.resolve(2).is_none());
    }
}
