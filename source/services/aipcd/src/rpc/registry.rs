// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Program registry shared by the dispatch engine and the user-space broker
//!
//! OWNERS: @runtime
//!
//! Privileged programs use ids below `dynamic_min`; user-space programs use ids at or
//! above it. The split is enforced here, at registration time, so dispatch never has to
//! choose between two candidates.
//!
//! Lookups hand out owned snapshots (`Arc`s). A call that resolved its program before a
//! concurrent unregistration completes against that program; a call that resolves after
//! sees no program at all.

use std::collections::HashMap;
use std::sync::Arc;

use aipc_bridge::ProgramDescriptor;
use log::info;
use parking_lot::RwLock;

use crate::error::{AipcError, Result};
use crate::rpc::procedure::LocalProgram;

/// Where a registered program is served.
#[derive(Clone)]
pub enum Registration {
    /// In the privileged context.
    Local(Arc<LocalProgram>),
    /// By a user-space process, through the broker.
    UserSpace {
        /// Owning process.
        pid: u32,
        /// Published table.
        table: Arc<ProgramDescriptor>,
    },
}

impl Registration {
    /// Procedure table of the registration.
    pub fn descriptor(&self) -> &ProgramDescriptor {
        match self {
            Self::Local(program) => program.descriptor(),
            Self::UserSpace { table, .. } => table,
        }
    }
}

/// Registered programs keyed by program id.
pub struct Registry {
    dynamic_min: u32,
    programs: RwLock<HashMap<u32, Registration>>,
}

impl Registry {
    /// Empty registry splitting ids at `dynamic_min`.
    pub fn new(dynamic_min: u32) -> Self {
        Self { dynamic_min, programs: RwLock::new(HashMap::new()) }
    }

    /// First id available to user space.
    pub fn dynamic_min(&self) -> u32 {
        self.dynamic_min
    }

    /// Registers a privileged program.
    pub fn register_local(&self, program: LocalProgram) -> Result<()> {
        let program_id = program.program_id();
        if program_id >= self.dynamic_min {
            return Err(AipcError::InvalidArgument);
        }
        program.descriptor().validate().map_err(|_| AipcError::InvalidArgument)?;
        self.insert(program_id, Registration::Local(Arc::new(program)))?;
        info!("aipcd: registered program {program_id:#x}");
        Ok(())
    }

    /// Registers a program published by process `pid`.
    pub fn register_user(&self, pid: u32, table: ProgramDescriptor) -> Result<()> {
        let program_id = table.program_id;
        if program_id < self.dynamic_min {
            return Err(AipcError::InvalidArgument);
        }
        table.validate().map_err(|_| AipcError::InvalidArgument)?;
        self.insert(program_id, Registration::UserSpace { pid, table: Arc::new(table) })?;
        info!("aipcd: pid {pid} registered program {program_id:#x}");
        Ok(())
    }

    fn insert(&self, program_id: u32, registration: Registration) -> Result<()> {
        let mut programs = self.programs.write();
        if programs.contains_key(&program_id) {
            return Err(AipcError::AlreadyRegistered);
        }
        programs.insert(program_id, registration);
        Ok(())
    }

    /// Removes `program_id` whoever registered it.
    pub fn unregister(&self, program_id: u32) -> Result<Registration> {
        let removed = self.programs.write().remove(&program_id).ok_or(AipcError::NotFound)?;
        info!("aipcd: unregistered program {program_id:#x}");
        Ok(removed)
    }

    /// Removes `program_id` only if process `pid` registered it.
    pub fn unregister_owned(&self, pid: u32, program_id: u32) -> Result<()> {
        let mut programs = self.programs.write();
        match programs.get(&program_id) {
            Some(Registration::UserSpace { pid: owner, .. }) if *owner == pid => {
                programs.remove(&program_id);
                info!("aipcd: pid {pid} unregistered program {program_id:#x}");
                Ok(())
            }
            _ => Err(AipcError::NotFound),
        }
    }

    /// Removes every program owned by `pid`; returns their ids.
    pub fn remove_process(&self, pid: u32) -> Vec<u32> {
        let mut programs = self.programs.write();
        let mut owned: Vec<u32> = programs
            .iter()
            .filter(|(_, reg)| matches!(reg, Registration::UserSpace { pid: owner, .. } if *owner == pid))
            .map(|(id, _)| *id)
            .collect();
        for id in &owned {
            programs.remove(id);
        }
        owned.sort_unstable();
        owned
    }

    /// Snapshot of the registration for `program_id`.
    pub fn lookup(&self, program_id: u32) -> Option<Registration> {
        self.programs.read().get(&program_id).cloned()
    }

    /// Registered program ids, sorted.
    pub fn program_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.programs.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
