//! Serializable snapshots of the loader tables.

use crate::registry::{ModuleFlags, ModuleRecord};
use serde::Serialize;
use std::fmt;

/// One loaded module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    /// Short name.
    pub name: String,
    /// The host program's own record.
    pub host: bool,
    /// Refuses unload.
    pub unloadable: bool,
    /// Loaded despite a dependency mismatch.
    pub forced: bool,
    /// Entry points, newest first.
    pub entries: Vec<EntryInfo>,
    /// Device types served.
    pub devices: Vec<String>,
    /// Instruction bindings, newest first.
    pub instructions: Vec<InstructionInfo>,
}

/// One entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    /// Entry name.
    pub name: String,
    /// Resolutions since the last load or unload.
    pub count: u32,
    /// `false` for entries registered with a null address.
    pub resolved: bool,
}

/// One instruction binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstructionInfo {
    /// Instruction name.
    pub name: String,
    /// Normalised opcode.
    pub opcode: u16,
    /// Mode display names.
    pub modes: Vec<&'static str>,
}

impl ModuleInfo {
    /// Snapshot `record`. Unless `all` is set, unresolved entries of the host
    /// record are left out.
    pub(crate) fn describe(record: &ModuleRecord, all: bool) -> Self {
        let host = record.flags.contains(ModuleFlags::HOST);
        Self {
            name: record.name.clone(),
            host,
            unloadable: record.is_unloadable(),
            forced: record.flags.contains(ModuleFlags::FORCED),
            entries: record
                .entries
                .iter()
                .filter(|e| all || !host || !e.address.is_null())
                .map(|e| EntryInfo {
                    name: e.name.clone(),
                    count: e.count,
                    resolved: !e.address.is_null(),
                })
                .collect(),
            devices: record.devices.iter().map(|d| d.type_name.clone()).collect(),
            instructions: record
                .instructions
                .iter()
                .map(|i| InstructionInfo {
                    name: i.name.clone(),
                    opcode: i.opcode,
                    modes: i.modes.mode_names(),
                })
                .collect(),
        }
    }
}

impl fmt::Display for ModuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "module = {}, {}, {}{}",
            self.name,
            if self.host { "host" } else { "loadable" },
            if self.unloadable { "unloadable" } else { "not unloadable" },
            if self.forced { ", forced" } else { "" }
        )?;
        for entry in &self.entries {
            writeln!(
                f,
                "  symbol = {:<24} count = {:<6}{}",
                entry.name,
                entry.count,
                if entry.resolved { "" } else { " unresolved" }
            )?;
        }
        if !self.devices.is_empty() {
            writeln!(f, "  devtype = {}", self.devices.join(" "))?;
        }
        for instr in &self.instructions {
            writeln!(
                f,
                "  instruction = {}, opcode = {:04X}, modes = {}",
                instr.name,
                instr.opcode,
                instr.modes.join(" ")
            )?;
        }
        Ok(())
    }
}
