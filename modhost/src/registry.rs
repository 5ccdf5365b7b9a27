//! Module records and the module chain.

use crate::device::DeviceHandler;
use crate::entry::{EntryPoint, reset_counts};
use crate::error::{LoaderError, LoaderResult};
use crate::image::{ModuleHooks, ModuleImage};
use crate::instruction::InstructionBinding;
use bitflags::bitflags;
use modhost_common::abi::{Address, ResolveHook};
use std::collections::VecDeque;

bitflags! {
    /// Per-module state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModuleFlags: u8 {
        /// The host program's own record.
        const HOST = 0x01;
        /// Refuses unload.
        const RESIDENT = 0x02;
        /// Loaded despite a dependency mismatch.
        const FORCED = 0x04;
    }
}

/// Book-keeping for one loaded module.
pub struct ModuleRecord {
    pub(crate) name: String,
    pub(crate) image: Box<dyn ModuleImage>,
    pub(crate) hooks: ModuleHooks,
    pub(crate) flags: ModuleFlags,
    pub(crate) entries: VecDeque<EntryPoint>,
    pub(crate) devices: VecDeque<DeviceHandler>,
    pub(crate) instructions: VecDeque<InstructionBinding>,
}

impl ModuleRecord {
    pub(crate) fn new(
        name: String,
        image: Box<dyn ModuleImage>,
        hooks: ModuleHooks,
        flags: ModuleFlags,
    ) -> Self {
        Self {
            name,
            image,
            hooks,
            flags,
            entries: VecDeque::new(),
            devices: VecDeque::new(),
            instructions: VecDeque::new(),
        }
    }

    /// Short name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// State flags.
    pub fn flags(&self) -> ModuleFlags {
        self.flags
    }

    /// Address identifying the module content.
    pub fn descriptor(&self) -> Address {
        self.hooks.descriptor()
    }

    /// Host and resident modules refuse unload.
    pub fn is_unloadable(&self) -> bool {
        !self.flags.intersects(ModuleFlags::HOST | ModuleFlags::RESIDENT)
    }
}

/// Loaded modules, most recently loaded first.
#[derive(Default)]
pub(crate) struct ModuleChain {
    modules: VecDeque<ModuleRecord>,
}

impl ModuleChain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ModuleRecord> {
        self.modules.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ModuleRecord> {
        self.modules.iter_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.modules.len()
    }

    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.modules.iter().position(|m| same_module_name(&m.name, name))
    }

    pub(crate) fn get(&self, index: usize) -> Option<&ModuleRecord> {
        self.modules.get(index)
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut ModuleRecord> {
        self.modules.front_mut()
    }

    pub(crate) fn by_descriptor(&self, descriptor: Address) -> Option<&ModuleRecord> {
        self.modules.iter().find(|m| m.descriptor() == descriptor)
    }

    /// Reserve room for one more record so the following insert cannot fail.
    pub(crate) fn reserve_one(&mut self) -> LoaderResult<()> {
        self.modules
            .try_reserve(1)
            .map_err(|_| LoaderError::AllocationFailure {
                what: "module record".to_string(),
            })
    }

    pub(crate) fn push_front(&mut self, record: ModuleRecord) -> LoaderResult<()> {
        self.reserve_one()?;
        self.modules.push_front(record);
        Ok(())
    }

    pub(crate) fn remove(&mut self, index: usize) -> Option<ModuleRecord> {
        self.modules.remove(index)
    }

    pub(crate) fn reset_counts(&mut self) {
        reset_counts(self);
    }

    /// Resolve hooks of every module, in chain order.
    pub(crate) fn resolvers(&self) -> Vec<ResolveHook> {
        self.modules.iter().filter_map(|m| m.hooks.resolve).collect()
    }
}

/// Short name of a module reference: everything after the last path separator.
pub fn short_name(reference: &str) -> &str {
    let separators: &[char] = if cfg!(windows) { &['/', '\\'] } else { &['/'] };
    reference
        .rsplit_once(separators)
        .map_or(reference, |(_, name)| name)
}

/// Whether a module reference carries a directory component.
pub(crate) fn has_directory(reference: &str) -> bool {
    short_name(reference).len() != reference.len()
}

/// Module names compare case-insensitively where the file system does.
pub(crate) fn same_module_name(a: &str, b: &str) -> bool {
    if cfg!(windows) {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}
