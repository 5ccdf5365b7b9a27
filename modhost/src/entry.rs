//! Entry point table and cross-module resolution.
//!
//! Entry points live in the record of the module that contributed them.
//! Resolution walks the module chain head-first, so the most recently
//! loaded module wins; [`find_next`] continues the walk for chained hooks.

use crate::registry::ModuleChain;
use modhost_common::abi::{Address, EntryLookup, EntrySink};
use std::collections::VecDeque;
use tracing::error;

/// A named, callable address contributed by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    /// Name, unique within the owning module.
    pub name: String,
    /// Address. [`Address::NULL`] marks an unresolved entry.
    pub address: Address,
    /// Resolutions since the last topology change.
    pub count: u32,
}

/// Resolve `name` across the chain.
///
/// Registered entries are searched first and each hit bumps the entry's use
/// count. Failing that, every module's raw symbols are tried in chain order;
/// a hit is recorded as a new entry (count 1) on the module that exports it.
pub(crate) fn find_entry(chain: &mut ModuleChain, name: &str) -> Option<Address> {
    for module in chain.iter_mut() {
        if let Some(entry) = module.entries.iter_mut().find(|e| e.name == name) {
            entry.count = entry.count.saturating_add(1);
            return (!entry.address.is_null()).then_some(entry.address);
        }
    }

    for module in chain.iter_mut() {
        let Ok(address) = module.image.symbol(name) else {
            continue;
        };
        if address.is_null() {
            continue;
        }
        if module.entries.try_reserve(1).is_err() {
            error!(code = "MH-06", "unable to allocate entry point {name}");
            return None;
        }
        module.entries.push_front(EntryPoint {
            name: name.to_string(),
            address,
            count: 1,
        });
        return Some(address);
    }

    None
}

/// Next entry, in chain order, sharing the name of the entry at `address`.
/// Unresolved entries are skipped.
pub(crate) fn find_next(chain: &ModuleChain, address: Address) -> Option<Address> {
    if address.is_null() {
        return None;
    }
    let mut entries = chain.iter().flat_map(|m| m.entries.iter());
    let name = &entries.by_ref().find(|e| e.address == address)?.name;
    entries
        .find(|e| &e.name == name && !e.address.is_null())
        .map(|e| e.address)
}

/// Zero every use count. Counts measure usage since the last load/unload.
pub(crate) fn reset_counts(chain: &mut ModuleChain) {
    for module in chain.iter_mut() {
        for entry in module.entries.iter_mut() {
            entry.count = 0;
        }
    }
}

/// Sink behind [`modhost_common::abi::EntryRegistrar`].
pub(crate) struct EntryCollector<'a> {
    entries: &'a mut VecDeque<EntryPoint>,
}

impl<'a> EntryCollector<'a> {
    pub(crate) fn new(entries: &'a mut VecDeque<EntryPoint>) -> Self {
        Self { entries }
    }
}

impl EntrySink for EntryCollector<'_> {
    fn register_entry(&mut self, name: &str, address: Address) {
        self.entries.push_front(EntryPoint {
            name: name.to_string(),
            address,
            count: 0,
        });
    }
}

/// Lookup behind [`modhost_common::abi::Resolver`].
pub(crate) struct ChainLookup<'a> {
    chain: &'a mut ModuleChain,
}

impl<'a> ChainLookup<'a> {
    pub(crate) fn new(chain: &'a mut ModuleChain) -> Self {
        Self { chain }
    }
}

impl EntryLookup for ChainLookup<'_> {
    fn find_entry(&mut self, name: &str) -> Option<Address> {
        find_entry(self.chain, name)
    }

    fn find_next(&mut self, address: Address) -> Option<Address> {
        find_next(self.chain, address)
    }
}
