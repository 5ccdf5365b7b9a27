//! Prelude module for common re-exports.
//!
//! Module crates usually only need `use modhost_common::prelude::*;`.

// ─── ABI ────────────────────────────────────────────────────────────
pub use crate::abi::{
    Address, DependencyCheck, DependencyHook, DependencyMismatch, DeviceHook, DeviceRegistrar,
    EntryRegistrar, FinalizeHook, InstructionHook, InstructionRegistrar, RegisterHook,
    ResolveHook, Resolver,
};

// ─── Constants ──────────────────────────────────────────────────────
pub use crate::consts::{ABI_DESCRIPTOR, ABI_VERSION};

// ─── Flags ──────────────────────────────────────────────────────────
pub use crate::flags::{ArchModes, LoadFlags};

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LoaderConfig, LogLevel, PreloadEntry};
