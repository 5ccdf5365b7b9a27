//! Module ABI shared by the loader and every loadable module.
//!
//! This module defines:
//! - [`Address`] - Opaque machine address of an entry point, handler or routine
//! - Lifecycle hook signatures ([`DependencyHook`], [`RegisterHook`], ...)
//! - Registration contexts handed to those hooks ([`EntryRegistrar`], ...)
//! - Sink traits the loader implements behind each context
//!
//! # Context lifetimes
//!
//! Every context borrows a loader-side sink for exactly the duration of one
//! hook call. The loader only constructs contexts while it holds its global
//! lock, and the borrow makes it impossible for a module to keep a context
//! (and with it, access to loader tables) once the hook has returned.

use crate::consts::{ABI_DESCRIPTOR, ABI_VERSION};
use crate::flags::ArchModes;
use static_assertions::{assert_eq_size, const_assert_eq};
use std::fmt;
use thiserror::Error;

/// Opaque, copyable machine address.
///
/// Used for entry points, device handlers and instruction routines. The
/// loader never dereferences an `Address`; it only stores, compares and
/// hands them back.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(usize);

const_assert_eq!(std::mem::size_of::<Address>(), std::mem::size_of::<usize>());

impl Address {
    /// The null address. An entry point registered with it is "unresolved".
    pub const NULL: Address = Address(0);

    /// Build an address from a raw pointer (including `some_fn as *const ()`).
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Build an address from its integer value.
    pub const fn from_raw(value: usize) -> Self {
        Self(value)
    }

    /// Integer value of the address.
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Untyped pointer view of the address.
    pub fn as_ptr(self) -> *const () {
        self.0 as *const ()
    }

    /// Returns `true` for [`Address::NULL`].
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Reinterpret the address as a pointer-sized value, typically a
    /// function pointer.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the address really designates a value
    /// of type `F` (for function pointers: a function with exactly that
    /// signature and ABI) and that the code it points to is still mapped.
    ///
    /// # Panics
    ///
    /// Panics if `F` is not pointer sized.
    pub unsafe fn cast<F: Copy>(self) -> F {
        assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<usize>(),
            "Address can only be cast to a pointer-sized type"
        );
        // SAFETY: sizes checked above; validity is the caller's contract.
        unsafe { std::mem::transmute_copy::<usize, F>(&self.0) }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A module claims a shared descriptor that disagrees with the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyMismatch {
    /// Version strings differ.
    #[error("dependency '{name}' version '{claimed}' does not match recorded version '{recorded}'")]
    Version {
        /// Descriptor name.
        name: String,
        /// Version claimed by the module being loaded.
        claimed: String,
        /// Version recorded in the ledger.
        recorded: String,
    },

    /// Sizes differ.
    #[error("dependency '{name}' size {claimed} does not match recorded size {recorded}")]
    Size {
        /// Descriptor name.
        name: String,
        /// Size claimed by the module being loaded.
        claimed: usize,
        /// Size recorded in the ledger.
        recorded: usize,
    },
}

impl DependencyMismatch {
    /// Name of the conflicting descriptor.
    pub fn name(&self) -> &str {
        match self {
            Self::Version { name, .. } | Self::Size { name, .. } => name,
        }
    }
}

// ─── Sinks (implemented by the loader) ──────────────────────────────

/// Receives dependency claims.
pub trait DependencySink {
    /// Validate (or record) one `(name, version, size)` claim.
    fn check_dependency(
        &mut self,
        name: &str,
        version: &str,
        size: usize,
    ) -> Result<(), DependencyMismatch>;
}

/// Receives entry point registrations.
pub trait EntrySink {
    /// Register a named entry point for the module being loaded.
    fn register_entry(&mut self, name: &str, address: Address);
}

/// Resolves entry points across all loaded modules.
pub trait EntryLookup {
    /// Find an entry point by exact name.
    fn find_entry(&mut self, name: &str) -> Option<Address>;

    /// Find the next entry point with the same name as the one at `address`.
    fn find_next(&mut self, address: Address) -> Option<Address>;
}

/// Receives device handler registrations.
pub trait DeviceSink {
    /// Register a handler for a device type.
    fn register_device(&mut self, type_name: &str, handler: Address);
}

/// Receives instruction bindings.
pub trait InstructionSink {
    /// Bind `routine` to `opcode` in every mode of `modes`.
    fn register_instruction(&mut self, modes: ArchModes, opcode: u16, name: &str, routine: Address);
}

// ─── Contexts (handed to module hooks) ──────────────────────────────

/// Context for a module's dependency hook.
pub struct DependencyCheck<'a> {
    sink: &'a mut dyn DependencySink,
}

impl<'a> DependencyCheck<'a> {
    /// Wrap a loader-side sink.
    pub fn new(sink: &'a mut dyn DependencySink) -> Self {
        Self { sink }
    }

    /// Claim a shared descriptor.
    pub fn require(&mut self, name: &str, version: &str, size: usize) -> Result<(), DependencyMismatch> {
        self.sink.check_dependency(name, version, size)
    }

    /// Claim a shared descriptor whose size is that of `T`.
    pub fn require_type<T>(&mut self, name: &str, version: &str) -> Result<(), DependencyMismatch> {
        self.require(name, version, std::mem::size_of::<T>())
    }

    /// Claim the module ABI this crate was built with.
    pub fn require_abi(&mut self) -> Result<(), DependencyMismatch> {
        self.require(ABI_DESCRIPTOR, ABI_VERSION, ABI_LAYOUT_SIZE)
    }
}

/// Combined size of the ABI types crossing the module boundary.
pub const ABI_LAYOUT_SIZE: usize = std::mem::size_of::<Address>()
    + std::mem::size_of::<DependencyCheck<'static>>()
    + std::mem::size_of::<EntryRegistrar<'static>>()
    + std::mem::size_of::<Resolver<'static>>()
    + std::mem::size_of::<DeviceRegistrar<'static>>()
    + std::mem::size_of::<InstructionRegistrar<'static>>();

/// Context for a module's register hook.
pub struct EntryRegistrar<'a> {
    sink: &'a mut dyn EntrySink,
}

impl<'a> EntryRegistrar<'a> {
    /// Wrap a loader-side sink.
    pub fn new(sink: &'a mut dyn EntrySink) -> Self {
        Self { sink }
    }

    /// Declare a named entry point.
    pub fn entry(&mut self, name: &str, address: Address) {
        self.sink.register_entry(name, address);
    }
}

/// Context for a module's resolve hook.
pub struct Resolver<'a> {
    lookup: &'a mut dyn EntryLookup,
}

impl<'a> Resolver<'a> {
    /// Wrap a loader-side lookup.
    pub fn new(lookup: &'a mut dyn EntryLookup) -> Self {
        Self { lookup }
    }

    /// Resolve an entry point by name. `None` is a normal outcome.
    pub fn find(&mut self, name: &str) -> Option<Address> {
        self.lookup.find_entry(name)
    }

    /// Next entry point in chain order sharing the name of `address`.
    pub fn find_next(&mut self, address: Address) -> Option<Address> {
        self.lookup.find_next(address)
    }
}

/// Context for a module's device hook.
pub struct DeviceRegistrar<'a> {
    sink: &'a mut dyn DeviceSink,
}

impl<'a> DeviceRegistrar<'a> {
    /// Wrap a loader-side sink.
    pub fn new(sink: &'a mut dyn DeviceSink) -> Self {
        Self { sink }
    }

    /// Declare a handler for a device type.
    pub fn device(&mut self, type_name: &str, handler: Address) {
        self.sink.register_device(type_name, handler);
    }
}

/// Context for a module's instruction hook.
pub struct InstructionRegistrar<'a> {
    sink: &'a mut dyn InstructionSink,
}

impl<'a> InstructionRegistrar<'a> {
    /// Wrap a loader-side sink.
    pub fn new(sink: &'a mut dyn InstructionSink) -> Self {
        Self { sink }
    }

    /// Declare an instruction routine. The binding is spliced into the live
    /// dispatch table before this call returns.
    ///
    /// One-byte opcodes (`<= 0xFF`) are normalised with [`normalize_opcode`].
    pub fn instruction(&mut self, modes: ArchModes, opcode: u16, name: &str, routine: Address) {
        self.sink
            .register_instruction(modes, normalize_opcode(opcode), name, routine);
    }
}

/// Normalise an opcode to its two-byte dispatch index.
///
/// One-byte opcodes occupy the high byte: `0xB2` becomes `0xB200`.
pub const fn normalize_opcode(opcode: u16) -> u16 {
    if opcode > 0xFF { opcode } else { opcode << 8 }
}

// ─── Lifecycle hooks ────────────────────────────────────────────────

/// Declares and validates the module's shared descriptors. Mandatory.
pub type DependencyHook = fn(&mut DependencyCheck<'_>) -> Result<(), DependencyMismatch>;
/// Declares the module's named entry points.
pub type RegisterHook = fn(&mut EntryRegistrar<'_>);
/// Re-binds imported entry points. Called after every topology change.
pub type ResolveHook = fn(&mut Resolver<'_>);
/// Declares device handlers.
pub type DeviceHook = fn(&mut DeviceRegistrar<'_>);
/// Declares instruction bindings.
pub type InstructionHook = fn(&mut InstructionRegistrar<'_>);
/// Called before unload and at termination. `Err(code)` refuses the unload.
pub type FinalizeHook = fn() -> Result<(), i32>;

assert_eq_size!(DependencyHook, usize);
assert_eq_size!(RegisterHook, usize);
assert_eq_size!(ResolveHook, usize);
assert_eq_size!(DeviceHook, usize);
assert_eq_size!(InstructionHook, usize);
assert_eq_size!(FinalizeHook, usize);

/// Export lifecycle hooks under the symbol names the loader looks up.
///
/// Each key is optional except `dependencies`, which every module must
/// provide. Keys may appear in any order.
///
/// ```rust,ignore
/// modhost_common::export_hooks! {
///     dependencies: my_dependencies,
///     register: my_register,
///     finalize: my_finalize,
/// }
/// ```
#[macro_export]
macro_rules! export_hooks {
    () => {};
    (dependencies: $f:path $(, $($rest:tt)*)?) => {
        #[unsafe(no_mangle)]
        pub fn modhost_dependencies(
            check: &mut $crate::abi::DependencyCheck<'_>,
        ) -> ::std::result::Result<(), $crate::abi::DependencyMismatch> {
            $f(check)
        }
        $($crate::export_hooks!($($rest)*);)?
    };
    (register: $f:path $(, $($rest:tt)*)?) => {
        #[unsafe(no_mangle)]
        pub fn modhost_register(reg: &mut $crate::abi::EntryRegistrar<'_>) {
            $f(reg)
        }
        $($crate::export_hooks!($($rest)*);)?
    };
    (resolve: $f:path $(, $($rest:tt)*)?) => {
        #[unsafe(no_mangle)]
        pub fn modhost_resolve(resolver: &mut $crate::abi::Resolver<'_>) {
            $f(resolver)
        }
        $($crate::export_hooks!($($rest)*);)?
    };
    (devices: $f:path $(, $($rest:tt)*)?) => {
        #[unsafe(no_mangle)]
        pub fn modhost_devices(reg: &mut $crate::abi::DeviceRegistrar<'_>) {
            $f(reg)
        }
        $($crate::export_hooks!($($rest)*);)?
    };
    (instructions: $f:path $(, $($rest:tt)*)?) => {
        #[unsafe(no_mangle)]
        pub fn modhost_instructions(reg: &mut $crate::abi::InstructionRegistrar<'_>) {
            $f(reg)
        }
        $($crate::export_hooks!($($rest)*);)?
    };
    (finalize: $f:path $(, $($rest:tt)*)?) => {
        #[unsafe(no_mangle)]
        pub fn modhost_finalize() -> ::std::result::Result<(), i32> {
            $f()
        }
        $($crate::export_hooks!($($rest)*);)?
    };
}
