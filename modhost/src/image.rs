//! Module images and lifecycle hook lookup.
//!
//! A [`ModuleImage`] is anything the loader can look symbols up in: a native
//! shared library ([`crate::native::NativeLibrary`]) or an in-process
//! [`StaticImage`]. A [`ModuleOpener`] turns a path into an image.

use modhost_common::abi::{
    Address, DependencyHook, DeviceHook, FinalizeHook, InstructionHook, RegisterHook, ResolveHook,
};
use modhost_common::consts::{
    SYM_DEPENDENCIES, SYM_DEVICES, SYM_FINALIZE, SYM_INSTRUCTIONS, SYM_REGISTER, SYM_RESOLVE,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// An opened module.
pub trait ModuleImage: Send + Sync {
    /// Look up a symbol. `Err` carries the platform diagnostic.
    fn symbol(&self, name: &str) -> Result<Address, String>;
}

/// Opens module images by path.
pub trait ModuleOpener: Send + Sync {
    /// Open the module at `path`. `Err` carries the platform diagnostic.
    fn open(&self, path: &Path) -> Result<Box<dyn ModuleImage>, String>;
}

/// Lifecycle hooks of one module, resolved once at load time.
#[derive(Debug, Clone, Copy)]
pub struct ModuleHooks {
    /// Mandatory dependency hook.
    pub dependencies: DependencyHook,
    /// Entry point registration.
    pub register: Option<RegisterHook>,
    /// Import re-binding.
    pub resolve: Option<ResolveHook>,
    /// Device handler declaration.
    pub devices: Option<DeviceHook>,
    /// Instruction declaration.
    pub instructions: Option<InstructionHook>,
    /// Cleanup before unload.
    pub finalize: Option<FinalizeHook>,
}

impl ModuleHooks {
    /// Resolve the hooks exported by `image`.
    ///
    /// # Errors
    /// Returns the platform diagnostic if the mandatory dependency hook is
    /// not exported. All other hooks are optional.
    pub fn lookup(image: &dyn ModuleImage) -> Result<Self, String> {
        let dependencies = image.symbol(SYM_DEPENDENCIES)?;
        if dependencies.is_null() {
            return Err(format!("{SYM_DEPENDENCIES} resolves to a null address"));
        }

        // SAFETY: the lifecycle symbol names are reserved for functions with
        // the matching hook signature; `export_hooks!` generates exactly those.
        unsafe {
            Ok(Self {
                dependencies: dependencies.cast::<DependencyHook>(),
                register: optional(image, SYM_REGISTER).map(|a| a.cast::<RegisterHook>()),
                resolve: optional(image, SYM_RESOLVE).map(|a| a.cast::<ResolveHook>()),
                devices: optional(image, SYM_DEVICES).map(|a| a.cast::<DeviceHook>()),
                instructions: optional(image, SYM_INSTRUCTIONS)
                    .map(|a| a.cast::<InstructionHook>()),
                finalize: optional(image, SYM_FINALIZE).map(|a| a.cast::<FinalizeHook>()),
            })
        }
    }

    /// Address of the dependency hook. Two images with the same descriptor
    /// address carry the same module content.
    pub fn descriptor(&self) -> Address {
        Address::from_ptr(self.dependencies as *const ())
    }
}

fn optional(image: &dyn ModuleImage, name: &str) -> Option<Address> {
    image.symbol(name).ok().filter(|a| !a.is_null())
}

/// In-process module image built from a symbol table.
///
/// Used for the host's own record when the platform cannot look symbols up
/// in the running executable, for embedding modules compiled into the host,
/// and in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticImage {
    symbols: HashMap<String, Address>,
}

impl StaticImage {
    /// Empty image (no symbols at all, not even a dependency hook).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw symbol.
    pub fn with_symbol(mut self, name: &str, address: Address) -> Self {
        self.symbols.insert(name.to_string(), address);
        self
    }

    /// Export the dependency hook.
    pub fn dependencies(self, hook: DependencyHook) -> Self {
        self.with_symbol(SYM_DEPENDENCIES, Address::from_ptr(hook as *const ()))
    }

    /// Export the register hook.
    pub fn register(self, hook: RegisterHook) -> Self {
        self.with_symbol(SYM_REGISTER, Address::from_ptr(hook as *const ()))
    }

    /// Export the resolve hook.
    pub fn resolve(self, hook: ResolveHook) -> Self {
        self.with_symbol(SYM_RESOLVE, Address::from_ptr(hook as *const ()))
    }

    /// Export the device hook.
    pub fn devices(self, hook: DeviceHook) -> Self {
        self.with_symbol(SYM_DEVICES, Address::from_ptr(hook as *const ()))
    }

    /// Export the instruction hook.
    pub fn instructions(self, hook: InstructionHook) -> Self {
        self.with_symbol(SYM_INSTRUCTIONS, Address::from_ptr(hook as *const ()))
    }

    /// Export the finalize hook.
    pub fn finalize(self, hook: FinalizeHook) -> Self {
        self.with_symbol(SYM_FINALIZE, Address::from_ptr(hook as *const ()))
    }
}

impl ModuleImage for StaticImage {
    fn symbol(&self, name: &str) -> Result<Address, String> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| format!("undefined symbol: {name}"))
    }
}

/// Opener serving [`StaticImage`]s registered under exact paths.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    images: HashMap<PathBuf, StaticImage>,
}

impl StaticCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `image` openable at `path`.
    pub fn with_module(mut self, path: impl Into<PathBuf>, image: StaticImage) -> Self {
        self.images.insert(path.into(), image);
        self
    }
}

impl ModuleOpener for StaticCatalog {
    fn open(&self, path: &Path) -> Result<Box<dyn ModuleImage>, String> {
        self.images
            .get(path)
            .cloned()
            .map(|image| Box::new(image) as Box<dyn ModuleImage>)
            .ok_or_else(|| format!("{}: cannot open shared object file", path.display()))
    }
}
