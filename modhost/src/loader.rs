//! The module loader.
//!
//! [`Loader`] owns the module chain, the dependency ledger and the splice
//! stacks behind one reader/writer lock. Load and unload hold the write lock
//! from the duplicate check until the tables are consistent again, including
//! while module hooks run; hooks therefore must not call back into the
//! loader except through the context they were handed.

use crate::device::{DeviceCollector, DeviceInventory, NoDevices, device_module_name, find_handler};
use crate::entry::{ChainLookup, EntryCollector, find_entry, find_next};
use crate::error::{LoaderError, LoaderResult};
use crate::image::{ModuleHooks, ModuleImage, ModuleOpener};
use crate::instruction::{DispatchTable, InstructionCollector, OpcodeTable, SpliceStacks};
use crate::ledger::{Dependency, DependencyLedger, LedgerMode, LedgerSink};
use crate::listing::ModuleInfo;
use crate::module_dir::{DirOrigin, ModuleDirectory};
use crate::native::NativeOpener;
use crate::registry::{ModuleChain, ModuleFlags, ModuleRecord, has_directory, short_name};
use crate::shutdown::{HookKey, ShutdownHooks};
use modhost_common::abi::{
    Address, DependencyCheck, DependencyHook, DependencyMismatch, DeviceRegistrar, EntryRegistrar,
    InstructionRegistrar, Resolver,
};
use modhost_common::config::{LoaderConfig, PreloadEntry};
use modhost_common::consts::{HOST_MODULE_NAME, LOADER_TERM_HOOK};
use modhost_common::flags::{ArchModes, LoadFlags};
use parking_lot::RwLock;
use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Maps a device type to the type whose module implements it.
pub type DeviceEquates = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Loader behaviour fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderOptions {
    /// Appended to every module reference before opening.
    pub module_suffix: String,
    /// Prefix of device type modules.
    pub device_module_prefix: String,
    /// Close images on unload instead of quarantining them.
    pub close_on_unload: bool,
}

impl From<&LoaderConfig> for LoaderOptions {
    fn from(config: &LoaderConfig) -> Self {
        Self {
            module_suffix: config.effective_suffix().to_string(),
            device_module_prefix: config.device_module_prefix.clone(),
            close_on_unload: config.close_on_unload,
        }
    }
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self::from(&LoaderConfig::default())
    }
}

/// An unloaded image whose code may still be referenced.
struct Quarantined {
    name: String,
    // Never dropped: the handle stays open for the life of the process.
    _image: ManuallyDrop<Box<dyn ModuleImage>>,
}

struct LoaderState {
    chain: ModuleChain,
    ledger: DependencyLedger,
    dispatch: Box<dyn DispatchTable>,
    splices: SpliceStacks,
    quarantine: Vec<Quarantined>,
}

impl LoaderState {
    fn check_dependencies(
        &mut self,
        hook: DependencyHook,
        mode: LedgerMode,
    ) -> Result<(), DependencyMismatch> {
        let mut sink = LedgerSink {
            ledger: &mut self.ledger,
            mode,
        };
        hook(&mut DependencyCheck::new(&mut sink))
    }

    /// Register, link at the head, re-resolve, then declare devices and
    /// splice instructions.
    fn attach(&mut self, mut record: ModuleRecord) -> LoaderResult<()> {
        self.chain.reserve_one()?;

        if let Some(register) = record.hooks.register {
            let mut sink = EntryCollector::new(&mut record.entries);
            register(&mut EntryRegistrar::new(&mut sink));
        }
        self.chain.push_front(record)?;
        self.topology_changed();

        let Self {
            chain,
            dispatch,
            splices,
            ..
        } = self;
        let Some(head) = chain.head_mut() else {
            return Ok(());
        };
        if let Some(devices) = head.hooks.devices {
            let mut sink = DeviceCollector::new(&mut head.devices);
            devices(&mut DeviceRegistrar::new(&mut sink));
        }
        if let Some(instructions) = head.hooks.instructions {
            let mut sink =
                InstructionCollector::new(&mut head.instructions, &mut **dispatch, splices);
            instructions(&mut InstructionRegistrar::new(&mut sink));
        }
        Ok(())
    }

    /// Unlink the record at `index`, unsplicing its instructions newest first.
    fn detach(&mut self, index: usize) -> Option<ModuleRecord> {
        let mut record = self.chain.remove(index)?;
        for binding in record.instructions.drain(..) {
            self.splices.unsplice(&mut *self.dispatch, &binding);
        }
        record.entries.clear();
        record.devices.clear();
        self.topology_changed();
        Some(record)
    }

    /// Zero use counts and give every module a chance to re-bind.
    fn topology_changed(&mut self) {
        self.chain.reset_counts();
        for resolve in self.chain.resolvers() {
            let mut lookup = ChainLookup::new(&mut self.chain);
            resolve(&mut Resolver::new(&mut lookup));
        }
    }
}

/// Runtime module loader.
pub struct Loader {
    state: RwLock<LoaderState>,
    opener: Box<dyn ModuleOpener>,
    devices: Box<dyn DeviceInventory>,
    module_dir: ModuleDirectory,
    hooks: Arc<ShutdownHooks>,
    equates: RwLock<Option<DeviceEquates>>,
    options: LoaderOptions,
    terminated: AtomicBool,
}

impl Loader {
    /// Start configuring a loader.
    pub fn builder() -> LoaderBuilder {
        LoaderBuilder::default()
    }

    /// Load a module.
    ///
    /// `reference` is a path or short name; the configured suffix is
    /// appended. A reference without a directory that cannot be opened as
    /// given is retried inside the module directory.
    ///
    /// # Errors
    /// Any of the load failures of [`LoaderError`]. Failures are logged;
    /// [`LoadFlags::QUIET`] suppresses the log of an open failure only.
    pub fn load(&self, reference: &str, flags: LoadFlags) -> LoaderResult<()> {
        self.load_module(reference, flags, ModuleFlags::empty())
    }

    /// Load a module that will refuse unload.
    ///
    /// # Errors
    /// As for [`Loader::load`].
    pub fn load_resident(&self, reference: &str, flags: LoadFlags) -> LoaderResult<()> {
        self.load_module(reference, flags, ModuleFlags::RESIDENT)
    }

    fn load_module(&self, reference: &str, flags: LoadFlags, extra: ModuleFlags) -> LoaderResult<()> {
        let result = self.try_load(reference, flags, extra);
        if let Err(err) = &result {
            let quiet = flags.contains(LoadFlags::QUIET) && matches!(err, LoaderError::OpenFailed { .. });
            if !quiet {
                error!(code = err.code(), "{err}");
            }
        }
        result
    }

    fn try_load(&self, reference: &str, flags: LoadFlags, extra: ModuleFlags) -> LoaderResult<()> {
        let name = short_name(reference).to_string();
        let mut state = self.state.write();

        if state.chain.position(&name).is_some() {
            return Err(LoaderError::DuplicateModule { module: name });
        }

        let image = self.open_image(reference)?;
        let hooks = ModuleHooks::lookup(image.as_ref()).map_err(|reason| LoaderError::NoDescriptor {
            module: name.clone(),
            reason,
        })?;

        if let Some(existing) = state.chain.by_descriptor(hooks.descriptor()) {
            return Err(LoaderError::DuplicateDescriptor {
                module: name,
                existing: existing.name().to_string(),
            });
        }

        let mut module_flags = extra;
        if let Err(mismatch) = state.check_dependencies(hooks.dependencies, LedgerMode::Check) {
            if !flags.contains(LoadFlags::FORCE) {
                return Err(LoaderError::DependencyMismatch {
                    module: name,
                    mismatch,
                });
            }
            warn!(code = "MH-05", module = %name, "{mismatch}; loading anyway");
            module_flags |= ModuleFlags::FORCED;
        }

        state.attach(ModuleRecord::new(name.clone(), image, hooks, module_flags))?;
        info!(module = %name, "module loaded");
        Ok(())
    }

    fn open_image(&self, reference: &str) -> LoaderResult<Box<dyn ModuleImage>> {
        let file = format!("{reference}{}", self.options.module_suffix);
        let mut reason = match self.opener.open(Path::new(&file)) {
            Ok(image) => return Ok(image),
            Err(reason) => reason,
        };

        if !has_directory(reference) {
            if let Some(dir) = self.module_dir.get() {
                let candidate = dir.join(&file);
                match self.opener.open(&candidate) {
                    Ok(image) => {
                        debug!("opened {}", candidate.display());
                        return Ok(image);
                    }
                    Err(e) => reason = e,
                }
            }
        }

        Err(LoaderError::OpenFailed {
            module: reference.to_string(),
            reason,
        })
    }

    /// Unload a module.
    ///
    /// The unload is refused for the host and resident modules, while an
    /// active device is served by one of the module's handlers, and when the
    /// module's finalize hook reports failure.
    ///
    /// # Errors
    /// [`LoaderError::NotFound`], [`LoaderError::Protected`],
    /// [`LoaderError::DeviceInUse`] or [`LoaderError::FinalizeRefused`].
    pub fn unload(&self, reference: &str) -> LoaderResult<()> {
        let name = short_name(reference);
        let result = self.try_unload(name);
        match &result {
            Ok(()) => info!(module = %name, "module unloaded"),
            Err(err) => error!(code = err.code(), "{err}"),
        }
        result
    }

    fn try_unload(&self, name: &str) -> LoaderResult<()> {
        let not_found = || LoaderError::NotFound {
            module: name.to_string(),
        };
        let mut state = self.state.write();
        let index = state.chain.position(name).ok_or_else(not_found)?;
        let module = state.chain.get(index).ok_or_else(not_found)?;

        if !module.is_unloadable() {
            return Err(LoaderError::Protected {
                module: module.name().to_string(),
            });
        }

        let active = self.devices.active_devices();
        if let Some(device) = active
            .iter()
            .find(|d| module.devices.iter().any(|h| h.handler == d.handler))
        {
            return Err(LoaderError::DeviceInUse {
                module: module.name().to_string(),
                lcss: device.lcss,
                devnum: device.devnum,
            });
        }

        if let Some(finalize) = module.hooks.finalize {
            if let Err(code) = finalize() {
                return Err(LoaderError::FinalizeRefused {
                    module: module.name().to_string(),
                    code,
                });
            }
        }

        let record = state.detach(index).ok_or_else(not_found)?;
        if self.options.close_on_unload {
            debug!(module = %record.name, "closing module image");
            drop(record);
        } else {
            debug!(module = %record.name, "module image quarantined");
            state.quarantine.push(Quarantined {
                name: record.name,
                _image: ManuallyDrop::new(record.image),
            });
        }
        Ok(())
    }

    /// Resolve an entry point by name, most recently loaded module first.
    pub fn find_entry(&self, name: &str) -> Option<Address> {
        find_entry(&mut self.state.write().chain, name)
    }

    /// Next entry point in chain order with the same name as the one at
    /// `address`.
    pub fn find_next(&self, address: Address) -> Option<Address> {
        find_next(&self.state.read().chain, address)
    }

    /// Handler registered for a device type, without loading anything.
    pub fn find_device(&self, type_name: &str) -> Option<Address> {
        find_handler(&self.state.read().chain, type_name)
    }

    /// Handler for a device type, loading the device module on demand.
    ///
    /// Tries the registered handlers, then the module named after the type
    /// (for example `hdt3270`), then the module of the equated type.
    pub fn device_handler(&self, type_name: &str) -> Option<Address> {
        if let Some(handler) = self.find_device(type_name) {
            return Some(handler);
        }

        self.load_device_module(type_name);
        if let Some(handler) = self.find_device(type_name) {
            return Some(handler);
        }

        let equated = self.equates.read().as_ref().and_then(|equates| equates(type_name))?;
        debug!("device type {type_name} equated to {equated}");
        self.load_device_module(&equated);
        self.find_device(type_name)
            .or_else(|| self.find_device(&equated))
    }

    /// Load the module serving `type_name` unless it is already loaded.
    /// A missing module is not an error here.
    fn load_device_module(&self, type_name: &str) {
        let module = device_module_name(&self.options.device_module_prefix, type_name);
        if !self.is_loaded(&module) {
            let _ = self.load(&module, LoadFlags::QUIET);
        }
    }

    /// Install the device type equates used by [`Loader::device_handler`].
    pub fn set_device_equates<F>(&self, equates: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        *self.equates.write() = Some(Box::new(equates));
    }

    /// Snapshot of every loaded module, most recent first.
    ///
    /// Unresolved host entries are left out unless `all` is set.
    pub fn list(&self, all: bool) -> Vec<ModuleInfo> {
        self.state
            .read()
            .chain
            .iter()
            .map(|m| ModuleInfo::describe(m, all))
            .collect()
    }

    /// Recorded dependencies in first-seen order.
    pub fn dependencies(&self) -> Vec<Dependency> {
        self.state.read().ledger.entries().to_vec()
    }

    /// Short names of the loaded modules, most recent first.
    pub fn module_names(&self) -> Vec<String> {
        self.state
            .read()
            .chain
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Returns `true` if a module with that short name is loaded.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.state.read().chain.position(short_name(name)).is_some()
    }

    /// Names of unloaded modules whose images were kept open.
    pub fn quarantined(&self) -> Vec<String> {
        self.state
            .read()
            .quarantine
            .iter()
            .map(|q| q.name.clone())
            .collect()
    }

    /// Routine currently dispatched for `(mode, opcode)`.
    pub fn dispatch_routine(&self, mode: ArchModes, opcode: u16) -> Address {
        self.state.read().dispatch.routine(mode, opcode)
    }

    /// Current module directory.
    pub fn module_dir(&self) -> Option<PathBuf> {
        self.module_dir.get()
    }

    /// Change the module directory at run time and return the directory in
    /// effect. A directory pinned at startup is kept.
    ///
    /// # Errors
    /// [`LoaderError::PathTooLong`].
    pub fn set_module_dir(&self, path: &Path) -> LoaderResult<PathBuf> {
        self.module_dir.set(path, DirOrigin::Runtime)
    }

    /// Shutdown hooks the loader registered its termination routine with.
    pub fn shutdown_hooks(&self) -> &Arc<ShutdownHooks> {
        &self.hooks
    }

    /// Options in effect.
    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Call every module's finalize hook in chain order. Refusals are
    /// logged and ignored. Runs at most once.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("begin loader termination");
        let state = self.state.write();
        for module in state.chain.iter() {
            let Some(finalize) = module.hooks.finalize else {
                continue;
            };
            debug!(module = %module.name(), "finalizing");
            if let Err(code) = finalize() {
                warn!(module = %module.name(), code, "finalize failed during termination");
            }
        }
        debug!("loader termination complete");
    }

    fn term_key(&self) -> HookKey {
        HookKey {
            callback: Self::terminate as fn(&Self) as usize,
            arg: self as *const Self as usize,
        }
    }

    fn register_term_hook(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.hooks.register_action(
            LOADER_TERM_HOOK,
            self.term_key(),
            Box::new(move || {
                if let Some(loader) = weak.upgrade() {
                    loader.terminate();
                }
            }),
        );
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.hooks.unregister_key(self.term_key());
    }
}

/// Configures and initialises a [`Loader`].
pub struct LoaderBuilder {
    options: LoaderOptions,
    module_dir: Option<PathBuf>,
    preload: Vec<PreloadEntry>,
    opener: Box<dyn ModuleOpener>,
    dispatch: Box<dyn DispatchTable>,
    devices: Box<dyn DeviceInventory>,
    hooks: Arc<ShutdownHooks>,
}

impl Default for LoaderBuilder {
    fn default() -> Self {
        Self {
            options: LoaderOptions::default(),
            module_dir: None,
            preload: Vec::new(),
            opener: Box::new(NativeOpener),
            dispatch: Box::new(OpcodeTable::new(Address::NULL)),
            devices: Box::new(NoDevices),
            hooks: ShutdownHooks::global(),
        }
    }
}

impl LoaderBuilder {
    /// Take options, module directory and preload list from `config`.
    pub fn config(mut self, config: &LoaderConfig) -> Self {
        self.options = LoaderOptions::from(config);
        self.module_dir = config.module_dir.clone();
        self.preload = config.preload.clone();
        self
    }

    /// Override the options.
    pub fn options(mut self, options: LoaderOptions) -> Self {
        self.options = options;
        self
    }

    /// Pin the module directory.
    pub fn module_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.module_dir = Some(dir.into());
        self
    }

    /// Modules to load once the host is registered.
    pub fn preload(mut self, preload: Vec<PreloadEntry>) -> Self {
        self.preload = preload;
        self
    }

    /// How module references are opened. Defaults to the platform loader.
    pub fn opener(mut self, opener: impl ModuleOpener + 'static) -> Self {
        self.opener = Box::new(opener);
        self
    }

    /// The host's instruction dispatch table.
    pub fn dispatch(mut self, dispatch: impl DispatchTable + 'static) -> Self {
        self.dispatch = Box::new(dispatch);
        self
    }

    /// Source of active devices. Defaults to none.
    pub fn devices(mut self, devices: impl DeviceInventory + 'static) -> Self {
        self.devices = Box::new(devices);
        self
    }

    /// Shutdown hook list. Defaults to the process-wide list.
    pub fn shutdown_hooks(mut self, hooks: Arc<ShutdownHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Register the host, install the termination hook and run the preload
    /// list.
    ///
    /// The host's dependency claims become the reference values of the
    /// ledger. Preload failures are logged and skipped.
    ///
    /// # Errors
    /// [`LoaderError::NoDescriptor`] if the host image has no dependency
    /// hook, [`LoaderError::PathTooLong`] for an oversized module directory,
    /// [`LoaderError::AllocationFailure`] if the host record cannot be stored.
    pub fn initialize(self, host: impl ModuleImage + 'static) -> LoaderResult<Arc<Loader>> {
        let module_dir = match &self.module_dir {
            Some(dir) => ModuleDirectory::pinned(dir)?,
            None => ModuleDirectory::new(),
        };
        module_dir.ensure_discovered();

        let hooks = ModuleHooks::lookup(&host).map_err(|reason| LoaderError::NoDescriptor {
            module: HOST_MODULE_NAME.to_string(),
            reason,
        })?;

        let loader = Arc::new(Loader {
            state: RwLock::new(LoaderState {
                chain: ModuleChain::new(),
                ledger: DependencyLedger::new(),
                dispatch: self.dispatch,
                splices: SpliceStacks::new(),
                quarantine: Vec::new(),
            }),
            opener: self.opener,
            devices: self.devices,
            module_dir,
            hooks: self.hooks,
            equates: RwLock::new(None),
            options: self.options,
            terminated: AtomicBool::new(false),
        });

        {
            let mut state = loader.state.write();
            if let Err(e) = state.check_dependencies(hooks.dependencies, LedgerMode::Record) {
                warn!("host dependency hook reported {e}");
            }
            state.attach(ModuleRecord::new(
                HOST_MODULE_NAME.to_string(),
                Box::new(host),
                hooks,
                ModuleFlags::HOST | ModuleFlags::RESIDENT,
            ))?;
        }
        loader.register_term_hook();
        info!(
            dependencies = loader.dependencies().len(),
            "loader initialised"
        );

        for entry in &self.preload {
            let result = if entry.resident {
                loader.load_resident(&entry.name, entry.flags())
            } else {
                loader.load(&entry.name, entry.flags())
            };
            if result.is_err() {
                debug!(module = %entry.name, "preload skipped");
            }
        }

        Ok(loader)
    }
}
