//! Loader integration tests.
//!
//! Modules are in-process [`StaticImage`]s served by a [`StaticCatalog`], so
//! the full load/resolve/unload protocol runs without building shared
//! libraries. Every module uses its own dependency hook: two modules with the
//! same hook address would be rejected as duplicates.

use modhost::{
    ActiveDevice, DeviceList, Loader, LoaderError, LoaderOptions, OpcodeTable, ShutdownHooks,
    StaticCatalog, StaticImage,
};
use modhost_common::config::PreloadEntry;
use modhost_common::consts::{HOST_MODULE_NAME, LOADER_TERM_HOOK, SYM_DEPENDENCIES};
use modhost_common::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

// ─── Fixtures ───────────────────────────────────────────────────────

const HOST_SVC: Address = Address::from_raw(0x10);
const M1_FOO: Address = Address::from_raw(0x1100);
const HOOK_A: Address = Address::from_raw(0x2A00);
const HOOK_B: Address = Address::from_raw(0x2B00);
const SVC: Address = Address::from_raw(0x3300);
const DEVICE_3270: Address = Address::from_raw(0x4270);
const BUILTIN_E3: Address = Address::from_raw(0x5E30);
const PROBE: Address = Address::from_raw(0x5E31);
const FALLBACK: Address = Address::from_raw(0xBAD);

fn host_dependencies(check: &mut DependencyCheck<'_>) -> Result<(), DependencyMismatch> {
    check.require("HOST", "1", 8)
}

fn host_register(reg: &mut EntryRegistrar<'_>) {
    reg.entry("host_svc", HOST_SVC);
    reg.entry("panel_command_hook", Address::NULL);
}

fn host() -> StaticImage {
    StaticImage::new()
        .dependencies(host_dependencies)
        .register(host_register)
}

fn options() -> LoaderOptions {
    LoaderOptions {
        module_suffix: String::new(),
        device_module_prefix: "hdt".to_string(),
        close_on_unload: false,
    }
}

fn loader(catalog: StaticCatalog) -> Arc<Loader> {
    Loader::builder()
        .options(options())
        .opener(catalog)
        .dispatch(OpcodeTable::new(FALLBACK).with_routine(ArchModes::ZARCH, 0xE300, BUILTIN_E3))
        .shutdown_hooks(Arc::new(ShutdownHooks::new()))
        .initialize(host())
        .unwrap()
}

// M1: core 1.0/64, exports foo.
fn m1_dependencies(check: &mut DependencyCheck<'_>) -> Result<(), DependencyMismatch> {
    check.require("core", "1.0", 64)
}

fn m1_register(reg: &mut EntryRegistrar<'_>) {
    reg.entry("foo", M1_FOO);
}

fn m1() -> StaticImage {
    StaticImage::new().dependencies(m1_dependencies).register(m1_register)
}

// M2: core 1.1/64, no entries.
fn m2_dependencies(check: &mut DependencyCheck<'_>) -> Result<(), DependencyMismatch> {
    check.require("core", "1.1", 64)
}

fn m2() -> StaticImage {
    StaticImage::new().dependencies(m2_dependencies)
}

// Hook providers A and B, both exporting "hook".
fn a_dependencies(check: &mut DependencyCheck<'_>) -> Result<(), DependencyMismatch> {
    check.require("hooks_a", "1", 1)
}

fn a_register(reg: &mut EntryRegistrar<'_>) {
    reg.entry("hook", HOOK_A);
}

fn b_dependencies(check: &mut DependencyCheck<'_>) -> Result<(), DependencyMismatch> {
    check.require("hooks_b", "1", 2)
}

fn b_register(reg: &mut EntryRegistrar<'_>) {
    reg.entry("hook", HOOK_B);
}

// Device module serving 3270, with an instruction.
fn dev_dependencies(check: &mut DependencyCheck<'_>) -> Result<(), DependencyMismatch> {
    check.require("devblk", "4.2", 512)
}

fn dev_register(reg: &mut EntryRegistrar<'_>) {
    reg.entry("tn3270_hook", Address::from_raw(0x4271));
}

fn dev_devices(reg: &mut DeviceRegistrar<'_>) {
    reg.device("3270", DEVICE_3270);
}

fn dev_instructions(reg: &mut InstructionRegistrar<'_>) {
    reg.instruction(ArchModes::ZARCH | ArchModes::ESA390, 0xE3, "probe", PROBE);
}

fn dev_finalize() -> Result<(), i32> {
    Ok(())
}

fn refusing_finalize() -> Result<(), i32> {
    Err(4)
}

fn device_module() -> StaticImage {
    StaticImage::new()
        .dependencies(dev_dependencies)
        .register(dev_register)
        .devices(dev_devices)
        .instructions(dev_instructions)
        .finalize(dev_finalize)
}

// ─── Load ───────────────────────────────────────────────────────────

#[test]
fn test_end_to_end_mismatch_then_forced_load() {
    let loader = loader(StaticCatalog::new().with_module("m1", m1()).with_module("m2", m2()));

    loader.load("m1", LoadFlags::empty()).unwrap();
    assert_eq!(loader.find_entry("foo"), Some(M1_FOO));

    let err = loader.load("m2", LoadFlags::empty()).unwrap_err();
    match &err {
        LoaderError::DependencyMismatch { module, mismatch } => {
            assert_eq!(module, "m2");
            assert_eq!(
                *mismatch,
                DependencyMismatch::Version {
                    name: "core".into(),
                    claimed: "1.1".into(),
                    recorded: "1.0".into(),
                }
            );
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(!loader.is_loaded("m2"));

    loader.load("m2", LoadFlags::FORCE).unwrap();
    let listing = loader.list(false);
    assert_eq!(listing[0].name, "m2");
    assert!(listing[0].forced);
    assert!(listing[0].unloadable, "forced modules stay unloadable");
    assert_eq!(loader.find_entry("foo"), Some(M1_FOO));

    // Forcing does not weaken the ledger.
    let core: Vec<_> = loader.dependencies().into_iter().filter(|d| d.name == "core").collect();
    assert_eq!(core.len(), 1);
    assert_eq!(core[0].version, "1.0");

    loader.unload("m2").unwrap();
}

#[test]
fn test_successful_load_grows_chain_by_one() {
    let loader = loader(
        StaticCatalog::new()
            .with_module("m1", m1())
            .with_module("hooks/a", StaticImage::new().dependencies(a_dependencies).register(a_register)),
    );
    let modules = loader.module_names().len();
    let deps = loader.dependencies().len();

    loader.load("m1", LoadFlags::empty()).unwrap();
    assert_eq!(loader.module_names().len(), modules + 1);
    assert_eq!(loader.dependencies().len(), deps + 1);

    loader.load("hooks/a", LoadFlags::empty()).unwrap();
    assert_eq!(loader.module_names(), vec!["a", "m1", HOST_MODULE_NAME]);
}

#[test]
fn test_duplicate_short_name_rejected_regardless_of_path() {
    let loader = loader(
        StaticCatalog::new()
            .with_module("one/a", StaticImage::new().dependencies(a_dependencies))
            .with_module("two/a", StaticImage::new().dependencies(b_dependencies)),
    );
    loader.load("one/a", LoadFlags::empty()).unwrap();
    let err = loader.load("two/a", LoadFlags::empty()).unwrap_err();
    assert!(matches!(err, LoaderError::DuplicateModule { ref module } if module == "a"));
    assert_eq!(loader.module_names().len(), 2);
}

#[test]
fn test_same_content_under_two_names_rejected() {
    let image = StaticImage::new().dependencies(a_dependencies);
    let loader = loader(
        StaticCatalog::new()
            .with_module("first", image.clone())
            .with_module("second", image),
    );
    loader.load("first", LoadFlags::empty()).unwrap();
    let err = loader.load("second", LoadFlags::empty()).unwrap_err();
    assert!(matches!(
        err,
        LoaderError::DuplicateDescriptor { ref module, ref existing } if module == "second" && existing == "first"
    ));
}

#[test]
fn test_missing_descriptor_and_open_failures() {
    let null_hook = StaticImage::new()
        .with_symbol(SYM_DEPENDENCIES, Address::NULL)
        .register(a_register);
    let loader = loader(
        StaticCatalog::new()
            .with_module("bare", StaticImage::new().register(a_register))
            .with_module("null_hook", null_hook),
    );
    let deps = loader.dependencies();

    let err = loader.load("bare", LoadFlags::empty()).unwrap_err();
    assert_eq!(err.code(), "MH-03");
    let err = loader.load("null_hook", LoadFlags::empty()).unwrap_err();
    assert_eq!(err.code(), "MH-03");

    let err = loader.load("absent", LoadFlags::QUIET).unwrap_err();
    assert!(matches!(err, LoaderError::OpenFailed { ref module, .. } if module == "absent"));

    assert_eq!(loader.module_names(), vec![HOST_MODULE_NAME]);
    assert_eq!(loader.dependencies(), deps);
}

#[test]
fn test_module_directory_retry_only_for_bare_names() {
    let dir = tempfile::TempDir::new().unwrap();
    let canonical = std::fs::canonicalize(dir.path()).unwrap();
    let catalog = StaticCatalog::new()
        .with_module(canonical.join("m1"), m1())
        .with_module(canonical.join("m2"), m2());
    let loader = Loader::builder()
        .options(options())
        .module_dir(dir.path())
        .opener(catalog)
        .shutdown_hooks(Arc::new(ShutdownHooks::new()))
        .initialize(host())
        .unwrap();

    assert_eq!(loader.module_dir(), Some(canonical.clone()));
    loader.load("m1", LoadFlags::empty()).unwrap();

    // A reference with a directory component is not retried.
    let err = loader.load("elsewhere/m2", LoadFlags::QUIET).unwrap_err();
    assert_eq!(err.code(), "MH-02");

    // The pinned directory survives a runtime change.
    let other = tempfile::TempDir::new().unwrap();
    assert_eq!(loader.set_module_dir(other.path()).unwrap(), canonical);
}

#[test]
fn test_preload_marks_resident_and_skips_missing() {
    let loader = Loader::builder()
        .options(options())
        .opener(StaticCatalog::new().with_module("m1", m1()))
        .preload(vec![
            PreloadEntry::quiet("hdteq"),
            PreloadEntry { name: "m1".into(), quiet: false, force: false, resident: true },
        ])
        .shutdown_hooks(Arc::new(ShutdownHooks::new()))
        .initialize(host())
        .unwrap();

    assert_eq!(loader.module_names(), vec!["m1", HOST_MODULE_NAME]);
    let err = loader.unload("m1").unwrap_err();
    assert!(matches!(err, LoaderError::Protected { .. }));
}

#[test]
fn test_host_without_dependency_hook_fails_initialisation() {
    let result = Loader::builder()
        .options(options())
        .opener(StaticCatalog::new())
        .shutdown_hooks(Arc::new(ShutdownHooks::new()))
        .initialize(StaticImage::new().register(host_register));
    match result {
        Err(LoaderError::NoDescriptor { module, .. }) => assert_eq!(module, HOST_MODULE_NAME),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("host without dependency hook accepted"),
    }
}

// ─── Entry points ───────────────────────────────────────────────────

#[test]
fn test_find_entry_prefers_newest_and_find_next_chains() {
    let loader = loader(
        StaticCatalog::new()
            .with_module("a", StaticImage::new().dependencies(a_dependencies).register(a_register))
            .with_module("b", StaticImage::new().dependencies(b_dependencies).register(b_register)),
    );
    loader.load("a", LoadFlags::empty()).unwrap();
    loader.load("b", LoadFlags::empty()).unwrap();

    let first = loader.find_entry("hook").unwrap();
    assert_eq!(first, HOOK_B);
    let second = loader.find_next(first).unwrap();
    assert_eq!(second, HOOK_A);
    assert_eq!(loader.find_next(second), None);

    assert_eq!(loader.find_entry("host_svc"), Some(HOST_SVC));
    assert_eq!(loader.find_entry("panel_command_hook"), None);
    assert_eq!(loader.find_entry("never_registered"), None);
}

#[test]
fn test_raw_symbol_fallback_synthesizes_entry() {
    let image = StaticImage::new()
        .dependencies(a_dependencies)
        .with_symbol("exported_only", Address::from_raw(0x7700));
    let loader = loader(StaticCatalog::new().with_module("a", image));
    loader.load("a", LoadFlags::empty()).unwrap();

    assert_eq!(loader.find_entry("exported_only"), Some(Address::from_raw(0x7700)));
    let module = &loader.list(false)[0];
    let entry = module.entries.iter().find(|e| e.name == "exported_only").unwrap();
    assert_eq!(entry.count, 1);
}

static IMPORTED_SVC: AtomicUsize = AtomicUsize::new(usize::MAX);

fn consumer_dependencies(check: &mut DependencyCheck<'_>) -> Result<(), DependencyMismatch> {
    check.require("consumer", "1", 3)
}

fn consumer_resolve(resolver: &mut Resolver<'_>) {
    let svc = resolver.find("svc").unwrap_or(Address::NULL);
    IMPORTED_SVC.store(svc.raw(), Ordering::SeqCst);
}

fn provider_dependencies(check: &mut DependencyCheck<'_>) -> Result<(), DependencyMismatch> {
    check.require("provider", "1", 4)
}

fn provider_register(reg: &mut EntryRegistrar<'_>) {
    reg.entry("svc", SVC);
}

#[test]
fn test_resolvers_rerun_on_every_topology_change() {
    let loader = loader(
        StaticCatalog::new()
            .with_module(
                "consumer",
                StaticImage::new().dependencies(consumer_dependencies).resolve(consumer_resolve),
            )
            .with_module(
                "provider",
                StaticImage::new().dependencies(provider_dependencies).register(provider_register),
            ),
    );

    loader.load("consumer", LoadFlags::empty()).unwrap();
    assert_eq!(IMPORTED_SVC.load(Ordering::SeqCst), 0);

    loader.load("provider", LoadFlags::empty()).unwrap();
    assert_eq!(IMPORTED_SVC.load(Ordering::SeqCst), SVC.raw());

    // Counts restart after each topology change: the resolver's lookup is
    // the only use since the last load.
    let provider = loader.list(false).into_iter().find(|m| m.name == "provider").unwrap();
    assert_eq!(provider.entries[0].count, 1);

    loader.unload("provider").unwrap();
    assert_eq!(IMPORTED_SVC.load(Ordering::SeqCst), 0);
}

// ─── Unload ─────────────────────────────────────────────────────────

#[test]
fn test_unload_host_is_protected() {
    let loader = loader(StaticCatalog::new());
    let err = loader.unload(HOST_MODULE_NAME).unwrap_err();
    assert!(matches!(err, LoaderError::Protected { .. }));
    assert_eq!(loader.module_names(), vec![HOST_MODULE_NAME]);

    let err = loader.unload("nothing").unwrap_err();
    assert_eq!(err.code(), "MH-07");
}

#[test]
fn test_resident_load_is_protected() {
    let loader = loader(StaticCatalog::new().with_module("m1", m1()));
    loader.load_resident("m1", LoadFlags::empty()).unwrap();
    assert!(matches!(loader.unload("m1"), Err(LoaderError::Protected { .. })));
    assert!(loader.is_loaded("m1"));
}

#[test]
fn test_device_in_use_blocks_unload_without_teardown() {
    let devices = Arc::new(DeviceList::new());
    let loader = Loader::builder()
        .options(options())
        .opener(StaticCatalog::new().with_module("hdt3270", device_module()))
        .dispatch(OpcodeTable::new(FALLBACK).with_routine(ArchModes::ZARCH, 0xE300, BUILTIN_E3))
        .devices(Arc::clone(&devices))
        .shutdown_hooks(Arc::new(ShutdownHooks::new()))
        .initialize(host())
        .unwrap();

    loader.load("hdt3270", LoadFlags::empty()).unwrap();
    devices.attach(ActiveDevice { lcss: 0, devnum: 0x0A80, handler: DEVICE_3270 });

    let err = loader.unload("hdt3270").unwrap_err();
    assert!(matches!(err, LoaderError::DeviceInUse { lcss: 0, devnum: 0x0A80, .. }));
    assert!(err.to_string().contains("0:0A80"));

    // Nothing was torn down.
    assert_eq!(loader.find_device("3270"), Some(DEVICE_3270));
    assert_eq!(loader.find_entry("tn3270_hook"), Some(Address::from_raw(0x4271)));
    assert_eq!(loader.dispatch_routine(ArchModes::ZARCH, 0xE300), PROBE);

    assert!(devices.detach(0, 0x0A80));
    loader.unload("hdt3270").unwrap();
    assert_eq!(loader.find_device("3270"), None);
}

#[test]
fn test_finalize_refusal_keeps_module() {
    let image = device_module().finalize(refusing_finalize);
    let loader = loader(StaticCatalog::new().with_module("hdt3270", image));
    loader.load("hdt3270", LoadFlags::empty()).unwrap();

    let err = loader.unload("hdt3270").unwrap_err();

    assert!(matches!(err, LoaderError::FinalizeRefused { code: 4, .. }));
    assert!(loader.is_loaded("hdt3270"));
    assert_eq!(loader.find_device("3270"), Some(DEVICE_3270));
}

#[test]
fn test_instruction_splice_is_undone_exactly() {
    let loader = loader(StaticCatalog::new().with_module("hdt3270", device_module()));
    let before_z = loader.dispatch_routine(ArchModes::ZARCH, 0xE300);
    let before_esa = loader.dispatch_routine(ArchModes::ESA390, 0xE300);
    assert_eq!(before_z, BUILTIN_E3);
    assert_eq!(before_esa, FALLBACK);

    loader.load("hdt3270", LoadFlags::empty()).unwrap();
    assert_eq!(loader.dispatch_routine(ArchModes::ZARCH, 0xE300), PROBE);
    assert_eq!(loader.dispatch_routine(ArchModes::ESA390, 0xE300), PROBE);
    assert_eq!(loader.dispatch_routine(ArchModes::S370, 0xE300), FALLBACK);

    let listing = loader.list(false);
    assert_eq!(listing[0].instructions[0].opcode, 0xE300);
    assert_eq!(listing[0].instructions[0].modes, vec!["ESA/390", "z/Arch"]);

    loader.unload("hdt3270").unwrap();
    assert_eq!(loader.dispatch_routine(ArchModes::ZARCH, 0xE300), before_z);
    assert_eq!(loader.dispatch_routine(ArchModes::ESA390, 0xE300), before_esa);
}

#[test]
fn test_unloaded_images_are_quarantined_unless_configured() {
    let loader_keep = loader(StaticCatalog::new().with_module("m1", m1()));
    loader_keep.load("m1", LoadFlags::empty()).unwrap();
    loader_keep.unload("m1").unwrap();
    assert_eq!(loader_keep.quarantined(), vec!["m1"]);
    assert!(!loader_keep.is_loaded("m1"));

    // A quarantined module can be loaded again.
    loader_keep.load("m1", LoadFlags::empty()).unwrap();

    let loader_close = Loader::builder()
        .options(LoaderOptions { close_on_unload: true, ..options() })
        .opener(StaticCatalog::new().with_module("m1", m1()))
        .shutdown_hooks(Arc::new(ShutdownHooks::new()))
        .initialize(host())
        .unwrap();
    loader_close.load("m1", LoadFlags::empty()).unwrap();
    loader_close.unload("m1").unwrap();
    assert!(loader_close.quarantined().is_empty());
}

// ─── Devices ────────────────────────────────────────────────────────

#[test]
fn test_device_handler_loads_module_on_demand() {
    let loader = loader(StaticCatalog::new().with_module("hdt3270", device_module()));
    assert_eq!(loader.find_device("3270"), None);
    assert_eq!(loader.device_handler("3270"), Some(DEVICE_3270));
    assert!(loader.is_loaded("hdt3270"));
    assert_eq!(loader.device_handler("3420"), None);
}

fn sysg_dependencies(check: &mut DependencyCheck<'_>) -> Result<(), DependencyMismatch> {
    check.require("devblk_sysg", "4.2", 512)
}

fn sysg_devices(reg: &mut DeviceRegistrar<'_>) {
    reg.device("3270", DEVICE_3270);
    reg.device("SYSG", Address::from_raw(0x4999));
}

#[test]
fn test_device_handler_uses_equates() {
    let image = StaticImage::new().dependencies(sysg_dependencies).devices(sysg_devices);
    let loader = loader(StaticCatalog::new().with_module("hdt3270", image));
    assert_eq!(loader.device_handler("sysg"), None);

    loader.set_device_equates(|t| t.eq_ignore_ascii_case("sysg").then(|| "3270".to_string()));
    assert_eq!(loader.device_handler("sysg"), Some(Address::from_raw(0x4999)));
    // The equated module is now loaded; the lookup must still succeed.
    assert_eq!(loader.device_handler("sysg"), Some(Address::from_raw(0x4999)));
}

const DEVICE_3420: Address = Address::from_raw(0x4420);

fn tape_dependencies(check: &mut DependencyCheck<'_>) -> Result<(), DependencyMismatch> {
    check.require("devblk_tape", "4.2", 512)
}

fn tape_devices(reg: &mut DeviceRegistrar<'_>) {
    reg.device("3420", DEVICE_3420);
}

#[test]
fn test_equated_type_falls_back_to_equated_handler() {
    let image = StaticImage::new().dependencies(tape_dependencies).devices(tape_devices);
    let loader = loader(StaticCatalog::new().with_module("hdt3420", image));
    loader.set_device_equates(|t| (t == "3480").then(|| "3420".to_string()));

    let first = loader.device_handler("3480");
    let second = loader.device_handler("3480");
    assert_eq!(first, Some(DEVICE_3420));
    assert_eq!(first, second);
    assert_eq!(loader.module_names().iter().filter(|m| *m == "hdt3420").count(), 1);
}

// ─── Listing and shutdown ───────────────────────────────────────────

#[test]
fn test_listing_hides_unresolved_host_entries() {
    let loader = loader(StaticCatalog::new());
    let host = &loader.list(false)[0];
    assert_eq!(host.name, HOST_MODULE_NAME);
    assert!(host.host && !host.unloadable);
    assert!(host.entries.iter().all(|e| e.resolved));

    let host = &loader.list(true)[0];
    assert!(host.entries.iter().any(|e| e.name == "panel_command_hook" && !e.resolved));

    let deps = loader.dependencies();
    assert_eq!((deps[0].name.as_str(), deps[0].version.as_str(), deps[0].size), ("HOST", "1", 8));
}

static TERMINATED: AtomicUsize = AtomicUsize::new(0);

fn term_dependencies(check: &mut DependencyCheck<'_>) -> Result<(), DependencyMismatch> {
    check.require("term", "1", 5)
}

fn term_finalize() -> Result<(), i32> {
    TERMINATED.fetch_add(1, Ordering::SeqCst);
    Err(1)
}

fn late_hook(_arg: usize) {
    panic!("hook registered during shutdown must not run");
}

#[test]
fn test_loader_term_runs_finalizers_once() {
    let hooks = Arc::new(ShutdownHooks::new());
    let loader = Loader::builder()
        .options(options())
        .opener(StaticCatalog::new().with_module(
            "term",
            StaticImage::new().dependencies(term_dependencies).finalize(term_finalize),
        ))
        .shutdown_hooks(Arc::clone(&hooks))
        .initialize(host())
        .unwrap();
    loader.load("term", LoadFlags::empty()).unwrap();
    assert_eq!(hooks.names(), vec![LOADER_TERM_HOOK]);

    hooks.run();
    assert_eq!(TERMINATED.load(Ordering::SeqCst), 1);
    assert!(!hooks.register("late", late_hook, 0));
    hooks.run();
    loader.terminate();
    assert_eq!(TERMINATED.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dropping_loader_unregisters_term_hook() {
    let hooks = Arc::new(ShutdownHooks::new());
    let loader = Loader::builder()
        .options(options())
        .opener(StaticCatalog::new())
        .shutdown_hooks(Arc::clone(&hooks))
        .initialize(host())
        .unwrap();
    assert_eq!(hooks.len(), 1);
    drop(loader);
    assert!(hooks.is_empty());
}
