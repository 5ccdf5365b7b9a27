//! Sample loadable module.
//!
//! Exports every lifecycle hook: claims the module ABI, registers an entry
//! point, imports the host's version routine, serves the `SAMPLE` device
//! type and splices one z/Architecture instruction.
//!
//! ```bash
//! cargo build -p modhost_sample
//! modhost --module-dir target/debug --load libmodhost_sample --list
//! ```

use modhost_common::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Opcode of the sample instruction.
pub const SAMPLE_OPCODE: u16 = 0xE3FF;

/// Device type served by this module.
pub const SAMPLE_DEVICE: &str = "SAMPLE";

static HOST_VERSION: AtomicUsize = AtomicUsize::new(0);

fn dependencies(check: &mut DependencyCheck<'_>) -> Result<(), DependencyMismatch> {
    check.require_abi()
}

fn register(reg: &mut EntryRegistrar<'_>) {
    reg.entry("sample_hello", Address::from_ptr(sample_hello as *const ()));
}

fn resolve(resolver: &mut Resolver<'_>) {
    let address = resolver.find("host_version").unwrap_or(Address::NULL);
    HOST_VERSION.store(address.raw(), Ordering::Release);
}

fn devices(reg: &mut DeviceRegistrar<'_>) {
    reg.device(SAMPLE_DEVICE, Address::from_ptr(sample_device as *const ()));
}

fn instructions(reg: &mut InstructionRegistrar<'_>) {
    reg.instruction(
        ArchModes::ZARCH,
        SAMPLE_OPCODE,
        "sample_probe",
        Address::from_ptr(sample_probe as *const ()),
    );
}

fn finalize() -> Result<(), i32> {
    HOST_VERSION.store(0, Ordering::Release);
    Ok(())
}

/// Greeting naming the host version the module resolved, if any.
pub fn sample_hello() -> String {
    let address = Address::from_raw(HOST_VERSION.load(Ordering::Acquire));
    if address.is_null() {
        return "sample module (host version unknown)".to_string();
    }
    // SAFETY: the host registers `host_version` as `fn() -> &'static str`
    // and claims that signature in its dependency hook.
    let host_version: fn() -> &'static str = unsafe { address.cast() };
    format!("sample module on host {}", host_version())
}

fn sample_device() {}

fn sample_probe() {}

modhost_common::export_hooks! {
    dependencies: dependencies,
    register: register,
    resolve: resolve,
    devices: devices,
    instructions: instructions,
    finalize: finalize,
}
