//! Lifecycle symbol names and loader defaults.

/// Symbol of the mandatory dependency hook.
pub const SYM_DEPENDENCIES: &str = "modhost_dependencies";
/// Symbol of the entry point registration hook.
pub const SYM_REGISTER: &str = "modhost_register";
/// Symbol of the resolver hook.
pub const SYM_RESOLVE: &str = "modhost_resolve";
/// Symbol of the device declaration hook.
pub const SYM_DEVICES: &str = "modhost_devices";
/// Symbol of the instruction declaration hook.
pub const SYM_INSTRUCTIONS: &str = "modhost_instructions";
/// Symbol of the finalize hook.
pub const SYM_FINALIZE: &str = "modhost_finalize";

/// Display name of the host program's own module record.
pub const HOST_MODULE_NAME: &str = "*Host";

/// Name under which the loader registers its termination routine.
pub const LOADER_TERM_HOOK: &str = "loader_term";

/// Environment variable naming the module directory.
pub const MODULE_DIR_ENV: &str = "MODHOST_LIB";

/// Module directory fixed at build time, if any.
pub const BUILD_MODULE_DIR: Option<&str> = option_env!("MODHOST_MODULES_DIR");

/// Install-relative module directory (relative to the executable directory).
pub const INSTALL_RELATIVE_MODULE_DIR: &str = "../lib/modhost";

/// Build-relative module directory (relative to the executable directory).
pub const BUILD_RELATIVE_MODULE_DIR: &str = "modules";

/// Longest accepted module directory, in bytes.
pub const MAX_MODULE_DIR_LEN: usize = 4096;

/// Prefix of the module that implements a device type.
pub const DEFAULT_DEVICE_MODULE_PREFIX: &str = "hdt";

/// Modules loaded at startup when no configuration overrides the list.
pub const DEFAULT_PRELOAD: &[&str] = &["hdteq", "dyncrypt"];

/// Version of the module ABI, claimed by the host and by every module.
pub const ABI_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Ledger name of the module ABI descriptor.
pub const ABI_DESCRIPTOR: &str = "MODHOST_ABI";
