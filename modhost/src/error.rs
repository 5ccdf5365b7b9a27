//! Loader error taxonomy.
//!
//! Every variant carries a stable diagnostic identifier (see
//! [`LoaderError::code`]) which also prefixes its Display text, so log
//! scrapers can match on the code regardless of wording.

use modhost_common::abi::DependencyMismatch;
use thiserror::Error;

/// Errors returned by load, unload and initialisation.
#[derive(Debug, Clone, Error)]
pub enum LoaderError {
    /// A module with the same short name is already loaded.
    #[error("MH-01: module '{module}' is already loaded")]
    DuplicateModule {
        /// Short name of the rejected module.
        module: String,
    },

    /// The platform loader could not open the module.
    #[error("MH-02: unable to open module '{module}': {reason}")]
    OpenFailed {
        /// Module reference as given by the caller.
        module: String,
        /// Platform loader diagnostic.
        reason: String,
    },

    /// The module does not export the mandatory dependency hook.
    #[error("MH-03: module '{module}' has no dependency section: {reason}")]
    NoDescriptor {
        /// Short name of the module.
        module: String,
        /// Platform loader diagnostic.
        reason: String,
    },

    /// The module's dependency hook is already owned by a loaded module.
    #[error("MH-04: module '{module}' is a duplicate of loaded module '{existing}'")]
    DuplicateDescriptor {
        /// Short name of the rejected module.
        module: String,
        /// Short name of the loaded module with the same content.
        existing: String,
    },

    /// The dependency check failed and the load was not forced.
    #[error("MH-05: dependency check failed for module '{module}': {mismatch}")]
    DependencyMismatch {
        /// Short name of the rejected module.
        module: String,
        /// First conflicting claim.
        mismatch: DependencyMismatch,
    },

    /// Memory for a loader record could not be reserved.
    #[error("MH-06: unable to allocate {what}")]
    AllocationFailure {
        /// What was being allocated.
        what: String,
    },

    /// No loaded module has that name.
    #[error("MH-07: module '{module}' not found")]
    NotFound {
        /// Short name that was looked up.
        module: String,
    },

    /// The module is the host record or flagged not unloadable.
    #[error("MH-08: module '{module}' is not unloadable")]
    Protected {
        /// Short name of the module.
        module: String,
    },

    /// An active device is still served by a handler of the module.
    #[error("MH-09: module '{module}' bound to device {lcss}:{devnum:04X}")]
    DeviceInUse {
        /// Short name of the module.
        module: String,
        /// Logical channel subsystem of the device.
        lcss: u8,
        /// Device number.
        devnum: u16,
    },

    /// The module's finalize hook refused the unload.
    #[error("MH-10: module '{module}' cleanup failed (code {code})")]
    FinalizeRefused {
        /// Short name of the module.
        module: String,
        /// Code returned by the finalize hook.
        code: i32,
    },

    /// A module directory path is too long.
    #[error("MH-11: module directory length {len} exceeds maximum {max}")]
    PathTooLong {
        /// Length of the rejected path in bytes.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },
}

impl LoaderError {
    /// Stable diagnostic identifier of the failure kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateModule { .. } => "MH-01",
            Self::OpenFailed { .. } => "MH-02",
            Self::NoDescriptor { .. } => "MH-03",
            Self::DuplicateDescriptor { .. } => "MH-04",
            Self::DependencyMismatch { .. } => "MH-05",
            Self::AllocationFailure { .. } => "MH-06",
            Self::NotFound { .. } => "MH-07",
            Self::Protected { .. } => "MH-08",
            Self::DeviceInUse { .. } => "MH-09",
            Self::FinalizeRefused { .. } => "MH-10",
            Self::PathTooLong { .. } => "MH-11",
        }
    }
}

/// Result alias for loader operations.
pub type LoaderResult<T> = Result<T, LoaderError>;
