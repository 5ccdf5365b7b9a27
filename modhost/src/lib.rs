//! # modhost Loader Library
//!
//! Runtime module loader: opens shared libraries at run time, checks that
//! they were built against the same shared structures as the host, lets
//! them contribute entry points, device handlers and instruction routines,
//! and unloads them again.
//!
//! # Module Structure
//!
//! - [`loader`] - [`Loader`] orchestration: initialise, load, unload, lookups
//! - [`registry`] - Module records and the module chain
//! - [`ledger`] - Dependency ledger
//! - [`entry`] - Entry point table and cross-module resolution
//! - [`device`] - Device handler registry and device inventory
//! - [`instruction`] - Instruction bindings and dispatch table splicing
//! - [`shutdown`] - Shutdown hook list
//! - [`module_dir`] - Module directory discovery
//! - [`image`] / [`native`] - Module images and the platform loader
//! - [`listing`] - Serializable table snapshots
//! - [`error`] - Error taxonomy
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                           Loader                                  │
//! │  ┌──────────────┐   ┌───────────────────────┐   ┌──────────────┐  │
//! │  │ ModuleOpener │──►│ ModuleChain (newest   │◄─►│ Dependency   │  │
//! │  │ (dlopen /    │   │ first): entries,      │   │ Ledger       │  │
//! │  │  static)     │   │ devices, instructions │   └──────────────┘  │
//! │  └──────────────┘   └──────────┬────────────┘                     │
//! │                                │ splice / unsplice                │
//! │                                ▼                                  │
//! │                    ┌───────────────────────┐                      │
//! │                    │ DispatchTable (host)  │                      │
//! │                    └───────────────────────┘                      │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]

pub mod device;
pub mod entry;
pub mod error;
pub mod image;
pub mod instruction;
pub mod ledger;
pub mod listing;
pub mod loader;
pub mod module_dir;
pub mod native;
pub mod registry;
pub mod shutdown;

// Re-export key types for convenience
pub use crate::device::{ActiveDevice, DeviceInventory, DeviceList, NoDevices};
pub use crate::error::{LoaderError, LoaderResult};
pub use crate::image::{ModuleImage, ModuleOpener, StaticCatalog, StaticImage};
pub use crate::instruction::{DispatchTable, OpcodeTable};
pub use crate::loader::{Loader, LoaderBuilder, LoaderOptions};
pub use crate::native::{NativeLibrary, NativeOpener};
pub use crate::shutdown::ShutdownHooks;
