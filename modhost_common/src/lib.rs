//! modhost Common Library
//!
//! This crate is linked by the modhost loader AND by every loadable module.
//! It defines the contract both sides must agree on.
//!
//! # Module Structure
//!
//! - [`abi`] - Addresses, lifecycle hook signatures, registration contexts
//! - [`flags`] - Load flags and architecture mode sets
//! - [`consts`] - Lifecycle symbol names and loader defaults
//! - [`config`] - Configuration loading traits and loader configuration
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! A module crate (built as `cdylib`) exports its lifecycle hooks with
//! [`export_hooks!`]:
//!
//! ```rust,ignore
//! use modhost_common::prelude::*;
//!
//! fn dependencies(check: &mut DependencyCheck<'_>) -> Result<(), DependencyMismatch> {
//!     check.require_abi()?;
//!     check.require("core", "1.0", 64)
//! }
//!
//! fn register(reg: &mut EntryRegistrar<'_>) {
//!     reg.entry("panel_command", Address::from_ptr(panel_command as *const ()));
//! }
//!
//! fn panel_command(_cmd: &str) {}
//!
//! modhost_common::export_hooks! {
//!     dependencies: dependencies,
//!     register: register,
//! }
//! ```

pub mod abi;
pub mod config;
pub mod consts;
pub mod flags;
pub mod prelude;
