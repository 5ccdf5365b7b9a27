//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! for the loader binary and for hosts that embed the loader.
//!
//! # Usage
//!
//! ```rust,no_run
//! use modhost_common::config::{ConfigError, ConfigLoader, LoaderConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = LoaderConfig::load(Path::new("modhost.toml"))?;
//!     config.validate()?;
//!     println!("Preloading {} modules", config.preload.len());
//!     Ok(())
//! }
//! ```

use crate::consts::{DEFAULT_DEVICE_MODULE_PREFIX, DEFAULT_PRELOAD, MAX_MODULE_DIR_LEN};
use crate::flags::LoadFlags;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common configuration fields.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "modhost-01"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: "modhost".to_string(),
        }
    }
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// One module to load at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadEntry {
    /// Module reference (short name or path).
    pub name: String,
    /// Suppress the open-failure message.
    #[serde(default)]
    pub quiet: bool,
    /// Load despite a dependency mismatch.
    #[serde(default)]
    pub force: bool,
    /// Mark the module not unloadable.
    #[serde(default)]
    pub resident: bool,
}

impl PreloadEntry {
    /// Quiet, unforced, unloadable entry.
    pub fn quiet(name: &str) -> Self {
        Self {
            name: name.to_string(),
            quiet: true,
            force: false,
            resident: false,
        }
    }

    /// Load flags equivalent to this entry.
    pub fn flags(&self) -> LoadFlags {
        let mut flags = LoadFlags::empty();
        flags.set(LoadFlags::QUIET, self.quiet);
        flags.set(LoadFlags::FORCE, self.force);
        flags
    }
}

fn default_device_module_prefix() -> String {
    DEFAULT_DEVICE_MODULE_PREFIX.to_string()
}

fn default_preload() -> Vec<PreloadEntry> {
    DEFAULT_PRELOAD.iter().map(|name| PreloadEntry::quiet(name)).collect()
}

/// Loader configuration.
///
/// # TOML Example
///
/// ```toml
/// module_dir = "/usr/lib/modhost"
/// close_on_unload = false
///
/// [shared]
/// log_level = "info"
/// service_name = "modhost"
///
/// [[preload]]
/// name = "hdteq"
/// quiet = true
///
/// [[preload]]
/// name = "dyncrypt"
/// quiet = true
/// resident = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Common fields.
    #[serde(default)]
    pub shared: SharedConfig,

    /// Explicit module directory. Pins the directory for the process lifetime.
    #[serde(default)]
    pub module_dir: Option<PathBuf>,

    /// Suffix appended to module references. `None` means the platform
    /// dynamic library suffix, `Some("")` means no suffix.
    #[serde(default)]
    pub module_suffix: Option<String>,

    /// Prefix of device type modules.
    #[serde(default = "default_device_module_prefix")]
    pub device_module_prefix: String,

    /// Really close native handles on unload instead of quarantining them.
    #[serde(default)]
    pub close_on_unload: bool,

    /// Modules loaded at startup, in order.
    #[serde(default = "default_preload")]
    pub preload: Vec<PreloadEntry>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            shared: SharedConfig::default(),
            module_dir: None,
            module_suffix: None,
            device_module_prefix: default_device_module_prefix(),
            close_on_unload: false,
            preload: default_preload(),
        }
    }
}

impl LoaderConfig {
    /// Suffix actually appended to module references.
    pub fn effective_suffix(&self) -> &str {
        self.module_suffix
            .as_deref()
            .unwrap_or(std::env::consts::DLL_SUFFIX)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - the shared section is invalid
    /// - a preload entry has an empty name
    /// - `module_dir` exceeds the maximum path length
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        if let Some(pos) = self.preload.iter().position(|p| p.name.trim().is_empty()) {
            return Err(ConfigError::ValidationError(format!(
                "preload entry {pos} has an empty name"
            )));
        }

        if let Some(dir) = &self.module_dir {
            let len = dir.as_os_str().len();
            if len > MAX_MODULE_DIR_LEN {
                return Err(ConfigError::ValidationError(format!(
                    "module_dir length {len} exceeds maximum {MAX_MODULE_DIR_LEN}"
                )));
            }
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
