//! Module directory discovery and the runtime accessor.
//!
//! Discovery order, first hit wins:
//! 1. `MODHOST_LIB` environment variable
//! 2. directory fixed at build time (`MODHOST_MODULES_DIR`)
//! 3. `<exe dir>/../lib/modhost`
//! 4. `<exe dir>/modules`
//! 5. the executable's directory
//! 6. the current directory
//!
//! An explicit directory given at startup pins the directory; later runtime
//! changes are refused with a warning.

use crate::error::{LoaderError, LoaderResult};
use modhost_common::consts::{
    BUILD_MODULE_DIR, BUILD_RELATIVE_MODULE_DIR, INSTALL_RELATIVE_MODULE_DIR, MAX_MODULE_DIR_LEN,
    MODULE_DIR_ENV,
};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Who is setting the module directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirOrigin {
    /// Command line or configuration at startup. Pins the directory.
    Startup,
    /// Operator command at run time.
    Runtime,
}

#[derive(Debug, Default)]
struct DirState {
    path: Option<PathBuf>,
    pinned: bool,
}

/// The current module directory.
#[derive(Debug, Default)]
pub struct ModuleDirectory {
    state: Mutex<DirState>,
}

impl ModuleDirectory {
    /// No directory set yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory pinned at startup.
    ///
    /// # Errors
    /// [`LoaderError::PathTooLong`] if the path exceeds the maximum length.
    pub fn pinned(path: &Path) -> LoaderResult<Self> {
        let dir = Self::new();
        dir.set(path, DirOrigin::Startup)?;
        Ok(dir)
    }

    /// Current directory, if any.
    pub fn get(&self) -> Option<PathBuf> {
        self.state.lock().path.clone()
    }

    /// Returns `true` if the directory was fixed at startup.
    pub fn is_pinned(&self) -> bool {
        self.state.lock().pinned
    }

    /// Change the directory and return the directory now in effect.
    ///
    /// A runtime change of a pinned directory is refused: the pinned
    /// directory stays and is returned.
    ///
    /// # Errors
    /// [`LoaderError::PathTooLong`] if the path exceeds the maximum length.
    pub fn set(&self, path: &Path, origin: DirOrigin) -> LoaderResult<PathBuf> {
        let len = path.as_os_str().len();
        if len > MAX_MODULE_DIR_LEN {
            return Err(LoaderError::PathTooLong {
                len,
                max: MAX_MODULE_DIR_LEN,
            });
        }

        let mut state = self.state.lock();
        if origin == DirOrigin::Runtime && state.pinned {
            let current = state.path.clone().unwrap_or_default();
            warn!(
                "module directory {} ignored; directory {} was set at startup",
                path.display(),
                current.display()
            );
            return Ok(current);
        }

        let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        info!("module directory set to {}", resolved.display());
        state.path = Some(resolved.clone());
        if origin == DirOrigin::Startup {
            state.pinned = true;
        }
        Ok(resolved)
    }

    /// Set the discovered directory unless one is already set.
    pub fn ensure_discovered(&self) -> Option<PathBuf> {
        if let Some(path) = self.get() {
            return Some(path);
        }
        let found = discover_module_dir()?;
        self.set(&found, DirOrigin::Runtime).ok()
    }
}

/// Discover the module directory from the environment and executable location.
pub fn discover_module_dir() -> Option<PathBuf> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    discover_from(std::env::var_os(MODULE_DIR_ENV), BUILD_MODULE_DIR, exe_dir)
}

fn discover_from(
    env_dir: Option<OsString>,
    build_dir: Option<&str>,
    exe_dir: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(dir) = env_dir.filter(|d| !d.is_empty()).map(PathBuf::from) {
        if dir.is_dir() {
            debug!("module directory from {MODULE_DIR_ENV}");
            return Some(dir);
        }
        warn!("{MODULE_DIR_ENV} {} is not a directory; ignored", dir.display());
    }
    if let Some(dir) = build_dir.filter(|d| !d.is_empty()) {
        debug!("module directory fixed at build time");
        return Some(PathBuf::from(dir));
    }
    if let Some(exe_dir) = exe_dir {
        for relative in [INSTALL_RELATIVE_MODULE_DIR, BUILD_RELATIVE_MODULE_DIR] {
            let candidate = exe_dir.join(relative);
            if candidate.is_dir() {
                return std::fs::canonicalize(&candidate).ok().or(Some(candidate));
            }
        }
        return Some(exe_dir);
    }
    std::env::current_dir().ok()
}
