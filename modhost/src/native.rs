//! Native shared library access.
//!
//! Cross-platform support for opening shared libraries (.so, .dylib, .dll)
//! and looking up module symbols in them.

use crate::image::{ModuleImage, ModuleOpener};
use modhost_common::abi::Address;
use std::ffi::CString;
use std::path::Path;

/// An opened native library.
pub struct NativeLibrary {
    handle: LibraryHandle,
    path: String,
}

impl NativeLibrary {
    /// Open a shared library, resolving all of its symbols immediately.
    ///
    /// # Errors
    /// Returns the platform loader diagnostic (`dlerror()` text on Unix).
    pub fn open(path: &Path) -> Result<Self, String> {
        let path_str = path
            .to_str()
            .ok_or_else(|| format!("invalid UTF-8 in path {:?}", path))?;
        let handle = LibraryHandle::load(Some(path_str))?;
        Ok(Self {
            handle,
            path: path_str.to_string(),
        })
    }

    /// Open the running executable itself.
    pub fn open_self() -> Result<Self, String> {
        let handle = LibraryHandle::load(None)?;
        Ok(Self {
            handle,
            path: "<self>".to_string(),
        })
    }

    /// Path the library was opened from.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl ModuleImage for NativeLibrary {
    fn symbol(&self, name: &str) -> Result<Address, String> {
        self.handle
            .symbol(name)
            .map_err(|e| format!("{}: {}", self.path, e))
    }
}

/// Opener backed by the platform dynamic loader.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeOpener;

impl ModuleOpener for NativeOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn ModuleImage>, String> {
        NativeLibrary::open(path).map(|lib| Box::new(lib) as Box<dyn ModuleImage>)
    }
}

#[cfg(unix)]
type LibraryHandle = UnixLibrary;

#[cfg(windows)]
type LibraryHandle = WindowsLibrary;

// ============================================================================
// Unix Implementation (Linux, macOS, BSD)
// ============================================================================

#[cfg(unix)]
struct UnixLibrary {
    handle: *mut libc::c_void,
}

#[cfg(unix)]
fn last_dl_error() -> String {
    // SAFETY: dlerror returns either null or a NUL-terminated thread-local string.
    unsafe {
        let err_ptr = libc::dlerror();
        if err_ptr.is_null() {
            "unknown error".to_string()
        } else {
            std::ffi::CStr::from_ptr(err_ptr)
                .to_string_lossy()
                .into_owned()
        }
    }
}

#[cfg(unix)]
impl UnixLibrary {
    fn load(path: Option<&str>) -> Result<Self, String> {
        let c_path = path
            .map(CString::new)
            .transpose()
            .map_err(|e| format!("invalid path: {e}"))?;
        let path_ptr = c_path.as_ref().map_or(std::ptr::null(), |p| p.as_ptr());

        // RTLD_NOW: resolve every symbol before returning.
        let handle = unsafe { libc::dlopen(path_ptr, libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(last_dl_error());
        }
        Ok(Self { handle })
    }

    fn symbol(&self, name: &str) -> Result<Address, String> {
        let c_name = CString::new(name).map_err(|e| format!("invalid symbol name: {e}"))?;

        // SAFETY: handle is a live dlopen handle; the dlerror pair brackets
        // the lookup so a stale error is not reported.
        unsafe {
            libc::dlerror();
            let symbol = libc::dlsym(self.handle, c_name.as_ptr());
            if symbol.is_null() {
                return Err(last_dl_error());
            }
            Ok(Address::from_ptr(symbol))
        }
    }
}

#[cfg(unix)]
impl Drop for UnixLibrary {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

// dlopen handles may be used from any thread.
#[cfg(unix)]
unsafe impl Send for UnixLibrary {}
#[cfg(unix)]
unsafe impl Sync for UnixLibrary {}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
struct WindowsLibrary {
    handle: *mut std::ffi::c_void,
    owned: bool,
}

#[cfg(windows)]
impl WindowsLibrary {
    fn load(path: Option<&str>) -> Result<Self, String> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;

        let Some(path) = path else {
            let handle = unsafe { GetModuleHandleW(std::ptr::null()) };
            if handle.is_null() {
                return Err(format!("error code {}", unsafe { GetLastError() }));
            }
            return Ok(Self { handle, owned: false });
        };

        let wide: Vec<u16> = OsStr::new(path)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };
        if handle.is_null() {
            return Err(format!("error code {}", unsafe { GetLastError() }));
        }
        Ok(Self { handle, owned: true })
    }

    fn symbol(&self, name: &str) -> Result<Address, String> {
        let c_name = CString::new(name).map_err(|e| format!("invalid symbol name: {e}"))?;
        let symbol = unsafe { GetProcAddress(self.handle, c_name.as_ptr()) };
        if symbol.is_null() {
            return Err(format!("symbol {name} not found (error code {})", unsafe {
                GetLastError()
            }));
        }
        Ok(Address::from_ptr(symbol))
    }
}

#[cfg(windows)]
impl Drop for WindowsLibrary {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                FreeLibrary(self.handle);
            }
        }
    }
}

#[cfg(windows)]
unsafe impl Send for WindowsLibrary {}
#[cfg(windows)]
unsafe impl Sync for WindowsLibrary {}

#[cfg(windows)]
unsafe extern "system" {
    fn LoadLibraryW(filename: *const u16) -> *mut std::ffi::c_void;
    fn GetModuleHandleW(filename: *const u16) -> *mut std::ffi::c_void;
    fn GetProcAddress(module: *mut std::ffi::c_void, procname: *const i8) -> *mut std::ffi::c_void;
    fn FreeLibrary(module: *mut std::ffi::c_void) -> i32;
    fn GetLastError() -> u32;
}
