///
/// System dynamic loader
///
/// `DynamicLoader` over the platform's `dlopen`/`dlsym`. Bare library
/// names are tried as given first (so the platform's own search rules
/// apply), then under each configured search path, then with the
/// platform's dynamic-library extension appended.
///

use std::ffi::{c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use tracing::{debug, trace};

use crate::config::LoadFlags;
use crate::errors::InteropError;
use crate::host::{DynamicLoader, LibraryHandle, SentinelHandles};

#[derive(Debug, Clone, Default)]
pub struct SystemLoader {
    search_paths: Vec<PathBuf>,
}

impl SystemLoader {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Names to hand to the platform loader for `name`, in order.
    pub fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let path = Path::new(name);
        let mut candidates = vec![path.to_path_buf()];

        if path.is_absolute() || name.contains(std::path::MAIN_SEPARATOR) {
            return candidates;
        }

        // Dots in a bare name are versions unless one component is the
        // library extension itself: `libm.so.6` is complete, `python3.11` is not.
        let ext = std::env::consts::DLL_EXTENSION;
        let has_ext = name.split('.').skip(1).any(|part| part == ext);
        let with_ext = if !has_ext && !ext.is_empty() {
            Some(format!("{}.{}", name, ext))
        } else {
            None
        };

        for dir in &self.search_paths {
            candidates.push(dir.join(name));
            if let Some(with_ext) = &with_ext {
                candidates.push(dir.join(with_ext));
            }
        }
        if let Some(with_ext) = with_ext {
            candidates.push(PathBuf::from(with_ext));
        }

        candidates
    }
}

#[cfg(unix)]
impl SystemLoader {
    /// Handles for the reserved library names on this host.
    pub fn sentinels(&self) -> Result<SentinelHandles, InteropError> {
        let executable = unsafe { libc::dlopen(std::ptr::null(), libc::RTLD_NOW) };
        if executable.is_null() {
            return Err(InteropError::LibraryNotFound {
                name: "<executable>".to_string(),
                reason: last_dl_error(),
            });
        }
        let executable = LibraryHandle::from_raw(executable);
        let runtime = runtime_image_handle().unwrap_or(executable);

        Ok(SentinelHandles {
            default_scope: LibraryHandle::from_raw(libc::RTLD_DEFAULT),
            executable,
            internal_runtime: runtime,
            public_runtime: runtime,
        })
    }
}

#[cfg(unix)]
impl DynamicLoader for SystemLoader {
    fn load_library(&self, name: &str, flags: LoadFlags) -> Result<LibraryHandle, String> {
        let mode = flags.to_dlopen_mode();
        let mut reason = String::new();

        for candidate in self.candidates(name) {
            let Some(c_path) = candidate.to_str().and_then(|s| CString::new(s).ok()) else {
                continue;
            };
            let handle = unsafe { libc::dlopen(c_path.as_ptr(), mode) };
            if !handle.is_null() {
                debug!(library = name, path = %candidate.display(), "dlopen");
                return Ok(LibraryHandle::from_raw(handle));
            }
            reason = last_dl_error();
            trace!(library = name, path = %candidate.display(), %reason, "dlopen candidate failed");
        }

        if reason.is_empty() {
            reason = "library name is not representable as a C string".to_string();
        }
        Err(reason)
    }

    fn lookup_symbol(&self, handle: LibraryHandle, name: &str) -> Option<NonNull<c_void>> {
        let c_name = CString::new(name).ok()?;
        let ptr = unsafe { libc::dlsym(handle.as_raw(), c_name.as_ptr()) };
        NonNull::new(ptr)
    }
}

#[cfg(not(unix))]
impl SystemLoader {
    pub fn sentinels(&self) -> Result<SentinelHandles, InteropError> {
        Err(InteropError::LibraryNotFound {
            name: "<executable>".to_string(),
            reason: "dynamic loading is not supported on this platform".to_string(),
        })
    }
}

#[cfg(not(unix))]
impl DynamicLoader for SystemLoader {
    fn load_library(&self, _name: &str, _flags: LoadFlags) -> Result<LibraryHandle, String> {
        Err("dynamic loading is not supported on this platform".to_string())
    }

    fn lookup_symbol(&self, _handle: LibraryHandle, _name: &str) -> Option<NonNull<c_void>> {
        None
    }
}

#[cfg(unix)]
fn last_dl_error() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown dynamic loader error".to_string()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

/// Reopen the image containing this crate's code without loading anything new.
#[cfg(unix)]
fn runtime_image_handle() -> Option<LibraryHandle> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let anchor = runtime_image_handle as *const c_void;
    if unsafe { libc::dladdr(anchor, &mut info) } == 0 || info.dli_fname.is_null() {
        return None;
    }
    let handle = unsafe { libc::dlopen(info.dli_fname, libc::RTLD_NOW | libc::RTLD_NOLOAD) };
    if handle.is_null() {
        None
    } else {
        Some(LibraryHandle::from_raw(handle))
    }
}
