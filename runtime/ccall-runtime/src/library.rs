///
/// Library handle registry
///
/// Maps library names to OS handles. A name is loaded at most once for
/// the life of the process; handles are never closed. The reserved names
/// (default symbol scope, current executable, the runtime's own images)
/// resolve to fixed handles without touching the map or its lock.
///

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::config::LoadFlags;
use crate::errors::InteropError;
use crate::host::{DynamicLoader, LibraryHandle, SentinelHandles};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LibraryName<'a> {
    DefaultScope,
    Executable,
    InternalRuntime,
    PublicRuntime,
    Named(&'a str),
}

impl<'a> From<&'a str> for LibraryName<'a> {
    fn from(name: &'a str) -> Self {
        LibraryName::Named(name)
    }
}

impl<'a> From<Option<&'a str>> for LibraryName<'a> {
    fn from(name: Option<&'a str>) -> Self {
        name.map_or(LibraryName::DefaultScope, LibraryName::Named)
    }
}

impl fmt::Display for LibraryName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryName::DefaultScope => f.write_str("the default symbol scope"),
            LibraryName::Executable => f.write_str("the current executable"),
            LibraryName::InternalRuntime => f.write_str("the internal runtime library"),
            LibraryName::PublicRuntime => f.write_str("the runtime library"),
            LibraryName::Named(name) => write!(f, "\"{}\"", name),
        }
    }
}

pub struct LibraryRegistry {
    loader: Arc<dyn DynamicLoader>,
    sentinels: SentinelHandles,
    flags: LoadFlags,
    libraries: Mutex<HashMap<String, LibraryHandle>>,
}

impl LibraryRegistry {
    pub fn new(loader: Arc<dyn DynamicLoader>, sentinels: SentinelHandles, flags: LoadFlags) -> Self {
        Self {
            loader,
            sentinels,
            flags,
            libraries: Mutex::new(HashMap::new()),
        }
    }

    pub fn loader(&self) -> &dyn DynamicLoader {
        self.loader.as_ref()
    }

    pub fn sentinels(&self) -> &SentinelHandles {
        &self.sentinels
    }

    /// Resolve `name` to a handle, loading it on first use.
    ///
    /// When the load fails and `must_succeed` is false, returns `Ok(None)`
    /// so the caller can report a more specific error of its own.
    pub fn get_library(
        &self,
        name: LibraryName<'_>,
        must_succeed: bool,
    ) -> Result<Option<LibraryHandle>, InteropError> {
        let name = match name {
            LibraryName::DefaultScope => return Ok(Some(self.sentinels.default_scope)),
            LibraryName::Executable => return Ok(Some(self.sentinels.executable)),
            LibraryName::InternalRuntime => return Ok(Some(self.sentinels.internal_runtime)),
            LibraryName::PublicRuntime => return Ok(Some(self.sentinels.public_runtime)),
            LibraryName::Named(name) => name,
        };

        let mut libraries = self.libraries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&handle) = libraries.get(name) {
            return Ok(Some(handle));
        }

        match self.loader.load_library(name, self.flags) {
            Ok(handle) => {
                debug!(library = name, ?handle, "library loaded");
                libraries.insert(name.to_string(), handle);
                Ok(Some(handle))
            }
            Err(reason) if must_succeed => Err(InteropError::LibraryNotFound {
                name: name.to_string(),
                reason,
            }),
            Err(_) => Ok(None),
        }
    }

    pub fn require(&self, name: LibraryName<'_>) -> Result<LibraryHandle, InteropError> {
        self.get_library(name, true)?.ok_or_else(|| InteropError::LibraryNotFound {
            name: name.to_string(),
            reason: "no handle".to_string(),
        })
    }

    pub fn try_get(&self, name: LibraryName<'_>) -> Option<LibraryHandle> {
        self.get_library(name, false).ok().flatten()
    }

    /// Number of named libraries published so far.
    pub fn loaded_count(&self) -> usize {
        self.libraries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
