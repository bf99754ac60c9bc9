///
/// # Interop Configuration
///
/// Settings for the library loader and the trampoline page allocator,
/// read from a TOML document. Every field has a default, so an empty
/// document (or no document at all) yields a working configuration.
///
/// ## Example
///
/// ```toml
/// [loader]
/// binding = "now"
/// global = false
/// search_paths = ["/opt/vendor/lib", "./deps"]
///
/// [trampolines]
/// slot_size = 64
/// ```
///
/// `binding` selects lazy or immediate symbol binding when a library is
/// opened; `global` makes the library's symbols visible to libraries
/// loaded after it. `search_paths` are tried, in order, for bare library
/// names the platform loader cannot find on its own.
///
/// `slot_size` is the size of one trampoline slot. It must be a power of
/// two, hold at least one machine word (the free-list link) and fit in a
/// page.
///

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::InteropError;
use crate::pages::{DEFAULT_SLOT_SIZE, check_slot_size};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct InteropConfig {
    pub loader: LoaderConfig,
    pub trampolines: TrampolineConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    pub binding: Binding,
    pub global: bool,
    pub search_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrampolineConfig {
    pub slot_size: usize,
}

impl Default for TrampolineConfig {
    fn default() -> Self {
        Self {
            slot_size: DEFAULT_SLOT_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Binding {
    #[default]
    Lazy,
    Now,
}

/// Search policy handed to the platform loader for every named library.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LoadFlags {
    pub binding: Binding,
    pub global: bool,
}

impl LoadFlags {
    #[cfg(unix)]
    pub fn to_dlopen_mode(self) -> libc::c_int {
        let binding = match self.binding {
            Binding::Lazy => libc::RTLD_LAZY,
            Binding::Now => libc::RTLD_NOW,
        };
        let visibility = if self.global {
            libc::RTLD_GLOBAL
        } else {
            libc::RTLD_LOCAL
        };
        binding | visibility
    }
}

impl InteropConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, InteropError> {
        let config: InteropConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, InteropError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), InteropError> {
        check_slot_size(self.trampolines.slot_size)
    }

    pub fn load_flags(&self) -> LoadFlags {
        LoadFlags {
            binding: self.loader.binding,
            global: self.loader.global,
        }
    }
}
