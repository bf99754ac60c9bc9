//!
//! Interop Service
//!
//! The process-wide state of the interop layer, owned by one value the
//! embedding runtime creates at startup and passes around by reference:
//! the library registry and the trampoline cache with its slot pool.
//!

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::debug;

use crate::config::InteropConfig;
use crate::errors::InteropError;
use crate::host::{DynamicLoader, LibraryHandle, ObjectModel, SentinelHandles, TypeSystem};
use crate::library::{LibraryName, LibraryRegistry};
use crate::loader::SystemLoader;
use crate::pages::PoolStats;
use crate::symbol::{LibrarySource, SymbolCell};
use crate::trampoline::{SiteId, Trampoline, TrampolineCache, TrampolineRequest};

/// The collaborators the embedding runtime provides.
pub struct Host {
    pub loader: Arc<dyn DynamicLoader>,
    pub sentinels: SentinelHandles,
    pub types: Arc<dyn TypeSystem>,
    pub heap: Arc<dyn ObjectModel>,
}

impl Host {
    /// A host over the platform loader, searching `config`'s paths.
    pub fn system(
        config: &InteropConfig,
        types: Arc<dyn TypeSystem>,
        heap: Arc<dyn ObjectModel>,
    ) -> Result<Self, InteropError> {
        let loader = SystemLoader::new(config.loader.search_paths.clone());
        let sentinels = loader.sentinels()?;
        Ok(Self {
            loader: Arc::new(loader),
            sentinels,
            types,
            heap,
        })
    }
}

pub struct Interop {
    config: InteropConfig,
    libraries: LibraryRegistry,
    trampolines: Arc<TrampolineCache>,
}

impl Interop {
    pub fn new(config: InteropConfig, host: Host) -> Result<Self, InteropError> {
        config.validate()?;

        let libraries = LibraryRegistry::new(host.loader, host.sentinels, config.load_flags());
        let trampolines = Arc::new(TrampolineCache::new(
            host.types,
            host.heap,
            config.trampolines.slot_size,
        )?);

        debug!(
            binding = ?config.loader.binding,
            global = config.loader.global,
            slot_size = config.trampolines.slot_size,
            "interop initialized"
        );

        Ok(Self {
            config,
            libraries,
            trampolines,
        })
    }

    pub fn config(&self) -> &InteropConfig {
        &self.config
    }

    pub fn libraries(&self) -> &LibraryRegistry {
        &self.libraries
    }

    pub fn trampolines(&self) -> &Arc<TrampolineCache> {
        &self.trampolines
    }

    pub fn get_library(
        &self,
        name: LibraryName<'_>,
        must_succeed: bool,
    ) -> Result<Option<LibraryHandle>, InteropError> {
        self.libraries.get_library(name, must_succeed)
    }

    pub fn resolve_and_cache(
        &self,
        source: LibrarySource<'_>,
        symbol: &str,
        cell: &SymbolCell,
    ) -> Result<NonNull<c_void>, InteropError> {
        self.libraries.resolve_and_cache(source, symbol, cell)
    }

    pub fn lazy_load_and_lookup(
        &self,
        library: LibrarySource<'_>,
        symbol: &str,
    ) -> Result<NonNull<c_void>, InteropError> {
        self.libraries.lazy_load_and_lookup(library, symbol)
    }

    pub fn new_site(&self) -> SiteId {
        self.trampolines.new_site()
    }

    pub fn get_or_create_trampoline(
        &self,
        req: &TrampolineRequest<'_>,
    ) -> Result<Arc<Trampoline>, InteropError> {
        self.trampolines.get_or_create(req)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.trampolines.pool_stats()
    }
}
