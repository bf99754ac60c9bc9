///
/// ccall Runtime
///
/// Native interop for the managed runtime: resolving foreign libraries
/// and symbols for foreign calls, and handing out executable trampolines
/// that let native code call back into managed closures.
///
/// Built as both an rlib (for the runtime and tools) and a static
/// library linked into ahead-of-time compiled programs, which reach the
/// `ccall_*` entry points through the C ABI.
///
/// Contains:
/// - Library handle registry (library)
/// - Symbol resolution and call-site cells (symbol)
/// - Trampoline slot pool over RWX pages (pages)
/// - Trampoline cache and lifecycle (trampoline)
/// - Host traits and the dlopen-based loader (host, loader)
/// - Output filename templating (filename)
///

pub mod config;
pub mod errors;
pub mod exception;
pub mod filename;
pub mod host;
pub mod interop;
pub mod library;
pub mod loader;
pub mod pages;
pub mod symbol;
pub mod trampoline;

pub use config::{Binding, InteropConfig, LoadFlags, LoaderConfig, TrampolineConfig};
pub use errors::{BoxError, InteropError};
pub use exception::{ccall_error_check, ccall_error_clear, set_last_error, take_last_error};
pub use filename::{format_filename, FilenameContext};
pub use host::{
    DynamicLoader, Finalizer, LibraryHandle, ObjectModel, ResultShape, SentinelHandles, TypeSystem, ValueRef,
};
pub use interop::{Host, Interop};
pub use library::{LibraryName, LibraryRegistry};
pub use loader::SystemLoader;
pub use pages::{page_size, PoolStats, SlotMut, SlotPool, DEFAULT_SLOT_SIZE};
pub use symbol::{LibrarySource, SymbolCell};
pub use trampoline::{
    Initializer, SiteId, SpecializationBuffer, SpecializationInputs, Trampoline, TrampolineCache,
    TrampolineRequest, TrampolineState,
};
