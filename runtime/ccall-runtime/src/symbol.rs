///
/// Symbol resolution
///
/// Resolves a symbol in a library and publishes the address into a
/// per-call-site `SymbolCell`. The fast path is a single acquire load;
/// the slow path goes through the library registry. Two threads may both
/// take the slow path for one cell; they compute the same address, so the
/// second store is harmless. Failures never touch the cell.
///
/// The `ccall_*` functions at the bottom are the C ABI used by
/// ahead-of-time generated code, which embeds the cell directly.
///

use std::ffi::{c_char, c_void, CStr};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use tracing::trace;

use crate::errors::InteropError;
use crate::exception::set_last_error;
use crate::host::LibraryHandle;
use crate::library::{LibraryName, LibraryRegistry};

/// Atomically published symbol address for one call site.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct SymbolCell(AtomicPtr<c_void>);

impl SymbolCell {
    pub const fn new() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    pub fn get(&self) -> Option<NonNull<c_void>> {
        NonNull::new(self.0.load(Ordering::Acquire))
    }

    fn publish(&self, addr: NonNull<c_void>) {
        self.0.store(addr.as_ptr(), Ordering::Release);
    }
}

/// Callback producing a library handle at run time.
pub type DeferredLibrary<'a> = &'a (dyn Fn(&LibraryRegistry) -> Result<LibraryHandle, InteropError> + Sync);

/// Where a symbol's library comes from.
#[derive(Clone, Copy)]
pub enum LibrarySource<'a> {
    Name(LibraryName<'a>),
    /// Computed on first call, e.g. a lazily opened library value.
    Deferred(DeferredLibrary<'a>),
}

impl<'a> From<LibraryName<'a>> for LibrarySource<'a> {
    fn from(name: LibraryName<'a>) -> Self {
        LibrarySource::Name(name)
    }
}

impl LibrarySource<'_> {
    fn describe(&self) -> String {
        match self {
            LibrarySource::Name(name) => name.to_string(),
            LibrarySource::Deferred(_) => "a deferred library".to_string(),
        }
    }
}

impl LibraryRegistry {
    fn source_handle(&self, source: LibrarySource<'_>) -> Result<LibraryHandle, InteropError> {
        match source {
            LibrarySource::Name(name) => self.require(name),
            LibrarySource::Deferred(open) => open(self),
        }
    }

    /// Resolve `symbol` without caching.
    pub fn lookup_symbol(
        &self,
        source: LibrarySource<'_>,
        symbol: &str,
    ) -> Result<NonNull<c_void>, InteropError> {
        let handle = self.source_handle(source)?;
        self.loader()
            .lookup_symbol(handle, symbol)
            .ok_or_else(|| InteropError::SymbolNotFound {
                symbol: symbol.to_string(),
                library: source.describe(),
            })
    }

    pub fn resolve_and_cache(
        &self,
        source: LibrarySource<'_>,
        symbol: &str,
        cell: &SymbolCell,
    ) -> Result<NonNull<c_void>, InteropError> {
        if let Some(addr) = cell.get() {
            trace!(symbol, "symbol cell hit");
            return Ok(addr);
        }

        let addr = self.lookup_symbol(source, symbol)?;
        cell.publish(addr);
        Ok(addr)
    }

    /// Resolve `symbol` in a library given as a runtime value.
    pub fn lazy_load_and_lookup(
        &self,
        library: LibrarySource<'_>,
        symbol: &str,
    ) -> Result<NonNull<c_void>, InteropError> {
        self.lookup_symbol(library, symbol)
    }
}

/// Reserved name selecting the current executable (compared by address).
#[unsafe(no_mangle)]
pub static CCALL_EXE_LIBNAME: [u8; 13] = *b"<executable>\0";

/// Reserved name selecting the internal runtime library (compared by address).
#[unsafe(no_mangle)]
pub static CCALL_INTERNAL_LIBNAME: [u8; 19] = *b"<internal-runtime>\0";

/// Reserved name selecting the public runtime library (compared by address).
#[unsafe(no_mangle)]
pub static CCALL_PUBLIC_LIBNAME: [u8; 10] = *b"<runtime>\0";

/// Decode a C library name. Null selects the default scope; the reserved
/// statics above select their sentinel by pointer identity.
///
/// # Safety
/// `lib` must be null, one of the reserved statics, or a NUL-terminated string.
pub unsafe fn library_name_from_c<'a>(lib: *const c_char) -> Result<LibraryName<'a>, InteropError> {
    if lib.is_null() {
        return Ok(LibraryName::DefaultScope);
    }
    if ptr::eq(lib.cast::<u8>(), CCALL_EXE_LIBNAME.as_ptr()) {
        return Ok(LibraryName::Executable);
    }
    if ptr::eq(lib.cast::<u8>(), CCALL_INTERNAL_LIBNAME.as_ptr()) {
        return Ok(LibraryName::InternalRuntime);
    }
    if ptr::eq(lib.cast::<u8>(), CCALL_PUBLIC_LIBNAME.as_ptr()) {
        return Ok(LibraryName::PublicRuntime);
    }
    let name = unsafe { CStr::from_ptr(lib) };
    name.to_str()
        .map(LibraryName::Named)
        .map_err(|_| InteropError::InvalidName("library name is not valid UTF-8".to_string()))
}

unsafe fn symbol_name_from_c<'a>(name: *const c_char) -> Result<&'a str, InteropError> {
    if name.is_null() {
        return Err(InteropError::InvalidName("symbol name is null".to_string()));
    }
    unsafe { CStr::from_ptr(name) }
        .to_str()
        .map_err(|_| InteropError::InvalidName("symbol name is not valid UTF-8".to_string()))
}

fn address_or_error(result: Result<NonNull<c_void>, InteropError>) -> *mut c_void {
    match result {
        Ok(addr) => addr.as_ptr(),
        Err(err) => {
            set_last_error(err);
            ptr::null_mut()
        }
    }
}

/// Resolve `name` in `lib` through the call-site cell `cell`.
/// Returns null and sets the pending error on failure.
///
/// # Safety
/// `registry` and `cell` must be valid for the call; `lib` and `name` as in
/// `library_name_from_c`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ccall_load_and_lookup(
    registry: *const LibraryRegistry,
    lib: *const c_char,
    name: *const c_char,
    cell: *const SymbolCell,
) -> *mut c_void {
    let (Some(registry), Some(cell)) = (unsafe { registry.as_ref() }, unsafe { cell.as_ref() }) else {
        set_last_error(InteropError::InvalidName("null registry or symbol cell".to_string()));
        return ptr::null_mut();
    };
    if let Some(addr) = cell.get() {
        return addr.as_ptr();
    }
    let result = unsafe { library_name_from_c(lib) }.and_then(|lib| {
        let name = unsafe { symbol_name_from_c(name) }?;
        registry.resolve_and_cache(LibrarySource::Name(lib), name, cell)
    });
    address_or_error(result)
}

/// Uncached variant for libraries named at run time.
///
/// # Safety
/// As for `ccall_load_and_lookup`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ccall_lazy_load_and_lookup(
    registry: *const LibraryRegistry,
    lib: *const c_char,
    name: *const c_char,
) -> *mut c_void {
    let Some(registry) = (unsafe { registry.as_ref() }) else {
        set_last_error(InteropError::InvalidName("null registry".to_string()));
        return ptr::null_mut();
    };
    let result = unsafe { library_name_from_c(lib) }.and_then(|lib| {
        let name = unsafe { symbol_name_from_c(name) }?;
        registry.lazy_load_and_lookup(LibrarySource::Name(lib), name)
    });
    address_or_error(result)
}
