//!
//! Host Interfaces
//!
//! The interop layer does not own the managed type system, the object
//! model or the platform loader. It reaches them through the traits in
//! this module, which the embedding runtime implements once at startup:
//!
//! - `DynamicLoader` opens libraries and looks up exported symbols
//! - `TypeSystem` instantiates specialization templates and classifies values
//! - `ObjectModel` allocates result objects and registers finalizers
//!
//! Managed values are only ever compared by identity here, so they cross
//! these interfaces as `ValueRef`, a plain address.
//!

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

use crate::config::LoadFlags;
use crate::errors::{BoxError, InteropError};

/// Identity of a managed-runtime value. Equal iff both name the same object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ValueRef(usize);

impl ValueRef {
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

impl fmt::Debug for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueRef({:#x})", self.0)
    }
}

/// Opaque OS library handle. May be null (the default symbol scope on Linux).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct LibraryHandle(usize);

impl LibraryHandle {
    pub fn from_raw(raw: *mut c_void) -> Self {
        Self(raw as usize)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LibraryHandle({:#x})", self.0)
    }
}

/// Fixed handles for the reserved library names. Never stored in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentinelHandles {
    pub default_scope: LibraryHandle,
    pub executable: LibraryHandle,
    pub internal_runtime: LibraryHandle,
    pub public_runtime: LibraryHandle,
}

pub trait DynamicLoader: Send + Sync {
    /// Open `name`. On failure returns the loader's reason text.
    fn load_library(&self, name: &str, flags: LoadFlags) -> Result<LibraryHandle, String>;

    fn lookup_symbol(&self, handle: LibraryHandle, name: &str) -> Option<NonNull<c_void>>;
}

/// Layout of the object handed back for a trampoline request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultShape {
    /// A bare code pointer. Has no identity field and is always permanent.
    RawPointer,
    /// A managed closure wrapper of the given type, carrying the callable.
    Closure(ValueRef),
}

pub trait TypeSystem: Send + Sync {
    /// Instantiate a type-parameter expression in `env` with `args` bound.
    fn instantiate(
        &self,
        template: ValueRef,
        env: ValueRef,
        args: &[ValueRef],
    ) -> Result<ValueRef, BoxError>;

    /// The universal "any" type.
    fn any_type(&self) -> ValueRef;

    fn is_concrete_type(&self, value: ValueRef) -> bool;

    fn is_immutable(&self, value: ValueRef) -> bool;

    /// True when `value` is the unique instance of its (singleton) type.
    fn is_singleton_instance(&self, value: ValueRef) -> bool;

    /// True when `value` is a parametric type constructor whose canonical
    /// wrapper is `value` itself.
    fn is_canonical_type_constructor(&self, value: ValueRef) -> bool;
}

/// Release hook handed to the collector; runs once the object is unreachable.
pub type Finalizer = Box<dyn FnOnce() + Send + 'static>;

pub trait ObjectModel: Send + Sync {
    /// Allocate a zero-initialized object the collector never reclaims.
    fn allocate_permanent(&self, shape: ResultShape) -> Result<ValueRef, InteropError>;

    fn allocate_managed(&self, shape: ResultShape) -> Result<ValueRef, InteropError>;

    fn register_finalizer(&self, object: ValueRef, finalizer: Finalizer);
}
