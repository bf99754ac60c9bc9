//!
//! Shared fakes for the integration tests: a small type universe, a heap
//! whose collector runs finalizers on demand, and a loader over a fixed
//! table of libraries and symbols.
//!

#![allow(dead_code)]

use std::collections::HashSet;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ccall_runtime::{
    BoxError, DynamicLoader, Finalizer, Host, InteropError, LibraryHandle, LoadFlags, ObjectModel, ResultShape,
    SentinelHandles, TypeSystem, ValueRef,
};

pub const ANY: ValueRef = ValueRef::from_addr(0xa000);
pub const INT64: ValueRef = ValueRef::from_addr(0xa010);
pub const FLOAT64: ValueRef = ValueRef::from_addr(0xa018);
pub const VECTOR: ValueRef = ValueRef::from_addr(0xa020);
pub const NUMBER: ValueRef = ValueRef::from_addr(0xa030);
pub const NOTHING: ValueRef = ValueRef::from_addr(0xa040);
pub const ARRAY_CTOR: ValueRef = ValueRef::from_addr(0xa050);
pub const CLOSURE: ValueRef = ValueRef::from_addr(0xb000);

/// Template whose instantiation fails.
pub const UNBOUND: ValueRef = ValueRef::from_addr(0xc000);
/// Template that instantiates to the first input value.
pub const FIRST_INPUT: ValueRef = ValueRef::from_addr(0xc008);

pub fn closure_shape() -> ResultShape {
    ResultShape::Closure(CLOSURE)
}

/// Types: `INT64`, `FLOAT64` concrete and immutable; `VECTOR` concrete and
/// mutable; `NUMBER` abstract; `NOTHING` the singleton instance of its type.
pub struct FakeTypes {
    pub instantiations: AtomicUsize,
}

impl FakeTypes {
    pub fn new() -> Self {
        Self {
            instantiations: AtomicUsize::new(0),
        }
    }
}

impl TypeSystem for FakeTypes {
    fn instantiate(&self, template: ValueRef, _env: ValueRef, args: &[ValueRef]) -> Result<ValueRef, BoxError> {
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        match template {
            UNBOUND => Err("UndefVarError: T not defined".into()),
            FIRST_INPUT => args.first().copied().ok_or_else(|| "no inputs to instantiate against".into()),
            other => Ok(other),
        }
    }

    fn any_type(&self) -> ValueRef {
        ANY
    }

    fn is_concrete_type(&self, value: ValueRef) -> bool {
        matches!(value, INT64 | FLOAT64 | VECTOR)
    }

    fn is_immutable(&self, value: ValueRef) -> bool {
        matches!(value, INT64 | FLOAT64)
    }

    fn is_singleton_instance(&self, value: ValueRef) -> bool {
        value == NOTHING
    }

    fn is_canonical_type_constructor(&self, value: ValueRef) -> bool {
        value == ARRAY_CTOR
    }
}

/// Heap whose "collector" is driven by the test.
#[derive(Default)]
pub struct FakeHeap {
    next: AtomicUsize,
    permanent: Mutex<HashSet<ValueRef>>,
    finalizers: Mutex<Vec<(ValueRef, Finalizer)>>,
}

impl FakeHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_permanent(&self, object: ValueRef) -> bool {
        self.permanent.lock().unwrap().contains(&object)
    }

    pub fn has_finalizer(&self, object: ValueRef) -> bool {
        self.finalizers.lock().unwrap().iter().any(|(o, _)| *o == object)
    }

    pub fn pending_finalizers(&self) -> usize {
        self.finalizers.lock().unwrap().len()
    }

    /// Treat `object` as unreachable and run its finalizer, if it has one.
    pub fn collect(&self, object: ValueRef) -> bool {
        let finalizer = {
            let mut finalizers = self.finalizers.lock().unwrap();
            match finalizers.iter().position(|(o, _)| *o == object) {
                Some(index) => finalizers.swap_remove(index).1,
                None => return false,
            }
        };
        finalizer();
        true
    }

    /// Run every pending finalizer.
    pub fn collect_all(&self) -> usize {
        let finalizers = std::mem::take(&mut *self.finalizers.lock().unwrap());
        let count = finalizers.len();
        for (_, finalizer) in finalizers {
            finalizer();
        }
        count
    }

    fn fresh(&self) -> ValueRef {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        ValueRef::from_addr(0x100_0000 + n * 0x20)
    }
}

impl ObjectModel for FakeHeap {
    fn allocate_permanent(&self, _shape: ResultShape) -> Result<ValueRef, InteropError> {
        let object = self.fresh();
        self.permanent.lock().unwrap().insert(object);
        Ok(object)
    }

    fn allocate_managed(&self, _shape: ResultShape) -> Result<ValueRef, InteropError> {
        Ok(self.fresh())
    }

    fn register_finalizer(&self, object: ValueRef, finalizer: Finalizer) {
        self.finalizers.lock().unwrap().push((object, finalizer));
    }
}

/// Loader over fixed tables. Counts `load_library` calls.
pub struct FakeLoader {
    libraries: Vec<(&'static str, usize)>,
    symbols: Vec<(usize, &'static str, usize)>,
    pub loads: AtomicUsize,
    pub delay: Duration,
}

impl FakeLoader {
    pub fn new(libraries: Vec<(&'static str, usize)>, symbols: Vec<(usize, &'static str, usize)>) -> Self {
        Self {
            libraries,
            symbols,
            loads: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl DynamicLoader for FakeLoader {
    fn load_library(&self, name: &str, _flags: LoadFlags) -> Result<LibraryHandle, String> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.libraries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(_, raw)| LibraryHandle::from_raw(raw as *mut c_void))
            .ok_or_else(|| format!("{}: cannot open shared object file: No such file or directory", name))
    }

    fn lookup_symbol(&self, handle: LibraryHandle, name: &str) -> Option<NonNull<c_void>> {
        self.symbols
            .iter()
            .find(|(h, n, _)| *h == handle.as_raw() as usize && *n == name)
            .and_then(|&(_, _, addr)| NonNull::new(addr as *mut c_void))
    }
}

pub fn fake_sentinels() -> SentinelHandles {
    SentinelHandles {
        default_scope: LibraryHandle::from_raw(std::ptr::null_mut()),
        executable: LibraryHandle::from_raw(0x10 as *mut c_void),
        internal_runtime: LibraryHandle::from_raw(0x20 as *mut c_void),
        public_runtime: LibraryHandle::from_raw(0x30 as *mut c_void),
    }
}

pub fn fake_host(loader: FakeLoader) -> (Host, Arc<FakeLoader>, Arc<FakeTypes>, Arc<FakeHeap>) {
    let loader = Arc::new(loader);
    let types = Arc::new(FakeTypes::new());
    let heap = Arc::new(FakeHeap::new());
    let host = Host {
        loader: loader.clone(),
        sentinels: fake_sentinels(),
        types: types.clone(),
        heap: heap.clone(),
    };
    (host, loader, types, heap)
}
