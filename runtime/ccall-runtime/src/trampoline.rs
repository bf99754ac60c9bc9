//!
//! Trampoline Cache
//!
//! Per-call-site cache of native-callable stubs. A request names a
//! callable, the layout of the object to hand back, the call site's
//! table, and optionally a specialization template that is instantiated
//! into words baked into the stub.
//!
//! Construction happens in two locked phases with the slow work between
//! them: the lookup runs under the lock, instantiation and object
//! allocation run outside it, and the slot lease, code emission and
//! insertion run under it again. Two threads missing on the same key may
//! both build a wrapper; the later insertion is the one kept, and the
//! other wrapper lives on until its own finalizer runs.
//!
//! Managed wrappers carry a finalizer that frees their slot and evicts
//! their table entry once the collector finds the result object dead.
//! Permanent wrappers are never released.
//!

use std::collections::HashMap;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, trace};

use crate::errors::InteropError;
use crate::host::{ObjectModel, ResultShape, TypeSystem, ValueRef};
use crate::pages::{write_code, PoolStats, SlotMut, SlotPool};

/// Handle to one call site's trampoline table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId(u32);

impl SiteId {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Words baked into a stub: `[callable, v1..vn]`.
///
/// Values that may not be embedded are stored as `UNKNOWN`. The words
/// never move while the owning wrapper is alive, so generated code may
/// embed `as_ptr()`.
#[derive(Debug)]
pub struct SpecializationBuffer {
    words: Box<[usize]>,
}

impl SpecializationBuffer {
    pub const UNKNOWN: usize = 0;

    pub fn callable(&self) -> ValueRef {
        ValueRef::from_addr(self.words[0])
    }

    /// The specialization values, without the leading callable.
    pub fn params(&self) -> &[usize] {
        &self.words[1..]
    }

    pub fn get(&self, index: usize) -> Option<usize> {
        self.words.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn as_words(&self) -> &[usize] {
        &self.words
    }

    pub fn as_ptr(&self) -> *const usize {
        self.words.as_ptr()
    }
}

/// The values a specialized request is keyed by and instantiated against.
#[derive(Debug, Clone, Copy)]
pub struct SpecializationInputs<'a> {
    /// Identity of the inputs vector. Keys the outer table.
    pub identity: ValueRef,
    pub values: &'a [ValueRef],
}

impl SpecializationInputs<'static> {
    pub const EMPTY: Self = SpecializationInputs {
        identity: ValueRef::from_addr(0),
        values: &[],
    };
}

/// Emits the stub into a leased slot. Runs under the cache lock, so it
/// must only write bytes.
pub type Initializer<'a> = &'a dyn Fn(&mut SlotMut<'_>, &SpecializationBuffer);

pub struct TrampolineRequest<'a> {
    pub site: SiteId,
    pub callable: ValueRef,
    pub shape: ResultShape,
    pub template: &'a [ValueRef],
    pub env: ValueRef,
    pub inputs: SpecializationInputs<'a>,
    pub init: Initializer<'a>,
}

impl<'a> TrampolineRequest<'a> {
    /// An unspecialized request.
    pub fn new(site: SiteId, callable: ValueRef, shape: ResultShape, init: Initializer<'a>) -> Self {
        Self {
            site,
            callable,
            shape,
            template: &[],
            env: ValueRef::from_addr(0),
            inputs: SpecializationInputs::EMPTY,
            init,
        }
    }

    pub fn specialized(
        mut self,
        template: &'a [ValueRef],
        env: ValueRef,
        inputs: SpecializationInputs<'a>,
    ) -> Self {
        self.template = template;
        self.env = env;
        self.inputs = inputs;
        self
    }

    /// Outer-table key; only specialized requests have one.
    fn inputs_key(&self) -> Option<ValueRef> {
        if self.template.is_empty() {
            None
        } else {
            Some(self.inputs.identity)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrampolineState {
    Building,
    Live,
    Released,
}

const BUILDING: u8 = 0;
const LIVE: u8 = 1;
const RELEASED: u8 = 2;

/// Where a managed wrapper is cached, so its release can evict it.
#[derive(Debug, Clone, Copy)]
struct TableRef {
    site: SiteId,
    inputs: Option<ValueRef>,
    callable: ValueRef,
}

#[derive(Debug)]
enum Lifetime {
    Permanent,
    Managed(TableRef),
}

pub struct Trampoline {
    object: ValueRef,
    shape: ResultShape,
    callable: Option<ValueRef>,
    buffer: SpecializationBuffer,
    lifetime: Lifetime,
    /// Slot address, zero while building and after release.
    slot: AtomicUsize,
    state: AtomicU8,
}

impl Trampoline {
    /// The result object handed to the managed runtime.
    pub fn object(&self) -> ValueRef {
        self.object
    }

    pub fn shape(&self) -> ResultShape {
        self.shape
    }

    /// The wrapped callable. Absent for the raw-pointer shape.
    pub fn callable(&self) -> Option<ValueRef> {
        self.callable
    }

    pub fn specialization(&self) -> &SpecializationBuffer {
        &self.buffer
    }

    /// Entry point of the emitted stub. `None` before the wrapper is live
    /// and after it has been released.
    pub fn code_ptr(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.slot.load(Ordering::Acquire) as *mut u8)
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self.lifetime, Lifetime::Permanent)
    }

    pub fn state(&self) -> TrampolineState {
        match self.state.load(Ordering::Acquire) {
            BUILDING => TrampolineState::Building,
            LIVE => TrampolineState::Live,
            _ => TrampolineState::Released,
        }
    }

    pub fn is_released(&self) -> bool {
        self.state() == TrampolineState::Released
    }
}

impl fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trampoline")
            .field("object", &self.object)
            .field("shape", &self.shape)
            .field("callable", &self.callable)
            .field("slot", &self.code_ptr())
            .field("state", &self.state())
            .field("permanent", &self.is_permanent())
            .finish()
    }
}

#[derive(Default)]
struct SiteTable {
    flat: HashMap<ValueRef, Arc<Trampoline>>,
    specialized: HashMap<ValueRef, HashMap<ValueRef, Arc<Trampoline>>>,
}

impl SiteTable {
    fn get(&self, inputs: Option<ValueRef>, callable: ValueRef) -> Option<&Arc<Trampoline>> {
        match inputs {
            None => self.flat.get(&callable),
            Some(inputs) => self.specialized.get(&inputs)?.get(&callable),
        }
    }

    fn insert(&mut self, inputs: Option<ValueRef>, callable: ValueRef, trampoline: Arc<Trampoline>) {
        let table = match inputs {
            None => &mut self.flat,
            Some(inputs) => self.specialized.entry(inputs).or_default(),
        };
        table.insert(callable, trampoline);
    }

    /// Remove the entry for `key` only if it still refers to `trampoline`.
    fn remove_if_same(&mut self, key: &TableRef, trampoline: &Trampoline) -> bool {
        let same = |entry: &Arc<Trampoline>| ptr::eq(Arc::as_ptr(entry), trampoline);

        match key.inputs {
            None => {
                if self.flat.get(&key.callable).is_some_and(same) {
                    self.flat.remove(&key.callable);
                    return true;
                }
                false
            }
            Some(inputs) => {
                let Some(inner) = self.specialized.get_mut(&inputs) else {
                    return false;
                };
                if !inner.get(&key.callable).is_some_and(same) {
                    return false;
                }
                inner.remove(&key.callable);
                if inner.is_empty() {
                    self.specialized.remove(&inputs);
                }
                true
            }
        }
    }

    fn len(&self) -> usize {
        self.flat.len() + self.specialized.values().map(HashMap::len).sum::<usize>()
    }
}

struct CacheState {
    pool: SlotPool,
    sites: HashMap<SiteId, SiteTable>,
}

/// Slot leased from the pool; goes back unless committed.
struct SlotLease<'a> {
    pool: &'a mut SlotPool,
    slot: NonNull<u8>,
    committed: bool,
}

impl<'a> SlotLease<'a> {
    fn take(pool: &'a mut SlotPool) -> Result<Self, InteropError> {
        let slot = pool.allocate()?;
        Ok(Self {
            pool,
            slot,
            committed: false,
        })
    }

    fn commit(mut self) -> NonNull<u8> {
        self.committed = true;
        self.slot
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        if !self.committed {
            unsafe { self.pool.free(self.slot) };
        }
    }
}

pub struct TrampolineCache {
    state: Mutex<CacheState>,
    types: Arc<dyn TypeSystem>,
    heap: Arc<dyn ObjectModel>,
    next_site: AtomicU32,
}

impl TrampolineCache {
    /// Fails with `InvalidConfig` when `slot_size` cannot tile a page.
    pub fn new(
        types: Arc<dyn TypeSystem>,
        heap: Arc<dyn ObjectModel>,
        slot_size: usize,
    ) -> Result<Self, InteropError> {
        Ok(Self {
            state: Mutex::new(CacheState {
                pool: SlotPool::new(slot_size)?,
                sites: HashMap::new(),
            }),
            types,
            heap,
            next_site: AtomicU32::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a table for one call site. Its storage is created on first use.
    pub fn new_site(&self) -> SiteId {
        SiteId(self.next_site.fetch_add(1, Ordering::Relaxed))
    }

    /// Return the cached wrapper for `req`, building one on a miss.
    ///
    /// A managed wrapper whose object is finalized while it is still being
    /// built comes back already `Released`: no code pointer, no cache
    /// entry, and its slot back in the pool. Callers must check
    /// `code_ptr()` before handing the entry point out.
    pub fn get_or_create(self: &Arc<Self>, req: &TrampolineRequest<'_>) -> Result<Arc<Trampoline>, InteropError> {
        let inputs_key = req.inputs_key();

        {
            let mut state = self.lock();
            let table = state.sites.entry(req.site).or_default();
            if let Some(existing) = table.get(inputs_key, req.callable) {
                debug_assert_eq!(existing.shape, req.shape, "cached trampoline has a different result shape");
                trace!(site = req.site.0, callable = ?req.callable, "trampoline cache hit");
                return Ok(Arc::clone(existing));
            }
        }

        let buffer = self.specialize(req)?;
        let permanent = self.is_permanent(req);
        let object = if permanent {
            self.heap.allocate_permanent(req.shape)?
        } else {
            self.heap.allocate_managed(req.shape)?
        };

        let lifetime = if permanent {
            Lifetime::Permanent
        } else {
            Lifetime::Managed(TableRef {
                site: req.site,
                inputs: inputs_key,
                callable: req.callable,
            })
        };
        let trampoline = Arc::new(Trampoline {
            object,
            shape: req.shape,
            callable: match req.shape {
                ResultShape::RawPointer => None,
                ResultShape::Closure(_) => Some(req.callable),
            },
            buffer,
            lifetime,
            slot: AtomicUsize::new(0),
            state: AtomicU8::new(BUILDING),
        });

        if !permanent {
            let cache = Arc::downgrade(self);
            let owned = Arc::clone(&trampoline);
            self.heap.register_finalizer(object, Box::new(move || release_hook(&cache, &owned)));
        }

        let mut state = self.lock();
        let CacheState { pool, sites } = &mut *state;

        let lease = SlotLease::take(pool)?;
        write_code(lease.slot, lease.pool.slot_size(), |writer| {
            (req.init)(writer, &trampoline.buffer)
        });

        if trampoline
            .state
            .compare_exchange(BUILDING, LIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Finalized before it was ever published; the lease returns the slot.
            debug!(site = req.site.0, "trampoline released during construction");
            return Ok(trampoline);
        }
        let slot = lease.commit();
        trampoline.slot.store(slot.as_ptr() as usize, Ordering::Release);

        sites
            .entry(req.site)
            .or_default()
            .insert(inputs_key, req.callable, Arc::clone(&trampoline));

        debug!(
            site = req.site.0,
            callable = ?req.callable,
            permanent,
            slot = ?slot,
            "trampoline created"
        );
        Ok(trampoline)
    }

    fn specialize(&self, req: &TrampolineRequest<'_>) -> Result<SpecializationBuffer, InteropError> {
        let any = self.types.any_type();
        let mut words = Vec::with_capacity(req.template.len() + 1);
        words.push(req.callable.addr());

        for &param in req.template {
            let value = self
                .types
                .instantiate(param, req.env, req.inputs.values)
                .map_err(InteropError::Instantiation)?;
            let embeddable =
                value == any || (self.types.is_concrete_type(value) && self.types.is_immutable(value));
            words.push(if embeddable {
                value.addr()
            } else {
                SpecializationBuffer::UNKNOWN
            });
        }

        Ok(SpecializationBuffer {
            words: words.into_boxed_slice(),
        })
    }

    fn is_permanent(&self, req: &TrampolineRequest<'_>) -> bool {
        req.shape == ResultShape::RawPointer
            || self.types.is_concrete_type(req.callable)
            || self.types.is_singleton_instance(req.callable)
            || self.types.is_canonical_type_constructor(req.callable)
    }

    /// Free `trampoline`'s slot and evict its cache entry. Repeat calls,
    /// and calls on permanent wrappers, do nothing.
    pub fn release(&self, trampoline: &Trampoline) {
        let Lifetime::Managed(key) = &trampoline.lifetime else {
            return;
        };

        let mut state = self.lock();
        if trampoline.state.swap(RELEASED, Ordering::AcqRel) != LIVE {
            return;
        }

        let CacheState { pool, sites } = &mut *state;
        if let Some(slot) = NonNull::new(trampoline.slot.swap(0, Ordering::AcqRel) as *mut u8) {
            unsafe { pool.free(slot) };
        }
        let evicted = sites
            .get_mut(&key.site)
            .is_some_and(|table| table.remove_if_same(key, trampoline));

        debug!(site = key.site.0, callable = ?key.callable, evicted, "trampoline released");
    }

    /// Live entries across every site.
    pub fn cached_len(&self) -> usize {
        self.lock().sites.values().map(SiteTable::len).sum()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.lock().pool.stats()
    }
}

fn release_hook(cache: &Weak<TrampolineCache>, trampoline: &Trampoline) {
    if let Some(cache) = cache.upgrade() {
        cache.release(trampoline);
    }
}
