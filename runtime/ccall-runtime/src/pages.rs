///
/// Trampoline Page Allocator
///
/// Fixed-size executable slots carved from anonymous read+write+execute
/// pages. Free slots are threaded into a singly linked list through
/// their first word; allocation pops the head, freeing pushes it back.
///
/// One page is mapped whenever the free list runs dry. Pages are never
/// unmapped and freed slots are not zeroed: the next initializer writes
/// the whole stub before anything can jump into it.
///
/// The pool has no lock of its own. It lives inside the trampoline
/// cache's state and is only reached through that state's guard.
///

use std::ptr::{self, NonNull};

use tracing::debug;

use crate::errors::InteropError;

/// One cache line; fits every stub the code generators emit.
pub const DEFAULT_SLOT_SIZE: usize = 64;

#[repr(C)]
struct FreeSlot {
    next: *mut FreeSlot,
}

pub struct SlotPool {
    slot_size: usize,
    page_size: usize,
    free_list: *mut FreeSlot,
    free_count: usize,
    pages_mapped: usize,
}

// The pool only hands out addresses; every access goes through the owner's lock.
unsafe impl Send for SlotPool {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub slot_size: usize,
    pub page_size: usize,
    pub pages_mapped: usize,
    pub free_slots: usize,
}

/// Slots must tile a page exactly and hold the free-list link.
pub(crate) fn check_slot_size(slot_size: usize) -> Result<(), InteropError> {
    if !slot_size.is_power_of_two() {
        return Err(InteropError::InvalidConfig(format!(
            "slot_size must be a power of two, got {}",
            slot_size
        )));
    }
    if slot_size < std::mem::size_of::<FreeSlot>() {
        return Err(InteropError::InvalidConfig(format!(
            "slot_size must be at least {} bytes, got {}",
            std::mem::size_of::<FreeSlot>(),
            slot_size
        )));
    }
    let page = page_size();
    if slot_size > page {
        return Err(InteropError::InvalidConfig(format!(
            "slot_size {} exceeds the page size {}",
            slot_size, page
        )));
    }
    Ok(())
}

impl SlotPool {
    pub fn new(slot_size: usize) -> Result<Self, InteropError> {
        check_slot_size(slot_size)?;

        Ok(Self {
            slot_size,
            page_size: page_size(),
            free_list: ptr::null_mut(),
            free_count: 0,
            pages_mapped: 0,
        })
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slots_per_page(&self) -> usize {
        self.page_size / self.slot_size
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            slot_size: self.slot_size,
            page_size: self.page_size,
            pages_mapped: self.pages_mapped,
            free_slots: self.free_count,
        }
    }

    pub fn allocate(&mut self) -> Result<NonNull<u8>, InteropError> {
        if self.free_list.is_null() {
            self.refill()?;
        }

        let head = self.free_list;
        unsafe {
            self.free_list = (*head).next;
        }
        self.free_count -= 1;

        // SAFETY: refill guarantees a non-null head.
        Ok(unsafe { NonNull::new_unchecked(head.cast::<u8>()) })
    }

    /// Return `slot` to the free list.
    ///
    /// # Safety
    /// `slot` must have come from `allocate` on this pool and must not be
    /// freed twice or executed afterwards.
    pub unsafe fn free(&mut self, slot: NonNull<u8>) {
        let node = slot.as_ptr().cast::<FreeSlot>();
        let head = self.free_list;
        with_write_access(|| unsafe { (*node).next = head });
        self.free_list = node;
        self.free_count += 1;
    }

    #[cold]
    #[inline(never)]
    fn refill(&mut self) -> Result<(), InteropError> {
        let page = map_executable_page(self.page_size)?;
        let count = self.slots_per_page();

        // Link back to front so the lowest slot ends up at the head.
        let slot_size = self.slot_size;
        let next = with_write_access(|| {
            let mut next: *mut FreeSlot = self.free_list;
            for i in (0..count).rev() {
                unsafe {
                    let slot = page.as_ptr().add(i * slot_size).cast::<FreeSlot>();
                    (*slot).next = next;
                    next = slot;
                }
            }
            next
        });

        self.free_list = next;
        self.free_count += count;
        self.pages_mapped += 1;

        debug!(page = ?page, slots = count, slot_size = self.slot_size, "mapped trampoline page");
        Ok(())
    }
}

/// Bounds-checked writer over one leased slot.
pub struct SlotMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> SlotMut<'a> {
    /// # Safety
    /// `slot` must point to `len` writable bytes that nothing else touches
    /// for `'a`.
    pub(crate) unsafe fn new(slot: NonNull<u8>, len: usize) -> Self {
        Self {
            bytes: unsafe { std::slice::from_raw_parts_mut(slot.as_ptr(), len) },
        }
    }

    pub fn address(&self) -> usize {
        self.bytes.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Copy `code` into the slot at `offset`. Panics if it would overflow.
    pub fn write(&mut self, offset: usize, code: &[u8]) {
        let end = offset
            .checked_add(code.len())
            .filter(|&end| end <= self.bytes.len())
            .unwrap_or_else(|| {
                panic!(
                    "trampoline code overflows its slot: {} bytes at offset {} in a {}-byte slot",
                    code.len(),
                    offset,
                    self.bytes.len()
                )
            });
        self.bytes[offset..end].copy_from_slice(code);
    }

    pub fn write_word(&mut self, offset: usize, word: usize) {
        self.write(offset, &word.to_ne_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }
}

/// Run `emit` against `slot` under the platform's code-writing protocol:
/// lift per-thread JIT write protection where it exists, then make the
/// new bytes visible to instruction fetch.
pub(crate) fn write_code<R>(slot: NonNull<u8>, len: usize, emit: impl FnOnce(&mut SlotMut<'_>) -> R) -> R {
    let result = with_write_access(|| {
        let mut writer = unsafe { SlotMut::new(slot, len) };
        emit(&mut writer)
    });
    flush_icache(slot, len);
    result
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
fn with_write_access<R>(f: impl FnOnce() -> R) -> R {
    let protected = unsafe { pthread_jit_write_protect_supported_np() != 0 };
    if protected {
        unsafe { pthread_jit_write_protect_np(0) };
    }
    let result = f();
    if protected {
        unsafe { pthread_jit_write_protect_np(1) };
    }
    result
}

#[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
fn with_write_access<R>(f: impl FnOnce() -> R) -> R {
    f()
}

#[cfg(target_os = "macos")]
fn flush_icache(slot: NonNull<u8>, len: usize) {
    unsafe { sys_icache_invalidate(slot.as_ptr().cast(), len) };
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn flush_icache(slot: NonNull<u8>, len: usize) {
    unsafe { __clear_cache(slot.as_ptr().cast(), slot.as_ptr().add(len).cast()) };
}

#[cfg(not(any(target_os = "macos", all(target_os = "linux", target_arch = "aarch64"))))]
fn flush_icache(_slot: NonNull<u8>, _len: usize) {}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(unix)]
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

#[cfg(not(unix))]
pub fn page_size() -> usize {
    4096
}

#[cfg(all(unix, not(target_os = "macos")))]
const MAP_FLAGS: libc::c_int = libc::MAP_ANON | libc::MAP_PRIVATE;

#[cfg(target_os = "macos")]
const MAP_FLAGS: libc::c_int = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT;

#[cfg(unix)]
fn map_executable_page(len: usize) -> Result<NonNull<u8>, InteropError> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            MAP_FLAGS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(InteropError::OutOfMemory {
            requested: len,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| InteropError::OutOfMemory {
        requested: len,
        reason: "mmap returned null".to_string(),
    })
}

#[cfg(not(unix))]
fn map_executable_page(len: usize) -> Result<NonNull<u8>, InteropError> {
    Err(InteropError::OutOfMemory {
        requested: len,
        reason: "executable memory is not supported on this platform".to_string(),
    })
}
