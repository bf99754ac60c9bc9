///
/// # Trampoline Cache Integration Tests
///
/// Drives the cache through an `Interop` built on fake hosts: caching by
/// identity, slot recycling after collection, specialization filtering,
/// permanence, failure cleanup and concurrent requests.
///

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use ccall_runtime::{
    Interop, InteropConfig, ResultShape, SlotMut, SpecializationBuffer, SpecializationInputs, TrampolineRequest,
    TrampolineState, ValueRef,
};

use common::*;

fn interop() -> (Interop, Arc<FakeTypes>, Arc<FakeHeap>) {
    let (host, _, types, heap) = fake_host(FakeLoader::new(vec![], vec![]));
    let interop = Interop::new(InteropConfig::default(), host).expect("interop should initialize");
    (interop, types, heap)
}

fn callable(n: usize) -> ValueRef {
    ValueRef::from_addr(0x40_0000 + n * 0x10)
}

/// Stores the specialization buffer's address in the slot.
fn emit_buffer_address(slot: &mut SlotMut<'_>, buffer: &SpecializationBuffer) {
    slot.write_word(0, buffer.as_ptr() as usize);
}

#[test]
fn test_same_callable_returns_identical_wrapper() {
    let (interop, _, heap) = interop();
    let site = interop.new_site();
    let req = TrampolineRequest::new(site, callable(1), closure_shape(), &emit_buffer_address);

    let first = interop.get_or_create_trampoline(&req).unwrap();
    let second = interop.get_or_create_trampoline(&req).unwrap();

    assert!(Arc::ptr_eq(&first, &second), "second request should hit the cache");
    assert_eq!(first.object(), second.object());
    assert_eq!(heap.pending_finalizers(), 1, "only one wrapper should be built");
}

#[test]
fn test_same_specialization_inputs_return_identical_wrapper() {
    let (interop, types, _) = interop();
    let site = interop.new_site();
    let template = [FIRST_INPUT];
    let values = [INT64];
    let inputs = SpecializationInputs {
        identity: ValueRef::from_addr(0x9000),
        values: &values,
    };
    let req = TrampolineRequest::new(site, callable(1), closure_shape(), &emit_buffer_address).specialized(
        &template,
        ValueRef::from_addr(0x8000),
        inputs,
    );

    let first = interop.get_or_create_trampoline(&req).unwrap();
    let second = interop.get_or_create_trampoline(&req).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(types.instantiations.load(Ordering::SeqCst), 1);
    assert_eq!(first.specialization().params(), &[INT64.addr()]);
}

#[test]
fn test_collected_slot_is_reused_for_next_callable() {
    let (interop, _, heap) = interop();
    let site = interop.new_site();

    let c = interop
        .get_or_create_trampoline(&TrampolineRequest::new(site, callable(1), closure_shape(), &emit_buffer_address))
        .unwrap();
    let s1 = c.code_ptr().expect("live wrapper has a slot");

    assert!(heap.collect(c.object()));
    assert_eq!(c.state(), TrampolineState::Released);
    assert_eq!(c.code_ptr(), None, "released wrapper gives up its slot address");
    assert_eq!(interop.trampolines().cached_len(), 0);

    let d = interop
        .get_or_create_trampoline(&TrampolineRequest::new(site, callable(2), closure_shape(), &emit_buffer_address))
        .unwrap();
    assert_eq!(d.code_ptr(), Some(s1), "most recently freed slot is reused first");
    assert_eq!(c.code_ptr(), None, "reused slot belongs to the new wrapper only");
}

#[test]
fn test_finalized_wrappers_do_not_grow_the_pool() {
    let (interop, _, heap) = interop();
    let site = interop.new_site();
    let n = interop.pool_stats().page_size / interop.pool_stats().slot_size / 2;

    let first_round: Vec<_> = (0..n)
        .map(|i| {
            interop
                .get_or_create_trampoline(&TrampolineRequest::new(site, callable(i), closure_shape(), &emit_buffer_address))
                .unwrap()
        })
        .collect();
    assert_eq!(interop.pool_stats().pages_mapped, 1);

    assert_eq!(heap.collect_all(), n);
    assert!(first_round.iter().all(|t| t.is_released()));

    for i in n..2 * n {
        interop
            .get_or_create_trampoline(&TrampolineRequest::new(site, callable(i), closure_shape(), &emit_buffer_address))
            .unwrap();
    }

    let stats = interop.pool_stats();
    assert_eq!(stats.pages_mapped, 1, "recycled slots should satisfy every request");
    assert_eq!(interop.trampolines().cached_len(), n);
}

#[test]
fn test_unembeddable_values_become_unknown_sentinel() {
    let (interop, _, _) = interop();
    let site = interop.new_site();
    let template = [INT64, VECTOR, NUMBER, ANY, FIRST_INPUT];
    let values = [FLOAT64];
    let inputs = SpecializationInputs {
        identity: ValueRef::from_addr(0x9000),
        values: &values,
    };
    let req = TrampolineRequest::new(site, callable(1), closure_shape(), &emit_buffer_address).specialized(
        &template,
        ValueRef::from_addr(0x8000),
        inputs,
    );

    let trampoline = interop.get_or_create_trampoline(&req).unwrap();
    let buffer = trampoline.specialization();

    assert_eq!(buffer.len(), template.len() + 1);
    assert_eq!(buffer.callable(), callable(1));
    assert_eq!(
        buffer.params(),
        &[
            INT64.addr(),
            SpecializationBuffer::UNKNOWN,
            SpecializationBuffer::UNKNOWN,
            ANY.addr(),
            FLOAT64.addr(),
        ]
    );
    assert!(!buffer.params().contains(&VECTOR.addr()));
}

#[test]
fn test_permanent_wrappers_survive_collection() {
    let (interop, _, heap) = interop();
    let site = interop.new_site();

    let raw = interop
        .get_or_create_trampoline(&TrampolineRequest::new(site, callable(1), ResultShape::RawPointer, &emit_buffer_address))
        .unwrap();
    let singleton = interop
        .get_or_create_trampoline(&TrampolineRequest::new(site, NOTHING, closure_shape(), &emit_buffer_address))
        .unwrap();
    let ctor = interop
        .get_or_create_trampoline(&TrampolineRequest::new(site, ARRAY_CTOR, closure_shape(), &emit_buffer_address))
        .unwrap();
    let type_value = interop
        .get_or_create_trampoline(&TrampolineRequest::new(site, INT64, closure_shape(), &emit_buffer_address))
        .unwrap();

    for wrapper in [&raw, &singleton, &ctor, &type_value] {
        assert!(wrapper.is_permanent());
        assert!(heap.is_permanent(wrapper.object()));
        assert!(!heap.has_finalizer(wrapper.object()));
    }
    assert_eq!(raw.callable(), None, "raw pointers carry no callable");

    for _ in 0..3 {
        heap.collect_all();
        interop.trampolines().release(&raw);
    }

    assert_eq!(raw.state(), TrampolineState::Live);
    assert!(raw.code_ptr().is_some());
    let again = interop
        .get_or_create_trampoline(&TrampolineRequest::new(site, callable(1), ResultShape::RawPointer, &emit_buffer_address))
        .unwrap();
    assert!(Arc::ptr_eq(&raw, &again));
}

#[test]
fn test_instantiation_failure_surfaces_original_error() {
    let (interop, _, heap) = interop();
    let site = interop.new_site();
    let template = [INT64, UNBOUND];
    let req = TrampolineRequest::new(site, callable(1), closure_shape(), &emit_buffer_address).specialized(
        &template,
        ValueRef::from_addr(0x8000),
        SpecializationInputs::EMPTY,
    );

    let err = interop.get_or_create_trampoline(&req).unwrap_err();

    assert_eq!(err.to_string(), "UndefVarError: T not defined");
    assert_eq!(interop.trampolines().cached_len(), 0);
    assert_eq!(heap.pending_finalizers(), 0, "no object was allocated");
    assert_eq!(interop.pool_stats().pages_mapped, 0, "no slot was leased");
}

#[test]
fn test_release_hook_is_idempotent() {
    let (interop, _, heap) = interop();
    let site = interop.new_site();

    let wrapper = interop
        .get_or_create_trampoline(&TrampolineRequest::new(site, callable(1), closure_shape(), &emit_buffer_address))
        .unwrap();
    let free_live = interop.pool_stats().free_slots;

    assert!(heap.collect(wrapper.object()));
    let free_released = interop.pool_stats().free_slots;
    assert_eq!(free_released, free_live + 1);

    interop.trampolines().release(&wrapper);
    interop.trampolines().release(&wrapper);
    assert_eq!(interop.pool_stats().free_slots, free_released);
    assert!(!heap.collect(wrapper.object()), "finalizer runs at most once");
}

#[test]
fn test_concurrent_requests_keep_one_entry() {
    let (interop, _, heap) = interop();
    let interop = Arc::new(interop);
    let site = interop.new_site();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let interop = Arc::clone(&interop);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                interop
                    .get_or_create_trampoline(&TrampolineRequest::new(
                        site,
                        callable(1),
                        closure_shape(),
                        &emit_buffer_address,
                    ))
                    .unwrap()
            })
        })
        .collect();
    let wrappers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(interop.trampolines().cached_len(), 1);
    assert!(wrappers.iter().all(|w| w.state() == TrampolineState::Live));

    let cached = interop
        .get_or_create_trampoline(&TrampolineRequest::new(site, callable(1), closure_shape(), &emit_buffer_address))
        .unwrap();
    assert!(wrappers.iter().any(|w| Arc::ptr_eq(w, &cached)));

    // Every builder owns its own slot until its finalizer runs.
    let built = heap.pending_finalizers();
    let mut slots: Vec<_> = wrappers.iter().filter_map(|w| w.code_ptr()).collect();
    slots.sort();
    slots.dedup();
    assert_eq!(slots.len(), built);

    heap.collect_all();
    assert_eq!(interop.trampolines().cached_len(), 0);
    let stats = interop.pool_stats();
    assert_eq!(stats.free_slots, stats.pages_mapped * stats.page_size / stats.slot_size);
}

#[test]
fn test_collection_racing_builders_keeps_pool_consistent() {
    let (interop, _, heap) = interop();
    let interop = Arc::new(interop);
    let site = interop.new_site();
    let builders = 6;
    let rounds = 200;
    let barrier = Arc::new(Barrier::new(builders + 1));
    let stop = Arc::new(AtomicBool::new(false));

    let collector = {
        let heap = Arc::clone(&heap);
        let barrier = Arc::clone(&barrier);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            barrier.wait();
            while !stop.load(Ordering::Acquire) {
                heap.collect_all();
                thread::yield_now();
            }
        })
    };

    let handles: Vec<_> = (0..builders)
        .map(|b| {
            let interop = Arc::clone(&interop);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..rounds)
                    .map(|i| {
                        interop
                            .get_or_create_trampoline(&TrampolineRequest::new(
                                site,
                                callable((b + i) % 4),
                                closure_shape(),
                                &emit_buffer_address,
                            ))
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut wrappers: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    stop.store(true, Ordering::Release);
    collector.join().unwrap();

    wrappers.sort_by_key(|w| Arc::as_ptr(w) as usize);
    wrappers.dedup_by(|a, b| Arc::ptr_eq(a, b));

    for wrapper in &wrappers {
        assert_eq!(wrapper.is_released(), wrapper.code_ptr().is_none());
    }
    let live: Vec<_> = wrappers.iter().filter(|w| w.state() == TrampolineState::Live).collect();
    assert_eq!(live.len(), heap.pending_finalizers(), "only uncollected wrappers stay live");

    let mut slots: Vec<_> = live.iter().filter_map(|w| w.code_ptr()).collect();
    slots.sort();
    slots.dedup();
    assert_eq!(slots.len(), live.len(), "live wrappers own distinct slots");

    let stats = interop.pool_stats();
    let capacity = stats.pages_mapped * stats.page_size / stats.slot_size;
    assert_eq!(stats.free_slots + live.len(), capacity, "every slot is free or owned by a live wrapper");
    assert!(interop.trampolines().cached_len() <= live.len());

    heap.collect_all();
    assert!(wrappers.iter().all(|w| w.is_released() && w.code_ptr().is_none()));
    assert_eq!(interop.trampolines().cached_len(), 0);
    assert_eq!(interop.pool_stats().free_slots, capacity);
}

#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn test_emitted_stub_is_executable() {
    let (interop, _, _) = interop();
    let site = interop.new_site();
    let template = [INT64];
    let inputs = SpecializationInputs {
        identity: ValueRef::from_addr(0x9000),
        values: &[],
    };

    // mov rax, imm64; ret
    let emit = |slot: &mut SlotMut<'_>, buffer: &SpecializationBuffer| {
        slot.write(0, &[0x48, 0xb8]);
        slot.write_word(2, buffer.params()[0]);
        slot.write(10, &[0xc3]);
    };
    let req = TrampolineRequest::new(site, callable(1), closure_shape(), &emit).specialized(
        &template,
        ValueRef::from_addr(0x8000),
        inputs,
    );

    let trampoline = interop.get_or_create_trampoline(&req).unwrap();
    let code = trampoline.code_ptr().unwrap();
    let stub: extern "C" fn() -> usize = unsafe { std::mem::transmute(code.as_ptr()) };

    assert_eq!(stub(), INT64.addr());
}
