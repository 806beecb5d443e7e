//! Stop-the-world copying collector.
//!
//! # Design
//!
//! A classic Cheney two-finger semi-space collector:
//!
//! 1. **Swap** — the active and reserve halves trade places; the bump cursor
//!    resets to the new (empty) active half while the old half stays
//!    readable for evacuation.
//!
//! 2. **Root forwarding** — every root slot is rewritten: live stack slots,
//!    the `ret` and `reg1` registers, and every pending mailbox value (taken
//!    under the inbox lock).  An object met for the first time is copied
//!    into the new half and its old header is overwritten with a forwarding
//!    pointer, so shared references converge on one copy.
//!
//! 3. **Scavenge** — a scan cursor walks the new half chunk by chunk in
//!    address order, forwarding every value field of every copied object.
//!    The cursor chases the bump pointer until no grey objects remain.
//!
//! The collector runs inline on whichever thread exhausted the heap: the
//! owning thread in the common case, or a sender mid-copy while it holds
//! this VM's allocation lock.  It never takes a lock on any peer VM.
//!
//! Objects in the process-global nullary-constructor table live outside
//! every heap and are returned as-is, preserving their pointer identity
//! across VMs and collections.

use std::time::Instant;

use crate::gc::heap::Heap;
use crate::objects::object::{
    self, ClosureType, Object, HEADER_SIZE, VECTOR_PAYLOAD_SIZE, WORD_SIZE,
};
use crate::objects::tagged::Value;
use crate::vm::Vm;

/// Run one collection cycle on `vm`.
///
/// Callers must satisfy the [`Vm::mutator`] contract: the owning thread, or
/// a sender holding the VM's allocation lock while the owner cannot touch
/// its heap.
pub fn collect(vm: &Vm) {
    let started = Instant::now();
    // SAFETY: per this function's contract; the borrow ends before return.
    let m = unsafe { vm.mutator() };
    m.heap.swap_spaces();

    // Phase 2: forward the roots.
    for slot in m.stack.live_slots_mut() {
        // SAFETY: stack slots hold live values of this VM (or immediates).
        *slot = unsafe { forward(&mut m.heap, *slot) };
    }
    // SAFETY: registers are roots of this VM.
    m.ret = unsafe { forward(&mut m.heap, m.ret) };
    m.reg1 = unsafe { forward(&mut m.heap, m.reg1) };
    {
        let mut inbox = vm.inbox.lock();
        for value in inbox.values_mut() {
            // SAFETY: pending messages live in this VM's heap.
            *value = unsafe { forward(&mut m.heap, *value) };
        }
    }

    // Phase 3: scavenge the copied objects.
    // SAFETY: every chunk below the cursor was just written by this cycle.
    unsafe { scavenge(&mut m.heap) };

    vm.collections
        .fetch_add(1, std::sync::atomic::Ordering::Release);
    m.stats.record_collection(started.elapsed());
}

/// Forward one root value: immediates and null pass through, object
/// references are replaced by their relocated copies.
///
/// # Safety
/// Any object `v` references must be live: in the half being evacuated, or
/// in the nullary table.
unsafe fn forward(heap: &mut Heap, v: Value) -> Value {
    match v.as_object() {
        None => v,
        // SAFETY: per this function's contract.
        Some(obj) => unsafe { Value::from_object(copy_object(heap, obj)) },
    }
}

/// Evacuate `obj` into the active half, or resolve its existing copy.
///
/// # Safety
/// `obj` must be a live object in the evacuated half or the nullary table.
unsafe fn copy_object(heap: &mut Heap, obj: *mut Object) -> *mut Object {
    unsafe {
        // Already copied this cycle: converge on the single copy.
        if object::ty(obj) == ClosureType::Fwd {
            return object::fwd_target(obj);
        }
        // Process-global nullary constructors are never moved.
        if object::ty(obj) == ClosureType::Con
            && object::con_arity(obj) == 0
            && object::con_tag(obj) < 256
            && !heap.reserve_contains(obj)
        {
            return obj;
        }

        let chunk = *(obj as *const usize).sub(1);
        let payload = chunk - WORD_SIZE;

        let new = match object::ty(obj) {
            // Vector lanes are 16-byte aligned relative to the chunk's own
            // address, so a raw byte copy would misplace them; re-copy.
            ClosureType::Bits8x16
            | ClosureType::Bits16x8
            | ClosureType::Bits32x4
            | ClosureType::Bits64x2 => {
                let new = gc_alloc(heap, HEADER_SIZE + VECTOR_PAYLOAD_SIZE);
                *new = *obj;
                std::ptr::copy_nonoverlapping(
                    object::vector_lanes(obj),
                    object::vector_lanes(new),
                    16,
                );
                new
            }
            // Everything else has address-independent payload offsets:
            // one byte copy moves header and payload together.  PTR and
            // BIGINT payloads are foreign; copying the stored pointer is
            // exactly the required header-only treatment.
            _ => {
                let new = gc_alloc(heap, payload);
                std::ptr::copy_nonoverlapping(obj as *const u8, new as *mut u8, payload);
                new
            }
        };

        object::install_fwd(obj, new);
        new
    }
}

/// Bump space for an evacuation copy.
///
/// The active half is exactly as large as the evacuated one, so a live set
/// that fit before the swap always fits after it; failure here means heap
/// corruption, not exhaustion.
fn gc_alloc(heap: &mut Heap, payload: usize) -> *mut Object {
    heap.bump_raw(payload)
        .expect("evacuation cannot exceed the semi-space")
}

/// Walk the copied chunks in address order, forwarding every value field.
///
/// # Safety
/// Every chunk between the active base and the bump cursor must hold an
/// object written by this cycle (or a header-less scratch chunk, which reads
/// as an arity-0 constructor and owns no fields).
unsafe fn scavenge(heap: &mut Heap) {
    let mut scan = heap.active_base() as usize;
    // The cursor advances as children are copied; chase it.
    while scan < heap.cursor() as usize {
        unsafe {
            let chunk = *(scan as *const usize);
            let obj = (scan + WORD_SIZE) as *mut Object;
            match object::ty(obj) {
                ClosureType::Con => {
                    for i in 0..object::con_arity(obj) {
                        let field = object::con_arg(obj, i);
                        object::set_con_arg(obj, i, forward(heap, field));
                    }
                }
                ClosureType::StrOffset => {
                    let p = object::str_offset(obj);
                    // Collapse through any offset chain, then forward the
                    // root string itself.  Creation keeps chains at depth
                    // ≤ 1, so the loop takes at most one step plus
                    // forwarding hops.
                    let mut root = (*p).root;
                    let mut offset = (*p).offset;
                    loop {
                        match object::ty(root) {
                            ClosureType::Fwd => root = object::fwd_target(root),
                            ClosureType::StrOffset => {
                                let inner = object::str_offset(root);
                                offset += (*inner).offset;
                                root = (*inner).root;
                            }
                            _ => break,
                        }
                    }
                    // Following a forwarding pointer may already have landed
                    // in the new half (the root was independently rooted);
                    // re-copying a live copy would stamp FWD on it.  Only
                    // evacuate roots still in the old half.
                    (*p).root = if heap.reserve_contains(root) {
                        copy_object(heap, root)
                    } else {
                        root
                    };
                    (*p).offset = offset;
                }
                // STRING, BITS*, BUFFER, MANAGEDPTR, FLOAT, PTR, BIGINT:
                // no value fields to forward.
                _ => {}
            }
            scan += chunk;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
