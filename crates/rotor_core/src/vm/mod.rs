//! Execution contexts: per-VM state, allocation entry points, lifecycle.
//!
//! A [`Vm`] owns a value stack, a managed heap, two root registers, and (for
//! message passing) an inbox.  VMs are shared as `Arc<Vm>` so that peers can
//! address each other for sends; the mutator state itself is single-owner and
//! lives behind [`Vm::mutator`]'s access contract.

/// Per-VM message queue and the received-message handle.
pub mod mailbox;
/// Cross-VM deep copy, sends, receives, and thread spawning.
pub mod messaging;
/// The per-VM value stack.
pub mod stack;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, ReentrantMutex, ReentrantMutexGuard};

use crate::error::{fatal, RotorError};
use crate::gc::collector::collect;
use crate::gc::heap::Heap;
use crate::globals;
use crate::objects::object::{self, Object};
use crate::objects::tagged::Value;
use crate::stats::Stats;
use crate::vm::mailbox::Mailbox;
use crate::vm::stack::ValueStack;

/// Default stack capacity (in values) for [`Vm::boot`].
pub const DEFAULT_STACK_SIZE: usize = 4_096_000;
/// Default semi-space size (in bytes) for [`Vm::boot`].
pub const DEFAULT_HEAP_SIZE: usize = 4_096_000;

/// The single-owner part of a VM: everything the mutator reads and writes
/// without synchronisation.
pub struct Mutator {
    /// The value stack.
    pub stack: ValueStack,
    /// The managed heap.
    pub heap: Heap,
    /// Return-value register (a collection root).
    pub ret: Value,
    /// Auxiliary register (a collection root).
    pub reg1: Value,
    /// Allocation and collection counters.
    pub stats: Stats,
}

/// One execution context: stack, heap, registers, statistics, and inbox.
///
/// # Threading model
///
/// Each VM is driven by exactly one thread.  The only cross-thread accesses
/// are:
///
/// - a peer deep-copying a message into this VM's heap while holding
///   [`alloc_lock`](Self), and
/// - a peer appending to the inbox under the inbox mutex.
///
/// The allocation lock is reentrant so a primitive that pre-reserves heap
/// space and then constructs several objects does not self-deadlock, and so
/// a send can nest inside a pre-reservation.
pub struct Vm {
    /// Mutator state; see [`Vm::mutator`] for the access contract.
    mutator: UnsafeCell<Mutator>,
    /// Serialises heap allocation against peer sends.
    alloc_lock: ReentrantMutex<()>,
    /// The message queue, guarded by one mutex...
    pub(crate) inbox: Mutex<Mailbox>,
    /// ...paired with this condition to wake blocked receivers.
    pub(crate) inbox_waiting: Condvar,
    /// Completed collection cycles; read without the allocation lock by the
    /// send path to detect a collection racing a deep copy.
    pub(crate) collections: AtomicU64,
    /// Number of peer VMs that may exchange messages with this one.  Zero
    /// means single-threaded operation and elides all allocation locking.
    pub(crate) processes: AtomicUsize,
    /// Bound on spawned peers, carried to children.
    max_threads: usize,
}

// SAFETY: all unsynchronised state sits in `mutator`, whose access contract
// (owner thread, or peer holding `alloc_lock` — see `Vm::mutator`) prevents
// concurrent aliasing.  The remaining fields are locks and atomics.
unsafe impl Send for Vm {}
unsafe impl Sync for Vm {}

impl Vm {
    /// Create a VM with the given stack capacity (in values), semi-space
    /// size (in bytes), and peer-thread bound.
    pub fn new(stack_size: usize, heap_size: usize, max_threads: usize) -> Arc<Vm> {
        Arc::new(Vm {
            mutator: UnsafeCell::new(Mutator {
                stack: ValueStack::new(stack_size),
                heap: Heap::new(heap_size),
                ret: Value::NULL,
                reg1: Value::NULL,
                stats: Stats::default(),
            }),
            alloc_lock: ReentrantMutex::new(()),
            inbox: Mutex::new(Mailbox::new()),
            inbox_waiting: Condvar::new(),
            collections: AtomicU64::new(0),
            processes: AtomicUsize::new(0),
            max_threads,
        })
    }

    /// Create the program's root VM with default sizes and initialise the
    /// process-wide state (the shared nullary-constructor table).
    pub fn boot() -> Arc<Vm> {
        globals::init_nullaries();
        Vm::new(DEFAULT_STACK_SIZE, DEFAULT_HEAP_SIZE, 1)
    }

    /// Exclusive access to the mutator state.
    ///
    /// # Safety
    /// The caller must be the VM's owning thread, or a peer holding this
    /// VM's allocation lock while the owner is quiescent with respect to the
    /// heap (the send path).  No other reference returned by this method may
    /// be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn mutator(&self) -> &mut Mutator {
        unsafe { &mut *self.mutator.get() }
    }

    /// Returns `true` when this VM has live peers and must lock allocations.
    #[inline]
    pub(crate) fn has_peers(&self) -> bool {
        self.processes.load(Ordering::Relaxed) > 0
    }

    /// Peer-thread bound this VM was created with.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Number of completed collection cycles.
    pub fn collection_count(&self) -> u64 {
        self.collections.load(Ordering::Acquire)
    }

    /// Allocate a zeroed chunk for a payload of `size` bytes, collecting if
    /// the heap is full.  Fatal if the request still does not fit after a
    /// collection.
    ///
    /// `outer` marks calls made inside an existing allocation scope (an
    /// [`AllocScope`] or a send holding the allocation lock): the lock is
    /// not re-taken.
    pub(crate) fn allocate(&self, size: usize, outer: bool) -> *mut Object {
        let _guard = (!outer && self.has_peers()).then(|| self.alloc_lock.lock());
        {
            // SAFETY: owning thread, or sender holding the allocation lock.
            let m = unsafe { self.mutator() };
            if let Some(ptr) = m.heap.bump(size, &mut m.stats) {
                return ptr;
            }
        }
        collect(self);
        // SAFETY: as above; the collector has released its borrow.
        let m = unsafe { self.mutator() };
        match m.heap.bump(size, &mut m.stats) {
            Some(ptr) => ptr,
            None => fatal(RotorError::HeapExhausted { requested: size }),
        }
    }

    /// Allocate `size` bytes of zeroed managed memory.
    ///
    /// The chunk carries no object header and nothing references it, so it
    /// is reclaimed at the next collection; callers use it for transient
    /// scratch storage only.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        self.allocate(size, false) as *mut u8
    }

    /// Reallocate a scratch chunk: allocate `size` bytes and copy
    /// `old_size` bytes from `old`.
    ///
    /// # Safety
    /// `old` must be a pointer previously returned by [`alloc`][Self::alloc]
    /// with at least `old_size` valid bytes, not yet invalidated by a
    /// collection.
    pub unsafe fn realloc(&self, old: *const u8, old_size: usize, size: usize) -> *mut u8 {
        let ptr = self.alloc(size);
        // SAFETY: both chunks are valid for `old_size` bytes and distinct.
        unsafe { std::ptr::copy_nonoverlapping(old, ptr, old_size.min(size)) };
        ptr
    }

    /// Release a scratch chunk.  A no-op: the collector owns the memory.
    pub fn free(&self, _ptr: *mut u8, _size: usize) {}

    /// Pre-reserve `size` bytes of heap space.
    ///
    /// If the request would not fit, the collection runs *now* — before the
    /// caller takes any heap pointer it would need to keep live.  Until the
    /// returned scope is dropped the bump pointer cannot move under the
    /// caller: no collection will run, and (when this VM has peers) the
    /// allocation lock is held.  Construct objects inside the scope with the
    /// `_outer` constructor forms.
    pub fn require_alloc(&self, size: usize) -> AllocScope<'_> {
        let needs_collection = {
            // SAFETY: owning thread.
            let m = unsafe { self.mutator() };
            !m.heap.fits(size)
        };
        if needs_collection {
            collect(self);
        }
        let lock = self.has_peers().then(|| self.alloc_lock.lock());
        AllocScope { _lock: lock }
    }

    /// Lock this VM's allocator on behalf of a peer (the send path).
    pub(crate) fn lock_allocator(&self) -> ReentrantMutexGuard<'_, ()> {
        self.alloc_lock.lock()
    }

    /// Snapshot this VM's statistics.
    ///
    /// Must be called from the owning thread.
    pub fn stats(&self) -> Stats {
        // SAFETY: owning thread; no mutator reference outlives this call.
        unsafe { self.mutator() }.stats.clone()
    }
}

/// A scoped heap reservation made by [`Vm::require_alloc`].
///
/// Holding the scope guarantees the bump pointer will not move and the
/// collector will not run.  The scope records at construction whether it
/// took the allocation lock and releases exactly what it took, on every exit
/// path.
pub struct AllocScope<'vm> {
    /// `Some` iff the VM had peers at acquisition time.  Dropping the guard
    /// is `done_alloc`.
    _lock: Option<ReentrantMutexGuard<'vm, ()>>,
}

/// Render `vm`'s live stack slots and return register for diagnostics.
///
/// # Safety
/// Must be called on the owning thread, with every live slot holding a
/// valid value.
pub unsafe fn dump_stack(vm: &Vm) -> String {
    use std::fmt::Write;
    // SAFETY: owning thread per this function's contract.
    let m = unsafe { vm.mutator() };
    let mut out = String::new();
    for i in 0..m.stack.top() {
        // SAFETY: live slots hold valid values.
        let _ = writeln!(out, "{i}: {}", unsafe { object::dump_val(m.stack.slot(i)) });
    }
    // SAFETY: the return register is a root.
    let _ = writeln!(out, "RET: {}", unsafe { object::dump_val(m.ret) });
    out
}

/// Tear down a VM and return its final statistics.
///
/// Heap, stack, and inbox storage are released once the last handle drops;
/// peers still holding the `Arc` keep the memory alive until then.
///
/// Must be called from the VM's owning thread.
pub fn terminate(vm: Arc<Vm>) -> Stats {
    // SAFETY: owning thread; no mutator reference outlives this call.
    let stats = unsafe { vm.mutator() }.stats.clone();
    drop(vm);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object::{self, ClosureType};

    #[test]
    fn test_new_vm_is_empty() {
        let vm = Vm::new(64, 4096, 1);
        // SAFETY: single-threaded test, owning thread.
        let m = unsafe { vm.mutator() };
        assert_eq!(m.stack.top(), 0);
        assert_eq!(m.heap.used(), 0);
        assert!(m.ret.is_null());
        assert!(m.reg1.is_null());
        assert_eq!(vm.collection_count(), 0);
    }

    #[test]
    fn test_allocate_returns_zeroed_object_chunks() {
        let vm = Vm::new(64, 4096, 1);
        let obj = vm.allocate(32, false);
        assert!(!obj.is_null());
        assert_eq!(obj as usize % 8, 0);
        // SAFETY: freshly allocated chunk of 32 zeroed bytes.
        unsafe {
            assert_eq!(object::ty(obj), ClosureType::Con);
            assert_eq!(object::tag_arity(obj), 0);
        }
    }

    #[test]
    fn test_allocate_triggers_collection_when_full() {
        let vm = Vm::new(64, 1024, 1);
        // Exhaust the active half with garbage (nothing rooted).
        while {
            // SAFETY: single-threaded test, owning thread.
            let m = unsafe { vm.mutator() };
            m.heap.fits(16)
        } {
            vm.allocate(16, false);
        }
        let before = vm.collection_count();
        let obj = vm.allocate(16, false);
        assert!(!obj.is_null());
        assert!(
            vm.collection_count() > before,
            "exhaustion must trigger a collection"
        );
    }

    #[test]
    fn test_alloc_sequence_within_capacity_never_collects() {
        // Heap invariant: requests whose rounded chunks fit the semi-space
        // never trigger a collection, and the pointers are disjoint.
        let vm = Vm::new(64, 4096, 1);
        let sizes = [8, 9, 24, 33, 64, 120];
        let mut chunks: Vec<(usize, usize)> = Vec::new();
        for &s in &sizes {
            let p = vm.allocate(s, false) as usize;
            chunks.push((p, crate::gc::heap::round_to_chunk(s)));
        }
        assert_eq!(vm.collection_count(), 0);
        for w in chunks.windows(2) {
            let (a, a_len) = w[0];
            let (b, _) = w[1];
            assert!(a + a_len <= b, "chunks must not overlap");
        }
        for (p, _) in &chunks {
            assert_eq!(p % 8, 0, "payloads must be 8-byte aligned");
        }
    }

    #[test]
    fn test_realloc_copies_prefix() {
        let vm = Vm::new(64, 4096, 1);
        let a = vm.alloc(16);
        // SAFETY: `a` is a valid 16-byte scratch chunk.
        unsafe {
            for i in 0..16u8 {
                *a.add(i as usize) = i;
            }
            let b = vm.realloc(a, 16, 32);
            for i in 0..16u8 {
                assert_eq!(*b.add(i as usize), i);
            }
        }
    }

    #[test]
    fn test_require_alloc_scope_allows_nested_allocation() {
        let vm = Vm::new(64, 4096, 1);
        let before = vm.collection_count();
        {
            let _scope = vm.require_alloc(128);
            // Inside the scope, outer-form allocation proceeds without
            // re-locking and without collecting.
            let obj = vm.allocate(64, true);
            assert!(!obj.is_null());
        }
        assert_eq!(vm.collection_count(), before);
    }

    #[test]
    fn test_require_alloc_collects_up_front_when_full() {
        let vm = Vm::new(64, 1024, 1);
        while {
            // SAFETY: owning thread.
            let m = unsafe { vm.mutator() };
            m.heap.fits(64)
        } {
            vm.allocate(64, false);
        }
        let before = vm.collection_count();
        let _scope = vm.require_alloc(64);
        assert!(
            vm.collection_count() > before,
            "require_alloc must collect before the caller pins pointers"
        );
    }

    #[test]
    fn test_boot_creates_default_vm_and_nullaries() {
        let vm = Vm::boot();
        // SAFETY: single-threaded test, owning thread.
        let m = unsafe { vm.mutator() };
        assert_eq!(m.stack.capacity(), DEFAULT_STACK_SIZE);
        assert_eq!(m.heap.semi_space_size(), DEFAULT_HEAP_SIZE);
        // The shared constructor table is ready before any program code runs.
        let unit = crate::globals::nullary(0);
        assert!(!unit.is_null());
    }

    #[test]
    fn test_terminate_returns_stats() {
        let vm = Vm::new(64, 4096, 1);
        vm.allocate(16, false);
        vm.allocate(16, false);
        let stats = terminate(vm);
        assert_eq!(stats.allocations, 2);
        assert!(stats.allocated_bytes > 0);
    }

    #[test]
    fn test_dump_stack_renders_roots() {
        let vm = Vm::new(64, 4096, 1);
        let s = crate::objects::string::mk_str(&vm, Some(b"word"));
        // SAFETY: single-threaded test, owning thread.
        unsafe {
            let m = vm.mutator();
            m.stack.push(Value::from_int(3));
            m.stack.push(s);
            m.ret = Value::from_int(-1);
        }
        // SAFETY: all roots are live.
        let dump = unsafe { dump_stack(&vm) };
        assert!(dump.contains("0: 3"));
        assert!(dump.contains("STR[word]"));
        assert!(dump.contains("RET: -1"));
    }
}
