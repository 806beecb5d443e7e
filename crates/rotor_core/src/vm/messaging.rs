//! Cross-VM messaging: deep copy, send, receive, and thread spawning.
//!
//! # Send protocol
//!
//! A send from *S* to *D* never shares heap storage: the value graph is
//! deep-copied into *D*'s heap while *S* holds *D*'s allocation lock.  The
//! copy itself may exhaust *D*'s heap and run *D*'s collector inline on the
//! sending thread; the partially-built copy is unrooted in *D*, so the
//! collector discards it and relocates everything else.  *S* detects this
//! through *D*'s collection counter and simply copies again — the second
//! attempt is guaranteed room because *D* just collected.  Only then is the
//! finished copy appended to *D*'s inbox and the receiver woken.
//!
//! # Ordering
//!
//! The inbox append happens under the inbox lock and removal shifts
//! remaining entries down, so messages from one sender are observed in send
//! order.  Nothing is promised about the interleaving of different senders.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use smallvec::SmallVec;

use crate::error::{fatal, RotorError, RotorResult};
use crate::globals;
use crate::objects::buffer;
use crate::objects::cons;
use crate::objects::object::{self, ClosureType, Object};
use crate::objects::scalar;
use crate::objects::simd;
use crate::objects::string;
use crate::objects::tagged::Value;
use crate::vm::mailbox::Message;
use crate::vm::Vm;

// ── Deep copy ─────────────────────────────────────────────────────────────────

/// Deep-copy `v` into `dest`'s heap and return the copy.
///
/// Immediates and the null value pass through.  Arity-0 constructors with
/// tags below 256 alias the process-global nullary table without copying.
/// Constructor fields are traversed with an explicit worklist, so arbitrarily
/// deep value graphs cannot overflow the native stack.  BIGINT handles are
/// routed through the registered duplicator; MANAGEDPTR bytes are copied
/// verbatim; PTR payloads are passed through unchanged.
///
/// # Safety
/// Every object reachable from `v` must be live in the calling thread's VM.
/// The caller must hold `dest`'s allocation lock unless `dest` cannot yet be
/// reached by any other thread.
pub unsafe fn copy_to(dest: &Vm, v: Value) -> Value {
    let mut work: SmallVec<[*mut Object; 16]> = SmallVec::new();
    let root = unsafe { copy_value(dest, v, &mut work) };
    while let Some(con) = work.pop() {
        // `con` is a fresh copy whose fields still reference the source
        // graph; patch each one with its own copy.
        unsafe {
            for i in 0..object::con_arity(con) {
                let field = object::con_arg(con, i);
                let copied = copy_value(dest, field, &mut work);
                object::set_con_arg(con, i, copied);
            }
        }
    }
    root
}

/// Copy a single node, queueing constructor copies for field patching.
///
/// # Safety
/// As [`copy_to`].
unsafe fn copy_value(dest: &Vm, v: Value, work: &mut SmallVec<[*mut Object; 16]>) -> Value {
    let obj = match v.as_object() {
        None => return v,
        Some(obj) => obj,
    };
    unsafe {
        match object::ty(obj) {
            ClosureType::Con => {
                let arity = object::con_arity(obj);
                let tag = object::con_tag(obj);
                if arity == 0 && tag < 256 {
                    // Globally interned; shared by reference across VMs.
                    return v;
                }
                let fields = std::slice::from_raw_parts(object::con_args(obj), arity);
                let copy = cons::mk_con_outer(dest, tag, fields);
                work.push(copy.as_object().expect("fresh constructor"));
                copy
            }
            ClosureType::Float => scalar::mk_float_outer(dest, object::float_val(obj)),
            ClosureType::String => {
                if object::str_is_placeholder(obj) {
                    string::mk_str_outer(dest, None)
                } else {
                    string::mk_str_outer(dest, Some(string::get_str(v)))
                }
            }
            // A shared tail crossing a VM boundary is materialised flat;
            // its root stays behind in the sender's heap.
            ClosureType::StrOffset => string::mk_str_outer(dest, Some(string::get_str(v))),
            ClosureType::Buffer => {
                let b = object::buffer(obj);
                buffer::mk_buffer_outer(dest, (*b).cap, (*b).fill, buffer::bytes(v))
            }
            ClosureType::BigInt => {
                scalar::mk_bigint_outer(dest, globals::dup_bigint(object::ptr_val(obj)))
            }
            ClosureType::Ptr => scalar::mk_ptr_outer(dest, object::ptr_val(obj)),
            ClosureType::ManagedPtr => scalar::mk_managed_outer(dest, scalar::get_managed(v)),
            ClosureType::Bits8 => scalar::mk_b8_outer(dest, object::bits8_val(obj)),
            ClosureType::Bits16 => scalar::mk_b16_outer(dest, object::bits16_val(obj)),
            ClosureType::Bits32 => scalar::mk_b32_outer(dest, object::bits32_val(obj)),
            ClosureType::Bits64 => scalar::mk_b64_outer(dest, object::bits64_val(obj)),
            ty @ (ClosureType::Bits8x16
            | ClosureType::Bits16x8
            | ClosureType::Bits32x4
            | ClosureType::Bits64x2) => {
                simd::mk_vector_outer(dest, ty, simd::lane_bytes(v))
            }
            other @ ClosureType::Fwd => fatal(RotorError::UnhandledTag {
                op: "copy_to",
                ty: other,
            }),
        }
    }
}

// ── Send ─────────────────────────────────────────────────────────────────────

/// Send `msg` from `sender` to `dest`; a full inbox is fatal.
///
/// # Safety
/// As [`try_send_message`].
pub unsafe fn send_message(sender: &Arc<Vm>, dest: &Arc<Vm>, msg: Value) {
    if let Err(e) = unsafe { try_send_message(sender, dest, msg) } {
        fatal(e);
    }
}

/// Send `msg` from `sender` to `dest`, reporting a full inbox.
///
/// # Safety
/// The calling thread must own `sender`, and every object reachable from
/// `msg` must be live in `sender`'s heap.
pub unsafe fn try_send_message(
    sender: &Arc<Vm>,
    dest: &Arc<Vm>,
    msg: Value,
) -> RotorResult<()> {
    // If dest collects while we copy, the copy is garbage; detect through
    // the collection counter and copy again — the collection that ran
    // guarantees the retry room.
    let collections_before = dest.collection_count();
    let mut copied = {
        let _alloc = dest.lock_allocator();
        unsafe { copy_to(dest, msg) }
    };
    if dest.collection_count() > collections_before {
        let _alloc = dest.lock_allocator();
        copied = unsafe { copy_to(dest, msg) };
    }

    let mut inbox = dest.inbox.lock();
    inbox.try_push(Message::new(sender.clone(), copied))?;
    dest.inbox_waiting.notify_one();
    Ok(())
}

// ── Receive ──────────────────────────────────────────────────────────────────

/// How long a blocked receiver sleeps between inbox re-scans.
const RECV_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Non-blocking scan: the sender of the first pending message, if any.
pub fn check_messages(vm: &Vm) -> Option<Arc<Vm>> {
    check_messages_from(vm, None)
}

/// Non-blocking scan, optionally restricted to one sender.
pub fn check_messages_from(vm: &Vm, sender: Option<&Arc<Vm>>) -> Option<Arc<Vm>> {
    let inbox = vm.inbox.lock();
    inbox.find(sender).map(|i| inbox.entry(i).sender().clone())
}

/// Block until a message arrives, then remove and return it.
///
/// Waiting on a VM with no live peer is fatal ("No messages waiting"):
/// nothing can ever satisfy the receive.
pub fn recv_message(vm: &Vm) -> Message {
    recv_from(vm, None)
}

/// Block until a message from `sender` arrives, then remove and return it.
///
/// Fatal under the same no-peers condition as [`recv_message`].
pub fn recv_message_from(vm: &Vm, sender: &Arc<Vm>) -> Message {
    recv_from(vm, Some(sender))
}

fn recv_from(vm: &Vm, sender: Option<&Arc<Vm>>) -> Message {
    let mut inbox = vm.inbox.lock();
    loop {
        if let Some(i) = inbox.find(sender) {
            return inbox.remove(i);
        }
        // The timed wait is purely a re-poll bound; a signal arrives with
        // the inbox lock released, so the next scan sees the append.
        let timed_out = vm
            .inbox_waiting
            .wait_for(&mut inbox, RECV_POLL_INTERVAL)
            .timed_out();
        // A wake with nothing queued is normal while peers exist; with no
        // peer left, no message can ever arrive.
        if timed_out && !vm.has_peers() {
            fatal(RotorError::NoMessagesWaiting);
        }
    }
}

// ── Thread spawning ──────────────────────────────────────────────────────────

/// A spawned child VM and the thread driving it.
pub struct VmThread {
    /// The child's handle, valid as a send destination immediately.
    pub vm: Arc<Vm>,
    /// The thread running the child's entry function.
    pub handle: JoinHandle<()>,
}

impl VmThread {
    /// Wait for the child's entry function to finish.
    ///
    /// # Panics
    /// Propagates a panic from the child thread.
    pub fn join(self) {
        self.handle.join().expect("child VM thread panicked");
    }
}

/// Spawn a child VM on a fresh thread.
///
/// The child inherits the parent's stack capacity, semi-space size, and
/// thread bound.  `arg` is deep-copied into the child's heap and pushed as
/// the first stack slot of the entry frame before `f` runs.  The parent's
/// process count rises for the child's lifetime, switching both VMs into
/// locked allocation.
///
/// # Safety
/// The calling thread must own `parent`, and every object reachable from
/// `arg` must be live in `parent`'s heap.
pub unsafe fn vm_thread<F>(parent: &Arc<Vm>, f: F, arg: Value) -> VmThread
where
    F: FnOnce(&Arc<Vm>) + Send + 'static,
{
    let (stack_size, heap_size) = {
        // SAFETY: calling thread owns `parent`.
        let m = unsafe { parent.mutator() };
        (m.stack.capacity(), m.heap.semi_space_size())
    };
    let child = Vm::new(stack_size, heap_size, parent.max_threads());
    // The child can exchange messages from its first instruction.
    child.processes.store(1, Ordering::Relaxed);

    // The child thread does not exist yet, but take its allocation lock for
    // the copy anyway: the protocol is identical to a send.
    let arg_copy = {
        let _alloc = child.lock_allocator();
        // SAFETY: `arg` is live in the parent per this function's contract.
        unsafe { copy_to(&child, arg) }
    };

    parent.processes.fetch_add(1, Ordering::Relaxed);

    let spawned = child.clone();
    let parent_handle = parent.clone();
    let handle = std::thread::spawn(move || {
        // SAFETY: this thread is the child's owner from here on.
        unsafe {
            let m = spawned.mutator();
            m.stack.set_top_slot(0, arg_copy);
            m.stack.base_to_top(0);
            m.stack.add_top(1);
        }
        f(&spawned);
        parent_handle.processes.fetch_sub(1, Ordering::Relaxed);
    });

    VmThread { vm: child, handle }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object;

    /// A modestly-sized VM for messaging tests; children inherit its sizes.
    fn small_vm() -> Arc<Vm> {
        Vm::new(1024, 1 << 20, 1)
    }

    /// Walk a value graph, asserting no object pointer lands in `vm`'s heap.
    ///
    /// # Safety
    /// The graph must be live.
    unsafe fn assert_disjoint_from(vm: &Vm, v: Value) {
        let Some(obj) = v.as_object() else { return };
        // SAFETY: single mutator quiescent during the assertion.
        let heap = &unsafe { vm.mutator() }.heap;
        assert!(
            !heap.contains(obj),
            "copied value must not reference the source heap"
        );
        unsafe {
            if object::ty(obj) == ClosureType::Con {
                for i in 0..object::con_arity(obj) {
                    assert_disjoint_from(vm, object::con_arg(obj, i));
                }
            }
        }
    }

    #[test]
    fn test_copy_to_leaves_immediates_untouched() {
        let a = Vm::new(64, 4096, 1);
        // SAFETY: immediates reference no heap.
        unsafe {
            assert_eq!(copy_to(&a, Value::from_int(-42)).as_int(), Some(-42));
            assert!(copy_to(&a, Value::NULL).is_null());
        }
    }

    #[test]
    fn test_copy_to_clones_graph_into_destination() {
        let src = Vm::new(64, 65536, 1);
        let dst = Vm::new(64, 65536, 1);
        let s = string::mk_str(&src, Some(b"payload"));
        let graph = {
            let _scope = src.require_alloc(64);
            cons::mk_con_outer(&src, 7, &[s, Value::from_int(99)])
        };

        // SAFETY: `graph` is live in `src`; `dst` is unreachable by others.
        let copy = unsafe { copy_to(&dst, graph) };

        // SAFETY: both graphs are live; no collections have run.
        unsafe {
            assert_ne!(copy.raw(), graph.raw());
            assert_disjoint_from(&src, copy);
            assert_eq!(cons::tag(copy), 7);
            assert_eq!(cons::arity(copy), 2);
            assert_eq!(string::get_str(cons::arg(copy, 0)), b"payload");
            assert_eq!(cons::arg(copy, 1).as_int(), Some(99));
        }
    }

    #[test]
    fn test_copy_to_interns_nullaries() {
        let src = Vm::new(64, 4096, 1);
        let dst = Vm::new(64, 4096, 1);
        let nullary = cons::mk_con(&src, 11, &[]);
        // SAFETY: nullary-table entries are always live.
        let copy = unsafe { copy_to(&dst, nullary) };
        assert_eq!(
            copy.raw(),
            nullary.raw(),
            "interned constructors cross VMs by reference"
        );
    }

    #[test]
    fn test_copy_to_materialises_shared_tails() {
        let src = Vm::new(64, 65536, 1);
        let dst = Vm::new(64, 65536, 1);
        let s = string::mk_str(&src, Some(b"shared tail"));
        // SAFETY: `s` is live in `src`.
        unsafe {
            let tail = string::str_tail(&src, s);
            let copy = copy_to(&dst, tail);
            let obj = copy.as_object().unwrap();
            assert_eq!(object::ty(obj), ClosureType::String);
            assert_eq!(string::get_str(copy), b"hared tail");
        }
    }

    #[test]
    fn test_copy_to_deep_list_does_not_recurse() {
        // A worklist copy must handle a list far deeper than any native
        // stack would allow a recursive one.
        let src = Vm::new(64, 8 << 20, 1);
        let dst = Vm::new(64, 8 << 20, 1);
        let mut list = cons::mk_con(&src, 0, &[]);
        {
            let _scope = src.require_alloc(200_000 * 32);
            for i in 0..100_000_i64 {
                list = cons::mk_con_outer(&src, 1, &[Value::from_int(i), list]);
            }
        }
        // SAFETY: `list` is live in `src`.
        let copy = unsafe { copy_to(&dst, list) };
        // Spot-check the spine.
        // SAFETY: the copy is live in `dst`.
        unsafe {
            let mut cur = copy;
            for i in (0..100_000_i64).rev().take(64) {
                assert_eq!(cons::arg(cur, 0).as_int(), Some(i));
                cur = cons::arg(cur, 1);
            }
        }
    }

    #[test]
    fn test_send_and_recv_round_trip() {
        let parent = small_vm();
        // SAFETY: the child closure owns its VM; values are live at send.
        let child = unsafe {
            vm_thread(
                &parent,
                |me| {
                    let msg = recv_message(me);
                    // SAFETY: the received value lives in this VM's heap.
                    unsafe {
                        assert_eq!(cons::tag(msg.value()), 7);
                        assert_eq!(cons::arity(msg.value()), 2);
                        assert_eq!(string::get_str(cons::arg(msg.value(), 0)), b"ping");
                        assert_eq!(cons::arg(msg.value(), 1).as_int(), Some(99));
                    }
                },
                Value::NULL,
            )
        };

        let s = string::mk_str(&parent, Some(b"ping"));
        let msg = {
            let _scope = parent.require_alloc(64);
            cons::mk_con_outer(&parent, 7, &[s, Value::from_int(99)])
        };
        // SAFETY: `msg` is live in `parent`.
        unsafe { send_message(&parent, &child.vm, msg) };
        child.join();
    }

    #[test]
    fn test_per_sender_fifo_order() {
        let parent = small_vm();
        // SAFETY: the child closure owns its VM.
        let child = unsafe {
            vm_thread(
                &parent,
                |me| {
                    for expected in 1..=3_i64 {
                        let msg = recv_message(me);
                        assert_eq!(msg.value().as_int(), Some(expected));
                    }
                },
                Value::NULL,
            )
        };
        for n in 1..=3_i64 {
            // SAFETY: immediates reference no heap.
            unsafe { send_message(&parent, &child.vm, Value::from_int(n)) };
        }
        child.join();
    }

    #[test]
    fn test_recv_message_from_filters_by_sender() {
        let receiver = small_vm();
        let other = Vm::new(64, 4096, 1);
        // Stage two messages by hand: a decoy from `other` first.
        receiver
            .inbox
            .lock()
            .try_push(Message::new(other.clone(), Value::from_int(-1)))
            .unwrap();
        receiver
            .inbox
            .lock()
            .try_push(Message::new(receiver.clone(), Value::from_int(5)))
            .unwrap();

        let msg = recv_message_from(&receiver, &receiver);
        assert_eq!(msg.value().as_int(), Some(5));
        assert!(Arc::ptr_eq(msg.sender(), &receiver));
        // The decoy is still queued.
        assert_eq!(receiver.inbox.lock().len(), 1);
    }

    #[test]
    fn test_check_messages_reports_sender_without_removing() {
        let receiver = small_vm();
        let other = Vm::new(64, 4096, 1);
        assert!(check_messages(&receiver).is_none());
        receiver
            .inbox
            .lock()
            .try_push(Message::new(other.clone(), Value::from_int(1)))
            .unwrap();
        let seen = check_messages(&receiver).expect("message pending");
        assert!(Arc::ptr_eq(&seen, &other));
        assert_eq!(receiver.inbox.lock().len(), 1, "check must not remove");
        assert!(check_messages_from(&receiver, Some(&receiver)).is_none());
    }

    #[test]
    fn test_send_to_full_inbox_reports_error() {
        let sender = small_vm();
        let receiver = Vm::new(64, 65536, 1);
        {
            let mut inbox = receiver.inbox.lock();
            for i in 0..crate::vm::mailbox::INBOX_CAPACITY {
                inbox
                    .try_push(Message::new(sender.clone(), Value::from_int(i as i64)))
                    .unwrap();
            }
        }
        // SAFETY: immediates reference no heap.
        let result = unsafe { try_send_message(&sender, &receiver, Value::from_int(0)) };
        assert!(matches!(result, Err(RotorError::InboxFull)));
    }

    #[test]
    fn test_collection_during_send_retries_and_delivers() {
        let parent = small_vm();
        let parent_handle = parent.clone();
        let payload: Vec<u8> = (0..64u8).cycle().take(512).collect();
        let expected = payload.clone();

        // The child nearly fills its own heap, reports readiness, and only
        // then receives, so the parent's deep copy is guaranteed to force
        // the child's collector mid-send.
        // SAFETY: the child closure owns its VM; the ready signal is an
        // immediate.
        let child = unsafe {
            vm_thread(
                &parent,
                move |me| {
                    // Burn heap space until less than one small chunk's
                    // worth remains, so the incoming copy cannot fit.
                    while {
                        // SAFETY: owning thread.
                        let m = me.mutator();
                        m.heap.fits(256)
                    } {
                        me.allocate(64, false);
                    }
                    send_message(me, &parent_handle, Value::from_int(0));
                    let msg = recv_message(me);
                    assert!(
                        me.collection_count() > 0,
                        "the send must have collected this heap"
                    );
                    // SAFETY: the received value lives in this VM's heap.
                    unsafe {
                        assert_eq!(cons::tag(msg.value()), 2);
                        assert_eq!(string::get_str(cons::arg(msg.value(), 0)), &expected[..]);
                        assert_eq!(cons::arg(msg.value(), 1).as_int(), Some(512));
                    }
                },
                Value::NULL,
            )
        };
        // Wait until the child's heap is in its cramped state.
        let ready = recv_message(&parent);
        assert_eq!(ready.value().as_int(), Some(0));

        let s = string::mk_str(&parent, Some(&payload));
        let msg = {
            let _scope = parent.require_alloc(64);
            cons::mk_con_outer(&parent, 2, &[s, Value::from_int(512)])
        };
        // SAFETY: `msg` is live in `parent`.
        unsafe { send_message(&parent, &child.vm, msg) };
        child.join();
    }

    #[test]
    fn test_copied_message_is_disjoint_from_sender_heap() {
        let parent = small_vm();
        let echo_parent = parent.clone();
        // SAFETY: the child closure owns its VM.
        let child = unsafe {
            vm_thread(
                &parent,
                move |me| {
                    let msg = recv_message(me);
                    // SAFETY: the graph is live in this VM.
                    unsafe { assert_disjoint_from(&echo_parent, msg.value()) };
                },
                Value::NULL,
            )
        };
        let s = string::mk_str(&parent, Some(b"no aliasing"));
        let msg = {
            let _scope = parent.require_alloc(64);
            cons::mk_con_outer(&parent, 1, &[s])
        };
        // SAFETY: `msg` is live in `parent`.
        unsafe { send_message(&parent, &child.vm, msg) };
        child.join();
    }

    #[test]
    fn test_vm_thread_pushes_argument_on_child_stack() {
        let parent = small_vm();
        let s = string::mk_str(&parent, Some(b"handover"));
        // SAFETY: `s` is live in `parent`; the child closure owns its VM.
        let child = unsafe {
            vm_thread(
                &parent,
                |me| {
                    // SAFETY: owning thread; the argument was rooted by the
                    // spawn path.
                    unsafe {
                        let m = me.mutator();
                        assert_eq!(m.stack.top(), 1);
                        assert_eq!(string::get_str(m.stack.loc(0)), b"handover");
                    }
                },
                s,
            )
        };
        child.join();
        assert_eq!(
            parent.processes.load(Ordering::Relaxed),
            0,
            "child exit must release the parent's process count"
        );
    }
}
