//! Algebraic-constructor objects.

use crate::globals;
use crate::objects::object::{self, ClosureType, HEADER_SIZE};
use crate::objects::tagged::Value;
use crate::vm::Vm;

/// Build a constructor value with the given `tag` and fields.
///
/// Arity-0 constructors with tags below 256 are interned: the returned value
/// aliases the process-global nullary table, pointer-identical across every
/// VM, and is never copied by any collector.
///
/// This is the *safe* form: the allocation may trigger a collection, which
/// relocates every heap object not reachable from the VM's roots — including
/// the `args` themselves.  Call it only when every argument is an immediate,
/// or when no live heap reference (argument or otherwise) is held across the
/// call.  Otherwise pre-reserve with [`Vm::require_alloc`] and use
/// [`mk_con_outer`].
pub fn mk_con(vm: &Vm, tag: u32, args: &[Value]) -> Value {
    build(vm, tag, args, false)
}

/// [`mk_con`] for callers inside an allocation scope.
///
/// Assumes the caller holds a [`Vm::require_alloc`] reservation (or the
/// VM's allocation lock, on the send path): the allocation lock is not
/// re-taken and no collection can run.
pub fn mk_con_outer(vm: &Vm, tag: u32, args: &[Value]) -> Value {
    build(vm, tag, args, true)
}

fn build(vm: &Vm, tag: u32, args: &[Value], outer: bool) -> Value {
    if args.is_empty() && tag < 256 {
        return globals::nullary(tag as u8);
    }
    let obj = vm.allocate(HEADER_SIZE + args.len() * std::mem::size_of::<Value>(), outer);
    // SAFETY: `obj` is a fresh chunk sized for the header plus `args` fields.
    unsafe {
        object::set_ty(obj, ClosureType::Con);
        (*obj).tag_arity = object::pack_tag_arity(tag, args.len());
        for (i, &arg) in args.iter().enumerate() {
            object::set_con_arg(obj, i, arg);
        }
    }
    // SAFETY: `obj` is non-null and 8-byte aligned.
    unsafe { Value::from_object(obj) }
}

/// Constructor tag of `v`.
///
/// # Safety
/// `v` must hold a live CON object.
pub unsafe fn tag(v: Value) -> u32 {
    let obj = v.as_object().expect("tag of a non-object");
    unsafe { object::con_tag(obj) }
}

/// Field count of `v`.
///
/// # Safety
/// `v` must hold a live CON object.
pub unsafe fn arity(v: Value) -> usize {
    let obj = v.as_object().expect("arity of a non-object");
    unsafe { object::con_arity(obj) }
}

/// Field `i` of `v`.
///
/// # Safety
/// `v` must hold a live CON object with more than `i` fields.
pub unsafe fn arg(v: Value, i: usize) -> Value {
    let obj = v.as_object().expect("field of a non-object");
    unsafe { object::con_arg(obj, i) }
}
