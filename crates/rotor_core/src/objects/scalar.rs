//! Scalar heap values: floats, fixed-width integers, and pointer payloads.
//!
//! Every constructor comes in two forms: the safe form, which may trigger a
//! collection, and the `_outer` form for callers already inside a
//! [`Vm::require_alloc`] scope or a send holding the allocation lock.

use crate::objects::object::{
    self, ClosureType, Object, HEADER_SIZE, MANAGED_DATA_OFFSET, WORD_SIZE,
};
use crate::objects::tagged::Value;
use crate::vm::Vm;

/// Payload size shared by FLOAT, BITS*, PTR, and BIGINT chunks: the header
/// plus one 8-byte slot.
const SCALAR_SIZE: usize = HEADER_SIZE + WORD_SIZE;

fn scalar(vm: &Vm, ty: ClosureType, outer: bool) -> *mut Object {
    let obj = vm.allocate(SCALAR_SIZE, outer);
    // SAFETY: `obj` is a fresh chunk with room for the 8-byte payload.
    unsafe { object::set_ty(obj, ty) };
    obj
}

/// Build a FLOAT value.
pub fn mk_float(vm: &Vm, val: f64) -> Value {
    build_float(vm, val, false)
}

/// [`mk_float`] for callers inside an allocation scope.
pub fn mk_float_outer(vm: &Vm, val: f64) -> Value {
    build_float(vm, val, true)
}

fn build_float(vm: &Vm, val: f64, outer: bool) -> Value {
    let obj = scalar(vm, ClosureType::Float, outer);
    // SAFETY: FLOAT payload is an f64 at the payload offset.
    unsafe {
        *object::payload::<f64>(obj) = val;
        Value::from_object(obj)
    }
}

/// Build a BITS8 value.
pub fn mk_b8(vm: &Vm, bits: u8) -> Value {
    build_b8(vm, bits, false)
}

/// [`mk_b8`] for callers inside an allocation scope.
pub fn mk_b8_outer(vm: &Vm, bits: u8) -> Value {
    build_b8(vm, bits, true)
}

fn build_b8(vm: &Vm, bits: u8, outer: bool) -> Value {
    let obj = scalar(vm, ClosureType::Bits8, outer);
    // SAFETY: BITS8 payload is a u8 at the payload offset.
    unsafe {
        *object::payload::<u8>(obj) = bits;
        Value::from_object(obj)
    }
}

/// Build a BITS16 value.
pub fn mk_b16(vm: &Vm, bits: u16) -> Value {
    build_b16(vm, bits, false)
}

/// [`mk_b16`] for callers inside an allocation scope.
pub fn mk_b16_outer(vm: &Vm, bits: u16) -> Value {
    build_b16(vm, bits, true)
}

fn build_b16(vm: &Vm, bits: u16, outer: bool) -> Value {
    let obj = scalar(vm, ClosureType::Bits16, outer);
    // SAFETY: BITS16 payload is a u16 at the payload offset.
    unsafe {
        *object::payload::<u16>(obj) = bits;
        Value::from_object(obj)
    }
}

/// Build a BITS32 value.
pub fn mk_b32(vm: &Vm, bits: u32) -> Value {
    build_b32(vm, bits, false)
}

/// [`mk_b32`] for callers inside an allocation scope.
pub fn mk_b32_outer(vm: &Vm, bits: u32) -> Value {
    build_b32(vm, bits, true)
}

fn build_b32(vm: &Vm, bits: u32, outer: bool) -> Value {
    let obj = scalar(vm, ClosureType::Bits32, outer);
    // SAFETY: BITS32 payload is a u32 at the payload offset.
    unsafe {
        *object::payload::<u32>(obj) = bits;
        Value::from_object(obj)
    }
}

/// Build a BITS64 value.
pub fn mk_b64(vm: &Vm, bits: u64) -> Value {
    build_b64(vm, bits, false)
}

/// [`mk_b64`] for callers inside an allocation scope.
pub fn mk_b64_outer(vm: &Vm, bits: u64) -> Value {
    build_b64(vm, bits, true)
}

fn build_b64(vm: &Vm, bits: u64, outer: bool) -> Value {
    let obj = scalar(vm, ClosureType::Bits64, outer);
    // SAFETY: BITS64 payload is a u64 at the payload offset.
    unsafe {
        *object::payload::<u64>(obj) = bits;
        Value::from_object(obj)
    }
}

/// Build a PTR value around a raw foreign pointer.
///
/// The payload is unmanaged: the runtime never dereferences or frees it.
pub fn mk_ptr(vm: &Vm, ptr: *mut u8) -> Value {
    build_ptr(vm, ClosureType::Ptr, ptr, false)
}

/// [`mk_ptr`] for callers inside an allocation scope.
pub fn mk_ptr_outer(vm: &Vm, ptr: *mut u8) -> Value {
    build_ptr(vm, ClosureType::Ptr, ptr, true)
}

/// Build a BIGINT value around an opaque big-integer handle.
///
/// The handle points into the numeric library's arena; the collector copies
/// only the header, and the cross-VM deep copy routes the handle through the
/// registered duplicator.
pub fn mk_bigint(vm: &Vm, handle: *mut u8) -> Value {
    build_ptr(vm, ClosureType::BigInt, handle, false)
}

/// [`mk_bigint`] for callers inside an allocation scope.
pub fn mk_bigint_outer(vm: &Vm, handle: *mut u8) -> Value {
    build_ptr(vm, ClosureType::BigInt, handle, true)
}

fn build_ptr(vm: &Vm, ty: ClosureType, ptr: *mut u8, outer: bool) -> Value {
    let obj = scalar(vm, ty, outer);
    // SAFETY: PTR/BIGINT payload is a pointer at the payload offset.
    unsafe {
        *object::payload::<*mut u8>(obj) = ptr;
        Value::from_object(obj)
    }
}

/// Build a MANAGEDPTR value owning a copy of `data`.
pub fn mk_managed(vm: &Vm, data: &[u8]) -> Value {
    build_managed(vm, data, false)
}

/// [`mk_managed`] for callers inside an allocation scope.
pub fn mk_managed_outer(vm: &Vm, data: &[u8]) -> Value {
    build_managed(vm, data, true)
}

fn build_managed(vm: &Vm, data: &[u8], outer: bool) -> Value {
    let obj = vm.allocate(MANAGED_DATA_OFFSET + data.len(), outer);
    // SAFETY: the chunk has room for the size word and `data.len()` bytes.
    unsafe {
        object::set_ty(obj, ClosureType::ManagedPtr);
        *object::payload::<usize>(obj) = data.len();
        std::ptr::copy_nonoverlapping(data.as_ptr(), object::managed_data(obj), data.len());
        Value::from_object(obj)
    }
}

// ── Accessors ─────────────────────────────────────────────────────────────────

/// Read a FLOAT value.
///
/// # Safety
/// `v` must hold a live FLOAT object.
pub unsafe fn get_float(v: Value) -> f64 {
    let obj = v.as_object().expect("float of a non-object");
    debug_assert_eq!(unsafe { object::ty(obj) }, ClosureType::Float);
    unsafe { object::float_val(obj) }
}

/// Read a BITS8 value.
///
/// # Safety
/// `v` must hold a live BITS8 object.
pub unsafe fn get_b8(v: Value) -> u8 {
    let obj = v.as_object().expect("bits8 of a non-object");
    debug_assert_eq!(unsafe { object::ty(obj) }, ClosureType::Bits8);
    unsafe { object::bits8_val(obj) }
}

/// Read a BITS16 value.
///
/// # Safety
/// `v` must hold a live BITS16 object.
pub unsafe fn get_b16(v: Value) -> u16 {
    let obj = v.as_object().expect("bits16 of a non-object");
    debug_assert_eq!(unsafe { object::ty(obj) }, ClosureType::Bits16);
    unsafe { object::bits16_val(obj) }
}

/// Read a BITS32 value.
///
/// # Safety
/// `v` must hold a live BITS32 object.
pub unsafe fn get_b32(v: Value) -> u32 {
    let obj = v.as_object().expect("bits32 of a non-object");
    debug_assert_eq!(unsafe { object::ty(obj) }, ClosureType::Bits32);
    unsafe { object::bits32_val(obj) }
}

/// Read a BITS64 value.
///
/// # Safety
/// `v` must hold a live BITS64 object.
pub unsafe fn get_b64(v: Value) -> u64 {
    let obj = v.as_object().expect("bits64 of a non-object");
    debug_assert_eq!(unsafe { object::ty(obj) }, ClosureType::Bits64);
    unsafe { object::bits64_val(obj) }
}

/// Read a PTR or BIGINT payload.
///
/// # Safety
/// `v` must hold a live PTR or BIGINT object.
pub unsafe fn get_ptr(v: Value) -> *mut u8 {
    let obj = v.as_object().expect("pointer of a non-object");
    unsafe { object::ptr_val(obj) }
}

/// Read a MANAGEDPTR's inline bytes.
///
/// # Safety
/// `v` must hold a live MANAGEDPTR object; the slice is valid only until
/// the owning VM's next collection.
pub unsafe fn get_managed<'h>(v: Value) -> &'h [u8] {
    let obj = v.as_object().expect("managed bytes of a non-object");
    debug_assert_eq!(unsafe { object::ty(obj) }, ClosureType::ManagedPtr);
    unsafe {
        std::slice::from_raw_parts(
            object::managed_data(obj) as *const u8,
            object::managed_size(obj),
        )
    }
}
