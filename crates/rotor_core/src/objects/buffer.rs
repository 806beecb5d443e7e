//! Growable byte buffers with endian-exact append and peek.
//!
//! A BUFFER chunk holds `(cap, fill)` followed by `cap` store bytes.  The
//! whole payload (header included) is sized to a power of two, so repeated
//! appends amortise their copies.  An append bumps `fill` in place when the
//! caller's view still covers the current fill and capacity suffices;
//! otherwise it allocates a fresh buffer and copies.
//!
//! Little-endian appends put the value's low byte at the lowest offset, big
//! endian the high byte; the `native` forms copy raw machine bytes.

use crate::objects::object::{self, ClosureType, BUFFER_DATA_OFFSET};
use crate::objects::scalar;
use crate::objects::tagged::Value;
use crate::vm::Vm;

/// Allocate an empty buffer able to hold at least `hint` bytes.
pub fn buffer_allocate(vm: &Vm, hint: usize) -> Value {
    // `fill` is already zero in the fresh chunk.
    alloc_buffer(vm, hint, false)
}

/// Allocate a buffer chunk whose payload is the next power of two above
/// `hint` plus the header overhead.
fn alloc_buffer(vm: &Vm, hint: usize, outer: bool) -> Value {
    let payload = (hint + BUFFER_DATA_OFFSET).next_power_of_two();
    let obj = vm.allocate(payload, outer);
    // SAFETY: the chunk has room for the buffer header and its store.
    unsafe {
        object::set_ty(obj, ClosureType::Buffer);
        (*object::buffer(obj)).cap = payload - BUFFER_DATA_OFFSET;
        Value::from_object(obj)
    }
}

/// Clone an existing buffer into `vm`'s heap (the cross-VM copy path).
///
/// # Safety
/// `cap`/`fill` must describe `store`, a live byte image of the source
/// buffer.
pub(crate) unsafe fn mk_buffer_outer(vm: &Vm, cap: usize, fill: usize, store: &[u8]) -> Value {
    let v = alloc_buffer(vm, cap, true);
    let obj = v.as_object().expect("buffer chunk");
    // SAFETY: the fresh buffer's capacity is at least `cap ≥ fill`.
    unsafe {
        (*object::buffer(obj)).fill = fill;
        std::ptr::copy_nonoverlapping(store.as_ptr(), object::buffer_data(obj), fill);
    }
    v
}

// ── Accessors ─────────────────────────────────────────────────────────────────

/// Capacity of `v`'s store.
///
/// # Safety
/// `v` must hold a live BUFFER object.
pub unsafe fn cap(v: Value) -> usize {
    let obj = v.as_object().expect("buffer of a non-object");
    debug_assert_eq!(unsafe { object::ty(obj) }, ClosureType::Buffer);
    unsafe { (*object::buffer(obj)).cap }
}

/// Current fill of `v`'s store.
///
/// # Safety
/// `v` must hold a live BUFFER object.
pub unsafe fn fill(v: Value) -> usize {
    let obj = v.as_object().expect("buffer of a non-object");
    debug_assert_eq!(unsafe { object::ty(obj) }, ClosureType::Buffer);
    unsafe { (*object::buffer(obj)).fill }
}

/// The filled bytes of `v`'s store.
///
/// # Safety
/// `v` must hold a live BUFFER object; the slice is valid only until the
/// owning VM's next collection.
pub unsafe fn bytes<'h>(v: Value) -> &'h [u8] {
    let obj = v.as_object().expect("buffer of a non-object");
    unsafe {
        std::slice::from_raw_parts(
            object::buffer_data(obj) as *const u8,
            (*object::buffer(obj)).fill,
        )
    }
}

// ── Append ────────────────────────────────────────────────────────────────────

/// Make room for `app_len` more bytes after the caller's `buf_len`-byte view
/// of `buf`.
///
/// Bumps `fill` in place when the view is current and capacity suffices;
/// otherwise snapshots the view and copies it into a fresh, larger buffer.
/// Returns the buffer to write into, whose store is valid at
/// `buf_len .. buf_len + app_len`.
///
/// # Safety
/// `buf` must hold a live BUFFER object of `vm` with `buf_len ≤ fill`.
unsafe fn prepare_append(vm: &Vm, buf: Value, buf_len: usize, app_len: usize) -> Value {
    let total = buf_len + app_len;
    let (cur_fill, cur_cap) = unsafe { (fill(buf), cap(buf)) };
    if buf_len != cur_fill || total > cur_cap {
        // Snapshot before allocating: the allocation may move `buf`.
        let head: Vec<u8> = unsafe { bytes(buf) }[..buf_len].to_vec();
        let fresh = alloc_buffer(vm, total, false);
        let obj = fresh.as_object().expect("buffer chunk");
        // SAFETY: the fresh store holds at least `total` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(head.as_ptr(), object::buffer_data(obj), buf_len);
            (*object::buffer(obj)).fill = total;
        }
        fresh
    } else {
        let obj = buf.as_object().expect("buffer chunk");
        // SAFETY: capacity was just checked.
        unsafe { (*object::buffer(obj)).fill = total };
        buf
    }
}

/// Write `count` repetitions of `pattern` at `offset` in `buf`'s store.
///
/// # Safety
/// The store must have room for `count * pattern.len()` bytes at `offset`.
unsafe fn write_repeat(buf: Value, offset: usize, pattern: &[u8], count: usize) {
    let obj = buf.as_object().expect("buffer chunk");
    unsafe {
        let mut dst = object::buffer_data(obj).add(offset);
        for _ in 0..count {
            std::ptr::copy_nonoverlapping(pattern.as_ptr(), dst, pattern.len());
            dst = dst.add(pattern.len());
        }
    }
}

/// Append `count` copies of `snd`'s bytes at `snd_off .. snd_off + snd_len`
/// to the first `fst_len` bytes of `fst`.
///
/// # Safety
/// Both values must hold live BUFFER objects of `vm`, with the given ranges
/// inside their fills.
pub unsafe fn append_buffer(
    vm: &Vm,
    fst: Value,
    fst_len: usize,
    count: usize,
    snd_len: usize,
    snd_off: usize,
    snd: Value,
) -> Value {
    // Snapshot the source range: `fst` and `snd` may alias, and the append
    // may allocate.
    let pattern: Vec<u8> = unsafe { bytes(snd) }[snd_off..snd_off + snd_len].to_vec();
    let out = unsafe { prepare_append(vm, fst, fst_len, count * snd_len) };
    // SAFETY: prepare_append reserved `count * snd_len` bytes at `fst_len`.
    unsafe { write_repeat(out, fst_len, &pattern, count) };
    out
}

macro_rules! append_ops {
    ($native:ident, $le:ident, $be:ident, $ty:ty) => {
        /// Append `count` copies of `val` in machine byte order.
        ///
        /// # Safety
        /// `buf` must hold a live BUFFER object of `vm` with `len ≤ fill`.
        pub unsafe fn $native(vm: &Vm, buf: Value, len: usize, count: usize, val: $ty) -> Value {
            let out = unsafe { prepare_append(vm, buf, len, count * size_of::<$ty>()) };
            // SAFETY: the append room was just reserved.
            unsafe { write_repeat(out, len, &val.to_ne_bytes(), count) };
            out
        }

        /// Append `count` copies of `val`, low byte first.
        ///
        /// # Safety
        /// As the native form.
        pub unsafe fn $le(vm: &Vm, buf: Value, len: usize, count: usize, val: $ty) -> Value {
            let out = unsafe { prepare_append(vm, buf, len, count * size_of::<$ty>()) };
            // SAFETY: the append room was just reserved.
            unsafe { write_repeat(out, len, &val.to_le_bytes(), count) };
            out
        }

        /// Append `count` copies of `val`, high byte first.
        ///
        /// # Safety
        /// As the native form.
        pub unsafe fn $be(vm: &Vm, buf: Value, len: usize, count: usize, val: $ty) -> Value {
            let out = unsafe { prepare_append(vm, buf, len, count * size_of::<$ty>()) };
            // SAFETY: the append room was just reserved.
            unsafe { write_repeat(out, len, &val.to_be_bytes(), count) };
            out
        }
    };
}

use std::mem::size_of;

append_ops!(append_b8_native, append_b8_le, append_b8_be, u8);
append_ops!(append_b16_native, append_b16_le, append_b16_be, u16);
append_ops!(append_b32_native, append_b32_le, append_b32_be, u32);
append_ops!(append_b64_native, append_b64_le, append_b64_be, u64);

// ── Peek ─────────────────────────────────────────────────────────────────────

macro_rules! peek_ops {
    ($native:ident, $le:ident, $be:ident, $ty:ty, $mk:path) => {
        /// Read one value at `offset` in machine byte order.
        ///
        /// # Safety
        /// `buf` must hold a live BUFFER object of `vm` whose store covers
        /// the read.
        pub unsafe fn $native(vm: &Vm, buf: Value, offset: usize) -> Value {
            let raw = unsafe { read_bytes::<{ size_of::<$ty>() }>(buf, offset) };
            $mk(vm, <$ty>::from_ne_bytes(raw))
        }

        /// Read one value at `offset`, low byte first.
        ///
        /// # Safety
        /// As the native form.
        pub unsafe fn $le(vm: &Vm, buf: Value, offset: usize) -> Value {
            let raw = unsafe { read_bytes::<{ size_of::<$ty>() }>(buf, offset) };
            $mk(vm, <$ty>::from_le_bytes(raw))
        }

        /// Read one value at `offset`, high byte first.
        ///
        /// # Safety
        /// As the native form.
        pub unsafe fn $be(vm: &Vm, buf: Value, offset: usize) -> Value {
            let raw = unsafe { read_bytes::<{ size_of::<$ty>() }>(buf, offset) };
            $mk(vm, <$ty>::from_be_bytes(raw))
        }
    };
}

peek_ops!(peek_b8_native, peek_b8_le, peek_b8_be, u8, scalar::mk_b8);
peek_ops!(peek_b16_native, peek_b16_le, peek_b16_be, u16, scalar::mk_b16);
peek_ops!(peek_b32_native, peek_b32_le, peek_b32_be, u32, scalar::mk_b32);
peek_ops!(peek_b64_native, peek_b64_le, peek_b64_be, u64, scalar::mk_b64);

/// Copy `N` store bytes at `offset` out of `buf` before any allocation.
///
/// # Safety
/// `buf` must hold a live BUFFER object whose store covers
/// `offset .. offset + N`.
unsafe fn read_bytes<const N: usize>(buf: Value, offset: usize) -> [u8; N] {
    let obj = buf.as_object().expect("buffer of a non-object");
    let mut out = [0u8; N];
    unsafe {
        debug_assert!(offset + N <= (*object::buffer(obj)).cap);
        std::ptr::copy_nonoverlapping(
            object::buffer_data(obj).add(offset) as *const u8,
            out.as_mut_ptr(),
            N,
        );
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────
