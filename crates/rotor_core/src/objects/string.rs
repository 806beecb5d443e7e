//! String values and primitives.
//!
//! Strings store their bytes inline, NUL-terminated, immediately after a
//! length word.  Taking the tail of a string normally allocates a STROFFSET
//! — a `(root, byte offset)` view sharing the root's storage — instead of
//! copying; offset chains are collapsed to depth ≤ 1 at creation, and the
//! collector preserves that invariant.
//!
//! # Liveness
//!
//! Primitives that read string bytes *and* allocate snapshot the bytes into
//! owned storage first: an allocation may trigger a collection, which moves
//! every object not reachable from the VM's roots — including the
//! primitive's own arguments.

use std::io::BufRead;

use crate::error::{fatal, RotorError};
use crate::objects::object::{
    self, ClosureType, Object, HEADER_SIZE, STRING_DATA_OFFSET, STRING_NULL_FLAG, WORD_SIZE,
};
use crate::objects::scalar;
use crate::objects::tagged::Value;
use crate::vm::Vm;

/// Payload size of a STROFFSET chunk: header + root pointer + offset.
const STR_OFFSET_SIZE: usize = HEADER_SIZE + 2 * WORD_SIZE;

// ── Constructors ──────────────────────────────────────────────────────────────

/// Build a STRING value holding a copy of `bytes`.
///
/// `None` produces the placeholder string: observably empty, flagged so the
/// runtime can distinguish "no string" from the empty string.
pub fn mk_str(vm: &Vm, bytes: Option<&[u8]>) -> Value {
    build_str(vm, bytes, false)
}

/// [`mk_str`] for callers inside an allocation scope.
pub fn mk_str_outer(vm: &Vm, bytes: Option<&[u8]>) -> Value {
    build_str(vm, bytes, true)
}

fn build_str(vm: &Vm, bytes: Option<&[u8]>, outer: bool) -> Value {
    let len = bytes.map_or(0, <[u8]>::len);
    // One extra byte for the NUL terminator; the zeroed chunk supplies it.
    let obj = vm.allocate(STRING_DATA_OFFSET + len + 1, outer);
    // SAFETY: the chunk has room for the length word and `len + 1` bytes.
    unsafe {
        object::set_ty(obj, ClosureType::String);
        match bytes {
            Some(b) => {
                *object::payload::<usize>(obj) = b.len();
                std::ptr::copy_nonoverlapping(b.as_ptr(), object::str_data(obj), b.len());
            }
            None => (*obj).tag_arity = STRING_NULL_FLAG,
        }
        Value::from_object(obj)
    }
}

/// Build a STROFFSET view of `root` at `offset`.
///
/// `root` must be a flat STRING; callers collapse chains before calling.
/// Only invoked when the heap is known to have room (see [`str_tail`]), so
/// the allocation cannot move `root`.
fn build_str_offset(vm: &Vm, root: *mut Object, offset: usize) -> Value {
    let obj = vm.allocate(STR_OFFSET_SIZE, false);
    // SAFETY: the chunk has room for the STROFFSET payload.
    unsafe {
        object::set_ty(obj, ClosureType::StrOffset);
        let p = object::str_offset(obj);
        (*p).root = root;
        (*p).offset = offset;
        Value::from_object(obj)
    }
}

// ── Accessors ─────────────────────────────────────────────────────────────────

/// Resolve `v` to its character bytes (excluding the NUL terminator).
///
/// STROFFSET views resolve through their root; the placeholder string reads
/// as empty.  An offset past the root's end reads as empty rather than
/// trapping.
///
/// # Safety
/// `v` must hold a live STRING or STROFFSET object, valid until the owning
/// VM's next collection.
pub unsafe fn get_str<'h>(v: Value) -> &'h [u8] {
    let obj = v.as_object().expect("string of a non-object");
    unsafe {
        match object::ty(obj) {
            ClosureType::String => flat_bytes(obj),
            ClosureType::StrOffset => {
                let p = object::str_offset(obj);
                let root = flat_bytes((*p).root);
                root.get((*p).offset..).unwrap_or(&[])
            }
            other => panic!("get_str on a {other:?} object"),
        }
    }
}

/// Bytes of a flat STRING object.
///
/// # Safety
/// `obj` must be a live STRING object.
unsafe fn flat_bytes<'h>(obj: *mut Object) -> &'h [u8] {
    unsafe {
        debug_assert_eq!(object::ty(obj), ClosureType::String);
        if object::str_is_placeholder(obj) {
            &[]
        } else {
            std::slice::from_raw_parts(object::str_data(obj) as *const u8, object::str_len(obj))
        }
    }
}

/// Byte length of `v`.
///
/// # Safety
/// As [`get_str`].
pub unsafe fn str_len(v: Value) -> usize {
    unsafe { get_str(v).len() }
}

// ── Primitives ────────────────────────────────────────────────────────────────

/// Concatenate `l` and `r` into a fresh STRING.
///
/// # Safety
/// `l` and `r` must hold live string values of `vm`.
pub unsafe fn concat(vm: &Vm, l: Value, r: Value) -> Value {
    // Snapshot before allocating: the allocation may move both sources.
    let mut bytes = unsafe { get_str(l) }.to_vec();
    bytes.extend_from_slice(unsafe { get_str(r) });
    mk_str(vm, Some(&bytes))
}

/// Byte equality of two strings.
///
/// # Safety
/// `l` and `r` must hold live string values.
pub unsafe fn streq(l: Value, r: Value) -> bool {
    unsafe { get_str(l) == get_str(r) }
}

/// Byte-wise ordering: `l < r`.
///
/// # Safety
/// `l` and `r` must hold live string values.
pub unsafe fn strlt(l: Value, r: Value) -> bool {
    unsafe { get_str(l) < get_str(r) }
}

/// First byte of `s`, or 0 for the empty string.
///
/// # Safety
/// `s` must hold a live string value.
pub unsafe fn str_head(s: Value) -> i64 {
    unsafe { get_str(s) }.first().copied().unwrap_or(0) as i64
}

/// Byte at position `i`, or 0 past the end.
///
/// # Safety
/// `s` must hold a live string value.
pub unsafe fn str_index(s: Value, i: usize) -> i64 {
    unsafe { get_str(s) }.get(i).copied().unwrap_or(0) as i64
}

/// The tail of `s`: everything after the first byte.
///
/// Prefers a shared STROFFSET view; when the heap has no room for one the
/// tail is copied instead, so the view can never be created just to have a
/// collection move its root out from under it.
///
/// # Safety
/// `s` must hold a live string value of `vm`.
pub unsafe fn str_tail(vm: &Vm, s: Value) -> Value {
    // SAFETY: owning thread.
    let has_room = unsafe { vm.mutator() }.heap.fits(STR_OFFSET_SIZE);
    if has_room {
        let obj = s.as_object().expect("string of a non-object");
        // Collapse through at most one existing view so chains stay at
        // depth ≤ 1.
        let mut root = obj;
        let mut offset = 0usize;
        unsafe {
            while object::ty(root) == ClosureType::StrOffset {
                let p = object::str_offset(root);
                offset += (*p).offset;
                root = (*p).root;
            }
        }
        build_str_offset(vm, root, offset + 1)
    } else {
        let bytes: Vec<u8> = unsafe { get_str(s) }.get(1..).unwrap_or(&[]).to_vec();
        mk_str(vm, Some(&bytes))
    }
}

/// Prepend byte `c` to `s`.
///
/// # Safety
/// `s` must hold a live string value of `vm`.
pub unsafe fn str_cons(vm: &Vm, c: i64, s: Value) -> Value {
    let tail = unsafe { get_str(s) };
    let mut bytes = Vec::with_capacity(tail.len() + 1);
    bytes.push(c as u8);
    bytes.extend_from_slice(tail);
    mk_str(vm, Some(&bytes))
}

/// Reverse the bytes of `s`.
///
/// # Safety
/// `s` must hold a live string value of `vm`.
pub unsafe fn str_rev(vm: &Vm, s: Value) -> Value {
    let mut bytes = unsafe { get_str(s) }.to_vec();
    bytes.reverse();
    mk_str(vm, Some(&bytes))
}

/// Read one line from `h` into a fresh STRING (empty at end of input).
///
/// The trailing newline, if any, is kept, matching line-oriented input
/// conventions of the compiled code.
pub fn read_str(vm: &Vm, h: &mut impl BufRead) -> Value {
    let mut line = String::new();
    match h.read_line(&mut line) {
        Ok(0) | Err(_) => mk_str(vm, Some(b"")),
        Ok(_) => mk_str(vm, Some(line.as_bytes())),
    }
}

// ── Casts ─────────────────────────────────────────────────────────────────────

/// Decimal rendering of a small integer.
pub fn cast_int_str(vm: &Vm, v: Value) -> Value {
    let n = v.as_int().expect("cast_int_str on a non-integer");
    mk_str(vm, Some(n.to_string().as_bytes()))
}

/// Parse a leading decimal integer.
///
/// Accepts optional leading whitespace and a sign.  The result is the parsed
/// value when the remainder starts with `\0`, `\n`, or `\r` (or is empty);
/// anything else yields 0.
///
/// # Safety
/// `v` must hold a live string value.
pub unsafe fn cast_str_int(v: Value) -> Value {
    let bytes = unsafe { get_str(v) };
    let mut i = 0;
    while bytes.get(i).is_some_and(|b| b.is_ascii_whitespace()) {
        i += 1;
    }
    let negative = match bytes.get(i) {
        Some(b'-') => {
            i += 1;
            true
        }
        Some(b'+') => {
            i += 1;
            false
        }
        _ => false,
    };
    let digits_start = i;
    let mut acc: i64 = 0;
    while let Some(d) = bytes.get(i).and_then(|b| (*b as char).to_digit(10)) {
        acc = acc.saturating_mul(10).saturating_add(d as i64);
        i += 1;
    }
    if i == digits_start {
        return Value::from_int(0);
    }
    match bytes.get(i) {
        None | Some(b'\0') | Some(b'\n') | Some(b'\r') => {
            Value::from_int(if negative { -acc } else { acc })
        }
        _ => Value::from_int(0),
    }
}

/// Render a float.
///
/// `NaN`, `Infinity`, and `-Infinity` are spelled out; everything else uses
/// the shortest round-trippable decimal form.
pub fn cast_float_str(vm: &Vm, v: Value) -> Value {
    // Read before allocating; mk_str may collect.
    let f = unsafe { scalar::get_float(v) };
    let s = if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        format!("{f}")
    };
    mk_str(vm, Some(s.as_bytes()))
}

/// Parse a leading decimal float; a string with no numeric prefix reads as 0.
///
/// # Safety
/// `v` must hold a live string value of `vm`.
pub unsafe fn cast_str_float(vm: &Vm, v: Value) -> Value {
    let f = float_prefix(unsafe { get_str(v) });
    scalar::mk_float(vm, f)
}

/// Longest-prefix float parse: optional whitespace and sign, mantissa
/// digits with an optional point, and an optional signed exponent.
fn float_prefix(bytes: &[u8]) -> f64 {
    let mut i = 0;
    while bytes.get(i).is_some_and(|b| b.is_ascii_whitespace()) {
        i += 1;
    }
    let start = i;
    if matches!(bytes.get(i), Some(b'-') | Some(b'+')) {
        i += 1;
    }
    let mut saw_digit = false;
    while bytes.get(i).is_some_and(u8::is_ascii_digit) {
        saw_digit = true;
        i += 1;
    }
    if bytes.get(i) == Some(&b'.') {
        i += 1;
        while bytes.get(i).is_some_and(u8::is_ascii_digit) {
            saw_digit = true;
            i += 1;
        }
    }
    if !saw_digit {
        return 0.0;
    }
    if matches!(bytes.get(i), Some(b'e') | Some(b'E')) {
        let mut j = i + 1;
        if matches!(bytes.get(j), Some(b'-') | Some(b'+')) {
            j += 1;
        }
        if bytes.get(j).is_some_and(u8::is_ascii_digit) {
            while bytes.get(j).is_some_and(u8::is_ascii_digit) {
                j += 1;
            }
            i = j;
        }
    }
    std::str::from_utf8(&bytes[start..i])
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

/// Unsigned decimal rendering of a fixed-width integer value.
///
/// Dispatches on the BITS8/16/32/64 tag; widths render in at most
/// 3, 5, 10, and 20 digits respectively.  Any other tag is fatal.
///
/// # Safety
/// `v` must hold a live object value of `vm`.
pub unsafe fn cast_bits_str(vm: &Vm, v: Value) -> Value {
    let obj = v.as_object().expect("cast_bits_str on a non-object");
    let rendered = unsafe {
        match object::ty(obj) {
            ClosureType::Bits8 => object::bits8_val(obj).to_string(),
            ClosureType::Bits16 => object::bits16_val(obj).to_string(),
            ClosureType::Bits32 => object::bits32_val(obj).to_string(),
            ClosureType::Bits64 => object::bits64_val(obj).to_string(),
            other => fatal(RotorError::UnhandledTag {
                op: "cast_bits_str",
                ty: other,
            }),
        }
    };
    mk_str(vm, Some(rendered.as_bytes()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
