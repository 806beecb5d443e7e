//! Process-wide state: the interned nullary-constructor table, the program
//! argument vector, the big-integer duplicator hook, and system information.

use once_cell::sync::{Lazy, OnceCell};

use crate::objects::object::{pack_tag_arity, ClosureType, Object};
use crate::objects::string::mk_str;
use crate::objects::tagged::Value;
use crate::vm::Vm;

// ── Nullary-constructor table ────────────────────────────────────────────────

/// An interned arity-0 constructor, allocated outside every VM heap.
///
/// 8-byte alignment keeps the addresses valid [`Value`] encodings.
#[repr(C, align(8))]
struct InternedCon {
    header: Object,
}

/// The 256 preallocated arity-0 constructors, tags 0–255.
///
/// Shared read-only across every VM; no collector ever visits or moves them,
/// which is what makes their pointer identity stable process-wide.
struct NullaryTable {
    slots: [*mut Object; 256],
}

// SAFETY: the table is written once at initialisation and read-only ever
// after; the pointed-to headers are never mutated.
unsafe impl Send for NullaryTable {}
unsafe impl Sync for NullaryTable {}

static NULLARIES: Lazy<NullaryTable> = Lazy::new(|| NullaryTable {
    slots: std::array::from_fn(|tag| {
        let leaked = Box::leak(Box::new(InternedCon {
            header: Object::header(ClosureType::Con, pack_tag_arity(tag as u32, 0)),
        }));
        &raw mut leaked.header
    }),
});

/// Force the nullary table into existence.
///
/// Called by [`Vm::boot`]; initialisation is idempotent and thread-safe.
pub fn init_nullaries() {
    Lazy::force(&NULLARIES);
}

/// The interned arity-0 constructor with the given tag.
pub fn nullary(tag: u8) -> Value {
    // SAFETY: table entries are 8-byte aligned, non-null, and live for the
    // whole process.
    unsafe { Value::from_object(NULLARIES.slots[tag as usize]) }
}

// ── Program arguments ────────────────────────────────────────────────────────

static ARGS: OnceCell<Vec<String>> = OnceCell::new();

/// Record the program's argument vector.  Only the first call takes effect.
pub fn set_args<I>(args: I)
where
    I: IntoIterator<Item = String>,
{
    let _ = ARGS.set(args.into_iter().collect());
}

/// Number of recorded program arguments.
pub fn num_args() -> usize {
    ARGS.get().map_or(0, Vec::len)
}

/// Program argument `i`, if recorded.
pub fn get_arg(i: usize) -> Option<&'static str> {
    ARGS.get().and_then(|v| v.get(i)).map(String::as_str)
}

// ── Big-integer duplicator ───────────────────────────────────────────────────

/// Clones one big-integer handle into fresh arena storage.
pub type BigIntDup = fn(*mut u8) -> *mut u8;

static BIGINT_DUP: OnceCell<BigIntDup> = OnceCell::new();

/// Register the duplicator the cross-VM copy uses for BIGINT payloads.
///
/// The numeric library owns big-integer storage; without a registered
/// duplicator, handles cross VM boundaries unchanged, which is only sound
/// for a program that never ships big integers between threads.
pub fn set_bigint_duplicator(dup: BigIntDup) {
    let _ = BIGINT_DUP.set(dup);
}

/// Duplicate `handle` through the registered hook, or pass it through.
pub(crate) fn dup_bigint(handle: *mut u8) -> *mut u8 {
    match BIGINT_DUP.get() {
        Some(dup) => dup(handle),
        None => handle,
    }
}

// ── System information ───────────────────────────────────────────────────────

/// Identifier of this runtime backend, reported by `system_info(_, 0)`.
pub const BACKEND_NAME: &str = "rust";

/// Runtime and target facts, indexed: 0 → backend name, 1 → target OS,
/// 2 → target triple (best effort).  Unknown indices read as the empty
/// string.
pub fn system_info(vm: &Vm, index: i64) -> Value {
    match index {
        0 => mk_str(vm, Some(BACKEND_NAME.as_bytes())),
        1 => mk_str(vm, Some(std::env::consts::OS.as_bytes())),
        2 => {
            let triple = format!(
                "{}-unknown-{}",
                std::env::consts::ARCH,
                std::env::consts::OS
            );
            mk_str(vm, Some(triple.as_bytes()))
        }
        _ => mk_str(vm, Some(b"")),
    }
}
