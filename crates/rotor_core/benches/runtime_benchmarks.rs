//! Criterion benchmarks for core runtime operations.
//!
//! Run with: `cargo bench --package rotor_core`

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use rotor_core::objects::{cons, string};
use rotor_core::vm::messaging::{recv_message, send_message, vm_thread};
use rotor_core::{Value, Vm};

// ---------------------------------------------------------------------------
// Allocation throughput
// ---------------------------------------------------------------------------

fn bench_allocate_single(c: &mut Criterion) {
    c.bench_function("allocate_single", |b| {
        // The VM lives across iterations to measure steady-state bump
        // allocation; exhaustion folds the collector's cost in, as it does
        // for real programs.
        let vm = Vm::new(64, 4 << 20, 1);
        b.iter(|| {
            black_box(vm.alloc(black_box(32)));
        });
    });
}

fn bench_mk_str_small(c: &mut Criterion) {
    c.bench_function("mk_str_16b", |b| {
        let vm = Vm::new(64, 4 << 20, 1);
        b.iter(|| {
            black_box(string::mk_str(&vm, Some(black_box(b"sixteen byte str"))));
        });
    });
}

// ---------------------------------------------------------------------------
// Tagged value operations
// ---------------------------------------------------------------------------

fn bench_int_round_trip(c: &mut Criterion) {
    c.bench_function("int_round_trip", |b| {
        b.iter(|| {
            let v = Value::from_int(black_box(42));
            black_box(v.is_int());
            black_box(v.as_int());
        });
    });
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

fn bench_collection_small_live_set(c: &mut Criterion) {
    c.bench_function("collect_64_live_strings", |b| {
        let vm = Vm::new(256, 1 << 20, 1);
        // SAFETY: single-threaded benchmark, owning thread.
        let m = unsafe { vm.mutator() };
        for i in 0..64 {
            let s = string::mk_str(&vm, Some(format!("live value {i}").as_bytes()));
            m.stack.push(s);
        }
        b.iter(|| {
            rotor_core::gc::collector::collect(&vm);
        });
    });
}

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

fn bench_message_round_trip(c: &mut Criterion) {
    c.bench_function("message_round_trip", |b| {
        let parent = Vm::new(1024, 1 << 20, 1);
        b.iter(|| {
            // SAFETY: the constructor graph is immediates only; the child
            // closure owns its VM.
            unsafe {
                let child = vm_thread(
                    &parent,
                    |me| {
                        black_box(recv_message(me));
                    },
                    Value::NULL,
                );
                let msg = cons::mk_con(&parent, 1, &[Value::from_int(7), Value::from_int(8)]);
                send_message(&parent, &child.vm, msg);
                child.join();
            }
        });
    });
}

criterion_group!(
    benches,
    bench_allocate_single,
    bench_mk_str_small,
    bench_int_round_trip,
    bench_collection_small_live_set,
    bench_message_round_trip,
);
criterion_main!(benches);
