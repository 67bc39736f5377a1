//! Benchmark for the idle scheduler's decision function.
//!
//! `compute` sits on the embedder's idle path and must stay cheap enough to
//! call on every donated budget.

use criterion::{criterion_group, criterion_main, Criterion};
use ebb_gc::gc::{compute, estimate_marking_step_size, HeapStateSnapshot};

fn benchmark_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("idle_scheduler");

    let marking = HeapStateSnapshot {
        incremental_marking_stopped: false,
        can_start_incremental_marking: true,
        incremental_marking_speed: 180_000,
        contexts_disposal_rate_ms: f64::INFINITY,
        ..HeapStateSnapshot::default()
    };
    group.bench_function("compute_marking_path", |b| {
        b.iter(|| compute(std::hint::black_box(8), &marking));
    });

    let scavenge = HeapStateSnapshot {
        new_space_size: 900_000,
        new_space_capacity: 1_000_000,
        scavenge_speed: 500_000,
        ..marking
    };
    group.bench_function("compute_scavenge_path", |b| {
        b.iter(|| compute(std::hint::black_box(8), &scavenge));
    });

    group.bench_function("estimate_step_size", |b| {
        b.iter(|| estimate_marking_step_size(std::hint::black_box(16), std::hint::black_box(0)));
    });

    group.finish();
}

criterion_group!(benches, benchmark_compute);
criterion_main!(benches);
