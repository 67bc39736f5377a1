//! Benchmark for tri-color bitmap transitions.
//!
//! Measures the cost of the grey/black transitions the marker performs for
//! every live object, plus the whole-page clear done by the sweeper.

use criterion::{criterion_group, criterion_main, Criterion};
use ebb_gc::gc::{Color, ColorBitmap};

fn benchmark_mark_transitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("color_bitmap");

    group.bench_function("grey_then_black_256", |b| {
        let bitmap = ColorBitmap::new();
        b.iter(|| {
            for i in 0..256 {
                bitmap.mark_grey(i);
            }
            for i in 0..256 {
                bitmap.mark_black(i);
            }
            bitmap.clear_all();
        });
    });

    group.bench_function("color_query_256", |b| {
        let bitmap = ColorBitmap::new();
        for i in (0..256).step_by(2) {
            bitmap.mark_black(i);
        }
        b.iter(|| {
            let mut black = 0usize;
            for i in 0..256 {
                if bitmap.color(i) == Color::Black {
                    black += 1;
                }
            }
            std::hint::black_box(black)
        });
    });

    group.bench_function("clear_all", |b| {
        let bitmap = ColorBitmap::new();
        for i in 0..256 {
            bitmap.mark_black(i);
        }
        b.iter(|| bitmap.clear_all());
    });

    group.finish();
}

criterion_group!(benches, benchmark_mark_transitions);
criterion_main!(benches);
