use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use flc::ir::{BlockRef, ElemType, MemRefType, MemorySpace, Module};
use flc::pipeline::{lower_module, LowerOptions};

fn mem(shape: &[i64], space: MemorySpace) -> MemRefType {
    MemRefType::new(shape, ElemType::F32, space)
}

/// A herd of the given size with `transfers` inbound copies per tile.
fn program(size_x: i64, size_y: i64, transfers: i32) -> Module {
    let mut m = Module::new();
    let seg = m.add_segment("seg0");
    let h = m.add_herd(seg, "worker", (size_x, size_y), Some((0, 1)), &[]);
    let at = BlockRef::body(h.node);
    for id in 0..transfers {
        let size = m.build_const_index(at, 64);
        let src = m.build_alloc(at, mem(&[64], MemorySpace::L3), None);
        let dst = m.build_alloc(at, mem(&[64], MemorySpace::L1), Some("in"));
        m.build_memcpy(at, id, &[], src, dst, &[size], &[size], false);
    }
    m.build_herd_terminator(h.node);
    m
}

fn bench_lowering(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_lowering");

    for (name, size, transfers) in [
        ("1x1_small", (1, 1), 1),
        ("2x2_medium", (2, 2), 2),
        ("3x3_large", (3, 3), 2),
    ] {
        group.bench_with_input(
            BenchmarkId::from_parameter(name),
            &(size, transfers),
            |b, &((sx, sy), n)| {
                b.iter(|| {
                    let m = program(sx, sy, n);
                    let (state, result) = lower_module(black_box(m), &LowerOptions::default());
                    assert!(result.is_ok());
                    black_box(&state.devices);
                });
            },
        );
    }

    group.finish();
}

fn bench_metadata_fingerprint(c: &mut Criterion) {
    let (state, _) = lower_module(program(2, 2, 3), &LowerOptions::default());
    let meta = state.metadata.unwrap();

    c.bench_function("metadata_fingerprint", |b| {
        b.iter(|| black_box(meta.fingerprint()));
    });
}

criterion_group!(benches, bench_lowering, bench_metadata_fingerprint);
criterion_main!(benches);
