// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! set_arg latency: local deposit through firing on a minimal graph.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use weft::{Access, Edge, TtBuilder, World};

fn single_input_firing(c: &mut Criterion) {
    let world = World::builder().threads(2).build().unwrap();
    let edge: Edge<u64, u64> = Edge::new("bench");
    let tt = TtBuilder::<u64>::new(&world, "sink")
        .input("x", &edge, Access::Read)
        .keymap(|_| 0)
        .build(|_key, ctx| {
            black_box(ctx.input::<u64>(0));
        })
        .unwrap();
    world.execute();

    let mut key = 0u64;
    c.bench_function("set_arg_single_input", |b| {
        b.iter(|| {
            key = key.wrapping_add(1);
            tt.set_input(0, &key, black_box(key));
        });
    });
    world.fence().unwrap();
}

fn two_input_gather(c: &mut Criterion) {
    let world = World::builder().threads(2).build().unwrap();
    let ea: Edge<u64, u64> = Edge::new("a");
    let eb: Edge<u64, u64> = Edge::new("b");
    let tt = TtBuilder::<u64>::new(&world, "pair")
        .input("a", &ea, Access::Read)
        .input("b", &eb, Access::Read)
        .keymap(|_| 0)
        .build(|_key, ctx| {
            black_box(ctx.input::<u64>(0) + ctx.input::<u64>(1));
        })
        .unwrap();
    world.execute();

    let mut key = 0u64;
    c.bench_function("set_arg_two_input_gather", |b| {
        b.iter(|| {
            key = key.wrapping_add(1);
            tt.set_input(0, &key, black_box(key));
            tt.set_input(1, &key, black_box(key));
        });
    });
    world.fence().unwrap();
}

criterion_group!(benches, single_input_firing, two_input_gather);
criterion_main!(benches);
