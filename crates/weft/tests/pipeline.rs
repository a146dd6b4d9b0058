// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Pipeline integration tests.
//!
//! Three chained templates on one rank: every stage applies its arithmetic
//! and forwards downstream; the terminal value proves both data-flow
//! ordering and at-most-once firing along the chain.

use parking_lot::Mutex;
use std::sync::Arc;
use weft::{Access, Edge, TtBuilder, World};

/// A(+1) -> B(*2) -> C(-3), seeded with 0, must end at -1.
#[test]
fn three_stage_pipeline_applies_arithmetic() {
    let world = World::builder().threads(2).build().unwrap();

    let seed: Edge<u32, i64> = Edge::new("seed");
    let a_b: Edge<u32, i64> = Edge::new("a_b");
    let b_c: Edge<u32, i64> = Edge::new("b_c");
    let result: Arc<Mutex<Option<i64>>> = Arc::new(Mutex::new(None));

    let a = TtBuilder::<u32>::new(&world, "A")
        .input("x", &seed, Access::Read)
        .output("out", &a_b)
        .keymap(|_| 0)
        .build(|key, ctx| {
            let x = *ctx.input::<i64>(0);
            ctx.send(0, key, x + 1);
        })
        .unwrap();

    let _b = TtBuilder::<u32>::new(&world, "B")
        .input("x", &a_b, Access::Read)
        .output("out", &b_c)
        .keymap(|_| 0)
        .build(|key, ctx| {
            let x = *ctx.input::<i64>(0);
            ctx.send(0, key, x * 2);
        })
        .unwrap();

    let sink = Arc::clone(&result);
    let _c = TtBuilder::<u32>::new(&world, "C")
        .input("x", &b_c, Access::Read)
        .keymap(|_| 0)
        .build(move |_key, ctx| {
            *sink.lock() = Some(ctx.input::<i64>(0) - 3);
        })
        .unwrap();

    a.set_input(0, &0, 0i64);
    world.execute();
    world.fence().unwrap();

    assert_eq!(*result.lock(), Some(-1));
}

/// Every key flows through the full chain independently.
#[test]
fn pipeline_keeps_keys_independent() {
    let world = World::builder().threads(4).build().unwrap();

    let seed: Edge<u32, i64> = Edge::new("seed");
    let a_b: Edge<u32, i64> = Edge::new("a_b");
    let results: Arc<Mutex<Vec<(u32, i64)>>> = Arc::new(Mutex::new(Vec::new()));

    let a = TtBuilder::<u32>::new(&world, "A")
        .input("x", &seed, Access::Read)
        .output("out", &a_b)
        .keymap(|_| 0)
        .build(|key, ctx| {
            let x = *ctx.input::<i64>(0);
            ctx.send(0, key, x + i64::from(*key));
        })
        .unwrap();

    let sink = Arc::clone(&results);
    let _b = TtBuilder::<u32>::new(&world, "B")
        .input("x", &a_b, Access::Read)
        .keymap(|_| 0)
        .build(move |key, ctx| {
            sink.lock().push((*key, *ctx.input::<i64>(0)));
        })
        .unwrap();

    for k in 0..16u32 {
        a.set_input(0, &k, 100i64);
    }
    world.execute();
    world.fence().unwrap();

    let mut got = results.lock().clone();
    got.sort_unstable();
    let expect: Vec<(u32, i64)> = (0..16).map(|k| (k, 100 + i64::from(k))).collect();
    assert_eq!(got, expect);
}

/// A task fires exactly once per (template, key) invocation cycle.
#[test]
fn at_most_once_firing_per_key() {
    let world = World::builder().threads(4).build().unwrap();

    let ea: Edge<u32, u64> = Edge::new("a");
    let eb: Edge<u32, u64> = Edge::new("b");
    let firings: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&firings);
    let tt = TtBuilder::<u32>::new(&world, "pair")
        .input("a", &ea, Access::Read)
        .input("b", &eb, Access::Read)
        .keymap(|_| 0)
        .build(move |key, _ctx| {
            sink.lock().push(*key);
        })
        .unwrap();

    world.execute();
    for k in 0..32u32 {
        tt.set_input(0, &k, 1u64);
        tt.set_input(1, &k, 2u64);
    }
    world.fence().unwrap();

    let mut got = firings.lock().clone();
    got.sort_unstable();
    assert_eq!(got.len(), 32, "each key fires exactly once");
    got.dedup();
    assert_eq!(got.len(), 32);
}
