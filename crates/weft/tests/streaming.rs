// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Streaming-input integration tests.
//!
//! A streaming terminal folds every arrival into its accumulator and fires
//! the instance once the goal count is reached (static, per-key, or
//! forced by finalize). The reducer must run exactly once per arrival and
//! the task exactly once per key.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weft::transport::loopback;
use weft::{Edge, TtBuilder, World};

/// Goal 5, values 1..=5 sent from mixed ranks, fires once with 15.
#[test]
fn stream_reduces_across_ranks() {
    let engines = loopback::cluster(4);
    let fired: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let reductions = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for engine in engines {
        let fired = Arc::clone(&fired);
        let reductions = Arc::clone(&reductions);
        handles.push(std::thread::spawn(move || {
            let world = World::builder()
                .threads(2)
                .engine(engine)
                .build()
                .unwrap();

            let edge: Edge<u32, u64> = Edge::new("values");
            let sink = Arc::clone(&fired);
            let count = Arc::clone(&reductions);
            let tt = TtBuilder::<u32>::new(&world, "sum")
                .input_stream("s", &edge, move |acc: &mut u64, v| {
                    count.fetch_add(1, Ordering::SeqCst);
                    *acc += v;
                })
                .keymap(|_| 0)
                .build(move |_key, ctx| {
                    sink.lock().push(*ctx.input::<u64>(0));
                })
                .unwrap();
            tt.set_static_stream_goal(0, 5);

            world.execute();
            // Ranks 0..3 send 1..4; rank 0 also sends the fifth value.
            let rank = world.rank();
            tt.set_input(0, &7, u64::from(rank) + 1);
            if rank == 0 {
                tt.set_input(0, &7, 5u64);
            }
            world.fence().unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(&*fired.lock(), &[15], "fires once with the full fold");
    // First arrival seeds the accumulator; the other four reduce.
    assert_eq!(reductions.load(Ordering::SeqCst), 4);
}

/// The per-key goal can arrive from a remote rank after some values.
#[test]
fn per_key_goal_set_remotely() {
    let engines = loopback::cluster(2);
    let fired: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for engine in engines {
        let fired = Arc::clone(&fired);
        handles.push(std::thread::spawn(move || {
            let world = World::builder()
                .threads(2)
                .engine(engine)
                .build()
                .unwrap();

            let edge: Edge<u32, u64> = Edge::new("values");
            let sink = Arc::clone(&fired);
            let tt = TtBuilder::<u32>::new(&world, "sum")
                .input_stream("s", &edge, |acc: &mut u64, v| *acc += v)
                .keymap(|_| 0)
                .build(move |_key, ctx| {
                    sink.lock().push(*ctx.input::<u64>(0));
                })
                .unwrap();

            world.execute();
            if world.rank() == 0 {
                tt.set_input(0, &3, 10u64);
                tt.set_input(0, &3, 20u64);
            } else {
                // Goal travels rank 1 -> rank 0 as a SET_ARGSTREAM_SIZE
                // message.
                tt.set_stream_goal(0, &3, 2);
            }
            world.fence().unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(&*fired.lock(), &[30]);
}

/// Finalize terminates a dynamic stream from a remote rank.
#[test]
fn finalize_travels_to_the_owner() {
    let engines = loopback::cluster(2);
    let fired: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(std::sync::Barrier::new(2));

    let mut handles = Vec::new();
    for engine in engines {
        let fired = Arc::clone(&fired);
        let barrier = Arc::clone(&barrier);
        handles.push(std::thread::spawn(move || {
            let world = World::builder()
                .threads(2)
                .engine(engine)
                .build()
                .unwrap();

            let edge: Edge<u32, u64> = Edge::new("values");
            let sink = Arc::clone(&fired);
            let tt = TtBuilder::<u32>::new(&world, "sum")
                .input_stream("s", &edge, |acc: &mut u64, v| *acc += v)
                .keymap(|_| 0)
                .build(move |_key, ctx| {
                    sink.lock().push(*ctx.input::<u64>(0));
                })
                .unwrap();

            world.execute();
            if world.rank() == 0 {
                tt.set_input(0, &1, 4u64);
                tt.set_input(0, &1, 5u64);
                barrier.wait();
            } else {
                // Only finalize after the owner deposited its values.
                barrier.wait();
                std::thread::sleep(std::time::Duration::from_millis(50));
                tt.finalize_stream(0, &1);
            }
            world.fence().unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(&*fired.lock(), &[9]);
}

/// Streaming input combined with a normal input: the instance fires only
/// when both the fold is complete and the other slot is bound.
#[test]
fn stream_plus_value_input() {
    let world = World::builder().threads(2).build().unwrap();
    let fired: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    let values: Edge<u32, u64> = Edge::new("values");
    let base: Edge<u32, u64> = Edge::new("base");
    let sink = Arc::clone(&fired);
    let tt = TtBuilder::<u32>::new(&world, "sum_with_base")
        .input_stream("s", &values, |acc: &mut u64, v| *acc += v)
        .input("base", &base, weft::Access::Read)
        .keymap(|_| 0)
        .build(move |_key, ctx| {
            sink.lock().push(ctx.input::<u64>(0) + ctx.input::<u64>(1));
        })
        .unwrap();
    tt.set_static_stream_goal(0, 3);

    world.execute();
    tt.set_input(0, &2, 1u64);
    tt.set_input(0, &2, 2u64);
    tt.set_input(0, &2, 3u64);
    assert!(fired.lock().is_empty(), "base input still missing");
    tt.set_input(1, &2, 100u64);
    world.fence().unwrap();

    assert_eq!(&*fired.lock(), &[106]);
}
