// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! In-process communication engine.
//!
//! Wires N ranks living in one process: active messages travel over
//! crossbeam channels into a per-rank delivery thread, one-sided GETs read
//! the exposed region directly (the transfer-pin protocol keeps the source
//! allocation alive), and the collectives run over a shared rendezvous
//! state. This is the engine behind multi-rank tests; production deployments
//! plug a real fabric in through [`CommEngine`].

use crate::core::ser::IoSpan;
use crate::transport::{AmHandler, CommEngine, Rank};
use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

enum Mail {
    Am { from: Rank, bytes: Vec<u8> },
    Release { token: u64 },
    Stop,
}

/// An exposed memory region awaiting its GET.
struct Region {
    ptr: usize,
    len: usize,
}

/// Rendezvous state for the counting allreduce.
struct ReduceState {
    acc: [u64; 3],
    arrived: u32,
    generation: u64,
    result: [u64; 3],
}

struct ClusterShared {
    size: u32,
    mailboxes: Vec<Sender<Mail>>,
    regions: DashMap<u64, Region>,
    next_handle: AtomicU64,
    barrier: Barrier,
    reduce: Mutex<ReduceState>,
    reduce_cv: Condvar,
}

/// One rank's view of the in-process cluster.
pub struct LoopbackEngine {
    rank: Rank,
    shared: Arc<ClusterShared>,
    inbox: Mutex<Option<Receiver<Mail>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

/// Build an `n`-rank in-process cluster; index `i` of the result is the
/// engine for rank `i`.
pub fn cluster(n: u32) -> Vec<Arc<LoopbackEngine>> {
    assert!(n > 0, "cluster needs at least one rank");
    let mut senders = Vec::with_capacity(n as usize);
    let mut receivers = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let (tx, rx) = unbounded();
        senders.push(tx);
        receivers.push(rx);
    }
    let shared = Arc::new(ClusterShared {
        size: n,
        mailboxes: senders,
        regions: DashMap::new(),
        next_handle: AtomicU64::new(1),
        barrier: Barrier::new(n as usize),
        reduce: Mutex::new(ReduceState {
            acc: [0; 3],
            arrived: 0,
            generation: 0,
            result: [0; 3],
        }),
        reduce_cv: Condvar::new(),
    });
    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, rx)| {
            Arc::new(LoopbackEngine {
                rank: rank as Rank,
                shared: Arc::clone(&shared),
                inbox: Mutex::new(Some(rx)),
                delivery: Mutex::new(None),
            })
        })
        .collect()
}

impl LoopbackEngine {
    /// Stop the delivery thread and join it.
    pub fn shutdown(&self) {
        let _ = self.shared.mailboxes[self.rank as usize].send(Mail::Stop);
        if let Some(handle) = self.delivery.lock().take() {
            let _ = handle.join();
        }
    }
}

impl CommEngine for LoopbackEngine {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> u32 {
        self.shared.size
    }

    fn set_handler(&self, handler: Arc<dyn AmHandler>) {
        let rx = self
            .inbox
            .lock()
            .take()
            .expect("set_handler called twice on loopback engine");
        let rank = self.rank;
        let handle = std::thread::Builder::new()
            .name(format!("weft-loopback-{rank}"))
            .spawn(move || {
                while let Ok(mail) = rx.recv() {
                    match mail {
                        Mail::Am { from, bytes } => handler.on_message(from, &bytes),
                        Mail::Release { token } => handler.on_release(token),
                        Mail::Stop => break,
                    }
                }
            })
            .expect("failed to spawn loopback delivery thread");
        *self.delivery.lock() = Some(handle);
    }

    fn send_am(&self, dest: Rank, bytes: Vec<u8>) {
        let _ = self.shared.mailboxes[dest as usize].send(Mail::Am {
            from: self.rank,
            bytes,
        });
    }

    fn expose(&self, span: IoSpan) -> u64 {
        let handle = self.shared.next_handle.fetch_add(1, Ordering::AcqRel);
        self.shared.regions.insert(
            handle,
            Region {
                ptr: span.ptr as usize,
                len: span.len,
            },
        );
        handle
    }

    fn get(&self, _owner: Rank, handle: u64, dst: IoSpan) {
        let (_, region) = self
            .shared
            .regions
            .remove(&handle)
            .expect("GET against unknown or already-consumed handle");
        assert_eq!(region.len, dst.len, "GET length mismatch");
        // SAFETY: the source allocation is pinned by the sender's transfer
        // reader share until we send the release token, and `dst` is an
        // exclusive span of the receiver's freshly unpacked value.
        unsafe {
            std::ptr::copy_nonoverlapping(region.ptr as *const u8, dst.ptr, region.len);
        }
    }

    fn notify_release(&self, owner: Rank, token: u64) {
        let _ = self.shared.mailboxes[owner as usize].send(Mail::Release { token });
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn allreduce_sum(&self, vals: [u64; 3]) -> [u64; 3] {
        let mut state = self.shared.reduce.lock();
        let my_generation = state.generation;
        for (acc, v) in state.acc.iter_mut().zip(vals.iter()) {
            *acc += v;
        }
        state.arrived += 1;
        if state.arrived == self.shared.size {
            state.result = state.acc;
            state.acc = [0; 3];
            state.arrived = 0;
            state.generation += 1;
            self.shared.reduce_cv.notify_all();
            state.result
        } else {
            while state.generation == my_generation {
                self.shared.reduce_cv.wait(&mut state);
            }
            state.result
        }
    }
}
