// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Work-stealing task scheduler.
//!
//! Tasks are preemption-free: a released task record runs to completion (or
//! to a device-state transition) on whichever worker picks it up. Workers
//! keep a LIFO deque each and steal from the shared injector and from each
//! other when empty.
//!
//! Released rings are submitted in bulk, sorted by priority, so a message
//! that releases many instances pays one wake instead of N.

use crate::config;
use crate::engine::wake::WakeNotifier;
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A unit of work handed to the pool.
pub(crate) trait Runnable: Send {
    fn run(self: Box<Self>);
    fn priority(&self) -> i32;
}

struct Shared {
    injector: Injector<Box<dyn Runnable>>,
    wake: WakeNotifier,
    /// Opened by `execute()`; tasks submitted earlier queue up.
    gate: AtomicBool,
    shutdown: AtomicBool,
    /// Tasks queued or running; zero means the pool is drained.
    live: AtomicUsize,
}

pub(crate) struct Scheduler {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn `threads` workers. The gate starts closed; call [`Self::open_gate`]
    /// to let them run queued tasks.
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            wake: WakeNotifier::new(),
            gate: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            live: AtomicUsize::new(0),
        });

        let workers: Vec<Worker<Box<dyn Runnable>>> =
            (0..threads).map(|_| Worker::new_lifo()).collect();
        let stealers: Arc<Vec<Stealer<Box<dyn Runnable>>>> =
            Arc::new(workers.iter().map(Worker::stealer).collect());

        let mut handles = Vec::with_capacity(threads);
        for (idx, worker) in workers.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let stealers = Arc::clone(&stealers);
            let handle = std::thread::Builder::new()
                .name(format!("weft-worker-{idx}"))
                .spawn(move || worker_loop(idx, &worker, &shared, &stealers))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            shared,
            handles: Mutex::new(handles),
        }
    }

    /// Allow workers to start executing queued tasks.
    pub fn open_gate(&self) {
        self.shared.gate.store(true, Ordering::Release);
        self.shared.wake.notify();
    }

    pub fn gate_open(&self) -> bool {
        self.shared.gate.load(Ordering::Acquire)
    }

    pub fn submit(&self, task: Box<dyn Runnable>) {
        self.shared.live.fetch_add(1, Ordering::AcqRel);
        self.shared.injector.push(task);
        self.shared.wake.notify();
    }

    /// Submit a released ring in priority order (highest first).
    pub fn submit_batch(&self, mut batch: Vec<Box<dyn Runnable>>) {
        if batch.is_empty() {
            return;
        }
        batch.sort_by_key(|t| std::cmp::Reverse(t.priority()));
        self.shared.live.fetch_add(batch.len(), Ordering::AcqRel);
        for task in batch {
            self.shared.injector.push(task);
        }
        self.shared.wake.notify();
    }

    /// True when no task is queued or running.
    pub fn is_idle(&self) -> bool {
        self.shared.live.load(Ordering::Acquire) == 0
    }

    /// Stop the workers and join them. Queued tasks that never ran are
    /// dropped.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify();
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn find_task(
    local: &Worker<Box<dyn Runnable>>,
    shared: &Shared,
    stealers: &[Stealer<Box<dyn Runnable>>],
) -> Option<Box<dyn Runnable>> {
    if let Some(task) = local.pop() {
        return Some(task);
    }
    loop {
        match shared.injector.steal_batch_and_pop(local) {
            Steal::Success(task) => return Some(task),
            Steal::Empty => break,
            Steal::Retry => {}
        }
    }
    for stealer in stealers {
        loop {
            match stealer.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
    }
    None
}

fn worker_loop(
    _idx: usize,
    local: &Worker<Box<dyn Runnable>>,
    shared: &Shared,
    stealers: &[Stealer<Box<dyn Runnable>>],
) {
    let park = Duration::from_millis(config::WORKER_PARK_TIMEOUT_MS);
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        if !shared.gate.load(Ordering::Acquire) {
            shared.wake.wait_timeout(park);
            continue;
        }
        match find_task(local, shared, stealers) {
            Some(task) => {
                task.run();
                shared.live.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                shared.wake.wait_timeout(park);
            }
        }
    }
}
