// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Worker wake notification with atomic fast-path.
//!
//! Task submission is bursty: a single message arrival can release a whole
//! ring of tasks. The notifier keeps the hot path (work available, workers
//! spinning through their deques) lock-free and only touches the condvar
//! when a worker has actually gone to sleep.
//!
//! # Architecture
//! - Atomic flag for lock-free fast-path (busy periods)
//! - Condvar fallback for idle wake (sporadic submission)

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Two-tier wake notifier shared by all workers of a scheduler.
#[derive(Debug)]
pub(crate) struct WakeNotifier {
    /// Atomic flag for lock-free fast-path
    work_ready: AtomicBool,
    /// Number of workers currently parked on the condvar
    sleepers: AtomicUsize,
    /// Mutex for condvar (only used when sleeping)
    lock: Mutex<()>,
    /// Condvar for efficient waiting when idle
    condvar: Condvar,
}

impl WakeNotifier {
    pub fn new() -> Self {
        Self {
            work_ready: AtomicBool::new(false),
            sleepers: AtomicUsize::new(0),
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Signal that work is available.
    ///
    /// Fast path is a single atomic store; the condvar is only signaled when
    /// a worker might be parked. The sleeper check is racy but safe: the
    /// worst case is one extra signal or one 10ms park timeout.
    #[inline]
    pub fn notify(&self) {
        self.work_ready.store(true, Ordering::Release);
        if self.sleepers.load(Ordering::Acquire) > 0 {
            let _guard = self.lock.lock();
            self.condvar.notify_all();
        }
    }

    /// Consume the ready flag without blocking.
    #[inline]
    pub fn check_and_clear(&self) -> bool {
        self.work_ready.swap(false, Ordering::AcqRel)
    }

    /// Park until notified or `timeout` elapses. Returns true if work was
    /// signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.check_and_clear() {
            return true;
        }
        self.sleepers.fetch_add(1, Ordering::AcqRel);
        let mut guard = self.lock.lock();
        // Re-check under the lock so a notify between check and park is not
        // lost.
        if !self.check_and_clear() {
            self.condvar.wait_for(&mut guard, timeout);
        }
        drop(guard);
        self.sleepers.fetch_sub(1, Ordering::AcqRel);
        self.check_and_clear()
    }
}
