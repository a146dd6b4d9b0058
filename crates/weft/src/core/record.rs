// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Per-instance task state while inputs are being gathered.

use crate::core::copy::DataCopy;
use crate::device::DeviceRun;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// State of one input slot.
pub(crate) enum SlotState {
    Empty,
    /// Value bound (normal inputs).
    Bound(Arc<DataCopy>),
    /// Control signal received (void inputs).
    Signaled,
    /// Streaming accumulation in progress.
    Stream {
        copy: Option<Arc<DataCopy>>,
        seen: usize,
        goal: Option<usize>,
    },
    /// Aggregate collection in progress.
    Aggregate {
        copies: Vec<Arc<DataCopy>>,
        seen: usize,
        goal: Option<usize>,
    },
}

/// Mutable record state, guarded by the record mutex.
///
/// All mutation happens under the owning bucket lock while the record is
/// discoverable; after removal only the releasing path touches it.
pub(crate) struct RecordInner<K> {
    pub slots: Vec<SlotState>,
    /// Record is still discoverable in the instance table.
    pub in_table: bool,
    /// Lazy-pull templates: pull messages already issued.
    pub pulls_issued: bool,
    /// Device-task state machine, present between release and completion of
    /// a device task.
    pub device: Option<DeviceRun<K>>,
}

/// One live instance of a template task.
pub(crate) struct TaskRecord<K> {
    pub key: K,
    pub priority: i32,
    pub defer_writer: bool,
    /// Inputs satisfied so far; the record fires when this reaches the
    /// declared input count.
    dep_count: AtomicUsize,
    released: AtomicBool,
    pub inner: Mutex<RecordInner<K>>,
}

impl<K> TaskRecord<K> {
    pub fn new(key: K, num_inputs: usize, priority: i32, defer_writer: bool) -> Arc<Self> {
        let mut slots = Vec::with_capacity(num_inputs);
        for _ in 0..num_inputs {
            slots.push(SlotState::Empty);
        }
        Arc::new(Self {
            key,
            priority,
            defer_writer,
            dep_count: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            inner: Mutex::new(RecordInner {
                slots,
                in_table: false,
                pulls_issued: false,
                device: None,
            }),
        })
    }

    /// Count one satisfied input; returns the new count.
    pub fn satisfy_one(&self) -> usize {
        self.dep_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn deps_satisfied(&self) -> usize {
        self.dep_count.load(Ordering::Acquire)
    }

    /// At-most-once firing guard; true for exactly one caller.
    pub fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    /// Copies bound to this record, in slot order (aggregate slots expand).
    pub fn bound_copies(&self) -> Vec<Arc<DataCopy>> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for slot in &inner.slots {
            match slot {
                SlotState::Bound(c) => out.push(Arc::clone(c)),
                SlotState::Stream { copy: Some(c), .. } => out.push(Arc::clone(c)),
                SlotState::Aggregate { copies, .. } => {
                    out.extend(copies.iter().cloned());
                }
                _ => {}
            }
        }
        out
    }
}
