// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Reference-counted data copies with copy elision and deferred writers.
//!
//! Every value flowing between task instances is owned by exactly one
//! [`DataCopy`]. Consumers either share the copy read-only, take exclusive
//! write ownership, or get a duplicate, depending on the copy's current
//! state. A single successor task may be parked on a copy and is released
//! when the current holders are done with it.
//!
//! # State model
//!
//! ```text
//! CopyMode::ReadShared { readers }   n concurrent readers, no writer
//! CopyMode::Mutable                  exactly one (pending or running) writer
//! ```
//!
//! Transitions happen under the copy's control mutex; the instance-table
//! bucket lock is additionally held across `register_data_copy` so slot
//! binding and the reader/writer transition are observed atomically.

use crate::core::ser::{Codec, CursorMut, IoSpan, SerResult};
use parking_lot::Mutex;
use std::any::Any;
use std::cell::UnsafeCell;
use std::sync::Arc;

/// Type-erased view over a concrete [`Codec`] value.
///
/// Object-safe subset of `Codec` plus `Any` access; the unpack direction
/// stays on the typed side (input descriptors carry a monomorphized unpack
/// hook).
pub(crate) trait ErasedValue: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
    fn payload_size(&self) -> usize;
    fn pack(&self, cur: &mut CursorMut<'_>) -> SerResult<()>;
    fn iovecs(&mut self) -> Vec<IoSpan>;
    fn try_duplicate(&self) -> Option<Box<dyn ErasedValue>>;
    fn type_name(&self) -> &'static str;
    /// Address of the concrete value, used as the pointer-registry key.
    fn value_addr(&self) -> usize;
}

impl<T: Codec> ErasedValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
    fn payload_size(&self) -> usize {
        Codec::payload_size(self)
    }
    fn pack(&self, cur: &mut CursorMut<'_>) -> SerResult<()> {
        Codec::pack(self, cur)
    }
    fn iovecs(&mut self) -> Vec<IoSpan> {
        Codec::iovecs(self)
    }
    fn try_duplicate(&self) -> Option<Box<dyn ErasedValue>> {
        Codec::try_duplicate(self).map(|v| Box::new(v) as Box<dyn ErasedValue>)
    }
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
    fn value_addr(&self) -> usize {
        self as *const T as usize
    }
}

/// Sharing mode of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopyMode {
    /// `readers` concurrent read-only holders (>= 1 while live).
    ReadShared { readers: u32 },
    /// A writer owns the copy exclusively (pending or running).
    Mutable,
}

/// A task parked on a copy, waiting to gain exclusive access.
pub(crate) struct NextTask {
    pub task: Arc<dyn DeferredTask>,
    /// Writer chose to wait for current readers instead of duplicating.
    pub defer_writer: bool,
}

/// Control word of a copy: mode plus the optional deferred successor.
pub(crate) struct CopyCtl {
    pub mode: CopyMode,
    pub next_task: Option<NextTask>,
}

/// Handle to a task record whose release was withheld by the copy manager.
///
/// The copy holds the only strong reference to such a record until handover;
/// the 2-cycle through the record's input slot is broken on every release
/// path.
pub(crate) trait DeferredTask: Send + Sync {
    /// Hand the record to the scheduler.
    fn release_now(self: Arc<Self>);
    /// Swap `old` for `new` in the record's input slots (duplicate-and-replace).
    fn replace_copy(&self, old: &Arc<DataCopy>, new: Arc<DataCopy>);
}

/// Owner of exactly one value flowing between task instances.
pub struct DataCopy {
    cell: UnsafeCell<Box<dyn ErasedValue>>,
    ctl: Mutex<CopyCtl>,
}

// SAFETY: access to `cell` follows the reader/writer protocol tracked in
// `ctl`: shared references are only handed out in ReadShared mode and the
// single mutable reference only in Mutable mode, so no aliasing occurs.
unsafe impl Send for DataCopy {}
unsafe impl Sync for DataCopy {}

impl DataCopy {
    /// Wrap a value into a fresh copy with one reader (the creator).
    pub(crate) fn new<T: Codec>(value: T) -> Arc<Self> {
        Self::from_boxed(Box::new(value))
    }

    pub(crate) fn from_boxed(value: Box<dyn ErasedValue>) -> Arc<Self> {
        Arc::new(Self {
            cell: UnsafeCell::new(value),
            ctl: Mutex::new(CopyCtl {
                mode: CopyMode::ReadShared { readers: 1 },
                next_task: None,
            }),
        })
    }

    /// Shared view of the value.
    pub(crate) fn value(&self) -> &dyn ErasedValue {
        // SAFETY: callers hold a reader share or the bucket lock; no writer
        // reference exists in either case.
        unsafe { &**self.cell.get() }
    }

    /// Exclusive view of the value. Caller must own the copy in Mutable mode.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn value_mut(&self) -> &mut dyn ErasedValue {
        // SAFETY: the copy is in Mutable mode and the caller is its single
        // writer; no shared references are live.
        unsafe { &mut **self.cell.get() }
    }

    pub(crate) fn get_ref<T: Codec>(&self) -> Option<&T> {
        self.value().as_any().downcast_ref::<T>()
    }

    pub(crate) fn value_addr(&self) -> usize {
        self.value().value_addr()
    }

    pub(crate) fn lock_ctl(&self) -> parking_lot::MutexGuard<'_, CopyCtl> {
        self.ctl.lock()
    }

    pub(crate) fn num_readers(&self) -> u32 {
        match self.ctl.lock().mode {
            CopyMode::ReadShared { readers } => readers,
            CopyMode::Mutable => 0,
        }
    }

    pub(crate) fn is_mutable(&self) -> bool {
        matches!(self.ctl.lock().mode, CopyMode::Mutable)
    }

    /// Add a reader share (remote-transfer pins, local broadcast fan-out).
    ///
    /// Fails when a writer already owns the copy.
    pub(crate) fn acquire_reader(&self) -> bool {
        let mut ctl = self.ctl.lock();
        match ctl.mode {
            CopyMode::ReadShared { ref mut readers } => {
                *readers += 1;
                true
            }
            CopyMode::Mutable => false,
        }
    }
}

impl std::fmt::Debug for DataCopy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ctl = self.ctl.lock();
        f.debug_struct("DataCopy")
            .field("mode", &ctl.mode)
            .field("has_next_task", &ctl.next_task.is_some())
            .field("type", &self.value().type_name())
            .finish()
    }
}

/// Outcome of [`register_data_copy`].
pub(crate) struct Registered {
    /// Copy to bind into the consumer's input slot.
    pub copy: Arc<DataCopy>,
    /// The consumer's release was withheld; it will be released by
    /// [`release_data_copy`] when the current holders finish.
    pub defer_release: bool,
}

/// Duplication failed because the value type is move-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NotCopyable;

fn duplicate_value(copy: &DataCopy) -> Result<Arc<DataCopy>, NotCopyable> {
    match copy.value().try_duplicate() {
        Some(boxed) => Ok(DataCopy::from_boxed(boxed)),
        None => Err(NotCopyable),
    }
}

/// Register `task` as a consumer of `copy_in`.
///
/// Applies the fixed sharing policy: readers share, the first exclusive
/// writer takes over with its release deferred, later writers get
/// duplicates, and a `defer_writer` writer parks itself until readers
/// drain. Returns the copy to bind (which may be a duplicate) and whether
/// the task's release is withheld.
///
/// Must be called with the instance-table bucket lock held.
pub(crate) fn register_data_copy(
    copy_in: &Arc<DataCopy>,
    task: &Arc<dyn DeferredTask>,
    readonly: bool,
    task_defer_writer: bool,
) -> Result<Registered, NotCopyable> {
    let mut ctl = copy_in.lock_ctl();

    if readonly {
        match ctl.mode {
            CopyMode::ReadShared { ref mut readers } => {
                *readers += 1;
                return Ok(Registered {
                    copy: Arc::clone(copy_in),
                    defer_release: false,
                });
            }
            CopyMode::Mutable => {
                if let Some(next) = &ctl.next_task {
                    if next.defer_writer {
                        // The writer waits for readers anyway; share.
                        return Ok(Registered {
                            copy: Arc::clone(copy_in),
                            defer_release: false,
                        });
                    }
                }
                // A writer will mutate this copy. Duplicate, and if a
                // successor was parked here, move it onto the duplicate so
                // the original becomes shareable again.
                let new_copy = duplicate_value(copy_in)?;
                if let Some(next) = ctl.next_task.take() {
                    ctl.mode = CopyMode::ReadShared { readers: 1 };
                    drop(ctl);
                    new_copy.lock_ctl().mode = CopyMode::Mutable;
                    next.task.replace_copy(copy_in, Arc::clone(&new_copy));
                    next.task.release_now();
                    return Ok(Registered {
                        copy: Arc::clone(copy_in),
                        defer_release: false,
                    });
                }
                return Ok(Registered {
                    copy: new_copy,
                    defer_release: false,
                });
            }
        }
    }

    // Read-write request.
    match ctl.mode {
        CopyMode::ReadShared { readers } => {
            if readers == 1 && !task_defer_writer && ctl.next_task.is_none() {
                // Sole reader: take over the copy and defer our release until
                // the current holder lets go.
                ctl.mode = CopyMode::Mutable;
                ctl.next_task = Some(NextTask {
                    task: Arc::clone(task),
                    defer_writer: false,
                });
                Ok(Registered {
                    copy: Arc::clone(copy_in),
                    defer_release: true,
                })
            } else if task_defer_writer && ctl.next_task.is_none() {
                // First writer, waiting for readers to drain.
                ctl.next_task = Some(NextTask {
                    task: Arc::clone(task),
                    defer_writer: true,
                });
                Ok(Registered {
                    copy: Arc::clone(copy_in),
                    defer_release: true,
                })
            } else {
                let new_copy = duplicate_value(copy_in)?;
                new_copy.lock_ctl().mode = CopyMode::Mutable;
                Ok(Registered {
                    copy: new_copy,
                    defer_release: false,
                })
            }
        }
        CopyMode::Mutable => {
            let new_copy = duplicate_value(copy_in)?;
            new_copy.lock_ctl().mode = CopyMode::Mutable;
            Ok(Registered {
                copy: new_copy,
                defer_release: false,
            })
        }
    }
}

/// Drop one holder's share of `copy`, possibly handing it to a parked
/// successor.
///
/// Called when a task completes (for each bound input) and when a transfer
/// pin is released.
pub(crate) fn release_data_copy(copy: &Arc<DataCopy>) {
    let deferred: Option<NextTask>;
    {
        let mut ctl = copy.lock_ctl();
        match ctl.mode {
            CopyMode::Mutable => {
                match ctl.next_task.take() {
                    Some(next) => {
                        // Ownership transfers to the parked writer; the copy
                        // stays mutable for it.
                        deferred = Some(next);
                    }
                    None => {
                        // Writer finished with no consumers; the value dies
                        // with the last Arc.
                        ctl.mode = CopyMode::ReadShared { readers: 0 };
                        deferred = None;
                    }
                }
            }
            CopyMode::ReadShared { ref mut readers } => {
                debug_assert!(*readers > 0, "release on a dead copy");
                *readers -= 1;
                if *readers == 0 {
                    match ctl.next_task.take() {
                        Some(next) => {
                            // Readers drained; the waiting writer takes over.
                            ctl.mode = CopyMode::Mutable;
                            deferred = Some(next);
                        }
                        None => deferred = None,
                    }
                } else {
                    deferred = None;
                }
            }
        }
    }
    if let Some(next) = deferred {
        next.task.release_now();
    }
}
