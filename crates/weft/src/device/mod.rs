// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Device-task protocol: suspending a task across transfers and kernels.
//!
//! A device task walks a fixed state machine, one resume per transition:
//!
//! ```text
//! Start -> WaitTransfer -> WaitKernel -> WaitSends -> Done
//! ```
//!
//! - `start` declares the views (buffers) the task will use; the runtime
//!   hands them to the driver for staging and suspends.
//! - `on_transfers_done` runs once staging completed; it returns the kernel
//!   to enqueue on the task's stream and suspends again.
//! - `on_kernel_done` runs after the stream callback fired; it issues the
//!   outgoing sends and the task completes.
//!
//! Host tasks collapse the machine to the single `Done` transition. A
//! kernel failure surfaced by the stream callback is fatal; downstream
//! tasks are simply never fired.

use crate::core::ser::IoSpan;
use crate::graph::tt::TaskCtx;

/// Progress of one device-task invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePhase {
    Start,
    WaitTransfer,
    WaitKernel,
    WaitSends,
    Done,
}

/// A buffer the device task wants staged for its kernel.
pub struct ViewDecl {
    pub span: IoSpan,
}

impl ViewDecl {
    /// View over a task-owned byte buffer.
    pub fn of_slice(buf: &mut [u8]) -> Self {
        Self {
            span: IoSpan {
                ptr: buf.as_mut_ptr(),
                len: buf.len(),
            },
        }
    }
}

/// Kernel body enqueued on the task's stream.
pub type Kernel = Box<dyn FnOnce() + Send>;

/// A task that suspends across host-device transfers and kernel launches.
///
/// One instance is produced per `(template, key)` firing by the factory
/// given to `TtBuilder::build_device`; buffers captured by the instance
/// stay valid across all three callbacks.
pub trait DeviceTask<K>: Send {
    /// Declare the views to stage in. Runs on first resume.
    fn start(&mut self, ctx: &mut TaskCtx<'_, K>) -> Vec<ViewDecl>;

    /// Staging completed; return the kernel to enqueue.
    fn on_transfers_done(&mut self, ctx: &mut TaskCtx<'_, K>) -> Kernel;

    /// Kernel completed; issue the outgoing sends.
    fn on_kernel_done(&mut self, ctx: &mut TaskCtx<'_, K>);
}

/// Device-side state stored in the task record between resumes.
pub(crate) struct DeviceRun<K> {
    pub task: Box<dyn DeviceTask<K>>,
    pub phase: DevicePhase,
    pub views: Vec<ViewDecl>,
}

/// Driver abstraction over the accelerator runtime.
///
/// Completion callbacks re-enter the scheduler; a driver may invoke them
/// inline (synchronous devices) or from its own progress thread.
pub trait DeviceDriver: Send + Sync {
    /// Stage the declared views onto the device, then call `done`.
    fn stage_in(&self, views: &[ViewDecl], done: Box<dyn FnOnce() + Send>);

    /// Enqueue `kernel` on the task's stream; report completion or failure
    /// through `done`.
    fn launch(&self, kernel: Kernel, done: Box<dyn FnOnce(Result<(), String>) + Send>);
}

/// Synchronous in-process driver: views are host-resident, staging is a
/// no-op and kernels run inline on the calling worker.
pub struct MockDriver;

impl DeviceDriver for MockDriver {
    fn stage_in(&self, _views: &[ViewDecl], done: Box<dyn FnOnce() + Send>) {
        done();
    }

    fn launch(&self, kernel: Kernel, done: Box<dyn FnOnce(Result<(), String>) + Send>) {
        kernel();
        done(Ok(()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn mock_driver_runs_inline() {
        let driver = MockDriver;
        let hits = Arc::new(AtomicU32::new(0));

        let h = Arc::clone(&hits);
        driver.stage_in(&[], Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h1 = Arc::clone(&hits);
        let h2 = Arc::clone(&hits);
        driver.launch(
            Box::new(move || {
                h1.fetch_add(10, Ordering::SeqCst);
            }),
            Box::new(move |result| {
                assert!(result.is_ok());
                h2.fetch_add(100, Ordering::SeqCst);
            }),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 111);
    }

    #[test]
    fn view_decl_spans_buffer() {
        let mut buf = vec![0u8; 64];
        let view = ViewDecl::of_slice(&mut buf);
        assert_eq!(view.span.len, 64);
        assert_eq!(view.span.ptr, buf.as_mut_ptr());
    }
}
