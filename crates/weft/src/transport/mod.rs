// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Communication-engine abstraction.
//!
//! The runtime does not own a network stack. It assumes an engine that
//! provides point-to-point active messages, one-sided GET against
//! registered regions, a barrier, and a counting allreduce for the
//! termination detector. [`loopback`] ships an in-process reference engine
//! wiring N ranks over channels, used by multi-rank tests and single-node
//! runs.

pub mod loopback;

use crate::core::ser::IoSpan;
use std::sync::Arc;

/// Rank index within a world, `0..size`.
pub type Rank = u32;

/// Callbacks a world registers with its engine.
///
/// Invoked on the engine's delivery thread; implementations may call back
/// into `set_arg` and thereby create tasks without a scheduler lock.
pub trait AmHandler: Send + Sync {
    /// A point-to-point active message arrived.
    fn on_message(&self, from: Rank, bytes: &[u8]);
    /// A receiver finished pulling the span pinned under `token`.
    fn on_release(&self, token: u64);
}

/// Point-to-point + one-sided communication engine, one instance per rank.
pub trait CommEngine: Send + Sync {
    fn rank(&self) -> Rank;
    fn size(&self) -> u32;

    /// Install the message handler. Must be called exactly once, before the
    /// first message is sent to this rank.
    fn set_handler(&self, handler: Arc<dyn AmHandler>);

    /// Fire-and-forget active message.
    fn send_am(&self, dest: Rank, bytes: Vec<u8>);

    /// Register a local span for one-sided access; the returned handle is
    /// valid until consumed by a remote GET.
    fn expose(&self, span: IoSpan) -> u64;

    /// Pull a remote span into `dst`. Blocks until the bytes have landed.
    fn get(&self, owner: Rank, handle: u64, dst: IoSpan);

    /// Tell `owner` that the GET for `token` completed so it can drop its
    /// transfer pin.
    fn notify_release(&self, owner: Rank, token: u64);

    /// Collective barrier over all ranks.
    fn barrier(&self);

    /// Collective element-wise sum, the primitive under the termination
    /// detector. Every rank must call with the same generation of values.
    fn allreduce_sum(&self, vals: [u64; 3]) -> [u64; 3];
}
