// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Task execution engine: the work-stealing worker pool and its wake
//! plumbing.

pub(crate) mod scheduler;
pub(crate) mod wake;

pub(crate) use scheduler::{Runnable, Scheduler};
