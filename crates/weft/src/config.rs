// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Global configuration - single source of truth.
//!
//! This module centralizes the runtime constants and the dynamic
//! configuration. **Never hardcode these elsewhere!**
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: compile-time constants (message caps, table sizes)
//! - **Level 2 (Dynamic)**: [`RuntimeConfig`] for per-world tuning
//!
//! # Performance
//!
//! - **Lock-free**: `DashMap` for the settings store (no RwLock contention)
//! - **Atomic swap**: `ArcSwap` for the limits block (no lock)

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::Arc;

// =======================================================================
// Active-message envelope (Level 1)
// =======================================================================

/// Upper bound for one in-band active message, header included.
///
/// Payloads that do not fit must travel as iovecs via the split-metadata
/// protocol; exceeding the cap without iovecs is a fatal resource error.
pub const MAX_AM_SIZE: usize = 4096;

/// Fixed envelope header length in bytes.
///
/// taskpool_id(4) + template_id(8) + key_offset(8) + fn_id(1) +
/// num_iovecs(1) + input_slot(4) + num_keys(4) + sender_rank(4)
pub const MSG_HEADER_LEN: usize = 34;

// =======================================================================
// Task-instance table (Level 1)
// =======================================================================

/// Buckets per template instance table (power of two).
pub const INSTANCE_TABLE_BUCKETS: usize = 256;

// =======================================================================
// Scheduler (Level 1)
// =======================================================================

/// Worker threads when the builder does not specify a count.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Idle worker park timeout in milliseconds.
pub const WORKER_PARK_TIMEOUT_MS: u64 = 10;

// =======================================================================
// Dynamic configuration (Level 2)
// =======================================================================

/// Hot-swappable numeric limits.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_am_size: usize,
    pub table_buckets: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_am_size: MAX_AM_SIZE,
            table_buckets: INSTANCE_TABLE_BUCKETS,
        }
    }
}

/// Per-world dynamic configuration.
///
/// String settings live in a lock-free map; the limits block swaps
/// atomically so hot paths read it without locking.
pub struct RuntimeConfig {
    settings: DashMap<Arc<str>, Arc<str>>,
    limits: ArcSwap<Limits>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self {
            settings: DashMap::new(),
            limits: ArcSwap::from_pointee(Limits::default()),
        }
    }

    pub fn limits(&self) -> Arc<Limits> {
        self.limits.load_full()
    }

    pub fn set_limits(&self, limits: Limits) {
        self.limits.store(Arc::new(limits));
    }

    pub fn set(&self, key: &str, value: &str) {
        self.settings.insert(Arc::from(key), Arc::from(value));
    }

    pub fn get(&self, key: &str) -> Option<Arc<str>> {
        self.settings.get(key).map(|v| Arc::clone(v.value()))
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_swap() {
        let cfg = RuntimeConfig::new();
        assert_eq!(cfg.limits().max_am_size, MAX_AM_SIZE);
        cfg.set_limits(Limits {
            max_am_size: 8192,
            table_buckets: 64,
        });
        assert_eq!(cfg.limits().max_am_size, 8192);
    }

    #[test]
    fn settings_roundtrip() {
        let cfg = RuntimeConfig::new();
        assert!(cfg.get("termination.mode").is_none());
        cfg.set("termination.mode", "dynamic");
        assert_eq!(&*cfg.get("termination.mode").unwrap(), "dynamic");
    }
}
