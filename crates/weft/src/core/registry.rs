// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Process-wide index from value address to owning data copy.
//!
//! When a task forwards a value it received as an input, the outbound path
//! looks the address up here and reuses the inbound copy instead of
//! allocating a new one. Entries are added when a record is handed to the
//! scheduler and removed when the task completes.
//!
//! Registry operations must not be called under an instance-table bucket
//! lock.

use crate::core::copy::DataCopy;
use dashmap::DashMap;
use std::sync::{Arc, Weak};

pub(crate) struct PtrRegistry {
    map: DashMap<usize, Weak<DataCopy>>,
}

impl PtrRegistry {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Index the copy under its value address.
    pub fn insert(&self, copy: &Arc<DataCopy>) {
        self.map.insert(copy.value_addr(), Arc::downgrade(copy));
    }

    /// Drop the index entry for this copy's value address.
    pub fn remove(&self, copy: &Arc<DataCopy>) {
        self.map.remove(&copy.value_addr());
    }

    /// Rediscover the copy owning the value at `addr`, if still alive.
    pub fn lookup(&self, addr: usize) -> Option<Arc<DataCopy>> {
        self.map.get(&addr).and_then(|weak| weak.upgrade())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Drop every entry (world teardown).
    pub fn clear(&self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_roundtrip() {
        let reg = PtrRegistry::new();
        let copy = DataCopy::new(11u64);
        let addr = copy.value_addr();

        reg.insert(&copy);
        let found = reg.lookup(addr).expect("registered copy");
        assert!(Arc::ptr_eq(&found, &copy));

        reg.remove(&copy);
        assert!(reg.lookup(addr).is_none());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn dead_copies_do_not_resolve() {
        let reg = PtrRegistry::new();
        let addr;
        {
            let copy = DataCopy::new(5u32);
            addr = copy.value_addr();
            reg.insert(&copy);
        }
        assert!(reg.lookup(addr).is_none());
    }
}
