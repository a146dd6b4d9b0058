// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Concurrent key → task-record table with per-bucket locks.
//!
//! One table per template task. The bucket lock is the synchronization
//! point for everything that happens to a record while it is discoverable:
//! slot binding, stream accumulation, and the decision to remove the record
//! on its last arrival all run inside one critical section.

use crate::config;
use crate::core::record::TaskRecord;
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

type Bucket<K> = Vec<(u64, Arc<TaskRecord<K>>)>;

pub(crate) struct InstanceTable<K> {
    buckets: Box<[Mutex<Bucket<K>>]>,
    mask: u64,
}

/// Lock over one bucket; find/insert/remove stay valid while this is held.
pub(crate) struct BucketGuard<'a, K> {
    guard: MutexGuard<'a, Bucket<K>>,
    hash: u64,
}

pub(crate) fn key_hash<K: Hash>(key: &K) -> u64 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    h.finish()
}

impl<K: Hash + Eq> InstanceTable<K> {
    pub fn new() -> Self {
        Self::with_buckets(config::INSTANCE_TABLE_BUCKETS)
    }

    pub fn with_buckets(n: usize) -> Self {
        debug_assert!(n.is_power_of_two());
        let buckets = (0..n).map(|_| Mutex::new(Vec::new())).collect::<Vec<_>>();
        Self {
            buckets: buckets.into_boxed_slice(),
            mask: (n - 1) as u64,
        }
    }

    /// Lock the bucket owning `key`.
    pub fn lock_bucket(&self, key: &K) -> BucketGuard<'_, K> {
        let hash = key_hash(key);
        let idx = (hash & self.mask) as usize;
        BucketGuard {
            guard: self.buckets[idx].lock(),
            hash,
        }
    }

    /// Number of live records (diagnostic; takes every bucket lock).
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }
}

impl<K: Eq> BucketGuard<'_, K> {
    pub fn find(&self, key: &K) -> Option<Arc<TaskRecord<K>>> {
        self.guard
            .iter()
            .find(|(h, rec)| *h == self.hash && rec.key == *key)
            .map(|(_, rec)| Arc::clone(rec))
    }

    /// Insert a record created by the caller; marks it discoverable.
    pub fn insert(&mut self, record: Arc<TaskRecord<K>>) {
        record.inner.lock().in_table = true;
        self.guard.push((self.hash, record));
    }

    /// Pop the record for `key`, clearing its discoverable flag.
    pub fn remove(&mut self, key: &K) -> Option<Arc<TaskRecord<K>>> {
        let pos = self
            .guard
            .iter()
            .position(|(h, rec)| *h == self.hash && rec.key == *key)?;
        let (_, rec) = self.guard.swap_remove(pos);
        rec.inner.lock().in_table = false;
        Some(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_find_remove() {
        let table: InstanceTable<u32> = InstanceTable::with_buckets(16);
        let rec = TaskRecord::new(7u32, 1, 0, false);
        {
            let mut bucket = table.lock_bucket(&7);
            assert!(bucket.find(&7).is_none());
            bucket.insert(Arc::clone(&rec));
            assert!(bucket.find(&7).is_some());
        }
        assert_eq!(table.len(), 1);
        {
            let mut bucket = table.lock_bucket(&7);
            let popped = bucket.remove(&7).unwrap();
            assert!(Arc::ptr_eq(&popped, &rec));
            assert!(!popped.inner.lock().in_table);
        }
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn distinct_keys_coexist_in_one_bucket() {
        // Single bucket forces collisions; lookups must still separate keys.
        let table: InstanceTable<u64> = InstanceTable::with_buckets(1);
        for k in 0..32u64 {
            let mut bucket = table.lock_bucket(&k);
            bucket.insert(TaskRecord::new(k, 1, 0, false));
        }
        assert_eq!(table.len(), 32);
        for k in 0..32u64 {
            let bucket = table.lock_bucket(&k);
            assert_eq!(bucket.find(&k).unwrap().key, k);
        }
    }

    #[test]
    fn concurrent_insert_or_lookup() {
        let table: Arc<InstanceTable<u32>> = Arc::new(InstanceTable::with_buckets(8));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                for k in 0..100u32 {
                    let mut bucket = table.lock_bucket(&k);
                    if bucket.find(&k).is_none() {
                        bucket.insert(TaskRecord::new(k, 2, 0, false));
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // insert-or-lookup must never double-insert a key
        assert_eq!(table.len(), 100);
    }
}
