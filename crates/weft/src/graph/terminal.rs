// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Typed in/out ports of a template task.
//!
//! An out terminal fans out to any number of in-ports; local fan-out shares
//! one data copy across all destinations instead of duplicating the value.

use crate::core::copy::{release_data_copy, DataCopy, ErasedValue};
use crate::core::ser::Codec;
use crate::graph::Key;
use parking_lot::RwLock;
use std::marker::PhantomData;
use std::sync::Arc;

/// A value travelling into an input port.
pub(crate) enum PortValue {
    /// Freshly produced value, moved in.
    Boxed(Box<dyn ErasedValue>),
    /// Existing copy to share (broadcast, forwarded input).
    Shared(Arc<DataCopy>),
    /// Pure control signal, no value carried.
    Signal,
}

/// Receiving side of a connection: one input slot of one template.
pub(crate) trait InPort<K>: Send + Sync {
    /// Deliver one value for `key`.
    fn deposit(&self, key: &K, value: PortValue);
    /// Deliver the same value to every key (owner-partitioned broadcast).
    fn deposit_broadcast(&self, keys: &[K], value: PortValue);
}

/// Sending side: an output terminal of a template, typed by the downstream
/// key and value types.
pub(crate) struct OutTerminal<K: Key, V: Codec> {
    name: &'static str,
    targets: RwLock<Vec<Arc<dyn InPort<K>>>>,
    _types: PhantomData<fn(K, V)>,
}

impl<K: Key, V: Codec> OutTerminal<K, V> {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            targets: RwLock::new(Vec::new()),
            _types: PhantomData,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn attach(&self, port: Arc<dyn InPort<K>>) {
        self.targets.write().push(port);
    }

    pub fn num_targets(&self) -> usize {
        self.targets.read().len()
    }

    /// Send `value` to instance `key` of every connected input.
    pub fn send(&self, key: &K, value: V) {
        let targets = self.targets.read();
        match targets.len() {
            0 => {
                log::warn!("send on unconnected terminal '{}'", self.name);
            }
            1 => targets[0].deposit(key, PortValue::Boxed(Box::new(value))),
            _ => {
                // Fan-out: one copy shared by every destination.
                let copy = DataCopy::new(value);
                for target in targets.iter() {
                    target.deposit(key, PortValue::Shared(Arc::clone(&copy)));
                }
                release_data_copy(&copy);
            }
        }
    }

    /// Send an existing copy (forwarded input) to instance `key`.
    pub fn send_shared(&self, key: &K, copy: &Arc<DataCopy>) {
        for target in self.targets.read().iter() {
            target.deposit(key, PortValue::Shared(Arc::clone(copy)));
        }
    }

    /// Deliver `value` to every key in `keys` across all connected inputs,
    /// sharing a single copy.
    pub fn broadcast(&self, keys: &[K], value: V) {
        let copy = DataCopy::new(value);
        self.broadcast_shared(keys, &copy);
        release_data_copy(&copy);
    }

    pub fn broadcast_shared(&self, keys: &[K], copy: &Arc<DataCopy>) {
        let targets = self.targets.read();
        if targets.is_empty() {
            log::warn!("broadcast on unconnected terminal '{}'", self.name);
            return;
        }
        for target in targets.iter() {
            target.deposit_broadcast(keys, PortValue::Shared(Arc::clone(copy)));
        }
    }

    /// Fire the control signal for instance `key` on every connected input.
    pub fn signal(&self, key: &K) {
        for target in self.targets.read().iter() {
            target.deposit(key, PortValue::Signal);
        }
    }

    pub fn signal_broadcast(&self, keys: &[K]) {
        for target in self.targets.read().iter() {
            target.deposit_broadcast(keys, PortValue::Signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct SinkPort {
        seen: Mutex<Vec<(u32, Option<u64>)>>,
    }

    impl InPort<u32> for SinkPort {
        fn deposit(&self, key: &u32, value: PortValue) {
            let v = match value {
                PortValue::Boxed(b) => b.as_any().downcast_ref::<u64>().copied(),
                PortValue::Shared(c) => c.get_ref::<u64>().copied(),
                PortValue::Signal => None,
            };
            self.seen.lock().push((*key, v));
        }
        fn deposit_broadcast(&self, keys: &[u32], value: PortValue) {
            for key in keys {
                let v = match &value {
                    PortValue::Shared(c) => c.get_ref::<u64>().copied(),
                    _ => None,
                };
                self.seen.lock().push((*key, v));
            }
        }
    }

    #[test]
    fn single_target_gets_moved_value() {
        let out: Arc<OutTerminal<u32, u64>> = OutTerminal::new("out");
        let sink = Arc::new(SinkPort {
            seen: Mutex::new(Vec::new()),
        });
        out.attach(sink.clone());
        out.send(&3, 99u64);
        assert_eq!(&*sink.seen.lock(), &[(3, Some(99))]);
    }

    #[test]
    fn fan_out_shares_one_copy() {
        let out: Arc<OutTerminal<u32, u64>> = OutTerminal::new("out");
        let a = Arc::new(SinkPort {
            seen: Mutex::new(Vec::new()),
        });
        let b = Arc::new(SinkPort {
            seen: Mutex::new(Vec::new()),
        });
        out.attach(a.clone());
        out.attach(b.clone());
        out.send(&1, 5u64);
        assert_eq!(&*a.seen.lock(), &[(1, Some(5))]);
        assert_eq!(&*b.seen.lock(), &[(1, Some(5))]);
    }

    #[test]
    fn broadcast_reaches_every_key() {
        let out: Arc<OutTerminal<u32, u64>> = OutTerminal::new("out");
        let sink = Arc::new(SinkPort {
            seen: Mutex::new(Vec::new()),
        });
        out.attach(sink.clone());
        out.broadcast(&[1, 2, 3], 7u64);
        assert_eq!(
            &*sink.seen.lock(),
            &[(1, Some(7)), (2, Some(7)), (3, Some(7))]
        );
    }
}
