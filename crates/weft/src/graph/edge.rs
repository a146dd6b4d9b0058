// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Edges wire one template's output terminal to another's input.
//!
//! Construction order is free: an edge buffers both sides and completes
//! the wiring as templates register against it. A pull edge additionally
//! carries the user container that serves lazy fetches.

use crate::core::copy::ErasedValue;
use crate::core::ser::Codec;
use crate::graph::terminal::{InPort, OutTerminal};
use crate::graph::Key;
use crate::transport::Rank;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// User container behind a pull edge: maps a key to the rank holding its
/// datum and fetches it there.
pub(crate) struct PullSpec<K> {
    pub owner: Box<dyn Fn(&K) -> Rank + Send + Sync>,
    pub fetch: Box<dyn Fn(&K) -> Box<dyn ErasedValue> + Send + Sync>,
}

struct EdgeInner<K: Key, V: Codec> {
    name: String,
    ins: Mutex<Vec<Arc<dyn InPort<K>>>>,
    outs: Mutex<Vec<Weak<OutTerminal<K, V>>>>,
    pull: Option<Arc<PullSpec<K>>>,
}

/// A directed, typed link between terminals. Cheap to clone; clones refer
/// to the same wiring.
pub struct Edge<K: Key, V: Codec> {
    inner: Arc<EdgeInner<K, V>>,
}

impl<K: Key, V: Codec> Clone for Edge<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Key, V: Codec> Edge<K, V> {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(EdgeInner {
                name: name.to_string(),
                ins: Mutex::new(Vec::new()),
                outs: Mutex::new(Vec::new()),
                pull: None,
            }),
        }
    }

    /// A pull-mode edge: consumers fetch values on demand from `fetch`,
    /// evaluated on the rank `owner` maps the key to.
    pub fn pull(
        name: &str,
        owner: impl Fn(&K) -> Rank + Send + Sync + 'static,
        fetch: impl Fn(&K) -> V + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(EdgeInner {
                name: name.to_string(),
                ins: Mutex::new(Vec::new()),
                outs: Mutex::new(Vec::new()),
                pull: Some(Arc::new(PullSpec {
                    owner: Box::new(owner),
                    fetch: Box::new(move |key| Box::new(fetch(key))),
                })),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_pull(&self) -> bool {
        self.inner.pull.is_some()
    }

    pub(crate) fn pull_spec(&self) -> Option<Arc<PullSpec<K>>> {
        self.inner.pull.as_ref().map(Arc::clone)
    }

    /// Register a consumer input slot; wires it to all live producers.
    pub(crate) fn register_in(&self, port: Arc<dyn InPort<K>>) {
        self.inner.ins.lock().push(Arc::clone(&port));
        for out in self.inner.outs.lock().iter() {
            if let Some(out) = out.upgrade() {
                out.attach(Arc::clone(&port));
            }
        }
    }

    /// Register a producer terminal; wires all known consumers into it.
    pub(crate) fn register_out(&self, out: &Arc<OutTerminal<K, V>>) {
        for port in self.inner.ins.lock().iter() {
            out.attach(Arc::clone(port));
        }
        self.inner.outs.lock().push(Arc::downgrade(out));
    }
}
