// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! World: the process-wide handle over one taskpool.
//!
//! A `World` owns the communication engine binding, the worker pool, the
//! template registry, the delayed-unpack buffer for early messages, the
//! pointer registry, and the counters feeding termination detection.
//!
//! Lifecycle: build -> construct graph -> `execute()` -> seed work ->
//! `fence()` -> (more phases, or drop). Dropping the last handle tears the
//! worker pool down.

use crate::config::RuntimeConfig;
use crate::core::copy::{release_data_copy, DataCopy};
use crate::core::registry::PtrRegistry;
use crate::device::{DeviceDriver, MockDriver};
use crate::engine::Scheduler;
use crate::graph::{Error, Result};
use crate::protocol::{envelope, MsgHeader};
use crate::transport::{loopback, AmHandler, CommEngine, Rank};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// How a fence decides that the cluster is quiescent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationMode {
    /// Count outstanding tasks and in-flight messages until a global zero
    /// is observed twice.
    Dynamic,
    /// Additionally require every rank to have called
    /// [`World::local_complete`]; for open-ended graphs.
    UserTriggered,
}

/// A template registered with a world; the dispatch target for incoming
/// active messages.
pub(crate) trait TemplateHandle: Send + Sync {
    fn template_id(&self) -> u64;
    fn name(&self) -> &str;
    fn handle_message(&self, from: Rank, hdr: &MsgHeader, payload: &[u8]);
}

pub(crate) struct WorldImpl {
    pub(crate) engine: Arc<dyn CommEngine>,
    pub(crate) scheduler: Scheduler,
    pub(crate) config: RuntimeConfig,
    pub(crate) registry: PtrRegistry,
    pub(crate) driver: Arc<dyn DeviceDriver>,
    taskpool_id: u32,
    termination: TerminationMode,
    templates: DashMap<u64, Arc<dyn TemplateHandle>>,
    next_template_id: AtomicU64,
    /// Messages that arrived before their template registered, keyed by
    /// template id; replayed on registration.
    delayed: DashMap<u64, Vec<(Rank, Vec<u8>)>>,
    /// Copies pinned for in-flight one-sided transfers, keyed by release
    /// token.
    transfer_pins: DashMap<u64, Arc<DataCopy>>,
    next_token: AtomicU64,
    /// Local tasks created but not yet completed.
    pending_tasks: AtomicU64,
    msgs_sent: AtomicU64,
    msgs_received: AtomicU64,
    complete_flagged: AtomicBool,
}

impl WorldImpl {
    pub fn rank(&self) -> Rank {
        self.engine.rank()
    }

    pub fn size(&self) -> u32 {
        self.engine.size()
    }

    pub fn taskpool_id(&self) -> u32 {
        self.taskpool_id
    }

    pub fn allocate_template_id(&self) -> u64 {
        self.next_template_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Install a template and replay any messages buffered for its id.
    pub fn install_template(&self, handle: Arc<dyn TemplateHandle>) {
        let id = handle.template_id();
        self.templates.insert(id, Arc::clone(&handle));
        if let Some((_, buffered)) = self.delayed.remove(&id) {
            log::debug!(
                "replaying {} delayed message(s) for template '{}'",
                buffered.len(),
                handle.name()
            );
            for (from, bytes) in buffered {
                match envelope::split(&bytes) {
                    Ok((hdr, payload)) => handle.handle_message(from, &hdr, payload),
                    Err(e) => log::error!("dropping corrupt delayed message: {}", e),
                }
                self.msgs_received.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    pub fn task_created(&self) {
        self.pending_tasks.fetch_add(1, Ordering::AcqRel);
    }

    pub fn task_completed(&self) {
        self.pending_tasks.fetch_sub(1, Ordering::AcqRel);
    }

    /// Point-to-point active message, counted for termination detection.
    pub fn send_am(&self, dest: Rank, bytes: Vec<u8>) {
        self.msgs_sent.fetch_add(1, Ordering::AcqRel);
        self.engine.send_am(dest, bytes);
    }

    /// Pin `copy` for an in-flight transfer; the returned token is carried
    /// in the envelope and handed back via `on_release`.
    pub fn pin_for_transfer(&self, copy: Arc<DataCopy>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::AcqRel);
        self.transfer_pins.insert(token, copy);
        token
    }

    /// Tell the sender of a pulled span that its pin can go; counted like a
    /// message so fences do not race the release.
    pub fn notify_release(&self, owner: Rank, token: u64) {
        self.msgs_sent.fetch_add(1, Ordering::AcqRel);
        self.engine.notify_release(owner, token);
    }

    fn locally_idle(&self) -> bool {
        self.pending_tasks.load(Ordering::Acquire) == 0 && self.scheduler.is_idle()
    }

    fn counters(&self) -> [u64; 3] {
        // Buffered messages count as received for detection purposes; a
        // template that never registers must not hang the fence (the
        // leftovers are reported as an error instead).
        let buffered: u64 = self.delayed.iter().map(|e| e.value().len() as u64).sum();
        [
            self.msgs_sent.load(Ordering::Acquire),
            self.msgs_received.load(Ordering::Acquire) + buffered,
            u64::from(self.complete_flagged.load(Ordering::Acquire)),
        ]
    }

    /// Block until every task originating from this process has completed
    /// cluster-wide.
    ///
    /// Counting detector: wait for local quiescence, then run the counting
    /// allreduce until two consecutive rounds agree on a globally drained
    /// state. All ranks must fence together.
    pub fn fence(&self) -> Result<()> {
        if !self.scheduler.gate_open() {
            self.scheduler.open_gate();
        }
        let mut last: Option<[u64; 3]> = None;
        loop {
            while !self.locally_idle() {
                std::thread::sleep(Duration::from_millis(1));
            }
            let totals = self.engine.allreduce_sum(self.counters());
            let drained = totals[0] == totals[1]
                && (self.termination == TerminationMode::Dynamic
                    || totals[2] == u64::from(self.size()));
            if drained && last == Some(totals) && self.locally_idle() {
                break;
            }
            last = if drained { Some(totals) } else { None };
        }
        let leftover: usize = self.delayed.iter().map(|e| e.value().len()).sum();
        if leftover > 0 {
            log::error!(
                "fence: {} message(s) still buffered for unregistered templates",
                leftover
            );
            return Err(Error::MissingTemplates(leftover));
        }
        log::debug!(
            "fence complete on rank {} ({} values still registered)",
            self.rank(),
            self.registry.len()
        );
        Ok(())
    }
}

impl Drop for WorldImpl {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        self.registry.clear();
        self.transfer_pins.clear();
    }
}

/// Message handler registered with the engine.
///
/// Holds the world weakly so the delivery thread does not keep a dead
/// world alive.
struct WorldHandler {
    world: Weak<WorldImpl>,
}

impl AmHandler for WorldHandler {
    fn on_message(&self, from: Rank, bytes: &[u8]) {
        let Some(world) = self.world.upgrade() else {
            return;
        };
        let (hdr, payload) = match envelope::split(bytes) {
            Ok(split) => split,
            Err(e) => {
                log::error!("dropping malformed message from rank {}: {}", from, e);
                return;
            }
        };
        match world.templates.get(&hdr.template_id) {
            Some(tt) => {
                tt.handle_message(from, &hdr, payload);
            }
            None => {
                // Template not registered yet: buffer and replay later.
                world
                    .delayed
                    .entry(hdr.template_id)
                    .or_default()
                    .push((from, bytes.to_vec()));
                return;
            }
        }
        // Counted only after processing so the termination detector never
        // observes a half-handled message.
        world.msgs_received.fetch_add(1, Ordering::AcqRel);
    }

    fn on_release(&self, token: u64) {
        let Some(world) = self.world.upgrade() else {
            return;
        };
        if let Some((_, copy)) = world.transfer_pins.remove(&token) {
            release_data_copy(&copy);
        } else {
            log::warn!("release notification for unknown token {}", token);
        }
        world.msgs_received.fetch_add(1, Ordering::AcqRel);
    }
}

/// Builder for a [`World`].
pub struct WorldBuilder {
    threads: usize,
    engine: Option<Arc<dyn CommEngine>>,
    termination: TerminationMode,
    driver: Option<Arc<dyn DeviceDriver>>,
    taskpool_id: u32,
}

impl WorldBuilder {
    /// Worker threads for this world's scheduler.
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    /// Bind to a communication engine; defaults to a single-rank in-process
    /// engine.
    pub fn engine(mut self, engine: Arc<dyn CommEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn termination(mut self, mode: TerminationMode) -> Self {
        self.termination = mode;
        self
    }

    /// Device driver for device tasks; defaults to the synchronous mock.
    pub fn device_driver(mut self, driver: Arc<dyn DeviceDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn taskpool_id(mut self, id: u32) -> Self {
        self.taskpool_id = id;
        self
    }

    pub fn build(self) -> Result<World> {
        let engine = match self.engine {
            Some(engine) => engine,
            None => {
                let mut engines = loopback::cluster(1);
                let engine: Arc<dyn CommEngine> = engines.pop().expect("single-rank cluster");
                engine
            }
        };
        let inner = Arc::new(WorldImpl {
            scheduler: Scheduler::new(self.threads),
            config: RuntimeConfig::new(),
            registry: PtrRegistry::new(),
            driver: self.driver.unwrap_or_else(|| Arc::new(MockDriver)),
            taskpool_id: self.taskpool_id,
            termination: self.termination,
            templates: DashMap::new(),
            next_template_id: AtomicU64::new(1),
            delayed: DashMap::new(),
            transfer_pins: DashMap::new(),
            next_token: AtomicU64::new(1),
            pending_tasks: AtomicU64::new(0),
            msgs_sent: AtomicU64::new(0),
            msgs_received: AtomicU64::new(0),
            complete_flagged: AtomicBool::new(false),
            engine: Arc::clone(&engine),
        });
        engine.set_handler(Arc::new(WorldHandler {
            world: Arc::downgrade(&inner),
        }));
        Ok(World { inner })
    }
}

/// Process-wide handle over the runtime. Cheap to clone.
#[derive(Clone)]
pub struct World {
    pub(crate) inner: Arc<WorldImpl>,
}

impl World {
    pub fn builder() -> WorldBuilder {
        WorldBuilder {
            threads: crate::config::DEFAULT_WORKER_THREADS,
            engine: None,
            termination: TerminationMode::Dynamic,
            driver: None,
            taskpool_id: 0,
        }
    }

    pub fn rank(&self) -> Rank {
        self.inner.rank()
    }

    pub fn size(&self) -> u32 {
        self.inner.size()
    }

    /// Open the scheduler gate: queued and future tasks start running.
    pub fn execute(&self) {
        self.inner.scheduler.open_gate();
    }

    /// Block until all previously created tasks have completed across the
    /// cluster. All ranks must call this together.
    pub fn fence(&self) -> Result<()> {
        self.inner.fence()
    }

    /// In [`TerminationMode::UserTriggered`], declare that this rank will
    /// create no more root work.
    pub fn local_complete(&self) {
        self.inner.complete_flagged.store(true, Ordering::Release);
    }

    /// Outstanding local tasks (diagnostic).
    pub fn pending_tasks(&self) -> u64 {
        self.inner.pending_tasks.load(Ordering::Acquire)
    }

    /// Copies still pinned for in-flight one-sided transfers (diagnostic).
    pub fn active_transfer_pins(&self) -> usize {
        self.inner.transfer_pins.len()
    }

    /// Dynamic runtime configuration for this world.
    pub fn config(&self) -> &crate::config::RuntimeConfig {
        &self.inner.config
    }
}
