// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Template tasks: the graph nodes that spawn, gather, and fire instances.
//!
//! A template declares typed inputs (value, signal, streaming, aggregate,
//! pull), typed outputs, a cluster-consistent keymap, and a body. Every
//! `(template, key)` pair names one instance; `set_arg` delivers a value to
//! one input slot of one instance, creating the record on first arrival and
//! releasing it to the scheduler once every slot is satisfied.
//!
//! Programming errors (double-binding a slot, overflowing a stream goal,
//! delivery to the wrong rank, duplicating a move-only value) are fatal and
//! panic, matching the all-or-nothing failure model.

use crate::core::copy::{
    register_data_copy, release_data_copy, DataCopy, DeferredTask, ErasedValue,
};
use crate::core::record::{RecordInner, SlotState, TaskRecord};
use crate::core::ser::{pack_to_vec, Codec, Cursor, SerResult};
use crate::core::table::InstanceTable;
use crate::device::{DevicePhase, DeviceRun, DeviceTask, ViewDecl};
use crate::engine::Runnable;
use crate::graph::aggregator::Aggregate;
use crate::graph::edge::{Edge, PullSpec};
use crate::graph::terminal::{InPort, OutTerminal, PortValue};
use crate::graph::{Access, Error, Key, Keymap, Priomap, Result};
use crate::protocol::{envelope, FnId, IovecRef, MsgHeader};
use crate::transport::Rank;
use crate::world::{TemplateHandle, World, WorldImpl};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

// ============================================================================
// Input / output declarations
// ============================================================================

type UnpackFn = fn(&mut Cursor<'_>) -> SerResult<Box<dyn ErasedValue>>;

fn unpack_erased<V: Codec>(cur: &mut Cursor<'_>) -> SerResult<Box<dyn ErasedValue>> {
    Ok(Box::new(V::unpack(cur)?))
}

type Reducer = Box<dyn Fn(&mut dyn ErasedValue, Box<dyn ErasedValue>) + Send + Sync>;

/// Per-input behavior, one tag per declared slot.
enum InputKind<K> {
    /// Ordinary push input carrying a value.
    Value,
    /// Pure control signal, no value.
    Signal,
    /// Unbounded-arity input folded by a reducer; 0 goal means per-key
    /// dynamic.
    Stream { reducer: Reducer, static_goal: AtomicUsize },
    /// Collects all same-key arrivals into an ordered view.
    Aggregate { static_goal: AtomicUsize },
    /// Fetched on demand from a user container.
    Pull { spec: Arc<PullSpec<K>> },
}

struct InputDecl<K> {
    name: &'static str,
    kind: InputKind<K>,
    access: Access,
    value_type: TypeId,
    type_name: &'static str,
    unpack: Option<UnpackFn>,
}

impl<K> InputDecl<K> {
    fn is_stream_like(&self) -> bool {
        matches!(
            self.kind,
            InputKind::Stream { .. } | InputKind::Aggregate { .. }
        )
    }
}

struct OutputDecl {
    name: &'static str,
    key_type_name: &'static str,
    value_type_name: &'static str,
    /// `Arc<OutTerminal<K2, V2>>` behind `Any`; recovered by typed sends.
    terminal: Arc<dyn Any + Send + Sync>,
}

enum TaskBody<K> {
    Host(Box<dyn Fn(&K, &mut TaskCtx<'_, K>) + Send + Sync>),
    Device(Box<dyn Fn(&K) -> Box<dyn DeviceTask<K>> + Send + Sync>),
}

// ============================================================================
// Template core
// ============================================================================

pub(crate) struct TtCore<K> {
    me: Weak<TtCore<K>>,
    world: Weak<WorldImpl>,
    id: u64,
    name: String,
    inputs: Vec<InputDecl<K>>,
    outputs: Vec<OutputDecl>,
    keymap: Keymap<K>,
    priomap: Priomap<K>,
    defer_writer: AtomicBool,
    lazy_pull: bool,
    num_pulls: usize,
    /// Single-input non-streaming templates never enter the table.
    bypass_table: bool,
    table: InstanceTable<K>,
    body: TaskBody<K>,
}

/// Deferred-release handle stored in a copy's `next_task`.
struct PendingRelease<K> {
    tt: Arc<TtCore<K>>,
    rec: Arc<TaskRecord<K>>,
}

impl<K: Key> DeferredTask for PendingRelease<K> {
    fn release_now(self: Arc<Self>) {
        self.tt.release_task(&self.rec, None);
    }

    fn replace_copy(&self, old: &Arc<DataCopy>, new: Arc<DataCopy>) {
        let mut inner = self.rec.inner.lock();
        for slot in &mut inner.slots {
            if let SlotState::Bound(c) = slot {
                if Arc::ptr_eq(c, old) {
                    *slot = SlotState::Bound(new);
                    return;
                }
            }
        }
        log::warn!("replace_copy: copy not found in deferred record");
    }
}

/// A record handed to the worker pool.
struct ReleasedTask<K> {
    tt: Arc<TtCore<K>>,
    rec: Arc<TaskRecord<K>>,
}

impl<K: Key> Runnable for ReleasedTask<K> {
    fn run(self: Box<Self>) {
        self.tt.execute_record(&self.rec);
    }
    fn priority(&self) -> i32 {
        self.rec.priority
    }
}

/// Consumer-side binding of an edge: one input slot of one template.
struct InBinding<K> {
    tt: Arc<TtCore<K>>,
    slot: usize,
}

impl<K: Key> InPort<K> for InBinding<K> {
    fn deposit(&self, key: &K, value: PortValue) {
        self.tt.set_arg_port(self.slot, key, value);
    }
    fn deposit_broadcast(&self, keys: &[K], value: PortValue) {
        self.tt.broadcast_port(self.slot, keys, value);
    }
}

impl<K: Key> TtCore<K> {
    fn arc(&self) -> Arc<TtCore<K>> {
        self.me.upgrade().expect("template task still alive")
    }

    fn world(&self) -> Option<Arc<WorldImpl>> {
        let world = self.world.upgrade();
        if world.is_none() {
            log::warn!("'{}': delivery into a torn-down world dropped", self.name);
        }
        world
    }

    fn decl(&self, slot: usize) -> &InputDecl<K> {
        &self.inputs[slot]
    }

    // ------------------------------------------------------------------
    // set_arg: routing + local deposit
    // ------------------------------------------------------------------

    /// Deliver `value` to input `slot` of instance `key`, routing to the
    /// keymap-chosen owner.
    pub(crate) fn set_arg_port(&self, slot: usize, key: &K, value: PortValue) {
        let Some(world) = self.world() else { return };
        let owner = (self.keymap)(key);
        if owner != world.rank() {
            self.send_remote_set_arg(&world, slot, std::slice::from_ref(key), value, owner);
            return;
        }
        let mut ring: Vec<Box<dyn Runnable>> = Vec::new();
        self.set_arg_local(&world, slot, key, value, &mut ring);
        world.scheduler.submit_batch(ring);
    }

    /// Owner-partitioned broadcast of one value to many keys.
    ///
    /// Local keys share a single copy and are released as one priority ring;
    /// each remote owner gets one message carrying its key sublist.
    pub(crate) fn broadcast_port(&self, slot: usize, keys: &[K], value: PortValue) {
        let Some(world) = self.world() else { return };
        let me = world.rank();

        let mut local_keys: Vec<&K> = Vec::new();
        let mut by_owner: HashMap<Rank, Vec<K>> = HashMap::new();
        for key in keys {
            let owner = (self.keymap)(key);
            if owner == me {
                local_keys.push(key);
            } else {
                by_owner.entry(owner).or_default().push(key.clone());
            }
        }

        match value {
            PortValue::Signal => {
                for (owner, klist) in by_owner {
                    self.send_remote_set_arg(&world, slot, &klist, PortValue::Signal, owner);
                }
                let mut ring: Vec<Box<dyn Runnable>> = Vec::new();
                for key in local_keys {
                    self.set_arg_local(&world, slot, key, PortValue::Signal, &mut ring);
                }
                world.scheduler.submit_batch(ring);
            }
            PortValue::Boxed(b) => {
                let copy = DataCopy::from_boxed(b);
                self.broadcast_copy(&world, slot, local_keys, by_owner, &copy);
                release_data_copy(&copy);
            }
            PortValue::Shared(copy) => {
                self.broadcast_copy(&world, slot, local_keys, by_owner, &copy);
            }
        }
    }

    fn broadcast_copy(
        &self,
        world: &Arc<WorldImpl>,
        slot: usize,
        local_keys: Vec<&K>,
        by_owner: HashMap<Rank, Vec<K>>,
        copy: &Arc<DataCopy>,
    ) {
        for (owner, klist) in by_owner {
            self.send_remote_set_arg(
                world,
                slot,
                &klist,
                PortValue::Shared(Arc::clone(copy)),
                owner,
            );
        }
        let mut ring: Vec<Box<dyn Runnable>> = Vec::new();
        for key in local_keys {
            self.set_arg_local(
                world,
                slot,
                key,
                PortValue::Shared(Arc::clone(copy)),
                &mut ring,
            );
        }
        world.scheduler.submit_batch(ring);
    }

    /// Local deposit. Find-or-create, slot mutation, last-arrival removal,
    /// and the copy registration all run under one bucket critical section.
    fn set_arg_local(
        &self,
        world: &Arc<WorldImpl>,
        slot: usize,
        key: &K,
        value: PortValue,
        ring: &mut Vec<Box<dyn Runnable>>,
    ) {
        assert_eq!(
            (self.keymap)(key),
            world.rank(),
            "'{}': set_arg for {:?} delivered to rank {} but keymap owns it elsewhere",
            self.name,
            key,
            world.rank()
        );

        let mut created = false;
        let release;

        let rec = if self.bypass_table {
            created = true;
            world.task_created();
            let rec = TaskRecord::new(
                key.clone(),
                self.inputs.len(),
                (self.priomap)(key),
                self.defer_writer.load(Ordering::Relaxed),
            );
            release = self.deposit(world, &rec, slot, value);
            rec
        } else {
            // Find-or-create, deposit, and the last-arrival removal all run
            // in one bucket critical section.
            let mut bucket = self.table.lock_bucket(key);
            let rec = match bucket.find(key) {
                Some(rec) => rec,
                None => {
                    created = true;
                    world.task_created();
                    let rec = TaskRecord::new(
                        key.clone(),
                        self.inputs.len(),
                        (self.priomap)(key),
                        self.defer_writer.load(Ordering::Relaxed),
                    );
                    bucket.insert(Arc::clone(&rec));
                    rec
                }
            };
            release = self.deposit(world, &rec, slot, value);
            // Last arrival: pop the record while holding the lock so no
            // further lookup can find a fired instance.
            if release && rec.deps_satisfied() + 1 == self.inputs.len() {
                bucket.remove(key);
            }
            drop(bucket);
            rec
        };

        if created && !self.lazy_pull && self.num_pulls > 0 {
            let mut inner = rec.inner.lock();
            if !inner.pulls_issued {
                inner.pulls_issued = true;
                drop(inner);
                self.issue_pulls(world, key);
            }
        }

        if release {
            self.release_task(&rec, Some(ring));
        }
    }

    /// Bind one arrival into the record. Returns whether the arrival
    /// satisfied its slot (streams satisfy only on reaching their goal).
    fn deposit(
        &self,
        world: &Arc<WorldImpl>,
        rec: &Arc<TaskRecord<K>>,
        slot: usize,
        value: PortValue,
    ) -> bool {
        let decl = self.decl(slot);
        match &decl.kind {
            InputKind::Signal => {
                let mut inner = rec.inner.lock();
                if !matches!(inner.slots[slot], SlotState::Empty) {
                    drop(inner);
                    self.fatal_double_set(slot, rec);
                }
                inner.slots[slot] = SlotState::Signaled;
                true
            }
            InputKind::Value | InputKind::Pull { .. } => {
                {
                    let inner = rec.inner.lock();
                    if !matches!(inner.slots[slot], SlotState::Empty) {
                        drop(inner);
                        self.fatal_double_set(slot, rec);
                    }
                }
                let (copy, defer_release) = self.bind_value(rec, slot, value);
                rec.inner.lock().slots[slot] = SlotState::Bound(copy);
                !defer_release
            }
            InputKind::Stream {
                reducer,
                static_goal,
            } => {
                let boxed = match value {
                    PortValue::Boxed(b) => b,
                    PortValue::Shared(c) => match c.value().try_duplicate() {
                        Some(b) => b,
                        None => self.fatal_not_copyable(slot),
                    },
                    PortValue::Signal => {
                        panic!("'{}': signal delivered to streaming slot {}", self.name, slot)
                    }
                };
                let mut inner = rec.inner.lock();
                if matches!(inner.slots[slot], SlotState::Empty) {
                    let goal = match static_goal.load(Ordering::Acquire) {
                        0 => None,
                        n => Some(n),
                    };
                    inner.slots[slot] = SlotState::Stream {
                        copy: None,
                        seen: 0,
                        goal,
                    };
                }
                let SlotState::Stream { copy, seen, goal } = &mut inner.slots[slot] else {
                    unreachable!("stream slot holds stream state");
                };
                if goal.is_none() {
                    // Pick up a template-wide goal set after this record was
                    // created by an early arrival.
                    match static_goal.load(Ordering::Acquire) {
                        0 => {}
                        n => *goal = Some(n),
                    }
                }
                match copy {
                    None => *copy = Some(DataCopy::from_boxed(boxed)),
                    Some(acc) => reducer(acc.value_mut(), boxed),
                }
                *seen += 1;
                match *goal {
                    Some(g) if *seen > g => {
                        let seen = *seen;
                        drop(inner);
                        self.fatal_stream_overflow(slot, seen, g);
                    }
                    Some(g) => *seen == g,
                    None => false,
                }
            }
            InputKind::Aggregate { static_goal } => {
                let copy = match value {
                    PortValue::Boxed(b) => DataCopy::from_boxed(b),
                    PortValue::Shared(c) => {
                        let task: Arc<dyn DeferredTask> = Arc::new(PendingRelease {
                            tt: self.arc(),
                            rec: Arc::clone(rec),
                        });
                        match register_data_copy(&c, &task, true, false) {
                            Ok(r) => r.copy,
                            Err(_) => self.fatal_not_copyable(slot),
                        }
                    }
                    PortValue::Signal => {
                        panic!("'{}': signal delivered to aggregate slot {}", self.name, slot)
                    }
                };
                let mut inner = rec.inner.lock();
                if matches!(inner.slots[slot], SlotState::Empty) {
                    let goal = match static_goal.load(Ordering::Acquire) {
                        0 => None,
                        n => Some(n),
                    };
                    inner.slots[slot] = SlotState::Aggregate {
                        copies: Vec::new(),
                        seen: 0,
                        goal,
                    };
                }
                let SlotState::Aggregate { copies, seen, goal } = &mut inner.slots[slot] else {
                    unreachable!("aggregate slot holds aggregate state");
                };
                if goal.is_none() {
                    match static_goal.load(Ordering::Acquire) {
                        0 => {}
                        n => *goal = Some(n),
                    }
                }
                copies.push(copy);
                *seen += 1;
                match *goal {
                    Some(g) if *seen > g => {
                        let seen = *seen;
                        drop(inner);
                        self.fatal_stream_overflow(slot, seen, g);
                    }
                    Some(g) => *seen == g,
                    None => false,
                }
            }
        }
    }

    /// Turn an arriving value into the copy bound to the slot, applying the
    /// sharing policy for forwarded copies.
    fn bind_value(
        &self,
        rec: &Arc<TaskRecord<K>>,
        slot: usize,
        value: PortValue,
    ) -> (Arc<DataCopy>, bool) {
        let decl = self.decl(slot);
        match value {
            PortValue::Boxed(b) => (DataCopy::from_boxed(b), false),
            PortValue::Shared(c) => {
                let task: Arc<dyn DeferredTask> = Arc::new(PendingRelease {
                    tt: self.arc(),
                    rec: Arc::clone(rec),
                });
                let readonly = decl.access == Access::Read;
                match register_data_copy(&c, &task, readonly, rec.defer_writer) {
                    Ok(r) => (r.copy, r.defer_release),
                    Err(_) => self.fatal_not_copyable(slot),
                }
            }
            PortValue::Signal => {
                panic!("'{}': signal delivered to value slot {}", self.name, slot)
            }
        }
    }

    // ------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------

    /// Count one satisfied dependency; fire the record when all inputs are
    /// in. Must not be called with a bucket lock held.
    pub(crate) fn release_task(
        &self,
        rec: &Arc<TaskRecord<K>>,
        ring: Option<&mut Vec<Box<dyn Runnable>>>,
    ) {
        let count = rec.satisfy_one();
        if count == self.inputs.len() {
            if !rec.mark_released() {
                return;
            }
            if rec.inner.lock().in_table {
                let mut bucket = self.table.lock_bucket(&rec.key);
                bucket.remove(&rec.key);
            }
            let run = Box::new(ReleasedTask {
                tt: self.arc(),
                rec: Arc::clone(rec),
            });
            match ring {
                Some(ring) => ring.push(run),
                None => {
                    if let Some(world) = self.world() {
                        world.scheduler.submit(run);
                    }
                }
            }
        } else if self.lazy_pull
            && self.num_pulls > 0
            && count + self.num_pulls == self.inputs.len()
        {
            let issue = {
                let mut inner = rec.inner.lock();
                if inner.pulls_issued {
                    false
                } else {
                    inner.pulls_issued = true;
                    true
                }
            };
            if issue {
                if let Some(world) = self.world() {
                    self.issue_pulls(&world, &rec.key);
                }
            }
        }
    }

    fn issue_pulls(&self, world: &Arc<WorldImpl>, key: &K) {
        for (slot, decl) in self.inputs.iter().enumerate() {
            let InputKind::Pull { spec } = &decl.kind else {
                continue;
            };
            let owner = (spec.owner)(key);
            if owner == world.rank() {
                let value = (spec.fetch)(key);
                self.set_arg_port(slot, key, PortValue::Boxed(value));
            } else {
                let header = self.header(world, FnId::GetFromPull, slot, 0, 1);
                let key_bytes = match pack_to_vec(key) {
                    Ok(b) => b,
                    Err(e) => panic!("'{}': key serialization failed: {}", self.name, e),
                };
                match envelope::assemble(header, &[], &[key_bytes]) {
                    Ok(bytes) => world.send_am(owner, bytes),
                    Err(e) => self.fatal_overrun(e),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    fn execute_record(&self, rec: &Arc<TaskRecord<K>>) {
        let Some(world) = self.world() else { return };
        match &self.body {
            TaskBody::Host(f) => {
                for copy in rec.bound_copies() {
                    world.registry.insert(&copy);
                }
                {
                    let mut ctx = TaskCtx::new(self, rec, &world);
                    f(&rec.key, &mut ctx);
                }
                self.complete_record(rec, &world);
            }
            TaskBody::Device(factory) => {
                self.step_device(rec, &world, factory.as_ref());
            }
        }
    }

    /// Advance the device state machine by one resume.
    fn step_device(
        &self,
        rec: &Arc<TaskRecord<K>>,
        world: &Arc<WorldImpl>,
        factory: &(dyn Fn(&K) -> Box<dyn DeviceTask<K>> + Send + Sync),
    ) {
        let mut run = {
            let mut inner = rec.inner.lock();
            match inner.device.take() {
                Some(run) => run,
                None => DeviceRun {
                    task: factory(&rec.key),
                    phase: DevicePhase::Start,
                    views: Vec::new(),
                },
            }
        };

        match run.phase {
            DevicePhase::Start => {
                for copy in rec.bound_copies() {
                    world.registry.insert(&copy);
                }
                let views = {
                    let mut ctx = TaskCtx::new(self, rec, world);
                    run.task.start(&mut ctx)
                };
                let staged: Vec<ViewDecl> =
                    views.iter().map(|v| ViewDecl { span: v.span }).collect();
                run.views = views;
                run.phase = DevicePhase::WaitTransfer;
                rec.inner.lock().device = Some(run);
                let resume = self.resume_handle(rec, world);
                world.driver.stage_in(&staged, Box::new(resume));
            }
            DevicePhase::WaitTransfer => {
                let kernel = {
                    let mut ctx = TaskCtx::new(self, rec, world);
                    run.task.on_transfers_done(&mut ctx)
                };
                run.phase = DevicePhase::WaitKernel;
                rec.inner.lock().device = Some(run);
                let resume = self.resume_handle(rec, world);
                let name = self.name.clone();
                world.driver.launch(
                    kernel,
                    Box::new(move |result| {
                        if let Err(e) = result {
                            // Kernel failure is fatal; no partial sends reach
                            // downstream tasks.
                            panic!("'{}': kernel submission failed: {}", name, e);
                        }
                        resume();
                    }),
                );
            }
            DevicePhase::WaitKernel => {
                run.phase = DevicePhase::WaitSends;
                {
                    let mut ctx = TaskCtx::new(self, rec, world);
                    run.task.on_kernel_done(&mut ctx);
                }
                run.phase = DevicePhase::Done;
                drop(run);
                self.complete_record(rec, world);
            }
            DevicePhase::WaitSends | DevicePhase::Done => {
                log::error!("'{}': device task resumed past completion", self.name);
            }
        }
    }

    /// Closure that re-enters the scheduler for the next device phase.
    fn resume_handle(
        &self,
        rec: &Arc<TaskRecord<K>>,
        world: &Arc<WorldImpl>,
    ) -> impl FnOnce() + Send + 'static {
        let tt = self.arc();
        let rec = Arc::clone(rec);
        let world = Arc::clone(world);
        move || {
            world.scheduler.submit(Box::new(ReleasedTask { tt, rec }));
        }
    }

    fn complete_record(&self, rec: &Arc<TaskRecord<K>>, world: &Arc<WorldImpl>) {
        for copy in rec.bound_copies() {
            world.registry.remove(&copy);
            release_data_copy(&copy);
        }
        rec.inner.lock().slots.clear();
        world.task_completed();
    }

    // ------------------------------------------------------------------
    // Streaming control
    // ------------------------------------------------------------------

    fn require_stream(&self, slot: usize) {
        assert!(
            matches!(self.decl(slot).kind, InputKind::Stream { .. })
                || matches!(self.decl(slot).kind, InputKind::Aggregate { .. }),
            "'{}': slot {} is not a streaming input",
            self.name,
            slot
        );
    }

    /// Record `n` as the per-key goal; releases the instance if already
    /// reached.
    pub(crate) fn set_stream_goal(&self, slot: usize, key: &K, n: usize) {
        self.require_stream(slot);
        assert!(n > 0, "'{}': stream goal must be positive", self.name);
        let Some(world) = self.world() else { return };
        let owner = (self.keymap)(key);
        if owner != world.rank() {
            let header = self.header(&world, FnId::SetArgstreamSize, slot, 0, 1);
            let body = (n as u64).to_le_bytes().to_vec();
            let key_bytes = pack_to_vec(key).expect("key serialization");
            match envelope::assemble(header, &body, &[key_bytes]) {
                Ok(bytes) => world.send_am(owner, bytes),
                Err(e) => self.fatal_overrun(e),
            }
            return;
        }

        let release = {
            let mut bucket = self.table.lock_bucket(key);
            let rec = match bucket.find(key) {
                Some(rec) => rec,
                None => {
                    world.task_created();
                    let rec = TaskRecord::new(
                        key.clone(),
                        self.inputs.len(),
                        (self.priomap)(key),
                        self.defer_writer.load(Ordering::Relaxed),
                    );
                    bucket.insert(Arc::clone(&rec));
                    rec
                }
            };
            let mut inner = rec.inner.lock();
            self.ensure_stream_slot(&mut inner, slot);
            let (seen, reached) = match &mut inner.slots[slot] {
                SlotState::Stream { seen, goal, .. } => {
                    *goal = Some(n);
                    (*seen, *seen == n)
                }
                SlotState::Aggregate { seen, goal, .. } => {
                    *goal = Some(n);
                    (*seen, *seen == n)
                }
                _ => unreachable!("stream slot holds stream state"),
            };
            drop(inner);
            if seen > n {
                self.fatal_stream_overflow(slot, seen, n);
            }
            reached.then_some(rec)
        };
        if let Some(rec) = release {
            self.release_task(&rec, None);
        }
    }

    /// Terminate a dynamic stream early, firing the instance with whatever
    /// accumulated.
    pub(crate) fn finalize_stream(&self, slot: usize, key: &K) {
        self.require_stream(slot);
        let Some(world) = self.world() else { return };
        let owner = (self.keymap)(key);
        if owner != world.rank() {
            let header = self.header(&world, FnId::FinalizeArgstreamSize, slot, 0, 1);
            let key_bytes = pack_to_vec(key).expect("key serialization");
            match envelope::assemble(header, &[], &[key_bytes]) {
                Ok(bytes) => world.send_am(owner, bytes),
                Err(e) => self.fatal_overrun(e),
            }
            return;
        }

        let rec = {
            let bucket = self.table.lock_bucket(key);
            match bucket.find(key) {
                Some(rec) => rec,
                None => panic!(
                    "'{}': finalize called on stream that never received an input for {:?}",
                    self.name, key
                ),
            }
        };
        {
            let mut inner = rec.inner.lock();
            self.ensure_stream_slot(&mut inner, slot);
            match &mut inner.slots[slot] {
                SlotState::Stream { seen, goal, .. }
                | SlotState::Aggregate { seen, goal, .. } => {
                    *goal = Some(*seen);
                }
                _ => unreachable!("stream slot holds stream state"),
            }
        }
        self.release_task(&rec, None);
    }

    /// Template-wide default goal; must precede the first arrival.
    pub(crate) fn set_static_stream_goal(&self, slot: usize, n: usize) {
        self.require_stream(slot);
        match &self.decl(slot).kind {
            InputKind::Stream { static_goal, .. } | InputKind::Aggregate { static_goal } => {
                static_goal.store(n, Ordering::Release);
            }
            _ => unreachable!(),
        }
    }

    fn ensure_stream_slot(&self, inner: &mut RecordInner<K>, slot: usize) {
        if matches!(inner.slots[slot], SlotState::Empty) {
            let static_goal = match &self.decl(slot).kind {
                InputKind::Stream { static_goal, .. } | InputKind::Aggregate { static_goal } => {
                    static_goal.load(Ordering::Acquire)
                }
                _ => 0,
            };
            let goal = if static_goal == 0 {
                None
            } else {
                Some(static_goal)
            };
            inner.slots[slot] = match self.decl(slot).kind {
                InputKind::Aggregate { .. } => SlotState::Aggregate {
                    copies: Vec::new(),
                    seen: 0,
                    goal,
                },
                _ => SlotState::Stream {
                    copy: None,
                    seen: 0,
                    goal,
                },
            };
        }
    }

    // ------------------------------------------------------------------
    // Remote messaging
    // ------------------------------------------------------------------

    fn header(
        &self,
        world: &Arc<WorldImpl>,
        fn_id: FnId,
        slot: usize,
        num_iovecs: usize,
        num_keys: usize,
    ) -> MsgHeader {
        MsgHeader {
            taskpool_id: world.taskpool_id(),
            template_id: self.id,
            key_offset: 0, // patched by assemble
            fn_id,
            num_iovecs: num_iovecs as i8,
            input_slot: slot as i32,
            num_keys: num_keys as i32,
            sender_rank: world.rank() as i32,
        }
    }

    fn send_remote_set_arg(
        &self,
        world: &Arc<WorldImpl>,
        slot: usize,
        keys: &[K],
        value: PortValue,
        owner: Rank,
    ) {
        let key_bytes: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| pack_to_vec(k).expect("key serialization"))
            .collect();

        let (copy, owned) = match value {
            PortValue::Signal => {
                let header = self.header(world, FnId::SetArg, slot, 0, keys.len());
                match envelope::assemble(header, &[], &key_bytes) {
                    Ok(bytes) => world.send_am(owner, bytes),
                    Err(e) => self.fatal_overrun(e),
                }
                return;
            }
            PortValue::Shared(c) => (c, false),
            PortValue::Boxed(b) => (DataCopy::from_boxed(b), true),
        };

        let metadata = {
            let value = copy.value();
            let mut buf = vec![0u8; value.payload_size()];
            let mut cur = crate::core::ser::CursorMut::new(&mut buf);
            value
                .pack(&mut cur)
                .unwrap_or_else(|e| panic!("'{}': value pack failed: {}", self.name, e));
            buf
        };

        // Span enumeration needs the mutable view but does not mutate; the
        // bulk protocol owns the spans from here until the release token
        // comes back.
        let (copy, owned) = if copy.is_mutable() {
            // Writer-owned copies cannot be pinned; ship a duplicate.
            match copy.value().try_duplicate() {
                Some(dup) => (DataCopy::from_boxed(dup), true),
                None => self.fatal_not_copyable(slot),
            }
        } else {
            (copy, owned)
        };
        let spans = copy.value_mut().iovecs();
        let mut body = metadata;
        if !spans.is_empty() {
            // Keep the source alive until the receiver has pulled every
            // span: one reader share per destination message.
            if !copy.acquire_reader() {
                self.fatal_not_copyable(slot);
            }
            let token = world.pin_for_transfer(Arc::clone(&copy));
            for span in &spans {
                let handle = world.engine.expose(*span);
                let iov = IovecRef {
                    reg_size: span.len as u64,
                    handle,
                    release_token: token,
                };
                let mut buf = vec![0u8; IovecRef::WIRE_LEN];
                let mut cur = crate::core::ser::CursorMut::new(&mut buf);
                iov.encode(&mut cur).expect("iovec ref encoding");
                body.extend_from_slice(&buf);
            }
        }

        let header = self.header(world, FnId::SetArg, slot, spans.len(), keys.len());
        match envelope::assemble(header, &body, &key_bytes) {
            Ok(bytes) => world.send_am(owner, bytes),
            Err(e) => self.fatal_overrun(e),
        }

        if owned {
            release_data_copy(&copy);
        }
    }

    fn set_arg_from_msg(&self, world: &Arc<WorldImpl>, hdr: &MsgHeader, payload: &[u8]) {
        let slot = hdr.input_slot as usize;
        let decl = self.decl(slot);

        let keys: Vec<K> = {
            let mut cur = Cursor::new(payload);
            cur.seek(hdr.key_offset as usize)
                .expect("key offset within payload");
            (0..hdr.num_keys)
                .map(|_| K::unpack(&mut cur).expect("key decoding"))
                .collect()
        };

        let mut ring: Vec<Box<dyn Runnable>> = Vec::new();
        if matches!(decl.kind, InputKind::Signal) {
            for key in &keys {
                self.set_arg_local(world, slot, key, PortValue::Signal, &mut ring);
            }
            world.scheduler.submit_batch(ring);
            return;
        }

        let unpack = decl
            .unpack
            .expect("value-carrying input has an unpack hook");
        let mut cur = Cursor::new(payload);
        let mut value = unpack(&mut cur).expect("value metadata decoding");

        if hdr.num_iovecs > 0 {
            let refs: Vec<IovecRef> = (0..hdr.num_iovecs)
                .map(|_| IovecRef::decode(&mut cur).expect("iovec ref decoding"))
                .collect();
            let spans = value.iovecs();
            assert_eq!(
                spans.len(),
                refs.len(),
                "'{}': iovec count mismatch between sender and receiver",
                self.name
            );
            let sender = hdr.sender_rank as Rank;
            for (span, iov) in spans.iter().zip(&refs) {
                assert_eq!(span.len as u64, iov.reg_size, "iovec length mismatch");
                world.engine.get(sender, iov.handle, *span);
            }
            world.notify_release(sender, refs[0].release_token);
        }

        if keys.len() == 1 {
            self.set_arg_local(world, slot, &keys[0], PortValue::Boxed(value), &mut ring);
        } else {
            let copy = DataCopy::from_boxed(value);
            for key in &keys {
                self.set_arg_local(
                    world,
                    slot,
                    key,
                    PortValue::Shared(Arc::clone(&copy)),
                    &mut ring,
                );
            }
            release_data_copy(&copy);
        }
        world.scheduler.submit_batch(ring);
    }

    // ------------------------------------------------------------------
    // Fatal programming errors
    // ------------------------------------------------------------------

    fn fatal_double_set(&self, slot: usize, rec: &TaskRecord<K>) -> ! {
        panic!(
            "'{}': input '{}' ({}) for key {:?} is already set",
            self.name,
            self.decl(slot).name,
            slot,
            rec.key
        );
    }

    fn fatal_stream_overflow(&self, slot: usize, seen: usize, goal: usize) -> ! {
        panic!(
            "'{}': streaming input {} exceeded its goal ({} > {})",
            self.name, slot, seen, goal
        );
    }

    fn fatal_not_copyable(&self, slot: usize) -> ! {
        panic!(
            "'{}': value for input {} must be duplicated but {} is move-only",
            self.name,
            slot,
            self.decl(slot).type_name
        );
    }

    fn fatal_overrun(&self, e: crate::core::ser::SerError) -> ! {
        panic!("'{}': {}", self.name, e);
    }
}

impl<K: Key> TemplateHandle for TtCore<K> {
    fn template_id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn handle_message(&self, _from: Rank, hdr: &MsgHeader, payload: &[u8]) {
        let Some(world) = self.world() else { return };
        match hdr.fn_id {
            FnId::SetArg => self.set_arg_from_msg(&world, hdr, payload),
            FnId::SetArgstreamSize => {
                let goal = u64::from_le_bytes(
                    payload[..8].try_into().expect("stream-size payload"),
                ) as usize;
                let mut cur = Cursor::new(payload);
                cur.seek(hdr.key_offset as usize).expect("key offset");
                let key = K::unpack(&mut cur).expect("key decoding");
                self.set_stream_goal(hdr.input_slot as usize, &key, goal);
            }
            FnId::FinalizeArgstreamSize => {
                let mut cur = Cursor::new(payload);
                cur.seek(hdr.key_offset as usize).expect("key offset");
                let key = K::unpack(&mut cur).expect("key decoding");
                self.finalize_stream(hdr.input_slot as usize, &key);
            }
            FnId::GetFromPull => {
                let mut cur = Cursor::new(payload);
                cur.seek(hdr.key_offset as usize).expect("key offset");
                let key = K::unpack(&mut cur).expect("key decoding");
                let slot = hdr.input_slot as usize;
                let InputKind::Pull { spec } = &self.decl(slot).kind else {
                    log::error!("'{}': pull request for non-pull slot {}", self.name, slot);
                    return;
                };
                let value = (spec.fetch)(&key);
                // Routes back to the instance owner through the keymap.
                self.set_arg_port(slot, &key, PortValue::Boxed(value));
            }
        }
    }
}

// ============================================================================
// Task context (the body's window into the runtime)
// ============================================================================

enum CtxSlot {
    None,
    One(Arc<DataCopy>),
    Many(Vec<Arc<DataCopy>>),
}

/// Execution context handed to a task body: typed access to the gathered
/// inputs and to the declared output terminals.
pub struct TaskCtx<'a, K> {
    tt: &'a TtCore<K>,
    rec: &'a Arc<TaskRecord<K>>,
    world: Arc<WorldImpl>,
    slots: Vec<CtxSlot>,
}

impl<'a, K: Key> TaskCtx<'a, K> {
    fn new(tt: &'a TtCore<K>, rec: &'a Arc<TaskRecord<K>>, world: &Arc<WorldImpl>) -> Self {
        let slots = {
            let inner = rec.inner.lock();
            inner
                .slots
                .iter()
                .map(|s| match s {
                    SlotState::Bound(c) => CtxSlot::One(Arc::clone(c)),
                    SlotState::Stream { copy: Some(c), .. } => CtxSlot::One(Arc::clone(c)),
                    SlotState::Aggregate { copies, .. } => CtxSlot::Many(copies.clone()),
                    _ => CtxSlot::None,
                })
                .collect()
        };
        Self {
            tt,
            rec,
            world: Arc::clone(world),
            slots,
        }
    }

    pub fn key(&self) -> &K {
        &self.rec.key
    }

    pub fn rank(&self) -> Rank {
        self.world.rank()
    }

    fn checked_copy<V: Codec>(&self, slot: usize) -> &Arc<DataCopy> {
        let decl = self.tt.decl(slot);
        assert_eq!(
            decl.value_type,
            TypeId::of::<V>(),
            "'{}': input {} holds {}, not {}",
            self.tt.name,
            slot,
            decl.type_name,
            std::any::type_name::<V>()
        );
        match &self.slots[slot] {
            CtxSlot::One(c) => c,
            _ => panic!("'{}': input {} carries no single value", self.tt.name, slot),
        }
    }

    /// Read access to input `slot`.
    pub fn input<V: Codec>(&self, slot: usize) -> &V {
        self.checked_copy::<V>(slot)
            .get_ref::<V>()
            .expect("slot value downcast")
    }

    /// Mutable access to a read-write input.
    ///
    /// Panics if the slot was declared `Access::Read` or the copy is still
    /// shared (which would mean the sharing policy was violated).
    pub fn input_mut<V: Codec>(&mut self, slot: usize) -> &mut V {
        assert_eq!(
            self.tt.decl(slot).access,
            Access::ReadWrite,
            "'{}': input {} was declared read-only",
            self.tt.name,
            slot
        );
        let copy = self.checked_copy::<V>(slot);
        assert!(
            copy.is_mutable() || copy.num_readers() == 1,
            "'{}': input {} is still shared",
            self.tt.name,
            slot
        );
        copy.value_mut()
            .as_any_mut()
            .downcast_mut::<V>()
            .expect("slot value downcast")
    }

    /// View over an aggregate input.
    pub fn aggregate<V: Codec>(&self, slot: usize) -> Aggregate<'_, V> {
        let decl = self.tt.decl(slot);
        assert_eq!(
            decl.value_type,
            TypeId::of::<V>(),
            "'{}': aggregate {} holds {}, not {}",
            self.tt.name,
            slot,
            decl.type_name,
            std::any::type_name::<V>()
        );
        match &self.slots[slot] {
            CtxSlot::Many(copies) => Aggregate::new(copies),
            _ => panic!("'{}': input {} is not an aggregate", self.tt.name, slot),
        }
    }

    fn terminal<K2: Key, V2: Codec>(&self, out: usize) -> Arc<OutTerminal<K2, V2>> {
        let decl = self
            .tt
            .outputs
            .get(out)
            .unwrap_or_else(|| panic!("'{}': unknown output slot {}", self.tt.name, out));
        match Arc::downcast::<OutTerminal<K2, V2>>(Arc::clone(&decl.terminal)) {
            Ok(t) => t,
            Err(_) => panic!(
                "'{}': output '{}' carries ({}, {}), not ({}, {})",
                self.tt.name,
                decl.name,
                decl.key_type_name,
                decl.value_type_name,
                std::any::type_name::<K2>(),
                std::any::type_name::<V2>()
            ),
        }
    }

    /// Send `value` to instance `key` downstream of output `out`.
    pub fn send<K2: Key, V2: Codec>(&self, out: usize, key: &K2, value: V2) {
        self.terminal::<K2, V2>(out).send(key, value);
    }

    /// Forward a value received as an input: the pointer registry rediscovers
    /// the inbound copy so the outbound path reuses it instead of
    /// reallocating. Falls back to duplication for foreign references.
    pub fn forward<K2: Key, V2: Codec>(&self, out: usize, key: &K2, value: &V2) {
        let terminal = self.terminal::<K2, V2>(out);
        match self.world.registry.lookup(value as *const V2 as usize) {
            Some(copy) => terminal.send_shared(key, &copy),
            None => match value.try_duplicate() {
                Some(dup) => terminal.send(key, dup),
                None => panic!(
                    "'{}': forwarding a foreign {} requires duplication but it is move-only",
                    self.tt.name,
                    std::any::type_name::<V2>()
                ),
            },
        }
    }

    /// Deliver one value to every key in `keys`, sharing a single copy
    /// locally and one message per remote owner.
    pub fn broadcast<K2: Key, V2: Codec>(&self, out: usize, keys: &[K2], value: V2) {
        self.terminal::<K2, V2>(out).broadcast(keys, value);
    }

    /// Broadcast a received input by registry rediscovery.
    pub fn broadcast_forward<K2: Key, V2: Codec>(&self, out: usize, keys: &[K2], value: &V2) {
        let terminal = self.terminal::<K2, V2>(out);
        match self.world.registry.lookup(value as *const V2 as usize) {
            Some(copy) => terminal.broadcast_shared(keys, &copy),
            None => match value.try_duplicate() {
                Some(dup) => terminal.broadcast(keys, dup),
                None => panic!(
                    "'{}': broadcasting a foreign {} requires duplication but it is move-only",
                    self.tt.name,
                    std::any::type_name::<V2>()
                ),
            },
        }
    }

    /// Fire the control signal for `key` on output `out`.
    pub fn signal<K2: Key>(&self, out: usize, key: &K2) {
        self.terminal::<K2, ()>(out).signal(key);
    }

    pub fn signal_broadcast<K2: Key>(&self, out: usize, keys: &[K2]) {
        self.terminal::<K2, ()>(out).signal_broadcast(keys);
    }
}

// ============================================================================
// Builder and public handle
// ============================================================================

type ConnectFn<K> = Box<dyn FnOnce(&Arc<TtCore<K>>)>;

/// Fluent builder for a [`TemplateTask`].
pub struct TtBuilder<K> {
    world: Arc<WorldImpl>,
    name: String,
    inputs: Vec<InputDecl<K>>,
    outputs: Vec<OutputDecl>,
    keymap: Option<Keymap<K>>,
    priomap: Option<Priomap<K>>,
    defer_writer: bool,
    lazy_pull: bool,
    connects: Vec<ConnectFn<K>>,
    problems: Vec<String>,
}

impl<K: Key> TtBuilder<K> {
    pub fn new(world: &World, name: &str) -> Self {
        Self {
            world: Arc::clone(&world.inner),
            name: name.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            keymap: None,
            priomap: None,
            defer_writer: false,
            lazy_pull: false,
            connects: Vec::new(),
            problems: Vec::new(),
        }
    }

    /// Declare a value input wired to `edge`. Pull edges make this a
    /// pull-mode slot.
    pub fn input<V: Codec>(mut self, name: &'static str, edge: &Edge<K, V>, access: Access) -> Self {
        let slot = self.inputs.len();
        let kind = match edge.pull_spec() {
            Some(spec) => {
                if access == Access::ReadWrite {
                    self.problems
                        .push(format!("pull input '{name}' cannot be read-write"));
                }
                InputKind::Pull { spec }
            }
            None => InputKind::Value,
        };
        let is_pull = matches!(kind, InputKind::Pull { .. });
        self.inputs.push(InputDecl {
            name,
            kind,
            access,
            value_type: TypeId::of::<V>(),
            type_name: std::any::type_name::<V>(),
            unpack: Some(unpack_erased::<V>),
        });
        if !is_pull {
            let edge = edge.clone();
            self.connects.push(Box::new(move |tt| {
                edge.register_in(Arc::new(InBinding {
                    tt: Arc::clone(tt),
                    slot,
                }));
            }));
        }
        self
    }

    /// Declare a pure control-signal input.
    pub fn input_signal(mut self, name: &'static str, edge: &Edge<K, ()>) -> Self {
        let slot = self.inputs.len();
        if edge.is_pull() {
            self.problems
                .push(format!("signal input '{name}' cannot be pull-mode"));
        }
        self.inputs.push(InputDecl {
            name,
            kind: InputKind::Signal,
            access: Access::Read,
            value_type: TypeId::of::<()>(),
            type_name: "()",
            unpack: None,
        });
        let edge = edge.clone();
        self.connects.push(Box::new(move |tt| {
            edge.register_in(Arc::new(InBinding {
                tt: Arc::clone(tt),
                slot,
            }));
        }));
        self
    }

    /// Declare a streaming input folded by `reducer`.
    pub fn input_stream<V: Codec>(
        mut self,
        name: &'static str,
        edge: &Edge<K, V>,
        reducer: impl Fn(&mut V, V) + Send + Sync + 'static,
    ) -> Self {
        let slot = self.inputs.len();
        if edge.is_pull() {
            // No defined policy for a slot that both streams and pulls.
            self.problems
                .push(format!("streaming input '{name}' cannot be pull-mode"));
        }
        let erased: Reducer = Box::new(move |acc, val| {
            let acc = acc
                .as_any_mut()
                .downcast_mut::<V>()
                .expect("stream accumulator type");
            let val = *val
                .into_any()
                .downcast::<V>()
                .expect("stream value type");
            reducer(acc, val);
        });
        self.inputs.push(InputDecl {
            name,
            kind: InputKind::Stream {
                reducer: erased,
                static_goal: AtomicUsize::new(0),
            },
            access: Access::Read,
            value_type: TypeId::of::<V>(),
            type_name: std::any::type_name::<V>(),
            unpack: Some(unpack_erased::<V>),
        });
        let edge = edge.clone();
        self.connects.push(Box::new(move |tt| {
            edge.register_in(Arc::new(InBinding {
                tt: Arc::clone(tt),
                slot,
            }));
        }));
        self
    }

    /// Declare an aggregate input collecting all same-key arrivals.
    pub fn input_aggregate<V: Codec>(mut self, name: &'static str, edge: &Edge<K, V>) -> Self {
        let slot = self.inputs.len();
        if edge.is_pull() {
            self.problems
                .push(format!("aggregate input '{name}' cannot be pull-mode"));
        }
        self.inputs.push(InputDecl {
            name,
            kind: InputKind::Aggregate {
                static_goal: AtomicUsize::new(0),
            },
            access: Access::Read,
            value_type: TypeId::of::<V>(),
            type_name: std::any::type_name::<V>(),
            unpack: Some(unpack_erased::<V>),
        });
        let edge = edge.clone();
        self.connects.push(Box::new(move |tt| {
            edge.register_in(Arc::new(InBinding {
                tt: Arc::clone(tt),
                slot,
            }));
        }));
        self
    }

    /// Declare an output terminal feeding `edge`.
    pub fn output<K2: Key, V2: Codec>(mut self, name: &'static str, edge: &Edge<K2, V2>) -> Self {
        let terminal = OutTerminal::<K2, V2>::new(name);
        edge.register_out(&terminal);
        self.outputs.push(OutputDecl {
            name,
            key_type_name: std::any::type_name::<K2>(),
            value_type_name: std::any::type_name::<V2>(),
            terminal,
        });
        self
    }

    pub fn keymap(mut self, f: impl Fn(&K) -> Rank + Send + Sync + 'static) -> Self {
        self.keymap = Some(Box::new(f));
        self
    }

    pub fn priomap(mut self, f: impl Fn(&K) -> i32 + Send + Sync + 'static) -> Self {
        self.priomap = Some(Box::new(f));
        self
    }

    /// Writers on this template wait for readers instead of duplicating.
    pub fn defer_writer(mut self, v: bool) -> Self {
        self.defer_writer = v;
        self
    }

    /// Issue pull requests only once all push inputs arrived.
    pub fn lazy_pull(mut self, v: bool) -> Self {
        self.lazy_pull = v;
        self
    }

    /// Finish with a host body.
    pub fn build(
        self,
        body: impl Fn(&K, &mut TaskCtx<'_, K>) + Send + Sync + 'static,
    ) -> Result<TemplateTask<K>> {
        self.finish(TaskBody::Host(Box::new(body)))
    }

    /// Finish with a device-task factory; each firing produces one state
    /// machine instance.
    pub fn build_device(
        self,
        factory: impl Fn(&K) -> Box<dyn DeviceTask<K>> + Send + Sync + 'static,
    ) -> Result<TemplateTask<K>> {
        self.finish(TaskBody::Device(Box::new(factory)))
    }

    fn finish(mut self, body: TaskBody<K>) -> Result<TemplateTask<K>> {
        if !self.problems.is_empty() {
            return Err(Error::InvalidTemplate(self.problems.join("; ")));
        }
        let world = self.world;
        let size = world.size();
        let keymap = self.keymap.unwrap_or_else(|| {
            Box::new(move |key: &K| {
                (crate::core::table::key_hash(key) % u64::from(size)) as Rank
            })
        });
        let priomap = self.priomap.unwrap_or_else(|| Box::new(|_| 0));
        let num_pulls = self
            .inputs
            .iter()
            .filter(|d| matches!(d.kind, InputKind::Pull { .. }))
            .count();
        let bypass_table = self.inputs.len() == 1 && !self.inputs[0].is_stream_like();
        let id = world.allocate_template_id();

        let core = Arc::new_cyclic(|me| TtCore {
            me: me.clone(),
            world: Arc::downgrade(&world),
            id,
            name: self.name,
            inputs: self.inputs,
            outputs: self.outputs,
            keymap,
            priomap,
            defer_writer: AtomicBool::new(self.defer_writer),
            lazy_pull: self.lazy_pull,
            num_pulls,
            bypass_table,
            table: InstanceTable::new(),
            body,
        });
        for connect in self.connects.drain(..) {
            connect(&core);
        }
        world.install_template(Arc::clone(&core) as Arc<dyn TemplateHandle>);
        Ok(TemplateTask { core })
    }
}

/// The graph node: spawns one task instance per key once its inputs are
/// gathered. Cheap to clone.
pub struct TemplateTask<K> {
    core: Arc<TtCore<K>>,
}

impl<K> Clone for TemplateTask<K> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<K: Key> TemplateTask<K> {
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Seed input `slot` of instance `key` from user code; routed through
    /// the keymap like any other delivery.
    pub fn set_input<V: Codec>(&self, slot: usize, key: &K, value: V) {
        let decl = self.core.decl(slot);
        assert_eq!(
            decl.value_type,
            TypeId::of::<V>(),
            "'{}': input {} holds {}, not {}",
            self.core.name,
            slot,
            decl.type_name,
            std::any::type_name::<V>()
        );
        self.core
            .set_arg_port(slot, key, PortValue::Boxed(Box::new(value)));
    }

    /// Seed a signal input of instance `key`.
    pub fn send_signal(&self, slot: usize, key: &K) {
        self.core.set_arg_port(slot, key, PortValue::Signal);
    }

    /// Spawn the instance for `key` directly; only templates with no push
    /// inputs (zero inputs, or pull inputs only) can be invoked.
    pub fn invoke(&self, key: &K) {
        let core = &self.core;
        assert!(
            core.inputs
                .iter()
                .all(|d| matches!(d.kind, InputKind::Pull { .. })),
            "'{}': invoke requires a template without push inputs",
            core.name
        );
        let Some(world) = core.world() else { return };
        let owner = (core.keymap)(key);
        assert_eq!(
            owner,
            world.rank(),
            "'{}': invoke for {:?} must run on its owner rank {}",
            core.name,
            key,
            owner
        );
        if core.inputs.is_empty() {
            world.task_created();
            let rec = TaskRecord::new(
                key.clone(),
                0,
                (core.priomap)(key),
                core.defer_writer.load(Ordering::Relaxed),
            );
            if rec.mark_released() {
                world.scheduler.submit(Box::new(ReleasedTask {
                    tt: core.arc(),
                    rec,
                }));
            }
        } else {
            // All inputs are pulls: create the record and fetch them.
            let rec = {
                let mut bucket = core.table.lock_bucket(key);
                match bucket.find(key) {
                    Some(rec) => rec,
                    None => {
                        world.task_created();
                        let rec = TaskRecord::new(
                            key.clone(),
                            core.inputs.len(),
                            (core.priomap)(key),
                            core.defer_writer.load(Ordering::Relaxed),
                        );
                        bucket.insert(Arc::clone(&rec));
                        rec
                    }
                }
            };
            let issue = {
                let mut inner = rec.inner.lock();
                if inner.pulls_issued {
                    false
                } else {
                    inner.pulls_issued = true;
                    true
                }
            };
            if issue {
                core.issue_pulls(&world, key);
            }
        }
    }

    /// Record the per-key goal for streaming input `slot`.
    pub fn set_stream_goal(&self, slot: usize, key: &K, n: usize) {
        self.core.set_stream_goal(slot, key, n);
    }

    /// Terminate streaming input `slot` for `key`, firing the instance.
    pub fn finalize_stream(&self, slot: usize, key: &K) {
        self.core.finalize_stream(slot, key);
    }

    /// Template-wide default stream goal; call before the first arrival.
    pub fn set_static_stream_goal(&self, slot: usize, n: usize) {
        self.core.set_static_stream_goal(slot, n);
    }

    /// Writers on this template wait for readers instead of duplicating.
    pub fn set_defer_writer(&self, v: bool) {
        self.core.defer_writer.store(v, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn world() -> World {
        World::builder().threads(2).build().unwrap()
    }

    fn settle(w: &World) {
        w.execute();
        w.fence().unwrap();
    }

    #[test]
    fn single_input_fires_per_arrival() {
        let w = world();
        let seen: Arc<Mutex<Vec<(u32, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let edge: Edge<u32, u64> = Edge::new("in");
        let sink = seen.clone();
        let tt = TtBuilder::<u32>::new(&w, "collect")
            .input("x", &edge, Access::Read)
            .keymap(|_| 0)
            .build(move |key, ctx| {
                sink.lock().push((*key, *ctx.input::<u64>(0)));
            })
            .unwrap();

        tt.set_input(0, &1, 10u64);
        tt.set_input(0, &2, 20u64);
        settle(&w);

        let mut got = seen.lock().clone();
        got.sort_unstable();
        assert_eq!(got, vec![(1, 10), (2, 20)]);
    }

    #[test]
    fn two_inputs_gather_before_firing() {
        let w = world();
        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let ea: Edge<u32, u64> = Edge::new("a");
        let eb: Edge<u32, u64> = Edge::new("b");
        let sink = seen.clone();
        let tt = TtBuilder::<u32>::new(&w, "sum2")
            .input("a", &ea, Access::Read)
            .input("b", &eb, Access::Read)
            .keymap(|_| 0)
            .build(move |_key, ctx| {
                sink.lock()
                    .push(ctx.input::<u64>(0) + ctx.input::<u64>(1));
            })
            .unwrap();

        tt.set_input(0, &7, 1u64);
        assert!(seen.lock().is_empty(), "must not fire on partial inputs");
        tt.set_input(1, &7, 2u64);
        settle(&w);
        assert_eq!(&*seen.lock(), &[3]);
    }

    #[test]
    fn chained_templates_flow() {
        let w = world();
        let result: Arc<Mutex<Option<i64>>> = Arc::new(Mutex::new(None));
        let seed: Edge<u32, i64> = Edge::new("seed");
        let mid: Edge<u32, i64> = Edge::new("mid");

        let _a = TtBuilder::<u32>::new(&w, "double")
            .input("x", &seed, Access::Read)
            .output("out", &mid)
            .keymap(|_| 0)
            .build(move |key, ctx| {
                let x = *ctx.input::<i64>(0);
                ctx.send(0, key, x * 2);
            })
            .unwrap();

        let sink = result.clone();
        let _b = TtBuilder::<u32>::new(&w, "store")
            .input("x", &mid, Access::Read)
            .keymap(|_| 0)
            .build(move |_key, ctx| {
                *sink.lock() = Some(*ctx.input::<i64>(0));
            })
            .unwrap();

        _a.set_input(0, &0, 21i64);
        settle(&w);
        assert_eq!(*result.lock(), Some(42));
    }

    #[test]
    fn streaming_reduces_to_goal() {
        let w = world();
        let result: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let edge: Edge<u32, u64> = Edge::new("s");
        let sink = result.clone();
        let tt = TtBuilder::<u32>::new(&w, "accumulate")
            .input_stream("s", &edge, |acc: &mut u64, v| *acc += v)
            .keymap(|_| 0)
            .build(move |_key, ctx| {
                *sink.lock() = Some(*ctx.input::<u64>(0));
            })
            .unwrap();

        tt.set_static_stream_goal(0, 4);
        for v in [1u64, 2, 3, 4] {
            tt.set_input(0, &9, v);
        }
        settle(&w);
        assert_eq!(*result.lock(), Some(10));
    }

    #[test]
    fn dynamic_stream_finalize_fires_once() {
        let w = world();
        let result: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let edge: Edge<u32, u64> = Edge::new("s");
        let sink = result.clone();
        let tt = TtBuilder::<u32>::new(&w, "accumulate")
            .input_stream("s", &edge, |acc: &mut u64, v| *acc += v)
            .keymap(|_| 0)
            .build(move |_key, ctx| {
                sink.lock().push(*ctx.input::<u64>(0));
            })
            .unwrap();

        tt.set_input(0, &3, 5u64);
        tt.set_input(0, &3, 6u64);
        tt.finalize_stream(0, &3);
        settle(&w);
        assert_eq!(&*result.lock(), &[11]);
    }

    #[test]
    fn aggregate_collects_siblings() {
        let w = world();
        let result: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let edge: Edge<u32, u64> = Edge::new("agg");
        let sink = result.clone();
        let tt = TtBuilder::<u32>::new(&w, "gather")
            .input_aggregate("parts", &edge)
            .keymap(|_| 0)
            .build(move |_key, ctx| {
                let agg = ctx.aggregate::<u64>(0);
                *sink.lock() = agg.iter().copied().collect();
            })
            .unwrap();

        tt.set_static_stream_goal(0, 3);
        tt.set_input(0, &1, 10u64);
        tt.set_input(0, &1, 11u64);
        tt.set_input(0, &1, 12u64);
        settle(&w);
        assert_eq!(&*result.lock(), &[10, 11, 12]);
    }

    #[test]
    fn signal_input_gates_firing() {
        let w = world();
        let fired = Arc::new(Mutex::new(0u32));
        let data: Edge<u32, u64> = Edge::new("d");
        let gate: Edge<u32, ()> = Edge::new("g");
        let sink = fired.clone();
        let tt = TtBuilder::<u32>::new(&w, "gated")
            .input("x", &data, Access::Read)
            .input_signal("go", &gate)
            .keymap(|_| 0)
            .build(move |_key, _ctx| {
                *sink.lock() += 1;
            })
            .unwrap();

        tt.set_input(0, &4, 1u64);
        assert_eq!(*fired.lock(), 0);
        tt.send_signal(1, &4);
        settle(&w);
        assert_eq!(*fired.lock(), 1);
    }

    #[test]
    fn pull_input_fetches_on_demand() {
        let w = world();
        let result: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let push: Edge<u32, u64> = Edge::new("push");
        let lookup: Edge<u32, u64> = Edge::pull("table", |_k| 0, |k| u64::from(*k) * 100);
        let sink = result.clone();
        let tt = TtBuilder::<u32>::new(&w, "combine")
            .input("x", &push, Access::Read)
            .input("t", &lookup, Access::Read)
            .keymap(|_| 0)
            .build(move |_key, ctx| {
                *sink.lock() = Some(ctx.input::<u64>(0) + ctx.input::<u64>(1));
            })
            .unwrap();

        tt.set_input(0, &3, 7u64);
        settle(&w);
        assert_eq!(*result.lock(), Some(307));
    }

    #[test]
    fn invoke_spawns_sourceless_instance() {
        let w = world();
        let fired: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let tt = TtBuilder::<u32>::new(&w, "source")
            .keymap(|_| 0)
            .build(move |key, _ctx| {
                sink.lock().push(*key);
            })
            .unwrap();

        tt.invoke(&5);
        tt.invoke(&6);
        settle(&w);
        let mut got = fired.lock().clone();
        got.sort_unstable();
        assert_eq!(got, vec![5, 6]);
    }

    #[test]
    #[should_panic(expected = "already set")]
    fn double_bind_is_fatal() {
        let w = world();
        let ea: Edge<u32, u64> = Edge::new("a");
        let eb: Edge<u32, u64> = Edge::new("b");
        let tt = TtBuilder::<u32>::new(&w, "strict")
            .input("a", &ea, Access::Read)
            .input("b", &eb, Access::Read)
            .keymap(|_| 0)
            .build(|_k, _ctx| {})
            .unwrap();
        tt.set_input(0, &1, 1u64);
        tt.set_input(0, &1, 2u64);
    }

    #[test]
    #[should_panic(expected = "exceeded its goal")]
    fn stream_overflow_is_fatal() {
        let w = world();
        let edge: Edge<u32, u64> = Edge::new("s");
        let tt = TtBuilder::<u32>::new(&w, "bounded")
            .input_stream("s", &edge, |acc: &mut u64, v| *acc += v)
            .input("other", &Edge::<u32, u64>::new("o"), Access::Read)
            .keymap(|_| 0)
            .build(|_k, _ctx| {})
            .unwrap();
        tt.set_static_stream_goal(0, 1);
        tt.set_input(0, &1, 1u64);
        tt.set_input(0, &1, 2u64);
    }

    #[test]
    fn streaming_plus_pull_is_rejected() {
        let w = world();
        let lookup: Edge<u32, u64> = Edge::pull("t", |_k| 0, |_k| 0u64);
        let err = TtBuilder::<u32>::new(&w, "bad")
            .input_stream("s", &lookup, |acc: &mut u64, v| *acc += v)
            .keymap(|_| 0)
            .build(|_k, _ctx| {})
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidTemplate(_)));
    }

    #[test]
    fn forward_reuses_inbound_copy() {
        let w = world();
        let observed: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let seed: Edge<u32, u64> = Edge::new("seed");
        let fwd: Edge<u32, u64> = Edge::new("fwd");

        let relay = TtBuilder::<u32>::new(&w, "relay")
            .input("x", &seed, Access::Read)
            .output("out", &fwd)
            .keymap(|_| 0)
            .build(move |key, ctx| {
                let x: &u64 = ctx.input(0);
                ctx.forward(0, key, x);
            })
            .unwrap();

        let sink = observed.clone();
        let _end = TtBuilder::<u32>::new(&w, "end")
            .input("x", &fwd, Access::Read)
            .keymap(|_| 0)
            .build(move |_key, ctx| {
                sink.lock().push(*ctx.input::<u64>(0));
            })
            .unwrap();

        relay.set_input(0, &1, 77u64);
        settle(&w);
        assert_eq!(&*observed.lock(), &[77]);
    }
}
