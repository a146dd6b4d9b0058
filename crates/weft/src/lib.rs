// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! # Weft - Distributed template-task graph runtime
//!
//! A pure Rust runtime for data-flow computations: describe the work as a
//! directed graph of *template tasks* parameterized by keys, and let the
//! runtime instantiate, gather inputs for, and fire task instances across
//! a cluster of ranks, with copy-elision data management and split-metadata
//! bulk transfers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use weft::{Access, Edge, Result, TtBuilder, World};
//!
//! fn main() -> Result<()> {
//!     let world = World::builder().threads(4).build()?;
//!
//!     let wire: Edge<u32, i64> = Edge::new("wire");
//!     let doubler = TtBuilder::<u32>::new(&world, "double")
//!         .input("x", &wire, Access::Read)
//!         .keymap(|_key| 0)
//!         .build(|key, ctx| {
//!             println!("double({key}) = {}", ctx.input::<i64>(0) * 2);
//!         })?;
//!
//!     doubler.set_input(0, &7, 21);
//!     world.execute();
//!     world.fence()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |        TtBuilder -> TemplateTask / Edge / TaskCtx / Aggregate      |
//! +--------------------------------------------------------------------+
//! |                          Graph Layer                               |
//! |   set_arg routing | instance table | streaming | broadcast | pull  |
//! +--------------------------------------------------------------------+
//! |                          Core Layer                                |
//! |   Data copies | pointer registry | task records | wire codec       |
//! +--------------------------------------------------------------------+
//! |                     Engine & Transport Layer                       |
//! |   Work-stealing scheduler | AM envelope | CommEngine | loopback    |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`World`] | Process-wide handle: engine binding, worker pool, fences |
//! | [`TtBuilder`] | Declares a template task's inputs, outputs, and body |
//! | [`TemplateTask`] | A graph node; one task instance per key |
//! | [`Edge`] | Typed link wiring an output terminal to input terminals |
//! | [`TaskCtx`] | A running task's access to its inputs and outputs |
//! | [`Codec`] | Wire descriptor every flowing value type implements |
//!
//! ## Features
//!
//! - **Copy elision**: consumers share, take over, or duplicate values
//!   according to a reader/writer protocol with deferred writers
//! - **Streaming inputs**: unbounded-arity terminals folded by a reducer
//!   with static, per-key, or finalize-driven goals
//! - **Split-metadata transfers**: bulk spans travel as one-sided GETs,
//!   only metadata rides the active message
//! - **Device tasks**: a transfer/kernel/sends state machine over a
//!   pluggable driver
//!
//! ## Modules Overview
//!
//! - [`graph`] - Template tasks, edges, terminals (start here)
//! - [`world`] - World lifecycle, fences, termination detection
//! - [`core`] - Data copies, task records, wire codec
//! - [`transport`] - Communication-engine abstraction + loopback engine
//! - [`device`] - Device-task state machine and driver abstraction

// Allow the derive macro to work inside this crate's tests
extern crate self as weft;

/// Global configuration (runtime constants, dynamic settings).
pub mod config;
/// Core runtime state: data copies, records, tables, wire codec.
pub mod core;
/// Device-task protocol (transfer/kernel state machine, driver trait).
pub mod device;
/// Work-stealing scheduler and wake plumbing.
pub(crate) mod engine;
/// User-facing graph API (template tasks, edges, aggregates).
pub mod graph;
/// Active-message envelope layout and assembly.
pub(crate) mod protocol;
/// Communication-engine abstraction and in-process loopback engine.
pub mod transport;
/// World lifecycle: engine binding, template registry, fences.
pub mod world;

pub use crate::core::ser::{Bulk, Codec, Cursor, CursorMut, IoSpan, SerError, SerResult};
pub use device::{DeviceDriver, DevicePhase, DeviceTask, Kernel, MockDriver, ViewDecl};
pub use graph::{Access, Aggregate, Edge, Error, Key, Result, TaskCtx, TemplateTask, TtBuilder};
pub use transport::{CommEngine, Rank};
pub use world::{TerminationMode, World, WorldBuilder};

// Derive macro for the wire-format trait; same name, macro namespace.
pub use weft_codegen::Codec;
