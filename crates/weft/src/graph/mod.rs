// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! User-facing graph API: template tasks, terminals, edges, aggregates.
//!
//! A graph is a set of [`TemplateTask`]s wired by [`Edge`]s. Supplying a
//! template with a key and its declared inputs spawns one task instance;
//! instances fire when every input is bound (or a streaming input reaches
//! its goal) and may emit further values through their output terminals.

pub(crate) mod aggregator;
pub(crate) mod edge;
pub(crate) mod terminal;
pub(crate) mod tt;

pub use aggregator::Aggregate;
pub use edge::Edge;
pub use tt::{TaskCtx, TemplateTask, TtBuilder};

use crate::core::ser::{Codec, SerError};
use crate::transport::Rank;

/// Contract for task keys: hashable identity plus wire codability.
///
/// Blanket-implemented; `()` is the unit key of single-instance templates.
pub trait Key: Codec + Clone + Eq + std::hash::Hash + std::fmt::Debug {}

impl<T: Codec + Clone + Eq + std::hash::Hash + std::fmt::Debug> Key for T {}

/// Whether an input may be mutated by the consuming task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// By-reference: the task reads the value; copies are shared.
    Read,
    /// By-value: the task may mutate the value in place.
    ReadWrite,
}

/// Errors returned by weft operations.
///
/// Programming errors (double-binding, stream overflow, delivery to the
/// wrong rank, duplicating a move-only value) are not represented here:
/// they terminate the process, matching the all-or-nothing failure model.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Graph construction
    // ========================================================================
    /// Template declaration is inconsistent (e.g. streaming + pull on one
    /// slot, duplicate input names).
    InvalidTemplate(String),
    /// Output slot index out of range for this template.
    UnknownOutput(usize),
    /// Input slot index out of range for this template.
    UnknownInput(usize),
    /// Terminal value/key type does not match the declared slot type.
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    // ========================================================================
    // Messaging
    // ========================================================================
    /// Encoding/decoding failed.
    Ser(SerError),
    /// In-band message would exceed the active-message cap; the value type
    /// must use the split-metadata protocol.
    BufferOverrun { size: usize, cap: usize },
    /// Messages for templates that never registered were still buffered at
    /// fence time.
    MissingTemplates(usize),

    // ========================================================================
    // Lifecycle
    // ========================================================================
    /// Operation on a world that has been torn down.
    WorldGone,
    /// Invalid state for the requested operation.
    InvalidState(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Graph construction
            Error::InvalidTemplate(msg) => write!(f, "Invalid template: {}", msg),
            Error::UnknownOutput(slot) => write!(f, "Unknown output slot: {}", slot),
            Error::UnknownInput(slot) => write!(f, "Unknown input slot: {}", slot),
            Error::TypeMismatch { expected, found } => {
                write!(f, "Type mismatch: expected {}, found {}", expected, found)
            }
            // Messaging
            Error::Ser(e) => write!(f, "Serialization failed: {}", e),
            Error::BufferOverrun { size, cap } => write!(
                f,
                "Message of {} bytes exceeds the {}-byte cap (use iovecs for bulk data)",
                size, cap
            ),
            Error::MissingTemplates(n) => write!(
                f,
                "{} buffered message(s) for templates that never registered",
                n
            ),
            // Lifecycle
            Error::WorldGone => write!(f, "World has been torn down"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<SerError> for Error {
    fn from(e: SerError) -> Self {
        Error::Ser(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Pure, cluster-consistent map from key to owning rank.
///
/// Every rank must agree on the owner of every key; the returned rank must
/// be `< world.size()`.
pub type Keymap<K> = Box<dyn Fn(&K) -> Rank + Send + Sync>;

/// Pure map from key to scheduling priority (higher runs earlier).
pub type Priomap<K> = Box<dyn Fn(&K) -> i32 + Send + Sync>;
