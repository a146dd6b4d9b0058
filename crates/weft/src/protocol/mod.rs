// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Active-message protocol: envelope layout and message assembly.
//!
//! Every inter-rank event is one message: a fixed header followed by a
//! payload whose layout depends on the function id. Values larger than the
//! in-band cap ship only their metadata; bulk spans travel as one-sided
//! GETs against registered handles carried in the envelope.

pub(crate) mod envelope;

pub(crate) use envelope::{FnId, IovecRef, MsgHeader};
