// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Active-message envelope encoding/decoding.
//!
//! Wire layout (little-endian, fixed 34-byte header):
//!
//! ```text
//! u32 taskpool_id
//! u64 template_id
//! u64 key_offset      // payload-relative offset where keys start
//! u8  fn_id
//! i8  num_iovecs
//! i32 input_slot
//! i32 num_keys
//! i32 sender_rank
//! ```
//!
//! Payload by fn_id:
//! - `SetArg` with value: value metadata, then `num_iovecs` x
//!   `{reg_size u64, handle u64, release_token u64}`, then the serialized
//!   keys at `key_offset`.
//! - `SetArg` void: keys only.
//! - `SetArgstreamSize`: key (if non-unit), then goal as u64.
//! - `FinalizeArgstreamSize`: key (if non-unit).
//! - `GetFromPull`: one key.

use crate::config;
use crate::core::ser::{Cursor, CursorMut, SerError, SerResult};

/// Remote operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FnId {
    SetArg = 0,
    SetArgstreamSize = 1,
    FinalizeArgstreamSize = 2,
    GetFromPull = 3,
}

impl FnId {
    fn from_u8(v: u8) -> SerResult<Self> {
        match v {
            0 => Ok(FnId::SetArg),
            1 => Ok(FnId::SetArgstreamSize),
            2 => Ok(FnId::FinalizeArgstreamSize),
            3 => Ok(FnId::GetFromPull),
            other => Err(SerError::InvalidData {
                reason: format!("unknown fn_id {other}"),
            }),
        }
    }
}

/// Fixed-size message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MsgHeader {
    pub taskpool_id: u32,
    pub template_id: u64,
    /// Payload-relative offset where the serialized keys start.
    pub key_offset: u64,
    pub fn_id: FnId,
    pub num_iovecs: i8,
    pub input_slot: i32,
    pub num_keys: i32,
    pub sender_rank: i32,
}

impl MsgHeader {
    pub fn encode(&self, cur: &mut CursorMut<'_>) -> SerResult<()> {
        cur.write_u32_le(self.taskpool_id)?;
        cur.write_u64_le(self.template_id)?;
        cur.write_u64_le(self.key_offset)?;
        cur.write_u8(self.fn_id as u8)?;
        cur.write_i8(self.num_iovecs)?;
        cur.write_i32_le(self.input_slot)?;
        cur.write_i32_le(self.num_keys)?;
        cur.write_i32_le(self.sender_rank)?;
        debug_assert_eq!(cur.offset(), config::MSG_HEADER_LEN);
        Ok(())
    }

    pub fn decode(cur: &mut Cursor<'_>) -> SerResult<Self> {
        let taskpool_id = cur.read_u32_le()?;
        let template_id = cur.read_u64_le()?;
        let key_offset = cur.read_u64_le()?;
        let fn_id = FnId::from_u8(cur.read_u8()?)?;
        let num_iovecs = cur.read_i8()?;
        let input_slot = cur.read_i32_le()?;
        let num_keys = cur.read_i32_le()?;
        let sender_rank = cur.read_i32_le()?;
        Ok(Self {
            taskpool_id,
            template_id,
            key_offset,
            fn_id,
            num_iovecs,
            input_slot,
            num_keys,
            sender_rank,
        })
    }
}

/// In-band descriptor of one out-of-band span.
///
/// `handle` names the registered region on the sender; `release_token` is
/// echoed back once the receiver has pulled the span, letting the sender
/// drop its transfer pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IovecRef {
    pub reg_size: u64,
    pub handle: u64,
    pub release_token: u64,
}

impl IovecRef {
    pub const WIRE_LEN: usize = 24;

    pub fn encode(&self, cur: &mut CursorMut<'_>) -> SerResult<()> {
        cur.write_u64_le(self.reg_size)?;
        cur.write_u64_le(self.handle)?;
        cur.write_u64_le(self.release_token)
    }

    pub fn decode(cur: &mut Cursor<'_>) -> SerResult<Self> {
        Ok(Self {
            reg_size: cur.read_u64_le()?,
            handle: cur.read_u64_le()?,
            release_token: cur.read_u64_le()?,
        })
    }
}

/// Assemble a message: header, opaque body section, then keys at the
/// recorded key offset.
///
/// `body` carries value metadata plus iovec refs (or the stream-goal word);
/// `keys` are already serialized. Fails with `WriteFailed` when the result
/// would exceed the in-band cap.
pub(crate) fn assemble(
    mut header: MsgHeader,
    body: &[u8],
    keys: &[Vec<u8>],
) -> SerResult<Vec<u8>> {
    let keys_len: usize = keys.iter().map(Vec::len).sum();
    let total = config::MSG_HEADER_LEN + body.len() + keys_len;
    if total > config::MAX_AM_SIZE {
        return Err(SerError::WriteFailed {
            offset: total,
            reason: format!(
                "message of {total} bytes exceeds the {}-byte active-message cap",
                config::MAX_AM_SIZE
            ),
        });
    }
    header.key_offset = body.len() as u64;
    let mut buf = vec![0u8; total];
    let mut cur = CursorMut::new(&mut buf);
    header.encode(&mut cur)?;
    cur.write_bytes(body)?;
    for key in keys {
        cur.write_bytes(key)?;
    }
    Ok(buf)
}

/// Split a received message into header and payload.
pub(crate) fn split(bytes: &[u8]) -> SerResult<(MsgHeader, &[u8])> {
    if bytes.len() < config::MSG_HEADER_LEN {
        return Err(SerError::ReadFailed {
            offset: bytes.len(),
            reason: "message shorter than envelope header".into(),
        });
    }
    let mut cur = Cursor::new(bytes);
    let header = MsgHeader::decode(&mut cur)?;
    Ok((header, &bytes[config::MSG_HEADER_LEN..]))
}
