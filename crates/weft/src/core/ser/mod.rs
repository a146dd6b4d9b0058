// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Wire-format helpers for active-message encoding/decoding.
//!
//! The runtime does not impose a serialization framework; every value type
//! flowing through a graph implements [`Codec`], either by hand or via
//! `#[derive(Codec)]` from `weft-codegen`. Types with large payloads opt into
//! the split-metadata protocol by reporting [`IoSpan`]s: the in-band message
//! then carries only the metadata while the spans travel as one-sided GETs.

pub mod cursor;

pub use cursor::{Cursor, CursorMut};

use std::fmt;

/// Serialization error used within core::ser.
#[derive(Debug, Clone)]
pub enum SerError {
    EncoderFailed { reason: String },
    DecoderFailed { reason: String },
    WriteFailed { offset: usize, reason: String },
    ReadFailed { offset: usize, reason: String },
    InvalidData { reason: String },
}

impl fmt::Display for SerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerError::EncoderFailed { reason } => write!(f, "encoder failed: {}", reason),
            SerError::DecoderFailed { reason } => write!(f, "decoder failed: {}", reason),
            SerError::WriteFailed { offset, reason } => {
                write!(f, "write failed at offset {}: {}", offset, reason)
            }
            SerError::ReadFailed { offset, reason } => {
                write!(f, "read failed at offset {}: {}", offset, reason)
            }
            SerError::InvalidData { reason } => write!(f, "invalid data: {}", reason),
        }
    }
}

impl std::error::Error for SerError {}

pub type SerResult<T> = Result<T, SerError>;

/// A contiguous byte range transferred outside the in-band message.
///
/// Spans point into the owning value and stay valid for as long as the
/// value's data copy is alive; the transfer protocol keeps a reader share on
/// the copy until the remote side has pulled every span.
#[derive(Debug, Clone, Copy)]
pub struct IoSpan {
    pub ptr: *mut u8,
    pub len: usize,
}

// SAFETY: an IoSpan is only dereferenced while the owning DataCopy holds a
// reader share for the in-flight transfer, which pins the allocation.
unsafe impl Send for IoSpan {}
unsafe impl Sync for IoSpan {}

/// Wire descriptor for a value type.
///
/// `payload_size`/`pack`/`unpack` define the in-band representation.
/// `iovecs` is the split-metadata hook: a type that returns spans must pack
/// only its metadata (the spans' bytes are pulled separately). `try_duplicate`
/// is the duplication hook used when a copy cannot be shared; move-only types
/// return `None` and duplication becomes a fatal error at the call site.
pub trait Codec: Send + Sync + Sized + 'static {
    /// Number of in-band bytes `pack` will write.
    fn payload_size(&self) -> usize;

    /// Encode the in-band representation.
    fn pack(&self, cur: &mut CursorMut<'_>) -> SerResult<()>;

    /// Decode the in-band representation. For split-metadata types this
    /// reconstructs the value with its bulk buffers allocated but unfilled;
    /// the transport fills them through `iovecs`.
    fn unpack(cur: &mut Cursor<'_>) -> SerResult<Self>;

    /// Bulk spans to transfer out-of-band. Default: none (fully in-band).
    fn iovecs(&mut self) -> Vec<IoSpan> {
        Vec::new()
    }

    /// Produce an independent copy of the value, or `None` if the type is
    /// move-only.
    fn try_duplicate(&self) -> Option<Self> {
        None
    }
}

macro_rules! impl_codec_primitive {
    ($type:ty, $size:expr, $write:ident, $read:ident) => {
        impl Codec for $type {
            fn payload_size(&self) -> usize {
                $size
            }
            fn pack(&self, cur: &mut CursorMut<'_>) -> SerResult<()> {
                cur.$write(*self)
            }
            fn unpack(cur: &mut Cursor<'_>) -> SerResult<Self> {
                cur.$read()
            }
            fn try_duplicate(&self) -> Option<Self> {
                Some(*self)
            }
        }
    };
}

impl_codec_primitive!(u8, 1, write_u8, read_u8);
impl_codec_primitive!(i8, 1, write_i8, read_i8);
impl_codec_primitive!(u16, 2, write_u16_le, read_u16_le);
impl_codec_primitive!(i16, 2, write_i16_le, read_i16_le);
impl_codec_primitive!(u32, 4, write_u32_le, read_u32_le);
impl_codec_primitive!(i32, 4, write_i32_le, read_i32_le);
impl_codec_primitive!(u64, 8, write_u64_le, read_u64_le);
impl_codec_primitive!(i64, 8, write_i64_le, read_i64_le);
impl_codec_primitive!(f32, 4, write_f32_le, read_f32_le);
impl_codec_primitive!(f64, 8, write_f64_le, read_f64_le);

impl Codec for bool {
    fn payload_size(&self) -> usize {
        1
    }
    fn pack(&self, cur: &mut CursorMut<'_>) -> SerResult<()> {
        cur.write_u8(u8::from(*self))
    }
    fn unpack(cur: &mut Cursor<'_>) -> SerResult<Self> {
        Ok(cur.read_u8()? != 0)
    }
    fn try_duplicate(&self) -> Option<Self> {
        Some(*self)
    }
}

impl Codec for usize {
    fn payload_size(&self) -> usize {
        8
    }
    fn pack(&self, cur: &mut CursorMut<'_>) -> SerResult<()> {
        cur.write_u64_le(*self as u64)
    }
    fn unpack(cur: &mut Cursor<'_>) -> SerResult<Self> {
        Ok(cur.read_u64_le()? as usize)
    }
    fn try_duplicate(&self) -> Option<Self> {
        Some(*self)
    }
}

/// Unit is the carrier for pure control signals and unit keys.
impl Codec for () {
    fn payload_size(&self) -> usize {
        0
    }
    fn pack(&self, _cur: &mut CursorMut<'_>) -> SerResult<()> {
        Ok(())
    }
    fn unpack(_cur: &mut Cursor<'_>) -> SerResult<Self> {
        Ok(())
    }
    fn try_duplicate(&self) -> Option<Self> {
        Some(())
    }
}

impl Codec for String {
    fn payload_size(&self) -> usize {
        4 + self.len()
    }
    fn pack(&self, cur: &mut CursorMut<'_>) -> SerResult<()> {
        cur.write_u32_le(self.len() as u32)?;
        cur.write_bytes(self.as_bytes())
    }
    fn unpack(cur: &mut Cursor<'_>) -> SerResult<Self> {
        let len = cur.read_u32_le()? as usize;
        let bytes = cur.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| SerError::InvalidData {
            reason: "string payload is not valid UTF-8".into(),
        })
    }
    fn try_duplicate(&self) -> Option<Self> {
        Some(self.clone())
    }
}

impl Codec for Vec<u8> {
    fn payload_size(&self) -> usize {
        4 + self.len()
    }
    fn pack(&self, cur: &mut CursorMut<'_>) -> SerResult<()> {
        cur.write_u32_le(self.len() as u32)?;
        cur.write_bytes(self)
    }
    fn unpack(cur: &mut Cursor<'_>) -> SerResult<Self> {
        let len = cur.read_u32_le()? as usize;
        Ok(cur.read_bytes(len)?.to_vec())
    }
    fn try_duplicate(&self) -> Option<Self> {
        Some(self.clone())
    }
}

impl<A: Codec, B: Codec> Codec for (A, B) {
    fn payload_size(&self) -> usize {
        self.0.payload_size() + self.1.payload_size()
    }
    fn pack(&self, cur: &mut CursorMut<'_>) -> SerResult<()> {
        self.0.pack(cur)?;
        self.1.pack(cur)
    }
    fn unpack(cur: &mut Cursor<'_>) -> SerResult<Self> {
        Ok((A::unpack(cur)?, B::unpack(cur)?))
    }
    fn iovecs(&mut self) -> Vec<IoSpan> {
        let mut spans = self.0.iovecs();
        spans.extend(self.1.iovecs());
        spans
    }
    fn try_duplicate(&self) -> Option<Self> {
        Some((self.0.try_duplicate()?, self.1.try_duplicate()?))
    }
}

/// Byte buffer transferred via the split-metadata protocol.
///
/// In-band the buffer contributes only its length (the metadata); the body
/// is pulled by the receiver as a one-sided GET. `unpack` allocates the
/// buffer zero-filled and the transport fills it in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bulk(pub Vec<u8>);

impl Codec for Bulk {
    fn payload_size(&self) -> usize {
        8
    }
    fn pack(&self, cur: &mut CursorMut<'_>) -> SerResult<()> {
        cur.write_u64_le(self.0.len() as u64)
    }
    fn unpack(cur: &mut Cursor<'_>) -> SerResult<Self> {
        let len = cur.read_u64_le()? as usize;
        Ok(Bulk(vec![0u8; len]))
    }
    fn iovecs(&mut self) -> Vec<IoSpan> {
        vec![IoSpan {
            ptr: self.0.as_mut_ptr(),
            len: self.0.len(),
        }]
    }
    fn try_duplicate(&self) -> Option<Self> {
        Some(self.clone())
    }
}

/// Pack a value into a fresh buffer sized by `payload_size`.
pub fn pack_to_vec<T: Codec>(value: &T) -> SerResult<Vec<u8>> {
    let mut buf = vec![0u8; value.payload_size()];
    let mut cur = CursorMut::new(&mut buf);
    value.pack(&mut cur)?;
    Ok(buf)
}
