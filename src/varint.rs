//! Unsigned LEB128 varints.
//!
//! All wire-level lengths and the frame header word use this encoding:
//! little-endian groups of seven bits with a continuation flag in the most
//! significant bit. Encodings longer than the caps below are rejected rather
//! than silently wrapped.

use bytes::BufMut;
use thiserror::Error;

/// Maximum encoded length of a 32-bit varint.
pub const MAX_VARINT32_LEN: usize = 5;
/// Maximum encoded length of a 64-bit varint.
pub const MAX_VARINT64_LEN: usize = 10;

/// Errors raised while decoding a varint.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum VarintError {
    /// The input ended before the final (continuation-free) byte.
    #[error("varint is truncated")]
    Truncated,
    /// The encoding ran past the byte cap for the requested width.
    #[error("varint exceeds {max} bytes")]
    TooLong { max: usize },
}

/// Append `value` to `dst` as an unsigned LEB128 varint.
pub fn write_uvarint<B: BufMut>(mut value: u64, dst: &mut B) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// Number of bytes `write_uvarint` will produce for `value`.
#[must_use]
pub fn uvarint_len(value: u64) -> usize {
    let bits = 64 - value.max(1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Decode a 64-bit varint from the front of `src`, advancing it past the
/// consumed bytes.
///
/// # Errors
///
/// Returns [`VarintError::Truncated`] if `src` ends mid-varint and
/// [`VarintError::TooLong`] if the encoding exceeds ten bytes.
pub fn read_uvarint(src: &mut &[u8]) -> Result<u64, VarintError> {
    read_capped(src, MAX_VARINT64_LEN)
}

/// Decode a 32-bit varint from the front of `src`, advancing it past the
/// consumed bytes.
///
/// # Errors
///
/// Returns [`VarintError::Truncated`] if `src` ends mid-varint and
/// [`VarintError::TooLong`] if the encoding exceeds five bytes.
pub fn read_uvarint32(src: &mut &[u8]) -> Result<u32, VarintError> {
    let value = read_capped(src, MAX_VARINT32_LEN)?;
    u32::try_from(value).map_err(|_| VarintError::TooLong {
        max: MAX_VARINT32_LEN,
    })
}

fn read_capped(src: &mut &[u8], max: usize) -> Result<u64, VarintError> {
    let mut value: u64 = 0;
    for (i, &byte) in src.iter().enumerate() {
        if i >= max {
            return Err(VarintError::TooLong { max });
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            *src = &src[i + 1..];
            return Ok(value);
        }
    }
    Err(VarintError::Truncated)
}
