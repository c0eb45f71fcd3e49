//! Varint and fixed-width primitives for the hand-encoded wire formats
//! (pack files, manifest records, Merkle records).

use std::io::Read;

use crate::error::{BkError, Result};

/// Append an LEB128 varint encoding of `value` to `out`.
pub fn put_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Number of bytes `put_uvarint` produces for `value`.
pub fn uvarint_len(value: u64) -> usize {
    if value == 0 {
        return 1;
    }
    (64 - value.leading_zeros() as usize).div_ceil(7)
}

/// Decode a varint from the front of `buf`. Returns (value, bytes consumed).
pub fn get_uvarint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return Err(BkError::Integrity("varint overflows u64".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(BkError::Integrity("truncated varint".into()))
}

/// Read a varint from an `io::Read`, one byte at a time.
pub fn read_uvarint<R: Read>(reader: &mut R) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        if shift >= 64 {
            return Err(BkError::Integrity("varint overflows u64".into()));
        }
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub fn put_fixed64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn get_fixed64(buf: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = buf
        .get(..8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| BkError::Integrity("truncated fixed64".into()))?;
    Ok(u64::from_le_bytes(arr))
}
