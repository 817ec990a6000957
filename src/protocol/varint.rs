//! Zig-zag LEB128 varints and the fixed 4-byte varint slots used by reply rows.

use super::ProtocolError;

/// Width of a fixed row slot.
pub const SLOT_SIZE: usize = 4;

/// Longest varint encoding of a 64-bit value.
pub const MAX_VARINT_LEN: usize = 10;

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(ux: u64) -> i64 {
    let x = (ux >> 1) as i64;
    if ux & 1 != 0 {
        !x
    } else {
        x
    }
}

/// Append the varint encoding of `value` to `buf`, returning the bytes written.
pub fn put_varint(buf: &mut Vec<u8>, value: i64) -> usize {
    let mut ux = zigzag(value);
    let mut written = 0;
    while ux >= 0x80 {
        buf.push((ux as u8) | 0x80);
        ux >>= 7;
        written += 1;
    }
    buf.push(ux as u8);
    written + 1
}

/// Number of bytes `value` occupies as a varint.
pub fn varint_len(value: i64) -> usize {
    let mut ux = zigzag(value);
    let mut len = 1;
    while ux >= 0x80 {
        ux >>= 7;
        len += 1;
    }
    len
}

/// Append a zero padded 4-byte slot holding `value`.
pub fn put_slot(buf: &mut Vec<u8>, value: i64) -> Result<(), ProtocolError> {
    if varint_len(value) > SLOT_SIZE {
        return Err(ProtocolError::SlotOverflow(value));
    }
    let written = put_varint(buf, value);
    buf.resize(buf.len() + SLOT_SIZE - written, 0);
    Ok(())
}

/// Decode a varint from the front of `input`.
///
/// Returns the value and the number of bytes consumed.
pub fn read_varint(input: &[u8]) -> Result<(i64, usize), ProtocolError> {
    let mut ux: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in input.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return Err(ProtocolError::VarintOverflow);
        }
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                return Err(ProtocolError::VarintOverflow);
            }
            ux |= (b as u64) << shift;
            return Ok((unzigzag(ux), i + 1));
        }
        ux |= ((b & 0x7f) as u64) << shift;
        shift += 7;
    }
    Err(ProtocolError::Truncated)
}

/// Decode the value held in a 4-byte slot at the front of `input`.
pub fn read_slot(input: &[u8]) -> Result<i64, ProtocolError> {
    if input.len() < SLOT_SIZE {
        return Err(ProtocolError::Truncated);
    }
    let (value, _) = read_varint(&input[..SLOT_SIZE])?;
    Ok(value)
}
