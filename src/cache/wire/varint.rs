//! Unsigned LEB128 variable-length integers
//!
//! Seven payload bits per byte, continuation in the most significant bit.
//! A `u64` needs at most ten bytes; the tenth byte may only carry the final
//! bit, anything else is an overflow and the read is rejected.

/// Longest legal encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Appends the LEB128 encoding of `value`.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Reads a varint at `*pos`, advancing the cursor. Returns `None` on
/// truncation or overflow; the caller treats both as corrupt data.
pub fn read_varint(input: &[u8], pos: &mut usize) -> Option<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    for index in 0..MAX_VARINT_LEN {
        let byte = *input.get(*pos)?;
        *pos += 1;
        if index == MAX_VARINT_LEN - 1 {
            // Tenth byte: no continuation, only the final bit of the u64.
            if byte > 0x01 {
                return None;
            }
            return Some(result | (u64::from(byte) << shift));
        }
        result |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
    }
    None
}
