//! Variable-length integer encoding (LEB128).
//!
//! Used for key and data lengths inside tree nodes, where most lengths fit in
//! one or two bytes.

/// Append `value` to `buf` as a varint.
///
/// Each byte carries 7 bits of data; the MSB is set when more bytes follow.
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Decode a varint from the start of `bytes`.
///
/// Returns the value and the number of bytes consumed, or `None` if the
/// encoding is truncated or longer than a u64 allows.
pub fn decode_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;

    for (i, &byte) in bytes.iter().enumerate().take(10) {
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }

    None
}

/// Number of bytes `put_varint` writes for `value`.
pub fn varint_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for &value in &[0u64, 127, 128, 16383, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_size(value), "size for {}", value);
            assert_eq!(decode_varint(&buf), Some((value, buf.len())));
        }
    }

    #[test]
    fn test_decode_truncated() {
        assert!(decode_varint(&[]).is_none());
        assert!(decode_varint(&[0x80, 0x80]).is_none());
    }
}
