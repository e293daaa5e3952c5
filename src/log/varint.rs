//! Compressed unsigned integers.
//!
//! Seven payload bits per byte, least significant group first. The final byte
//! has its high bit set, every other byte has it clear.

use crate::error::Result;
use crate::Error;

const MAX_ENCODED_LEN: usize = 10;

pub fn encode(mut value: u64, out: &mut Vec<u8>) {
    while value > 0x7f {
        out.push((value & 0x7f) as u8);
        value >>= 7;
    }
    out.push(value as u8 | 0x80);
}

pub fn encoded_len(mut value: u64) -> usize {
    let mut len = 1;
    while value > 0x7f {
        value >>= 7;
        len += 1;
    }
    len
}

/// Decodes from a byte source, failing on truncation or on more than ten bytes.
pub fn decode_with<F>(mut next: F) -> Result<u64>
where
    F: FnMut() -> Result<u8>,
{
    let mut value = 0u64;
    let mut shift = 0u32;
    for _ in 0..MAX_ENCODED_LEN {
        let byte = next()?;
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 != 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(Error::InvalidData(
        "compressed integer is longer than ten bytes".to_string(),
    ))
}

/// Decodes from the head of a slice, returning the value and bytes consumed.
pub fn decode(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut pos = 0;
    let value = decode_with(|| {
        let byte = bytes.get(pos).copied().ok_or_else(|| {
            Error::InvalidData("truncated compressed integer".to_string())
        })?;
        pos += 1;
        Ok(byte)
    })?;
    Ok((value, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_values_are_one_byte() {
        let mut buf = Vec::new();
        encode(0, &mut buf);
        encode(127, &mut buf);
        assert_eq!(buf, vec![0x80, 0xff]);
        assert_eq!(encoded_len(127), 1);
        assert_eq!(encoded_len(128), 2);
    }

    #[test]
    fn test_boundaries() {
        for value in [128u64, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            encode(value, &mut buf);
            assert_eq!(buf.len(), encoded_len(value));
            assert_eq!(decode(&buf).unwrap(), (value, buf.len()));
        }
    }

    #[test]
    fn test_truncated_input() {
        let result = decode(&[0x01, 0x02]);
        assert!(matches!(result, Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_overlong_input() {
        let result = decode(&[0u8; 11]);
        assert!(matches!(result, Err(Error::InvalidData(_))));
    }
}
