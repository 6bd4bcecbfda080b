//! Variable-length integers.
//!
//! Header byte layout:
//!
//! ```text
//!   bit 7     sign
//!   bits 3-6  number of continuation bytes (0..=8)
//!   bits 0-2  low three bits of the magnitude
//! ```
//!
//! Continuation bytes hold the rest of the magnitude, least significant first.
//! Values in `-7..=7` fit in the header alone.

use crate::storage::error::{StoreError, StoreResult};
use bytes::{Buf, BufMut};

const SIGN_BIT: u8 = 0x80;
const COUNT_SHIFT: u8 = 3;
const COUNT_MASK: u8 = 0x0F;
const LOW_MASK: u8 = 0x07;
const MAX_CONTINUATION: usize = 8;

fn continuation_len(rest: u64) -> usize {
    (64 - rest.leading_zeros() as usize).div_ceil(8)
}

pub fn write_long(out: &mut impl BufMut, n: i64) {
    let magnitude = n.unsigned_abs();
    let rest = magnitude >> 3;
    let count = continuation_len(rest);

    let mut header = (magnitude as u8) & LOW_MASK;
    header |= (count as u8) << COUNT_SHIFT;
    if n < 0 {
        header |= SIGN_BIT;
    }
    out.put_u8(header);
    for i in 0..count {
        out.put_u8((rest >> (8 * i)) as u8);
    }
}

pub fn size_long(n: i64) -> usize {
    1 + continuation_len(n.unsigned_abs() >> 3)
}

pub fn read_long(buf: &mut impl Buf) -> StoreResult<i64> {
    if !buf.has_remaining() {
        return Err(StoreError::Corrupt("truncated integer header".to_string()));
    }
    let header = buf.get_u8();
    let count = ((header >> COUNT_SHIFT) & COUNT_MASK) as usize;
    if count > MAX_CONTINUATION {
        return Err(StoreError::Corrupt(format!(
            "integer continuation count {} exceeds {}",
            count, MAX_CONTINUATION
        )));
    }
    if buf.remaining() < count {
        return Err(StoreError::Corrupt("truncated integer body".to_string()));
    }

    let mut rest: u64 = 0;
    for i in 0..count {
        rest |= (buf.get_u8() as u64) << (8 * i);
    }
    if rest >> 61 != 0 {
        return Err(StoreError::Corrupt("integer magnitude overflow".to_string()));
    }
    let magnitude = (rest << 3) | (header & LOW_MASK) as u64;

    if header & SIGN_BIT != 0 {
        if magnitude > i64::MIN.unsigned_abs() {
            return Err(StoreError::Corrupt("negative integer overflow".to_string()));
        }
        Ok((magnitude as i64).wrapping_neg())
    } else {
        i64::try_from(magnitude)
            .map_err(|_| StoreError::Corrupt("positive integer overflow".to_string()))
    }
}

/// Reads a count or length prefix, rejecting negatives and anything longer
/// than what is left in the buffer.
pub fn read_len(buf: &mut impl Buf) -> StoreResult<usize> {
    let n = read_long(buf)?;
    let len = usize::try_from(n)
        .map_err(|_| StoreError::Corrupt(format!("negative length {}", n)))?;
    if len > buf.remaining() {
        return Err(StoreError::Corrupt(format!(
            "length {} exceeds remaining {} bytes",
            len,
            buf.remaining()
        )));
    }
    Ok(len)
}

pub fn write_bytes(out: &mut impl BufMut, bytes: &[u8]) {
    write_long(out, bytes.len() as i64);
    out.put_slice(bytes);
}

pub fn size_bytes(bytes: &[u8]) -> usize {
    size_long(bytes.len() as i64) + bytes.len()
}

pub fn read_bytes(buf: &mut impl Buf) -> StoreResult<Vec<u8>> {
    let len = read_len(buf)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

pub fn write_string(out: &mut impl BufMut, s: &str) {
    write_bytes(out, s.as_bytes());
}

pub fn size_string(s: &str) -> usize {
    size_bytes(s.as_bytes())
}

pub fn read_string(buf: &mut impl Buf) -> StoreResult<String> {
    String::from_utf8(read_bytes(buf)?)
        .map_err(|e| StoreError::Corrupt(format!("invalid utf-8 string: {}", e)))
}

/// `None` is written as `-1`; only for fields whose present values are never
/// negative.
pub fn write_opt_long(out: &mut impl BufMut, n: Option<i64>) {
    write_long(out, n.unwrap_or(-1));
}

pub fn read_opt_long(buf: &mut impl Buf) -> StoreResult<Option<i64>> {
    let n = read_long(buf)?;
    Ok(if n < 0 { None } else { Some(n) })
}

pub fn write_long_list(out: &mut impl BufMut, items: &[i64]) {
    write_long(out, items.len() as i64);
    for &n in items {
        write_long(out, n);
    }
}

pub fn size_long_list(items: &[i64]) -> usize {
    size_long(items.len() as i64) + items.iter().map(|&n| size_long(n)).sum::<usize>()
}

pub fn read_long_list(buf: &mut impl Buf) -> StoreResult<Vec<i64>> {
    let count = read_len(buf)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(read_long(buf)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode(n: i64) -> Vec<u8> {
        let mut out = Vec::new();
        write_long(&mut out, n);
        out
    }

    #[test]
    fn test_small_values_cost_one_byte() {
        for n in -7..=7 {
            assert_eq!(encode(n).len(), 1, "value {}", n);
        }
        assert_eq!(encode(8).len(), 2);
        assert_eq!(encode(-8).len(), 2);
    }

    #[test]
    fn test_extremes() -> StoreResult<()> {
        for n in [0, 1, -1, i64::MAX, i64::MIN, i64::MIN + 1, 1 << 40] {
            let bytes = encode(n);
            assert_eq!(bytes.len(), size_long(n));
            assert_eq!(read_long(&mut bytes.as_slice())?, n);
        }
        assert_eq!(encode(i64::MIN).len(), 9);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_count() {
        // count nibble = 9
        let bytes = [9u8 << 3];
        assert!(read_long(&mut &bytes[..]).is_err());
    }

    #[test]
    fn test_rejects_truncated() {
        let mut bytes = encode(1 << 30);
        bytes.pop();
        assert!(read_long(&mut bytes.as_slice()).is_err());
        assert!(read_long(&mut &[0u8; 0][..]).is_err());
    }

    #[test]
    fn test_rejects_overflow() {
        // positive magnitude 2^63
        let mut bytes = vec![8u8 << 3];
        bytes.extend_from_slice(&(1u64 << 60).to_le_bytes());
        assert!(read_long(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_string_and_len_guard() -> StoreResult<()> {
        let mut out = Vec::new();
        write_string(&mut out, "héllo");
        assert_eq!(out.len(), size_string("héllo"));
        assert_eq!(read_string(&mut out.as_slice())?, "héllo");

        // claims 100 bytes, has 1
        let mut short = Vec::new();
        write_long(&mut short, 100);
        short.push(b'x');
        assert!(read_string(&mut short.as_slice()).is_err());
        Ok(())
    }

    #[test]
    fn test_optional_long() -> StoreResult<()> {
        let mut out = Vec::new();
        write_opt_long(&mut out, None);
        write_opt_long(&mut out, Some(12));
        let mut buf = out.as_slice();
        assert_eq!(read_opt_long(&mut buf)?, None);
        assert_eq!(read_opt_long(&mut buf)?, Some(12));
        Ok(())
    }

    proptest! {
        #[test]
        fn roundtrip(n: i64) {
            let bytes = encode(n);
            prop_assert_eq!(bytes.len(), size_long(n));
            let mut buf = bytes.as_slice();
            prop_assert_eq!(read_long(&mut buf).unwrap(), n);
            prop_assert!(buf.is_empty());
        }
    }
}
