//! Self-describing variable-length integer used as TLV length.
//!
//! Wire format of the first byte:
//!
//! ```text
//!   7   6   5 ... 0
//! +---+---+---------+
//! | E | U |  count  |   E = 1: long form
//! +---+---+---------+
//! ```
//!
//! In short form (`E = 0`) the low seven bits hold the value, 0 to 127.
//! In long form `count` (1 to 4) big-endian octets follow. They hold
//! `value - 128`, unless the underflow flag `U` is set, in which case they
//! hold a value below 128 directly. That happens when capacity has been
//! reserved ahead of the value growing.

use byteorder::{BigEndian, ByteOrder};

use super::storage::Storage;
use crate::{Error, Result};

const EXTENDED: u8 = 0x80;
const UNDERFLOW: u8 = 0x40;
const COUNT: u8 = 0x3f;

/// Largest value of the one byte short form.
pub const SHORT_MAX: u32 = 127;

/// Largest number of octets following the first byte.
pub const MAX_FOLLOWING: usize = 4;

/// Capacity of a length field with `following` octets after the first byte.
pub const fn capacity_for(following: usize) -> u32 {
    match following {
        0 => SHORT_MAX,
        1 => 0xff + 128,
        2 => 0xffff + 128,
        3 => 0xff_ffff + 128,
        _ => u32::MAX,
    }
}

/// Number of octets following the first byte in the minimal encoding of `v`.
pub const fn minimal_following(v: u32) -> usize {
    let mut following = 0;
    while following < MAX_FOLLOWING && v > capacity_for(following) {
        following += 1;
    }
    following
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvLengthParser {
    offset: usize,
    name: &'static str,
    max: u32,
}

impl TlvLengthParser {
    pub const fn new(offset: usize, name: &'static str, max: u32) -> Self {
        Self { offset, name, max }
    }

    fn first(&self, data: &[u8]) -> Result<u8> {
        data.get(self.offset)
            .copied()
            .ok_or(Error::truncated(self.name, self.offset + 1, data.len()))
    }

    fn following(&self, data: &[u8]) -> Result<usize> {
        let first = self.first(data)?;
        if first & EXTENDED == 0 {
            return Ok(0);
        }
        let count = (first & COUNT) as usize;
        if count == 0 || count > MAX_FOLLOWING {
            return Err(Error::FieldRange {
                field: self.name,
                value: count as i128,
                min: 1,
                max: MAX_FOLLOWING as i128,
            });
        }
        Ok(count)
    }

    /// Size of the encoded field in bytes, 1 to 5.
    pub fn bytes(&self, data: &[u8]) -> Result<usize> {
        Ok(1 + self.following(data)?)
    }

    pub fn value(&self, data: &[u8]) -> Result<u32> {
        let first = self.first(data)?;
        let following = self.following(data)?;
        if following == 0 {
            return Ok((first & !EXTENDED) as u32);
        }
        let begin = self.offset + 1;
        let buf = data
            .get(begin..begin + following)
            .ok_or(Error::truncated(self.name, begin + following, data.len()))?;
        let stored = BigEndian::read_uint(buf, following) as u32;
        if first & UNDERFLOW != 0 {
            return Ok(stored);
        }
        stored.checked_add(128).ok_or(Error::FieldRange {
            field: self.name,
            value: stored as i128 + 128,
            min: 0,
            max: u32::MAX as i128,
        })
    }

    /// Largest value the field can hold without changing its size.
    pub fn capacity(&self, data: &[u8]) -> Result<u32> {
        Ok(capacity_for(self.following(data)?).min(self.max))
    }

    fn check(&self, v: u32) -> Result<()> {
        if v > self.max {
            return Err(Error::FieldRange {
                field: self.name,
                value: v as i128,
                min: 0,
                max: self.max as i128,
            });
        }
        Ok(())
    }

    /// Encode `v`. The field grows if `v` exceeds its current capacity but
    /// never shrinks; see [`TlvLengthParser::finalize`].
    pub fn set_value<S: Storage>(&self, storage: &mut S, v: u32) -> Result<()> {
        self.check(v)?;
        let current = self.following(storage.data())?;
        let needed = minimal_following(v).max(current);
        self.resize(storage, current, needed)?;
        self.encode(storage.data_mut(), v, needed);
        Ok(())
    }

    /// Re-encode the current value in its minimal form.
    pub fn finalize<S: Storage>(&self, storage: &mut S) -> Result<()> {
        let v = self.value(storage.data())?;
        let current = self.following(storage.data())?;
        let needed = minimal_following(v);
        self.resize(storage, current, needed)?;
        self.encode(storage.data_mut(), v, needed);
        Ok(())
    }

    /// Make room for values up to `v`, keeping the current value.
    pub fn reserve<S: Storage>(&self, storage: &mut S, v: u32) -> Result<()> {
        self.check(v)?;
        let value = self.value(storage.data())?;
        let current = self.following(storage.data())?;
        let needed = minimal_following(v);
        if needed > current {
            self.resize(storage, current, needed)?;
            self.encode(storage.data_mut(), value, needed);
        }
        Ok(())
    }

    fn resize<S: Storage>(&self, storage: &mut S, current: usize, needed: usize) -> Result<()> {
        let tail = self.offset + 1;
        if needed > current {
            storage.insert_zeroed(tail + current, needed - current)
        } else if needed < current {
            storage.erase(tail + needed, current - needed)
        } else {
            Ok(())
        }
    }

    fn encode(&self, data: &mut [u8], v: u32, following: usize) {
        if following == 0 {
            data[self.offset] = v as u8;
            return;
        }
        let underflow = v < 128;
        let stored = if underflow { v } else { v - 128 };
        data[self.offset] = EXTENDED | following as u8 | if underflow { UNDERFLOW } else { 0 };
        let begin = self.offset + 1;
        BigEndian::write_uint(&mut data[begin..begin + following], stored as u64, following);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn length(max: u32) -> TlvLengthParser {
        TlvLengthParser::new(1, "length", max)
    }

    #[test]
    fn test_decode_fixtures() {
        let l = length(u32::MAX);
        assert_eq!(l.value(&[0x01, 0x0a]).unwrap(), 10);
        assert_eq!(l.bytes(&[0x01, 0x0a]).unwrap(), 1);
        assert_eq!(l.value(&[0x01, 0x81, 0x7f]).unwrap(), 255);
        assert_eq!(l.bytes(&[0x01, 0x81, 0x7f]).unwrap(), 2);
        assert_eq!(l.value(&[0x01, 0x81, 0x0a]).unwrap(), 138);
        assert_eq!(l.value(&[0x01, 0xc1, 0x0a]).unwrap(), 10);
    }

    #[test]
    fn test_boundaries() {
        let l = length(u32::MAX);
        for v in [0, 1, 126, 127, 128, 129, 383, 384, 65663, 65664, 0x100_007f, u32::MAX] {
            let mut buf = vec![0x2a, 0x00];
            l.set_value(&mut buf, v).unwrap();
            l.finalize(&mut buf).unwrap();
            assert_eq!(l.value(&buf).unwrap(), v, "value {v}");
            assert_eq!(l.bytes(&buf).unwrap(), 1 + minimal_following(v), "value {v}");
            assert_eq!(buf.len(), 2 + minimal_following(v));
        }
    }

    #[test]
    fn test_size_class_transition() {
        let l = length(u32::MAX);
        let mut buf = vec![0x2a, 0x7f, 0xaa, 0xbb];
        l.set_value(&mut buf, 128).unwrap();
        assert_eq!(buf, [0x2a, 0x81, 0x00, 0xaa, 0xbb]);

        // Going back down keeps the long form until finalized.
        l.set_value(&mut buf, 127).unwrap();
        assert_eq!(buf, [0x2a, 0xc1, 0x7f, 0xaa, 0xbb]);
        assert_eq!(l.value(&buf).unwrap(), 127);

        l.finalize(&mut buf).unwrap();
        assert_eq!(buf, [0x2a, 0x7f, 0xaa, 0xbb]);
    }

    #[test]
    fn test_reserve() {
        let l = length(u32::MAX);
        let mut buf = vec![0x2a, 0x05];
        l.reserve(&mut buf, 255).unwrap();
        assert_eq!(buf, [0x2a, 0xc1, 0x05]);
        assert_eq!(l.value(&buf).unwrap(), 5);
        assert_eq!(l.capacity(&buf).unwrap(), 383);

        l.set_value(&mut buf, 255).unwrap();
        assert_eq!(buf, [0x2a, 0x81, 0x7f]);

        // Reserving less than the current size is a no-op.
        l.reserve(&mut buf, 10).unwrap();
        assert_eq!(buf, [0x2a, 0x81, 0x7f]);
    }

    #[test]
    fn test_configured_maximum() {
        let l = length(1000);
        let mut buf = vec![0x2a, 0x00];
        assert!(matches!(
            l.set_value(&mut buf, 1001),
            Err(Error::FieldRange { value: 1001, max: 1000, .. })
        ));
        assert!(l.reserve(&mut buf, 5000).is_err());
        assert_eq!(buf, [0x2a, 0x00]);
        l.set_value(&mut buf, 1000).unwrap();
        assert_eq!(l.value(&buf).unwrap(), 1000);
    }

    #[test]
    fn test_malformed() {
        let l = length(u32::MAX);
        assert!(matches!(
            l.bytes(&[0x00, 0x85]),
            Err(Error::FieldRange { value: 5, .. })
        ));
        assert!(matches!(
            l.value(&[0x00, 0x82, 0x01]),
            Err(Error::TruncatedData { .. })
        ));
        assert!(l.value(&[0x00]).is_err());
    }

    #[test]
    fn test_minimal_following() {
        assert_eq!(minimal_following(0), 0);
        assert_eq!(minimal_following(127), 0);
        assert_eq!(minimal_following(128), 1);
        assert_eq!(minimal_following(383), 1);
        assert_eq!(minimal_following(384), 2);
        assert_eq!(minimal_following(u32::MAX), 4);
    }
}
