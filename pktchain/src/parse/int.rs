//! Integer and bitfield parsers.
//!
//! Both parsers are plain offset descriptors. They borrow the bytes only for
//! the duration of one read or write.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::value::{mask, Endian};
use crate::{Error, Result};

/// A byte-aligned integer of 1 to 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntParser {
    offset: usize,
    bytes: usize,
    endian: Endian,
}

impl IntParser {
    pub const fn new(offset: usize, bytes: usize, endian: Endian) -> Self {
        Self {
            offset,
            bytes,
            endian,
        }
    }

    fn window<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        data.get(self.offset..self.offset + self.bytes)
            .ok_or(Error::truncated("integer field", self.offset + self.bytes, data.len()))
    }

    pub fn read(&self, data: &[u8]) -> Result<u64> {
        let buf = self.window(data)?;
        Ok(match self.endian {
            Endian::Big => BigEndian::read_uint(buf, self.bytes),
            Endian::Little => LittleEndian::read_uint(buf, self.bytes),
        })
    }

    /// Write the low `8 * bytes` bits of `raw`.
    pub fn write(&self, data: &mut [u8], raw: u64) -> Result<()> {
        let len = data.len();
        let buf = data
            .get_mut(self.offset..self.offset + self.bytes)
            .ok_or(Error::truncated("integer field", self.offset + self.bytes, len))?;
        let raw = raw & mask(self.bytes as u32 * 8);
        match self.endian {
            Endian::Big => BigEndian::write_uint(buf, raw, self.bytes),
            Endian::Little => LittleEndian::write_uint(buf, raw, self.bytes),
        }
        Ok(())
    }
}

/// A bitfield of up to 64 bits.
///
/// Bits are numbered from the most significant bit of the byte at `offset`,
/// which is network order. The field is read through the smallest run of
/// whole bytes containing it, so writes preserve neighboring bitfields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitsParser {
    offset: usize,
    bit: u32,
    width: u32,
}

impl BitsParser {
    pub const fn new(offset: usize, bit: u32, width: u32) -> Self {
        Self {
            offset: offset + (bit / 8) as usize,
            bit: bit % 8,
            width,
        }
    }

    /// Number of bytes the containing read spans.
    pub const fn container_bytes(&self) -> usize {
        ((self.bit + self.width + 7) / 8) as usize
    }

    const fn shift(&self) -> u32 {
        self.container_bytes() as u32 * 8 - self.bit - self.width
    }

    pub fn read(&self, data: &[u8]) -> Result<u64> {
        let n = self.container_bytes();
        let buf = data
            .get(self.offset..self.offset + n)
            .ok_or(Error::truncated("bitfield", self.offset + n, data.len()))?;
        let lane = BigEndian::read_uint128(buf, n);
        Ok(((lane >> self.shift()) as u64) & mask(self.width))
    }

    /// Read-modify-write of the containing bytes.
    pub fn write(&self, data: &mut [u8], raw: u64) -> Result<()> {
        let n = self.container_bytes();
        let len = data.len();
        let buf = data
            .get_mut(self.offset..self.offset + n)
            .ok_or(Error::truncated("bitfield", self.offset + n, len))?;
        let field_mask = (mask(self.width) as u128) << self.shift();
        let mut lane = BigEndian::read_uint128(buf, n);
        lane = (lane & !field_mask) | (((raw & mask(self.width)) as u128) << self.shift());
        BigEndian::write_uint128(buf, lane, n);
        Ok(())
    }
}
