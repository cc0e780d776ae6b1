//! Integrity helpers for protocol finalize and verify policies.

use crc::{Crc, CRC_16_KERMIT, CRC_32_ISO_HDLC, CRC_32_MPEG_2};

use crate::{Error, Result};

/// 16 bit ones' complement sum as used by IP, UDP, GRE, ... (RFC 1071).
#[derive(Debug, Clone, Copy, Default)]
pub struct InternetChecksum {
    sum: u32,
    odd: Option<u8>,
}

impl InternetChecksum {
    pub const fn new() -> Self {
        Self { sum: 0, odd: None }
    }

    pub fn feed(&mut self, mut bytes: &[u8]) -> &mut Self {
        if let (Some(high), Some((&low, rest))) = (self.odd, bytes.split_first()) {
            self.add(u16::from_be_bytes([high, low]));
            self.odd = None;
            bytes = rest;
        }
        let mut words = bytes.chunks_exact(2);
        for word in &mut words {
            self.add(u16::from_be_bytes([word[0], word[1]]));
        }
        if let [last] = words.remainder() {
            self.odd = Some(*last);
        }
        self
    }

    fn add(&mut self, word: u16) {
        self.sum += word as u32;
        self.sum = (self.sum & 0xffff) + (self.sum >> 16);
    }

    /// The checksum: complement of the folded sum, a trailing odd byte
    /// padded with zero.
    pub fn value(&self) -> u16 {
        let mut copy = *self;
        if let Some(high) = copy.odd.take() {
            copy.add(u16::from_be_bytes([high, 0]));
        }
        !(copy.sum as u16)
    }
}

pub fn internet_checksum(bytes: &[u8]) -> u16 {
    InternetChecksum::new().feed(bytes).value()
}

const KERMIT: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);
const ISO_HDLC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const MPEG_2: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// CRC-16/KERMIT, the IEEE 802.15.4 FCS.
pub fn crc16_kermit(bytes: &[u8]) -> u16 {
    KERMIT.checksum(bytes)
}

/// CRC-32/ISO-HDLC, the Ethernet FCS.
pub fn crc32(bytes: &[u8]) -> u32 {
    ISO_HDLC.checksum(bytes)
}

/// CRC-32/MPEG-2, protecting MPEG-2 transport stream sections.
pub fn crc32_mpeg2(bytes: &[u8]) -> u32 {
    MPEG_2.checksum(bytes)
}

pub fn verify_checksum(protocol: &'static str, expected: u32, computed: u32) -> Result<()> {
    if expected != computed {
        return Err(Error::ChecksumMismatch {
            protocol,
            expected,
            computed,
        });
    }
    Ok(())
}

pub fn verify_crc(protocol: &'static str, expected: u32, computed: u32) -> Result<()> {
    if expected != computed {
        return Err(Error::CrcMismatch {
            protocol,
            expected,
            computed,
        });
    }
    Ok(())
}
