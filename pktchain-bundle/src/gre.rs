//! Generic Routing Encapsulation (RFC 2784).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |C|       Reserved0       | Ver |         Protocol Type         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      Checksum (optional)      |       Reserved1 (Optional)    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The protocol type is an EtherType and selects the payload type through
//! the [`ETHERTYPE`] registry namespace.

use std::sync::LazyLock;

use pktchain::checksum::{verify_checksum, InternetChecksum};
use pktchain::parse::{Field, Layout, LayoutBuilder, LayoutError, Variant};
use pktchain::{Error, NextType, Packet, PacketType, Result};

use crate::ETHERTYPE;

/// Registry key of GRE in the IP protocol number namespace.
pub const IP_PROTOCOL_GRE: u64 = 47;

pub struct GreFields {
    pub checksum_present: Field<bool>,
    pub reserved0: Field<u16>,
    pub version: Field<u8>,
    /// The first 16 bits as one word, overlaying the flags and version.
    pub flags_and_version: Field<u16>,
    pub protocol_type: Field<u16>,
    pub checksum_variant: Field<Variant>,
    pub checksum: Field<u16>,
    pub reserved1: Field<u16>,
}

struct GreLayout {
    layout: Layout,
    fields: GreFields,
}

fn build() -> core::result::Result<GreLayout, LayoutError> {
    let mut b = LayoutBuilder::new("gre");
    b.label("flags")?;
    let checksum_present = b.flag("checksum_present")?;
    let reserved0 = b.bits::<u16>("reserved0", 12)?;
    let version = b.bits::<u8>("version", 3)?;
    b.goto("flags")?;
    let flags_and_version = b.uint::<u16>("flags_and_version")?;
    b.resume();
    let protocol_type = b.uint::<u16>("protocol_type")?;

    let checksum_variant = b.variant("checksum_variant", checksum_present)?;
    b.alternative(checksum_variant, 0)?;
    b.alternative(checksum_variant, 1)?;
    let checksum = b.uint::<u16>("checksum")?;
    let reserved1 = b.uint::<u16>("reserved1")?;
    b.end_variant(checksum_variant)?;

    Ok(GreLayout {
        layout: b.build()?,
        fields: GreFields {
            checksum_present,
            reserved0,
            version,
            flags_and_version,
            protocol_type,
            checksum_variant,
            checksum,
            reserved1,
        },
    })
}

static LAYOUT: LazyLock<GreLayout> = LazyLock::new(|| build().expect("gre layout is valid"));

#[derive(Debug, Clone, Copy, Default)]
pub struct Gre;

impl Gre {
    pub fn fields() -> &'static GreFields {
        &LAYOUT.fields
    }

    /// Add or drop the checksum words. The header grows or shrinks by four
    /// bytes and the payload moves along.
    pub fn set_checksum_present(packet: &Packet, present: bool) -> Result<()> {
        packet.init_variant(LAYOUT.fields.checksum_variant, present as u64)
    }

    /// Checksum over header and payload with the checksum field taken as
    /// zero.
    pub fn compute_checksum(packet: &Packet) -> Result<u16> {
        let begin = packet.range()?.start;
        let field = packet.field_range(LAYOUT.fields.checksum)?;
        let field = field.start - begin..field.end - begin;
        let data = packet.data()?;
        let mut sum = InternetChecksum::new();
        sum.feed(&data[..field.start])
            .feed(&[0, 0])
            .feed(&data[field.end..]);
        Ok(sum.value())
    }
}

impl PacketType for Gre {
    fn name(&self) -> &'static str {
        "gre"
    }

    fn layout(&self) -> &Layout {
        &LAYOUT.layout
    }

    fn next_packet_type(&self, packet: &Packet) -> Result<NextType> {
        Ok(NextType::Registry {
            namespace: ETHERTYPE,
            key: packet.get(LAYOUT.fields.protocol_type)? as u64,
        })
    }

    fn finalize(&self, packet: &Packet) -> Result<()> {
        let f = &LAYOUT.fields;
        if let Some(key) = packet.next_key(ETHERTYPE) {
            let protocol = u16::try_from(key).map_err(|_| Error::FieldRange {
                field: "protocol_type",
                value: key as i128,
                min: 0,
                max: u16::MAX as i128,
            })?;
            packet.set(f.protocol_type, protocol)?;
        }
        if packet.get(f.checksum_present)? {
            let checksum = Gre::compute_checksum(packet)?;
            packet.set(f.checksum, checksum)?;
        }
        Ok(())
    }

    fn verify(&self, packet: &Packet) -> Result<()> {
        let f = &LAYOUT.fields;
        if !packet.get(f.checksum_present)? {
            return Ok(());
        }
        let expected = packet.get(f.checksum)?;
        verify_checksum("gre", expected as u32, Gre::compute_checksum(packet)? as u32)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pktchain::DATA;

    #[test]
    fn test_layout() {
        let layout = Gre.layout();
        assert_eq!(layout.min_bytes(), 4);
        assert_eq!(layout.init_bytes(), 4);
        let overlays: Vec<_> = layout.fields().filter(|f| f.overlay).map(|f| f.name).collect();
        assert_eq!(overlays, ["flags_and_version"]);
    }

    #[test]
    fn test_parse_without_checksum() {
        let bytes = hex::decode("00006558aabbcc").unwrap();
        let gre = Packet::parse(&Gre, &bytes).unwrap();
        let f = Gre::fields();
        assert!(!gre.get(f.checksum_present).unwrap());
        assert_eq!(gre.get(f.version).unwrap(), 0);
        assert_eq!(gre.get(f.protocol_type).unwrap(), 0x6558);
        assert_eq!(gre.variant(f.checksum_variant).unwrap(), 0);
        assert_eq!(gre.size().unwrap(), 4);
        assert!(gre.get(f.checksum).is_err());
        assert_eq!(gre.payload().unwrap(), [0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn test_overlay_word() {
        let bytes = hex::decode("80010800").unwrap();
        let gre = Packet::parse(&Gre, &bytes);
        // C set but the checksum words are missing.
        assert!(matches!(gre, Err(Error::TruncatedData { .. })));

        let bytes = hex::decode("8001080000000000").unwrap();
        let gre = Packet::parse(&Gre, &bytes).unwrap();
        let f = Gre::fields();
        assert_eq!(gre.get(f.flags_and_version).unwrap(), 0x8001);
        assert_eq!(gre.get(f.version).unwrap(), 1);
        assert!(gre.get(f.checksum_present).unwrap());

        gre.set(f.flags_and_version, 0x8000).unwrap();
        assert_eq!(gre.get(f.version).unwrap(), 0);
        gre.set(f.reserved0, 0xfff).unwrap();
        assert_eq!(gre.get(f.flags_and_version).unwrap(), 0xfff8);
        assert!(gre.set(f.version, 8).is_err());
    }

    #[test]
    fn test_checksum_variant() {
        let gre = Packet::create(&Gre).unwrap();
        let f = Gre::fields();
        let payload = gre.create_after(DATA).unwrap();
        payload.vector(pktchain::DataPacket::data()).assign(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(payload.range().unwrap(), 4..9);

        Gre::set_checksum_present(&gre, true).unwrap();
        assert!(gre.get(f.checksum_present).unwrap());
        assert_eq!(gre.size().unwrap(), 8);
        assert_eq!(payload.range().unwrap(), 8..13);
        assert_eq!(gre.get(f.checksum).unwrap(), 0);

        Gre::set_checksum_present(&gre, false).unwrap();
        assert_eq!(gre.size().unwrap(), 4);
        assert_eq!(payload.range().unwrap(), 4..9);
        assert_eq!(gre.chain_len(), 9);
        assert!(matches!(
            gre.init_variant(f.checksum_variant, 2),
            Err(Error::VariantMisuse { .. })
        ));
    }

    #[test]
    fn test_finalize_and_verify() {
        let gre = Packet::create(&Gre).unwrap();
        let f = Gre::fields();
        Gre::set_checksum_present(&gre, true).unwrap();
        gre.set(f.protocol_type, 0x0800).unwrap();
        let payload = [0x45, 0x00, 0x00, 0x14, 0xab];
        gre.create_after_with(DATA, pktchain::Content::Bytes(&payload)).unwrap();

        gre.finalize().unwrap();
        // Data is not registered, the protocol type is left alone.
        assert_eq!(gre.get(f.protocol_type).unwrap(), 0x0800);
        assert_eq!(pktchain::checksum::internet_checksum(&gre.chain_data()), 0);
        gre.verify().unwrap();

        gre.set(f.reserved1, 1).unwrap();
        let err = gre.verify().unwrap_err();
        assert!(err.is_integrity());
        assert!(matches!(err, Error::ChecksumMismatch { protocol: "gre", .. }));
    }
}
