//! Ethernet II frame header (without FCS).

use std::io;
use std::sync::LazyLock;

use pktchain::parse::{Field, Layout, LayoutBuilder, LayoutError, Octets};
use pktchain::{Error, NextType, Packet, PacketType, Result};

use crate::ETHERTYPE;

pub const ADDRESS_LEN: usize = 6;

pub struct EthernetFields {
    pub destination: Field<Octets>,
    pub source: Field<Octets>,
    pub ether_type: Field<u16>,
}

struct EthernetLayout {
    layout: Layout,
    fields: EthernetFields,
}

fn build() -> core::result::Result<EthernetLayout, LayoutError> {
    let mut b = LayoutBuilder::new("ethernet");
    let destination = b.octets("destination", ADDRESS_LEN)?;
    let source = b.octets("source", ADDRESS_LEN)?;
    let ether_type = b.uint::<u16>("ether_type")?;
    Ok(EthernetLayout {
        layout: b.build()?,
        fields: EthernetFields {
            destination,
            source,
            ether_type,
        },
    })
}

static LAYOUT: LazyLock<EthernetLayout> =
    LazyLock::new(|| build().expect("ethernet layout is valid"));

#[derive(Debug, Clone, Copy, Default)]
pub struct Ethernet;

impl Ethernet {
    pub fn fields() -> &'static EthernetFields {
        &LAYOUT.fields
    }
}

/// `aa:bb:cc:dd:ee:ff`
pub fn format_mac(address: &[u8]) -> String {
    address
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

impl PacketType for Ethernet {
    fn name(&self) -> &'static str {
        "ethernet"
    }

    fn layout(&self) -> &Layout {
        &LAYOUT.layout
    }

    fn next_packet_type(&self, packet: &Packet) -> Result<NextType> {
        Ok(NextType::Registry {
            namespace: ETHERTYPE,
            key: packet.get(LAYOUT.fields.ether_type)? as u64,
        })
    }

    /// Sets the EtherType from the registered type of the next layer. An
    /// unregistered payload keeps whatever value was set by hand.
    fn finalize(&self, packet: &Packet) -> Result<()> {
        let Some(key) = packet.next_key(ETHERTYPE) else {
            return Ok(());
        };
        let ether_type = u16::try_from(key).map_err(|_| Error::FieldRange {
            field: "ether_type",
            value: key as i128,
            min: 0,
            max: u16::MAX as i128,
        })?;
        packet.set(LAYOUT.fields.ether_type, ether_type)
    }

    fn dump(&self, packet: &Packet, w: &mut dyn io::Write) -> io::Result<()> {
        let f = &LAYOUT.fields;
        let field = |r: Result<Vec<u8>>| r.map_or_else(|e| format!("<{e}>"), |a| format_mac(&a));
        writeln!(w, "Ethernet II:")?;
        writeln!(w, "  destination : {}", field(packet.octets(f.destination)))?;
        writeln!(w, "  source      : {}", field(packet.octets(f.source)))?;
        match packet.get(f.ether_type) {
            Ok(ether_type) => writeln!(w, "  type        : {ether_type:#06x}"),
            Err(e) => writeln!(w, "  type        : <{e}>"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const FRAME: &str = "ffffffffffff020000000001123400010203";

    #[test]
    fn test_parse() {
        let bytes = hex::decode(FRAME).unwrap();
        let eth = Packet::parse(&Ethernet, &bytes).unwrap();
        let f = Ethernet::fields();
        assert_eq!(eth.octets(f.destination).unwrap(), [0xff; 6]);
        assert_eq!(eth.octets(f.source).unwrap(), [0x02, 0, 0, 0, 0, 0x01]);
        assert_eq!(eth.get(f.ether_type).unwrap(), 0x1234);
        assert_eq!(eth.size().unwrap(), 14);
        assert_eq!(eth.payload().unwrap(), [0x00, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_too_short() {
        let bytes = hex::decode("ffffffffffff0200").unwrap();
        assert!(matches!(
            Packet::parse(&Ethernet, &bytes),
            Err(Error::TruncatedData { .. })
        ));
    }

    #[test]
    fn test_set_address() {
        let eth = Packet::create(&Ethernet).unwrap();
        let f = Ethernet::fields();
        eth.set_octets(f.source, &[0x02, 0, 0x5e, 0x10, 0, 1]).unwrap();
        assert!(eth.set_octets(f.destination, &[0xff; 4]).is_err());
        assert_eq!(&eth.chain_data()[6..12], [0x02, 0, 0x5e, 0x10, 0, 1]);
        assert_eq!(eth.chain_len(), 14);
    }

    #[test]
    fn test_dump() {
        let bytes = hex::decode(FRAME).unwrap();
        let eth = Packet::parse(&Ethernet, &bytes).unwrap();
        let mut out = Vec::new();
        Ethernet.dump(&eth, &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("Ethernet II:\n"));
        assert!(out.contains("destination : ff:ff:ff:ff:ff:ff"));
        assert!(out.contains("source      : 02:00:00:00:00:01"));
        assert!(out.contains("type        : 0x1234"));
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac(&[0, 0x1b, 0x21, 0xab, 0xcd, 0xef]), "00:1b:21:ab:cd:ef");
        assert_eq!(format_mac(&[]), "");
    }
}
