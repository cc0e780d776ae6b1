//! Protocol definitions for pktchain.
//!
//! [`bootstrap`] registers every type of this crate with the process wide
//! [`Registry`] so that chains derive registered payload types on their own:
//!
//! ```
//! use pktchain::Packet;
//! use pktchain_bundle::{bootstrap, ethernet::Ethernet, tlv::GenericTlv};
//!
//! bootstrap().unwrap();
//! let frame = [
//!     0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02, 0x00, 0x00, 0x00, 0x00, 0x01,
//!     0x88, 0xb5, 0x07, 0x01, 0xaa,
//! ];
//! let eth = Packet::parse(&Ethernet, &frame).unwrap();
//! assert!(eth.next().unwrap().is::<GenericTlv>());
//! ```

#![cfg_attr(feature = "strict", deny(warnings))]

pub mod ethernet;
pub mod gre;
pub mod tlv;
pub mod transport;

use pktchain::{Namespace, Registry, RegistryError};

/// EtherType values, as used by Ethernet II and the GRE protocol type.
pub const ETHERTYPE: Namespace = Namespace::new("ethertype");

/// IP protocol numbers.
pub const IP_PROTOCOL: Namespace = Namespace::new("ip protocol");

/// Transparent Ethernet bridging.
pub const ETHERTYPE_TEB: u64 = 0x6558;

/// Local experimental EtherType 1, carrying generic TLVs here.
pub const ETHERTYPE_EXPERIMENTAL: u64 = 0x88b5;

/// A registry holding every protocol of this crate.
pub fn bootstrap_registry() -> Result<Registry, RegistryError> {
    let mut registry = Registry::new();
    registry.register(ETHERTYPE, ETHERTYPE_TEB, &ethernet::Ethernet)?;
    registry.register(ETHERTYPE, ETHERTYPE_EXPERIMENTAL, &tlv::GenericTlv)?;
    registry.register(IP_PROTOCOL, gre::IP_PROTOCOL_GRE, &gre::Gre)?;
    Ok(registry)
}

/// Install [`bootstrap_registry`] unless a registry is installed already.
/// Returns the installed registry either way.
pub fn bootstrap() -> Result<&'static Registry, RegistryError> {
    if Registry::is_installed() {
        return Ok(Registry::installed());
    }
    let registry = bootstrap_registry()?;
    match registry.install() {
        Ok(installed) => Ok(installed),
        // Lost a race against another thread installing first.
        Err(_) => Ok(Registry::installed()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ethernet::Ethernet;
    use gre::Gre;
    use pktchain::{DataPacket, Error, Packet};
    use tlv::GenericTlv;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
        bootstrap().unwrap();
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        init();
        let first = bootstrap().unwrap();
        let second = bootstrap().unwrap();
        assert!(core::ptr::eq(first, second));
        assert_eq!(first.lookup(ETHERTYPE, 0x6558).unwrap().name(), "ethernet");
        assert_eq!(first.reverse_lookup(IP_PROTOCOL, &Gre), Some(47));
    }

    #[test]
    fn test_unregistered_key_is_data() {
        init();
        let bytes = hex::decode("ffffffffffff020000000001123400010203").unwrap();
        let eth = Packet::parse(&Ethernet, &bytes).unwrap();
        let payload = eth.next().unwrap();
        assert!(payload.is::<DataPacket>());
        assert_eq!(payload.range().unwrap(), 14..18);
        assert!(payload.next().is_none());
        assert_eq!(eth.chain_data(), bytes);

        // Finalize leaves a key it cannot derive alone.
        eth.finalize().unwrap();
        assert_eq!(eth.get(Ethernet::fields().ether_type).unwrap(), 0x1234);
    }

    #[test]
    fn test_truncated_payload_ends_chain() {
        init();
        // EtherType says TLV, but one byte is all there is.
        let bytes = hex::decode("ffffffffffff02000000000188b507").unwrap();
        let eth = Packet::parse(&Ethernet, &bytes).unwrap();
        assert!(eth.next().is_none());
        assert!(matches!(eth.try_next(), Ok(None)));
        assert_eq!(eth.chain_data(), bytes);
    }

    /// GRE with checksum carrying an Ethernet frame carrying a TLV.
    fn tunnel() -> Packet {
        let gre = Packet::create(&Gre).unwrap();
        Gre::set_checksum_present(&gre, true).unwrap();
        let eth = gre.append(&Ethernet).unwrap();
        let f = Ethernet::fields();
        eth.set_octets(f.destination, &[0x02, 0, 0, 0, 0, 0x02]).unwrap();
        eth.set_octets(f.source, &[0x02, 0, 0, 0, 0, 0x01]).unwrap();
        let tlv = eth.append(&GenericTlv).unwrap();
        tlv.set(GenericTlv::fields().kind, 7).unwrap();
        GenericTlv::set_value_bytes(&tlv, b"hello").unwrap();
        gre.finalize().unwrap();
        gre
    }

    #[test]
    fn test_build_tunnel() {
        init();
        let gre = tunnel();
        assert_eq!(gre.get(Gre::fields().protocol_type).unwrap(), 0x6558);
        let eth = gre.next().unwrap();
        assert_eq!(eth.get(Ethernet::fields().ether_type).unwrap(), 0x88b5);
        let tlv = eth.next().unwrap();
        assert_eq!(tlv.tlv_length(GenericTlv::fields().length).value().unwrap(), 5);
        assert_eq!(gre.chain_len(), 8 + 14 + 7);
        gre.verify().unwrap();

        let mut out = Vec::new();
        gre.dump(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        let gre_at = out.find("gre:").unwrap();
        let eth_at = out.find("Ethernet II:").unwrap();
        let tlv_at = out.find("generic tlv:").unwrap();
        assert!(gre_at < eth_at && eth_at < tlv_at);
    }

    #[test]
    fn test_parse_tunnel() {
        init();
        let bytes = tunnel().chain_data();
        let gre = Packet::parse(&Gre, &bytes).unwrap();
        let eth = gre.next().unwrap();
        assert!(eth.is::<Ethernet>());
        let tlv = eth.next().unwrap();
        assert!(tlv.is::<GenericTlv>());
        assert_eq!(GenericTlv::value_bytes(&tlv).unwrap(), b"hello");
        assert!(tlv.next().is_none());
        gre.verify().unwrap();
        assert_eq!(gre.last(), tlv);
        assert_eq!(tlv.first().unwrap(), gre);

        let mut corrupted = bytes.clone();
        *corrupted.last_mut().unwrap() ^= 0xff;
        let gre = Packet::parse(&Gre, &corrupted).unwrap();
        assert!(matches!(
            gre.verify(),
            Err(Error::ChecksumMismatch { protocol: "gre", .. })
        ));
    }

    #[test]
    fn test_growth_keeps_layers_consistent() {
        init();
        let gre = tunnel();
        let eth = gre.next().unwrap();
        let tlv = eth.next().unwrap();
        let before = eth.range().unwrap();

        // Growing the innermost value past 127 bytes grows its length field.
        GenericTlv::set_value_bytes(&tlv, &[0x33; 200]).unwrap();
        assert_eq!(eth.range().unwrap(), before);
        assert_eq!(tlv.range().unwrap().start, before.end);
        assert_eq!(tlv.size().unwrap(), 1 + 2 + 200);
        assert_eq!(gre.chain_len(), 8 + 14 + 203);

        // Shrinking the outer header moves every following layer.
        Gre::set_checksum_present(&gre, false).unwrap();
        assert_eq!(eth.range().unwrap(), 4..18);
        assert_eq!(tlv.range().unwrap(), 18..18 + 203);
        gre.finalize().unwrap();
        gre.verify().unwrap();

        let reparsed = Packet::parse(&Gre, &gre.chain_data()).unwrap();
        let tlv = reparsed.find::<GenericTlv>().unwrap();
        assert_eq!(GenericTlv::value_bytes(&tlv).unwrap(), [0x33; 200]);
    }

    #[test]
    fn test_clone_is_independent() {
        init();
        let gre = tunnel();
        let copy = gre.clone();
        assert!(!copy.ptr_eq(&gre));

        let tlv = copy.find::<GenericTlv>().unwrap();
        GenericTlv::set_value_bytes(&tlv, b"bye").unwrap();
        copy.finalize().unwrap();

        let original = gre.find::<GenericTlv>().unwrap();
        assert_eq!(GenericTlv::value_bytes(&original).unwrap(), b"hello");
        assert_eq!(GenericTlv::value_bytes(&tlv).unwrap(), b"bye");
        assert_eq!(copy.chain_len() + 2, gre.chain_len());
        gre.verify().unwrap();
        copy.verify().unwrap();
    }

    #[test]
    fn test_remove_inner_layer() {
        init();
        let gre = tunnel();
        let eth = gre.next().unwrap();
        let tlv = eth.next().unwrap();
        eth.remove().unwrap();
        assert_eq!(gre.next().unwrap(), tlv);
        assert_eq!(tlv.range().unwrap(), 8..15);

        gre.finalize().unwrap();
        assert_eq!(gre.get(Gre::fields().protocol_type).unwrap(), 0x88b5);
        gre.verify().unwrap();
    }
}
