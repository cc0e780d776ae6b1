//! MPEG-2 transport stream packet header (ISO/IEC 13818-1).
//!
//! The pointer field following the four byte header is present only when
//! the payload unit start indicator is set.

use std::sync::LazyLock;

use pktchain::parse::{Field, Layout, LayoutBuilder, LayoutError, Variant};
use pktchain::{Packet, PacketType, Result};

pub const SYNC_BYTE: u8 = 0x47;

/// Size of a transport stream packet on the wire.
pub const PACKET_SIZE: usize = 188;

pub struct TransportPacketFields {
    pub sync_byte: Field<u8>,
    pub transport_error_indicator: Field<bool>,
    pub payload_unit_start_indicator: Field<bool>,
    pub transport_priority: Field<bool>,
    pub pid: Field<u16>,
    pub transport_scrambling_control: Field<u8>,
    pub adaptation_field_control: Field<u8>,
    pub continuity_counter: Field<u8>,
    pub pointer: Field<Variant>,
    pub pointer_field: Field<u8>,
}

struct TransportPacketLayout {
    layout: Layout,
    fields: TransportPacketFields,
}

fn build() -> core::result::Result<TransportPacketLayout, LayoutError> {
    let mut b = LayoutBuilder::new("transport packet");
    let sync_byte = b.uint::<u8>("sync_byte")?;
    let transport_error_indicator = b.flag("transport_error_indicator")?;
    let payload_unit_start_indicator = b.flag("payload_unit_start_indicator")?;
    let transport_priority = b.flag("transport_priority")?;
    let pid = b.bits::<u16>("pid", 13)?;
    let transport_scrambling_control = b.bits::<u8>("transport_scrambling_control", 2)?;
    let adaptation_field_control = b.bits::<u8>("adaptation_field_control", 2)?;
    let continuity_counter = b.bits::<u8>("continuity_counter", 4)?;

    let pointer = b.variant("pointer", payload_unit_start_indicator)?;
    b.alternative(pointer, 0)?;
    b.alternative(pointer, 1)?;
    let pointer_field = b.uint::<u8>("pointer_field")?;
    b.end_variant(pointer)?;

    Ok(TransportPacketLayout {
        layout: b.build()?,
        fields: TransportPacketFields {
            sync_byte,
            transport_error_indicator,
            payload_unit_start_indicator,
            transport_priority,
            pid,
            transport_scrambling_control,
            adaptation_field_control,
            continuity_counter,
            pointer,
            pointer_field,
        },
    })
}

static LAYOUT: LazyLock<TransportPacketLayout> =
    LazyLock::new(|| build().expect("transport packet layout is valid"));

#[derive(Debug, Clone, Copy, Default)]
pub struct TransportPacket;

impl TransportPacket {
    pub fn fields() -> &'static TransportPacketFields {
        &LAYOUT.fields
    }

    /// Set the payload unit start indicator, adding or removing the
    /// pointer field with it.
    pub fn set_payload_unit_start(packet: &Packet, start: bool) -> Result<()> {
        packet.init_variant(LAYOUT.fields.pointer, start as u64)
    }
}

impl PacketType for TransportPacket {
    fn name(&self) -> &'static str {
        "transport packet"
    }

    fn layout(&self) -> &Layout {
        &LAYOUT.layout
    }

    fn init(&self, packet: &Packet) -> Result<()> {
        packet.set(LAYOUT.fields.sync_byte, SYNC_BYTE)
    }
}
