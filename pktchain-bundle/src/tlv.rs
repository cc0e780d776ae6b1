//! Generic type-length-value element.
//!
//! ```text
//! +------+----------------+------------------+
//! | type | length (1..=5) | value (length B) |
//! +------+----------------+------------------+
//! ```
//!
//! The length uses the self-describing encoding of
//! [`TlvLengthParser`](pktchain::parse::TlvLengthParser): values up to 127
//! fit into one byte, larger values take extension octets.
//!
//! [`TlvSequence`] reads a run of such elements up to the end of its region.

use std::sync::LazyLock;

use pktchain::parse::{Count, Field, Layout, LayoutBuilder, LayoutError, List, TlvLength, Vector};
use pktchain::{Packet, PacketType, Result};

type LayoutResult<T> = core::result::Result<T, LayoutError>;

pub struct GenericTlvFields {
    pub kind: Field<u8>,
    pub length: Field<TlvLength>,
    pub value: Field<Vector>,
}

struct GenericTlvLayout {
    layout: Layout,
    fields: GenericTlvFields,
}

fn build() -> LayoutResult<GenericTlvLayout> {
    let mut b = LayoutBuilder::new("generic tlv");
    let kind = b.uint::<u8>("type")?;
    let length = b.tlv_length("length", u32::MAX)?;
    let value = b.vector("value", 1, Count::Bytes(length.erase()))?;
    Ok(GenericTlvLayout {
        layout: b.build()?,
        fields: GenericTlvFields {
            kind,
            length,
            value,
        },
    })
}

static LAYOUT: LazyLock<GenericTlvLayout> =
    LazyLock::new(|| build().expect("generic tlv layout is valid"));

#[derive(Debug, Clone, Copy, Default)]
pub struct GenericTlv;

impl GenericTlv {
    pub fn fields() -> &'static GenericTlvFields {
        &LAYOUT.fields
    }

    /// Replace the value, updating the length. The length field grows as
    /// needed and shrinks again on finalize.
    pub fn set_value_bytes(packet: &Packet, bytes: &[u8]) -> Result<()> {
        packet.vector(LAYOUT.fields.value).assign(bytes)
    }

    pub fn value_bytes(packet: &Packet) -> Result<Vec<u8>> {
        packet.vector(LAYOUT.fields.value).bytes()
    }
}

impl PacketType for GenericTlv {
    fn name(&self) -> &'static str {
        "generic tlv"
    }

    fn layout(&self) -> &Layout {
        &LAYOUT.layout
    }
}

pub struct TlvSequenceFields {
    pub elements: Field<List>,
}

struct TlvSequenceLayout {
    layout: Layout,
    fields: TlvSequenceFields,
}

fn build_sequence() -> LayoutResult<TlvSequenceLayout> {
    let mut b = LayoutBuilder::new("tlv sequence");
    let elements = b.list("elements", &LAYOUT.layout, Count::Rest)?;
    Ok(TlvSequenceLayout {
        layout: b.build()?,
        fields: TlvSequenceFields { elements },
    })
}

static SEQUENCE: LazyLock<TlvSequenceLayout> =
    LazyLock::new(|| build_sequence().expect("tlv sequence layout is valid"));

/// Generic TLVs back to back, filling the region they live in.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlvSequence;

impl TlvSequence {
    pub fn fields() -> &'static TlvSequenceFields {
        &SEQUENCE.fields
    }

    /// Append an element of type `kind` holding `value`.
    pub fn push(packet: &Packet, kind: u8, value: &[u8]) -> Result<()> {
        let elements = packet.list(SEQUENCE.fields.elements);
        elements.push(&[kind, 0])?;
        let last = elements.len()? - 1;
        elements.update(last, |layout, w| layout.vector_assign(w, LAYOUT.fields.value, value))
    }

    /// Type and value of every element.
    pub fn entries(packet: &Packet) -> Result<Vec<(u8, Vec<u8>)>> {
        let elements = packet.list(SEQUENCE.fields.elements);
        (0..elements.len()?)
            .map(|i| {
                let kind = elements.element_get(i, LAYOUT.fields.kind)?;
                let value = elements.update(i, |layout, w| {
                    layout.vector_bytes(&*w, LAYOUT.fields.value).map(<[u8]>::to_vec)
                })?;
                Ok((kind, value))
            })
            .collect()
    }
}

impl PacketType for TlvSequence {
    fn name(&self) -> &'static str {
        "tlv sequence"
    }

    fn layout(&self) -> &Layout {
        &SEQUENCE.layout
    }
}
