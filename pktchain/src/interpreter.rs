//! Protocol type behavior.
//!
//! Every interpreter in a chain is tagged with a [`PacketType`]. The type
//! supplies the field [`Layout`] and the policies the chain calls back into:
//! how to initialize a fresh header, where the payload is and which type it
//! has, what to recompute on finalize and how to verify integrity.

use core::any::{Any, TypeId};
use core::ops::Range;
use std::io;
use std::sync::LazyLock;

use crate::parse::{Count, Field, Layout, LayoutBuilder, Vector};
use crate::registry::Namespace;
use crate::{Packet, Result};

/// Upcast helper so the concrete type of a [`Factory`] can be recovered.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Reference to a protocol type, used wherever an interpreter has to be
/// constructed.
pub type Factory = &'static dyn PacketType;

/// Type identity of a factory.
pub fn type_key(factory: Factory) -> TypeId {
    factory.as_any().type_id()
}

/// How the type of the next layer is chosen.
#[derive(Clone, Copy)]
pub enum NextType {
    /// Opaque payload.
    Data,
    /// Always the same type.
    Fixed(Factory),
    /// Look `key` up in the registry `namespace`. Unknown keys yield
    /// opaque payload.
    Registry { namespace: Namespace, key: u64 },
}

/// Behavior of one protocol type.
///
/// Implementations are usually unit structs. Default methods treat
/// everything after the header as opaque payload.
pub trait PacketType: AsAny + Send + Sync {
    fn name(&self) -> &'static str;

    fn layout(&self) -> &Layout;

    /// Set default field values of a freshly created header. The header
    /// bytes are zero when this is called.
    fn init(&self, _packet: &Packet) -> Result<()> {
        Ok(())
    }

    /// Absolute byte range of the payload, or `None` if the header carries
    /// none. The range must start at or after the end of the header and end
    /// within [`Packet::payload_range`].
    fn next_packet_range(&self, packet: &Packet) -> Result<Option<Range<usize>>> {
        let payload = packet.payload_range()?;
        Ok((!payload.is_empty()).then_some(payload))
    }

    fn next_packet_type(&self, _packet: &Packet) -> Result<NextType> {
        Ok(NextType::Data)
    }

    /// Recompute derived fields. Called after every following layer and
    /// every nested interpreter has been finalized.
    fn finalize(&self, packet: &Packet) -> Result<()> {
        packet.finalize_lengths()
    }

    /// Check checksums or CRCs. Mismatches are returned as
    /// [`Error::ChecksumMismatch`](crate::Error::ChecksumMismatch) or
    /// [`Error::CrcMismatch`](crate::Error::CrcMismatch).
    fn verify(&self, _packet: &Packet) -> Result<()> {
        Ok(())
    }

    fn dump(&self, packet: &Packet, w: &mut dyn io::Write) -> io::Result<()> {
        writeln!(w, "{}:", self.name())?;
        packet.dump_fields(w, 2)
    }
}

/// Opaque payload covering everything it is given.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataPacket;

/// The [`DataPacket`] factory.
pub const DATA: Factory = &DataPacket;

struct DataLayout {
    layout: Layout,
    data: Field<Vector>,
}

static DATA_LAYOUT: LazyLock<DataLayout> = LazyLock::new(|| {
    let mut b = LayoutBuilder::new("data");
    let data = b
        .vector("data", 1, Count::Rest)
        .expect("rest-of-range vector is a valid first field");
    DataLayout {
        layout: b.build().expect("data layout is valid"),
        data,
    }
});

impl DataPacket {
    /// The payload bytes.
    pub fn data() -> Field<Vector> {
        DATA_LAYOUT.data
    }
}

impl PacketType for DataPacket {
    fn name(&self) -> &'static str {
        "data"
    }

    fn layout(&self) -> &Layout {
        &DATA_LAYOUT.layout
    }

    fn next_packet_range(&self, _packet: &Packet) -> Result<Option<Range<usize>>> {
        Ok(None)
    }

    fn finalize(&self, _packet: &Packet) -> Result<()> {
        Ok(())
    }

    fn dump(&self, packet: &Packet, w: &mut dyn io::Write) -> io::Result<()> {
        writeln!(w, "payload data ({} bytes):", packet.size().unwrap_or(0))?;
        packet.dump_fields(w, 2)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Other;

    impl PacketType for Other {
        fn name(&self) -> &'static str {
            "other"
        }

        fn layout(&self) -> &Layout {
            DATA.layout()
        }
    }

    #[test]
    fn test_type_key() {
        assert_eq!(type_key(DATA), TypeId::of::<DataPacket>());
        assert_ne!(type_key(&Other), type_key(DATA));
    }

    #[test]
    fn test_data_layout() {
        let layout = DATA.layout();
        assert_eq!(layout.min_bytes(), 0);
        let bytes = vec![1, 2, 3];
        assert_eq!(layout.vector_bytes(&bytes, DataPacket::data()).unwrap(), &[1, 2, 3]);
        assert_eq!(layout.size(&bytes, 0, 3).unwrap(), 3);
    }
}
