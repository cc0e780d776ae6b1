//! Declarative field layouts.
//!
//! A [`Layout`] is an ordered list of field descriptors built once per
//! protocol type with a [`LayoutBuilder`]. Every descriptor carries a
//! position expressed relative to the end of the last variable-size field
//! before it, so fixed offsets are resolved while building and only the
//! sizes of dynamic fields (vectors, lists, variants, TLV lengths) are evaluated
//! against the bytes at access time.
//!
//! The builder hands out typed [`Field`] handles. They are plain indices
//! into the layout and are used with the accessors in
//! [`access`](super::access) or on a [`Packet`](crate::Packet).

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};

use super::value::{Endian, FieldValue};

static NEXT_LAYOUT_ID: AtomicU32 = AtomicU32::new(1);

/// Errors detected while building a layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("field `{field}`: width of {width} bits not supported")]
    BitWidth { field: &'static str, width: u32 },
    #[error("field `{field}` does not start on a byte boundary")]
    Unaligned { field: &'static str },
    #[error("field `{field}` overlaps fields outside of an overlay")]
    Overlap { field: &'static str },
    #[error("unknown label `{0}`")]
    UnknownLabel(&'static str),
    #[error("label `{0}` declared twice")]
    DuplicateLabel(&'static str),
    #[error("field `{field}` follows a rest-of-range vector")]
    FieldAfterRest { field: &'static str },
    #[error("field `{field}`: only fixed-size fields allowed in a variant alternative")]
    DynamicInVariant { field: &'static str },
    #[error("variant `{field}` declared inside another variant")]
    NestedVariant { field: &'static str },
    #[error("no open variant for `{field}`")]
    NoOpenVariant { field: &'static str },
    #[error("variant `{field}` declares no alternative")]
    EmptyVariant { field: &'static str },
    #[error("variant `{0}` is not closed")]
    UnclosedVariant(&'static str),
    #[error("field `{field}` cannot be used as element count")]
    InvalidCount { field: &'static str },
    #[error("field `{field}` cannot be used as discriminant")]
    InvalidDiscriminant { field: &'static str },
    #[error("list `{field}`: element layout may be empty")]
    EmptyElement { field: &'static str },
}

/// Identity of a layout, used to reject field handles of another layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutId(u32);

/// Kind marker of a fixed-size octet string field.
#[derive(Debug, Clone, Copy)]
pub enum Octets {}
/// Kind marker of a vector field.
#[derive(Debug, Clone, Copy)]
pub enum Vector {}
/// Kind marker of a list field.
#[derive(Debug, Clone, Copy)]
pub enum List {}
/// Kind marker of a variant field.
#[derive(Debug, Clone, Copy)]
pub enum Variant {}
/// Kind marker of a TLV length field.
#[derive(Debug, Clone, Copy)]
pub enum TlvLength {}

/// Typed handle onto one field of a layout.
///
/// `K` is either the [`FieldValue`] a scalar field decodes to, or one of the
/// kind markers [`Octets`], [`Vector`], [`List`], [`Variant`] and
/// [`TlvLength`].
#[derive(Debug)]
pub struct Field<K> {
    pub(crate) layout: LayoutId,
    pub(crate) index: u16,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Field<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Field<K> {}

impl<K> PartialEq for Field<K> {
    fn eq(&self, other: &Self) -> bool {
        self.layout == other.layout && self.index == other.index
    }
}

impl<K> Eq for Field<K> {}

impl<K> Field<K> {
    pub(crate) fn new(layout: LayoutId, index: usize) -> Self {
        Self {
            layout,
            index: index as u16,
            _kind: PhantomData,
        }
    }

    /// Drop the kind, e.g. to name the field as a vector count.
    pub fn erase(self) -> FieldRef {
        FieldRef {
            layout: self.layout,
            index: self.index,
        }
    }
}

/// Untyped field handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub(crate) layout: LayoutId,
    pub(crate) index: u16,
}

impl<K> From<Field<K>> for FieldRef {
    fn from(field: Field<K>) -> Self {
        field.erase()
    }
}

/// How the number of elements of a vector or list is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    /// Element count held in another field.
    Elements(FieldRef),
    /// Byte extent of all elements held in another field.
    Bytes(FieldRef),
    /// Everything up to the end of the interpreter.
    Rest,
}

/// One alternative of a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alternative {
    pub key: u64,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Kind {
    Int {
        bytes: usize,
        endian: Endian,
        signed: bool,
    },
    Bits {
        width: u32,
        signed: bool,
    },
    Octets {
        len: usize,
    },
    Vector {
        element: usize,
        count: Count,
    },
    List {
        element: &'static Layout,
        count: Count,
    },
    TlvLength {
        max: u32,
    },
    Variant {
        discriminant: u16,
        alternatives: Vec<Alternative>,
    },
}

impl Kind {
    pub(crate) fn is_dynamic(&self) -> bool {
        matches!(
            self,
            Kind::Vector { .. } | Kind::List { .. } | Kind::TlvLength { .. } | Kind::Variant { .. }
        )
    }

    pub(crate) fn is_scalar(&self) -> bool {
        matches!(self, Kind::Int { .. } | Kind::Bits { .. })
    }

    /// Size of a fixed-size field in bits.
    fn fixed_bits(&self) -> usize {
        match self {
            Kind::Int { bytes, .. } => bytes * 8,
            Kind::Bits { width, .. } => *width as usize,
            Kind::Octets { len } => len * 8,
            _ => 0,
        }
    }
}

/// Public classification of a field, see [`Layout::fields`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Bits,
    Octets,
    Vector,
    List,
    TlvLength,
    Variant,
}

/// Position: `bits` after the end of field `base`, or after the start of
/// the interpreter if `base` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pos {
    pub(crate) base: Option<u16>,
    pub(crate) bits: usize,
}

impl Pos {
    const START: Pos = Pos { base: None, bits: 0 };

    fn advance(self, bits: usize) -> Pos {
        Pos {
            base: self.base,
            bits: self.bits + bits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Slot {
    pub(crate) name: &'static str,
    pub(crate) pos: Pos,
    pub(crate) kind: Kind,
    pub(crate) overlay: bool,
    /// `(variant slot, alternative index)` for fields of an alternative.
    pub(crate) alternative: Option<(u16, usize)>,
}

/// Description of one field, as reported by [`Layout::fields`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: &'static str,
    pub field: FieldRef,
    pub kind: FieldKind,
    pub overlay: bool,
    pub in_alternative: bool,
}

/// The field layout of one protocol header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub(crate) id: LayoutId,
    pub(crate) name: &'static str,
    pub(crate) slots: Vec<Slot>,
    pub(crate) end: Pos,
    min_bytes: usize,
    init_bytes: usize,
}

impl Layout {
    pub fn id(&self) -> LayoutId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Smallest number of bytes a valid header occupies.
    pub fn min_bytes(&self) -> usize {
        self.min_bytes
    }

    /// Size of a freshly initialized header: empty vectors, short TLV
    /// lengths and the first alternative of every variant.
    pub fn init_bytes(&self) -> usize {
        self.init_bytes
    }

    pub fn fields(&self) -> impl Iterator<Item = FieldInfo> + '_ {
        self.slots.iter().enumerate().map(|(index, slot)| FieldInfo {
            name: slot.name,
            field: FieldRef {
                layout: self.id,
                index: index as u16,
            },
            kind: match slot.kind {
                Kind::Int { .. } => FieldKind::Int,
                Kind::Bits { .. } => FieldKind::Bits,
                Kind::Octets { .. } => FieldKind::Octets,
                Kind::Vector { .. } => FieldKind::Vector,
                Kind::List { .. } => FieldKind::List,
                Kind::TlvLength { .. } => FieldKind::TlvLength,
                Kind::Variant { .. } => FieldKind::Variant,
            },
            overlay: slot.overlay,
            in_alternative: slot.alternative.is_some(),
        })
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<FieldRef> {
        self.fields().find(|f| f.name == name).map(|f| f.field)
    }

    fn static_bits(&self, pos: Pos, size_of: &dyn Fn(&Kind) -> usize) -> usize {
        match pos.base {
            None => pos.bits,
            Some(base) => {
                let slot = &self.slots[base as usize];
                self.static_bits(slot.pos, size_of) + size_of(&slot.kind) * 8 + pos.bits
            }
        }
    }
}

fn min_size(kind: &Kind) -> usize {
    match kind {
        Kind::TlvLength { .. } => 1,
        Kind::Variant { alternatives, .. } => {
            alternatives.iter().map(|a| a.bytes).min().unwrap_or(0)
        }
        _ => 0,
    }
}

fn init_size(kind: &Kind) -> usize {
    match kind {
        Kind::TlvLength { .. } => 1,
        Kind::Variant { alternatives, .. } => alternatives.first().map_or(0, |a| a.bytes),
        _ => 0,
    }
}

#[derive(Debug)]
struct OpenVariant {
    slot: u16,
    start: Pos,
    alternatives: Vec<Alternative>,
    current: Option<usize>,
}

/// Builds a [`Layout`] field by field.
///
/// Fields are placed at a cursor that advances past every declared field.
/// [`LayoutBuilder::label`] remembers the cursor and [`LayoutBuilder::goto`]
/// moves it back, so the following fields overlay bytes already declared.
/// [`LayoutBuilder::resume`] returns to the end of the declared bytes.
#[derive(Debug)]
pub struct LayoutBuilder {
    id: LayoutId,
    name: &'static str,
    slots: Vec<Slot>,
    cursor: Pos,
    high: Pos,
    labels: Vec<(&'static str, Pos)>,
    open: Option<OpenVariant>,
    rest: Option<&'static str>,
}

impl LayoutBuilder {
    pub fn new(name: &'static str) -> Self {
        Self {
            id: LayoutId(NEXT_LAYOUT_ID.fetch_add(1, Ordering::Relaxed)),
            name,
            slots: Vec::new(),
            cursor: Pos::START,
            high: Pos::START,
            labels: Vec::new(),
            open: None,
            rest: None,
        }
    }

    fn in_overlay(&self) -> bool {
        self.cursor != self.high
    }

    /// Whether a field ending at `end` stays inside already declared bytes.
    fn within_declared(&self, end: Pos) -> bool {
        if end.base == self.high.base && end.bits <= self.high.bits {
            return true;
        }
        self.slots.iter().any(|slot| {
            !slot.overlay
                && slot.kind.is_dynamic()
                && slot.pos.base == end.base
                && end.bits <= slot.pos.bits
        })
    }

    fn push(&mut self, name: &'static str, kind: Kind) -> Result<usize, LayoutError> {
        if self.rest.is_some() && !self.in_overlay() {
            return Err(LayoutError::FieldAfterRest { field: name });
        }
        let byte_sized = !matches!(kind, Kind::Bits { .. });
        if byte_sized && self.cursor.bits % 8 != 0 {
            return Err(LayoutError::Unaligned { field: name });
        }
        let index = self.slots.len();
        let pos = self.cursor;

        if let Some(open) = &self.open {
            let Some(current) = open.current else {
                return Err(LayoutError::NoOpenVariant { field: name });
            };
            if kind.is_dynamic() {
                return Err(LayoutError::DynamicInVariant { field: name });
            }
            let alternative = Some((open.slot, current));
            self.cursor = pos.advance(kind.fixed_bits());
            self.slots.push(Slot {
                name,
                pos,
                kind,
                overlay: false,
                alternative,
            });
            return Ok(index);
        }

        let overlay = self.in_overlay();
        let end = if kind.is_dynamic() {
            if overlay {
                return Err(LayoutError::Overlap { field: name });
            }
            Pos {
                base: Some(index as u16),
                bits: 0,
            }
        } else {
            pos.advance(kind.fixed_bits())
        };
        if overlay && !self.within_declared(end) {
            return Err(LayoutError::Overlap { field: name });
        }
        self.slots.push(Slot {
            name,
            pos,
            kind,
            overlay,
            alternative: None,
        });
        self.cursor = end;
        if !overlay {
            self.high = end;
        }
        Ok(index)
    }

    /// Big-endian integer spanning the full width of `T`.
    pub fn uint<T: FieldValue>(&mut self, name: &'static str) -> Result<Field<T>, LayoutError> {
        self.integer(name, (T::BITS as usize).div_ceil(8), Endian::Big)
    }

    /// Little-endian integer spanning the full width of `T`.
    pub fn uint_le<T: FieldValue>(
        &mut self,
        name: &'static str,
    ) -> Result<Field<T>, LayoutError> {
        self.integer(name, (T::BITS as usize).div_ceil(8), Endian::Little)
    }

    /// Integer of `bytes` bytes (1 to 8) read as `T`, e.g. a 24-bit field
    /// read as `u32`.
    pub fn integer<T: FieldValue>(
        &mut self,
        name: &'static str,
        bytes: usize,
        endian: Endian,
    ) -> Result<Field<T>, LayoutError> {
        let width = bytes as u32 * 8;
        if bytes == 0 || bytes > 8 || width > T::BITS.max(8) {
            return Err(LayoutError::BitWidth { field: name, width });
        }
        let index = self.push(
            name,
            Kind::Int {
                bytes,
                endian,
                signed: T::SIGNED,
            },
        )?;
        Ok(Field::new(self.id, index))
    }

    /// Bitfield of `width` bits (1 to 64) read as `T`.
    pub fn bits<T: FieldValue>(
        &mut self,
        name: &'static str,
        width: u32,
    ) -> Result<Field<T>, LayoutError> {
        if width == 0 || width > 64 || width > T::BITS {
            return Err(LayoutError::BitWidth { field: name, width });
        }
        let index = self.push(
            name,
            Kind::Bits {
                width,
                signed: T::SIGNED,
            },
        )?;
        Ok(Field::new(self.id, index))
    }

    /// One-bit boolean flag.
    pub fn flag(&mut self, name: &'static str) -> Result<Field<bool>, LayoutError> {
        self.bits(name, 1)
    }

    /// Fixed-size octet string, e.g. a MAC address.
    pub fn octets(&mut self, name: &'static str, len: usize) -> Result<Field<Octets>, LayoutError> {
        let index = self.push(name, Kind::Octets { len })?;
        Ok(Field::new(self.id, index))
    }

    /// Reserved bits that get no field.
    pub fn skip_bits(&mut self, bits: usize) -> Result<(), LayoutError> {
        if self.rest.is_some() && !self.in_overlay() {
            return Err(LayoutError::FieldAfterRest { field: "<reserved>" });
        }
        let overlay = self.in_overlay();
        self.cursor = self.cursor.advance(bits);
        if self.open.is_none() && !overlay {
            self.high = self.cursor;
        }
        Ok(())
    }

    /// Reserved bytes that get no field.
    pub fn skip(&mut self, bytes: usize) -> Result<(), LayoutError> {
        self.skip_bits(bytes * 8)
    }

    fn count_source(&self, name: &'static str, source: FieldRef) -> Result<(), LayoutError> {
        let slot = (source.layout == self.id)
            .then(|| self.slots.get(source.index as usize))
            .flatten()
            .ok_or(LayoutError::InvalidCount { field: name })?;
        let usable = slot.kind.is_scalar() || matches!(slot.kind, Kind::TlvLength { .. });
        if !usable || slot.alternative.is_some() {
            return Err(LayoutError::InvalidCount { field: slot.name });
        }
        Ok(())
    }

    /// Vector of `element`-byte elements.
    pub fn vector(
        &mut self,
        name: &'static str,
        element: usize,
        count: Count,
    ) -> Result<Field<Vector>, LayoutError> {
        if element == 0 {
            return Err(LayoutError::BitWidth {
                field: name,
                width: 0,
            });
        }
        match count {
            Count::Elements(source) | Count::Bytes(source) => self.count_source(name, source)?,
            Count::Rest => {}
        }
        let index = self.push(name, Kind::Vector { element, count })?;
        if count == Count::Rest {
            self.rest = Some(name);
        }
        Ok(Field::new(self.id, index))
    }

    /// List of variable-size elements, each one laid out by `element`, e.g.
    /// a sequence of TLVs. `count` works as for [`LayoutBuilder::vector`],
    /// with [`Count::Bytes`] giving the extent of the whole list.
    pub fn list(
        &mut self,
        name: &'static str,
        element: &'static Layout,
        count: Count,
    ) -> Result<Field<List>, LayoutError> {
        if element.min_bytes() == 0 {
            return Err(LayoutError::EmptyElement { field: name });
        }
        match count {
            Count::Elements(source) | Count::Bytes(source) => self.count_source(name, source)?,
            Count::Rest => {}
        }
        let index = self.push(name, Kind::List { element, count })?;
        if count == Count::Rest {
            self.rest = Some(name);
        }
        Ok(Field::new(self.id, index))
    }

    /// Self-describing TLV length accepting values up to `max`.
    pub fn tlv_length(
        &mut self,
        name: &'static str,
        max: u32,
    ) -> Result<Field<TlvLength>, LayoutError> {
        let index = self.push(name, Kind::TlvLength { max })?;
        Ok(Field::new(self.id, index))
    }

    /// Open a variant selected by the scalar `discriminant`. Declare each
    /// alternative with [`LayoutBuilder::alternative`] followed by its
    /// fields, then close it with [`LayoutBuilder::end_variant`].
    pub fn variant(
        &mut self,
        name: &'static str,
        discriminant: impl Into<FieldRef>,
    ) -> Result<Field<Variant>, LayoutError> {
        if self.open.is_some() {
            return Err(LayoutError::NestedVariant { field: name });
        }
        let discriminant = discriminant.into();
        let slot = (discriminant.layout == self.id)
            .then(|| self.slots.get(discriminant.index as usize))
            .flatten()
            .ok_or(LayoutError::InvalidDiscriminant { field: name })?;
        if !slot.kind.is_scalar() || slot.alternative.is_some() {
            return Err(LayoutError::InvalidDiscriminant { field: slot.name });
        }
        let index = self.push(
            name,
            Kind::Variant {
                discriminant: discriminant.index,
                alternatives: Vec::new(),
            },
        )?;
        self.open = Some(OpenVariant {
            slot: index as u16,
            start: self.slots[index].pos,
            alternatives: Vec::new(),
            current: None,
        });
        self.cursor = self.slots[index].pos;
        Ok(Field::new(self.id, index))
    }

    /// Start the alternative selected by discriminant value `key`. An
    /// alternative without fields is void.
    pub fn alternative(&mut self, variant: Field<Variant>, key: u64) -> Result<(), LayoutError> {
        let name = self.slots.get(variant.index as usize).map_or("", |s| s.name);
        let cursor = self.cursor;
        let open = match &mut self.open {
            Some(open) if open.slot == variant.index => open,
            _ => return Err(LayoutError::NoOpenVariant { field: name }),
        };
        if let Some(current) = open.current {
            let used = cursor.bits - open.start.bits;
            if used % 8 != 0 {
                return Err(LayoutError::Unaligned { field: name });
            }
            open.alternatives[current].bytes = used / 8;
        }
        open.alternatives.push(Alternative { key, bytes: 0 });
        open.current = Some(open.alternatives.len() - 1);
        self.cursor = open.start;
        Ok(())
    }

    pub fn end_variant(&mut self, variant: Field<Variant>) -> Result<(), LayoutError> {
        let name = self.slots.get(variant.index as usize).map_or("", |s| s.name);
        let mut open = match self.open.take() {
            Some(open) if open.slot == variant.index => open,
            other => {
                self.open = other;
                return Err(LayoutError::NoOpenVariant { field: name });
            }
        };
        let Some(current) = open.current else {
            return Err(LayoutError::EmptyVariant { field: name });
        };
        let used = self.cursor.bits - open.start.bits;
        if used % 8 != 0 {
            return Err(LayoutError::Unaligned { field: name });
        }
        open.alternatives[current].bytes = used / 8;
        if let Kind::Variant { alternatives, .. } = &mut self.slots[open.slot as usize].kind {
            *alternatives = open.alternatives;
        }
        self.cursor = Pos {
            base: Some(open.slot),
            bits: 0,
        };
        self.high = self.cursor;
        Ok(())
    }

    /// Remember the current position under `name`.
    pub fn label(&mut self, name: &'static str) -> Result<(), LayoutError> {
        if self.labels.iter().any(|(l, _)| *l == name) {
            return Err(LayoutError::DuplicateLabel(name));
        }
        self.labels.push((name, self.cursor));
        Ok(())
    }

    /// Move the cursor back to a label. Fields declared until the next
    /// [`LayoutBuilder::resume`] overlay existing fields.
    ///
    /// Overlay fields are writable. A write only touches the bits of the
    /// written field, so writing two views of the same bits leaves the last
    /// value written; callers must not rely on both.
    pub fn goto(&mut self, name: &'static str) -> Result<(), LayoutError> {
        if let Some(open) = &self.open {
            let slot = &self.slots[open.slot as usize];
            return Err(LayoutError::UnclosedVariant(slot.name));
        }
        let (_, pos) = self
            .labels
            .iter()
            .find(|(l, _)| *l == name)
            .ok_or(LayoutError::UnknownLabel(name))?;
        self.cursor = *pos;
        Ok(())
    }

    /// Continue after the last non-overlay field.
    pub fn resume(&mut self) {
        self.cursor = self.high;
    }

    pub fn build(self) -> Result<Layout, LayoutError> {
        if let Some(open) = &self.open {
            return Err(LayoutError::UnclosedVariant(self.slots[open.slot as usize].name));
        }
        if self.high.bits % 8 != 0 {
            let field = self.slots.last().map_or(self.name, |s| s.name);
            return Err(LayoutError::Unaligned { field });
        }
        let mut layout = Layout {
            id: self.id,
            name: self.name,
            slots: self.slots,
            end: self.high,
            min_bytes: 0,
            init_bytes: 0,
        };
        layout.min_bytes = layout.static_bits(layout.end, &min_size) / 8;
        layout.init_bytes = layout.static_bits(layout.end, &init_size) / 8;
        Ok(layout)
    }
}

#[cfg(test)]
mod test {
    use std::sync::LazyLock;

    use super::*;

    #[test]
    fn test_fixed_offsets() {
        let mut b = LayoutBuilder::new("header");
        b.uint::<u8>("a").unwrap();
        b.bits::<u8>("b", 3).unwrap();
        b.bits::<u16>("c", 13).unwrap();
        b.integer::<u32>("d", 3, Endian::Big).unwrap();
        let layout = b.build().unwrap();
        assert_eq!(layout.min_bytes(), 6);
        assert_eq!(layout.init_bytes(), 6);
        let positions: Vec<usize> = layout.slots.iter().map(|s| s.pos.bits).collect();
        assert_eq!(positions, [0, 8, 11, 24]);
    }

    #[test]
    fn test_reject_widths() {
        let mut b = LayoutBuilder::new("header");
        assert_eq!(
            b.bits::<u64>("wide", 65),
            Err(LayoutError::BitWidth {
                field: "wide",
                width: 65
            })
        );
        assert!(b.bits::<u8>("narrow", 9).is_err());
        assert!(b.integer::<u16>("short", 3, Endian::Big).is_err());
        assert!(b.integer::<u64>("long", 9, Endian::Big).is_err());
        assert!(b.bits::<u64>("ok", 64).is_ok());
    }

    #[test]
    fn test_reject_unaligned() {
        let mut b = LayoutBuilder::new("header");
        b.bits::<u8>("flags", 3).unwrap();
        assert_eq!(
            b.uint::<u16>("value"),
            Err(LayoutError::Unaligned { field: "value" })
        );
        assert!(matches!(b.build(), Err(LayoutError::Unaligned { .. })));
    }

    #[test]
    fn test_overlay() {
        let mut b = LayoutBuilder::new("header");
        b.label("word").unwrap();
        b.uint::<u16>("word").unwrap();
        b.goto("word").unwrap();
        b.uint::<u8>("high").unwrap();
        b.uint::<u8>("low").unwrap();
        b.resume();
        b.uint::<u8>("after").unwrap();
        let layout = b.build().unwrap();
        assert_eq!(layout.min_bytes(), 3);
        let overlays: Vec<bool> = layout.fields().map(|f| f.overlay).collect();
        assert_eq!(overlays, [false, true, true, false]);
    }

    #[test]
    fn test_reject_overlapping_fields() {
        let mut b = LayoutBuilder::new("header");
        b.label("start").unwrap();
        b.uint::<u8>("one").unwrap();
        b.goto("start").unwrap();
        assert_eq!(
            b.uint::<u16>("two"),
            Err(LayoutError::Overlap { field: "two" })
        );
        assert_eq!(b.goto("missing"), Err(LayoutError::UnknownLabel("missing")));
        assert_eq!(b.label("start"), Err(LayoutError::DuplicateLabel("start")));
    }

    #[test]
    fn test_overlay_before_dynamic_field() {
        let mut b = LayoutBuilder::new("tlv");
        b.label("start").unwrap();
        b.uint::<u8>("type").unwrap();
        let length = b.tlv_length("length", u32::MAX).unwrap();
        b.vector("value", 1, Count::Bytes(length.erase())).unwrap();
        b.goto("start").unwrap();
        b.bits::<u8>("class", 2).unwrap();
        assert!(b.bits::<u8>("too_wide", 7).is_err());
        b.resume();
        let layout = b.build().unwrap();
        assert_eq!(layout.min_bytes(), 2);
    }

    #[test]
    fn test_variant_sizes() {
        let mut b = LayoutBuilder::new("header");
        let present = b.flag("present").unwrap();
        b.skip_bits(7).unwrap();
        let opt = b.variant("optional", present).unwrap();
        b.alternative(opt, 0).unwrap();
        b.alternative(opt, 1).unwrap();
        b.uint::<u16>("checksum").unwrap();
        b.uint::<u16>("reserved").unwrap();
        b.end_variant(opt).unwrap();
        b.uint::<u8>("trailer").unwrap();
        let layout = b.build().unwrap();
        assert_eq!(layout.min_bytes(), 2);
        assert_eq!(layout.init_bytes(), 2);
        match &layout.slots[1].kind {
            Kind::Variant { alternatives, .. } => assert_eq!(
                alternatives,
                &[
                    Alternative { key: 0, bytes: 0 },
                    Alternative { key: 1, bytes: 4 }
                ]
            ),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_variant_misuse_in_builder() {
        let mut b = LayoutBuilder::new("header");
        let d = b.uint::<u8>("d").unwrap();
        let v = b.variant("v", d).unwrap();
        assert!(matches!(
            b.uint::<u8>("orphan"),
            Err(LayoutError::NoOpenVariant { .. })
        ));
        b.alternative(v, 0).unwrap();
        assert!(matches!(
            b.tlv_length("len", 10),
            Err(LayoutError::DynamicInVariant { .. })
        ));
        assert!(matches!(
            b.variant("inner", d),
            Err(LayoutError::NestedVariant { .. })
        ));
        assert!(matches!(b.goto("x"), Err(LayoutError::UnclosedVariant("v"))));
    }

    #[test]
    fn test_field_after_rest() {
        let mut b = LayoutBuilder::new("data");
        b.vector("data", 1, Count::Rest).unwrap();
        assert_eq!(
            b.uint::<u8>("late"),
            Err(LayoutError::FieldAfterRest { field: "late" })
        );
    }

    #[test]
    fn test_list_element_layout() {
        static EMPTY: LazyLock<Layout> = LazyLock::new(|| {
            let mut b = LayoutBuilder::new("empty");
            b.vector("rest", 1, Count::Rest).unwrap();
            b.build().unwrap()
        });
        static PAIR: LazyLock<Layout> = LazyLock::new(|| {
            let mut b = LayoutBuilder::new("pair");
            b.uint::<u8>("a").unwrap();
            b.uint::<u8>("b").unwrap();
            b.build().unwrap()
        });

        let mut b = LayoutBuilder::new("header");
        let count = b.uint::<u8>("count").unwrap();
        assert_eq!(
            b.list("empty", &EMPTY, Count::Rest),
            Err(LayoutError::EmptyElement { field: "empty" })
        );
        b.list("pairs", &PAIR, Count::Elements(count.erase())).unwrap();
        b.uint::<u8>("trailer").unwrap();
        let layout = b.build().unwrap();
        assert_eq!(layout.min_bytes(), 2);
        let kinds: Vec<FieldKind> = layout.fields().map(|f| f.kind).collect();
        assert_eq!(kinds, [FieldKind::Int, FieldKind::List, FieldKind::Int]);
    }

    #[test]
    fn test_foreign_count_field() {
        let mut other = LayoutBuilder::new("other");
        let foreign = other.uint::<u8>("count").unwrap();
        let mut b = LayoutBuilder::new("header");
        assert!(matches!(
            b.vector("v", 1, Count::Elements(foreign.erase())),
            Err(LayoutError::InvalidCount { .. })
        ));
    }
}
