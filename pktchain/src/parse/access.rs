//! Reading and writing fields of a [`Layout`] over a [`Storage`].
//!
//! Positions of fields behind dynamic fields are resolved against the bytes
//! on every access. Nothing is cached, so a view never goes stale when the
//! bytes move.

use core::ops::Range;
use std::io;

use pktchain_util::HexDump;

use super::int::{BitsParser, IntParser};
use super::layout::{
    Alternative, Count, Field, FieldRef, Kind, Layout, List, Octets, Pos, Slot, TlvLength,
    Variant, Vector,
};
use super::storage::{Storage, Window};
use super::tlv::TlvLengthParser;
use super::value::{max_value, min_value, FieldValue};
use crate::{Error, Result};

/// Resolves positions for one snapshot of the bytes.
struct Eval<'a> {
    layout: &'a Layout,
    data: &'a [u8],
    begin: usize,
    limit: usize,
}

impl<'a> Eval<'a> {
    fn new<S: Storage>(layout: &'a Layout, storage: &'a S) -> Self {
        Self {
            layout,
            data: storage.data(),
            begin: storage.begin(),
            limit: storage.limit(),
        }
    }

    fn slot(&self, index: u16) -> &'a Slot {
        &self.layout.slots[index as usize]
    }

    /// Positions that do not fit a `usize`, e.g. from a huge count read
    /// off the wire, can never be backed by data.
    fn overflow(&self) -> Error {
        Error::truncated(self.layout.name, usize::MAX, self.limit.saturating_sub(self.begin))
    }

    fn bit_pos(&self, pos: Pos) -> Result<usize> {
        let base = match pos.base {
            None => self.begin,
            Some(base) => self.end_of(base)?,
        };
        base.checked_mul(8)
            .and_then(|bits| bits.checked_add(pos.bits))
            .ok_or_else(|| self.overflow())
    }

    /// Absolute bit position of a field, checking that a field of a variant
    /// alternative belongs to the active alternative.
    fn locate(&self, index: u16) -> Result<usize> {
        let slot = self.slot(index);
        if let Some((variant, alternative)) = slot.alternative {
            let expected = match &self.slot(variant).kind {
                Kind::Variant { alternatives, .. } => alternatives[alternative].key,
                _ => return Err(Error::InvalidChain("alternative outside of a variant")),
            };
            if self.active(variant)?.key != expected {
                return Err(Error::VariantMisuse {
                    field: slot.name,
                    key: expected,
                });
            }
        }
        self.bit_pos(slot.pos)
    }

    /// Byte offset of a byte-aligned field.
    fn offset(&self, index: u16) -> Result<usize> {
        Ok(self.locate(index)? / 8)
    }

    fn end_of(&self, index: u16) -> Result<usize> {
        let start = self.offset(index)?;
        start
            .checked_add(self.size(index, start)?)
            .ok_or_else(|| self.overflow())
    }

    fn count(&self, source: FieldRef) -> Result<usize> {
        usize::try_from(self.raw(source.index)?).map_err(|_| self.overflow())
    }

    /// Size in bytes of a byte-sized field starting at `start`.
    fn size(&self, index: u16, start: usize) -> Result<usize> {
        let slot = self.slot(index);
        match &slot.kind {
            Kind::Int { bytes, .. } => Ok(*bytes),
            Kind::Octets { len } => Ok(*len),
            Kind::Bits { width, .. } => Ok((*width as usize).div_ceil(8)),
            Kind::Vector { element, count } => match count {
                Count::Elements(source) => self
                    .count(*source)?
                    .checked_mul(*element)
                    .ok_or_else(|| self.overflow()),
                Count::Bytes(source) => self.count(*source),
                Count::Rest => Ok(self.limit.saturating_sub(start) / element * element),
            },
            Kind::List { element, count } => match count {
                Count::Elements(source) => self.list_bytes(element, self.count(*source)?, start),
                Count::Bytes(source) => self.count(*source),
                Count::Rest => Ok(self.limit.saturating_sub(start)),
            },
            Kind::TlvLength { max } => TlvLengthParser::new(start, slot.name, *max).bytes(self.data),
            Kind::Variant { .. } => Ok(self.active(index)?.bytes),
        }
    }

    /// Extent of `n` elements starting at `start`.
    fn list_bytes(&self, element: &Layout, n: usize, start: usize) -> Result<usize> {
        let available = self.limit.saturating_sub(start);
        let required = n.saturating_mul(element.min_bytes());
        if required > available {
            return Err(Error::truncated(self.layout.name, required, available));
        }
        let mut end = start;
        for _ in 0..n {
            end += element.size(self.data, end, self.limit)?;
        }
        Ok(end - start)
    }

    /// Byte range of a list and of each of its elements.
    fn list_extent(&self, index: u16) -> Result<(Range<usize>, Vec<Range<usize>>)> {
        let Kind::List { element, .. } = &self.slot(index).kind else {
            return Err(Error::InvalidChain("not a list"));
        };
        let start = self.offset(index)?;
        let end = self.end_of(index)?;
        self.within_limit(end)?;
        let mut elements = Vec::new();
        let mut pos = start;
        while pos < end {
            let size = element.size(self.data, pos, end)?;
            elements.push(pos..pos + size);
            pos += size;
        }
        Ok((start..end, elements))
    }

    fn active(&self, variant: u16) -> Result<Alternative> {
        let slot = self.slot(variant);
        let Kind::Variant {
            discriminant,
            alternatives,
        } = &slot.kind
        else {
            return Err(Error::InvalidChain("not a variant"));
        };
        let key = self.raw(*discriminant)?;
        alternatives
            .iter()
            .find(|a| a.key == key)
            .copied()
            .ok_or(Error::VariantMisuse {
                field: slot.name,
                key,
            })
    }

    fn within_limit(&self, end: usize) -> Result<()> {
        if end > self.limit {
            return Err(Error::truncated(self.layout.name, end - self.begin, self.limit - self.begin));
        }
        Ok(())
    }

    /// Raw value of a scalar or TLV length field.
    fn raw(&self, index: u16) -> Result<u64> {
        let slot = self.slot(index);
        let bit = self.locate(index)?;
        match &slot.kind {
            Kind::Int { bytes, endian, .. } => {
                self.within_limit(bit / 8 + bytes)?;
                IntParser::new(bit / 8, *bytes, *endian).read(self.data)
            }
            Kind::Bits { width, .. } => {
                let parser = BitsParser::new(bit / 8, (bit % 8) as u32, *width);
                self.within_limit(bit / 8 + parser.container_bytes())?;
                parser.read(self.data)
            }
            Kind::TlvLength { max } => {
                let parser = TlvLengthParser::new(bit / 8, slot.name, *max);
                self.within_limit(bit / 8 + parser.bytes(self.data)?)?;
                Ok(parser.value(self.data)? as u64)
            }
            _ => Err(Error::InvalidChain("field has no scalar value")),
        }
    }
}

impl Layout {
    fn index(&self, field: FieldRef) -> Result<u16> {
        if field.layout != self.id || field.index as usize >= self.slots.len() {
            return Err(Error::FieldMismatch {
                field: "<foreign>",
                layout: self.name,
            });
        }
        Ok(field.index)
    }

    /// Size of the header in bytes, measured over `data[begin..limit]`.
    pub fn size(&self, data: &[u8], begin: usize, limit: usize) -> Result<usize> {
        let ev = Eval {
            layout: self,
            data,
            begin,
            limit: limit.min(data.len()),
        };
        let end = ev.bit_pos(self.end)? / 8;
        ev.within_limit(end)?;
        Ok(end - begin)
    }

    /// Absolute byte range of a field. Bitfields report the bytes that
    /// contain them.
    pub fn field_range<S: Storage>(&self, storage: &S, field: impl Into<FieldRef>) -> Result<Range<usize>> {
        let index = self.index(field.into())?;
        let ev = Eval::new(self, storage);
        let bit = ev.locate(index)?;
        let slot = ev.slot(index);
        let range = match &slot.kind {
            Kind::Bits { width, .. } => {
                let parser = BitsParser::new(bit / 8, (bit % 8) as u32, *width);
                bit / 8..bit / 8 + parser.container_bytes()
            }
            _ => {
                let size = ev.size(index, bit / 8)?;
                bit / 8..(bit / 8).checked_add(size).ok_or_else(|| ev.overflow())?
            }
        };
        ev.within_limit(range.end)?;
        Ok(range)
    }

    pub fn get<T: FieldValue, S: Storage>(&self, storage: &S, field: Field<T>) -> Result<T> {
        let index = self.index(field.erase())?;
        let ev = Eval::new(self, storage);
        let raw = ev.raw(index)?;
        let width = match ev.slot(index).kind {
            Kind::Int { bytes, .. } => bytes as u32 * 8,
            Kind::Bits { width, .. } => width,
            _ => return Err(Error::InvalidChain("field has no scalar value")),
        };
        Ok(T::from_raw(raw, width))
    }

    pub fn set<T: FieldValue, S: Storage>(&self, storage: &mut S, field: Field<T>, value: T) -> Result<()> {
        let index = self.index(field.erase())?;
        let slot = &self.slots[index as usize];
        let width = match slot.kind {
            Kind::Int { bytes, .. } => bytes as u32 * 8,
            Kind::Bits { width, .. } => width,
            _ => return Err(Error::InvalidChain("field has no scalar value")),
        };
        let (min, max) = (min_value(T::SIGNED, width), max_value(T::SIGNED, width));
        if value.as_i128() < min || value.as_i128() > max {
            return Err(Error::FieldRange {
                field: slot.name,
                value: value.as_i128(),
                min,
                max,
            });
        }
        self.write_raw(storage, index, value.into_raw())
    }

    fn write_raw<S: Storage>(&self, storage: &mut S, index: u16, raw: u64) -> Result<()> {
        let bit = {
            let ev = Eval::new(self, storage);
            let bit = ev.locate(index)?;
            let bytes = match self.slots[index as usize].kind {
                Kind::Int { bytes, .. } => bytes,
                Kind::Bits { width, .. } => {
                    BitsParser::new(bit / 8, (bit % 8) as u32, width).container_bytes()
                }
                _ => return Err(Error::InvalidChain("field has no scalar value")),
            };
            ev.within_limit(bit / 8 + bytes)?;
            bit
        };
        match self.slots[index as usize].kind {
            Kind::Int { bytes, endian, .. } => {
                IntParser::new(bit / 8, bytes, endian).write(storage.data_mut(), raw)
            }
            Kind::Bits { width, .. } => {
                BitsParser::new(bit / 8, (bit % 8) as u32, width).write(storage.data_mut(), raw)
            }
            _ => Err(Error::InvalidChain("field has no scalar value")),
        }
    }

    /// Unsigned value of a scalar or TLV length field.
    pub fn read_value<S: Storage>(&self, storage: &S, field: impl Into<FieldRef>) -> Result<u64> {
        let index = self.index(field.into())?;
        Eval::new(self, storage).raw(index)
    }

    /// Store an unsigned value into a scalar or TLV length field. TLV
    /// lengths grow as needed.
    pub fn write_value<S: Storage>(&self, storage: &mut S, field: impl Into<FieldRef>, value: u64) -> Result<()> {
        let index = self.index(field.into())?;
        self.check_value(index, value)?;
        match self.slots[index as usize].kind {
            Kind::TlvLength { .. } => self.tlv(storage, index)?.set_value(storage, value as u32),
            _ => self.write_raw(storage, index, value),
        }
    }

    fn check_value(&self, index: u16, value: u64) -> Result<()> {
        let slot = &self.slots[index as usize];
        let max = match slot.kind {
            Kind::Int { bytes, .. } => max_value(false, bytes as u32 * 8),
            Kind::Bits { width, .. } => max_value(false, width),
            Kind::TlvLength { max } => max as i128,
            _ => return Err(Error::InvalidChain("field has no scalar value")),
        };
        if value as i128 > max {
            return Err(Error::FieldRange {
                field: slot.name,
                value: value as i128,
                min: 0,
                max,
            });
        }
        Ok(())
    }

    pub fn octets<'s, S: Storage>(&self, storage: &'s S, field: Field<Octets>) -> Result<&'s [u8]> {
        let range = self.field_range(storage, field)?;
        Ok(&storage.data()[range])
    }

    pub fn set_octets<S: Storage>(&self, storage: &mut S, field: Field<Octets>, bytes: &[u8]) -> Result<()> {
        let range = self.field_range(storage, field)?;
        if range.len() != bytes.len() {
            return Err(Error::FieldRange {
                field: self.slots[field.index as usize].name,
                value: bytes.len() as i128,
                min: range.len() as i128,
                max: range.len() as i128,
            });
        }
        storage.data_mut()[range].copy_from_slice(bytes);
        Ok(())
    }

    fn vector_shape<S: Storage>(&self, storage: &S, field: Field<Vector>) -> Result<(Range<usize>, usize, Count)> {
        let range = self.field_range(storage, field)?;
        match self.slots[field.index as usize].kind {
            Kind::Vector { element, count } => Ok((range, element, count)),
            _ => Err(Error::InvalidChain("not a vector")),
        }
    }

    pub fn vector_len<S: Storage>(&self, storage: &S, field: Field<Vector>) -> Result<usize> {
        let (range, element, _) = self.vector_shape(storage, field)?;
        Ok(range.len() / element)
    }

    /// All bytes of the vector.
    pub fn vector_bytes<'s, S: Storage>(&self, storage: &'s S, field: Field<Vector>) -> Result<&'s [u8]> {
        let (range, _, _) = self.vector_shape(storage, field)?;
        Ok(&storage.data()[range])
    }

    pub fn vector_element<'s, S: Storage>(&self, storage: &'s S, field: Field<Vector>, i: usize) -> Result<&'s [u8]> {
        let (range, element, _) = self.vector_shape(storage, field)?;
        let at = self.element_range(field, &range, element, i)?;
        Ok(&storage.data()[at])
    }

    pub fn vector_set<S: Storage>(&self, storage: &mut S, field: Field<Vector>, i: usize, bytes: &[u8]) -> Result<()> {
        let (range, element, _) = self.vector_shape(storage, field)?;
        let at = self.element_range(field, &range, element, i)?;
        if bytes.len() != element {
            return Err(Error::FieldRange {
                field: self.slots[field.index as usize].name,
                value: bytes.len() as i128,
                min: element as i128,
                max: element as i128,
            });
        }
        storage.data_mut()[at].copy_from_slice(bytes);
        Ok(())
    }

    fn element_range(&self, field: Field<Vector>, range: &Range<usize>, element: usize, i: usize) -> Result<Range<usize>> {
        let len = range.len() / element;
        if i >= len {
            return Err(Error::FieldRange {
                field: self.slots[field.index as usize].name,
                value: i as i128,
                min: 0,
                max: len as i128 - 1,
            });
        }
        Ok(range.start + i * element..range.start + (i + 1) * element)
    }

    fn check_elements(&self, field: Field<Vector>, element: usize, bytes: &[u8]) -> Result<()> {
        if bytes.len() % element != 0 {
            return Err(Error::FieldRange {
                field: self.slots[field.index as usize].name,
                value: bytes.len() as i128,
                min: element as i128,
                max: element as i128,
            });
        }
        Ok(())
    }

    /// The value the count field of a vector or list takes for `elements`
    /// elements spanning `bytes` bytes.
    fn count_update(count: Count, elements: usize, bytes: usize) -> Option<(FieldRef, u64)> {
        match count {
            Count::Elements(source) => Some((source, elements as u64)),
            Count::Bytes(source) => Some((source, bytes as u64)),
            Count::Rest => None,
        }
    }

    /// Insert whole elements at index `i`, shifting everything behind them
    /// and updating the count field.
    pub fn vector_insert<S: Storage>(&self, storage: &mut S, field: Field<Vector>, i: usize, bytes: &[u8]) -> Result<()> {
        let (range, element, count) = self.vector_shape(storage, field)?;
        self.check_elements(field, element, bytes)?;
        let len = range.len() / element;
        if i > len {
            return Err(Error::FieldRange {
                field: self.slots[field.index as usize].name,
                value: i as i128,
                min: 0,
                max: len as i128,
            });
        }
        let elements = len + bytes.len() / element;
        let update = Self::count_update(count, elements, elements * element);
        if let Some((source, value)) = update {
            self.check_value(self.index(source)?, value)?;
        }
        let at = range.start + i * element;
        storage.insert_zeroed(at, bytes.len())?;
        storage.data_mut()[at..at + bytes.len()].copy_from_slice(bytes);
        match update {
            Some((source, value)) => self.write_value(storage, source, value),
            None => Ok(()),
        }
    }

    pub fn vector_push<S: Storage>(&self, storage: &mut S, field: Field<Vector>, bytes: &[u8]) -> Result<()> {
        let len = self.vector_len(storage, field)?;
        self.vector_insert(storage, field, len, bytes)
    }

    pub fn vector_remove<S: Storage>(&self, storage: &mut S, field: Field<Vector>, i: usize) -> Result<()> {
        let (range, element, count) = self.vector_shape(storage, field)?;
        let at = self.element_range(field, &range, element, i)?;
        storage.erase(at.start, element)?;
        let elements = range.len() / element - 1;
        match Self::count_update(count, elements, elements * element) {
            Some((source, value)) => self.write_value(storage, source, value),
            None => Ok(()),
        }
    }

    /// Replace the whole content of the vector.
    pub fn vector_assign<S: Storage>(&self, storage: &mut S, field: Field<Vector>, bytes: &[u8]) -> Result<()> {
        let (range, element, count) = self.vector_shape(storage, field)?;
        self.check_elements(field, element, bytes)?;
        let update = Self::count_update(count, bytes.len() / element, bytes.len());
        if let Some((source, value)) = update {
            self.check_value(self.index(source)?, value)?;
        }
        storage.erase(range.start, range.len())?;
        storage.insert_zeroed(range.start, bytes.len())?;
        storage.data_mut()[range.start..range.start + bytes.len()].copy_from_slice(bytes);
        match update {
            Some((source, value)) => self.write_value(storage, source, value),
            None => Ok(()),
        }
    }

    pub fn vector_clear<S: Storage>(&self, storage: &mut S, field: Field<Vector>) -> Result<()> {
        self.vector_assign(storage, field, &[])
    }

    /// Make the count field of a vector describe `bytes` bytes without
    /// touching the elements, after the bytes of the vector have been
    /// resized by other means.
    pub fn vector_fit<S: Storage>(&self, storage: &mut S, field: Field<Vector>, bytes: usize) -> Result<()> {
        let index = self.index(field.erase())?;
        let slot = &self.slots[index as usize];
        let Kind::Vector { element, count } = slot.kind else {
            return Err(Error::InvalidChain("not a vector"));
        };
        if bytes % element != 0 {
            return Err(Error::FieldRange {
                field: slot.name,
                value: bytes as i128,
                min: element as i128,
                max: element as i128,
            });
        }
        match Self::count_update(count, bytes / element, bytes) {
            Some((source, value)) => self.write_value(storage, source, value),
            None => Ok(()),
        }
    }

    fn list_kind(&self, field: Field<List>) -> Result<(u16, &'static Layout, Count)> {
        let index = self.index(field.erase())?;
        match self.slots[index as usize].kind {
            Kind::List { element, count } => Ok((index, element, count)),
            _ => Err(Error::InvalidChain("not a list")),
        }
    }

    fn nth(&self, index: u16, elements: &[Range<usize>], i: usize) -> Result<Range<usize>> {
        elements.get(i).cloned().ok_or(Error::FieldRange {
            field: self.slots[index as usize].name,
            value: i as i128,
            min: 0,
            max: elements.len() as i128 - 1,
        })
    }

    /// Byte ranges of the elements of a list, in order.
    pub fn list_ranges<S: Storage>(&self, storage: &S, field: Field<List>) -> Result<Vec<Range<usize>>> {
        let (index, _, _) = self.list_kind(field)?;
        Ok(Eval::new(self, storage).list_extent(index)?.1)
    }

    pub fn list_len<S: Storage>(&self, storage: &S, field: Field<List>) -> Result<usize> {
        Ok(self.list_ranges(storage, field)?.len())
    }

    pub fn list_element<'s, S: Storage>(&self, storage: &'s S, field: Field<List>, i: usize) -> Result<&'s [u8]> {
        let (index, _, _) = self.list_kind(field)?;
        let (_, elements) = Eval::new(self, storage).list_extent(index)?;
        let at = self.nth(index, &elements, i)?;
        Ok(&storage.data()[at])
    }

    /// Insert one encoded element at index `i`, shifting everything behind
    /// it and updating the count field.
    pub fn list_insert<S: Storage>(&self, storage: &mut S, field: Field<List>, i: usize, bytes: &[u8]) -> Result<()> {
        let (index, element, count) = self.list_kind(field)?;
        let (extent, elements) = Eval::new(self, storage).list_extent(index)?;
        if i > elements.len() {
            return Err(Error::FieldRange {
                field: self.slots[index as usize].name,
                value: i as i128,
                min: 0,
                max: elements.len() as i128,
            });
        }
        let size = element.size(bytes, 0, bytes.len())?;
        if size != bytes.len() {
            return Err(Error::FieldRange {
                field: element.name,
                value: bytes.len() as i128,
                min: size as i128,
                max: size as i128,
            });
        }
        let update = Self::count_update(count, elements.len() + 1, extent.len() + size);
        if let Some((source, value)) = update {
            self.check_value(self.index(source)?, value)?;
        }
        let at = elements.get(i).map_or(extent.end, |e| e.start);
        storage.insert_zeroed(at, size)?;
        storage.data_mut()[at..at + size].copy_from_slice(bytes);
        match update {
            Some((source, value)) => self.write_value(storage, source, value),
            None => Ok(()),
        }
    }

    pub fn list_push<S: Storage>(&self, storage: &mut S, field: Field<List>, bytes: &[u8]) -> Result<()> {
        let len = self.list_len(storage, field)?;
        self.list_insert(storage, field, len, bytes)
    }

    pub fn list_remove<S: Storage>(&self, storage: &mut S, field: Field<List>, i: usize) -> Result<()> {
        let (index, _, count) = self.list_kind(field)?;
        let (extent, elements) = Eval::new(self, storage).list_extent(index)?;
        let at = self.nth(index, &elements, i)?;
        storage.erase(at.start, at.len())?;
        match Self::count_update(count, elements.len() - 1, extent.len() - at.len()) {
            Some((source, value)) => self.write_value(storage, source, value),
            None => Ok(()),
        }
    }

    pub fn list_clear<S: Storage>(&self, storage: &mut S, field: Field<List>) -> Result<()> {
        let (index, _, count) = self.list_kind(field)?;
        let (extent, _) = Eval::new(self, storage).list_extent(index)?;
        storage.erase(extent.start, extent.len())?;
        match Self::count_update(count, 0, 0) {
            Some((source, value)) => self.write_value(storage, source, value),
            None => Ok(()),
        }
    }

    /// Run `f` with the element layout over a [`Window`] onto element `i`.
    /// If the element changes size the count field is updated.
    pub fn list_update<S: Storage, R>(
        &self,
        storage: &mut S,
        field: Field<List>,
        i: usize,
        f: impl FnOnce(&Layout, &mut Window<'_>) -> Result<R>,
    ) -> Result<R> {
        let (index, element, count) = self.list_kind(field)?;
        let (extent, elements) = Eval::new(self, storage).list_extent(index)?;
        let at = self.nth(index, &elements, i)?;
        let (result, end) = {
            let mut window = Window::new(storage, at.start, at.end);
            let result = f(element, &mut window);
            (result, window.limit())
        };
        if end != at.end {
            let bytes = (extent.end - at.end) + (end - extent.start);
            if let Some((source, value)) = Self::count_update(count, elements.len(), bytes) {
                self.write_value(storage, source, value)?;
            }
        }
        result
    }

    /// Discriminant value of the active alternative.
    pub fn variant_key<S: Storage>(&self, storage: &S, field: Field<Variant>) -> Result<u64> {
        let index = self.index(field.erase())?;
        Ok(Eval::new(self, storage).active(index)?.key)
    }

    /// Switch to the alternative selected by `key`. The bytes of the
    /// previous alternative are removed and the new alternative is
    /// zero-filled, so the header shrinks or grows to fit.
    pub fn init_variant<S: Storage>(&self, storage: &mut S, field: Field<Variant>, key: u64) -> Result<()> {
        let index = self.index(field.erase())?;
        let slot = &self.slots[index as usize];
        let Kind::Variant {
            discriminant,
            alternatives,
        } = &slot.kind
        else {
            return Err(Error::InvalidChain("not a variant"));
        };
        let next = alternatives
            .iter()
            .find(|a| a.key == key)
            .ok_or(Error::VariantMisuse {
                field: slot.name,
                key,
            })?;
        self.check_value(*discriminant, key)?;
        let (start, current) = {
            let ev = Eval::new(self, storage);
            let start = ev.offset(index)?;
            // An undefined discriminant leaves no bytes we could account for.
            let current = ev.active(index).map_or(0, |a| a.bytes);
            (start, current)
        };
        storage.erase(start, current)?;
        storage.insert_zeroed(start, next.bytes)?;
        self.write_raw(storage, *discriminant, key)
    }

    fn tlv<S: Storage>(&self, storage: &S, index: u16) -> Result<TlvLengthParser> {
        let slot = &self.slots[index as usize];
        let Kind::TlvLength { max } = slot.kind else {
            return Err(Error::InvalidChain("not a TLV length"));
        };
        let offset = Eval::new(self, storage).offset(index)?;
        Ok(TlvLengthParser::new(offset, slot.name, max))
    }

    pub fn tlv_value<S: Storage>(&self, storage: &S, field: Field<TlvLength>) -> Result<u32> {
        let index = self.index(field.erase())?;
        Ok(Eval::new(self, storage).raw(index)? as u32)
    }

    /// Encode a new length value, growing the field when needed.
    pub fn set_tlv_value<S: Storage>(&self, storage: &mut S, field: Field<TlvLength>, value: u32) -> Result<()> {
        let index = self.index(field.erase())?;
        self.tlv(storage, index)?.set_value(storage, value)
    }

    /// Shrink the field to the minimal encoding of its value.
    pub fn finalize_tlv<S: Storage>(&self, storage: &mut S, field: Field<TlvLength>) -> Result<()> {
        let index = self.index(field.erase())?;
        self.tlv(storage, index)?.finalize(storage)
    }

    /// Pre-reserve room for values up to `value`.
    pub fn reserve_tlv<S: Storage>(&self, storage: &mut S, field: Field<TlvLength>, value: u32) -> Result<()> {
        let index = self.index(field.erase())?;
        self.tlv(storage, index)?.reserve(storage, value)
    }

    /// Encoded size of the field in bytes.
    pub fn tlv_bytes<S: Storage>(&self, storage: &S, field: Field<TlvLength>) -> Result<usize> {
        let index = self.index(field.erase())?;
        self.tlv(storage, index)?.bytes(storage.data())
    }

    pub fn tlv_capacity<S: Storage>(&self, storage: &S, field: Field<TlvLength>) -> Result<u32> {
        let index = self.index(field.erase())?;
        self.tlv(storage, index)?.capacity(storage.data())
    }

    /// Write the discriminant of the first alternative of every variant.
    pub fn init_variants<S: Storage>(&self, storage: &mut S) -> Result<()> {
        for slot in self.slots.iter() {
            if let Kind::Variant {
                discriminant,
                alternatives,
            } = &slot.kind
            {
                if let Some(first) = alternatives.first() {
                    self.write_raw(storage, *discriminant, first.key)?;
                }
            }
        }
        Ok(())
    }

    /// Re-encode every TLV length in minimal form, including the ones of
    /// list elements.
    pub fn finalize_lengths<S: Storage>(&self, storage: &mut S) -> Result<()> {
        for (index, slot) in self.slots.iter().enumerate() {
            if let Kind::List { .. } = slot.kind {
                let field = Field::<List>::new(self.id, index);
                for i in 0..self.list_len(storage, field)? {
                    self.list_update(storage, field, i, |element, window| {
                        element.finalize_lengths(window)
                    })?;
                }
            }
        }
        for (index, slot) in self.slots.iter().enumerate() {
            if let Kind::TlvLength { max } = slot.kind {
                if slot.overlay {
                    continue;
                }
                let offset = Eval::new(self, storage).offset(index as u16)?;
                TlvLengthParser::new(offset, slot.name, max).finalize(storage)?;
            }
        }
        Ok(())
    }

    /// Write one line per field. Fields of inactive alternatives are
    /// skipped, unreadable fields are reported inline.
    pub fn dump<S: Storage>(&self, storage: &S, w: &mut dyn io::Write, indent: usize) -> io::Result<()> {
        let ev = Eval::new(self, storage);
        for (index, slot) in self.slots.iter().enumerate() {
            let index = index as u16;
            if let Some((variant, alternative)) = slot.alternative {
                let active = ev.active(variant).ok();
                let expected = match &ev.slot(variant).kind {
                    Kind::Variant { alternatives, .. } => alternatives.get(alternative).map(|a| a.key),
                    _ => None,
                };
                if active.map(|a| a.key) != expected {
                    continue;
                }
            }
            write!(w, "{:indent$}{:<24}: ", "", slot.name, indent = indent)?;
            if let Kind::List { element, .. } = &slot.kind {
                match ev.list_extent(index) {
                    Ok((_, elements)) => {
                        writeln!(w, "{} elements", elements.len())?;
                        for (i, at) in elements.into_iter().enumerate() {
                            writeln!(w, "{:indent$}[{i}] {}", "", element.name, indent = indent + 2)?;
                            element.dump(&ev.data[at].to_vec(), w, indent + 4)?;
                        }
                    }
                    Err(err) => writeln!(w, "<{err}>")?,
                }
                continue;
            }
            let line = match &slot.kind {
                Kind::Int { bytes, signed, .. } => ev.raw(index).map(|raw| {
                    if *signed {
                        format!("{}", i64::from_raw(raw, *bytes as u32 * 8))
                    } else {
                        format!("{raw} ({raw:#x})")
                    }
                }),
                Kind::Bits { width, signed } => ev.raw(index).map(|raw| {
                    if *signed {
                        format!("{}", i64::from_raw(raw, *width))
                    } else {
                        format!("{raw:#x}")
                    }
                }),
                Kind::TlvLength { .. } => ev.raw(index).map(|raw| format!("{raw}")),
                Kind::Variant { .. } => ev.active(index).map(|a| format!("alternative {}", a.key)),
                Kind::Octets { .. } | Kind::Vector { .. } | Kind::List { .. } => ev.offset(index).and_then(|start| {
                    let end = ev.end_of(index)?;
                    ev.within_limit(end)?;
                    Ok(format!("{}", HexDump::new(&ev.data[start..end]).indent(indent + 2)))
                }),
            };
            match line {
                Ok(line) if line.contains('\n') => writeln!(w, "\n{line}")?,
                Ok(line) => writeln!(w, "{line}")?,
                Err(err) => writeln!(w, "<{err}>")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::LazyLock;

    use super::*;
    use crate::parse::{Endian, LayoutBuilder};

    struct Tlv {
        layout: Layout,
        kind: Field<u8>,
        length: Field<TlvLength>,
        value: Field<Vector>,
    }

    fn tlv() -> Tlv {
        let mut b = LayoutBuilder::new("tlv");
        let kind = b.uint::<u8>("type").unwrap();
        let length = b.tlv_length("length", u32::MAX).unwrap();
        let value = b.vector("value", 1, Count::Bytes(length.erase())).unwrap();
        Tlv {
            layout: b.build().unwrap(),
            kind,
            length,
            value,
        }
    }

    static TLV: LazyLock<Tlv> = LazyLock::new(tlv);

    #[test]
    fn test_tlv_fixture() {
        let t = tlv();
        let mut buf = vec![0x01, 0x0a, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        assert_eq!(t.layout.get(&buf, t.kind).unwrap(), 1);
        assert_eq!(t.layout.tlv_value(&buf, t.length).unwrap(), 10);
        assert_eq!(
            t.layout.vector_bytes(&buf, t.value).unwrap(),
            &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]
        );
        assert_eq!(t.layout.size(&buf, 0, buf.len()).unwrap(), 12);

        t.layout.vector_push(&mut buf, t.value, &[10]).unwrap();
        assert_eq!(t.layout.tlv_value(&buf, t.length).unwrap(), 11);
        assert_eq!(buf.len(), 13);
    }

    #[test]
    fn test_tlv_length_growth_shifts_value() {
        let t = tlv();
        let mut buf = vec![0x2a, 0x00];
        let value: Vec<u8> = (0..128).collect();
        t.layout.vector_assign(&mut buf, t.value, &value[..127]).unwrap();
        assert_eq!(t.layout.tlv_bytes(&buf, t.length).unwrap(), 1);
        assert_eq!(buf[2], 0);

        t.layout.vector_push(&mut buf, t.value, &[127]).unwrap();
        assert_eq!(t.layout.tlv_bytes(&buf, t.length).unwrap(), 2);
        assert_eq!(&buf[..4], &[0x2a, 0x81, 0x00, 0x00]);
        assert_eq!(t.layout.vector_bytes(&buf, t.value).unwrap(), &value[..]);

        t.layout.vector_remove(&mut buf, t.value, 127).unwrap();
        assert_eq!(t.layout.tlv_bytes(&buf, t.length).unwrap(), 2);
        t.layout.finalize_lengths(&mut buf).unwrap();
        assert_eq!(t.layout.tlv_bytes(&buf, t.length).unwrap(), 1);
        assert_eq!(&buf[..3], &[0x2a, 0x7f, 0x00]);
        assert_eq!(buf.len(), 129);
    }

    #[test]
    fn test_truncated_vector() {
        let t = tlv();
        let buf = vec![0x01, 0x0a, 0, 1, 2];
        assert!(matches!(
            t.layout.vector_bytes(&buf, t.value),
            Err(Error::TruncatedData { .. })
        ));
        assert!(t.layout.size(&buf, 0, buf.len()).is_err());
    }

    #[test]
    fn test_oversized_count() {
        let mut b = LayoutBuilder::new("counted");
        let count = b.uint::<u64>("count").unwrap();
        let items = b.vector("items", 8, Count::Elements(count.erase())).unwrap();
        let layout = b.build().unwrap();
        let buf = vec![0x20, 0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3];
        assert!(matches!(
            layout.size(&buf, 0, buf.len()),
            Err(Error::TruncatedData { .. })
        ));
        assert!(layout.vector_len(&buf, items).is_err());

        let mut b = LayoutBuilder::new("extent");
        let extent = b.uint::<u64>("extent").unwrap();
        b.vector("bytes", 1, Count::Bytes(extent.erase())).unwrap();
        let tail = b.uint::<u8>("tail").unwrap();
        let layout = b.build().unwrap();
        let buf = vec![0xff; 10];
        assert!(matches!(
            layout.size(&buf, 0, buf.len()),
            Err(Error::TruncatedData { .. })
        ));
        assert!(matches!(layout.get(&buf, tail), Err(Error::TruncatedData { .. })));
    }

    struct Options {
        layout: Layout,
        options: Field<List>,
        trailer: Field<u8>,
    }

    /// One byte extent, TLV options, one trailer byte.
    fn options() -> Options {
        let mut b = LayoutBuilder::new("options");
        let length = b.uint::<u8>("length").unwrap();
        let options = b.list("options", &TLV.layout, Count::Bytes(length.erase())).unwrap();
        let trailer = b.uint::<u8>("trailer").unwrap();
        Options {
            layout: b.build().unwrap(),
            options,
            trailer,
        }
    }

    #[test]
    fn test_list_of_tlvs() {
        let o = options();
        let mut buf = vec![0x05, 0x01, 0x01, 0xaa, 0x02, 0x00, 0xee];
        assert_eq!(o.layout.list_len(&buf, o.options).unwrap(), 2);
        assert_eq!(o.layout.list_ranges(&buf, o.options).unwrap(), [1..4, 4..6]);
        assert_eq!(o.layout.list_element(&buf, o.options, 1).unwrap(), &[0x02, 0x00]);
        assert_eq!(o.layout.get(&buf, o.trailer).unwrap(), 0xee);

        o.layout.list_push(&mut buf, o.options, &[0x03, 0x01, 0xbb]).unwrap();
        assert_eq!(buf, [0x08, 0x01, 0x01, 0xaa, 0x02, 0x00, 0x03, 0x01, 0xbb, 0xee]);

        // Growing one element moves the following ones and the extent.
        o.layout
            .list_update(&mut buf, o.options, 1, |l, w| l.vector_push(w, TLV.value, &[0xcc]))
            .unwrap();
        assert_eq!(
            buf,
            [0x09, 0x01, 0x01, 0xaa, 0x02, 0x01, 0xcc, 0x03, 0x01, 0xbb, 0xee]
        );
        let kind = o
            .layout
            .list_update(&mut buf, o.options, 2, |l, w| l.get(&*w, TLV.kind))
            .unwrap();
        assert_eq!(kind, 3);

        o.layout.list_remove(&mut buf, o.options, 0).unwrap();
        assert_eq!(buf, [0x06, 0x02, 0x01, 0xcc, 0x03, 0x01, 0xbb, 0xee]);
        assert_eq!(o.layout.get(&buf, o.trailer).unwrap(), 0xee);

        o.layout.list_clear(&mut buf, o.options).unwrap();
        assert_eq!(buf, [0x00, 0xee]);
        assert_eq!(o.layout.list_len(&buf, o.options).unwrap(), 0);
    }

    #[test]
    fn test_list_rejects_bad_elements() {
        let o = options();
        let mut buf = vec![0x02, 0x01, 0x00, 0xee];
        assert!(matches!(
            o.layout.list_insert(&mut buf, o.options, 2, &[0x01, 0x00]),
            Err(Error::FieldRange { value: 2, .. })
        ));
        assert!(matches!(
            o.layout.list_push(&mut buf, o.options, &[0x01, 0x02, 0xaa]),
            Err(Error::TruncatedData { .. })
        ));
        assert!(matches!(
            o.layout.list_push(&mut buf, o.options, &[0x01, 0x00, 0xff]),
            Err(Error::FieldRange { .. })
        ));
        assert_eq!(buf, [0x02, 0x01, 0x00, 0xee]);

        // An extent ending inside an element.
        let buf = vec![0x03, 0x01, 0x02, 0xaa, 0xbb, 0xee];
        assert!(matches!(
            o.layout.list_len(&buf, o.options),
            Err(Error::TruncatedData { .. })
        ));
    }

    #[test]
    fn test_counted_list_finalize() {
        let mut b = LayoutBuilder::new("counted");
        let count = b.uint::<u8>("count").unwrap();
        let items = b.list("items", &TLV.layout, Count::Elements(count.erase())).unwrap();
        let layout = b.build().unwrap();

        let mut buf = vec![0x01, 0x07, 0xc1, 0x02, 0xaa, 0xbb];
        assert_eq!(layout.size(&buf, 0, buf.len()).unwrap(), 6);
        layout.finalize_lengths(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x07, 0x02, 0xaa, 0xbb]);

        layout.list_push(&mut buf, items, &[0x08, 0x00]).unwrap();
        assert_eq!(buf, [0x02, 0x07, 0x02, 0xaa, 0xbb, 0x08, 0x00]);
        assert_eq!(layout.list_len(&buf, items).unwrap(), 2);

        let mut out = Vec::new();
        layout.dump(&buf, &mut out, 0).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("2 elements"));
        assert!(out.contains("[1] tlv"));

        // More elements than bytes could ever hold.
        let buf = vec![0xff, 0x07, 0x00];
        assert!(matches!(
            layout.size(&buf, 0, buf.len()),
            Err(Error::TruncatedData { .. })
        ));
    }

    struct Bits {
        layout: Layout,
        signed: Field<i8>,
        flag: Field<bool>,
        wide: Field<u16>,
        word: Field<u32>,
    }

    fn bits() -> Bits {
        let mut b = LayoutBuilder::new("bits");
        let signed = b.bits::<i8>("signed", 4).unwrap();
        let flag = b.flag("flag").unwrap();
        let wide = b.bits::<u16>("wide", 11).unwrap();
        let word = b.integer::<u32>("word", 3, Endian::Little).unwrap();
        Bits {
            layout: b.build().unwrap(),
            signed,
            flag,
            wide,
            word,
        }
    }

    #[test]
    fn test_signed_bitfield_bounds() {
        let b = bits();
        let mut buf = vec![0u8; 5];
        for v in -8..=7 {
            b.layout.set(&mut buf, b.signed, v).unwrap();
            assert_eq!(b.layout.get(&buf, b.signed).unwrap(), v);
        }
        assert!(matches!(
            b.layout.set(&mut buf, b.signed, 8),
            Err(Error::FieldRange { min: -8, max: 7, .. })
        ));
        assert!(b.layout.set(&mut buf, b.signed, -9).is_err());
    }

    #[test]
    fn test_neighbors_untouched() {
        let b = bits();
        let mut buf = vec![0u8; 5];
        b.layout.set(&mut buf, b.wide, 0x7ff).unwrap();
        b.layout.set(&mut buf, b.flag, true).unwrap();
        b.layout.set(&mut buf, b.signed, -1).unwrap();
        assert_eq!(&buf[..2], &[0xff, 0xff]);
        b.layout.set(&mut buf, b.flag, false).unwrap();
        assert_eq!(&buf[..2], &[0xf7, 0xff]);
        assert_eq!(b.layout.get(&buf, b.wide).unwrap(), 0x7ff);
        assert_eq!(b.layout.get(&buf, b.signed).unwrap(), -1);
        assert!(b.layout.set(&mut buf, b.wide, 0x800).is_err());
    }

    #[test]
    fn test_partial_width_integer() {
        let b = bits();
        let mut buf = vec![0u8; 5];
        b.layout.set(&mut buf, b.word, 0xabcdef).unwrap();
        assert_eq!(&buf[2..], &[0xef, 0xcd, 0xab]);
        assert!(matches!(
            b.layout.set(&mut buf, b.word, 0x100_0000),
            Err(Error::FieldRange { .. })
        ));
    }

    #[test]
    fn test_variant_switch() {
        let mut b = LayoutBuilder::new("opt");
        let present = b.flag("present").unwrap();
        b.skip_bits(7).unwrap();
        let opt = b.variant("opt", present).unwrap();
        b.alternative(opt, 0).unwrap();
        b.alternative(opt, 1).unwrap();
        let checksum = b.uint::<u16>("checksum").unwrap();
        b.end_variant(opt).unwrap();
        let tail = b.uint::<u8>("tail").unwrap();
        let layout = b.build().unwrap();

        let mut buf = vec![0x00, 0x55];
        assert_eq!(layout.variant_key(&buf, opt).unwrap(), 0);
        assert_eq!(layout.get(&buf, tail).unwrap(), 0x55);
        assert!(matches!(
            layout.get(&buf, checksum),
            Err(Error::VariantMisuse { key: 1, .. })
        ));

        layout.init_variant(&mut buf, opt, 1).unwrap();
        assert_eq!(buf, [0x80, 0x00, 0x00, 0x55]);
        layout.set(&mut buf, checksum, 0xbeef).unwrap();
        assert_eq!(layout.size(&buf, 0, buf.len()).unwrap(), 4);

        layout.init_variant(&mut buf, opt, 0).unwrap();
        assert_eq!(buf, [0x00, 0x55]);
        assert!(matches!(
            layout.init_variant(&mut buf, opt, 7),
            Err(Error::VariantMisuse { key: 7, .. })
        ));
    }

    #[test]
    fn test_foreign_field() {
        let a = tlv();
        let b = tlv();
        let buf = vec![0x01, 0x00];
        assert!(matches!(
            a.layout.get(&buf, b.kind),
            Err(Error::FieldMismatch { .. })
        ));
    }

    #[test]
    fn test_dump() {
        let t = tlv();
        let buf = vec![0x01, 0x03, 0xaa, 0xbb, 0xcc];
        let mut out = Vec::new();
        t.layout.dump(&buf, &mut out, 2).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("type"));
        assert!(out.contains("1 (0x1)"));
        assert!(out.contains("aabbcc"));
    }
}
