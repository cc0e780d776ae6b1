//! The byte arena backing one packet chain.
//!
//! All interpreters of a chain look into one contiguous, resizable byte
//! buffer. Interpreters never hold addresses into it. Instead the arena
//! keeps a table of live [`Span`]s, addressed by [`SpanId`], and renumbers
//! every span whenever bytes are inserted or erased. Positions held in that
//! table therefore stay valid across reallocation and across shifts caused
//! by mutations anywhere else in the buffer.

use core::ops::Range;

use crate::{Error, Result};

/// Handle onto a span tracked by a [`ByteArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u32);

/// A half-open byte range `[begin, end)` into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub struct Span {
    pub begin: usize,
    pub end: usize,
}

impl Span {
    pub const fn new(begin: usize, end: usize) -> Self {
        Self { begin, end }
    }

    /// A zero-width span, used to track a single position.
    pub const fn at(pos: usize) -> Self {
        Self {
            begin: pos,
            end: pos,
        }
    }

    pub const fn len(&self) -> usize {
        self.end - self.begin
    }

    pub const fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub const fn range(&self) -> Range<usize> {
        self.begin..self.end
    }

    /// Whether `other` lies completely inside this span.
    pub const fn covers(&self, other: &Span) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }
}

/// An owned byte buffer with a table of tracked spans.
#[derive(Debug, Clone, Default)]
pub struct ByteArena {
    bytes: Vec<u8>,
    spans: Vec<Option<Span>>,
    free: Vec<u32>,
}

impl ByteArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an arena holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            ..Self::default()
        }
    }

    /// Create an arena of `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Borrow `[begin, end)`.
    pub fn slice(&self, begin: usize, end: usize) -> Result<&[u8]> {
        self.check_range(begin, end)?;
        Ok(&self.bytes[begin..end])
    }

    /// Mutably borrow `[begin, end)`.
    pub fn slice_mut(&mut self, begin: usize, end: usize) -> Result<&mut [u8]> {
        self.check_range(begin, end)?;
        Ok(&mut self.bytes[begin..end])
    }

    fn check_range(&self, begin: usize, end: usize) -> Result<()> {
        if begin > end || end > self.bytes.len() {
            return Err(Error::truncated("arena", end, self.bytes.len()));
        }
        Ok(())
    }

    /// Start tracking `span`. The span is renumbered by every subsequent
    /// insert and erase until it is released with [`ByteArena::untrack`].
    pub fn track(&mut self, span: Span) -> SpanId {
        debug_assert!(span.begin <= span.end && span.end <= self.bytes.len());
        match self.free.pop() {
            Some(slot) => {
                self.spans[slot as usize] = Some(span);
                SpanId(slot)
            }
            None => {
                self.spans.push(Some(span));
                SpanId(self.spans.len() as u32 - 1)
            }
        }
    }

    pub fn untrack(&mut self, id: SpanId) {
        if let Some(slot) = self.spans.get_mut(id.0 as usize) {
            if slot.take().is_some() {
                self.free.push(id.0);
            }
        }
    }

    /// The current position of a tracked span.
    pub fn span(&self, id: SpanId) -> Result<Span> {
        self.spans
            .get(id.0 as usize)
            .copied()
            .flatten()
            .ok_or(Error::InvalidChain("span is no longer tracked"))
    }

    /// Move a tracked span. Used when ownership of bytes passes from one
    /// interpreter to its neighbor without the buffer changing.
    pub fn set_span(&mut self, id: SpanId, span: Span) -> Result<()> {
        self.check_range(span.begin, span.end)?;
        match self.spans.get_mut(id.0 as usize) {
            Some(Some(slot)) => {
                *slot = span;
                Ok(())
            }
            _ => Err(Error::InvalidChain("span is no longer tracked")),
        }
    }

    /// Iterate all tracked spans.
    pub fn spans(&self) -> impl Iterator<Item = (SpanId, Span)> + '_ {
        self.spans
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|s| (SpanId(i as u32), s)))
    }

    /// Insert `data` at `pos`.
    ///
    /// `owners` names the spans the inserted bytes belong to: an owner whose
    /// end equals `pos` grows, while any other span beginning at `pos` is
    /// shifted behind the new bytes.
    pub fn insert(&mut self, pos: usize, data: &[u8], owners: &[SpanId]) -> Result<()> {
        if pos > self.bytes.len() {
            return Err(Error::truncated("arena", pos, self.bytes.len()));
        }
        self.bytes.splice(pos..pos, data.iter().copied());
        self.shift(pos, data.len(), owners);
        Ok(())
    }

    /// Insert `len` zero bytes at `pos`, see [`ByteArena::insert`].
    pub fn insert_zeroed(&mut self, pos: usize, len: usize, owners: &[SpanId]) -> Result<()> {
        if pos > self.bytes.len() {
            return Err(Error::truncated("arena", pos, self.bytes.len()));
        }
        self.bytes.splice(pos..pos, core::iter::repeat(0).take(len));
        self.shift(pos, len, owners);
        Ok(())
    }

    fn shift(&mut self, pos: usize, len: usize, owners: &[SpanId]) {
        if len == 0 {
            return;
        }
        pktchain_util::trace!("arena: insert {} bytes at {}", len, pos);
        for (i, slot) in self.spans.iter_mut().enumerate() {
            let Some(span) = slot else { continue };
            let owner = owners.contains(&SpanId(i as u32));
            let (shifted, grown) = if owner {
                (span.begin > pos, span.end >= pos)
            } else {
                (span.begin >= pos, span.end > pos)
            };
            if shifted {
                span.begin += len;
                span.end += len;
            } else if grown {
                span.end += len;
            }
        }
    }

    /// Erase `len` bytes starting at `pos`.
    ///
    /// Spans behind the erased region move down, spans straddling it shrink
    /// and spans lying completely inside it collapse to `pos`.
    pub fn erase(&mut self, pos: usize, len: usize) -> Result<()> {
        self.check_range(pos, pos + len)?;
        if len == 0 {
            return Ok(());
        }
        pktchain_util::trace!("arena: erase {} bytes at {}", len, pos);
        self.bytes.drain(pos..pos + len);
        let clamp = |x: usize| {
            if x <= pos {
                x
            } else if x >= pos + len {
                x - len
            } else {
                pos
            }
        };
        for span in self.spans.iter_mut().flatten() {
            span.begin = clamp(span.begin);
            span.end = clamp(span.end);
        }
        Ok(())
    }

    /// Grow or shrink the buffer at its end.
    pub fn resize(&mut self, len: usize, owners: &[SpanId]) -> Result<()> {
        let current = self.bytes.len();
        if len > current {
            self.insert_zeroed(current, len - current, owners)
        } else {
            self.erase(len, current - len)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn siblings() -> (ByteArena, SpanId, SpanId, SpanId) {
        let mut arena = ByteArena::from_bytes(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        let a = arena.track(Span::new(0, 4));
        let b = arena.track(Span::new(4, 8));
        let c = arena.track(Span::new(8, 12));
        (arena, a, b, c)
    }

    #[test]
    fn test_insert_shifts_following_spans() {
        let (mut arena, a, b, c) = siblings();
        arena.insert(5, &[0xaa, 0xbb], &[b]).unwrap();
        assert_eq!(arena.span(a).unwrap(), Span::new(0, 4));
        assert_eq!(arena.span(b).unwrap(), Span::new(4, 10));
        assert_eq!(arena.span(c).unwrap(), Span::new(10, 14));
        assert_eq!(&arena.as_slice()[4..8], &[4, 0xaa, 0xbb, 5]);
    }

    #[test]
    fn test_insert_at_shared_boundary() {
        let (mut arena, a, b, c) = siblings();
        arena.insert_zeroed(4, 2, &[a]).unwrap();
        assert_eq!(arena.span(a).unwrap(), Span::new(0, 6));
        assert_eq!(arena.span(b).unwrap(), Span::new(6, 10));
        assert_eq!(arena.span(c).unwrap(), Span::new(10, 14));

        let (mut arena, a, b, c) = siblings();
        arena.insert_zeroed(4, 2, &[b]).unwrap();
        assert_eq!(arena.span(a).unwrap(), Span::new(0, 4));
        assert_eq!(arena.span(b).unwrap(), Span::new(4, 10));
        assert_eq!(arena.span(c).unwrap(), Span::new(10, 14));
    }

    #[test]
    fn test_insert_grows_enclosing_span() {
        let (mut arena, _, b, c) = siblings();
        let outer = arena.track(Span::new(0, 12));
        arena.insert_zeroed(12, 3, &[c, outer]).unwrap();
        assert_eq!(arena.span(outer).unwrap(), Span::new(0, 15));
        assert_eq!(arena.span(c).unwrap(), Span::new(8, 15));
        assert_eq!(arena.span(b).unwrap(), Span::new(4, 8));
    }

    #[test]
    fn test_erase_clamps_spans() {
        let (mut arena, a, b, c) = siblings();
        arena.erase(2, 4).unwrap();
        assert_eq!(arena.len(), 8);
        assert_eq!(arena.span(a).unwrap(), Span::new(0, 2));
        assert_eq!(arena.span(b).unwrap(), Span::new(2, 4));
        assert_eq!(arena.span(c).unwrap(), Span::new(4, 8));
        assert_eq!(arena.as_slice(), &[0, 1, 6, 7, 8, 9, 10, 11]);

        arena.erase(2, 2).unwrap();
        assert_eq!(arena.span(b).unwrap(), Span::at(2));
        assert_eq!(arena.span(c).unwrap(), Span::new(2, 6));
    }

    #[test]
    fn test_tracked_position() {
        let mut arena = ByteArena::zeroed(8);
        let cursor = arena.track(Span::at(4));
        arena.insert(2, &[1, 2, 3], &[]).unwrap();
        assert_eq!(arena.span(cursor).unwrap(), Span::at(7));
        arena.insert(7, &[9], &[]).unwrap();
        assert_eq!(arena.span(cursor).unwrap(), Span::at(8));
        arena.erase(0, 8).unwrap();
        assert_eq!(arena.span(cursor).unwrap(), Span::at(0));
    }

    #[test]
    fn test_untrack_reuses_slot() {
        let mut arena = ByteArena::zeroed(4);
        let a = arena.track(Span::new(0, 2));
        arena.untrack(a);
        assert!(arena.span(a).is_err());
        let b = arena.track(Span::new(1, 3));
        assert_eq!(a, b);
        assert_eq!(arena.spans().count(), 1);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut arena = ByteArena::zeroed(4);
        assert!(matches!(
            arena.insert(5, &[0], &[]),
            Err(Error::TruncatedData { .. })
        ));
        assert!(arena.erase(3, 2).is_err());
        assert!(arena.slice(2, 6).is_err());
        assert_eq!(arena.slice(1, 3).unwrap(), &[0, 0]);
    }

    #[test]
    fn test_resize() {
        let mut arena = ByteArena::from_bytes(&[1, 2, 3]);
        let all = arena.track(Span::new(0, 3));
        arena.resize(5, &[all]).unwrap();
        assert_eq!(arena.as_slice(), &[1, 2, 3, 0, 0]);
        assert_eq!(arena.span(all).unwrap(), Span::new(0, 5));
        arena.resize(1, &[]).unwrap();
        assert_eq!(arena.span(all).unwrap(), Span::new(0, 1));
    }
}
