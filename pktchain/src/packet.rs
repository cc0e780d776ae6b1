//! Handles onto interpreters of a packet chain.
//!
//! A [`Packet`] is a cheap, reference counted handle onto one interpreter of
//! a chain. [`Packet::share`] hands out another handle onto the same
//! interpreter, while [`Clone`] copies the whole chain, bytes and
//! interpreters, so the clone can be mutated independently.
//!
//! Layers after the first are derived lazily: [`Packet::next`] asks the
//! type of the current interpreter for the payload range and the type of
//! the following layer the first time it is called.
//!
//! Every handle of a chain also sees the chain's [`Annotation`]s.

use core::any::TypeId;
use core::fmt;
use core::ops::Range;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::io;
use std::rc::Rc;

use crate::annotation::Annotation;
use crate::arena::{ByteArena, Span, SpanId};
use crate::chain::{Chain, NodeId, NodeStorage, ROOT};
use crate::interpreter::{type_key, Factory, NextType, PacketType, DATA};
use crate::parse::{Field, FieldRef, FieldValue, Layout, List, Octets, TlvLength, Variant, Vector, Window};
use crate::registry::{Namespace, Registry};
use crate::{Error, Result};

/// Whether a new header is handed to the type's init hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum InitPolicy {
    /// Zero-fill and run [`PacketType::init`].
    #[default]
    Zeroed,
    /// Zero-fill only.
    NoInit,
}

/// Where [`Packet::insert`] places the new layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum Position {
    Before,
    After,
}

/// Initial bytes of an inserted layer.
#[derive(Debug, Clone, Copy)]
pub enum Content<'a> {
    /// A default header, see [`InitPolicy::Zeroed`].
    Init,
    /// Copy of existing header bytes, optionally followed by payload.
    Bytes(&'a [u8]),
}

/// A chain plus the cursor spans dropped while it was borrowed. Those are
/// untracked by the next mutable borrow.
struct Shared {
    chain: RefCell<Chain>,
    released: Cell<Vec<SpanId>>,
}

impl Shared {
    fn new(chain: Chain) -> Rc<Self> {
        Rc::new(Self {
            chain: RefCell::new(chain),
            released: Cell::new(Vec::new()),
        })
    }

    fn borrow(&self) -> Ref<'_, Chain> {
        self.chain.borrow()
    }

    fn borrow_mut(&self) -> RefMut<'_, Chain> {
        let mut chain = self.chain.borrow_mut();
        for span in self.released.take() {
            chain.arena.untrack(span);
        }
        chain
    }

    fn release(&self, span: SpanId) {
        match self.chain.try_borrow_mut() {
            Ok(mut chain) => chain.arena.untrack(span),
            Err(_) => {
                pktchain_util::warn!("cursor: chain borrowed, position released on next mutation");
                let mut released = self.released.take();
                released.push(span);
                self.released.set(released);
            }
        }
    }
}

/// Header bytes of a new layer of type `ty` and the size of its header.
fn layer_bytes(ty: Factory, content: Content<'_>) -> Result<(Vec<u8>, usize)> {
    Ok(match content {
        Content::Init => {
            let header = ty.layout().init_bytes();
            (vec![0; header], header)
        }
        Content::Bytes(bytes) => (bytes.to_vec(), ty.layout().size(bytes, 0, bytes.len())?),
    })
}

/// Handle onto one interpreter of a chain.
pub struct Packet {
    chain: Rc<Shared>,
    node: NodeId,
}

impl Packet {
    fn wrap(chain: Chain, node: NodeId) -> Self {
        Self {
            chain: Shared::new(chain),
            node,
        }
    }

    fn handle(&self, node: NodeId) -> Packet {
        Packet {
            chain: self.chain.clone(),
            node,
        }
    }

    /// Interpret `data` starting with a header of type `ty`. Bytes following
    /// the header are parsed on demand by [`Packet::next`].
    pub fn parse(ty: Factory, data: &[u8]) -> Result<Packet> {
        let size = ty.layout().size(data, 0, data.len())?;
        let mut chain = Chain::new(ByteArena::from_bytes(data));
        let node = chain.link(ROOT, ty, Span::new(0, size), None, None)?;
        pktchain_util::debug!("packet: parsed {} bytes as {}", data.len(), ty.name());
        Ok(Self::wrap(chain, node))
    }

    /// A new chain holding a default header of type `ty`.
    pub fn create(ty: Factory) -> Result<Packet> {
        Self::create_sized(ty, ty.layout().init_bytes(), InitPolicy::Zeroed)
    }

    /// A new chain of `size` zero bytes, starting with a header of type
    /// `ty`. Bytes not taken by the header are payload.
    pub fn create_sized(ty: Factory, size: usize, policy: InitPolicy) -> Result<Packet> {
        let header = ty.layout().init_bytes();
        if size < header {
            return Err(Error::truncated(ty.name(), header, size));
        }
        let mut chain = Chain::new(ByteArena::zeroed(size));
        let node = chain.link(ROOT, ty, Span::new(0, size), None, None)?;
        let packet = Self::wrap(chain, node);
        packet.access(|layout, storage| layout.init_variants(storage))?;
        {
            let mut chain = packet.chain.borrow_mut();
            let header = ty.layout().size(chain.arena.as_slice(), 0, size)?;
            chain.set_span(node, Span::new(0, header))?;
        }
        if policy == InitPolicy::Zeroed {
            ty.init(&packet)?;
        }
        Ok(packet)
    }

    /// Another handle onto the same interpreter.
    pub fn share(&self) -> Packet {
        self.handle(self.node)
    }

    /// Whether both handles look into the same chain.
    pub fn ptr_eq(&self, other: &Packet) -> bool {
        Rc::ptr_eq(&self.chain, &other.chain)
    }

    /// Whether other handles onto the same chain exist.
    pub fn is_shared(&self) -> bool {
        Rc::strong_count(&self.chain) > 1
    }

    pub fn id(&self) -> NodeId {
        self.node
    }

    /// Whether the interpreter is still part of its chain.
    pub fn is_valid(&self) -> bool {
        self.chain.borrow().node(self.node).is_ok()
    }

    pub fn packet_type(&self) -> Result<Factory> {
        Ok(self.chain.borrow().node(self.node)?.ty)
    }

    pub fn type_name(&self) -> &'static str {
        self.packet_type().map_or("<removed>", |ty| ty.name())
    }

    pub fn is<T: PacketType>(&self) -> bool {
        self.packet_type()
            .is_ok_and(|ty| type_key(ty) == TypeId::of::<T>())
    }

    pub fn is_type(&self, ty: Factory) -> bool {
        self.packet_type()
            .is_ok_and(|own| type_key(own) == type_key(ty))
    }

    /// Absolute range of the header bytes within the chain.
    pub fn range(&self) -> Result<Range<usize>> {
        Ok(self.chain.borrow().span(self.node)?.range())
    }

    /// Header size in bytes.
    pub fn size(&self) -> Result<usize> {
        Ok(self.range()?.len())
    }

    /// Bytes following the header up to the end of the region this layer
    /// lives in.
    pub fn payload_range(&self) -> Result<Range<usize>> {
        let chain = self.chain.borrow();
        Ok(chain.span(self.node)?.end..chain.limit(self.node)?)
    }

    pub fn header(&self) -> Result<Vec<u8>> {
        let range = self.range()?;
        Ok(self.chain.borrow().arena.as_slice()[range].to_vec())
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        let range = self.payload_range()?;
        Ok(self.chain.borrow().arena.as_slice()[range].to_vec())
    }

    /// Header and payload of this layer.
    pub fn data(&self) -> Result<Vec<u8>> {
        let chain = self.chain.borrow();
        let begin = chain.span(self.node)?.begin;
        Ok(chain.arena.slice(begin, chain.limit(self.node)?)?.to_vec())
    }

    /// Copy of every byte of the chain.
    pub fn chain_data(&self) -> Vec<u8> {
        self.chain.borrow().arena.as_slice().to_vec()
    }

    pub fn chain_len(&self) -> usize {
        self.chain.borrow().arena.len()
    }

    // Traversal

    /// The following layer, derived on first access. Errors while
    /// deriving are logged and reported as the end of the chain.
    pub fn next(&self) -> Option<Packet> {
        self.try_next().unwrap_or_else(|err| {
            pktchain_util::debug!("packet: no layer after {}: {}", self.type_name(), err);
            None
        })
    }

    pub fn try_next(&self) -> Result<Option<Packet>> {
        let ty = {
            let chain = self.chain.borrow();
            let node = chain.node(self.node)?;
            if let Some(next) = node.next {
                return Ok(Some(self.handle(next)));
            }
            if node.parsed {
                return Ok(None);
            }
            node.ty
        };
        let Some(range) = ty.next_packet_range(self)? else {
            self.chain.borrow_mut().node_mut(self.node)?.parsed = true;
            return Ok(None);
        };
        let next_ty = match ty.next_packet_type(self)? {
            NextType::Data => DATA,
            NextType::Fixed(next) => next,
            NextType::Registry { namespace, key } => {
                Registry::installed().lookup(namespace, key).unwrap_or_else(|| {
                    pktchain_util::debug!(
                        "packet: {} {:#x} not registered, payload kept as data",
                        namespace.name(),
                        key
                    );
                    DATA
                })
            }
        };
        let mut chain = self.chain.borrow_mut();
        let next = chain.attach(self.node, Span::new(range.start, range.end), next_ty)?;
        chain.debug_check();
        Ok(next.map(|next| self.handle(next)))
    }

    pub fn has_next(&self) -> bool {
        self.next().is_some()
    }

    pub fn prev(&self) -> Option<Packet> {
        let prev = self.chain.borrow().node(self.node).ok()?.prev;
        prev.map(|prev| self.handle(prev))
    }

    /// First layer at the nesting level of this one.
    pub fn first(&self) -> Option<Packet> {
        let first = self.chain.borrow().first(self.node).ok()?;
        first.map(|first| self.handle(first))
    }

    /// Last layer, deriving every layer up to it.
    pub fn last(&self) -> Packet {
        let mut current = self.share();
        while let Some(next) = current.next() {
            current = next;
        }
        current
    }

    /// Interpreter owning the field this layer is nested in.
    pub fn parent(&self) -> Option<Packet> {
        let parent = self.chain.borrow().parent(self.node).ok()?;
        parent.map(|parent| self.handle(parent))
    }

    /// First layers of the nested interpreters of this one.
    pub fn children(&self) -> Vec<Packet> {
        let children = self.chain.borrow().children(self.node).unwrap_or_default();
        children.into_iter().map(|child| self.handle(child)).collect()
    }

    /// This or the closest following layer of type `T`.
    pub fn find<T: PacketType>(&self) -> Option<Packet> {
        let mut current = Some(self.share());
        while let Some(packet) = current {
            if packet.is::<T>() {
                return Some(packet);
            }
            current = packet.next();
        }
        None
    }

    /// This or the closest preceding layer of type `T`.
    pub fn rfind<T: PacketType>(&self) -> Option<Packet> {
        let mut current = Some(self.share());
        while let Some(packet) = current {
            if packet.is::<T>() {
                return Some(packet);
            }
            current = packet.prev();
        }
        None
    }

    pub fn find_type(&self, ty: Factory) -> Option<Packet> {
        let mut current = Some(self.share());
        while let Some(packet) = current {
            if packet.is_type(ty) {
                return Some(packet);
            }
            current = packet.next();
        }
        None
    }

    // Structure

    /// Insert a new layer of type `ty` before or after this one.
    ///
    /// Bytes given as [`Content::Bytes`] must hold exactly one header when
    /// the new layer gets a following layer; otherwise trailing bytes
    /// become its unparsed payload.
    pub fn insert(&self, position: Position, ty: Factory, content: Content<'_>) -> Result<Packet> {
        let mut chain = self.chain.borrow_mut();
        let node = chain.node(self.node)?;
        let span = chain.span(self.node)?;
        let (container, prev, next, pos) = match position {
            Position::After => (node.container, Some(self.node), node.next, span.end),
            Position::Before => (node.container, node.prev, Some(self.node), span.begin),
        };
        let (bytes, header) = layer_bytes(ty, content)?;
        if header != bytes.len() && next.is_some() {
            return Err(Error::InvalidChain("payload bytes in front of an existing layer"));
        }
        let owners = chain.container_owners(container)?;
        chain.arena.insert(pos, &bytes, &owners)?;
        let id = chain.link(container, ty, Span::new(pos, pos + header), prev, next)?;
        chain.sync_nested(container)?;
        chain.debug_check();
        drop(chain);

        let packet = self.handle(id);
        if let Content::Init = content {
            packet.init_layer(ty)?;
        }
        Ok(packet)
    }

    fn init_layer(&self, ty: Factory) -> Result<()> {
        self.access(|layout, storage| layout.init_variants(storage))?;
        ty.init(self)
    }

    /// Insert a default header of type `ty` after this layer.
    pub fn append(&self, ty: Factory) -> Result<Packet> {
        self.insert(Position::After, ty, Content::Init)
    }

    /// Insert a default header of type `ty` before this layer.
    pub fn prepend(&self, ty: Factory) -> Result<Packet> {
        self.insert(Position::Before, ty, Content::Init)
    }

    /// Replace the payload of this layer with a default header of type `ty`.
    pub fn create_after(&self, ty: Factory) -> Result<Packet> {
        self.create_after_with(ty, Content::Init)
    }

    /// Replace the payload of this layer with a new layer of type `ty`.
    /// Nothing changes if `content` does not hold a header of type `ty`.
    pub fn create_after_with(&self, ty: Factory, content: Content<'_>) -> Result<Packet> {
        let (bytes, header) = layer_bytes(ty, content)?;
        let id = {
            let mut chain = self.chain.borrow_mut();
            let end = chain.span(self.node)?.end;
            let limit = chain.limit(self.node)?;
            let container = chain.container_of(self.node)?;
            chain.truncate_after(self.node)?;
            chain.arena.erase(end, limit - end)?;
            let owners = chain.container_owners(container)?;
            chain.arena.insert(end, &bytes, &owners)?;
            let id = chain.link(container, ty, Span::new(end, end + header), Some(self.node), None)?;
            chain.sync_nested(container)?;
            chain.debug_check();
            id
        };
        let packet = self.handle(id);
        if let Content::Init = content {
            packet.init_layer(ty)?;
        }
        Ok(packet)
    }

    /// Interpret the payload of this layer as `ty`, replacing whatever
    /// layers have been derived from it. Nothing changes if the payload is
    /// too short.
    pub fn parse_next_as(&self, ty: Factory) -> Result<Packet> {
        let mut chain = self.chain.borrow_mut();
        let end = chain.span(self.node)?.end;
        let limit = chain.limit(self.node)?;
        let size = ty.layout().size(chain.arena.as_slice(), end, limit)?;
        chain.truncate_after(self.node)?;
        let container = chain.node(self.node)?.container;
        let id = chain.link(container, ty, Span::new(end, end + size), Some(self.node), None)?;
        chain.debug_check();
        Ok(self.handle(id))
    }

    /// Replace the payload of this layer with a copy of `other`, its payload
    /// and the layers derived from it. Nested interpreters of the copied
    /// layers are not carried over. Returns the copy of `other`.
    pub fn append_packet(&self, other: &Packet) -> Result<Packet> {
        let (bytes, layers) = {
            let source = other.chain.borrow();
            let begin = source.span(other.node)?.begin;
            let bytes = source.arena.slice(begin, source.limit(other.node)?)?.to_vec();
            let mut layers = Vec::new();
            for id in source.following(other.node)? {
                let node = source.node(id)?;
                let span = source.arena.span(node.span)?;
                let bound = match node.bound {
                    Some(bound) => Some(source.arena.span(bound)?.begin - begin),
                    None => None,
                };
                layers.push((node.ty, span.begin - begin, span.end - begin, bound));
            }
            (bytes, layers)
        };

        let mut chain = self.chain.borrow_mut();
        let end = chain.span(self.node)?.end;
        let limit = chain.limit(self.node)?;
        let container = chain.node(self.node)?.container;
        chain.truncate_after(self.node)?;
        chain.arena.erase(end, limit - end)?;
        let owners = chain.container_owners(container)?;
        chain.arena.insert(end, &bytes, &owners)?;

        let mut prev = self.node;
        let mut first = None;
        for (ty, begin, stop, bound) in layers {
            let id = chain.link(container, ty, Span::new(end + begin, end + stop), Some(prev), None)?;
            if let Some(bound) = bound {
                let tracked = chain.arena.track(Span::at(end + bound));
                chain.node_mut(id)?.bound = Some(tracked);
            }
            first.get_or_insert(id);
            prev = id;
        }
        chain.sync_nested(container)?;
        chain.debug_check();
        let first = first.ok_or(Error::InvalidChain("nothing to append"))?;
        Ok(self.handle(first))
    }

    /// Change the type of this interpreter in place. Layers derived from
    /// it and its nested interpreters are dropped. Fails without changing
    /// anything if the bytes are too short for `ty`.
    pub fn reinterpret(&self, ty: Factory) -> Result<Packet> {
        let mut chain = self.chain.borrow_mut();
        let begin = chain.span(self.node)?.begin;
        let limit = chain.limit(self.node)?;
        let size = ty.layout().size(chain.arena.as_slice(), begin, limit)?;
        chain.truncate_after(self.node)?;
        chain.release_children(self.node)?;
        chain.set_span(self.node, Span::new(begin, begin + size))?;
        let node = chain.node_mut(self.node)?;
        pktchain_util::debug!("packet: {} reinterpreted as {}", node.ty.name(), ty.name());
        node.ty = ty;
        chain.debug_check();
        Ok(self.share())
    }

    /// Interpret `field` of this header as a nested chain starting with `ty`.
    ///
    /// Growing or shrinking the nested chain updates the count of `field`,
    /// and in turn the counts of every enclosing nested field.
    pub fn parse_nested(&self, field: Field<Vector>, ty: Factory) -> Result<Packet> {
        let range = self.field_range(field)?;
        let mut chain = self.chain.borrow_mut();
        let size = ty.layout().size(chain.arena.as_slice(), range.start, range.end)?;
        let id = chain.nest(self.node, field, Span::new(range.start, range.end), ty, size)?;
        chain.debug_check();
        Ok(self.handle(id))
    }

    /// Remove the header of this layer from the chain. Its payload stays
    /// in place for the surrounding layers.
    pub fn remove(self) -> Result<()> {
        let mut chain = self.chain.borrow_mut();
        let span = chain.span(self.node)?;
        let container = chain.container_of(self.node)?;
        chain.unlink(self.node)?;
        chain.arena.erase(span.begin, span.len())?;
        chain.sync_nested(container)?;
        chain.debug_check();
        Ok(())
    }

    /// Track `pos` across mutations of the chain.
    pub fn cursor(&self, pos: usize) -> Result<SafeCursor> {
        let mut chain = self.chain.borrow_mut();
        if pos > chain.arena.len() {
            return Err(Error::truncated("cursor", pos, chain.arena.len()));
        }
        let span = chain.arena.track(Span::at(pos));
        Ok(SafeCursor {
            chain: self.chain.clone(),
            span,
        })
    }

    // Finalize and verify

    /// Finalize the nested interpreters of this layer, then this layer.
    pub fn finalize_this(&self) -> Result<()> {
        let (ty, children) = {
            let chain = self.chain.borrow();
            (chain.node(self.node)?.ty, chain.children(self.node)?)
        };
        for child in children {
            self.handle(child).finalize_all()?;
        }
        ty.finalize(self)
    }

    /// Finalize this layer and every layer following it, last one first.
    pub fn finalize_all(&self) -> Result<()> {
        let last = self.last();
        self.finalize_to(&last)
    }

    /// Finalize the layers from this one up to `last`, last one first.
    pub fn finalize_to(&self, last: &Packet) -> Result<()> {
        if !self.ptr_eq(last) {
            return Err(Error::InvalidChain("finalize across chains"));
        }
        let nodes = self.chain.borrow().following(self.node)?;
        let end = nodes
            .iter()
            .position(|&id| id == last.node)
            .ok_or(Error::InvalidChain("finalize target does not follow"))?;
        for &id in nodes[..=end].iter().rev() {
            self.handle(id).finalize_this()?;
        }
        Ok(())
    }

    /// Finalize the whole chain, starting from its outermost first layer.
    pub fn finalize(&self) -> Result<()> {
        let mut outer = self.share();
        while let Some(parent) = outer.parent() {
            outer = parent;
        }
        outer
            .first()
            .ok_or(Error::InvalidChain("empty chain"))?
            .finalize_all()
    }

    /// Run the integrity checks of this layer, its nested interpreters and
    /// every following layer.
    pub fn verify(&self) -> Result<()> {
        let mut current = Some(self.share());
        while let Some(packet) = current {
            packet.packet_type()?.verify(&packet)?;
            for child in packet.children() {
                child.verify()?;
            }
            current = packet.next();
        }
        Ok(())
    }

    /// Write the annotations of the chain, if any, and every layer from
    /// this one on.
    pub fn dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        self.dump_annotations(w)?;
        self.dump_layers(w)
    }

    pub fn dump_annotations(&self, w: &mut dyn io::Write) -> io::Result<()> {
        let chain = self.chain.borrow();
        if chain.annotations.is_empty() {
            return Ok(());
        }
        writeln!(w, "annotations:")?;
        chain.annotations.dump(w, 2)
    }

    fn dump_layers(&self, w: &mut dyn io::Write) -> io::Result<()> {
        let mut current = Some(self.share());
        while let Some(packet) = current {
            match packet.packet_type() {
                Ok(ty) => ty.dump(&packet, w)?,
                Err(err) => writeln!(w, "<{err}>")?,
            }
            for child in packet.children() {
                writeln!(w, "nested in {}:", packet.type_name())?;
                child.dump_layers(w)?;
            }
            current = packet.next();
        }
        Ok(())
    }

    /// Write one line per header field.
    pub fn dump_fields(&self, w: &mut dyn io::Write, indent: usize) -> io::Result<()> {
        let mut chain = self.chain.borrow_mut();
        let ty = match chain.node(self.node) {
            Ok(node) => node.ty,
            Err(err) => return writeln!(w, "{:indent$}<{err}>", ""),
        };
        let storage = NodeStorage::new(&mut chain, self.node).map_err(io::Error::other)?;
        ty.layout().dump(&storage, w, indent)
    }

    /// Registry key of the following layer, if it is registered in
    /// `namespace`.
    pub fn next_key(&self, namespace: Namespace) -> Option<u64> {
        Registry::installed().key_of(namespace, &self.next()?)
    }

    // Fields

    fn access<R>(&self, f: impl FnOnce(&Layout, &mut NodeStorage<'_>) -> Result<R>) -> Result<R> {
        let mut chain = self.chain.borrow_mut();
        let node = chain.node(self.node)?;
        let (ty, container) = (node.ty, node.container);
        let len = chain.arena.len();
        let result = {
            let mut storage = NodeStorage::new(&mut chain, self.node)?;
            f(ty.layout(), &mut storage)
        };
        if chain.arena.len() != len {
            chain.sync_nested(container)?;
        }
        chain.debug_check();
        result
    }

    pub fn get<T: FieldValue>(&self, field: Field<T>) -> Result<T> {
        self.access(|layout, s| layout.get(&*s, field))
    }

    pub fn set<T: FieldValue>(&self, field: Field<T>, value: T) -> Result<()> {
        self.access(|layout, s| layout.set(s, field, value))
    }

    pub fn read_value(&self, field: impl Into<FieldRef>) -> Result<u64> {
        let field = field.into();
        self.access(|layout, s| layout.read_value(&*s, field))
    }

    pub fn write_value(&self, field: impl Into<FieldRef>, value: u64) -> Result<()> {
        let field = field.into();
        self.access(|layout, s| layout.write_value(s, field, value))
    }

    /// Absolute byte range of a field.
    pub fn field_range(&self, field: impl Into<FieldRef>) -> Result<Range<usize>> {
        let field = field.into();
        self.access(|layout, s| layout.field_range(&*s, field))
    }

    pub fn octets(&self, field: Field<Octets>) -> Result<Vec<u8>> {
        self.access(|layout, s| layout.octets(&*s, field).map(<[u8]>::to_vec))
    }

    pub fn set_octets(&self, field: Field<Octets>, bytes: &[u8]) -> Result<()> {
        self.access(|layout, s| layout.set_octets(s, field, bytes))
    }

    /// View onto a vector field.
    pub fn vector(&self, field: Field<Vector>) -> VectorRef<'_> {
        VectorRef {
            packet: self,
            field,
        }
    }

    /// View onto a list field.
    pub fn list(&self, field: Field<List>) -> ListRef<'_> {
        ListRef {
            packet: self,
            field,
        }
    }

    /// Discriminant value of the active alternative.
    pub fn variant(&self, field: Field<Variant>) -> Result<u64> {
        self.access(|layout, s| layout.variant_key(&*s, field))
    }

    /// Switch `field` to the alternative selected by `key`.
    pub fn init_variant(&self, field: Field<Variant>, key: u64) -> Result<()> {
        self.access(|layout, s| layout.init_variant(s, field, key))
    }

    /// View onto a TLV length field.
    pub fn tlv_length(&self, field: Field<TlvLength>) -> TlvLengthRef<'_> {
        TlvLengthRef {
            packet: self,
            field,
        }
    }

    /// Re-encode every TLV length of the header in minimal form.
    pub fn finalize_lengths(&self) -> Result<()> {
        self.access(|layout, s| layout.finalize_lengths(s))
    }

    // Annotations

    /// The annotation of type `T` of this chain, or its default if it has
    /// not been set.
    pub fn annotation<T: Annotation>(&self) -> T {
        self.chain.borrow().annotations.get::<T>().cloned().unwrap_or_default()
    }

    pub fn has_annotation<T: Annotation>(&self) -> bool {
        self.chain.borrow().annotations.contains::<T>()
    }

    pub fn set_annotation<T: Annotation>(&self, value: T) {
        self.chain.borrow_mut().annotations.insert(value);
    }

    /// Modify the annotation of type `T` in place, starting from its default
    /// if it has not been set. The chain is not borrowed while `f` runs.
    pub fn update_annotation<T: Annotation, R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut value = self.chain.borrow_mut().annotations.remove::<T>().unwrap_or_default();
        let result = f(&mut value);
        self.set_annotation(value);
        result
    }

    pub fn remove_annotation<T: Annotation>(&self) -> Option<T> {
        self.chain.borrow_mut().annotations.remove::<T>()
    }

    pub fn clear_annotations(&self) {
        self.chain.borrow_mut().annotations.clear();
    }
}

/// A deep copy of the chain and its annotations. The copy points at the
/// same interpreter position as the original. Cursors stay with the
/// original.
impl Clone for Packet {
    fn clone(&self) -> Self {
        let mut chain = self.chain.borrow().clone();
        chain.drop_cursors();
        Packet::wrap(chain, self.node)
    }
}

/// Handles are equal when they refer to the same interpreter.
impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) && self.node == other.node
    }
}

impl Eq for Packet {}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("type", &self.type_name())
            .field("range", &self.range().ok())
            .finish()
    }
}

/// A vector field of a [`Packet`].
#[derive(Clone, Copy)]
pub struct VectorRef<'p> {
    packet: &'p Packet,
    field: Field<Vector>,
}

impl VectorRef<'_> {
    pub fn len(&self) -> Result<usize> {
        self.packet.access(|layout, s| layout.vector_len(&*s, self.field))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        self.packet
            .access(|layout, s| layout.vector_bytes(&*s, self.field).map(<[u8]>::to_vec))
    }

    pub fn get(&self, i: usize) -> Result<Vec<u8>> {
        self.packet
            .access(|layout, s| layout.vector_element(&*s, self.field, i).map(<[u8]>::to_vec))
    }

    pub fn set(&self, i: usize, element: &[u8]) -> Result<()> {
        self.packet
            .access(|layout, s| layout.vector_set(s, self.field, i, element))
    }

    pub fn insert(&self, i: usize, elements: &[u8]) -> Result<()> {
        self.packet
            .access(|layout, s| layout.vector_insert(s, self.field, i, elements))
    }

    pub fn push(&self, elements: &[u8]) -> Result<()> {
        self.packet
            .access(|layout, s| layout.vector_push(s, self.field, elements))
    }

    pub fn remove(&self, i: usize) -> Result<()> {
        self.packet
            .access(|layout, s| layout.vector_remove(s, self.field, i))
    }

    pub fn assign(&self, elements: &[u8]) -> Result<()> {
        self.packet
            .access(|layout, s| layout.vector_assign(s, self.field, elements))
    }

    pub fn clear(&self) -> Result<()> {
        self.packet.access(|layout, s| layout.vector_clear(s, self.field))
    }
}

/// A list field of a [`Packet`]. Each element is a header of the element
/// layout the field was declared with.
#[derive(Clone, Copy)]
pub struct ListRef<'p> {
    packet: &'p Packet,
    field: Field<List>,
}

impl ListRef<'_> {
    pub fn len(&self) -> Result<usize> {
        self.packet.access(|layout, s| layout.list_len(&*s, self.field))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Absolute byte ranges of the elements.
    pub fn ranges(&self) -> Result<Vec<Range<usize>>> {
        self.packet.access(|layout, s| layout.list_ranges(&*s, self.field))
    }

    /// Encoded bytes of element `i`.
    pub fn get(&self, i: usize) -> Result<Vec<u8>> {
        self.packet
            .access(|layout, s| layout.list_element(&*s, self.field, i).map(<[u8]>::to_vec))
    }

    /// Encoded bytes of every element.
    pub fn elements(&self) -> Result<Vec<Vec<u8>>> {
        let ranges = self.ranges()?;
        let chain = self.packet.chain.borrow();
        Ok(ranges
            .into_iter()
            .map(|range| chain.arena.as_slice()[range].to_vec())
            .collect())
    }

    /// Run `f` with the element layout on element `i`. Resizing the element
    /// updates the count of the list.
    pub fn update<R>(&self, i: usize, f: impl FnOnce(&Layout, &mut Window<'_>) -> Result<R>) -> Result<R> {
        self.packet
            .access(|layout, s| layout.list_update(s, self.field, i, f))
    }

    /// Read `field` of element `i`.
    pub fn element_get<T: FieldValue>(&self, i: usize, field: Field<T>) -> Result<T> {
        self.update(i, |layout, w| layout.get(&*w, field))
    }

    /// Write `field` of element `i`.
    pub fn element_set<T: FieldValue>(&self, i: usize, field: Field<T>, value: T) -> Result<()> {
        self.update(i, |layout, w| layout.set(w, field, value))
    }

    /// Insert one encoded element at index `i`.
    pub fn insert(&self, i: usize, element: &[u8]) -> Result<()> {
        self.packet
            .access(|layout, s| layout.list_insert(s, self.field, i, element))
    }

    pub fn push(&self, element: &[u8]) -> Result<()> {
        self.packet.access(|layout, s| layout.list_push(s, self.field, element))
    }

    pub fn remove(&self, i: usize) -> Result<()> {
        self.packet.access(|layout, s| layout.list_remove(s, self.field, i))
    }

    pub fn clear(&self) -> Result<()> {
        self.packet.access(|layout, s| layout.list_clear(s, self.field))
    }
}

/// A TLV length field of a [`Packet`].
#[derive(Clone, Copy)]
pub struct TlvLengthRef<'p> {
    packet: &'p Packet,
    field: Field<TlvLength>,
}

impl TlvLengthRef<'_> {
    pub fn value(&self) -> Result<u32> {
        self.packet.access(|layout, s| layout.tlv_value(&*s, self.field))
    }

    /// Store `value`, growing the field if needed. The field never shrinks
    /// here; see [`TlvLengthRef::finalize`].
    pub fn set_value(&self, value: u32) -> Result<()> {
        self.packet
            .access(|layout, s| layout.set_tlv_value(s, self.field, value))
    }

    /// Make room for values up to `value` ahead of time.
    pub fn reserve(&self, value: u32) -> Result<()> {
        self.packet
            .access(|layout, s| layout.reserve_tlv(s, self.field, value))
    }

    pub fn finalize(&self) -> Result<()> {
        self.packet.access(|layout, s| layout.finalize_tlv(s, self.field))
    }

    /// Encoded size in bytes.
    pub fn bytes(&self) -> Result<usize> {
        self.packet.access(|layout, s| layout.tlv_bytes(&*s, self.field))
    }

    pub fn capacity(&self) -> Result<u32> {
        self.packet
            .access(|layout, s| layout.tlv_capacity(&*s, self.field))
    }
}

/// A position in the chain that follows every insertion and erasure.
pub struct SafeCursor {
    chain: Rc<Shared>,
    span: SpanId,
}

impl SafeCursor {
    pub fn position(&self) -> Result<usize> {
        Ok(self.chain.borrow().arena.span(self.span)?.begin)
    }
}

impl Drop for SafeCursor {
    fn drop(&mut self) {
        self.chain.release(self.span);
    }
}
