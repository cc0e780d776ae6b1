//! Bookkeeping of the interpreters sharing one [`ByteArena`].
//!
//! Interpreters live in a slab and are addressed by generational
//! [`NodeId`]s, so a handle onto a removed interpreter is detected instead of
//! aliasing a new one. Each interpreter belongs to a container: the root
//! container covers the whole arena, nested containers cover a field of a
//! parent interpreter. Within a container the interpreters form a doubly
//! linked list of adjacent, non-overlapping byte ranges. Bytes following the
//! last interpreter up to its limit are the not yet parsed remainder.
//!
//! A nested container remembers the vector field it was opened on. When the
//! container grows or shrinks, [`Chain::sync_nested`] writes the new extent
//! back through the count of that field, level by level up to the root.

use std::collections::HashSet;

use crate::annotation::Annotations;
use crate::arena::{ByteArena, Span, SpanId};
use crate::interpreter::Factory;
use crate::parse::{Field, Storage, Vector};
use crate::{Error, Result};

/// Identity of an interpreter within its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContainerId(u32);

pub(crate) const ROOT: ContainerId = ContainerId(0);

#[derive(Clone)]
pub(crate) struct Node {
    /// Header bytes.
    pub(crate) span: SpanId,
    /// End of the region this interpreter and its followers live in, when
    /// it is shorter than the one of the preceding interpreter.
    pub(crate) bound: Option<SpanId>,
    pub(crate) ty: Factory,
    pub(crate) prev: Option<NodeId>,
    pub(crate) next: Option<NodeId>,
    pub(crate) container: ContainerId,
    pub(crate) children: Vec<ContainerId>,
    /// Whether the following layer has been derived or ruled out.
    pub(crate) parsed: bool,
}

#[derive(Clone)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Clone)]
pub(crate) struct Container {
    span: SpanId,
    parent: Option<NodeId>,
    /// Field of the parent header holding this range.
    field: Option<Field<Vector>>,
    first: Option<NodeId>,
}

#[derive(Clone)]
pub(crate) struct Chain {
    pub(crate) arena: ByteArena,
    slots: Vec<Slot>,
    free: Vec<u32>,
    containers: Vec<Option<Container>>,
    pub(crate) annotations: Annotations,
}

const STALE: Error = Error::InvalidChain("packet has been removed from its chain");

impl Chain {
    pub(crate) fn new(mut arena: ByteArena) -> Self {
        let span = arena.track(Span::new(0, arena.len()));
        Self {
            arena,
            slots: Vec::new(),
            free: Vec::new(),
            containers: vec![Some(Container {
                span,
                parent: None,
                field: None,
                first: None,
            })],
            annotations: Annotations::default(),
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> Result<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
            .ok_or(STALE)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .ok_or(STALE)
    }

    fn container(&self, id: ContainerId) -> Result<&Container> {
        self.containers
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidChain("nested range has been released"))
    }

    fn container_mut(&mut self, id: ContainerId) -> Result<&mut Container> {
        self.containers
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidChain("nested range has been released"))
    }

    /// Header range of an interpreter.
    pub(crate) fn span(&self, id: NodeId) -> Result<Span> {
        self.arena.span(self.node(id)?.span)
    }

    pub(crate) fn set_span(&mut self, id: NodeId, span: Span) -> Result<()> {
        let tracked = self.node(id)?.span;
        self.arena.set_span(tracked, span)
    }

    /// End of the bytes available to `id` and the layers following it.
    pub(crate) fn limit(&self, id: NodeId) -> Result<usize> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.node(current)?;
            if let Some(bound) = node.bound {
                return Ok(self.arena.span(bound)?.begin);
            }
            cursor = node.prev;
        }
        let container = self.container(self.node(id)?.container)?;
        Ok(self.arena.span(container.span)?.end)
    }

    pub(crate) fn first(&self, id: NodeId) -> Result<Option<NodeId>> {
        Ok(self.container(self.node(id)?.container)?.first)
    }

    pub(crate) fn parent(&self, id: NodeId) -> Result<Option<NodeId>> {
        Ok(self.container(self.node(id)?.container)?.parent)
    }

    /// First interpreters of every nested range of `id`.
    pub(crate) fn children(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let node = self.node(id)?;
        let mut firsts = Vec::with_capacity(node.children.len());
        for child in &node.children {
            if let Some(first) = self.container(*child)?.first {
                firsts.push(first);
            }
        }
        Ok(firsts)
    }

    /// Materialized interpreters from `id` to the last one of its container.
    pub(crate) fn following(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut nodes = vec![id];
        let mut cursor = self.node(id)?.next;
        while let Some(current) = cursor {
            nodes.push(current);
            cursor = self.node(current)?.next;
        }
        Ok(nodes)
    }

    /// Spans growing with bytes inserted at the level of `container`: the
    /// container itself and every enclosing interpreter and container.
    pub(crate) fn container_owners(&self, container: ContainerId) -> Result<Vec<SpanId>> {
        let mut owners = Vec::new();
        let mut current = Some(container);
        while let Some(id) = current {
            let c = self.container(id)?;
            owners.push(c.span);
            current = match c.parent {
                Some(parent) => {
                    let p = self.node(parent)?;
                    owners.push(p.span);
                    Some(p.container)
                }
                None => None,
            };
        }
        Ok(owners)
    }

    /// Spans growing with bytes inserted into the header of `id`. The
    /// header span comes first.
    pub(crate) fn owners(&self, id: NodeId) -> Result<Vec<SpanId>> {
        let node = self.node(id)?;
        let mut owners = vec![node.span];
        owners.extend(self.container_owners(node.container)?);
        Ok(owners)
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index: self.slots.len() as u32 - 1,
                    generation: 0,
                }
            }
        }
    }

    /// Create an interpreter over `span`, linked between `prev` and `next`.
    pub(crate) fn link(
        &mut self,
        container: ContainerId,
        ty: Factory,
        span: Span,
        prev: Option<NodeId>,
        next: Option<NodeId>,
    ) -> Result<NodeId> {
        let tracked = self.arena.track(span);
        let id = self.alloc(Node {
            span: tracked,
            bound: None,
            ty,
            prev,
            next,
            container,
            children: Vec::new(),
            parsed: next.is_some(),
        });
        match prev {
            Some(prev) => {
                let prev = self.node_mut(prev)?;
                prev.next = Some(id);
                prev.parsed = true;
            }
            None => self.container_mut(container)?.first = Some(id),
        }
        if let Some(next) = next {
            self.node_mut(next)?.prev = Some(id);
        }
        pktchain_util::trace!("chain: {} at {}..{}", ty.name(), span.begin, span.end);
        Ok(id)
    }

    /// Attach `ty` over `range` behind `id`. Returns `None` when the range
    /// does not fit behind `id` or is too short for the header.
    pub(crate) fn attach(&mut self, id: NodeId, range: Span, ty: Factory) -> Result<Option<NodeId>> {
        let current = self.span(id)?;
        let limit = self.limit(id)?;
        self.node_mut(id)?.parsed = true;
        if range.begin < current.end || range.end > limit || range.begin > range.end {
            pktchain_util::warn!(
                "chain: {} payload {}..{} outside of {}..{}",
                self.node(id)?.ty.name(),
                range.begin,
                range.end,
                current.end,
                limit
            );
            return Ok(None);
        }
        let size = match ty.layout().size(self.arena.as_slice(), range.begin, range.end) {
            Ok(size) => size,
            Err(Error::TruncatedData { required, available, .. }) => {
                pktchain_util::debug!(
                    "chain: {} needs {} bytes, {} left",
                    ty.name(),
                    required,
                    available
                );
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if range.begin > current.end {
            // Bytes skipped by the payload range stay with the header.
            self.set_span(id, Span::new(current.begin, range.begin))?;
        }
        let container = self.node(id)?.container;
        let next = self.link(
            container,
            ty,
            Span::new(range.begin, range.begin + size),
            Some(id),
            None,
        )?;
        if range.end < limit {
            let bound = self.arena.track(Span::at(range.end));
            self.node_mut(next)?.bound = Some(bound);
        }
        Ok(Some(next))
    }

    /// Open a nested range over `span`, the extent of `field` of `parent`,
    /// and interpret it starting with a `size` byte header of type `ty`.
    pub(crate) fn nest(
        &mut self,
        parent: NodeId,
        field: Field<Vector>,
        span: Span,
        ty: Factory,
        size: usize,
    ) -> Result<NodeId> {
        if !self.span(parent)?.covers(&span) {
            return Err(Error::InvalidChain("nested range outside of its parent"));
        }
        let tracked = self.arena.track(span);
        let container = Container {
            span: tracked,
            parent: Some(parent),
            field: Some(field),
            first: None,
        };
        let id = match self.containers.iter().position(Option::is_none) {
            Some(free) => {
                self.containers[free] = Some(container);
                ContainerId(free as u32)
            }
            None => {
                self.containers.push(Some(container));
                ContainerId(self.containers.len() as u32 - 1)
            }
        };
        self.node_mut(parent)?.children.push(id);
        self.link(id, ty, Span::new(span.begin, span.begin + size), None, None)
    }

    /// Write the extent of `container` into the count of the field holding
    /// it, then do the same for every enclosing nested range. Rewriting a
    /// TLV length may itself resize the parent, which the next level picks
    /// up.
    pub(crate) fn sync_nested(&mut self, container: ContainerId) -> Result<()> {
        let mut current = container;
        loop {
            let c = self.container(current)?;
            let (Some(parent), Some(field)) = (c.parent, c.field) else {
                return Ok(());
            };
            let extent = self.arena.span(c.span)?.len();
            let ty = self.node(parent)?.ty;
            pktchain_util::trace!("chain: {} nested range now {} bytes", ty.name(), extent);
            ty.layout()
                .vector_fit(&mut NodeStorage::new(self, parent)?, field, extent)?;
            current = self.node(parent)?.container;
        }
    }

    pub(crate) fn container_of(&self, id: NodeId) -> Result<ContainerId> {
        Ok(self.node(id)?.container)
    }

    /// Stop tracking every span no interpreter or nested range refers to.
    /// These are the positions of cursors, which stay with the chain they
    /// were created on.
    pub(crate) fn drop_cursors(&mut self) {
        let mut owned: HashSet<SpanId> = self.containers.iter().flatten().map(|c| c.span).collect();
        for node in self.slots.iter().filter_map(|slot| slot.node.as_ref()) {
            owned.insert(node.span);
            owned.extend(node.bound);
        }
        let stale: Vec<SpanId> = self
            .arena
            .spans()
            .map(|(id, _)| id)
            .filter(|id| !owned.contains(id))
            .collect();
        for id in stale {
            self.arena.untrack(id);
        }
    }

    fn release(&mut self, id: NodeId) -> Result<()> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(STALE)?;
        let node = slot.node.take().ok_or(STALE)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.arena.untrack(node.span);
        if let Some(bound) = node.bound {
            self.arena.untrack(bound);
        }
        for child in node.children {
            self.release_container(child)?;
        }
        Ok(())
    }

    fn release_container(&mut self, id: ContainerId) -> Result<()> {
        let container = self
            .containers
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or(Error::InvalidChain("nested range has been released"))?;
        self.arena.untrack(container.span);
        let mut cursor = container.first;
        while let Some(current) = cursor {
            cursor = self.node(current)?.next;
            self.release(current)?;
        }
        Ok(())
    }

    /// Drop the nested ranges of `id`.
    pub(crate) fn release_children(&mut self, id: NodeId) -> Result<()> {
        let children = core::mem::take(&mut self.node_mut(id)?.children);
        for child in children {
            self.release_container(child)?;
        }
        Ok(())
    }

    /// Drop every layer following `id`. Their bytes stay in place and
    /// become unparsed remainder of `id`.
    pub(crate) fn truncate_after(&mut self, id: NodeId) -> Result<()> {
        let node = self.node_mut(id)?;
        let mut cursor = node.next.take();
        node.parsed = false;
        while let Some(current) = cursor {
            cursor = self.node(current)?.next;
            self.release(current)?;
        }
        Ok(())
    }

    /// Take `id` out of its chain and release it. The bytes are left alone.
    pub(crate) fn unlink(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        let (prev, next, container, bound) = (node.prev, node.next, node.container, node.bound);
        match prev {
            Some(prev) => {
                let prev = self.node_mut(prev)?;
                prev.next = next;
                prev.parsed = next.is_some();
            }
            None => self.container_mut(container)?.first = next,
        }
        if let Some(next) = next {
            let next = self.node_mut(next)?;
            next.prev = prev;
            if next.bound.is_none() && bound.is_some() {
                next.bound = bound;
                self.node_mut(id)?.bound = None;
            }
        }
        self.release(id)
    }

    /// Verify the structural invariants: layers of a container are adjacent,
    /// start at the container start and stay inside it, links are
    /// symmetric, and nested ranges lie inside their parent.
    pub(crate) fn check(&self) -> core::result::Result<(), &'static str> {
        for container in self.containers.iter().flatten() {
            let outer = self
                .arena
                .span(container.span)
                .map_err(|_| "untracked container")?;
            if let Some(parent) = container.parent {
                let parent = self.span(parent).map_err(|_| "dangling parent")?;
                if !parent.covers(&outer) {
                    return Err("nested range outside of its parent");
                }
            }
            let mut expected = outer.begin;
            let mut prev = None;
            let mut cursor = container.first;
            while let Some(id) = cursor {
                let node = self.node(id).map_err(|_| "dangling link")?;
                if node.prev != prev {
                    return Err("asymmetric link");
                }
                let span = self.arena.span(node.span).map_err(|_| "untracked layer")?;
                if span.begin != expected {
                    return Err("layers not adjacent");
                }
                if !outer.covers(&span) {
                    return Err("layer outside of its container");
                }
                expected = span.end;
                prev = Some(id);
                cursor = node.next;
            }
        }
        Ok(())
    }

    pub(crate) fn debug_check(&self) {
        if cfg!(debug_assertions) {
            if let Err(violation) = self.check() {
                panic!("packet chain invariant violated: {violation}");
            }
        }
    }
}

/// The header of one interpreter as [`Storage`] for the field parsers.
///
/// Inserted bytes grow the interpreter together with every enclosing
/// container and parent, everything behind them is shifted.
pub(crate) struct NodeStorage<'a> {
    chain: &'a mut Chain,
    span: SpanId,
    owners: Vec<SpanId>,
}

impl<'a> NodeStorage<'a> {
    pub(crate) fn new(chain: &'a mut Chain, id: NodeId) -> Result<Self> {
        let owners = chain.owners(id)?;
        Ok(Self {
            span: owners[0],
            chain,
            owners,
        })
    }

    fn header(&self) -> Span {
        self.chain.arena.span(self.span).unwrap_or_default()
    }

    fn check(&self, pos: usize, len: usize) -> Result<()> {
        let header = self.header();
        if pos < header.begin || pos + len > header.end {
            return Err(Error::InvalidChain("modification outside of the header"));
        }
        Ok(())
    }
}

impl Storage for NodeStorage<'_> {
    fn data(&self) -> &[u8] {
        self.chain.arena.as_slice()
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self.chain.arena.as_mut_slice()
    }

    fn begin(&self) -> usize {
        self.header().begin
    }

    fn limit(&self) -> usize {
        self.header().end
    }

    fn insert_zeroed(&mut self, pos: usize, len: usize) -> Result<()> {
        self.check(pos, 0)?;
        self.chain.arena.insert_zeroed(pos, len, &self.owners)
    }

    fn erase(&mut self, pos: usize, len: usize) -> Result<()> {
        self.check(pos, len)?;
        self.chain.arena.erase(pos, len)
    }
}
