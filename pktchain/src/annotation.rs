//! Typed metadata attached to a packet chain.
//!
//! Annotations carry information about a packet that is not part of its
//! bytes, e.g. the interface it was received on or the stages it passed.
//! A chain holds at most one value per annotation type. The values are
//! shared by every interpreter of the chain and copied along with it by
//! [`Clone`](crate::Packet#impl-Clone-for-Packet).

use core::any::{Any, TypeId};
use core::fmt;
use std::collections::HashMap;
use std::io;

/// A value that can be attached to a packet chain. Reading an annotation
/// that has never been set yields its default.
///
/// ```
/// use pktchain::{Annotation, Packet, DATA};
///
/// #[derive(Debug, Clone, Default, PartialEq)]
/// struct Interface(u32);
///
/// impl Annotation for Interface {}
///
/// let packet = Packet::parse(DATA, &[1, 2, 3]).unwrap();
/// packet.set_annotation(Interface(2));
/// assert_eq!(packet.annotation::<Interface>(), Interface(2));
/// ```
pub trait Annotation: Any + Clone + Default + fmt::Debug {}

trait Stored: Any {
    fn clone_box(&self) -> Box<dyn Stored>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;

    fn name(&self) -> &'static str;

    fn debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<T: Annotation> Stored for T {
    fn clone_box(&self) -> Box<dyn Stored> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn name(&self) -> &'static str {
        core::any::type_name::<T>()
    }

    fn debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Debug for dyn Stored {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.debug(f)
    }
}

/// The annotations of one chain, keyed by type.
#[derive(Default)]
pub(crate) struct Annotations {
    values: HashMap<TypeId, Box<dyn Stored>>,
}

impl Clone for Annotations {
    fn clone(&self) -> Self {
        Self {
            values: self
                .values
                .iter()
                .map(|(key, value)| (*key, value.clone_box()))
                .collect(),
        }
    }
}

impl Annotations {
    pub(crate) fn get<T: Annotation>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.as_any().downcast_ref())
    }

    pub(crate) fn contains<T: Annotation>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    pub(crate) fn insert<T: Annotation>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub(crate) fn remove<T: Annotation>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.into_any().downcast().ok())
            .map(|value| *value)
    }

    pub(crate) fn clear(&mut self) {
        self.values.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// One line per annotation, ordered by type name.
    pub(crate) fn dump(&self, w: &mut dyn io::Write, indent: usize) -> io::Result<()> {
        let mut values: Vec<&dyn Stored> = self.values.values().map(Box::as_ref).collect();
        values.sort_by_key(|value| value.name());
        for value in values {
            writeln!(w, "{:indent$}{:?}", "", value, indent = indent)?;
        }
        Ok(())
    }
}
