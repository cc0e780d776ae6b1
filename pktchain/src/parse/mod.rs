//! Field-parser combinators.
//!
//! Parsers are stateless views bound to a byte offset (and bit offset) that
//! decode and encode one value on demand. [`LayoutBuilder`] composes them
//! into the [`Layout`] of a protocol header.

mod access;
mod int;
mod layout;
mod storage;
pub mod tlv;
mod value;

pub use int::{BitsParser, IntParser};
pub use layout::{
    Alternative, Count, Field, FieldInfo, FieldKind, FieldRef, Layout, LayoutBuilder, LayoutError,
    LayoutId, List, Octets, TlvLength, Variant, Vector,
};
pub use storage::{Storage, Window};
pub use tlv::TlvLengthParser;
pub use value::{Endian, FieldValue};
