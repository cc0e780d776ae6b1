//! In-place interpretation and mutation of layered binary protocol data.
//!
//! A packet is a chain of interpreters ([`Packet`]) over one shared byte
//! buffer. Each interpreter reads and writes its header fields directly in
//! that buffer through a declarative [`Layout`](parse::Layout). Growing or
//! shrinking a field shifts every following layer, and interpreters keep
//! pointing at their bytes.
//!
//! ```
//! use pktchain::{DataPacket, Packet, DATA};
//!
//! let packet = Packet::parse(DATA, &[1, 2, 3]).unwrap();
//! packet.vector(DataPacket::data()).push(&[4]).unwrap();
//! assert_eq!(packet.chain_data(), [1, 2, 3, 4]);
//! ```

#![cfg_attr(feature = "strict", deny(warnings))]

mod annotation;
pub mod arena;
mod chain;
pub mod checksum;
mod error;
pub mod interpreter;
mod packet;
pub mod parse;
pub mod registry;

pub use annotation::Annotation;
pub use chain::NodeId;
pub use error::{Error, Result};
pub use interpreter::{type_key, DataPacket, Factory, NextType, PacketType, DATA};
pub use packet::{
    Content, InitPolicy, ListRef, Packet, Position, SafeCursor, TlvLengthRef, VectorRef,
};
pub use registry::{Namespace, Registry, RegistryError};
