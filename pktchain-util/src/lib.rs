//! This crate contains generic utilities the pktchain crates depend upon but
//! not directly related to packet interpretation.
//!
//! It keeps the other crates independent of a concrete logging backend and
//! gives them one place for byte formatting used by packet dumps.

pub mod hexdump;
pub mod log;

#[cfg(feature = "log")]
pub use crate::log::*;

pub use hexdump::HexDump;
