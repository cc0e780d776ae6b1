//! Hex formatting for packet dumps.

use core::fmt;

/// Number of bytes rendered per line.
pub const BYTES_PER_LINE: usize = 16;

/// Renders a byte slice as hex.
///
/// Short slices (up to one line) render as a single compact hex string.
/// Longer slices render as offset-prefixed lines, each line indented by
/// the configured amount.
#[derive(Debug, Clone, Copy)]
pub struct HexDump<'a> {
    bytes: &'a [u8],
    indent: usize,
}

impl<'a> HexDump<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, indent: 0 }
    }

    pub fn indent(mut self, indent: usize) -> Self {
        self.indent = indent;
        self
    }
}

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bytes.len() <= BYTES_PER_LINE {
            return f.write_str(&hex::encode(self.bytes));
        }
        for (line, chunk) in self.bytes.chunks(BYTES_PER_LINE).enumerate() {
            if line > 0 {
                writeln!(f)?;
            }
            write!(
                f,
                "{:indent$}{:04x}  {}",
                "",
                line * BYTES_PER_LINE,
                hex::encode(chunk),
                indent = self.indent
            )?;
        }
        Ok(())
    }
}
