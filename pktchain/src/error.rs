//! Error types.

/// Errors raised while interpreting or mutating packet data.
///
/// Structural errors ([`Error::TruncatedData`], [`Error::FieldRange`]) abort
/// the operation that raised them. Integrity errors
/// ([`Error::ChecksumMismatch`], [`Error::CrcMismatch`]) are only produced by
/// explicit verification calls and never by ordinary parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("truncated data in {what}: {required} bytes required, {available} available")]
    TruncatedData {
        what: &'static str,
        required: usize,
        available: usize,
    },
    #[error("value {value} of field `{field}` outside of {min}..={max}")]
    FieldRange {
        field: &'static str,
        value: i128,
        min: i128,
        max: i128,
    },
    #[error("variant `{field}` has no active alternative {key}")]
    VariantMisuse { field: &'static str, key: u64 },
    #[error("{protocol} checksum mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    ChecksumMismatch {
        protocol: &'static str,
        expected: u32,
        computed: u32,
    },
    #[error("{protocol} crc mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        protocol: &'static str,
        expected: u32,
        computed: u32,
    },
    #[error("field `{field}` does not belong to layout `{layout}`")]
    FieldMismatch {
        field: &'static str,
        layout: &'static str,
    },
    #[error("invalid packet chain: {0}")]
    InvalidChain(&'static str),
}

/// A type alias for `Result<T, pktchain::Error>`.
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    pub(crate) fn truncated(what: &'static str, required: usize, available: usize) -> Self {
        Error::TruncatedData {
            what,
            required,
            available,
        }
    }

    /// Whether this error reports a failed integrity check rather than a
    /// structural problem.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Error::ChecksumMismatch { .. } | Error::CrcMismatch { .. }
        )
    }
}
