//! Value types that scalar fields decode to.

/// Byte order of a multi-byte integer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum Endian {
    #[default]
    Big,
    Little,
}

/// A Rust type a scalar field (integer or bitfield) can be read as.
///
/// Values travel through the field parsers as raw two's complement bits in
/// a `u64`; the implementation takes care of sign extension and of range
/// checks against the declared field width.
pub trait FieldValue: Copy + core::fmt::Debug + 'static {
    /// Width of the Rust type in bits.
    const BITS: u32;
    const SIGNED: bool;

    /// Decode the low `width` bits of `raw`, sign-extending signed values.
    fn from_raw(raw: u64, width: u32) -> Self;

    /// Encode as raw bits. Callers mask to the field width.
    fn into_raw(self) -> u64;

    fn as_i128(self) -> i128;
}

/// Smallest value representable in `width` bits.
pub(crate) fn min_value(signed: bool, width: u32) -> i128 {
    if signed {
        -(1i128 << (width - 1))
    } else {
        0
    }
}

/// Largest value representable in `width` bits.
pub(crate) fn max_value(signed: bool, width: u32) -> i128 {
    if signed {
        (1i128 << (width - 1)) - 1
    } else {
        (1i128 << width) - 1
    }
}

pub(crate) fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

macro_rules! impl_unsigned {
    ($($ty:ty),*) => {$(
        impl FieldValue for $ty {
            const BITS: u32 = <$ty>::BITS;
            const SIGNED: bool = false;

            fn from_raw(raw: u64, width: u32) -> Self {
                (raw & mask(width)) as $ty
            }

            fn into_raw(self) -> u64 {
                self as u64
            }

            fn as_i128(self) -> i128 {
                self as i128
            }
        }
    )*};
}

macro_rules! impl_signed {
    ($($ty:ty),*) => {$(
        impl FieldValue for $ty {
            const BITS: u32 = <$ty>::BITS;
            const SIGNED: bool = true;

            fn from_raw(raw: u64, width: u32) -> Self {
                let shift = 64 - width;
                (((raw << shift) as i64) >> shift) as $ty
            }

            fn into_raw(self) -> u64 {
                self as i64 as u64
            }

            fn as_i128(self) -> i128 {
                self as i128
            }
        }
    )*};
}

impl_unsigned!(u8, u16, u32, u64);
impl_signed!(i8, i16, i32, i64);

impl FieldValue for bool {
    const BITS: u32 = 1;
    const SIGNED: bool = false;

    fn from_raw(raw: u64, _width: u32) -> Self {
        raw != 0
    }

    fn into_raw(self) -> u64 {
        self as u64
    }

    fn as_i128(self) -> i128 {
        self as i128
    }
}
