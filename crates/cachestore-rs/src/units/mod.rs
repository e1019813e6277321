//! Typed byte quantities at fixed scales.
//!
//! Every scale is its own type; arithmetic stays within a scale and crossing
//! scales goes through explicit [`round_up`]/[`round_down`] conversions from
//! [`Bytes`]. This is what keeps "store blocks" from silently mixing with
//! "stripe blocks" anywhere in the span and stripe code.
//!
//! [`round_up`]: Bytes::round_up

#[cfg(test)]
mod units_tests;

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

macro_rules! scalar {
    ($(#[$meta:meta])* $name:ident, $scale:expr, $label:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(i64);

        impl $name {
            /// Bytes per unit of this scale.
            pub const SCALE: i64 = $scale;

            #[must_use]
            pub const fn new(count: i64) -> Self {
                Self(count)
            }

            /// Count in this scale's units.
            #[must_use]
            pub const fn count(self) -> i64 {
                self.0
            }

            /// Value in bytes.
            #[must_use]
            pub const fn units(self) -> i64 {
                self.0 * Self::SCALE
            }

            #[must_use]
            pub const fn to_bytes(self) -> Bytes {
                Bytes::new(self.units())
            }

            /// Smallest value of this scale that is not less than `bytes`.
            #[must_use]
            pub const fn round_up(bytes: Bytes) -> Self {
                Self((bytes.count() + Self::SCALE - 1).div_euclid(Self::SCALE))
            }

            /// Largest value of this scale that is not greater than `bytes`.
            #[must_use]
            pub const fn round_down(bytes: Bytes) -> Self {
                Self(bytes.count().div_euclid(Self::SCALE))
            }

            #[must_use]
            pub const fn is_zero(self) -> bool {
                self.0 == 0
            }
        }

        impl Add for $name {
            type Output = Self;
            fn add(self, rhs: Self) -> Self {
                Self(self.0 + rhs.0)
            }
        }

        impl Sub for $name {
            type Output = Self;
            fn sub(self, rhs: Self) -> Self {
                Self(self.0 - rhs.0)
            }
        }

        impl AddAssign for $name {
            fn add_assign(&mut self, rhs: Self) {
                self.0 += rhs.0;
            }
        }

        impl SubAssign for $name {
            fn sub_assign(&mut self, rhs: Self) {
                self.0 -= rhs.0;
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} {}", self.0, $label)
            }
        }
    };
}

scalar!(
    /// A raw byte count.
    Bytes, 1, "bytes"
);
scalar!(Kilobytes, 1024, "KB");
scalar!(Megabytes, 1024 * Kilobytes::SCALE, "MB");
scalar!(Gigabytes, 1024 * Megabytes::SCALE, "GB");
scalar!(Terabytes, 1024 * Gigabytes::SCALE, "TB");

scalar!(
    /// Unit of span metadata storage and alignment (8 KiB).
    StoreBlocks, 8 * Kilobytes::SCALE, "store blocks"
);
scalar!(
    /// Unit of stripe allocation (128 MiB).
    StripeBlocks, 128 * Megabytes::SCALE, "stripe blocks"
);
scalar!(
    /// Unit of cached content size accounting (512 B).
    DataBlocks, 512, "data blocks"
);

impl StripeBlocks {
    /// Store blocks per stripe block (16384).
    pub const STORE_BLOCKS: i64 = Self::SCALE / StoreBlocks::SCALE;

    #[must_use]
    pub const fn to_store_blocks(self) -> StoreBlocks {
        StoreBlocks::new(self.0 * Self::STORE_BLOCKS)
    }
}
