//! The span header and its stripe descriptor table.
//!
//! The header lives one store block into the device and is rounded up to a
//! whole store block on disk. Its fixed part is 32 bytes (four bytes of
//! struct padding sit between the counters and `num_blocks`); each stripe
//! descriptor takes 24 bytes, and the runtime's `sizeof` includes one
//! descriptor, so a header with `n` descriptors serializes to
//! `56 + (n - 1) * 24` bytes.


use crate::layout::{read_i64, read_u32, write_i64, write_u32};
use crate::units::{Bytes, StoreBlocks};

/// One stripe's entry in the span header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StripeDescriptor {
    /// Byte offset of the stripe from the start of the span.
    pub offset: Bytes,
    /// Stripe length in store blocks.
    pub len: StoreBlocks,
    /// Owning volume; 0 together with `free` marks an unallocated region.
    pub vol_idx: u32,
    /// Stripe type, three bits on disk.
    pub kind: u8,
    pub free: bool,
}

impl StripeDescriptor {
    pub const SIZEOF: usize = 24;

    #[must_use]
    pub fn decode(buf: &[u8]) -> Self {
        let flags = read_u32(buf, 20);
        Self {
            offset: Bytes::new(read_i64(buf, 0)),
            len: StoreBlocks::new(read_i64(buf, 8)),
            vol_idx: read_u32(buf, 16),
            kind: (flags & 0x7) as u8,
            free: flags & 0x8 != 0,
        }
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        write_i64(buf, 0, self.offset.count());
        write_i64(buf, 8, self.len.count());
        write_u32(buf, 16, self.vol_idx);
        let flags = u32::from(self.kind & 0x7) | (u32::from(self.free) << 3);
        write_u32(buf, 20, flags);
    }
}

/// Serialized descriptor block at the head of a span.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpanHeader {
    /// Count of distinct non-zero volume indices across the descriptors.
    pub num_volumes: u32,
    pub num_free: u32,
    pub num_used: u32,
    /// Span length in store blocks.
    pub num_blocks: StoreBlocks,
    pub stripes: Vec<StripeDescriptor>,
}

impl SpanHeader {
    pub const MAGIC: u32 = 0xABCD_1237;
    /// Bytes before the descriptor array (magic, four counters, padding,
    /// `num_blocks`).
    pub const FIXED_BYTES: usize = 32;
    /// The runtime's `sizeof`, which includes one descriptor.
    pub const SIZEOF: usize = Self::FIXED_BYTES + StripeDescriptor::SIZEOF;

    /// Serialized length of a header carrying `n_desc` descriptors.
    #[must_use]
    pub fn serialized_bytes(n_desc: usize) -> usize {
        Self::SIZEOF + n_desc.max(1).saturating_sub(1) * StripeDescriptor::SIZEOF
    }

    /// On-disk footprint, rounded up to whole store blocks.
    #[must_use]
    pub fn disk_blocks(n_desc: usize) -> StoreBlocks {
        StoreBlocks::round_up(Bytes::new(Self::serialized_bytes(n_desc) as i64))
    }

    /// Check the fixed part of a candidate header and report its descriptor
    /// count. A valid header has the magic in place and consistent stripe
    /// accounting (`num_diskvol_blks == num_used + num_free`).
    #[must_use]
    pub fn validate_prefix(buf: &[u8]) -> Option<usize> {
        if buf.len() < Self::FIXED_BYTES {
            return None;
        }
        let magic = read_u32(buf, 0);
        let num_free = read_u32(buf, 8);
        let num_used = read_u32(buf, 12);
        let num_diskvol_blks = read_u32(buf, 16);
        if magic == Self::MAGIC && num_diskvol_blks == num_used + num_free {
            Some(num_diskvol_blks as usize)
        } else {
            None
        }
    }

    /// Decode a header whose prefix already validated; `buf` must cover the
    /// full serialized length for `n_desc` descriptors.
    #[must_use]
    pub fn decode(buf: &[u8], n_desc: usize) -> Option<Self> {
        if buf.len() < Self::serialized_bytes(n_desc) {
            return None;
        }
        let mut stripes = Vec::with_capacity(n_desc);
        for i in 0..n_desc {
            let at = Self::FIXED_BYTES + i * StripeDescriptor::SIZEOF;
            stripes.push(StripeDescriptor::decode(&buf[at..at + StripeDescriptor::SIZEOF]));
        }
        Some(Self {
            num_volumes: read_u32(buf, 4),
            num_free: read_u32(buf, 8),
            num_used: read_u32(buf, 12),
            num_blocks: StoreBlocks::new(read_i64(buf, 24)),
            stripes,
        })
    }

    /// Serialize into `buf`, which must cover the full serialized length.
    pub fn encode_into(&self, buf: &mut [u8]) {
        write_u32(buf, 0, Self::MAGIC);
        write_u32(buf, 4, self.num_volumes);
        write_u32(buf, 8, self.num_free);
        write_u32(buf, 12, self.num_used);
        write_u32(buf, 16, self.stripes.len() as u32);
        write_u32(buf, 20, 0);
        write_i64(buf, 24, self.num_blocks.count());
        for (i, sd) in self.stripes.iter().enumerate() {
            let at = Self::FIXED_BYTES + i * StripeDescriptor::SIZEOF;
            sd.encode_into(&mut buf[at..at + StripeDescriptor::SIZEOF]);
        }
    }
}
