//! Directory entries and directory geometry.
//!
//! A stripe's directory is an array of ten-byte entries grouped four to a
//! bucket, buckets grouped into segments of at most 16384 buckets so a
//! 16-bit entry index can address a whole segment. The geometry functions
//! here turn a metadata span (`delta`) or a raw stripe length into the
//! segment and bucket counts the runtime would use.


use crate::layout::read_u16;
use crate::layout::stripe_meta::StripeMeta;
use crate::units::{Bytes, StoreBlocks};

pub const ENTRIES_PER_BUCKET: i64 = 4;
pub const MAX_BUCKETS_PER_SEGMENT: i64 = (1 << 16) / ENTRIES_PER_BUCKET;
/// Serialized size of one directory entry.
pub const SIZEOF_DIR: i64 = 10;
/// Smallest unit of content accounting (one data block).
pub const CACHE_BLOCK_SIZE: i64 = 512;

/// One directory entry, viewed as five little-endian 16-bit words.
///
/// Only the byte layout matters to this tool; the accessors exist so the
/// chain walk and dumps can read the packed fields without interpreting
/// them further.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheDirEntry {
    pub w: [u16; 5],
}

impl CacheDirEntry {
    pub const SIZEOF: usize = 10;

    #[must_use]
    pub fn decode(buf: &[u8]) -> Self {
        let mut w = [0u16; 5];
        for (i, word) in w.iter_mut().enumerate() {
            *word = read_u16(buf, 2 * i);
        }
        Self { w }
    }

    /// Full fragment offset: 24 low bits packed across `w[0]`/`w[1]` plus
    /// sixteen high bits in `w[4]`.
    #[must_use]
    pub fn offset(self) -> u64 {
        let low = u64::from(self.w[0]) | (u64::from(self.w[1] & 0xFF) << 16);
        low | (u64::from(self.w[4]) << 24)
    }

    #[must_use]
    pub fn big(self) -> u16 {
        (self.w[1] >> 8) & 0x3
    }

    #[must_use]
    pub fn size(self) -> u16 {
        (self.w[1] >> 10) & 0x3F
    }

    #[must_use]
    pub fn tag(self) -> u16 {
        self.w[2] & 0xFFF
    }

    #[must_use]
    pub fn phase(self) -> bool {
        self.w[2] & (1 << 12) != 0
    }

    #[must_use]
    pub fn is_head(self) -> bool {
        self.w[2] & (1 << 13) != 0
    }

    #[must_use]
    pub fn pinned(self) -> bool {
        self.w[2] & (1 << 14) != 0
    }

    #[must_use]
    pub fn token(self) -> bool {
        self.w[2] & (1 << 15) != 0
    }

    /// Next entry index within the segment; 0 terminates a chain.
    #[must_use]
    pub fn next(self) -> u16 {
        self.w[3]
    }

    #[must_use]
    pub fn in_use(self) -> bool {
        self.offset() != 0
    }
}

/// Directory shape for one stripe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DirGeometry {
    pub segments: i64,
    /// Buckets per segment.
    pub buckets: i64,
    /// Store blocks occupied by a header copy and its freelist.
    pub header_len: StoreBlocks,
}

impl DirGeometry {
    #[must_use]
    pub const fn entries_per_segment(&self) -> i64 {
        self.buckets * ENTRIES_PER_BUCKET
    }

    /// Bytes of directory proper (all segments, unrounded).
    #[must_use]
    pub const fn dir_bytes(&self) -> i64 {
        self.buckets * self.segments * ENTRIES_PER_BUCKET * SIZEOF_DIR
    }
}

/// Store blocks needed for a header copy carrying `segments` freelist heads.
#[must_use]
pub fn header_blocks(segments: i64) -> StoreBlocks {
    let bytes = StripeMeta::FIXED_BYTES as i64 + 2 * (segments - 1).max(0);
    StoreBlocks::round_up(Bytes::new(bytes))
}

/// Store blocks needed for a footer copy (fixed fields only).
#[must_use]
pub fn footer_blocks() -> StoreBlocks {
    StoreBlocks::round_up(Bytes::new(StripeMeta::FIXED_BYTES as i64))
}

/// Derive the directory geometry from the distance between a copy's header
/// and footer positions.
///
/// Past the header sit the segment free-list heads, which for very long
/// stripes can take more than one store block; start from a one-block guess
/// and grow until the header fits. A 2 TB stripe has roughly 3700 segments,
/// so even 10 TB drives converge in a couple of iterations.
#[must_use]
pub fn derive(delta: Bytes) -> DirGeometry {
    let mut header_len: i64 = 0;
    loop {
        header_len += 1;
        let avail = (delta.count() - header_len * StoreBlocks::SCALE).max(0);
        let n_buckets = avail / (SIZEOF_DIR * ENTRIES_PER_BUCKET);
        let mut n_segments = (n_buckets / MAX_BUCKETS_PER_SEGMENT).max(1);
        while n_buckets / n_segments > MAX_BUCKETS_PER_SEGMENT {
            n_segments += 1;
        }
        if StripeMeta::FIXED_BYTES as i64 + 2 * n_segments <= header_len * StoreBlocks::SCALE {
            return DirGeometry {
                segments: n_segments,
                buckets: n_buckets / n_segments,
                header_len: StoreBlocks::new(header_len),
            };
        }
    }
}

/// Geometry plus the per-copy footprint for freshly initialized metadata.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreshLayout {
    pub geom: DirGeometry,
    /// Bytes per metadata copy: header, directory, footer, each rounded to
    /// store blocks.
    pub dirlen: Bytes,
}

/// Compute the directory geometry for an empty stripe of `len` bytes.
///
/// The bucket count wants the content length, which depends on the
/// directory footprint, which depends on the bucket count; three rounds of
/// the fixed-point reach the runtime's answer.
#[must_use]
pub fn fresh(len: Bytes) -> FreshLayout {
    let mut content_delta: i64 = 0;
    let mut layout = FreshLayout {
        geom: DirGeometry {
            segments: 1,
            buckets: 0,
            header_len: StoreBlocks::new(1),
        },
        dirlen: Bytes::new(0),
    };
    for _ in 0..3 {
        let mut buckets = ((len.count() - content_delta) / CACHE_BLOCK_SIZE) / ENTRIES_PER_BUCKET;
        let segments =
            ((buckets + (((1 << 16) - 1) / ENTRIES_PER_BUCKET)) / ((1 << 16) / ENTRIES_PER_BUCKET))
                .max(1);
        buckets = (buckets + segments - 1) / segments;
        let geom = DirGeometry {
            segments,
            buckets,
            header_len: header_blocks(segments),
        };
        let dirlen = geom.header_len.units()
            + StoreBlocks::round_up(Bytes::new(geom.dir_bytes())).units()
            + footer_blocks().units();
        content_delta = 2 * dirlen;
        layout = FreshLayout {
            geom,
            dirlen: Bytes::new(dirlen),
        };
    }
    layout
}

/// A problem found while walking bucket chains.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChainFault {
    /// A chain revisited an entry.
    Cycle { segment: i64, bucket: i64 },
    /// A chain ran longer than the segment holds entries.
    Overrun { segment: i64, bucket: i64 },
}

/// Follow every bucket's `next` chain and report cycles and overruns.
///
/// `dir` holds the serialized directory for all segments back to back; the
/// walk reads nothing but the `next` words, so it works on any directory
/// whose geometry is known, valid or not.
#[must_use]
pub fn check_bucket_chains(dir: &[u8], geom: &DirGeometry) -> Vec<ChainFault> {
    let mut faults = Vec::new();
    let per_segment = geom.entries_per_segment();
    let mut stamp = vec![0u32; per_segment.max(0) as usize];
    let mut chain_id = 0u32;

    for s in 0..geom.segments {
        let seg_base = s * per_segment;
        for b in 0..geom.buckets {
            chain_id += 1;
            let mut steps: i64 = 0;
            let mut at = b * ENTRIES_PER_BUCKET;
            loop {
                steps += 1;
                if steps > per_segment {
                    faults.push(ChainFault::Overrun { segment: s, bucket: b });
                    break;
                }
                let raw = (seg_base + at) as usize * CacheDirEntry::SIZEOF;
                if raw + CacheDirEntry::SIZEOF > dir.len() {
                    break;
                }
                let entry = CacheDirEntry::decode(&dir[raw..raw + CacheDirEntry::SIZEOF]);
                let next = i64::from(entry.next());
                if next == 0 {
                    break;
                }
                if next >= per_segment {
                    faults.push(ChainFault::Overrun { segment: s, bucket: b });
                    break;
                }
                if stamp[next as usize] == chain_id {
                    faults.push(ChainFault::Cycle { segment: s, bucket: b });
                    break;
                }
                stamp[next as usize] = chain_id;
                at = next;
            }
        }
    }
    faults
}
