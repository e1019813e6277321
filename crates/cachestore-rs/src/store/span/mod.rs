//! One raw storage container: a device, partition or file backing cache
//! stripes.

#[cfg(test)]
mod span_tests;

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::device::{
    AlignedBuf, DEFAULT_HW_SECTOR_SIZE, FileKind, Geometry, OpenMode, classify, open_span,
    probe_geometry,
};
use crate::errata::{Code, Errata, Severity};
use crate::layout::MAX_VOLUME_IDX;
use crate::layout::span_header::{SpanHeader, StripeDescriptor};
use crate::store::stripe::Stripe;
use crate::units::{Bytes, StoreBlocks, StripeBlocks};

/// Offset of the span header: the first store block is reserved so the
/// header cannot collide with partition tracking structures.
pub const HEADER_OFFSET: i64 = StoreBlocks::SCALE;

/// A raw storage container and the live view of its stripes.
pub struct Span {
    path: PathBuf,
    file: File,
    mode: OpenMode,
    /// Forced volume hint from the span config; 0 means unforced.
    vol_idx: u8,
    /// First usable store block, past the reserved leading region.
    base: StoreBlocks,
    /// First content store block, past the serialized header.
    offset: StoreBlocks,
    len: StoreBlocks,
    /// Accumulated length of unallocated stripes.
    free_space: StoreBlocks,
    geometry: Geometry,
    /// Local copy of the serialized header; `None` for uninitialized spans.
    header: Option<SpanHeader>,
    stripes: Vec<Stripe>,
}

impl Span {
    /// Open and validate the span at `path`.
    ///
    /// Block and character devices probe their geometry through the kernel;
    /// regular files take it from metadata. A span whose header does not
    /// validate is still usable: its length comes from the geometry and its
    /// stripe list stays empty until [`Span::clear`] seeds it.
    pub fn load(path: &Path, mode: OpenMode) -> (Option<Self>, Errata) {
        let kind = match classify(path) {
            Ok(kind) => kind,
            Err(e) => {
                return (
                    None,
                    Errata::error(Code::Open, format!("{}: {e:#}", path.display())),
                );
            }
        };
        match kind {
            FileKind::Directory => (
                None,
                Errata::error(
                    Code::Open,
                    format!("{}: directory spans are not supported", path.display()),
                ),
            ),
            FileKind::Other => (
                None,
                Errata::error(
                    Code::Open,
                    format!("{}: not a valid file type for a span", path.display()),
                ),
            ),
            FileKind::Regular | FileKind::BlockDevice | FileKind::CharDevice => {
                Self::load_storage(path, kind, mode)
            }
        }
    }

    fn load_storage(path: &Path, kind: FileKind, mode: OpenMode) -> (Option<Self>, Errata) {
        let mut zret = Errata::new();

        let file = match open_span(path, kind, mode) {
            Ok(file) => file,
            Err(e) => {
                return (
                    None,
                    Errata::error(Code::Open, format!("unable to open {}: {e:#}", path.display())),
                );
            }
        };
        let geometry = match probe_geometry(&file, kind) {
            Ok(geometry) => geometry,
            Err(e) => {
                return (
                    None,
                    Errata::error(
                        Code::DeviceGeometry,
                        format!("unable to get device geometry for {}: {e:#}", path.display()),
                    ),
                );
            }
        };

        let align = geometry
            .block_size
            .count()
            .max(DEFAULT_HW_SECTOR_SIZE) as usize;
        let mut block = match AlignedBuf::zeroed(StoreBlocks::SCALE as usize, align) {
            Ok(buf) => buf,
            Err(e) => return (None, Errata::error(Code::IoRead, format!("{e:#}"))),
        };
        if let Err(e) = file.read_exact_at(&mut block, HEADER_OFFSET as u64) {
            return (
                None,
                Errata::error(
                    Code::IoRead,
                    format!("failed to read from {}: {e}", path.display()),
                ),
            );
        }

        let base = StoreBlocks::round_up(Bytes::new(HEADER_OFFSET));
        let mut span = Self {
            path: path.to_owned(),
            file,
            mode,
            vol_idx: 0,
            base,
            offset: base + StoreBlocks::new(1),
            len: StoreBlocks::new(0),
            free_space: StoreBlocks::new(0),
            geometry,
            header: None,
            stripes: Vec::new(),
        };

        if let Some(n_desc) = SpanHeader::validate_prefix(&block) {
            let need = SpanHeader::serialized_bytes(n_desc);
            let hdr_blocks = SpanHeader::disk_blocks(n_desc);
            let decoded = if need <= StoreBlocks::SCALE as usize {
                SpanHeader::decode(&block, n_desc)
            } else {
                // The descriptor table runs past the first block; reread the
                // full header region.
                match AlignedBuf::zeroed(hdr_blocks.units() as usize, align) {
                    Ok(mut full) => match span.file.read_exact_at(&mut full, HEADER_OFFSET as u64) {
                        Ok(()) => SpanHeader::decode(&full, n_desc),
                        Err(e) => {
                            return (
                                None,
                                Errata::error(
                                    Code::IoRead,
                                    format!("failed to read from {}: {e}", path.display()),
                                ),
                            );
                        }
                    },
                    Err(e) => return (None, Errata::error(Code::IoRead, format!("{e:#}"))),
                }
            };
            let Some(hdr) = decoded else {
                return (
                    None,
                    Errata::error(
                        Code::IoRead,
                        format!("short span header read from {}", path.display()),
                    ),
                );
            };
            span.len = hdr.num_blocks;
            span.offset = base + hdr_blocks;
            for (i, sd) in hdr.stripes.iter().enumerate() {
                let mut stripe = Stripe::new(path, i, sd.offset, sd.len);
                if sd.free {
                    span.free_space += stripe.len();
                } else {
                    stripe.vol_idx = sd.vol_idx.min(MAX_VOLUME_IDX as u32) as u8;
                    stripe.kind = sd.kind;
                }
                span.stripes.push(stripe);
            }
            span.header = Some(hdr);
        } else {
            zret.warn(
                Code::None,
                format!("span header for {} is invalid", path.display()),
            );
            span.len = StoreBlocks::round_down(geometry.total_size) - base;
        }
        (Some(span), zret)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.mode.is_writable()
    }

    #[must_use]
    pub fn forced_vol(&self) -> u8 {
        self.vol_idx
    }

    pub fn set_forced_vol(&mut self, vol_idx: u8) {
        self.vol_idx = vol_idx;
    }

    #[must_use]
    pub fn base(&self) -> StoreBlocks {
        self.base
    }

    #[must_use]
    pub fn content_offset(&self) -> StoreBlocks {
        self.offset
    }

    #[must_use]
    pub fn len(&self) -> StoreBlocks {
        self.len
    }

    #[must_use]
    pub fn free_space(&self) -> StoreBlocks {
        self.free_space
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn header(&self) -> Option<&SpanHeader> {
        self.header.as_ref()
    }

    #[must_use]
    pub fn stripes(&self) -> &[Stripe] {
        &self.stripes
    }

    /// No allocated stripes on this span?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stripes.iter().all(Stripe::is_free)
    }

    fn reindex(&mut self) {
        for (i, stripe) in self.stripes.iter_mut().enumerate() {
            stripe.idx = i;
        }
    }

    /// Carve `len` stripe blocks for `vol_idx` out of the first fitting
    /// free stripe.
    ///
    /// A free stripe fits when carving would leave a remainder smaller than
    /// one stripe block in either direction: a near-exact free stripe is
    /// consumed whole rather than leaving an unusable tail.
    pub fn alloc_stripe(&mut self, vol_idx: u8, len: StripeBlocks) -> (Option<usize>, Errata) {
        let want = len.to_store_blocks();
        for i in 0..self.stripes.len() {
            if !self.stripes[i].is_free() {
                continue;
            }
            let have = self.stripes[i].len();
            if have.count() + StripeBlocks::STORE_BLOCKS <= want.count() {
                continue;
            }
            if have.count() >= want.count() + StripeBlocks::STORE_BLOCKS {
                let start = self.stripes[i].start();
                let mut fresh = Stripe::new(&self.path, i, start, want);
                fresh.vol_idx = vol_idx;
                fresh.kind = 1;
                let tail = &mut self.stripes[i];
                tail.start = Bytes::new(start.count() + want.units());
                tail.len -= want;
                self.stripes.insert(i, fresh);
                self.free_space -= want;
                self.reindex();
                return (Some(i), Errata::new());
            }
            let whole = &mut self.stripes[i];
            whole.vol_idx = vol_idx;
            whole.kind = 1;
            self.free_space -= whole.len;
            return (Some(i), Errata::new());
        }
        (
            None,
            Errata::error(
                Code::NoSpace,
                format!("failed to allocate stripe of {len} - no free block large enough"),
            ),
        )
    }

    /// Replace all stripes with a single unallocated stripe covering the
    /// span.
    ///
    /// The runtime depends on the usable-block accounting being consistent
    /// with its own, so the maximum descriptor count and the content offset
    /// must reproduce its formula exactly.
    pub fn clear(&mut self) -> Errata {
        self.stripes.clear();

        let eff = self.len - self.base;
        let n_max = (eff.units() - SpanHeader::SIZEOF as i64)
            / (StripeBlocks::SCALE + StripeDescriptor::SIZEOF as i64);
        let n_max = n_max.max(1) as usize;
        self.offset = self.base + SpanHeader::disk_blocks(n_max);

        let start = Bytes::new(self.offset.units());
        let stripe = Stripe::new(&self.path, 0, start, self.len - self.offset);
        self.free_space = stripe.len();
        self.stripes.push(stripe);
        Errata::new()
    }

    /// Serialize the current stripe list into a fresh header and write it.
    ///
    /// Opened read-only, the header is still rebuilt in memory but nothing
    /// is written, which is what makes allocator dry-runs possible.
    pub fn update_header(&mut self) -> Errata {
        let mut zret = Errata::new();
        let n = self.stripes.len();

        let mut volume_mask = [false; MAX_VOLUME_IDX + 1];
        let mut hdr = SpanHeader {
            num_volumes: 0,
            num_free: 0,
            num_used: 0,
            num_blocks: self.len,
            stripes: Vec::with_capacity(n),
        };
        for stripe in &self.stripes {
            let free = stripe.is_free();
            if free {
                hdr.num_free += 1;
            } else {
                hdr.num_used += 1;
            }
            volume_mask[stripe.vol_idx() as usize] = true;
            hdr.stripes.push(StripeDescriptor {
                offset: stripe.start(),
                len: stripe.len(),
                vol_idx: u32::from(stripe.vol_idx()),
                kind: stripe.kind(),
                free,
            });
        }
        // Free stripes do not count toward the distinct volume total.
        volume_mask[0] = false;
        hdr.num_volumes = volume_mask.iter().filter(|&&v| v).count() as u32;

        let hdr_blocks = SpanHeader::disk_blocks(n);
        self.header = Some(hdr.clone());

        if !self.mode.is_writable() {
            zret.info("writing not enabled, no updates performed");
            return zret;
        }

        let align = self
            .geometry
            .block_size
            .count()
            .max(DEFAULT_HW_SECTOR_SIZE) as usize;
        let mut buf = match AlignedBuf::zeroed(hdr_blocks.units() as usize, align) {
            Ok(buf) => buf,
            Err(e) => return Errata::error(Code::IoWrite, format!("{e:#}")),
        };
        hdr.encode_into(&mut buf);
        if let Err(e) = self.file.write_all_at(&buf, HEADER_OFFSET as u64) {
            zret.push(
                Severity::Error,
                Code::IoWrite,
                format!("failed to update span {}: {e}", self.path.display()),
            );
        }
        zret
    }

    /// Destroy the on-disk header by zeroing its store block.
    pub fn clear_permanently(&mut self) -> Errata {
        let mut zret = Errata::new();
        if !self.mode.is_writable() {
            zret.info(format!(
                "clearing {} not performed, write not enabled",
                self.path.display()
            ));
            return zret;
        }
        let align = self
            .geometry
            .block_size
            .count()
            .max(DEFAULT_HW_SECTOR_SIZE) as usize;
        let buf = match AlignedBuf::zeroed(StoreBlocks::SCALE as usize, align) {
            Ok(buf) => buf,
            Err(e) => return Errata::error(Code::IoWrite, format!("{e:#}")),
        };
        match self.file.write_all_at(&buf, HEADER_OFFSET as u64) {
            Ok(()) => {
                zret.info(format!("cleared {} permanently on disk", self.path.display()));
            }
            Err(e) => {
                zret.push(
                    Severity::Error,
                    Code::IoWrite,
                    format!("clearing {} failed: {e}", self.path.display()),
                );
            }
        }
        zret
    }

    /// Probe and validate the metadata of one stripe.
    pub fn load_stripe_meta(&mut self, idx: usize) -> Errata {
        let file = &self.file;
        let geometry = &self.geometry;
        match self.stripes.get_mut(idx) {
            Some(stripe) => stripe.load_meta(file, geometry),
            None => Errata::error(Code::IoRead, format!("no stripe {idx} in span")),
        }
    }

    /// Load the directory of one stripe; requires loaded metadata.
    pub fn load_stripe_dir(&mut self, idx: usize) -> Errata {
        let file = &self.file;
        let geometry = &self.geometry;
        match self.stripes.get_mut(idx) {
            Some(stripe) => stripe.load_dir(file, geometry),
            None => Errata::error(Code::IoRead, format!("no stripe {idx} in span")),
        }
    }

    /// Write fresh metadata for one (empty) stripe.
    pub fn init_stripe_meta(&mut self, idx: usize) -> Errata {
        let writable = self.mode.is_writable();
        let file = &self.file;
        let geometry = &self.geometry;
        match self.stripes.get_mut(idx) {
            Some(stripe) => stripe.init_meta(file, geometry, writable),
            None => Errata::error(Code::IoRead, format!("no stripe {idx} in span")),
        }
    }

    /// Zero the metadata regions of one stripe.
    pub fn clear_stripe(&mut self, idx: usize) -> Errata {
        let writable = self.mode.is_writable();
        let file = &self.file;
        let geometry = &self.geometry;
        match self.stripes.get_mut(idx) {
            Some(stripe) => stripe.clear(file, geometry, writable),
            None => Errata::error(Code::IoRead, format!("no stripe {idx} in span")),
        }
    }

    /// Release the directory buffer of one stripe after inspection.
    pub fn drop_stripe_dir(&mut self, idx: usize) {
        if let Some(stripe) = self.stripes.get_mut(idx) {
            stripe.drop_dir();
        }
    }
}
