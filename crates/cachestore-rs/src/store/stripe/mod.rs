//! One carved region of a span and its four metadata copies.


use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::device::{AlignedBuf, DEFAULT_HW_SECTOR_SIZE, Geometry};
use crate::errata::{Code, Errata, Severity};
use crate::layout::dir::{self, CacheDirEntry, ChainFault, DirGeometry};
use crate::layout::stripe_meta::{FREELIST_EMPTY, StripeMeta, Version, probe};
use crate::layout::{CACHE_DB_MAJOR_VERSION, CACHE_DB_MINOR_VERSION};
use crate::units::{Bytes, StoreBlocks};

/// Which redundant copy of the stripe metadata.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MetaCopy {
    A = 0,
    B = 1,
}

const HEAD: usize = 0;
const FOOT: usize = 1;

/// Bulk read size while scanning for Footer-A.
const BULK_READ: i64 = 1 << 24;

/// A contiguous subregion of a span, either free or assigned to a volume.
pub struct Stripe {
    pub(crate) start: Bytes,
    pub(crate) content: Bytes,
    pub(crate) len: StoreBlocks,
    pub(crate) vol_idx: u8,
    pub(crate) kind: u8,
    pub(crate) idx: usize,
    buckets: i64,
    segments: i64,
    header_len: StoreBlocks,
    hash_text: String,
    hash_id: [u8; 32],
    live_copy: Option<MetaCopy>,
    meta: [[Option<StripeMeta>; 2]; 2],
    meta_pos: [[Bytes; 2]; 2],
    dir: Option<Vec<u8>>,
}

impl Stripe {
    /// Construct from a descriptor's position and length. The fingerprint
    /// binds the stripe to its span path and placement so stripes sharing a
    /// volume stay distinguishable.
    #[must_use]
    pub fn new(span_path: &Path, idx: usize, start: Bytes, len: StoreBlocks) -> Self {
        let hash_text = format!("{} {}:{}", span_path.display(), start.count(), len.count());
        let hash_id = Sha256::digest(hash_text.as_bytes()).into();
        Self {
            start,
            content: Bytes::new(0),
            len,
            vol_idx: 0,
            kind: 0,
            idx,
            buckets: 0,
            segments: 0,
            header_len: StoreBlocks::new(0),
            hash_text,
            hash_id,
            live_copy: None,
            meta: [[None, None], [None, None]],
            meta_pos: [[Bytes::new(0), Bytes::new(0)], [Bytes::new(0), Bytes::new(0)]],
            dir: None,
        }
    }

    /// Unallocated?
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.vol_idx == 0
    }

    #[must_use]
    pub fn start(&self) -> Bytes {
        self.start
    }

    #[must_use]
    pub fn content(&self) -> Bytes {
        self.content
    }

    #[must_use]
    pub fn len(&self) -> StoreBlocks {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len.is_zero()
    }

    #[must_use]
    pub fn vol_idx(&self) -> u8 {
        self.vol_idx
    }

    #[must_use]
    pub fn kind(&self) -> u8 {
        self.kind
    }

    #[must_use]
    pub fn idx(&self) -> usize {
        self.idx
    }

    #[must_use]
    pub fn buckets(&self) -> i64 {
        self.buckets
    }

    #[must_use]
    pub fn segments(&self) -> i64 {
        self.segments
    }

    #[must_use]
    pub fn live_copy(&self) -> Option<MetaCopy> {
        self.live_copy
    }

    #[must_use]
    pub fn meta(&self, copy: MetaCopy, foot: bool) -> Option<&StripeMeta> {
        self.meta[copy as usize][usize::from(foot)].as_ref()
    }

    #[must_use]
    pub fn meta_pos(&self, copy: MetaCopy, foot: bool) -> Bytes {
        self.meta_pos[copy as usize][usize::from(foot)]
    }

    #[must_use]
    pub fn hash_text(&self) -> &str {
        &self.hash_text
    }

    /// Short hex form of the fingerprint, for dumps.
    #[must_use]
    pub fn hash_hex(&self) -> String {
        self.hash_id[..4].iter().map(|b| format!("{b:02x}")).collect()
    }

    #[must_use]
    pub fn directory(&self) -> Option<&[u8]> {
        self.dir.as_deref()
    }

    fn read_block(file: &File, pos: i64, align: usize) -> Result<AlignedBuf, Errata> {
        let mut buf = AlignedBuf::zeroed(StoreBlocks::SCALE as usize, align)
            .map_err(|e| Errata::error(Code::IoRead, format!("{e:#}")))?;
        file.read_exact_at(&mut buf, pos as u64)
            .map_err(|e| Errata::error(Code::IoRead, format!("read at {pos} failed: {e}")))?;
        Ok(buf)
    }

    /// Locate the four metadata copies and pick the authoritative one.
    ///
    /// Header-A must sit at the stripe start; Footer-A is found by a bounded
    /// forward scan; copy B is expected at computable offsets after that.
    /// The copy whose header and footer agree on `sync_serial` (preferring
    /// the newer serial) wins and seeds the live geometry.
    pub fn load_meta(&mut self, file: &File, geometry: &Geometry) -> Errata {
        let mut zret = Errata::new();

        let io_align = geometry.block_size.count();
        if io_align > StoreBlocks::SCALE {
            self.dir = None;
            return Errata::error(
                Code::AlignmentTooLarge,
                format!(
                    "cannot load stripe {}: I/O block alignment {} exceeds the probe buffer alignment {}",
                    self.idx,
                    io_align,
                    StoreBlocks::SCALE
                ),
            );
        }
        let align = io_align.max(DEFAULT_HW_SECTOR_SIZE) as usize;

        let start = self.start.count();
        let end = start + self.len.units();

        // Header A must be at the start of the stripe.
        let block = match Self::read_block(file, start, align) {
            Ok(b) => b,
            Err(e) => {
                self.dir = None;
                return e;
            }
        };
        let head_a = match StripeMeta::decode(&block) {
            Some(meta) if meta.validate() => meta,
            _ => {
                self.dir = None;
                zret.push(
                    Severity::Error,
                    Code::HeaderANotFound,
                    format!("stripe {}: header A not found", self.idx),
                );
                return zret;
            }
        };
        self.meta_pos[MetaCopy::A as usize][HEAD] = self.start;

        // Search for Footer A, skipping false positives. Average object
        // sizes over ~160 bytes cap the directory at 1/16 of the stripe.
        let limit = start + self.len.units() / 16;
        let mut pos = start + StoreBlocks::SCALE;
        let mut footer: Option<(i64, StripeMeta)> = None;
        let mut bulk = match AlignedBuf::zeroed(BULK_READ as usize, align) {
            Ok(b) => b,
            Err(e) => return Errata::error(Code::IoRead, format!("{e:#}")),
        };
        while pos < limit {
            let want = BULK_READ.min(end - pos);
            if want < StoreBlocks::SCALE {
                break;
            }
            let want = (want / StoreBlocks::SCALE * StoreBlocks::SCALE) as usize;
            if let Err(e) = file.read_exact_at(&mut bulk[..want], pos as u64) {
                self.dir = None;
                zret.push(
                    Severity::Error,
                    Code::IoRead,
                    format!("stripe {}: read at {pos} failed: {e}", self.idx),
                );
                return zret;
            }
            if let Some((off, meta)) = probe(&bulk[..want], Some(&head_a)) {
                footer = Some((pos + off as i64, meta));
                break;
            }
            pos += want as i64;
        }
        let Some((foot_a_pos, foot_a)) = footer else {
            self.dir = None;
            zret.push(
                Severity::Error,
                Code::FooterANotFound,
                format!("stripe {}: footer A not found before the scan limit", self.idx),
            );
            return zret;
        };
        let foot_a_pos = StoreBlocks::round_down(Bytes::new(foot_a_pos)).units();
        self.meta[MetaCopy::A as usize][HEAD] = Some(head_a);
        self.meta[MetaCopy::A as usize][FOOT] = Some(foot_a);
        self.meta_pos[MetaCopy::A as usize][FOOT] = Bytes::new(foot_a_pos);

        // Copy B is cheap to retrieve now that the offsets are known:
        // Header B immediately after Footer A, Footer B at the same
        // header-to-footer distance.
        let delta = foot_a_pos - start;
        let head_b_pos = foot_a_pos + StoreBlocks::SCALE;
        if head_b_pos + StoreBlocks::SCALE <= end
            && let Ok(block) = Self::read_block(file, head_b_pos, align)
            && let Some(meta) = StripeMeta::decode(&block)
            && meta.validate()
        {
            self.meta[MetaCopy::B as usize][HEAD] = Some(meta);
            self.meta_pos[MetaCopy::B as usize][HEAD] = Bytes::new(head_b_pos);

            let foot_b_pos = head_b_pos + delta;
            if foot_b_pos + StoreBlocks::SCALE <= end
                && let Ok(block) = Self::read_block(file, foot_b_pos, align)
                && let Some(meta) = StripeMeta::decode(&block)
                && meta.validate()
            {
                self.meta[MetaCopy::B as usize][FOOT] = Some(meta);
                self.meta_pos[MetaCopy::B as usize][FOOT] = Bytes::new(foot_b_pos);
            }
        }

        let chosen = self.choose_copy();
        match chosen {
            Some(copy) => {
                self.live_copy = Some(copy);
                self.update_live_data(copy);
                if let Err(e) = self.reload_freelist(file, align, copy) {
                    zret.absorb(e);
                }
            }
            None => {
                self.dir = None;
                zret.push(
                    Severity::Error,
                    Code::StripeSyncInvalid,
                    format!(
                        "stripe {}: metadata candidates found but sync serial data not valid",
                        self.idx
                    ),
                );
            }
        }
        zret
    }

    fn choose_copy(&self) -> Option<MetaCopy> {
        let a = MetaCopy::A as usize;
        let b = MetaCopy::B as usize;
        let head_a = self.meta[a][HEAD].as_ref()?;
        let foot_a = self.meta[a][FOOT].as_ref()?;
        let b_pair = self.meta[b][HEAD].as_ref().zip(self.meta[b][FOOT].as_ref());

        let a_clean = head_a.sync_serial == foot_a.sync_serial;
        match b_pair {
            None => a_clean.then_some(MetaCopy::A),
            Some((head_b, foot_b)) => {
                let b_clean = head_b.sync_serial == foot_b.sync_serial;
                if a_clean && (!b_clean || head_a.sync_serial > head_b.sync_serial) {
                    Some(MetaCopy::A)
                } else if b_clean {
                    Some(MetaCopy::B)
                } else {
                    None
                }
            }
        }
    }

    /// Derive segments and buckets from the chosen copy's header-to-footer
    /// distance.
    fn update_live_data(&mut self, copy: MetaCopy) {
        let c = copy as usize;
        let delta = self.meta_pos[c][FOOT] - self.meta_pos[c][HEAD];
        let geom = dir::derive(delta);
        self.buckets = geom.buckets;
        self.segments = geom.segments;
        self.header_len = geom.header_len;
    }

    /// Re-read the chosen header copy at its full length and decode the
    /// per-segment freelist heads, which can spill past the first block.
    fn reload_freelist(&mut self, file: &File, align: usize, copy: MetaCopy) -> Result<(), Errata> {
        let c = copy as usize;
        let pos = self.meta_pos[c][HEAD].count();
        let len = self.header_len.units() as usize;
        let mut buf = AlignedBuf::zeroed(len, align)
            .map_err(|e| Errata::error(Code::IoRead, format!("{e:#}")))?;
        file.read_exact_at(&mut buf, pos as u64)
            .map_err(|e| Errata::error(Code::IoRead, format!("read at {pos} failed: {e}")))?;
        if let Some(meta) = self.meta[c][HEAD].as_mut() {
            meta.decode_freelist(&buf, self.segments as usize);
        }
        Ok(())
    }

    #[must_use]
    pub fn dir_geometry(&self) -> DirGeometry {
        DirGeometry {
            segments: self.segments,
            buckets: self.buckets,
            header_len: self.header_len,
        }
    }

    /// Load the directory of the authoritative copy into memory.
    pub fn load_dir(&mut self, file: &File, geometry: &Geometry) -> Errata {
        let Some(copy) = self.live_copy else {
            return Errata::error(
                Code::IoRead,
                format!("stripe {}: directory requested before metadata", self.idx),
            );
        };
        let c = copy as usize;
        let geom = self.dir_geometry();
        let dir_bytes = geom.dir_bytes();
        if dir_bytes == 0 {
            self.dir = Some(Vec::new());
            return Errata::new();
        }
        let align = geometry
            .block_size
            .count()
            .max(DEFAULT_HW_SECTOR_SIZE) as usize;
        let dir_start = self.meta_pos[c][HEAD].count() + self.header_len.units();
        let read_len = StoreBlocks::round_up(Bytes::new(dir_bytes)).units() as usize;
        let mut buf = match AlignedBuf::zeroed(read_len, align) {
            Ok(b) => b,
            Err(e) => return Errata::error(Code::IoRead, format!("{e:#}")),
        };
        if let Err(e) = file.read_exact_at(&mut buf, dir_start as u64) {
            return Errata::error(
                Code::IoRead,
                format!("stripe {}: directory read at {dir_start} failed: {e}", self.idx),
            );
        }
        self.dir = Some(buf[..dir_bytes as usize].to_vec());
        Errata::new()
    }

    /// Drop the loaded directory buffer.
    pub fn drop_dir(&mut self) {
        self.dir = None;
    }

    /// Does a directory entry point inside this stripe's content?
    #[must_use]
    pub fn dir_valid(&self, e: CacheDirEntry) -> bool {
        e.in_use() && (e.offset() as i64) * dir::CACHE_BLOCK_SIZE <= self.len.units()
    }

    /// Walk every bucket chain of the loaded directory.
    #[must_use]
    pub fn check_directory(&self) -> Option<Vec<ChainFault>> {
        let dir = self.dir.as_deref()?;
        Some(dir::check_bucket_chains(dir, &self.dir_geometry()))
    }

    /// Synthesize fresh metadata for an empty stripe and write all four
    /// copies.
    pub fn init_meta(&mut self, file: &File, geometry: &Geometry, writable: bool) -> Errata {
        let layout = dir::fresh(self.len.to_bytes());
        self.segments = layout.geom.segments;
        self.buckets = layout.geom.buckets;
        self.header_len = layout.geom.header_len;

        let start = self.start.count();
        let dirlen = layout.dirlen.count();
        let foot_off = dirlen - dir::footer_blocks().units();
        self.meta_pos[MetaCopy::A as usize][HEAD] = Bytes::new(start);
        self.meta_pos[MetaCopy::A as usize][FOOT] = Bytes::new(start + foot_off);
        self.meta_pos[MetaCopy::B as usize][HEAD] = Bytes::new(start + dirlen);
        self.meta_pos[MetaCopy::B as usize][FOOT] = Bytes::new(start + dirlen + foot_off);
        self.content = Bytes::new(start + 2 * dirlen);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let fresh = StripeMeta {
            magic: StripeMeta::MAGIC,
            version: Version {
                major: CACHE_DB_MAJOR_VERSION,
                minor: CACHE_DB_MINOR_VERSION,
            },
            create_time: now,
            write_pos: self.content.count(),
            last_write_pos: self.content.count(),
            agg_pos: self.content.count(),
            // The generation token must never be zero.
            generation: (now as u32) | 1,
            phase: 0,
            cycle: 0,
            sync_serial: 0,
            write_serial: 0,
            dirty: 0,
            sector_size: geometry.block_size.count() as u32,
            freelist: Vec::new(),
        };
        let mut header = fresh.clone();
        header.freelist = vec![FREELIST_EMPTY; self.segments as usize];

        self.meta[MetaCopy::A as usize][HEAD] = Some(header.clone());
        self.meta[MetaCopy::A as usize][FOOT] = Some(fresh.clone());
        self.meta[MetaCopy::B as usize][HEAD] = Some(header);
        self.meta[MetaCopy::B as usize][FOOT] = Some(fresh);
        self.live_copy = Some(MetaCopy::A);

        self.update_header_footer(file, geometry, writable)
    }

    /// Write the in-memory metadata copies to their four disk positions.
    pub fn update_header_footer(
        &mut self,
        file: &File,
        geometry: &Geometry,
        writable: bool,
    ) -> Errata {
        let mut zret = Errata::new();
        if !writable {
            zret.info(format!(
                "stripe {}: writing not enabled, no updates performed",
                self.idx
            ));
            return zret;
        }
        let align = geometry
            .block_size
            .count()
            .max(DEFAULT_HW_SECTOR_SIZE) as usize;
        for c in [MetaCopy::A as usize, MetaCopy::B as usize] {
            for slot in [HEAD, FOOT] {
                let Some(meta) = self.meta[c][slot].as_ref() else {
                    continue;
                };
                let blocks = if slot == HEAD {
                    self.header_len.max(StoreBlocks::new(1))
                } else {
                    dir::footer_blocks()
                };
                let mut buf = match AlignedBuf::zeroed(blocks.units() as usize, align) {
                    Ok(b) => b,
                    Err(e) => return Errata::error(Code::IoWrite, format!("{e:#}")),
                };
                meta.encode_into(&mut buf);
                let pos = self.meta_pos[c][slot].count();
                if let Err(e) = file.write_all_at(&buf, pos as u64) {
                    zret.push(
                        Severity::Error,
                        Code::IoWrite,
                        format!("stripe {}: metadata write at {pos} failed: {e}", self.idx),
                    );
                    return zret;
                }
            }
        }
        zret
    }

    /// Zero the four metadata copy regions on disk; content is untouched.
    pub fn clear(&mut self, file: &File, geometry: &Geometry, writable: bool) -> Errata {
        let mut zret = Errata::new();
        if !writable {
            zret.info(format!(
                "stripe {}: clearing not performed, write not enabled",
                self.idx
            ));
            return zret;
        }
        // Fall back to the fresh layout when the stripe was never probed.
        if self.meta_pos[MetaCopy::A as usize][FOOT].count() == 0 {
            let layout = dir::fresh(self.len.to_bytes());
            let start = self.start.count();
            let dirlen = layout.dirlen.count();
            let foot_off = dirlen - dir::footer_blocks().units();
            self.header_len = layout.geom.header_len;
            self.meta_pos[MetaCopy::A as usize][HEAD] = Bytes::new(start);
            self.meta_pos[MetaCopy::A as usize][FOOT] = Bytes::new(start + foot_off);
            self.meta_pos[MetaCopy::B as usize][HEAD] = Bytes::new(start + dirlen);
            self.meta_pos[MetaCopy::B as usize][FOOT] = Bytes::new(start + dirlen + foot_off);
        }
        let align = geometry
            .block_size
            .count()
            .max(DEFAULT_HW_SECTOR_SIZE) as usize;
        for c in [MetaCopy::A as usize, MetaCopy::B as usize] {
            for slot in [HEAD, FOOT] {
                let blocks = if slot == HEAD {
                    self.header_len.max(StoreBlocks::new(1))
                } else {
                    dir::footer_blocks()
                };
                let buf = match AlignedBuf::zeroed(blocks.units() as usize, align) {
                    Ok(b) => b,
                    Err(e) => return Errata::error(Code::IoWrite, format!("{e:#}")),
                };
                let pos = self.meta_pos[c][slot].count();
                if let Err(e) = file.write_all_at(&buf, pos as u64) {
                    zret.push(
                        Severity::Error,
                        Code::IoWrite,
                        format!("stripe {}: metadata clear at {pos} failed: {e}", self.idx),
                    );
                    return zret;
                }
            }
        }
        self.meta = [[None, None], [None, None]];
        self.live_copy = None;
        self.dir = None;
        zret
    }
}
