//! Deficit-weighted assignment of span space to configured volumes.

#[cfg(test)]
mod alloc_tests;

use std::io::Write;
use std::path::Path;

use crate::config::VolumeConfig;
use crate::device::OpenMode;
use crate::errata::Errata;
use crate::store::cache::Cache;
use crate::units::StripeBlocks;

/// Share-precision factor: deficits are thousandths of a volume's target.
const SCALE: i64 = 1000;

/// Working allocation state for one configured volume.
#[derive(Clone, Debug)]
struct Slot {
    idx: u8,
    /// Allocation target.
    alloc: StripeBlocks,
    /// Current actual size.
    size: StripeBlocks,
    deficit: i64,
    shares: i64,
}

/// Fills empty spans with new stripes so volume sizes approach their
/// configured targets.
pub struct VolumeAllocator {
    cache: Cache,
    slots: Vec<Slot>,
}

impl VolumeAllocator {
    /// Build the allocator from a span config and a volume config.
    ///
    /// Percent targets are validated and converted against the total
    /// configured span size; each volume's current size is seeded from the
    /// loaded cache.
    pub fn load(span_file: &Path, volume_file: &Path, mode: OpenMode) -> (Option<Self>, Errata) {
        let (vols, mut zret) = VolumeConfig::load(volume_file);
        let Some(mut vols) = vols else {
            return (None, zret);
        };
        zret.absorb(vols.validate_percent_allocation());
        if !zret.is_ok() {
            return (None, zret);
        }

        let mut cache = Cache::new();
        zret.absorb(cache.load(span_file, mode));
        if !zret.is_ok() {
            return (None, zret);
        }

        let total = cache.calc_total_span_configured_size();
        vols.convert_to_absolute(total);

        let mut slots = Vec::with_capacity(vols.len());
        for v in vols.volumes() {
            let size = cache
                .volumes()
                .get(&v.idx)
                .map(|vol| StripeBlocks::round_down(vol.size.to_bytes()))
                .unwrap_or_default();
            slots.push(Slot {
                idx: v.idx,
                alloc: v.alloc,
                size,
                deficit: 0,
                shares: 0,
            });
        }
        (Some(Self { cache, slots }), zret)
    }

    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut Cache {
        &mut self.cache
    }

    /// Recompute deficits and shares; returns the share total.
    fn weigh(slots: &mut [Slot]) -> i64 {
        let mut total_shares = 0;
        for v in slots {
            let delta = v.alloc.count() - v.size.count();
            if delta > 0 && v.alloc.count() > 0 {
                v.deficit = (delta * SCALE) / v.alloc.count();
                v.shares = delta * v.deficit;
                total_shares += v.shares;
            } else {
                v.shares = 0;
            }
        }
        total_shares
    }

    /// Neediest volumes first; ties keep ascending index order.
    fn order(slots: &mut [Slot]) {
        slots.sort_by(|lhs, rhs| rhs.deficit.cmp(&lhs.deficit).then(lhs.idx.cmp(&rhs.idx)));
    }

    /// Allocate stripes on every empty span and flush its header.
    ///
    /// A span that runs out of room reports `NoSpace` and the remaining
    /// volumes still get their turn; nothing is fatal to the pass.
    pub fn fill_empty_spans(&mut self, out: &mut dyn Write) -> Errata {
        let mut zret = Errata::new();

        for si in 0..self.cache.spans().len() {
            if !self.cache.spans()[si].is_empty() {
                continue;
            }

            let mut total_shares = Self::weigh(&mut self.slots);

            let span = &mut self.cache.spans_mut()[si];
            let _ = writeln!(
                out,
                "Allocating {} from span {}",
                StripeBlocks::round_down(span.len().to_bytes()),
                span.path().display()
            );

            let span_blocks = StripeBlocks::round_up(span.free_space().to_bytes());
            let mut span_used = StripeBlocks::new(0);

            Self::order(&mut self.slots);
            for v in &mut self.slots {
                if v.shares == 0 || total_shares == 0 {
                    continue;
                }
                let room = (span_blocks - span_used).count();
                let mut n = (room * v.shares + total_shares - 1) / total_shares;
                // A large empty volume can dominate the shares enough to
                // take more than it actually needs when the others are
                // small or full.
                n = n.min(v.alloc.count() - v.size.count());
                if n <= 0 {
                    continue;
                }
                let n = StripeBlocks::new(n);
                let (allocated, err) = span.alloc_stripe(v.idx, n);
                v.size += n;
                span_used += n;
                total_shares -= v.shares;
                if allocated.is_some() {
                    let _ = writeln!(out, "           {} to volume {}", n, v.idx);
                } else {
                    // NoSpace here is non-fatal; later volumes still get
                    // their turn at this span.
                    zret.absorb(err);
                }
            }
            let _ = writeln!(out, "     Total {span_used}");
            zret.absorb(span.update_header());
        }
        zret
    }

    /// Run the share computation against every span with free space and
    /// render the arithmetic, without touching any span.
    pub fn simulate(&mut self, out: &mut dyn Write) -> Errata {
        let zret = Errata::new();

        for si in 0..self.cache.spans().len() {
            let span = &self.cache.spans()[si];
            if span.free_space().count() <= 0 {
                continue;
            }

            let mut total_shares = Self::weigh(&mut self.slots);
            for v in &self.slots {
                if v.shares > 0 {
                    let _ = writeln!(
                        out,
                        "Volume {} allocated {} has {} needs {} deficit {}",
                        v.idx,
                        v.alloc,
                        v.size,
                        v.alloc - v.size,
                        v.deficit
                    );
                }
            }

            let span_blocks = StripeBlocks::round_down(span.free_space().to_bytes());
            let mut span_used = StripeBlocks::new(0);
            let _ = writeln!(out, "Allocation from span of {span_blocks}");

            Self::order(&mut self.slots);
            for v in &mut self.slots {
                if v.shares == 0 || total_shares == 0 {
                    continue;
                }
                let room = (span_blocks - span_used).count();
                let mut n = (room * v.shares + total_shares - 1) / total_shares;
                let delta = v.alloc.count() - v.size.count();
                n = n.min(delta);
                if n <= 0 {
                    continue;
                }
                let n = StripeBlocks::new(n);
                v.size += n;
                span_used += n;
                let _ = writeln!(
                    out,
                    "Volume {} allocated {} of {} needed to total of {} of {}",
                    v.idx,
                    n,
                    StripeBlocks::new(delta),
                    v.size,
                    v.alloc
                );
                let _ = writeln!(
                    out,
                    "         with {} shares of {} total - {:.1}%",
                    v.shares,
                    total_shares,
                    (v.shares * SCALE / total_shares) as f64 / 10.0
                );
                total_shares -= v.shares;
            }
            let _ = writeln!(out, "Span allocated {span_used} of {span_blocks}");
        }
        zret
    }

    #[cfg(test)]
    fn slot_sizes(&self) -> Vec<(u8, i64)> {
        self.slots.iter().map(|v| (v.idx, v.size.count())).collect()
    }
}
