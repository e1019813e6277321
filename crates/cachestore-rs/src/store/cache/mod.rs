//! Top-level aggregation of spans and volumes.


use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::device::{FileKind, OpenMode, classify, slurp};
use crate::errata::{Code, Errata};
use crate::layout::dir::{ENTRIES_PER_BUCKET, SIZEOF_DIR};
use crate::store::span::Span;
use crate::units::{StoreBlocks, StripeBlocks};

/// Position of one stripe inside the cache: span index, stripe index.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StripeRef {
    pub span: usize,
    pub stripe: usize,
}

/// A logical volume: the stripes assigned to one index across all spans.
#[derive(Clone, Debug, Default)]
pub struct Volume {
    /// Total allocated size.
    pub size: StoreBlocks,
    pub stripes: Vec<StripeRef>,
}

/// How deep a span dump descends.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DumpDepth {
    Span,
    Stripe,
    Directory,
}

/// All loaded spans plus the volumes materialized from their stripes.
#[derive(Default)]
pub struct Cache {
    spans: Vec<Span>,
    volumes: BTreeMap<u8, Volume>,
}

impl Cache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a path: a regular file parses as a span config listing
    /// span paths; a device loads as a single span directly.
    pub fn load(&mut self, path: &Path, mode: OpenMode) -> Errata {
        let kind = match classify(path) {
            Ok(kind) => kind,
            Err(e) => {
                return Errata::error(Code::Open, format!("{} is not readable: {e:#}", path.display()));
            }
        };
        match kind {
            FileKind::Regular => self.load_span_config(path, mode),
            FileKind::BlockDevice | FileKind::CharDevice => self.load_span_direct(path, 0, mode),
            _ => Errata::error(
                Code::Open,
                format!("{} is not a valid span source", path.display()),
            ),
        }
    }

    /// Parse a span config file and load every span it names.
    pub fn load_span_config(&mut self, path: &Path, mode: OpenMode) -> Errata {
        let text = match slurp(path) {
            Ok(text) => text,
            Err(e) => return Errata::error(Code::Open, format!("{e:#}")),
        };
        let (entries, mut zret) = crate::config::parse_span_config(&text);
        for entry in entries {
            zret.absorb(self.load_span_direct(&entry.path, entry.vol_idx, mode));
        }
        zret
    }

    /// Load a single span and fold its stripes into the volume map.
    pub fn load_span_direct(&mut self, path: &Path, vol_idx: u8, mode: OpenMode) -> Errata {
        let (span, zret) = Span::load(path, mode);
        if let Some(mut span) = span {
            if span.header().is_none() {
                // Uninitialized storage becomes one free stripe.
                span.clear();
            }
            span.set_forced_vol(vol_idx);
            self.spans.push(span);
            self.index_span(self.spans.len() - 1);
        }
        zret
    }

    fn index_span(&mut self, si: usize) {
        for stripe in self.spans[si].stripes() {
            if stripe.is_free() {
                continue;
            }
            let vol = self.volumes.entry(stripe.vol_idx()).or_default();
            vol.size += stripe.len();
            vol.stripes.push(StripeRef {
                span: si,
                stripe: stripe.idx(),
            });
        }
    }

    #[must_use]
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn spans_mut(&mut self) -> &mut [Span] {
        &mut self.spans
    }

    #[must_use]
    pub fn volumes(&self) -> &BTreeMap<u8, Volume> {
        &self.volumes
    }

    /// Total allocatable size across all spans, each rounded down to whole
    /// stripe blocks.
    #[must_use]
    pub fn calc_total_span_configured_size(&self) -> StripeBlocks {
        let mut zret = StripeBlocks::new(0);
        for span in &self.spans {
            zret += StripeBlocks::round_down(span.len().to_bytes());
        }
        zret
    }

    /// Render the span tree.
    ///
    /// Depth [`DumpDepth::Stripe`] probes each stripe's metadata; depth
    /// [`DumpDepth::Directory`] additionally loads the directory and checks
    /// its bucket chains.
    ///
    /// # Errors
    /// Returns an error if the sink rejects a write.
    pub fn dump_spans(&mut self, depth: DumpDepth, out: &mut dyn Write) -> std::io::Result<()> {
        for si in 0..self.spans.len() {
            let span = &self.spans[si];
            match span.header() {
                None => {
                    writeln!(out, "Span: {} is uninitialized", span.path().display())?;
                }
                Some(hdr) => {
                    writeln!(
                        out,
                        "Span: {} {} Volumes {} in use {} free {} stripes {} blocks",
                        span.path().display(),
                        hdr.num_volumes,
                        hdr.num_used,
                        hdr.num_free,
                        hdr.stripes.len(),
                        hdr.num_blocks.count(),
                    )?;
                }
            }
            for i in 0..self.spans[si].stripes().len() {
                {
                    let stripe = &self.spans[si].stripes()[i];
                    writeln!(
                        out,
                        "    : [{}] @ {} len={} blocks vol={} type={} {}",
                        stripe.hash_hex(),
                        stripe.start().count(),
                        stripe.len().count(),
                        stripe.vol_idx(),
                        stripe.kind(),
                        if stripe.is_free() { "free" } else { "in-use" },
                    )?;
                }
                if depth < DumpDepth::Stripe {
                    continue;
                }
                let meta_result = self.spans[si].load_stripe_meta(i);
                if meta_result.is_ok() {
                    let stripe = &self.spans[si].stripes()[i];
                    let entries = stripe.buckets() * stripe.segments() * ENTRIES_PER_BUCKET;
                    writeln!(
                        out,
                        "      Stripe found: {} segments with {} buckets per segment for {} total directory entries taking {} bytes",
                        stripe.segments(),
                        stripe.buckets(),
                        entries,
                        entries * SIZEOF_DIR,
                    )?;
                } else {
                    write!(out, "{meta_result}")?;
                    continue;
                }
                if depth < DumpDepth::Directory {
                    continue;
                }
                let dir_result = self.spans[si].load_stripe_dir(i);
                if dir_result.is_ok() {
                    let stripe = &self.spans[si].stripes()[i];
                    match stripe.check_directory() {
                        Some(faults) if faults.is_empty() => {
                            writeln!(out, "      Directory chains check clean")?;
                        }
                        Some(faults) => {
                            writeln!(out, "      Directory chains report {} faults", faults.len())?;
                            for fault in faults {
                                writeln!(out, "        {fault:?}")?;
                            }
                        }
                        None => {}
                    }
                } else {
                    write!(out, "{dir_result}")?;
                }
                self.spans[si].drop_stripe_dir(i);
            }
        }
        Ok(())
    }

    /// Render one line per volume: index, stripe count, total bytes.
    ///
    /// # Errors
    /// Returns an error if the sink rejects a write.
    pub fn dump_volumes(&self, out: &mut dyn Write) -> std::io::Result<()> {
        for (idx, vol) in &self.volumes {
            writeln!(
                out,
                "Volume {} has {} stripes and {} bytes",
                idx,
                vol.stripes.len(),
                vol.size.units(),
            )?;
        }
        Ok(())
    }
}
