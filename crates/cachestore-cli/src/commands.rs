//! Command implementations: each loads what it needs and returns the
//! accumulated errata for the exit path to judge.

use std::io::Write;
use std::path::Path;

use cachestore_rs::alloc::VolumeAllocator;
use cachestore_rs::device::OpenMode;
use cachestore_rs::errata::{Code, Errata, Severity};
use cachestore_rs::store::cache::{Cache, DumpDepth};
use tracing::info;

fn require<'a>(path: Option<&'a Path>, what: &str) -> Result<&'a Path, Errata> {
    path.ok_or_else(|| Errata::error(Code::ConfigParse, format!("{what} config file not set")))
}

/// `list` / `list stripes` / `list directory`.
pub fn list(spans: Option<&Path>, mode: OpenMode, depth: DumpDepth) -> Errata {
    let span_file = match require(spans, "span") {
        Ok(path) => path,
        Err(zret) => return zret,
    };
    let mut cache = Cache::new();
    let mut zret = cache.load(span_file, mode);
    if !zret.is_ok() {
        return zret;
    }
    let out = std::io::stdout();
    let mut out = out.lock();
    if let Err(e) = cache.dump_spans(depth, &mut out) {
        zret.push(
            Severity::Error,
            Code::IoWrite,
            format!("dump failed: {e}"),
        );
        return zret;
    }
    if let Err(e) = cache.dump_volumes(&mut out) {
        zret.push(
            Severity::Error,
            Code::IoWrite,
            format!("dump failed: {e}"),
        );
    }
    zret
}

/// `clear`: destroy every span header on disk.
pub fn clear(spans: Option<&Path>, mode: OpenMode) -> Errata {
    let span_file = match require(spans, "span") {
        Ok(path) => path,
        Err(zret) => return zret,
    };
    let mut cache = Cache::new();
    let mut zret = cache.load(span_file, mode);
    if !zret.is_ok() {
        return zret;
    }
    for span in cache.spans_mut() {
        info!("clearing span {}", span.path().display());
        zret.absorb(span.clear_permanently());
    }
    zret
}

/// `volumes`: run the share arithmetic without touching storage.
pub fn simulate(spans: Option<&Path>, volumes: Option<&Path>, mode: OpenMode) -> Errata {
    let (span_file, volume_file) = match config_pair(spans, volumes) {
        Ok(pair) => pair,
        Err(zret) => return zret,
    };
    let (va, mut zret) = VolumeAllocator::load(span_file, volume_file, mode);
    let Some(mut va) = va else {
        return zret;
    };
    let out = std::io::stdout();
    let mut out = out.lock();
    zret.absorb(va.simulate(&mut out));
    let _ = out.flush();
    zret
}

/// `alloc free`: fill empty spans and write their headers.
pub fn alloc_free(spans: Option<&Path>, volumes: Option<&Path>, mode: OpenMode) -> Errata {
    let (span_file, volume_file) = match config_pair(spans, volumes) {
        Ok(pair) => pair,
        Err(zret) => return zret,
    };
    let (va, mut zret) = VolumeAllocator::load(span_file, volume_file, mode);
    let Some(mut va) = va else {
        return zret;
    };
    let out = std::io::stdout();
    let mut out = out.lock();
    zret.absorb(va.fill_empty_spans(&mut out));
    let _ = out.flush();
    zret
}

fn config_pair<'a>(
    spans: Option<&'a Path>,
    volumes: Option<&'a Path>,
) -> Result<(&'a Path, &'a Path), Errata> {
    let mut zret = Errata::new();
    if spans.is_none() {
        zret.push(
            Severity::Error,
            Code::ConfigParse,
            "span config file not set",
        );
    }
    if volumes.is_none() {
        zret.push(
            Severity::Error,
            Code::ConfigParse,
            "volume config file not set",
        );
    }
    match (spans, volumes) {
        (Some(s), Some(v)) => Ok((s, v)),
        _ => Err(zret),
    }
}
