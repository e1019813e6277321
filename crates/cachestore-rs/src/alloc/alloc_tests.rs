use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::{TempDir, tempdir};

use crate::alloc::VolumeAllocator;
use crate::device::OpenMode;
use crate::errata::Code;
use crate::store::span::Span;
use crate::units::StripeBlocks;

const GIB: u64 = 1 << 30;

fn make_image(dir: &TempDir, name: &str, len: u64) -> PathBuf {
    let path = dir.path().join(name);
    let file = std::fs::File::create(&path).expect("create image");
    file.set_len(len).expect("set_len");
    path
}

fn write_file(dir: &TempDir, name: &str, text: &str) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).expect("create file");
    file.write_all(text.as_bytes()).expect("write file");
    path
}

fn allocate_one(path: &Path, vol: u8, blocks: i64) {
    let (span, zret) = Span::load(path, OpenMode::ReadWrite);
    let mut span = span.expect("span");
    assert!(zret.is_ok(), "{zret}");
    span.clear();
    let (idx, zret) = span.alloc_stripe(vol, StripeBlocks::new(blocks));
    assert!(zret.is_ok(), "{zret}");
    assert!(idx.is_some());
    assert!(span.update_header().is_ok());
}

fn reload(path: &Path) -> Span {
    let (span, zret) = Span::load(path, OpenMode::ReadOnly);
    assert!(zret.is_ok(), "{zret}");
    span.expect("span")
}

#[test]
fn fifty_fifty_split_fills_a_sixteen_gib_span() {
    let dir = tempdir().expect("tmp dir");
    let img = make_image(&dir, "a.img", 16 * GIB);
    let spans = write_file(&dir, "spans.cfg", &format!("{}\n", img.display()));
    let vols = write_file(&dir, "vols.cfg", "volume=1 size=50%\nvolume=2 size=50%\n");

    let (va, zret) = VolumeAllocator::load(&spans, &vols, OpenMode::ReadWrite);
    let mut va = va.expect("allocator");
    assert!(zret.is_ok(), "{zret}");

    let mut out = Vec::new();
    let zret = va.fill_empty_spans(&mut out);
    assert!(zret.is_ok(), "{zret}");

    let span = reload(&img);
    let hdr = span.header().expect("header written");
    assert_eq!(hdr.num_used, 2);
    assert_eq!(hdr.num_free, 0);
    assert_eq!(hdr.num_volumes, 2);

    // Volume 1 takes its even 64-block share; volume 2 absorbs the
    // remainder, a few store blocks shy of 64 whole stripe blocks.
    assert_eq!(span.stripes().len(), 2);
    let first = &span.stripes()[0];
    let second = &span.stripes()[1];
    assert_eq!(first.vol_idx(), 1);
    assert_eq!(first.len(), StripeBlocks::new(64).to_store_blocks());
    assert_eq!(second.vol_idx(), 2);
    assert_eq!(
        StripeBlocks::round_up(second.len().to_bytes()),
        StripeBlocks::new(64)
    );
}

#[test]
fn allocation_never_exceeds_target_or_supply() {
    let dir = tempdir().expect("tmp dir");
    let img = make_image(&dir, "a.img", GIB);
    let spans = write_file(&dir, "spans.cfg", &format!("{}\n", img.display()));
    // 40% + 40%, leaving a fifth of the span unassigned.
    let vols = write_file(&dir, "vols.cfg", "volume=1 size=40%\nvolume=2 size=40%\n");

    let (va, zret) = VolumeAllocator::load(&spans, &vols, OpenMode::ReadWrite);
    let mut va = va.expect("allocator");
    assert!(zret.is_ok(), "{zret}");

    let free_before = reload(&img).len();
    let mut out = Vec::new();
    assert!(va.fill_empty_spans(&mut out).is_ok());

    // Targets were 3 of 7 stripe blocks each.
    for (idx, size) in va.slot_sizes() {
        assert!(size <= 3, "volume {idx} exceeded its target: {size}");
    }

    let span = reload(&img);
    let hdr = span.header().expect("header");
    assert_eq!(hdr.num_used, 2);
    assert_eq!(hdr.num_free, 1, "under-specified config leaves free space");
    let allocated: i64 = span
        .stripes()
        .iter()
        .filter(|s| !s.is_free())
        .map(|s| s.len().count())
        .sum();
    assert!(allocated <= free_before.count());
    assert_eq!(allocated, 2 * StripeBlocks::new(3).to_store_blocks().count());
}

#[test]
fn over_specified_percents_refuse_to_allocate() {
    let dir = tempdir().expect("tmp dir");
    let img = make_image(&dir, "a.img", GIB);
    let spans = write_file(&dir, "spans.cfg", &format!("{}\n", img.display()));
    let vols = write_file(&dir, "vols.cfg", "volume=1 size=70%\nvolume=2 size=50%\n");

    let (va, zret) = VolumeAllocator::load(&spans, &vols, OpenMode::ReadWrite);
    assert!(va.is_none());
    assert!(zret.has_code(Code::PercentExceeds100));

    // Nothing touched the span.
    assert!(reload(&img).header().is_none());
}

#[test]
fn neediest_volume_drains_the_empty_span_first() {
    let dir = tempdir().expect("tmp dir");
    let empty = make_image(&dir, "empty.img", GIB);
    let half = make_image(&dir, "half.img", GIB);
    // Volume 1 already owns 4 of the 14 total stripe blocks.
    allocate_one(&half, 1, 4);
    let spans = write_file(
        &dir,
        "spans.cfg",
        &format!("{}\n{}\n", empty.display(), half.display()),
    );
    let vols = write_file(&dir, "vols.cfg", "volume=1 size=50%\nvolume=2 size=50%\n");

    let (va, zret) = VolumeAllocator::load(&spans, &vols, OpenMode::ReadWrite);
    let mut va = va.expect("allocator");
    assert!(zret.is_ok(), "{zret}");

    let mut out = Vec::new();
    let zret = va.fill_empty_spans(&mut out);
    // The empty span cannot satisfy both, so a NoSpace report is expected.
    assert!(zret.has_code(Code::NoSpace) || zret.is_ok());

    // Volume 2's deficit (7/7) outranks volume 1's (3/7), so the empty
    // span's storage lands on volume 2.
    let span = reload(&empty);
    let assigned: Vec<u8> = span
        .stripes()
        .iter()
        .filter(|s| !s.is_free())
        .map(|s| s.vol_idx())
        .collect();
    assert_eq!(assigned, vec![2]);
}

#[test]
fn equal_deficits_allocate_in_ascending_volume_order() {
    let dir = tempdir().expect("tmp dir");
    let img = make_image(&dir, "a.img", GIB);
    let spans = write_file(&dir, "spans.cfg", &format!("{}\n", img.display()));
    let vols = write_file(
        &dir,
        "vols.cfg",
        "volume=3 size=25%\nvolume=1 size=25%\nvolume=4 size=25%\nvolume=2 size=25%\n",
    );

    let (va, zret) = VolumeAllocator::load(&spans, &vols, OpenMode::ReadWrite);
    let mut va = va.expect("allocator");
    assert!(zret.is_ok(), "{zret}");

    let mut out = Vec::new();
    assert!(va.fill_empty_spans(&mut out).is_ok());

    let span = reload(&img);
    let order: Vec<u8> = span
        .stripes()
        .iter()
        .filter(|s| !s.is_free())
        .map(|s| s.vol_idx())
        .collect();
    assert_eq!(order, vec![1, 2, 3, 4], "ties break by ascending index");
}

#[test]
fn read_only_allocation_is_a_dry_run() {
    let dir = tempdir().expect("tmp dir");
    let img = make_image(&dir, "a.img", GIB);
    let spans = write_file(&dir, "spans.cfg", &format!("{}\n", img.display()));
    let vols = write_file(&dir, "vols.cfg", "volume=1 size=50%\nvolume=2 size=50%\n");

    let (va, zret) = VolumeAllocator::load(&spans, &vols, OpenMode::ReadOnly);
    let mut va = va.expect("allocator");
    assert!(zret.is_ok(), "{zret}");

    let mut out = Vec::new();
    let zret = va.fill_empty_spans(&mut out);
    assert!(zret.is_ok(), "{zret}");
    assert!(!zret.is_empty(), "dry run must note the skipped write");

    // The header never reached the disk.
    assert!(reload(&img).header().is_none());
}

#[test]
fn simulation_reports_without_mutating() {
    let dir = tempdir().expect("tmp dir");
    let img = make_image(&dir, "a.img", GIB);
    let spans = write_file(&dir, "spans.cfg", &format!("{}\n", img.display()));
    let vols = write_file(&dir, "vols.cfg", "volume=1 size=40%\nvolume=2 size=40%\n");

    let (va, zret) = VolumeAllocator::load(&spans, &vols, OpenMode::ReadOnly);
    let mut va = va.expect("allocator");
    assert!(zret.is_ok(), "{zret}");

    let mut out = Vec::new();
    let zret = va.simulate(&mut out);
    assert!(zret.is_ok(), "{zret}");

    let text = String::from_utf8(out).expect("utf8");
    assert!(text.contains("deficit"), "{text}");
    assert!(text.contains("Span allocated"), "{text}");

    // Simulation never writes and never carves.
    assert!(reload(&img).header().is_none());
    assert_eq!(va.cache().spans()[0].stripes().len(), 1);
}

#[test]
fn allocation_progress_goes_to_the_sink() {
    let dir = tempdir().expect("tmp dir");
    let img = make_image(&dir, "a.img", GIB);
    let spans = write_file(&dir, "spans.cfg", &format!("{}\n", img.display()));
    let vols = write_file(&dir, "vols.cfg", "volume=1 size=100%\n");

    let (va, zret) = VolumeAllocator::load(&spans, &vols, OpenMode::ReadWrite);
    let mut va = va.expect("allocator");
    assert!(zret.is_ok(), "{zret}");

    let mut out = Vec::new();
    assert!(va.fill_empty_spans(&mut out).is_ok());
    let text = String::from_utf8(out).expect("utf8");
    assert!(text.contains("Allocating"), "{text}");
    assert!(text.contains("to volume 1"), "{text}");
    assert!(text.contains("Total"), "{text}");
}
