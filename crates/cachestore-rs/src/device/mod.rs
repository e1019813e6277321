//! Access to the raw storage backing a span.
//!
//! A span path can be a regular file, a disk partition or a whole block
//! device. This module classifies the path, opens it with the right flags
//! (direct + synchronous I/O for devices), answers the device geometry the
//! alignment rules depend on, and provides block-aligned buffers for
//! positional reads and writes.


use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::Path;
use std::ptr::NonNull;
use std::slice;

use anyhow::{Context, Result, bail};

use crate::units::Bytes;

/// What kind of filesystem object a span path names.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    BlockDevice,
    CharDevice,
    Other,
}

/// Whether destructive operations are allowed on opened spans.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

impl OpenMode {
    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

/// Geometry of the storage under a span.
#[derive(Copy, Clone, Debug)]
pub struct Geometry {
    /// Total usable size.
    pub total_size: Bytes,
    /// Logical block size; every direct read must align to this.
    pub block_size: Bytes,
    /// Required buffer alignment, never below the hardware sector size.
    pub align: Bytes,
}

/// Default hardware sector size assumed for file-backed spans.
pub const DEFAULT_HW_SECTOR_SIZE: i64 = 512;

// linux/fs.h; libc does not export the block-device ioctls.
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
const BLKSSZGET: libc::c_ulong = 0x1268;

/// `classify` reports the kind of object at `path`.
///
/// # Errors
/// Returns an error if the path cannot be stat'ed.
pub fn classify(path: &Path) -> Result<FileKind> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("cannot stat {}", path.display()))?;
    let ft = meta.file_type();
    let kind = if ft.is_file() {
        FileKind::Regular
    } else if ft.is_dir() {
        FileKind::Directory
    } else if ft.is_block_device() {
        FileKind::BlockDevice
    } else if ft.is_char_device() {
        FileKind::CharDevice
    } else {
        FileKind::Other
    };
    Ok(kind)
}

/// `open_span` opens a span path for positional I/O.
///
/// Devices get direct and synchronous flags so reads and writes bypass the
/// page cache; regular files open plain, which keeps file-backed spans and
/// tests free of alignment constraints the hardware does not impose.
///
/// # Errors
/// Returns an error if the open fails.
pub fn open_span(path: &Path, kind: FileKind, mode: OpenMode) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(mode.is_writable());
    if matches!(kind, FileKind::BlockDevice | FileKind::CharDevice) {
        let mut flags = 0;
        #[cfg(target_os = "linux")]
        {
            flags |= libc::O_DIRECT;
        }
        flags |= libc::O_DSYNC;
        opts.custom_flags(flags);
    }
    opts.open(path)
        .with_context(|| format!("cannot open {}", path.display()))
}

/// `probe_geometry` queries the storage geometry for an open span.
///
/// Block and character devices answer through ioctls; regular files take
/// their length from metadata and the default sector size.
///
/// # Errors
/// Returns an error if the geometry cannot be queried or is nonsensical
/// (zero or non-power-of-two block size).
pub fn probe_geometry(file: &File, kind: FileKind) -> Result<Geometry> {
    let (total, block) = match kind {
        FileKind::BlockDevice | FileKind::CharDevice => blkdev_geometry(file)?,
        _ => {
            let len = file.metadata().context("cannot stat span file")?.len();
            (len, DEFAULT_HW_SECTOR_SIZE as u64)
        }
    };
    if block == 0 || !block.is_power_of_two() {
        bail!("unusable device block size {block}");
    }
    let block = i64::try_from(block).context("device block size out of range")?;
    let total = i64::try_from(total).context("device size out of range")?;
    Ok(Geometry {
        total_size: Bytes::new(total),
        block_size: Bytes::new(block),
        align: Bytes::new(block.max(DEFAULT_HW_SECTOR_SIZE)),
    })
}

fn blkdev_geometry(file: &File) -> Result<(u64, u64)> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let mut size: u64 = 0;
    // SAFETY: fd is a valid open descriptor and the out-pointers match the
    // ioctl argument types.
    let rc = unsafe { libc::ioctl(fd, BLKGETSIZE64 as _, std::ptr::addr_of_mut!(size)) };
    if rc != 0 {
        bail!(
            "BLKGETSIZE64 failed: {}",
            std::io::Error::last_os_error()
        );
    }
    let mut sector: libc::c_int = 0;
    // SAFETY: as above.
    let rc = unsafe { libc::ioctl(fd, BLKSSZGET as _, std::ptr::addr_of_mut!(sector)) };
    if rc != 0 {
        bail!("BLKSSZGET failed: {}", std::io::Error::last_os_error());
    }
    Ok((size, u64::try_from(sector).unwrap_or(512)))
}

/// `slurp` loads a small text file (a span or volume config) whole.
///
/// # Errors
/// Returns an error if the file cannot be read as UTF-8 text.
pub fn slurp(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("unable to load {}", path.display()))
}

/// A heap buffer whose start address honors a device alignment requirement.
///
/// Direct-I/O reads and writes need both the buffer address and the transfer
/// length aligned to the device block size; `Vec` guarantees neither.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    /// Allocate a zero-filled buffer of `len` bytes aligned to `align`.
    ///
    /// # Errors
    /// Returns an error when the length is zero or the alignment is not a
    /// power of two.
    pub fn zeroed(len: usize, align: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len, align)
            .with_context(|| format!("bad buffer layout: len={len} align={align}"))?;
        if len == 0 {
            bail!("aligned buffer length must be non-zero");
        }
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).context("aligned allocation failed")?;
        Ok(Self { ptr, layout })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn zero(&mut self) {
        // SAFETY: ptr is valid for the full layout size and exclusively owned.
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.layout.size());
        }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() bytes for the buffer's lifetime.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in Deref, with exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

// SAFETY: the buffer owns its allocation exclusively.
unsafe impl Send for AlignedBuf {}
