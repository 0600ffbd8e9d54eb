//! Filesystem and storage-controller boundaries
//!
//! The storage layer never talks to a FAT driver or SD controller directly.
//! [`Volume`] is the mounted filesystem, [`MediumController`] is the bus and
//! card bring-up underneath it. Paths are relative to the volume root and use
//! `/` as separator (`"sample/sampleData20250101120000.txt"`).

use heapless::String;

use crate::error::FsError;

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum OpenMode {
    /// Existing file, read only
    Read,
    /// Open for writing, create if absent, keep existing content
    WriteCreate,
    /// Open for writing, create if absent, discard existing content
    WriteTruncate,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String<16>,
    pub is_dir: bool,
    pub size: u32,
}

/// Mounted FAT-compatible filesystem.
pub trait Volume {
    type File;

    /// Lightweight readiness check: open the root listing.
    fn probe(&mut self) -> Result<(), FsError>;
    fn mount(&mut self) -> Result<(), FsError>;
    /// Best effort; drops every cached handle.
    fn unmount(&mut self);

    /// Create a directory. An existing directory yields [`FsError::AlreadyExists`].
    fn create_dir(&mut self, path: &str) -> Result<(), FsError>;
    /// Size in bytes of an existing file.
    fn stat(&mut self, path: &str) -> Result<u32, FsError>;
    fn list_root(&mut self, visit: &mut dyn FnMut(&EntryInfo)) -> Result<(), FsError>;

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Self::File, FsError>;
    /// Move the cursor to end of file, returning the new offset.
    fn seek_end(&mut self, file: &mut Self::File) -> Result<u32, FsError>;
    fn read(&mut self, file: &mut Self::File, buf: &mut [u8]) -> Result<usize, FsError>;
    /// Returns the number of bytes accepted, which may be short.
    fn write(&mut self, file: &mut Self::File, data: &[u8]) -> Result<usize, FsError>;
    /// Force buffered data and directory metadata to the medium.
    fn sync(&mut self, file: &mut Self::File) -> Result<(), FsError>;
    fn close(&mut self, file: Self::File) -> Result<(), FsError>;
}

/// Storage controller and physical medium beneath the filesystem.
pub trait MediumController {
    /// Card present and in transfer state.
    fn is_ready(&mut self) -> bool;
    /// `(sector_size, sector_count)` of the inserted medium.
    fn capacity(&mut self) -> Option<(u32, u32)>;
    /// Fully de-initialize the controller.
    fn deinit(&mut self);
    /// Re-apply controller parameters (bus width, clock).
    fn configure(&mut self);
    /// Re-probe and initialize the physical medium.
    fn init_card(&mut self) -> Result<(), FsError>;
}

/// Write all of `data`, treating a short write as failure.
pub fn write_all<V: Volume + ?Sized>(
    volume: &mut V,
    file: &mut V::File,
    data: &[u8],
) -> Result<(), FsError> {
    let written = volume.write(file, data)?;
    if written != data.len() {
        return Err(FsError::Io);
    }
    Ok(())
}

/// 8.3 form of one path component.
///
/// Names that already fit 8.3 are upper-cased. Longer names map to eight hex
/// digits of their FNV-1a hash plus the original extension (truncated to three
/// characters). embedded-sdmmc cannot create long file names.
pub fn short_name(component: &str) -> String<12> {
    let (base, ext) = match component.rfind('.') {
        Some(dot) if dot > 0 => (&component[..dot], &component[dot + 1..]),
        _ => (component, ""),
    };

    let mut out: String<12> = String::new();
    if fits_short(base, 8) && fits_short(ext, 3) {
        push_upper(&mut out, base);
    } else {
        let hash = fnv1a(component.as_bytes());
        for shift in (0..8).rev() {
            let nibble = ((hash >> (shift * 4)) & 0xF) as usize;
            let _ = out.push(char::from(b"0123456789ABCDEF"[nibble]));
        }
    }
    if !ext.is_empty() {
        let _ = out.push('.');
        for c in ext.chars().take(3) {
            let _ = out.push(c.to_ascii_uppercase());
        }
    }
    out
}

fn fits_short(part: &str, max: usize) -> bool {
    part.len() <= max
        && part
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'~'))
}

fn push_upper(out: &mut String<12>, s: &str) {
    for c in s.chars() {
        let _ = out.push(c.to_ascii_uppercase());
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5u32, |h, &b| {
        (h ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}
