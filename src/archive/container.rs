// src/archive/container.rs
//! Container format detection and entry extraction
//!
//! Uploaded archives arrive either as ZIP files or as tarballs that may be
//! wrapped in gzip, xz or zstd. The format is detected from magic bytes; file
//! extensions are not trusted since uploads are frequently renamed.

use crate::error::{Error, Result};
use std::io::{Cursor, Read};
use tracing::{debug, warn};

/// Maximum size for a single archive entry (64 MB)
pub const MAX_ENTRY_SIZE: u64 = 64 * 1024 * 1024;

/// Offset of the `ustar` magic inside a tar header block
const USTAR_MAGIC_OFFSET: usize = 257;

/// Compression wrapped around a tarball
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    /// Detect compression from magic bytes
    ///
    /// Magic bytes:
    /// - Gzip: `1f 8b`
    /// - XZ: `fd 37 7a 58 5a 00`
    /// - Zstd: `28 b5 2f fd`
    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if data.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
            Self::Xz
        } else if data.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Self::Zstd
        } else {
            Self::None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }

    /// Wrap a reader in the matching decoder
    fn decoder<'a, R: Read + 'a>(&self, reader: R) -> Result<Box<dyn Read + 'a>> {
        match self {
            Self::None => Ok(Box::new(reader)),
            Self::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(reader))),
            Self::Xz => Ok(Box::new(xz2::read::XzDecoder::new(reader))),
            Self::Zstd => {
                let decoder = zstd::Decoder::new(reader).map_err(|e| {
                    Error::UnsupportedArchive(format!("Failed to create zstd decoder: {e}"))
                })?;
                Ok(Box::new(decoder))
            }
        }
    }
}

/// Detected archive container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Zip,
    Tar(Compression),
}

impl ContainerFormat {
    /// Detect the container from leading bytes
    pub fn detect(data: &[u8]) -> Result<Self> {
        if data.starts_with(b"PK\x03\x04") || data.starts_with(b"PK\x05\x06") {
            return Ok(Self::Zip);
        }

        match Compression::from_magic_bytes(data) {
            Compression::None => {
                if is_ustar(data) {
                    Ok(Self::Tar(Compression::None))
                } else {
                    Err(Error::UnsupportedArchive(
                        "unrecognised container (expected zip or tar)".to_string(),
                    ))
                }
            }
            compression => Ok(Self::Tar(compression)),
        }
    }
}

fn is_ustar(data: &[u8]) -> bool {
    data.len() >= USTAR_MAGIC_OFFSET + 5
        && &data[USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + 5] == b"ustar"
}

/// A file pulled out of the container, before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    /// Path inside the archive, `/`-separated
    pub path: String,
    pub data: Vec<u8>,
}

/// Read every regular file from an archive, in archive order
pub fn read_entries(data: &[u8]) -> Result<Vec<RawEntry>> {
    let format = ContainerFormat::detect(data)?;
    debug!("Detected archive container: {:?}", format);

    match format {
        ContainerFormat::Zip => read_zip(data),
        ContainerFormat::Tar(compression) => read_tar(data, compression),
    }
}

fn read_zip(data: &[u8]) -> Result<Vec<RawEntry>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| Error::UnsupportedArchive(format!("Invalid zip archive: {e}")))?;

    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| Error::UnsupportedArchive(format!("Invalid zip entry {index}: {e}")))?;

        if file.is_dir() {
            continue;
        }

        let path = file.name().to_string();
        if !check_entry_size(&path, file.size()) {
            continue;
        }

        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)
            .map_err(|e| Error::IoError(format!("Failed to read zip entry {path}: {e}")))?;
        entries.push(RawEntry { path, data: buf });
    }

    Ok(entries)
}

fn read_tar(data: &[u8], compression: Compression) -> Result<Vec<RawEntry>> {
    let reader = compression.decoder(data)?;
    let mut archive = tar::Archive::new(reader);

    let iter = archive.entries().map_err(|e| {
        Error::UnsupportedArchive(format!("Invalid {} tar archive: {e}", compression.name()))
    })?;

    let mut entries = Vec::new();
    for entry in iter {
        let mut entry = entry
            .map_err(|e| Error::UnsupportedArchive(format!("Invalid tar entry: {e}")))?;

        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry
            .path()
            .map_err(|e| Error::ParseError(format!("Invalid tar entry path: {e}")))?
            .to_string_lossy()
            .replace('\\', "/");

        if !check_entry_size(&path, entry.size()) {
            continue;
        }

        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .map_err(|e| Error::IoError(format!("Failed to read tar entry {path}: {e}")))?;
        entries.push(RawEntry { path, data: buf });
    }

    Ok(entries)
}

/// Check if an entry exceeds the size limit, warn if so
fn check_entry_size(path: &str, size: u64) -> bool {
    if size > MAX_ENTRY_SIZE {
        warn!("Skipping oversized archive entry: {} ({} bytes)", path, size);
        false
    } else {
        true
    }
}
