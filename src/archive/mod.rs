// src/archive/mod.rs

//! Module archive handling
//!
//! A module archive is a tar file, optionally gzip or zstd compressed,
//! containing an optional `META-INF/MANIFEST.MF`, an optional descriptor
//! (`catalog.json`) and arbitrary payload entries. This module materializes
//! incoming bytes to scoped temporary files, validates and enumerates
//! entries, and rewrites archives when the manifest must change.

pub mod checksum;
pub mod descriptor;
pub mod manifest;

pub use checksum::{checksum_entries, compute_checksum};
pub use descriptor::{Descriptor, DescriptorParser, ItemDefinition, JsonDescriptorParser};
pub use manifest::Manifest;

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tar::{Archive, Builder, EntryType, Header};
use tempfile::NamedTempFile;
use tracing::debug;

/// Prefix for temporary archive files created by the installer
const TEMP_PREFIX: &str = "stowage-archive-";

/// Compression wrapping the tar stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Detect compression from the leading magic bytes
    pub fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(&[0x1F, 0x8B]) {
            Compression::Gzip
        } else if magic.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// A single entry read from an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub content: Vec<u8>,
    pub is_dir: bool,
}

/// Normalize an entry path so `./a`, `/a` and `a` name the same entry
pub fn normalize_entry_name(name: &str) -> String {
    let trimmed = name.trim_start_matches("./").trim_start_matches('/');
    trimmed.to_string()
}

/// Wrap a raw archive stream in the decoder its magic bytes call for
fn decompress<'a>(magic: &[u8], inner: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>> {
    let reader: Box<dyn Read + 'a> = match Compression::detect(magic) {
        Compression::Gzip => Box::new(GzDecoder::new(inner)),
        Compression::Zstd => {
            let decoder = zstd::Decoder::new(inner).map_err(|e| {
                Error::InvalidArchive(format!("Failed to create zstd decoder: {}", e))
            })?;
            Box::new(decoder)
        }
        Compression::None => inner,
    };
    Ok(reader)
}

/// Read every entry of a (possibly compressed) tar stream
fn collect_entries(reader: Box<dyn Read + '_>) -> Result<Vec<ArchiveEntry>> {
    let mut archive = Archive::new(reader);
    let mut entries = Vec::new();

    for entry in archive
        .entries()
        .map_err(|e| Error::InvalidArchive(format!("Failed to read archive entries: {}", e)))?
    {
        let mut entry = entry
            .map_err(|e| Error::InvalidArchive(format!("Failed to read archive entry: {}", e)))?;

        let name = entry
            .path()
            .map_err(|e| Error::InvalidArchive(format!("Invalid entry path: {}", e)))?
            .to_string_lossy()
            .to_string();
        let is_dir = entry.header().entry_type().is_dir();

        let mut content = Vec::new();
        if !is_dir {
            entry.read_to_end(&mut content).map_err(|e| {
                Error::InvalidArchive(format!("Failed to read entry {}: {}", name, e))
            })?;
        }

        entries.push(ArchiveEntry {
            name: normalize_entry_name(&name),
            content,
            is_dir,
        });
    }

    Ok(entries)
}

/// Read every entry of an archive file into memory
pub fn read_entries(path: &Path) -> Result<Vec<ArchiveEntry>> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Err(Error::InvalidArchive(format!(
            "{} is empty",
            path.display()
        )));
    }

    let mut magic = [0u8; 4];
    let read = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    let reader = decompress(&magic[..read], Box::new(BufReader::new(file)))?;
    collect_entries(reader)
}

/// Read every entry of an in-memory archive
pub fn read_entries_from_bytes(bytes: &[u8]) -> Result<Vec<ArchiveEntry>> {
    if bytes.is_empty() {
        return Err(Error::InvalidArchive("archive is empty".to_string()));
    }
    let reader = decompress(bytes, Box::new(bytes))?;
    collect_entries(reader)
}

/// Check that a file is a readable archive, returning its entry count
pub fn validate(path: &Path) -> Result<usize> {
    let count = read_entries(path)?.len();
    debug!("Validated archive {} ({} entries)", path.display(), count);
    Ok(count)
}

/// Copy a byte stream into a scoped temporary file and validate it
///
/// The returned file is deleted when dropped unless it is persisted.
pub fn materialize(reader: &mut dyn Read) -> Result<NamedTempFile> {
    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".tar")
        .tempfile()?;

    let copied = io::copy(reader, temp.as_file_mut())?;
    temp.as_file_mut().flush()?;
    debug!("Materialized {} bytes to {}", copied, temp.path().display());

    validate(temp.path())?;
    Ok(temp)
}

/// Write entries as a plain tar archive into a new temporary file
pub fn write_archive(entries: &[ArchiveEntry]) -> Result<NamedTempFile> {
    let temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".tar")
        .tempfile()?;

    {
        let mut builder = Builder::new(temp.as_file());
        for entry in entries {
            let mut header = Header::new_gnu();
            if entry.is_dir {
                header.set_entry_type(EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, &entry.name, io::empty())?;
            } else {
                header.set_entry_type(EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(entry.content.len() as u64);
                builder.append_data(&mut header, &entry.name, entry.content.as_slice())?;
            }
        }
        builder.finish()?;
    }

    Ok(temp)
}

/// Produce a copy of the archive whose manifest is replaced by `manifest`
///
/// The manifest is written as the first entry; all other entries keep their
/// relative order.
pub fn rewrite_with_manifest(path: &Path, manifest: &Manifest) -> Result<NamedTempFile> {
    let mut entries = vec![ArchiveEntry {
        name: manifest::MANIFEST_PATH.to_string(),
        content: manifest.render().into_bytes(),
        is_dir: false,
    }];

    entries.extend(
        read_entries(path)?
            .into_iter()
            .filter(|entry| entry.name != manifest::MANIFEST_PATH),
    );

    let rewritten = write_archive(&entries)?;
    debug!(
        "Rewrote archive {} with updated manifest as {}",
        path.display(),
        rewritten.path().display()
    );
    Ok(rewritten)
}

/// Compare the bytes of a local file with a stream
pub fn same_bytes(path: &Path, other: &mut dyn Read) -> Result<bool> {
    let local = std::fs::read(path)?;
    let mut remote = Vec::with_capacity(local.len());
    other.read_to_end(&mut remote)?;
    Ok(local == remote)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn entry(name: &str, content: &str) -> ArchiveEntry {
        ArchiveEntry {
            name: name.to_string(),
            content: content.as_bytes().to_vec(),
            is_dir: false,
        }
    }

    #[test]
    fn test_write_and_read_entries() {
        let archive = write_archive(&[entry("a.txt", "alpha"), entry("dir/b.txt", "beta")]).unwrap();
        let entries = read_entries(archive.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[1].content, b"beta");
    }

    #[test]
    fn test_materialize_rejects_garbage() {
        let mut garbage: &[u8] = &[0x42; 1024];
        let result = materialize(&mut garbage);
        assert!(matches!(result, Err(Error::InvalidArchive(_))));
    }

    #[test]
    fn test_materialize_rejects_empty_input() {
        let mut empty: &[u8] = &[];
        assert!(matches!(materialize(&mut empty), Err(Error::InvalidArchive(_))));
    }

    #[test]
    fn test_materialize_gzip_archive() {
        use flate2::write::GzEncoder;

        let plain = write_archive(&[entry("a.txt", "alpha")]).unwrap();
        let bytes = std::fs::read(plain.path()).unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&bytes).unwrap();
        let gz = encoder.finish().unwrap();

        let temp = materialize(&mut gz.as_slice()).unwrap();
        let entries = read_entries(temp.path()).unwrap();
        assert_eq!(entries, vec![entry("a.txt", "alpha")]);
    }

    #[test]
    fn test_rewrite_puts_manifest_first() {
        let archive = write_archive(&[
            entry("payload.bin", "data"),
            entry(manifest::MANIFEST_PATH, "Manifest-Version: 1.0\n"),
        ])
        .unwrap();

        let mut manifest = Manifest::default();
        manifest.set(manifest::SYMBOLIC_NAME, "acme.core");
        let rewritten = rewrite_with_manifest(archive.path(), &manifest).unwrap();

        let entries = read_entries(rewritten.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, manifest::MANIFEST_PATH);
        assert_eq!(entries[1].name, "payload.bin");
    }

    #[test]
    fn test_detect_compression() {
        assert_eq!(Compression::detect(&[0x1F, 0x8B, 0, 0]), Compression::Gzip);
        assert_eq!(
            Compression::detect(&[0x28, 0xB5, 0x2F, 0xFD]),
            Compression::Zstd
        );
        assert_eq!(Compression::detect(b"ustar"), Compression::None);
    }
}
