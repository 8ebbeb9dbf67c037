// src/archive/checksum.rs

//! Logical content checksum for module archives
//!
//! The checksum covers entry names and entry contents only. Each entry is
//! hashed on its own, the `(name, digest)` table is sorted by name, and the
//! rendered table is hashed again. Entry order, timestamps, ownership, mode
//! bits and outer compression do not influence the result, so two archives
//! built at different times from the same files compare equal.

use super::{read_entries, ArchiveEntry};
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::trace;

/// Compute the checksum of the archive at `path`
pub fn compute_checksum(path: &Path) -> Result<String> {
    let entries = read_entries(path)?;
    let checksum = checksum_entries(&entries);
    trace!("Checksum of {} is {}", path.display(), checksum);
    Ok(checksum)
}

/// Compute the checksum over already-read entries
pub fn checksum_entries(entries: &[ArchiveEntry]) -> String {
    let table: BTreeMap<&str, String> = entries
        .iter()
        .map(|entry| {
            let digest = Sha256::digest(&entry.content);
            (entry.name.as_str(), format!("{:x}", digest))
        })
        .collect();

    let mut hasher = Sha256::new();
    for (name, digest) in &table {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }

    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::entry;
    use crate::archive::write_archive;
    use tar::{Builder, Header};

    #[test]
    fn test_checksum_ignores_entry_order() {
        let a = write_archive(&[entry("a.txt", "alpha"), entry("b.txt", "beta")]).unwrap();
        let b = write_archive(&[entry("b.txt", "beta"), entry("a.txt", "alpha")]).unwrap();
        assert_eq!(
            compute_checksum(a.path()).unwrap(),
            compute_checksum(b.path()).unwrap()
        );
    }

    #[test]
    fn test_checksum_ignores_timestamps() {
        let build = |mtime: u64| {
            let temp = tempfile::NamedTempFile::new().unwrap();
            let mut builder = Builder::new(temp.as_file());
            let mut header = Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_mtime(mtime);
            builder
                .append_data(&mut header, "a.txt", "alpha".as_bytes())
                .unwrap();
            builder.finish().unwrap();
            drop(builder);
            temp
        };

        let early = build(1_000_000);
        let late = build(1_700_000_000);
        assert_ne!(
            std::fs::read(early.path()).unwrap(),
            std::fs::read(late.path()).unwrap()
        );
        assert_eq!(
            compute_checksum(early.path()).unwrap(),
            compute_checksum(late.path()).unwrap()
        );
    }

    #[test]
    fn test_checksum_detects_content_change() {
        let a = checksum_entries(&[entry("a.txt", "alpha")]);
        let b = checksum_entries(&[entry("a.txt", "alpha2")]);
        let c = checksum_entries(&[entry("b.txt", "alpha")]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_checksum_is_hex_sha256() {
        let sum = checksum_entries(&[]);
        assert_eq!(sum.len(), 64);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
