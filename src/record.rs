// src/record.rs

//! The managed artifact record
//!
//! Every artifact the installer has brought under management is recorded in
//! SQLite, keyed by identity (symbolic name + normalized version) and by the
//! source URLs it was installed from. The archive bytes are kept alongside
//! in `<state>/archives/`, so an update can be rolled back to the previous
//! bytes until it is committed.

use crate::db::{self, models::ArtifactRow, models::ArtifactUrl, models::JournalEntry};
use crate::db::models::JournalStatus;
use crate::error::{Error, Result};
use crate::version::ModuleVersion;
use rusqlite::Connection;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const DATABASE_FILE: &str = "stowage.db";
const ARCHIVES_DIR: &str = "archives";

/// Identity and metadata of an artifact about to be recorded
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub symbolic_name: String,
    pub version: String,
    pub registry_version: String,
    pub checksum: Option<String>,
    pub url: Option<String>,
    pub location: String,
    pub persistence_needed: bool,
}

/// SQLite-backed record of managed artifacts plus their archive store
pub struct ArtifactRecord {
    conn: Mutex<Connection>,
    archive_dir: PathBuf,
}

impl ArtifactRecord {
    /// Open the record under `state_dir`, creating it if needed
    pub fn open(state_dir: impl AsRef<Path>) -> Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        let archive_dir = state_dir.join(ARCHIVES_DIR);
        fs::create_dir_all(&archive_dir)?;

        let db_path = state_dir.join(DATABASE_FILE);
        let db_path = db_path
            .to_str()
            .ok_or_else(|| Error::InitError(format!("Non UTF-8 state path: {}", db_path.display())))?;
        db::init(db_path)?;
        let conn = db::open(db_path)?;

        debug!("Opened artifact record at {}", state_dir.display());
        Ok(Self {
            conn: Mutex::new(conn),
            archive_dir,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Config("artifact record lock poisoned".to_string()))
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<ArtifactRow>> {
        ArtifactRow::find_by_id(&*self.lock()?, id)
    }

    /// Look up the artifact recorded for a symbolic name and version
    pub fn find_by_identity(&self, name: &str, version: &ModuleVersion) -> Result<Option<ArtifactRow>> {
        ArtifactRow::find_by_identity(&*self.lock()?, name, &version.to_string())
    }

    pub fn find_by_url(&self, url: &str) -> Result<Option<ArtifactRow>> {
        ArtifactRow::find_by_url(&*self.lock()?, url)
    }

    pub fn list(&self) -> Result<Vec<ArtifactRow>> {
        ArtifactRow::list_all(&*self.lock()?)
    }

    /// Source URLs mapped to an artifact
    pub fn urls_of(&self, id: i64) -> Result<Vec<String>> {
        Ok(ArtifactUrl::find_by_artifact(&*self.lock()?, id)?
            .into_iter()
            .map(|u| u.url)
            .collect())
    }

    /// Move a temporary archive into the archive store
    ///
    /// Renames when the temporary file is on the same filesystem, copies
    /// otherwise. Either way the temporary file is gone afterwards.
    fn store_archive(&self, archive: NamedTempFile, name: &str, version: &str) -> Result<PathBuf> {
        let mut stored = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", name, version))
            .suffix(".tar")
            .tempfile_in(&self.archive_dir)?;

        if let Err(e) = archive.persist(stored.path()) {
            debug!("Copying archive into store: {}", e.error);
            let mut source = e.file.reopen()?;
            io::copy(&mut source, stored.as_file_mut())?;
            stored.as_file().sync_all()?;
        }

        let (_, path) = stored.keep().map_err(|e| Error::Io(e.error))?;
        Ok(path)
    }

    fn discard_archive(path: &str) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove archive {}: {}", path, e);
            }
        }
    }

    /// Record a newly managed artifact, taking ownership of its archive
    pub fn insert(&self, artifact: NewArtifact, archive: NamedTempFile) -> Result<ArtifactRow> {
        let path = self.store_archive(archive, &artifact.symbolic_name, &artifact.registry_version)?;
        let archive_path = path.to_string_lossy().to_string();

        let mut row = ArtifactRow {
            id: None,
            symbolic_name: artifact.symbolic_name,
            version: artifact.version,
            registry_version: artifact.registry_version,
            checksum: artifact.checksum,
            url: artifact.url,
            location: artifact.location,
            persistence_needed: artifact.persistence_needed,
            archive_path: archive_path.clone(),
            previous_archive_path: None,
            previous_checksum: None,
            previous_location: None,
            installed_at: None,
            updated_at: None,
        };

        let mut conn = self.lock()?;
        let inserted = db::transaction(&mut conn, |tx| {
            let id = row.insert(tx)?;
            if let Some(url) = &row.url {
                ArtifactUrl::set(tx, url, id)?;
            }
            ArtifactRow::find_by_id(tx, id)
        });

        match inserted {
            Ok(Some(row)) => {
                debug!("Recorded artifact {} as {:?}", row.symbolic_name, row.id);
                Ok(row)
            }
            Ok(None) => {
                Self::discard_archive(&archive_path);
                Err(Error::Config("inserted artifact vanished".to_string()))
            }
            Err(e) => {
                Self::discard_archive(&archive_path);
                Err(e)
            }
        }
    }

    /// Swap in a new archive for an artifact, keeping the old one for rollback
    ///
    /// A `location` records that the artifact now lives at a new registry
    /// location; `rollback_archive` moves it back. Returns the path of the
    /// retained rollback copy.
    pub fn replace_archive(
        &self,
        id: i64,
        archive: NamedTempFile,
        checksum: Option<&str>,
        url: Option<&str>,
        location: Option<&str>,
        persistence_needed: bool,
    ) -> Result<PathBuf> {
        let current = db::models::require(self.find_by_id(id)?, "artifact")?;
        if let Some(stale) = &current.previous_archive_path {
            Self::discard_archive(stale);
        }

        let path = self.store_archive(archive, &current.symbolic_name, &current.registry_version)?;
        let archive_path = path.to_string_lossy().to_string();

        let mut conn = self.lock()?;
        let staged = db::transaction(&mut conn, |tx| {
            ArtifactRow::stage_archive(
                tx,
                id,
                &archive_path,
                checksum,
                url,
                location,
                persistence_needed,
            )?;
            if let Some(url) = url {
                ArtifactUrl::set(tx, url, id)?;
            }
            Ok(())
        });
        if let Err(e) = staged {
            Self::discard_archive(&archive_path);
            return Err(e);
        }

        debug!(
            "Replaced archive of artifact {} (rollback copy {})",
            id, current.archive_path
        );
        Ok(PathBuf::from(current.archive_path))
    }

    /// Reinstate the rollback copy retained by `replace_archive`
    ///
    /// Also restores the location the artifact had before. Returns the path of the restored archive. Fails with a configuration
    /// error when there is no rollback copy.
    pub fn rollback_archive(&self, id: i64) -> Result<PathBuf> {
        let current = db::models::require(self.find_by_id(id)?, "artifact")?;
        let previous = current.previous_archive_path.clone().ok_or_else(|| {
            Error::Config(format!(
                "No rollback archive recorded for {}:{}",
                current.symbolic_name, current.registry_version
            ))
        })?;

        ArtifactRow::restore_previous(&*self.lock()?, id)?;
        Self::discard_archive(&current.archive_path);

        debug!("Rolled back archive of artifact {} to {}", id, previous);
        Ok(PathBuf::from(previous))
    }

    /// Discard the rollback copy once an update is durable
    pub fn commit_archive(&self, id: i64) -> Result<()> {
        let current = db::models::require(self.find_by_id(id)?, "artifact")?;
        ArtifactRow::clear_previous(&*self.lock()?, id)?;
        if let Some(previous) = &current.previous_archive_path {
            Self::discard_archive(previous);
        }
        Ok(())
    }

    /// Map a source URL to an artifact
    pub fn set_url(&self, url: &str, id: i64) -> Result<()> {
        ArtifactUrl::set(&*self.lock()?, url, id)
    }

    /// Forget an artifact and delete its archives
    pub fn remove(&self, id: i64) -> Result<Option<ArtifactRow>> {
        let Some(row) = self.find_by_id(id)? else {
            return Ok(None);
        };
        ArtifactRow::delete(&*self.lock()?, id)?;
        Self::discard_archive(&row.archive_path);
        if let Some(previous) = &row.previous_archive_path {
            Self::discard_archive(previous);
        }
        debug!("Removed artifact {} from record", id);
        Ok(Some(row))
    }

    /// Open a pending journal entry
    pub fn open_journal(&self, description: String, name: &str, version: &str) -> Result<i64> {
        let mut entry = JournalEntry::new(description);
        entry.artifact_name = Some(name.to_string());
        entry.artifact_version = Some(version.to_string());
        entry.insert(&*self.lock()?)
    }

    pub fn finish_journal(&self, id: i64, status: JournalStatus) -> Result<()> {
        JournalEntry::update_status(&*self.lock()?, id, status)
    }

    /// All journal entries, newest first
    pub fn journal(&self) -> Result<Vec<JournalEntry>> {
        JournalEntry::list_all(&*self.lock()?)
    }
}

/// Serializes work on the same artifact identity
///
/// Different identities never block each other.
#[derive(Default)]
pub struct IdentityLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Held identity; released on drop
pub struct IdentityGuard<'a> {
    locks: &'a IdentityLocks,
    key: String,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free, then hold it
    pub fn acquire(&self, key: &str) -> Result<IdentityGuard<'_>> {
        let poisoned = |_| Error::Config("identity lock poisoned".to_string());
        let mut held = self.held.lock().map_err(poisoned)?;
        while held.contains(key) {
            debug!("Waiting for identity {}", key);
            held = self.released.wait(held).map_err(poisoned)?;
        }
        held.insert(key.to_string());
        Ok(IdentityGuard {
            locks: self,
            key: key.to_string(),
        })
    }

    /// Whether some installer currently holds `key`
    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().map(|held| held.contains(key)).unwrap_or(false)
    }
}

impl IdentityGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locks.held.lock() {
            held.remove(&self.key);
        }
        self.locks.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn temp_archive(content: &[u8]) -> NamedTempFile {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(content).unwrap();
        temp
    }

    fn new_artifact(name: &str, url: Option<&str>) -> NewArtifact {
        NewArtifact {
            symbolic_name: name.to_string(),
            version: "1.0".to_string(),
            registry_version: "1.0.0".to_string(),
            checksum: Some("c1".to_string()),
            url: url.map(str::to_string),
            location: format!("managed:{}/1.0.0", name),
            persistence_needed: true,
        }
    }

    #[test]
    fn test_insert_takes_ownership_of_archive() {
        let dir = TempDir::new().unwrap();
        let record = ArtifactRecord::open(dir.path()).unwrap();

        let temp = temp_archive(b"one");
        let temp_path = temp.path().to_path_buf();
        let row = record
            .insert(new_artifact("acme.core", Some("http://x/a.tar")), temp)
            .unwrap();

        assert!(!temp_path.exists());
        assert_eq!(fs::read(&row.archive_path).unwrap(), b"one");
        assert!(Path::new(&row.archive_path).starts_with(dir.path()));

        let version = ModuleVersion::parse("1.0").unwrap();
        assert_eq!(
            record.find_by_identity("acme.core", &version).unwrap().unwrap().id,
            row.id
        );
        assert_eq!(record.find_by_url("http://x/a.tar").unwrap().unwrap().id, row.id);
        assert_eq!(record.urls_of(row.id.unwrap()).unwrap(), vec!["http://x/a.tar"]);
    }

    #[test]
    fn test_replace_then_rollback_restores_old_archive() {
        let dir = TempDir::new().unwrap();
        let record = ArtifactRecord::open(dir.path()).unwrap();
        let row = record
            .insert(new_artifact("acme.core", None), temp_archive(b"one"))
            .unwrap();
        let id = row.id.unwrap();

        let rollback = record
            .replace_archive(id, temp_archive(b"two"), Some("c2"), None, None, true)
            .unwrap();
        assert_eq!(fs::read(&rollback).unwrap(), b"one");
        let staged = record.find_by_id(id).unwrap().unwrap();
        assert_eq!(fs::read(&staged.archive_path).unwrap(), b"two");

        let restored = record.rollback_archive(id).unwrap();
        assert_eq!(fs::read(&restored).unwrap(), b"one");
        assert!(!Path::new(&staged.archive_path).exists());

        let after = record.find_by_id(id).unwrap().unwrap();
        assert_eq!(after.checksum.as_deref(), Some("c1"));
        assert!(matches!(record.rollback_archive(id), Err(Error::Config(_))));
    }

    #[test]
    fn test_relocation_is_undone_by_rollback() {
        let dir = TempDir::new().unwrap();
        let record = ArtifactRecord::open(dir.path()).unwrap();
        let mut adopted = new_artifact("acme.core", None);
        adopted.location = "foreign:acme".to_string();
        let id = record.insert(adopted, temp_archive(b"one")).unwrap().id.unwrap();

        record
            .replace_archive(
                id,
                temp_archive(b"two"),
                Some("c2"),
                None,
                Some("managed:acme.core/1.0.0"),
                true,
            )
            .unwrap();
        assert_eq!(
            record.find_by_id(id).unwrap().unwrap().location,
            "managed:acme.core/1.0.0"
        );

        record.rollback_archive(id).unwrap();
        assert_eq!(record.find_by_id(id).unwrap().unwrap().location, "foreign:acme");
    }

    #[test]
    fn test_commit_discards_rollback_copy() {
        let dir = TempDir::new().unwrap();
        let record = ArtifactRecord::open(dir.path()).unwrap();
        let id = record
            .insert(new_artifact("acme.core", None), temp_archive(b"one"))
            .unwrap()
            .id
            .unwrap();

        let rollback = record
            .replace_archive(id, temp_archive(b"two"), Some("c2"), None, None, true)
            .unwrap();
        record.commit_archive(id).unwrap();

        assert!(!rollback.exists());
        assert!(record.find_by_id(id).unwrap().unwrap().previous_archive_path.is_none());
    }

    #[test]
    fn test_remove_deletes_row_and_archive() {
        let dir = TempDir::new().unwrap();
        let record = ArtifactRecord::open(dir.path()).unwrap();
        let row = record
            .insert(new_artifact("acme.core", Some("u")), temp_archive(b"one"))
            .unwrap();

        let removed = record.remove(row.id.unwrap()).unwrap().unwrap();
        assert!(!Path::new(&removed.archive_path).exists());
        assert!(record.list().unwrap().is_empty());
        assert!(record.find_by_url("u").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_identity_is_rejected_and_archive_discarded() {
        let dir = TempDir::new().unwrap();
        let record = ArtifactRecord::open(dir.path()).unwrap();
        record
            .insert(new_artifact("acme.core", None), temp_archive(b"one"))
            .unwrap();
        assert!(record
            .insert(new_artifact("acme.core", None), temp_archive(b"two"))
            .is_err());

        let stored = fs::read_dir(dir.path().join(ARCHIVES_DIR)).unwrap().count();
        assert_eq!(stored, 1);
    }

    #[test]
    fn test_identity_locks_serialize_same_key() {
        let locks = Arc::new(IdentityLocks::new());
        let guard = locks.acquire("acme.core:1.0.0").unwrap();

        let other = Arc::clone(&locks);
        let waiter = thread::spawn(move || {
            let _g = other.acquire("acme.core:1.0.0").unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        // A different identity is not blocked
        let _unrelated = locks.acquire("acme.web:1.0.0").unwrap();

        drop(guard);
        waiter.join().unwrap();
        assert!(!locks.is_held("acme.core:1.0.0"));
    }
}
