// src/db/models.rs

//! Data models for Stowage database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;

const ARTIFACT_COLUMNS: &str = "id, symbolic_name, version, registry_version, checksum, url, \
     location, persistence_needed, archive_path, previous_archive_path, previous_checksum, \
     previous_location, installed_at, updated_at";

/// A row of `managed_artifacts`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRow {
    pub id: Option<i64>,
    pub symbolic_name: String,
    /// Version as supplied by the caller
    pub version: String,
    /// Normalized version used for identity lookups
    pub registry_version: String,
    pub checksum: Option<String>,
    pub url: Option<String>,
    pub location: String,
    pub persistence_needed: bool,
    pub archive_path: String,
    pub previous_archive_path: Option<String>,
    pub previous_checksum: Option<String>,
    /// Location to return to if a relocating update is rolled back
    pub previous_location: Option<String>,
    pub installed_at: Option<String>,
    pub updated_at: Option<String>,
}

impl ArtifactRow {
    /// Insert this artifact into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO managed_artifacts
                (symbolic_name, version, registry_version, checksum, url, location,
                 persistence_needed, archive_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &self.symbolic_name,
                &self.version,
                &self.registry_version,
                &self.checksum,
                &self.url,
                &self.location,
                self.persistence_needed,
                &self.archive_path,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find an artifact by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM managed_artifacts WHERE id = ?1",
            ARTIFACT_COLUMNS
        ))?;
        Ok(stmt.query_row([id], Self::from_row).optional()?)
    }

    /// Find an artifact by symbolic name and normalized version
    pub fn find_by_identity(
        conn: &Connection,
        symbolic_name: &str,
        registry_version: &str,
    ) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM managed_artifacts WHERE symbolic_name = ?1 AND registry_version = ?2",
            ARTIFACT_COLUMNS
        ))?;
        Ok(stmt
            .query_row([symbolic_name, registry_version], Self::from_row)
            .optional()?)
    }

    /// Find the artifact a source URL maps to
    pub fn find_by_url(conn: &Connection, url: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM managed_artifacts
             WHERE id = (SELECT artifact_id FROM artifact_urls WHERE url = ?1)",
            ARTIFACT_COLUMNS
        ))?;
        Ok(stmt.query_row([url], Self::from_row).optional()?)
    }

    /// List all artifacts
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM managed_artifacts ORDER BY symbolic_name, registry_version",
            ARTIFACT_COLUMNS
        ))?;

        let rows = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Point the artifact at a new archive, remembering the old one
    ///
    /// A `location` moves the artifact to a new registry location; the old
    /// one is remembered alongside the old archive.
    pub fn stage_archive(
        conn: &Connection,
        id: i64,
        archive_path: &str,
        checksum: Option<&str>,
        url: Option<&str>,
        location: Option<&str>,
        persistence_needed: bool,
    ) -> Result<()> {
        conn.execute(
            "UPDATE managed_artifacts SET
                previous_archive_path = archive_path,
                previous_checksum = checksum,
                previous_location = CASE WHEN ?4 IS NULL THEN NULL ELSE location END,
                archive_path = ?1,
                checksum = ?2,
                url = COALESCE(?3, url),
                location = COALESCE(?4, location),
                persistence_needed = ?5,
                updated_at = CURRENT_TIMESTAMP
             WHERE id = ?6",
            params![archive_path, checksum, url, location, persistence_needed, id],
        )?;
        Ok(())
    }

    /// Restore the remembered archive as current
    pub fn restore_previous(conn: &Connection, id: i64) -> Result<()> {
        conn.execute(
            "UPDATE managed_artifacts SET
                archive_path = previous_archive_path,
                checksum = previous_checksum,
                location = COALESCE(previous_location, location),
                previous_archive_path = NULL,
                previous_checksum = NULL,
                previous_location = NULL,
                updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND previous_archive_path IS NOT NULL",
            [id],
        )?;
        Ok(())
    }

    /// Forget the remembered archive
    pub fn clear_previous(conn: &Connection, id: i64) -> Result<()> {
        conn.execute(
            "UPDATE managed_artifacts SET
                previous_archive_path = NULL,
                previous_checksum = NULL,
                previous_location = NULL
             WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    /// Delete an artifact by ID
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM managed_artifacts WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Convert a database row to an ArtifactRow
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            symbolic_name: row.get(1)?,
            version: row.get(2)?,
            registry_version: row.get(3)?,
            checksum: row.get(4)?,
            url: row.get(5)?,
            location: row.get(6)?,
            persistence_needed: row.get(7)?,
            archive_path: row.get(8)?,
            previous_archive_path: row.get(9)?,
            previous_checksum: row.get(10)?,
            previous_location: row.get(11)?,
            installed_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }
}

/// A source URL mapped to an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactUrl {
    pub url: String,
    pub artifact_id: i64,
}

impl ArtifactUrl {
    /// Map `url` to `artifact_id`, replacing any previous mapping
    pub fn set(conn: &Connection, url: &str, artifact_id: i64) -> Result<()> {
        conn.execute(
            "INSERT INTO artifact_urls (url, artifact_id) VALUES (?1, ?2)
             ON CONFLICT(url) DO UPDATE SET artifact_id = excluded.artifact_id",
            params![url, artifact_id],
        )?;
        Ok(())
    }

    /// URLs mapped to an artifact
    pub fn find_by_artifact(conn: &Connection, artifact_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT url, artifact_id FROM artifact_urls WHERE artifact_id = ?1 ORDER BY url",
        )?;

        let urls = stmt
            .query_map([artifact_id], |row| {
                Ok(Self {
                    url: row.get(0)?,
                    artifact_id: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(urls)
    }
}

/// Install journal status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalStatus {
    Pending,
    Applied,
    RolledBack,
    Failed,
}

impl JournalStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JournalStatus::Pending => "pending",
            JournalStatus::Applied => "applied",
            JournalStatus::RolledBack => "rolled_back",
            JournalStatus::Failed => "failed",
        }
    }
}

impl FromStr for JournalStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JournalStatus::Pending),
            "applied" => Ok(JournalStatus::Applied),
            "rolled_back" => Ok(JournalStatus::RolledBack),
            "failed" => Ok(JournalStatus::Failed),
            _ => Err(format!("Invalid journal status: {}", s)),
        }
    }
}

/// One staged install and how it ended
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub id: Option<i64>,
    pub description: String,
    pub artifact_name: Option<String>,
    pub artifact_version: Option<String>,
    pub status: JournalStatus,
    pub created_at: Option<String>,
    pub finished_at: Option<String>,
}

impl JournalEntry {
    /// Create a new pending entry
    pub fn new(description: String) -> Self {
        Self {
            id: None,
            description,
            artifact_name: None,
            artifact_version: None,
            status: JournalStatus::Pending,
            created_at: None,
            finished_at: None,
        }
    }

    /// Insert this entry into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO install_journal (description, artifact_name, artifact_version, status)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &self.description,
                &self.artifact_name,
                &self.artifact_version,
                self.status.as_str()
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find an entry by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, artifact_name, artifact_version, status, created_at, finished_at
             FROM install_journal WHERE id = ?1",
        )?;
        Ok(stmt.query_row([id], Self::from_row).optional()?)
    }

    /// List all entries, newest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, artifact_name, artifact_version, status, created_at, finished_at
             FROM install_journal ORDER BY id DESC",
        )?;

        let entries = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Set the status of an entry, stamping the finish time for terminal states
    pub fn update_status(conn: &Connection, id: i64, new_status: JournalStatus) -> Result<()> {
        if new_status == JournalStatus::Pending {
            conn.execute(
                "UPDATE install_journal SET status = ?1, finished_at = NULL WHERE id = ?2",
                params![new_status.as_str(), id],
            )?;
        } else {
            conn.execute(
                "UPDATE install_journal SET status = ?1, finished_at = CURRENT_TIMESTAMP
                 WHERE id = ?2",
                params![new_status.as_str(), id],
            )?;
        }
        Ok(())
    }

    /// Convert a database row to a JournalEntry
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_str: String = row.get(4)?;
        let status = status_str.parse::<JournalStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        Ok(Self {
            id: Some(row.get(0)?),
            description: row.get(1)?,
            artifact_name: row.get(2)?,
            artifact_version: row.get(3)?,
            status,
            created_at: row.get(5)?,
            finished_at: row.get(6)?,
        })
    }
}

/// Fail with a descriptive error when a row expected to exist is missing
pub(crate) fn require<T>(row: Option<T>, what: &str) -> Result<T> {
    row.ok_or_else(|| Error::Config(format!("{} not found in artifact record", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    fn artifact(name: &str, version: &str) -> ArtifactRow {
        ArtifactRow {
            id: None,
            symbolic_name: name.to_string(),
            version: version.to_string(),
            registry_version: version.to_string(),
            checksum: Some("c1".to_string()),
            url: None,
            location: format!("managed:{}/{}", name, version),
            persistence_needed: true,
            archive_path: "/archives/one.tar".to_string(),
            previous_archive_path: None,
            previous_checksum: None,
            previous_location: None,
            installed_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_artifact_crud() {
        let (_temp, conn) = create_test_db();

        let mut row = artifact("acme.core", "1.0.0");
        let id = row.insert(&conn).unwrap();

        let found = ArtifactRow::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(found.symbolic_name, "acme.core");
        assert!(found.installed_at.is_some());

        let by_identity = ArtifactRow::find_by_identity(&conn, "acme.core", "1.0.0").unwrap();
        assert_eq!(by_identity.unwrap().id, Some(id));

        assert_eq!(ArtifactRow::list_all(&conn).unwrap().len(), 1);

        ArtifactRow::delete(&conn, id).unwrap();
        assert!(ArtifactRow::find_by_id(&conn, id).unwrap().is_none());
    }

    #[test]
    fn test_stage_restore_and_clear_archive() {
        let (_temp, conn) = create_test_db();
        let id = artifact("acme.core", "1.0.0").insert(&conn).unwrap();

        ArtifactRow::stage_archive(&conn, id, "/archives/two.tar", Some("c2"), None, None, true)
            .unwrap();
        let staged = ArtifactRow::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(staged.archive_path, "/archives/two.tar");
        assert_eq!(staged.previous_archive_path.as_deref(), Some("/archives/one.tar"));
        assert_eq!(staged.previous_checksum.as_deref(), Some("c1"));

        ArtifactRow::restore_previous(&conn, id).unwrap();
        let restored = ArtifactRow::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(restored.archive_path, "/archives/one.tar");
        assert_eq!(restored.checksum.as_deref(), Some("c1"));
        assert!(restored.previous_archive_path.is_none());

        ArtifactRow::stage_archive(&conn, id, "/archives/three.tar", Some("c3"), None, None, true)
            .unwrap();
        ArtifactRow::clear_previous(&conn, id).unwrap();
        let committed = ArtifactRow::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(committed.archive_path, "/archives/three.tar");
        assert!(committed.previous_archive_path.is_none());
    }

    #[test]
    fn test_relocating_stage_restores_location() {
        let (_temp, conn) = create_test_db();
        let mut row = artifact("acme.core", "1.0.0");
        row.location = "foreign:acme".to_string();
        let id = row.insert(&conn).unwrap();

        ArtifactRow::stage_archive(
            &conn,
            id,
            "/archives/two.tar",
            Some("c2"),
            None,
            Some("managed:acme.core/1.0.0"),
            true,
        )
        .unwrap();
        let staged = ArtifactRow::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(staged.location, "managed:acme.core/1.0.0");
        assert_eq!(staged.previous_location.as_deref(), Some("foreign:acme"));

        ArtifactRow::restore_previous(&conn, id).unwrap();
        let restored = ArtifactRow::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(restored.location, "foreign:acme");
        assert!(restored.previous_location.is_none());

        // A stage that keeps the location leaves nothing to restore
        ArtifactRow::stage_archive(&conn, id, "/archives/three.tar", Some("c3"), None, None, true)
            .unwrap();
        let kept = ArtifactRow::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(kept.location, "foreign:acme");
        assert!(kept.previous_location.is_none());
    }

    #[test]
    fn test_url_mapping_follows_artifact() {
        let (_temp, conn) = create_test_db();
        let a = artifact("acme.a", "1.0.0").insert(&conn).unwrap();
        let b = artifact("acme.b", "1.0.0").insert(&conn).unwrap();

        ArtifactUrl::set(&conn, "http://example.com/m.tar", a).unwrap();
        let found = ArtifactRow::find_by_url(&conn, "http://example.com/m.tar").unwrap();
        assert_eq!(found.unwrap().id, Some(a));

        ArtifactUrl::set(&conn, "http://example.com/m.tar", b).unwrap();
        let found = ArtifactRow::find_by_url(&conn, "http://example.com/m.tar").unwrap();
        assert_eq!(found.unwrap().id, Some(b));
        assert!(ArtifactUrl::find_by_artifact(&conn, a).unwrap().is_empty());

        ArtifactRow::delete(&conn, b).unwrap();
        assert!(ArtifactRow::find_by_url(&conn, "http://example.com/m.tar")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_journal_status_transitions() {
        let (_temp, conn) = create_test_db();

        let mut entry = JournalEntry::new("Install acme.core:1.0.0".to_string());
        entry.artifact_name = Some("acme.core".to_string());
        let id = entry.insert(&conn).unwrap();

        let pending = JournalEntry::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(pending.status, JournalStatus::Pending);
        assert!(pending.finished_at.is_none());

        JournalEntry::update_status(&conn, id, JournalStatus::RolledBack).unwrap();
        let done = JournalEntry::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(done.status, JournalStatus::RolledBack);
        assert!(done.finished_at.is_some());

        assert_eq!(JournalEntry::list_all(&conn).unwrap().len(), 1);
    }
}
