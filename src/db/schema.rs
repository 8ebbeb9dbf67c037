// src/db/schema.rs

//! Database schema definitions and migrations for Stowage
//!
//! This module defines the SQLite schema for the artifact record and
//! provides a migration system to evolve the schema over time.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        debug!("Schema is up to date");
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!(
        "Schema migration complete. Now at version {}",
        SCHEMA_VERSION
    );
    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        3 => migrate_v3(conn),
        _ => Err(Error::InitError(format!(
            "Unknown migration version: {}",
            version
        ))),
    }
}

/// Initial schema - Version 1
///
/// - managed_artifacts: every artifact brought under management
/// - artifact_urls: source URL to artifact mapping
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE managed_artifacts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            symbolic_name TEXT NOT NULL,
            version TEXT NOT NULL,
            registry_version TEXT NOT NULL,
            checksum TEXT,
            url TEXT,
            location TEXT NOT NULL,
            persistence_needed INTEGER NOT NULL DEFAULT 1,
            archive_path TEXT NOT NULL,
            previous_archive_path TEXT,
            previous_checksum TEXT,
            installed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(symbolic_name, registry_version)
        );

        CREATE INDEX idx_managed_artifacts_name ON managed_artifacts(symbolic_name);
        CREATE INDEX idx_managed_artifacts_location ON managed_artifacts(location);

        CREATE TABLE artifact_urls (
            url TEXT PRIMARY KEY,
            artifact_id INTEGER NOT NULL,
            FOREIGN KEY (artifact_id) REFERENCES managed_artifacts(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_artifact_urls_artifact ON artifact_urls(artifact_id);
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Schema Version 2: install journal
///
/// One row per staged install, tracking whether it was applied, rolled
/// back, or left inconsistent by a failed rollback.
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 2");

    conn.execute_batch(
        "
        CREATE TABLE install_journal (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            description TEXT NOT NULL,
            artifact_name TEXT,
            artifact_version TEXT,
            status TEXT NOT NULL CHECK(status IN ('pending', 'applied', 'rolled_back', 'failed')),
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            finished_at TEXT
        );

        CREATE INDEX idx_install_journal_status ON install_journal(status);
        CREATE INDEX idx_install_journal_created_at ON install_journal(created_at);
        ",
    )?;

    info!("Schema version 2 applied successfully");
    Ok(())
}

/// Schema Version 3: relocating updates
///
/// Remembers the registry location an artifact had before an update moved
/// it, so a rollback can point the record back at it.
fn migrate_v3(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 3");

    conn.execute_batch(
        "
        ALTER TABLE managed_artifacts ADD COLUMN previous_location TEXT;
        ",
    )?;

    info!("Schema version 3 applied successfully");
    Ok(())
}
