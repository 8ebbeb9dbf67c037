// src/lib.rs

//! Stowage Module Installer
//!
//! Installs versioned module archives into a module registry with
//! checksum-based idempotence and transactional rollback.
//!
//! # Architecture
//!
//! - Archives: tar (optionally gzip or zstd) carrying `META-INF/MANIFEST.MF`
//!   and an optional `catalog.json` descriptor of declared items
//! - Identity: symbolic name plus normalized version, reconciled from the
//!   caller, the descriptor and the manifest
//! - Artifact record: SQLite-backed map of managed artifacts, their URLs,
//!   checksums and retained archives, plus an install journal
//! - Transactions: stage, commit and activate, with full rollback of the
//!   registry, record and item store when activation fails

pub mod archive;
pub mod db;
mod error;
pub mod fetch;
pub mod installer;
pub mod items;
pub mod manager;
pub mod persistence;
pub mod record;
pub mod registry;
pub mod version;

pub use error::{Error, Result};
pub use installer::{
    ArchiveInstaller, Decision, InstallFailure, InstallOptions, InstallationOutcome,
    InstallerState, ManagedArtifact, OutcomeCode, PendingActivation,
};
pub use manager::{InstallerConfig, ModuleManager};
