// src/installer/resolve.rs

//! Content resolution
//!
//! Turns the caller's input (a byte stream, a URL, or a reference to a
//! module already in the registry) into a local temporary archive, or
//! decides up front that there is nothing to do.

use super::identity::match_or_set;
use super::outcome::ManagedArtifact;
use crate::archive::materialize;
use crate::db::models::ArtifactRow;
use crate::error::{Error, Result};
use crate::manager::ModuleManager;
use crate::registry::{ModuleHandle, RegisteredModule};
use crate::version::ModuleVersion;
use std::io::Read;
use tempfile::NamedTempFile;
use tracing::debug;

const RECORD_SOURCE: &str = "artifact record";
const REGISTRY_SOURCE: &str = "installed module";

/// A local archive ready for reconciliation
pub(crate) struct ResolvedArchive {
    pub file: NamedTempFile,
    /// Bytes came from a caller-supplied stream
    pub from_stream: bool,
    /// Untracked registry module being brought under management
    pub adopting: Option<ModuleHandle>,
}

pub(crate) enum Resolution {
    Archive(ResolvedArchive),
    /// Tracked already and nothing asks for an update
    AlreadyInstalled {
        module: Option<RegisteredModule>,
        tracked: ArtifactRow,
    },
}

fn tracked_for_module(manager: &ModuleManager, module: &RegisteredModule) -> Result<Option<ArtifactRow>> {
    let Some(version) = module.version.as_deref() else {
        return Ok(None);
    };
    match ModuleVersion::parse(version) {
        Ok(version) => manager.record().find_by_identity(&module.symbolic_name, &version),
        Err(_) => Ok(None),
    }
}

fn tracked_for_artifact(manager: &ModuleManager, artifact: &ManagedArtifact) -> Result<Option<ArtifactRow>> {
    if let Some(url) = artifact.url.as_deref() {
        if let Some(row) = manager.record().find_by_url(url)? {
            return Ok(Some(row));
        }
    }
    match artifact.versioned_name() {
        Ok(identity) => manager
            .record()
            .find_by_identity(&identity.name, &identity.version),
        Err(_) => Ok(None),
    }
}

/// Adopt the recorded identity of an already tracked artifact
fn adopt_row(artifact: &mut ManagedArtifact, row: &ArtifactRow) -> Result<()> {
    match_or_set(artifact, RECORD_SOURCE, Some(&row.symbolic_name), Some(&row.version))?;
    artifact.id = row.id;
    artifact.checksum = row.checksum.clone();
    artifact.persistence_needed = row.persistence_needed;
    if artifact.location.is_none() {
        artifact.location = Some(row.location.clone());
    }
    Ok(())
}

/// Find the registry module the caller refers to, if any
fn find_module(manager: &ModuleManager, artifact: &ManagedArtifact) -> Result<Option<RegisteredModule>> {
    let registry = manager.registry();

    if let Some(location) = artifact.location.as_deref() {
        if let Some(module) = registry.find_by_location(location) {
            return Ok(Some(module));
        }
    }
    if let Some(url) = artifact.url.as_deref() {
        if let Some(module) = registry.find_by_location(url) {
            return Ok(Some(module));
        }
    }
    if artifact.is_name_resolved() {
        let identity = artifact.versioned_name()?;
        return Ok(registry
            .find_by_identity(&identity.name, &identity.version)
            .into_iter()
            .next());
    }
    Ok(None)
}

/// Copy a source stream into a local archive
///
/// A read failure part way through is reported against `source`; an
/// archive that arrives intact but is malformed keeps its own error.
fn materialize_from(stream: &mut dyn Read, source: &str) -> Result<NamedTempFile> {
    materialize(stream).map_err(|e| match e {
        Error::Io(e) => Error::UnresolvableSource(format!("{}: {}", source, e)),
        other => other,
    })
}

/// Fetch `reference` into a local archive
fn fetch_archive(manager: &ModuleManager, reference: &str, context: &str) -> Result<NamedTempFile> {
    let source = format!("{}{}", context, reference);
    let mut stream = manager
        .fetcher()
        .fetch(reference)
        .map_err(|e| Error::UnresolvableSource(format!("{}: {}", source, e)))?;
    materialize_from(&mut stream, &source)
}

/// Resolve the caller's input to a local archive
pub(crate) fn resolve(
    manager: &ModuleManager,
    artifact: &mut ManagedArtifact,
    input: Option<Box<dyn Read + Send>>,
    force: bool,
) -> Result<Resolution> {
    if let Some(mut stream) = input {
        debug!("Materializing supplied stream for {}", artifact);
        let file = materialize_from(&mut stream, &format!("supplied stream for {}", artifact))?;
        return Ok(Resolution::Archive(ResolvedArchive {
            file,
            from_stream: true,
            adopting: None,
        }));
    }

    if !artifact.is_name_resolved() {
        if let Some(url) = artifact.url.clone() {
            if let Some(row) = manager.record().find_by_url(&url)? {
                debug!("URL {} is recorded as {}:{}", url, row.symbolic_name, row.version);
                match_or_set(artifact, RECORD_SOURCE, Some(&row.symbolic_name), Some(&row.version))?;
            }
        }
    }

    let module = find_module(manager, artifact)?;

    if let Some(module) = &module {
        debug!(
            "Found installed module {} at {} for {}",
            module.handle, module.location, artifact
        );
        if artifact.url.is_none() {
            if let Some(row) = tracked_for_module(manager, module)? {
                adopt_row(artifact, &row)?;
                return Ok(Resolution::AlreadyInstalled {
                    module: Some(module.clone()),
                    tracked: row,
                });
            }

            match_or_set(
                artifact,
                REGISTRY_SOURCE,
                Some(&module.symbolic_name),
                module.version.as_deref(),
            )?;

            if module.location.trim().is_empty() {
                return Err(Error::UnresolvableSource(format!(
                    "Cannot bring {} under management: installed module has no location",
                    artifact
                )));
            }

            let context = format!("cannot bring {} under management from ", artifact);
            let file = fetch_archive(manager, &module.location, &context)?;
            debug!("Bringing existing module {} under management", module.handle);
            return Ok(Resolution::Archive(ResolvedArchive {
                file,
                from_stream: false,
                adopting: Some(module.handle),
            }));
        }
    }

    let Some(url) = artifact.url.clone() else {
        return Err(Error::UnresolvableSource(format!(
            "No input stream, URL or installed module for {}",
            artifact
        )));
    };

    let tracked = match &module {
        Some(module) => tracked_for_module(manager, module)?,
        None => tracked_for_artifact(manager, artifact)?,
    };

    if let Some(row) = tracked {
        if !force {
            debug!("{} is already managed; not fetching {}", row.symbolic_name, url);
            adopt_row(artifact, &row)?;
            return Ok(Resolution::AlreadyInstalled {
                module,
                tracked: row,
            });
        }
    }

    let file = fetch_archive(manager, &url, "")?;

    Ok(Resolution::Archive(ResolvedArchive {
        file,
        from_stream: false,
        adopting: None,
    }))
}
