// src/installer/decision.rs

//! Deciding what to do with a reconciled archive

use super::outcome::ManagedArtifact;
use crate::archive::same_bytes;
use crate::db::models::ArtifactRow;
use crate::error::{Error, Result};
use crate::manager::ModuleManager;
use crate::registry::{ModuleHandle, RegisteredModule};
use crate::version::VersionedName;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// What the install transaction should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do
    AlreadyInstalled,
    /// Manage an equivalent module already in the registry as is
    Reuse(ModuleHandle),
    /// Replace the bytes of the tracked module
    Update(ModuleHandle),
    /// Uninstall a foreign module with the same identity, then install
    Reinstall(ModuleHandle),
    Install,
}

/// Everything the decision depends on
pub(crate) struct DecisionInput<'a> {
    pub identity: &'a VersionedName,
    pub artifact: &'a ManagedArtifact,
    pub checksum: Option<&'a str>,
    pub tracked: Option<&'a ArtifactRow>,
    pub local_archive: &'a Path,
    pub from_stream: bool,
    pub adopting: Option<ModuleHandle>,
    pub force: bool,
}

/// Whether a registry module holds the same archive as the local file
///
/// A module installed from the supplied URL is equivalent by definition.
/// Otherwise the bytes are compared, read from the registry or fetched from
/// the module's location. Any failure to read means not equivalent.
fn is_equivalent(
    manager: &ModuleManager,
    module: &RegisteredModule,
    url: Option<&str>,
    local_archive: &Path,
) -> bool {
    if url.is_some_and(|url| url == module.location) {
        return true;
    }

    match manager.registry().read_archive(module.handle) {
        Ok(bytes) => match fs::read(local_archive) {
            Ok(local) => return local == bytes,
            Err(e) => {
                debug!("Cannot read local archive {}: {}", local_archive.display(), e);
                return false;
            }
        },
        Err(e) => debug!("Registry cannot supply module {}: {}", module.handle, e),
    }

    match manager.fetcher().fetch(&module.location) {
        Ok(mut stream) => same_bytes(local_archive, &mut stream).unwrap_or_else(|e| {
            debug!("Cannot compare with {}: {}", module.location, e);
            false
        }),
        Err(e) => {
            debug!("Cannot fetch {} for comparison: {}", module.location, e);
            false
        }
    }
}

/// Point a supplied URL at the tracked artifact if the record disagrees
fn remap_url(manager: &ModuleManager, url: &str, tracked: &ArtifactRow) -> Result<()> {
    let Some(id) = tracked.id else {
        return Ok(());
    };
    let current = manager.record().find_by_url(url)?;
    if current.as_ref().and_then(|row| row.id) != Some(id) {
        match current {
            Some(other) => warn!(
                "URL {} was recorded for {}:{}; remapping to {}:{}",
                url, other.symbolic_name, other.version, tracked.symbolic_name, tracked.version
            ),
            None => warn!(
                "URL {} was not recorded; mapping to {}:{}",
                url, tracked.symbolic_name, tracked.version
            ),
        }
        manager.record().set_url(url, id)?;
    }
    Ok(())
}

/// Choose between no-op, reuse, update, reinstall, install or conflict
pub(crate) fn decide(manager: &ModuleManager, input: &DecisionInput<'_>) -> Result<Decision> {
    let registry = manager.registry();
    let url = input.artifact.url.as_deref();
    let identity = input.identity;

    let same_identity = registry.find_by_identity(&identity.name, &identity.version);
    let equivalent = || {
        same_identity
            .iter()
            .find(|module| is_equivalent(manager, module, url, input.local_archive))
    };

    let Some(tracked) = input.tracked else {
        if let Some(module) = equivalent() {
            debug!("Reusing equivalent module {} for {}", module.handle, identity);
            return Ok(Decision::Reuse(module.handle));
        }
        if let Some(module) = same_identity.first() {
            if input.adopting == Some(module.handle) && !input.force {
                return Ok(Decision::Reuse(module.handle));
            }
            debug!("Replacing unmanaged module {} for {}", module.handle, identity);
            return Ok(Decision::Reinstall(module.handle));
        }
        return Ok(Decision::Install);
    };

    if let Some(url) = url {
        remap_url(manager, url, tracked)?;
    }

    let tracked_module = registry.find_by_location(&tracked.location);

    if tracked_module.is_some()
        && tracked.checksum.is_some()
        && tracked.checksum.as_deref() == input.checksum
    {
        debug!("{} already installed with same checksum", identity);
        return Ok(Decision::AlreadyInstalled);
    }

    if equivalent().is_some() {
        debug!("{} already installed with equivalent archive", identity);
        return Ok(Decision::AlreadyInstalled);
    }

    let can_update = input.force || (identity.version.is_snapshot() && input.from_stream);
    if can_update {
        return Ok(match tracked_module {
            Some(module) => Decision::Update(module.handle),
            None => {
                warn!(
                    "{} is recorded as managed but missing from the registry; installing",
                    identity
                );
                Decision::Install
            }
        });
    }

    if !same_identity.is_empty() && (tracked.checksum.is_none() || input.checksum.is_none()) {
        warn!(
            "Checksum unavailable for {}; assuming the installed module is identical",
            identity
        );
        return Ok(Decision::AlreadyInstalled);
    }

    if tracked_module.is_some() || !same_identity.is_empty() {
        Err(Error::Conflict(format!(
            "Cannot install a different module with the same non-snapshot version {}",
            identity
        )))
    } else {
        Err(Error::Conflict(format!(
            "{} is tracked but not found in the registry; will not reinstall without force",
            identity
        )))
    }
}
