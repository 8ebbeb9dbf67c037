// src/installer/transaction.rs

//! The install transaction
//!
//! Executes a decision against the registry in three steps: stage the
//! archive, commit metadata to the artifact record, then activate (start
//! the module and load its declared items). A failure during activation
//! rolls the registry, the record and the item store back to where they
//! were before the transaction.

use super::decision::Decision;
use super::outcome::{ManagedArtifact, OutcomeCode};
use super::InstallOptions;
use crate::archive::read_entries_from_bytes;
use crate::db::models::{ArtifactRow, JournalStatus};
use crate::error::{Error, Result};
use crate::items::DeclaredItem;
use crate::manager::ModuleManager;
use crate::record::NewArtifact;
use crate::registry::ModuleHandle;
use crate::version::VersionedName;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

/// Items named individually in the completion log
const MAX_LOGGED_ITEMS: usize = 5;

/// A registry module removed to make room, kept so it can be put back
pub(crate) struct DisplacedModule {
    location: String,
    bytes: Vec<u8>,
}

/// What staging did to the registry
pub(crate) struct Staged {
    pub handle: ModuleHandle,
    pub location: String,
    /// A new registry entry was created
    fresh: bool,
    /// An existing entry had its bytes replaced
    updated: bool,
    displaced: Option<DisplacedModule>,
}

/// Everything activation and its rollback need
pub(crate) struct ActivationPlan {
    pub artifact: ManagedArtifact,
    pub identity: VersionedName,
    pub module: ModuleHandle,
    pub code: OutcomeCode,
    /// The record entry existed before and has a rollback copy
    record_update: bool,
    staged: Staged,
    journal: Option<i64>,
    options: InstallOptions,
}

/// Activation handed back to the caller instead of run inline
///
/// Lets a batch of modules be staged first and activated together.
pub struct PendingActivation {
    manager: Arc<ModuleManager>,
    plan: ActivationPlan,
}

impl PendingActivation {
    pub(crate) fn new(manager: Arc<ModuleManager>, plan: ActivationPlan) -> Self {
        Self { manager, plan }
    }

    pub fn artifact(&self) -> &ManagedArtifact {
        &self.plan.artifact
    }

    /// Start the module and load its items, rolling back on failure
    pub fn run(self) -> Result<Vec<DeclaredItem>> {
        let key = self.plan.identity.to_string();
        let _guard = self.manager.locks().acquire(&key)?;
        activate(&self.manager, &self.plan)
    }
}

fn open_archive(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("{}: {}", path.display(), e),
        ))
    })
}

/// Check the registry reports the expected identity for a handle
fn verify_identity(manager: &ModuleManager, handle: ModuleHandle, identity: &VersionedName) -> Result<()> {
    let module = manager
        .registry()
        .describe(handle)
        .ok_or_else(|| Error::Registry(format!("Module {} vanished after staging", handle)))?;

    if !module.matches(&identity.name, &identity.version) {
        return Err(Error::Registry(format!(
            "Registry reports {}:{} for module {}, expected {}",
            module.symbolic_name,
            module.version.as_deref().unwrap_or("-"),
            handle,
            identity
        )));
    }
    Ok(())
}

/// Put the registry back the way it was before `stage`
pub(crate) fn undo_stage(
    manager: &ModuleManager,
    staged: &Staged,
    tracked: Option<&ArtifactRow>,
) -> Result<()> {
    let registry = manager.registry();
    if staged.fresh {
        registry.uninstall(staged.handle)?;
    } else if staged.updated {
        let row = tracked.ok_or_else(|| {
            Error::Config(format!("No previous archive to restore module {}", staged.handle))
        })?;
        registry.update_in_place(staged.handle, &mut open_archive(Path::new(&row.archive_path))?)?;
    }
    if let Some(displaced) = &staged.displaced {
        registry.install_by_location(&displaced.location, &mut displaced.bytes.as_slice())?;
    }
    debug!("Undid staging of module {}", staged.handle);
    Ok(())
}

/// Apply a decision to the registry
pub(crate) fn stage(
    manager: &ModuleManager,
    decision: Decision,
    location: &str,
    archive: &Path,
    identity: &VersionedName,
    tracked: Option<&ArtifactRow>,
) -> Result<Staged> {
    let registry = manager.registry();

    let staged = match decision {
        Decision::Install => {
            let handle = registry.install_by_location(location, &mut open_archive(archive)?)?;
            debug!("Installed {} as module {}", identity, handle);
            Staged {
                handle,
                location: location.to_string(),
                fresh: true,
                updated: false,
                displaced: None,
            }
        }
        Decision::Reinstall(foreign) => {
            let mut file = open_archive(archive)?;
            let previous = registry
                .describe(foreign)
                .ok_or_else(|| Error::Registry(format!("No module with handle {}", foreign)))?;
            let bytes = registry.read_archive(foreign)?;
            registry.uninstall(foreign)?;
            debug!("Uninstalled unmanaged module {} ({})", foreign, previous.location);

            let displaced = DisplacedModule {
                location: previous.location,
                bytes,
            };
            match registry.install_by_location(location, &mut file) {
                Ok(handle) => Staged {
                    handle,
                    location: location.to_string(),
                    fresh: true,
                    updated: false,
                    displaced: Some(displaced),
                },
                Err(e) => {
                    if let Err(restore) = registry
                        .install_by_location(&displaced.location, &mut displaced.bytes.as_slice())
                    {
                        return Err(Error::RollbackFailed {
                            artifact: identity.to_string(),
                            original: Box::new(e),
                            rollback: Box::new(restore),
                        });
                    }
                    return Err(e);
                }
            }
        }
        Decision::Update(handle) => {
            registry.update_in_place(handle, &mut open_archive(archive)?)?;
            debug!("Updated module {} in place with {}", handle, identity);
            Staged {
                handle,
                location: location.to_string(),
                fresh: false,
                updated: true,
                displaced: None,
            }
        }
        Decision::Reuse(handle) => Staged {
            handle,
            location: location.to_string(),
            fresh: false,
            updated: false,
            displaced: None,
        },
        Decision::AlreadyInstalled => {
            return Err(Error::Usage(format!("Nothing to stage for {}", identity)));
        }
    };

    if let Err(e) = verify_identity(manager, staged.handle, identity) {
        if let Err(undo) = undo_stage(manager, &staged, tracked) {
            return Err(Error::RollbackFailed {
                artifact: identity.to_string(),
                original: Box::new(e),
                rollback: Box::new(undo),
            });
        }
        return Err(e);
    }

    Ok(staged)
}

/// Record the staged artifact and notify the persistence listener
///
/// Ownership of `archive` passes to the artifact record.
pub(crate) fn commit(
    manager: &ModuleManager,
    artifact: &mut ManagedArtifact,
    identity: &VersionedName,
    staged: Staged,
    archive: NamedTempFile,
    tracked: Option<&ArtifactRow>,
    options: InstallOptions,
) -> std::result::Result<ActivationPlan, (Error, Staged)> {
    let record = manager.record();
    artifact.persistence_needed = manager.policy().should_persist(&identity.name);

    let committed = match tracked {
        Some(row) => {
            let Some(id) = row.id else {
                return Err((
                    Error::Config(format!("Tracked artifact {} has no id", identity)),
                    staged,
                ));
            };
            // A fresh registry entry means the artifact moved
            let relocated = staged.fresh.then_some(staged.location.as_str());
            record
                .replace_archive(
                    id,
                    archive,
                    artifact.checksum.as_deref(),
                    artifact.url.as_deref(),
                    relocated,
                    artifact.persistence_needed,
                )
                .map(|rollback_copy| {
                    debug!("Retained {} for rollback", rollback_copy.display());
                    artifact.id = Some(id);
                    match relocated {
                        Some(location) => artifact.location = Some(location.to_string()),
                        None if artifact.location.is_none() => {
                            artifact.location = Some(row.location.clone());
                        }
                        None => {}
                    }
                    OutcomeCode::UpdatedExisting
                })
        }
        None => record
            .insert(
                NewArtifact {
                    symbolic_name: identity.name.clone(),
                    version: artifact
                        .version()
                        .map(str::to_string)
                        .unwrap_or_else(|| identity.version.to_string()),
                    registry_version: identity.version.to_string(),
                    checksum: artifact.checksum.clone(),
                    url: artifact.url.clone(),
                    location: staged.location.clone(),
                    persistence_needed: artifact.persistence_needed,
                },
                archive,
            )
            .map(|row| {
                artifact.id = row.id;
                artifact.location = Some(row.location);
                OutcomeCode::InstalledNew
            }),
    };

    let code = match committed {
        Ok(code) => code,
        Err(e) => return Err((e, staged)),
    };

    if artifact.persistence_needed {
        match code {
            OutcomeCode::UpdatedExisting => manager.listener().on_changed(artifact),
            _ => manager.listener().on_managed(artifact),
        }
    }

    let verb = if code == OutcomeCode::UpdatedExisting {
        "Update"
    } else {
        "Install"
    };
    let journal = match record.open_journal(
        format!("{} {}", verb, identity),
        &identity.name,
        &identity.version.to_string(),
    ) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!("Failed to journal install of {}: {}", identity, e);
            None
        }
    };

    Ok(ActivationPlan {
        artifact: artifact.clone(),
        identity: identity.clone(),
        module: staged.handle,
        code,
        record_update: tracked.is_some(),
        staged,
        journal,
        options,
    })
}

/// Items touched by a partial activation, for rollback
#[derive(Default)]
struct Progress {
    /// Previous items of this artifact, in original order
    removed_old: Vec<DeclaredItem>,
    /// Items of other artifacts shadowed, in displacement order
    displaced: Vec<DeclaredItem>,
    added: Vec<DeclaredItem>,
}

fn load(manager: &ModuleManager, plan: &ActivationPlan, progress: &mut Progress) -> Result<Vec<DeclaredItem>> {
    if plan.options.start {
        manager
            .registry()
            .start(plan.module)
            .map_err(|e| Error::Activation(format!("Failed to start {}: {}", plan.identity, e)))?;
        debug!("Started module {}", plan.module);
    }

    if !plan.options.load_items {
        return Ok(Vec::new());
    }

    let store = manager.items();
    if plan.record_update {
        let old = store.items_of(&plan.identity);
        store.remove(&old)?;
        debug!("Removed {} previous item(s) of {}", old.len(), plan.identity);
        progress.removed_old = old;
    }

    let parser = manager.parser();
    let bytes = manager.registry().read_archive(plan.module)?;
    let entries = read_entries_from_bytes(&bytes)?;
    let Some(entry) = entries
        .iter()
        .find(|entry| !entry.is_dir && entry.name == parser.file_name())
    else {
        debug!("{} declares no items", plan.identity);
        return Ok(Vec::new());
    };
    let descriptor = parser.parse(&entry.content)?;

    let module_version = plan
        .artifact
        .version()
        .map(str::to_string)
        .unwrap_or_else(|| plan.identity.version.to_string());

    for definition in descriptor.items {
        let item = DeclaredItem {
            name: definition.name,
            version: definition
                .version
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| module_version.clone()),
            kind: definition.kind,
            definition: definition.definition,
            artifact: plan.identity.clone(),
        };
        if plan.options.validate_items {
            item.validate()?;
        }
        if let Some(displaced) = store.insert(item.clone(), plan.options.force)? {
            debug!("{} shadows {} of {}", plan.identity, displaced, displaced.artifact);
            progress.displaced.push(displaced);
        }
        progress.added.push(item);
    }

    Ok(progress.added.clone())
}

fn rollback(manager: &ModuleManager, plan: &ActivationPlan, progress: &Progress) -> Result<()> {
    let registry = manager.registry();
    let record = manager.record();
    let store = manager.items();
    let id = plan
        .artifact
        .id
        .ok_or_else(|| Error::Config(format!("{} was never recorded", plan.identity)))?;

    store.remove(&progress.added)?;

    if plan.record_update {
        let restored = record.rollback_archive(id)?;
        if plan.staged.updated {
            registry.update_in_place(plan.module, &mut open_archive(&restored)?)?;
            debug!("Restored module {} from {}", plan.module, restored.display());
        }
        if plan.staged.fresh {
            registry.uninstall(plan.module)?;
        }
        if plan.artifact.persistence_needed {
            if let Some(row) = record.find_by_id(id)? {
                manager.listener().on_changed(&ManagedArtifact::from_row(&row));
            }
        }
    } else {
        if plan.staged.fresh {
            registry.uninstall(plan.module)?;
            debug!("Uninstalled module {}", plan.module);
        }
        record.remove(id)?;
        if plan.artifact.persistence_needed {
            manager.listener().on_unmanaged(&plan.artifact);
        }
    }

    if let Some(displaced) = &plan.staged.displaced {
        registry.install_by_location(&displaced.location, &mut displaced.bytes.as_slice())?;
        debug!("Reinstalled displaced module at {}", displaced.location);
    }

    for item in &progress.removed_old {
        store.add_back(item.clone(), true)?;
    }
    for item in progress.displaced.iter().rev() {
        store.add_back(item.clone(), true)?;
    }

    Ok(())
}

fn finish_journal(manager: &ModuleManager, plan: &ActivationPlan, status: JournalStatus) {
    if let Some(journal) = plan.journal {
        if let Err(e) = manager.record().finish_journal(journal, status) {
            warn!("Failed to update journal for {}: {}", plan.identity, e);
        }
    }
}

fn log_installed(plan: &ActivationPlan, items: &[DeclaredItem]) {
    let verb = if plan.code == OutcomeCode::UpdatedExisting {
        "Updated"
    } else {
        "Installed"
    };

    if items.is_empty() {
        info!("{} {}", verb, plan.identity);
        return;
    }

    let mut listed: Vec<String> = items
        .iter()
        .take(MAX_LOGGED_ITEMS)
        .map(ToString::to_string)
        .collect();
    if items.len() > MAX_LOGGED_ITEMS {
        listed.push(format!("... ({} more)", items.len() - MAX_LOGGED_ITEMS));
    }
    info!(
        "{} {} with {} item(s): {}",
        verb,
        plan.identity,
        items.len(),
        listed.join(", ")
    );
}

/// Activate a staged module, rolling everything back if that fails
pub(crate) fn activate(manager: &ModuleManager, plan: &ActivationPlan) -> Result<Vec<DeclaredItem>> {
    let mut progress = Progress::default();

    match load(manager, plan, &mut progress) {
        Ok(items) => {
            if plan.record_update {
                if let Some(id) = plan.artifact.id {
                    if let Err(e) = manager.record().commit_archive(id) {
                        warn!("Failed to discard rollback copy of {}: {}", plan.identity, e);
                    }
                }
            }
            finish_journal(manager, plan, JournalStatus::Applied);
            log_installed(plan, &items);
            Ok(items)
        }
        Err(original) => {
            warn!("Activation of {} failed: {}; rolling back", plan.identity, original);
            match rollback(manager, plan, &progress) {
                Ok(()) => {
                    finish_journal(manager, plan, JournalStatus::RolledBack);
                    debug!("Rolled back {}", plan.identity);
                    Err(original)
                }
                Err(rollback_error) => {
                    error!(
                        "Failure installing and rolling back {}; state may be inconsistent. \
                         Installation error: {}. Rollback error: {}",
                        plan.identity, original, rollback_error
                    );
                    finish_journal(manager, plan, JournalStatus::Failed);
                    Err(Error::RollbackFailed {
                        artifact: plan.identity.to_string(),
                        original: Box::new(original),
                        rollback: Box::new(rollback_error),
                    })
                }
            }
        }
    }
}
