// src/installer/mod.rs

//! The versioned module installer
//!
//! An `ArchiveInstaller` takes one archive (a byte stream, a URL, or a
//! reference to a module already in the registry) and brings it under
//! management:
//!
//! 1. resolve the input to a local temporary archive
//! 2. reconcile the archive's symbolic name and version
//! 3. compute its checksum
//! 4. decide between no-op, reuse, update, reinstall, install or conflict
//! 5. stage the archive in the registry and record it
//! 6. start the module and load its declared items, inline or deferred
//!
//! A failure in step 6 rolls steps 5 and 6 back. Each installer runs once.

pub mod decision;
pub(crate) mod identity;
pub mod outcome;
pub(crate) mod resolve;
pub mod transaction;

pub use decision::Decision;
pub use outcome::{InstallFailure, InstallationOutcome, ManagedArtifact, OutcomeCode};
pub use transaction::PendingActivation;

use crate::archive::compute_checksum;
use crate::error::{Error, Result};
use crate::manager::ModuleManager;
use crate::registry::ModuleHandle;
use crate::version::VersionedName;
use decision::{decide, DecisionInput};
use identity::{reconcile, Reconciled};
use resolve::{resolve, Resolution};
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Flags controlling one installer run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOptions {
    /// Start the module after staging
    pub start: bool,
    /// Load the module's declared items after staging
    pub load_items: bool,
    /// Replace non-snapshot versions and shadow other modules' items
    pub force: bool,
    /// Return activation to the caller instead of running it
    pub defer_activation: bool,
    /// Reject items without a name or with an unparseable version
    pub validate_items: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            start: true,
            load_items: true,
            force: false,
            defer_activation: false,
            validate_items: true,
        }
    }
}

/// Where an installer run is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerState {
    Uninitialized,
    Resolved,
    IdentityReconciled,
    Decided,
    Staged,
    Activated,
    RolledBack,
    Done,
    Failed,
}

/// Installs a single module archive
pub struct ArchiveInstaller {
    manager: Arc<ModuleManager>,
    artifact: ManagedArtifact,
    input: Option<Box<dyn Read + Send>>,
    options: InstallOptions,
    state: InstallerState,
    consumed_stream: bool,
    cached: Option<InstallationOutcome>,
}

impl ArchiveInstaller {
    /// Installer for `artifact`, reading bytes from `input` when given
    pub fn new(
        manager: Arc<ModuleManager>,
        artifact: ManagedArtifact,
        input: Option<Box<dyn Read + Send>>,
    ) -> Self {
        Self {
            manager,
            artifact,
            input,
            options: InstallOptions::default(),
            state: InstallerState::Uninitialized,
            consumed_stream: false,
            cached: None,
        }
    }

    pub fn with_options(mut self, options: InstallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> InstallerState {
        self.state
    }

    pub fn artifact(&self) -> &ManagedArtifact {
        &self.artifact
    }

    /// Run the installer
    ///
    /// A second call replays the first outcome when it succeeded without
    /// consuming a stream; otherwise it is a usage error.
    pub fn install(&mut self) -> std::result::Result<InstallationOutcome, InstallFailure> {
        if self.state != InstallerState::Uninitialized {
            if self.state == InstallerState::Done && !self.consumed_stream {
                if let Some(cached) = &self.cached {
                    debug!("Replaying outcome for {}", self.artifact);
                    return Ok(cached.detached());
                }
            }
            let error = Error::Usage(format!(
                "Installer for {} has already run ({:?})",
                self.artifact, self.state
            ));
            return Err(InstallFailure {
                outcome: InstallationOutcome::new(
                    OutcomeCode::ErrorPreparing,
                    error.to_string(),
                    self.artifact.clone(),
                ),
                error,
            });
        }

        match self.run() {
            Ok(outcome) => {
                self.state = InstallerState::Done;
                self.cached = Some(outcome.detached());
                Ok(outcome)
            }
            Err(error) => Err(self.fail(error)),
        }
    }

    fn fail(&mut self, error: Error) -> InstallFailure {
        let (code, message) = match self.state {
            InstallerState::Uninitialized
            | InstallerState::Resolved
            | InstallerState::IdentityReconciled => (
                OutcomeCode::ErrorPreparing,
                format!("Error preparing {}: {}", self.artifact, error),
            ),
            InstallerState::Decided => (
                OutcomeCode::ErrorActivating,
                format!("Error staging {}: {}", self.artifact, error),
            ),
            _ if matches!(error, Error::RollbackFailed { .. }) => (
                OutcomeCode::ErrorActivating,
                format!(
                    "Error activating {}; rollback also failed: {}",
                    self.artifact, error
                ),
            ),
            _ => (
                OutcomeCode::ErrorActivating,
                format!("Error activating {}; rolled back: {}", self.artifact, error),
            ),
        };

        self.state = if self.state == InstallerState::Staged && !error.is_fatal() {
            InstallerState::RolledBack
        } else {
            InstallerState::Failed
        };

        if error.is_fatal() {
            error!("{}", message);
        } else {
            debug!("{}", message);
        }

        InstallFailure {
            outcome: InstallationOutcome::new(code, message, self.artifact.clone()),
            error,
        }
    }

    fn already_installed(&self, identity: Option<&VersionedName>, module: Option<ModuleHandle>) -> InstallationOutcome {
        let mut outcome = InstallationOutcome::new(
            OutcomeCode::IgnoringAlreadyInstalled,
            format!("{} is already installed", self.artifact),
            self.artifact.clone(),
        );
        outcome.module = module;
        if let Some(identity) = identity {
            outcome.items = self.manager.items().items_of(identity);
        }
        info!("{}", outcome.message);
        outcome
    }

    fn run(&mut self) -> Result<InstallationOutcome> {
        let manager = Arc::clone(&self.manager);
        let input = self.input.take();
        self.consumed_stream = input.is_some();

        let resolved = match resolve(&manager, &mut self.artifact, input, self.options.force)? {
            Resolution::AlreadyInstalled { module, tracked } => {
                self.state = InstallerState::Resolved;
                debug!("{} resolved to tracked artifact {:?}", self.artifact, tracked.id);
                let identity = self.artifact.versioned_name().ok();
                return Ok(self.already_installed(identity.as_ref(), module.map(|m| m.handle)));
            }
            Resolution::Archive(resolved) => resolved,
        };
        self.state = InstallerState::Resolved;

        let Reconciled { file, identity } =
            reconcile(manager.parser(), &mut self.artifact, resolved.file)?;
        self.state = InstallerState::IdentityReconciled;

        let checksum = compute_checksum(file.path())?;
        debug!("Checksum of {} is {}", identity, checksum);
        self.artifact.checksum = Some(checksum);

        let _guard = manager.locks().acquire(&identity.to_string())?;

        let tracked = manager
            .record()
            .find_by_identity(&identity.name, &identity.version)?;

        let decision = decide(
            &manager,
            &DecisionInput {
                identity: &identity,
                artifact: &self.artifact,
                checksum: self.artifact.checksum.as_deref(),
                tracked: tracked.as_ref(),
                local_archive: file.path(),
                from_stream: resolved.from_stream,
                adopting: resolved.adopting,
                force: self.options.force,
            },
        )?;
        self.state = InstallerState::Decided;
        debug!("Decision for {}: {:?}", identity, decision);

        let registry = manager.registry();

        if decision == Decision::AlreadyInstalled {
            let module = tracked
                .as_ref()
                .and_then(|row| registry.find_by_location(&row.location))
                .or_else(|| {
                    registry
                        .find_by_identity(&identity.name, &identity.version)
                        .into_iter()
                        .next()
                });
            if let Some(row) = &tracked {
                self.artifact.id = row.id;
                self.artifact.persistence_needed = row.persistence_needed;
                if self.artifact.location.is_none() {
                    self.artifact.location = Some(row.location.clone());
                }
            }
            return Ok(self.already_installed(Some(&identity), module.map(|m| m.handle)));
        }

        let location = match decision {
            Decision::Update(handle) | Decision::Reuse(handle) => registry
                .describe(handle)
                .map(|module| module.location)
                .ok_or_else(|| Error::Registry(format!("No module with handle {}", handle)))?,
            _ => self.artifact.location_key().ok_or_else(|| {
                Error::MissingIdentity("symbolic name".to_string())
            })?,
        };

        let staged = transaction::stage(
            &manager,
            decision,
            &location,
            file.path(),
            &identity,
            tracked.as_ref(),
        )?;

        let plan = match transaction::commit(
            &manager,
            &mut self.artifact,
            &identity,
            staged,
            file,
            tracked.as_ref(),
            self.options,
        ) {
            Ok(plan) => plan,
            Err((e, staged)) => {
                if let Err(undo) = transaction::undo_stage(&manager, &staged, tracked.as_ref()) {
                    return Err(Error::RollbackFailed {
                        artifact: identity.to_string(),
                        original: Box::new(e),
                        rollback: Box::new(undo),
                    });
                }
                return Err(e);
            }
        };
        self.state = InstallerState::Staged;

        let mut outcome = InstallationOutcome::new(
            plan.code,
            match plan.code {
                OutcomeCode::UpdatedExisting => format!("Updated {}", identity),
                _ => format!("Installed {}", identity),
            },
            self.artifact.clone(),
        );
        outcome.module = Some(plan.module);

        if self.options.defer_activation {
            outcome.message = format!("{}; activation deferred", outcome.message);
            outcome.deferred = Some(PendingActivation::new(Arc::clone(&manager), plan));
            return Ok(outcome);
        }

        outcome.items = transaction::activate(&manager, &plan)?;
        self.state = InstallerState::Activated;
        Ok(outcome)
    }
}
