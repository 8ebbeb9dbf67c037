// src/installer/outcome.rs

//! What an installer run works on and what it reports back

use crate::db::models::ArtifactRow;
use crate::error::{Error, Result};
use crate::installer::transaction::PendingActivation;
use crate::items::DeclaredItem;
use crate::registry::ModuleHandle;
use crate::version::{ModuleVersion, VersionedName};
use std::fmt;
use thiserror::Error;

/// Prefix of the registry location key for managed modules
pub const MANAGED_LOCATION_PREFIX: &str = "managed:";

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// A module archive under (or about to come under) management
///
/// The symbolic name and version start out as whatever the caller supplied
/// and are completed by identity reconciliation. Once set they are never
/// overwritten with a different value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedArtifact {
    pub(crate) symbolic_name: Option<String>,
    pub(crate) version: Option<String>,
    pub checksum: Option<String>,
    pub url: Option<String>,
    pub location: Option<String>,
    /// Record id once tracked
    pub id: Option<i64>,
    pub persistence_needed: bool,
}

impl ManagedArtifact {
    pub fn new() -> Self {
        Self::default()
    }

    /// Artifact known only by where to fetch it
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Artifact with caller-supplied identity
    pub fn named(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            symbolic_name: Some(name.into()),
            version: Some(version.into()),
            ..Self::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn symbolic_name(&self) -> Option<&str> {
        non_blank(&self.symbolic_name)
    }

    /// Version as supplied or reconciled, not normalized
    pub fn version(&self) -> Option<&str> {
        non_blank(&self.version)
    }

    /// Both name and version are known
    pub fn is_name_resolved(&self) -> bool {
        self.symbolic_name().is_some() && self.version().is_some()
    }

    /// Normalized version used by the registry
    pub fn registry_version(&self) -> Option<String> {
        self.version()
            .and_then(|v| ModuleVersion::parse(v).ok())
            .map(|v| v.to_string())
    }

    pub fn versioned_name(&self) -> Result<VersionedName> {
        match (self.symbolic_name(), self.version()) {
            (Some(name), Some(version)) => VersionedName::parse(name, version),
            (None, _) => Err(Error::MissingIdentity("symbolic name".to_string())),
            (_, None) => Err(Error::MissingIdentity("version".to_string())),
        }
    }

    /// Registry location key: the explicit location, else one derived from
    /// the identity
    pub fn location_key(&self) -> Option<String> {
        if let Some(location) = non_blank(&self.location) {
            return Some(location.to_string());
        }
        Some(format!(
            "{}{}/{}",
            MANAGED_LOCATION_PREFIX,
            self.symbolic_name()?,
            self.registry_version()?
        ))
    }

    /// Artifact as recorded
    pub fn from_row(row: &ArtifactRow) -> Self {
        Self {
            symbolic_name: Some(row.symbolic_name.clone()),
            version: Some(row.version.clone()),
            checksum: row.checksum.clone(),
            url: row.url.clone(),
            location: Some(row.location.clone()),
            id: row.id,
            persistence_needed: row.persistence_needed,
        }
    }
}

impl fmt::Display for ManagedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.symbolic_name(), self.version(), non_blank(&self.url)) {
            (Some(name), Some(version), _) => write!(f, "{}:{}", name, version),
            (Some(name), None, _) => write!(f, "{}", name),
            (None, _, Some(url)) => write!(f, "{}", url),
            (None, _, None) => write!(f, "<unidentified module>"),
        }
    }
}

/// How an installer run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeCode {
    IgnoringAlreadyInstalled,
    InstalledNew,
    UpdatedExisting,
    /// Failed before anything in the registry changed
    ErrorPreparing,
    /// Failed during or after staging; rollback was attempted
    ErrorActivating,
}

impl OutcomeCode {
    pub fn as_str(&self) -> &str {
        match self {
            OutcomeCode::IgnoringAlreadyInstalled => "ignoring_already_installed",
            OutcomeCode::InstalledNew => "installed_new",
            OutcomeCode::UpdatedExisting => "updated_existing",
            OutcomeCode::ErrorPreparing => "error_preparing",
            OutcomeCode::ErrorActivating => "error_activating",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, OutcomeCode::ErrorPreparing | OutcomeCode::ErrorActivating)
    }
}

impl fmt::Display for OutcomeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one installer run
pub struct InstallationOutcome {
    pub code: OutcomeCode,
    pub message: String,
    pub artifact: ManagedArtifact,
    pub module: Option<ModuleHandle>,
    /// Items loaded by activation, in load order
    pub items: Vec<DeclaredItem>,
    /// Activation left for the caller to run
    pub deferred: Option<PendingActivation>,
}

impl InstallationOutcome {
    pub(crate) fn new(code: OutcomeCode, message: impl Into<String>, artifact: ManagedArtifact) -> Self {
        Self {
            code,
            message: message.into(),
            artifact,
            module: None,
            items: Vec::new(),
            deferred: None,
        }
    }

    /// Copy of this outcome without the deferred activation
    pub fn detached(&self) -> Self {
        Self {
            code: self.code,
            message: self.message.clone(),
            artifact: self.artifact.clone(),
            module: self.module,
            items: self.items.clone(),
            deferred: None,
        }
    }

    /// Take the deferred activation out, leaving none behind
    pub fn take_deferred(&mut self) -> Option<PendingActivation> {
        self.deferred.take()
    }
}

impl fmt::Debug for InstallationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationOutcome")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("artifact", &self.artifact)
            .field("module", &self.module)
            .field("items", &self.items)
            .field("deferred", &self.deferred.is_some())
            .finish()
    }
}

/// A failed installer run: the failed outcome plus the error behind it
#[derive(Debug, Error)]
#[error("{}", .outcome.message)]
pub struct InstallFailure {
    pub outcome: InstallationOutcome,
    #[source]
    pub error: Error,
}

impl InstallFailure {
    pub fn code(&self) -> OutcomeCode {
        self.outcome.code
    }

    /// Whether rollback itself failed, leaving the system inconsistent
    pub fn rollback_failed(&self) -> bool {
        matches!(self.error, Error::RollbackFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_key_from_identity() {
        let artifact = ManagedArtifact::named("acme.core", "1.0-SNAPSHOT");
        assert_eq!(
            artifact.location_key().as_deref(),
            Some("managed:acme.core/1.0.0.SNAPSHOT")
        );

        let explicit = artifact.clone().with_location("file:///opt/acme.tar");
        assert_eq!(explicit.location_key().as_deref(), Some("file:///opt/acme.tar"));

        assert!(ManagedArtifact::new().location_key().is_none());
    }

    #[test]
    fn test_blank_identity_is_unresolved() {
        let artifact = ManagedArtifact::named("  ", "1.0");
        assert!(!artifact.is_name_resolved());
        assert!(matches!(
            artifact.versioned_name(),
            Err(Error::MissingIdentity(field)) if field == "symbolic name"
        ));
    }

    #[test]
    fn test_display_falls_back_to_url() {
        assert_eq!(
            ManagedArtifact::from_url("http://example.com/a.tar").to_string(),
            "http://example.com/a.tar"
        );
        assert_eq!(ManagedArtifact::named("acme", "2.0").to_string(), "acme:2.0");
    }

    #[test]
    fn test_detached_drops_deferred() {
        let mut outcome = InstallationOutcome::new(
            OutcomeCode::InstalledNew,
            "Installed",
            ManagedArtifact::named("acme", "1.0"),
        );
        outcome.module = Some(3);
        let copy = outcome.detached();
        assert_eq!(copy.code, OutcomeCode::InstalledNew);
        assert_eq!(copy.module, Some(3));
        assert!(copy.deferred.is_none());
        assert!(outcome.take_deferred().is_none());
    }
}
