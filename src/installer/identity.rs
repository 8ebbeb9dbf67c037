// src/installer/identity.rs

//! Identity reconciliation
//!
//! A module's symbolic name and version may come from three places, in
//! priority order: the caller, the descriptor inside the archive, and the
//! archive manifest. The first non-blank value wins and every later source
//! must agree with it. Whatever the manifest lacks is then written into it
//! so the registry sees the reconciled identity.

use super::outcome::ManagedArtifact;
use crate::archive::descriptor::DescriptorParser;
use crate::archive::manifest::{self, Manifest};
use crate::archive::{read_entries, rewrite_with_manifest};
use crate::error::{Error, Result};
use crate::version::{equal_as_module_versions, ModuleVersion, VersionedName};
use tempfile::NamedTempFile;
use tracing::debug;

const MANIFEST_SOURCE: &str = "MANIFEST.MF in archive";

/// An archive whose identity is settled
#[derive(Debug)]
pub(crate) struct Reconciled {
    pub file: NamedTempFile,
    pub identity: VersionedName,
}

fn blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Fill blank identity fields from `source`, or check they agree with it
///
/// Returns true when `source` supplied both a name and a version.
pub(crate) fn match_or_set(
    artifact: &mut ManagedArtifact,
    source: &str,
    name: Option<&str>,
    version: Option<&str>,
) -> Result<bool> {
    let name = blank(name);
    let version = blank(version);

    if let Some(found) = name {
        match artifact.symbolic_name() {
            None => artifact.symbolic_name = Some(found.to_string()),
            Some(expected) if expected == found => {}
            Some(expected) => {
                return Err(Error::IdentityMismatch {
                    field: "symbolic name",
                    found: found.to_string(),
                    source_name: source.to_string(),
                    expected: expected.to_string(),
                });
            }
        }
    }

    if let Some(found) = version {
        match artifact.version() {
            None => artifact.version = Some(found.to_string()),
            Some(expected) if equal_as_module_versions(expected, found) => {}
            Some(expected) => {
                return Err(Error::IdentityMismatch {
                    field: "version",
                    found: found.to_string(),
                    source_name: source.to_string(),
                    expected: expected.to_string(),
                });
            }
        }
    }

    Ok(name.is_some() && version.is_some())
}

/// Settle the identity of a materialized archive
///
/// Consumes the archive file; when the manifest has to change, the returned
/// file is a rewritten copy and the original is deleted.
pub(crate) fn reconcile(
    parser: &dyn DescriptorParser,
    artifact: &mut ManagedArtifact,
    file: NamedTempFile,
) -> Result<Reconciled> {
    let entries = read_entries(file.path())?;
    let find = |name: &str| {
        entries
            .iter()
            .find(|entry| !entry.is_dir && entry.name == name)
            .map(|entry| entry.content.as_slice())
    };

    let descriptor = find(parser.file_name())
        .map(|bytes| parser.parse(bytes))
        .transpose()?;
    if let Some(descriptor) = &descriptor {
        let source = format!("{} in archive", parser.file_name());
        match_or_set(
            artifact,
            &source,
            descriptor.name.as_deref(),
            descriptor.version.as_deref(),
        )?;
    }

    let existing = find(manifest::MANIFEST_PATH)
        .map(Manifest::parse)
        .transpose()?;
    if let Some(manifest) = &existing {
        match_or_set(
            artifact,
            MANIFEST_SOURCE,
            manifest.symbolic_name(),
            manifest.version(),
        )?;
    }

    let name = artifact
        .symbolic_name()
        .ok_or_else(|| Error::MissingIdentity("symbolic name".to_string()))?
        .to_string();
    let version = artifact
        .version()
        .ok_or_else(|| Error::MissingIdentity("version".to_string()))?;
    let identity = VersionedName::new(name.clone(), ModuleVersion::parse(version)?);

    let mut injected = existing.unwrap_or_default();
    let mut changed = false;
    if blank(injected.get(manifest::MANIFEST_VERSION)).is_none() {
        injected.set(manifest::MANIFEST_VERSION, manifest::MANIFEST_VERSION_VALUE);
        changed = true;
    }
    if blank(injected.symbolic_name()).is_none() {
        injected.set(manifest::SYMBOLIC_NAME, name);
        changed = true;
    }
    if blank(injected.version()).is_none() {
        injected.set(manifest::VERSION, identity.version.to_string());
        changed = true;
    }

    let file = if changed {
        debug!("Writing reconciled identity {} into manifest", identity);
        let rewritten = rewrite_with_manifest(file.path(), &injected)?;
        drop(file);
        rewritten
    } else {
        file
    };

    Ok(Reconciled { file, identity })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::entry;
    use crate::archive::{write_archive, JsonDescriptorParser};

    #[test]
    fn test_match_or_set_fills_blanks() {
        let mut artifact = ManagedArtifact::new();
        let complete = match_or_set(&mut artifact, "supplied", Some("acme"), None).unwrap();
        assert!(!complete);
        assert_eq!(artifact.symbolic_name(), Some("acme"));

        let complete = match_or_set(&mut artifact, "descriptor", Some("acme"), Some("1.0")).unwrap();
        assert!(complete);
        assert_eq!(artifact.version(), Some("1.0"));
    }

    #[test]
    fn test_match_or_set_compares_versions_normalized() {
        let mut artifact = ManagedArtifact::named("acme", "1.0");
        assert!(match_or_set(&mut artifact, "manifest", Some("acme"), Some("1.0.0")).is_ok());

        let err = match_or_set(&mut artifact, "manifest", Some("acme"), Some("1.1")).unwrap_err();
        assert!(matches!(err, Error::IdentityMismatch { field: "version", .. }));

        let err = match_or_set(&mut artifact, "manifest", Some("other"), None).unwrap_err();
        assert!(matches!(err, Error::IdentityMismatch { field: "symbolic name", .. }));
    }

    #[test]
    fn test_reconcile_prefers_descriptor_and_injects_manifest() {
        let archive = write_archive(&[
            entry("catalog.json", r#"{"name": "acme.web", "version": "2.0", "items": []}"#),
            entry("payload.txt", "x"),
        ])
        .unwrap();

        let mut artifact = ManagedArtifact::new();
        let reconciled = reconcile(&JsonDescriptorParser, &mut artifact, archive).unwrap();

        assert_eq!(reconciled.identity.to_string(), "acme.web:2.0.0");
        let entries = read_entries(reconciled.file.path()).unwrap();
        assert_eq!(entries[0].name, manifest::MANIFEST_PATH);
        let written = Manifest::parse(&entries[0].content).unwrap();
        assert_eq!(written.symbolic_name(), Some("acme.web"));
        assert_eq!(written.version(), Some("2.0.0"));
        assert_eq!(written.get(manifest::MANIFEST_VERSION), Some("1.0"));
    }

    #[test]
    fn test_reconcile_rejects_conflicting_manifest() {
        let archive = write_archive(&[entry(
            manifest::MANIFEST_PATH,
            "Manifest-Version: 1.0\nModule-SymbolicName: acme.other\nModule-Version: 1.0\n",
        )])
        .unwrap();

        let mut artifact = ManagedArtifact::named("acme.core", "1.0");
        let err = reconcile(&JsonDescriptorParser, &mut artifact, archive).unwrap_err();
        match err {
            Error::IdentityMismatch {
                found,
                source_name,
                expected,
                ..
            } => {
                assert_eq!(found, "acme.other");
                assert_eq!(expected, "acme.core");
                assert!(source_name.contains("MANIFEST.MF"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_reconcile_requires_name_and_version() {
        let archive = write_archive(&[entry("payload.txt", "x")]).unwrap();
        let mut artifact = ManagedArtifact::new();
        assert!(matches!(
            reconcile(&JsonDescriptorParser, &mut artifact, archive),
            Err(Error::MissingIdentity(field)) if field == "symbolic name"
        ));

        let archive = write_archive(&[entry("payload.txt", "x")]).unwrap();
        let mut artifact = ManagedArtifact::new();
        artifact.symbolic_name = Some("acme".to_string());
        assert!(matches!(
            reconcile(&JsonDescriptorParser, &mut artifact, archive),
            Err(Error::MissingIdentity(field)) if field == "version"
        ));
    }

    #[test]
    fn test_complete_manifest_is_left_alone() {
        let archive = write_archive(&[
            entry("payload.txt", "x"),
            entry(
                manifest::MANIFEST_PATH,
                "Manifest-Version: 1.0\nModule-SymbolicName: acme\nModule-Version: 1.0\n",
            ),
        ])
        .unwrap();
        let original = archive.path().to_path_buf();

        let mut artifact = ManagedArtifact::new();
        let reconciled = reconcile(&JsonDescriptorParser, &mut artifact, archive).unwrap();
        assert_eq!(reconciled.file.path(), original.as_path());
    }
}
