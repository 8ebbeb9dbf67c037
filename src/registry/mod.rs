// src/registry/mod.rs

//! Module registry abstraction
//!
//! The registry is where module archives actually live once installed. It
//! provides install/update/uninstall/start primitives and lookups, each
//! internally consistent but with no cross-call transactions; the installer
//! layers its own rollback on top. Two implementations ship with the crate:
//! an in-process `MemoryRegistry` and a persistent `DirectoryRegistry`.

pub mod directory;
pub mod memory;

pub use directory::DirectoryRegistry;
pub use memory::MemoryRegistry;

use crate::archive::{manifest, read_entries_from_bytes, Manifest};
use crate::error::{Error, Result};
use crate::version::{equal_as_module_versions, ModuleVersion};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Registry-assigned module identifier
pub type ModuleHandle = u64;

/// Lifecycle state of a registered module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Installed,
    Active,
}

impl ModuleState {
    pub fn as_str(&self) -> &str {
        match self {
            ModuleState::Installed => "installed",
            ModuleState::Active => "active",
        }
    }
}

/// What the registry knows about one installed module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredModule {
    pub handle: ModuleHandle,
    pub location: String,
    pub symbolic_name: String,
    pub version: Option<String>,
    pub state: ModuleState,
}

impl RegisteredModule {
    /// Whether this module carries the given identity
    pub fn matches(&self, name: &str, version: &ModuleVersion) -> bool {
        self.symbolic_name == name
            && self
                .version
                .as_deref()
                .is_some_and(|v| equal_as_module_versions(v, &version.to_string()))
    }
}

/// Registry primitives consumed by the installer
pub trait ModuleRegistry: Send + Sync {
    /// Install archive bytes under a location key unique within the registry
    fn install_by_location(&self, location: &str, bytes: &mut dyn Read) -> Result<ModuleHandle>;

    /// Replace the bytes of an installed module, keeping its handle and location
    fn update_in_place(&self, handle: ModuleHandle, bytes: &mut dyn Read) -> Result<()>;

    /// Remove a module from the registry
    fn uninstall(&self, handle: ModuleHandle) -> Result<()>;

    /// Activate an installed module
    fn start(&self, handle: ModuleHandle) -> Result<()>;

    /// Current metadata for a handle
    fn describe(&self, handle: ModuleHandle) -> Option<RegisteredModule>;

    /// Archive bytes currently held for a handle
    fn read_archive(&self, handle: ModuleHandle) -> Result<Vec<u8>>;

    fn find_by_location(&self, location: &str) -> Option<RegisteredModule>;

    /// All modules carrying the given identity, in handle order
    fn find_by_identity(&self, name: &str, version: &ModuleVersion) -> Vec<RegisteredModule>;

    fn list(&self) -> Vec<RegisteredModule>;
}

/// Read the identity a registry records for archive bytes
///
/// Registries key modules by the manifest's symbolic name and version; an
/// archive without a symbolic name cannot be registered.
pub(crate) fn identify(bytes: &[u8]) -> Result<(String, Option<String>)> {
    let entries = read_entries_from_bytes(bytes)
        .map_err(|e| Error::Registry(format!("Unreadable module archive: {}", e)))?;

    let manifest = match entries
        .iter()
        .find(|entry| entry.name == manifest::MANIFEST_PATH)
    {
        Some(entry) => Manifest::parse(&entry.content)
            .map_err(|e| Error::Registry(format!("Unreadable module manifest: {}", e)))?,
        None => Manifest::default(),
    };

    let name = manifest
        .symbolic_name()
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| {
            Error::Registry(format!(
                "Archive has no {} in {}",
                manifest::SYMBOLIC_NAME,
                manifest::MANIFEST_PATH
            ))
        })?
        .to_string();

    Ok((name, manifest.version().map(|v| v.to_string())))
}
