// src/registry/directory.rs

//! Filesystem-backed module registry
//!
//! Each module lives in its own directory:
//!
//! ```text
//! <root>/modules/<handle>/archive.tar
//! <root>/modules/<handle>/module.json
//! ```
//!
//! `module.json` holds the registered metadata. Both files are written to a
//! temporary file in the same directory and persisted over the target, so a
//! crash never leaves a half-written archive behind. The index is rebuilt by
//! scanning `modules/` when the registry is opened.

use super::{identify, ModuleHandle, ModuleRegistry, ModuleState, RegisteredModule};
use crate::error::{Error, Result};
use crate::version::ModuleVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

const MODULES_DIR: &str = "modules";
const ARCHIVE_FILE: &str = "archive.tar";
const METADATA_FILE: &str = "module.json";

/// On-disk metadata for one module
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModuleMetadata {
    #[serde(flatten)]
    module: RegisteredModule,
    installed_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Registry persisting modules under a root directory
pub struct DirectoryRegistry {
    root: PathBuf,
    index: Mutex<BTreeMap<ModuleHandle, ModuleMetadata>>,
}

impl DirectoryRegistry {
    /// Open (creating if needed) a registry rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let modules = root.join(MODULES_DIR);
        fs::create_dir_all(&modules)?;

        let mut index = BTreeMap::new();
        for entry in fs::read_dir(&modules)? {
            let entry = entry?;
            let Some(handle) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<ModuleHandle>().ok())
            else {
                continue;
            };

            let metadata_path = entry.path().join(METADATA_FILE);
            match fs::read(&metadata_path)
                .map_err(Error::from)
                .and_then(|bytes| serde_json::from_slice::<ModuleMetadata>(&bytes).map_err(Error::from))
            {
                Ok(metadata) => {
                    index.insert(handle, metadata);
                }
                Err(e) => warn!(
                    "Skipping unreadable module metadata {}: {}",
                    metadata_path.display(),
                    e
                ),
            }
        }

        info!(
            "Opened module registry at {} ({} modules)",
            root.display(),
            index.len()
        );

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn module_dir(&self, handle: ModuleHandle) -> PathBuf {
        self.root.join(MODULES_DIR).join(handle.to_string())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<ModuleHandle, ModuleMetadata>>> {
        self.index
            .lock()
            .map_err(|_| Error::Registry("registry index lock poisoned".to_string()))
    }

    /// Atomically replace `target` with `content`
    fn write_atomic(dir: &Path, target: &str, content: &[u8]) -> Result<()> {
        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(content)?;
        temp.as_file().sync_all()?;
        temp.persist(dir.join(target)).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn write_metadata(&self, metadata: &ModuleMetadata) -> Result<()> {
        let dir = self.module_dir(metadata.module.handle);
        let json = serde_json::to_vec_pretty(metadata)?;
        Self::write_atomic(&dir, METADATA_FILE, &json)
    }
}

impl ModuleRegistry for DirectoryRegistry {
    fn install_by_location(&self, location: &str, bytes: &mut dyn Read) -> Result<ModuleHandle> {
        let mut data = Vec::new();
        bytes.read_to_end(&mut data)?;
        let (symbolic_name, version) = identify(&data)?;

        let mut index = self.lock()?;
        if index.values().any(|m| m.module.location == location) {
            return Err(Error::Registry(format!(
                "Location {} already in use",
                location
            )));
        }
        if index
            .values()
            .any(|m| m.module.symbolic_name == symbolic_name && m.module.version == version)
        {
            return Err(Error::Registry(format!(
                "Module {}:{} already installed",
                symbolic_name,
                version.as_deref().unwrap_or("-")
            )));
        }

        let handle = index.keys().next_back().copied().unwrap_or(0) + 1;
        let dir = self.module_dir(handle);
        fs::create_dir_all(&dir)?;

        let now = Utc::now();
        let metadata = ModuleMetadata {
            module: RegisteredModule {
                handle,
                location: location.to_string(),
                symbolic_name,
                version,
                state: ModuleState::Installed,
            },
            installed_at: now,
            updated_at: now,
        };

        let written = Self::write_atomic(&dir, ARCHIVE_FILE, &data)
            .and_then(|_| self.write_metadata(&metadata));
        if let Err(e) = written {
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }

        index.insert(handle, metadata);
        debug!("Stored module {} at {}", handle, dir.display());
        Ok(handle)
    }

    fn update_in_place(&self, handle: ModuleHandle, bytes: &mut dyn Read) -> Result<()> {
        let mut data = Vec::new();
        bytes.read_to_end(&mut data)?;
        let (symbolic_name, version) = identify(&data)?;

        let mut index = self.lock()?;
        let mut metadata = index
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::Registry(format!("No module with handle {}", handle)))?;

        metadata.module.symbolic_name = symbolic_name;
        metadata.module.version = version;
        metadata.updated_at = Utc::now();

        Self::write_atomic(&self.module_dir(handle), ARCHIVE_FILE, &data)?;
        self.write_metadata(&metadata)?;
        index.insert(handle, metadata);

        debug!("Updated module {} in place", handle);
        Ok(())
    }

    fn uninstall(&self, handle: ModuleHandle) -> Result<()> {
        let mut index = self.lock()?;
        if index.remove(&handle).is_none() {
            return Err(Error::Registry(format!("No module with handle {}", handle)));
        }
        fs::remove_dir_all(self.module_dir(handle))?;
        debug!("Removed module {}", handle);
        Ok(())
    }

    fn start(&self, handle: ModuleHandle) -> Result<()> {
        let mut index = self.lock()?;
        let mut metadata = index
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::Registry(format!("No module with handle {}", handle)))?;

        metadata.module.state = ModuleState::Active;
        metadata.updated_at = Utc::now();
        self.write_metadata(&metadata)?;
        index.insert(handle, metadata);
        Ok(())
    }

    fn describe(&self, handle: ModuleHandle) -> Option<RegisteredModule> {
        let index = self.lock().ok()?;
        index.get(&handle).map(|m| m.module.clone())
    }

    fn read_archive(&self, handle: ModuleHandle) -> Result<Vec<u8>> {
        if self.describe(handle).is_none() {
            return Err(Error::Registry(format!("No module with handle {}", handle)));
        }
        Ok(fs::read(self.module_dir(handle).join(ARCHIVE_FILE))?)
    }

    fn find_by_location(&self, location: &str) -> Option<RegisteredModule> {
        let index = self.lock().ok()?;
        index
            .values()
            .find(|m| m.module.location == location)
            .map(|m| m.module.clone())
    }

    fn find_by_identity(&self, name: &str, version: &ModuleVersion) -> Vec<RegisteredModule> {
        match self.lock() {
            Ok(index) => index
                .values()
                .filter(|m| m.module.matches(name, version))
                .map(|m| m.module.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn list(&self) -> Vec<RegisteredModule> {
        match self.lock() {
            Ok(index) => index.values().map(|m| m.module.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::module_bytes;
    use tempfile::TempDir;

    #[test]
    fn test_install_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let bytes = module_bytes("acme.core", "1.0.0", "one");

        let handle = {
            let registry = DirectoryRegistry::open(dir.path()).unwrap();
            let handle = registry
                .install_by_location("managed:acme.core/1.0.0", &mut bytes.as_slice())
                .unwrap();
            registry.start(handle).unwrap();
            handle
        };

        let registry = DirectoryRegistry::open(dir.path()).unwrap();
        let module = registry.describe(handle).unwrap();
        assert_eq!(module.symbolic_name, "acme.core");
        assert_eq!(module.state, ModuleState::Active);
        assert_eq!(registry.read_archive(handle).unwrap(), bytes);
        assert!(dir
            .path()
            .join("modules")
            .join(handle.to_string())
            .join("module.json")
            .exists());
    }

    #[test]
    fn test_update_and_uninstall() {
        let dir = TempDir::new().unwrap();
        let registry = DirectoryRegistry::open(dir.path()).unwrap();
        let handle = registry
            .install_by_location("loc", &mut module_bytes("acme.core", "1.0.0", "one").as_slice())
            .unwrap();

        let updated = module_bytes("acme.core", "1.0.0", "two");
        registry
            .update_in_place(handle, &mut updated.as_slice())
            .unwrap();
        assert_eq!(registry.read_archive(handle).unwrap(), updated);

        registry.uninstall(handle).unwrap();
        assert!(registry.list().is_empty());
        assert!(!dir.path().join("modules").join(handle.to_string()).exists());
    }

    #[test]
    fn test_handles_are_not_reused_while_present() {
        let dir = TempDir::new().unwrap();
        let registry = DirectoryRegistry::open(dir.path()).unwrap();
        let a = registry
            .install_by_location("a", &mut module_bytes("acme.a", "1.0", "a").as_slice())
            .unwrap();
        let b = registry
            .install_by_location("b", &mut module_bytes("acme.b", "1.0", "b").as_slice())
            .unwrap();
        assert_ne!(a, b);
        assert!(registry
            .install_by_location("b", &mut module_bytes("acme.c", "1.0", "c").as_slice())
            .is_err());
    }
}
