// src/registry/memory.rs

//! In-process module registry

use super::{identify, ModuleHandle, ModuleRegistry, ModuleState, RegisteredModule};
use crate::error::{Error, Result};
use crate::version::ModuleVersion;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

struct Slot {
    module: RegisteredModule,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    next_handle: ModuleHandle,
    slots: BTreeMap<ModuleHandle, Slot>,
}

/// Registry holding module archives in memory
#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Registry("registry lock poisoned".to_string()))
    }
}

impl ModuleRegistry for MemoryRegistry {
    fn install_by_location(&self, location: &str, bytes: &mut dyn Read) -> Result<ModuleHandle> {
        let mut data = Vec::new();
        bytes.read_to_end(&mut data)?;
        let (symbolic_name, version) = identify(&data)?;

        let mut inner = self.lock()?;
        if let Some(existing) = inner.slots.values().find(|s| s.module.location == location) {
            return Err(Error::Registry(format!(
                "Location {} already in use by module {}",
                location, existing.module.handle
            )));
        }
        if let Some(existing) = inner.slots.values().find(|s| {
            s.module.symbolic_name == symbolic_name && s.module.version == version
        }) {
            return Err(Error::Registry(format!(
                "Module {}:{} already installed from {}",
                symbolic_name,
                version.as_deref().unwrap_or("-"),
                existing.module.location
            )));
        }

        inner.next_handle += 1;
        let handle = inner.next_handle;
        inner.slots.insert(
            handle,
            Slot {
                module: RegisteredModule {
                    handle,
                    location: location.to_string(),
                    symbolic_name,
                    version,
                    state: ModuleState::Installed,
                },
                bytes: data,
            },
        );

        debug!("Registered module {} at {}", handle, location);
        Ok(handle)
    }

    fn update_in_place(&self, handle: ModuleHandle, bytes: &mut dyn Read) -> Result<()> {
        let mut data = Vec::new();
        bytes.read_to_end(&mut data)?;
        let (symbolic_name, version) = identify(&data)?;

        let mut inner = self.lock()?;
        let slot = inner
            .slots
            .get_mut(&handle)
            .ok_or_else(|| Error::Registry(format!("No module with handle {}", handle)))?;

        slot.module.symbolic_name = symbolic_name;
        slot.module.version = version;
        slot.bytes = data;

        debug!("Updated module {} in place", handle);
        Ok(())
    }

    fn uninstall(&self, handle: ModuleHandle) -> Result<()> {
        let mut inner = self.lock()?;
        inner
            .slots
            .remove(&handle)
            .ok_or_else(|| Error::Registry(format!("No module with handle {}", handle)))?;
        debug!("Uninstalled module {}", handle);
        Ok(())
    }

    fn start(&self, handle: ModuleHandle) -> Result<()> {
        let mut inner = self.lock()?;
        let slot = inner
            .slots
            .get_mut(&handle)
            .ok_or_else(|| Error::Registry(format!("No module with handle {}", handle)))?;
        slot.module.state = ModuleState::Active;
        Ok(())
    }

    fn describe(&self, handle: ModuleHandle) -> Option<RegisteredModule> {
        let inner = self.lock().ok()?;
        inner.slots.get(&handle).map(|slot| slot.module.clone())
    }

    fn read_archive(&self, handle: ModuleHandle) -> Result<Vec<u8>> {
        let inner = self.lock()?;
        inner
            .slots
            .get(&handle)
            .map(|slot| slot.bytes.clone())
            .ok_or_else(|| Error::Registry(format!("No module with handle {}", handle)))
    }

    fn find_by_location(&self, location: &str) -> Option<RegisteredModule> {
        let inner = self.lock().ok()?;
        inner
            .slots
            .values()
            .find(|slot| slot.module.location == location)
            .map(|slot| slot.module.clone())
    }

    fn find_by_identity(&self, name: &str, version: &ModuleVersion) -> Vec<RegisteredModule> {
        match self.lock() {
            Ok(inner) => inner
                .slots
                .values()
                .filter(|slot| slot.module.matches(name, version))
                .map(|slot| slot.module.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn list(&self) -> Vec<RegisteredModule> {
        match self.lock() {
            Ok(inner) => inner.slots.values().map(|slot| slot.module.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::module_bytes;

    #[test]
    fn test_install_and_lookup() {
        let registry = MemoryRegistry::new();
        let bytes = module_bytes("acme.core", "1.0.0", "one");

        let handle = registry
            .install_by_location("managed:acme.core/1.0.0", &mut bytes.as_slice())
            .unwrap();

        let module = registry.describe(handle).unwrap();
        assert_eq!(module.symbolic_name, "acme.core");
        assert_eq!(module.state, ModuleState::Installed);

        assert!(registry.find_by_location("managed:acme.core/1.0.0").is_some());
        let version = ModuleVersion::parse("1.0").unwrap();
        assert_eq!(registry.find_by_identity("acme.core", &version).len(), 1);
        assert_eq!(registry.read_archive(handle).unwrap(), bytes);
    }

    #[test]
    fn test_duplicate_location_and_identity_rejected() {
        let registry = MemoryRegistry::new();
        let bytes = module_bytes("acme.core", "1.0.0", "one");
        registry
            .install_by_location("loc-a", &mut bytes.as_slice())
            .unwrap();

        assert!(registry
            .install_by_location("loc-a", &mut module_bytes("acme.other", "1.0.0", "x").as_slice())
            .is_err());
        assert!(registry
            .install_by_location("loc-b", &mut bytes.as_slice())
            .is_err());
    }

    #[test]
    fn test_update_start_uninstall() {
        let registry = MemoryRegistry::new();
        let handle = registry
            .install_by_location("loc", &mut module_bytes("acme.core", "1.0.0", "one").as_slice())
            .unwrap();

        let updated = module_bytes("acme.core", "1.0.0", "two");
        registry
            .update_in_place(handle, &mut updated.as_slice())
            .unwrap();
        assert_eq!(registry.read_archive(handle).unwrap(), updated);

        registry.start(handle).unwrap();
        assert_eq!(registry.describe(handle).unwrap().state, ModuleState::Active);

        registry.uninstall(handle).unwrap();
        assert!(registry.describe(handle).is_none());
        assert!(registry.uninstall(handle).is_err());
    }
}
