// src/items.rs

//! Declared items
//!
//! A module's descriptor may declare named, versioned items that become
//! visible once the module activates. Items are keyed by name and
//! normalized version; each key is attributed to exactly one owning module
//! at a time. Installing a module whose item collides with another module's
//! item shadows it, and the displaced item must be restorable on rollback.

use crate::error::{Error, Result};
use crate::version::{ModuleVersion, VersionedName};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// A named, versioned unit contributed by a module
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredItem {
    pub name: String,
    pub version: String,
    pub kind: Option<String>,
    pub definition: serde_json::Value,
    /// Module that declared the item
    pub artifact: VersionedName,
}

impl DeclaredItem {
    /// Store key: name plus normalized version
    pub fn key(&self) -> (String, String) {
        item_key(&self.name, &self.version)
    }

    /// Check the item is usable: non-blank name and parseable version
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidItem(format!(
                "item in {} has a blank name",
                self.artifact
            )));
        }
        ModuleVersion::parse(&self.version).map_err(|_| {
            Error::InvalidItem(format!(
                "item {} in {} has invalid version '{}'",
                self.name, self.artifact, self.version
            ))
        })?;
        Ok(())
    }
}

impl fmt::Display for DeclaredItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

fn item_key(name: &str, version: &str) -> (String, String) {
    let version = ModuleVersion::parse(version)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| version.trim().to_string());
    (name.to_string(), version)
}

/// Where declared items are published once a module activates
pub trait ItemStore: Send + Sync {
    /// Items currently attributed to a module
    fn items_of(&self, artifact: &VersionedName) -> Vec<DeclaredItem>;

    /// Remove the given items, if still present
    fn remove(&self, items: &[DeclaredItem]) -> Result<()>;

    /// Restore a previously removed or displaced item
    ///
    /// With `is_replacement` the item overwrites whatever currently occupies
    /// its key; otherwise an occupied key owned by another module is a
    /// conflict.
    fn add_back(&self, item: DeclaredItem, is_replacement: bool) -> Result<()>;

    /// Publish an item, returning the item it displaced from another module
    ///
    /// Displacing another module's item requires `force`.
    fn insert(&self, item: DeclaredItem, force: bool) -> Result<Option<DeclaredItem>>;

    /// Every published item
    fn all(&self) -> Vec<DeclaredItem>;
}

/// Item store held in memory
#[derive(Default)]
pub struct MemoryItemStore {
    items: Mutex<BTreeMap<(String, String), DeclaredItem>>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<(String, String), DeclaredItem>>> {
        self.items
            .lock()
            .map_err(|_| Error::Activation("item store lock poisoned".to_string()))
    }

    /// Look up the item published under a name and version
    pub fn get(&self, name: &str, version: &str) -> Option<DeclaredItem> {
        self.lock().ok()?.get(&item_key(name, version)).cloned()
    }
}

impl ItemStore for MemoryItemStore {
    fn items_of(&self, artifact: &VersionedName) -> Vec<DeclaredItem> {
        match self.lock() {
            Ok(items) => items
                .values()
                .filter(|item| &item.artifact == artifact)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn remove(&self, to_remove: &[DeclaredItem]) -> Result<()> {
        let mut items = self.lock()?;
        for item in to_remove {
            let key = item.key();
            if items.get(&key).is_some_and(|current| current.artifact == item.artifact) {
                items.remove(&key);
                debug!("Removed item {} of {}", item, item.artifact);
            }
        }
        Ok(())
    }

    fn add_back(&self, item: DeclaredItem, is_replacement: bool) -> Result<()> {
        let mut items = self.lock()?;
        let key = item.key();
        if let Some(current) = items.get(&key) {
            if !is_replacement && current.artifact != item.artifact {
                return Err(Error::ItemConflict(format!(
                    "{} is already provided by {}",
                    item, current.artifact
                )));
            }
        }
        debug!("Restored item {} of {}", item, item.artifact);
        items.insert(key, item);
        Ok(())
    }

    fn insert(&self, item: DeclaredItem, force: bool) -> Result<Option<DeclaredItem>> {
        let mut items = self.lock()?;
        let key = item.key();

        let displaced = match items.get(&key) {
            Some(current) if current.artifact != item.artifact => {
                if !force {
                    return Err(Error::ItemConflict(format!(
                        "{} from {} is already provided by {}",
                        item, item.artifact, current.artifact
                    )));
                }
                Some(current.clone())
            }
            _ => None,
        };

        items.insert(key, item);
        Ok(displaced)
    }

    fn all(&self) -> Vec<DeclaredItem> {
        match self.lock() {
            Ok(items) => items.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, version: &str, artifact: &str) -> DeclaredItem {
        DeclaredItem {
            name: name.to_string(),
            version: version.to_string(),
            kind: None,
            definition: serde_json::json!({}),
            artifact: VersionedName::parse(artifact, "1.0").unwrap(),
        }
    }

    #[test]
    fn test_insert_and_items_of() {
        let store = MemoryItemStore::new();
        store.insert(item("i1", "1.0", "acme.a"), false).unwrap();
        store.insert(item("i2", "1.0", "acme.a"), false).unwrap();
        store.insert(item("i3", "1.0", "acme.b"), false).unwrap();

        let owner = VersionedName::parse("acme.a", "1.0").unwrap();
        let names: Vec<_> = store.items_of(&owner).into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["i1", "i2"]);
    }

    #[test]
    fn test_shadowing_requires_force_and_reports_displaced() {
        let store = MemoryItemStore::new();
        store.insert(item("i3", "1.0", "acme.c"), false).unwrap();

        let result = store.insert(item("i3", "1.0.0", "acme.b"), false);
        assert!(matches!(result, Err(Error::ItemConflict(_))));

        let displaced = store.insert(item("i3", "1.0.0", "acme.b"), true).unwrap();
        assert_eq!(displaced.unwrap().artifact.name, "acme.c");
        assert_eq!(store.get("i3", "1.0").unwrap().artifact.name, "acme.b");
    }

    #[test]
    fn test_add_back_restores_attribution() {
        let store = MemoryItemStore::new();
        let original = item("i3", "1.0", "acme.c");
        store.insert(original.clone(), false).unwrap();
        let shadowing = item("i3", "1.0", "acme.b");
        store.insert(shadowing.clone(), true).unwrap();

        assert!(store.add_back(original.clone(), false).is_err());

        store.remove(&[shadowing]).unwrap();
        store.add_back(original, true).unwrap();
        assert_eq!(store.get("i3", "1.0").unwrap().artifact.name, "acme.c");
    }

    #[test]
    fn test_remove_ignores_items_owned_elsewhere() {
        let store = MemoryItemStore::new();
        store.insert(item("i1", "1.0", "acme.a"), false).unwrap();
        store.remove(&[item("i1", "1.0", "acme.b")]).unwrap();
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn test_validate() {
        assert!(item("i1", "1.0", "acme.a").validate().is_ok());
        assert!(matches!(
            item(" ", "1.0", "acme.a").validate(),
            Err(Error::InvalidItem(_))
        ));
        assert!(matches!(
            item("i1", "", "acme.a").validate(),
            Err(Error::InvalidItem(_))
        ));
    }
}
