// src/manager.rs

//! Shared installer context
//!
//! A `ModuleManager` wires together the collaborators every installer run
//! needs: the module registry, the declared item store, the persistence
//! listener and policy, the fetcher, the descriptor parser, the artifact
//! record and the per-identity locks. It is shared between installers
//! through an `Arc`.

use crate::archive::descriptor::{DescriptorParser, JsonDescriptorParser};
use crate::error::{Error, Result};
use crate::fetch::{ResourceFetcher, UrlFetcher};
use crate::installer::{ArchiveInstaller, ManagedArtifact};
use crate::items::{ItemStore, MemoryItemStore};
use crate::persistence::{LoggingListener, PersistenceListener, PersistencePolicy};
use crate::record::{ArtifactRecord, IdentityLocks};
use crate::registry::{DirectoryRegistry, ModuleRegistry};
use crate::version::VersionedName;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Directory under the state directory holding the module registry
const REGISTRY_DIR: &str = "registry";

/// Settings for a manager backed by a state directory
#[derive(Debug, Clone, Default)]
pub struct InstallerConfig {
    pub state_dir: PathBuf,
    /// Names matching this pattern are always persisted
    pub persist_allow: Option<String>,
    /// Names matching this pattern are not persisted unless allowed
    pub persist_deny: Option<String>,
}

impl InstallerConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }
}

pub struct ModuleManager {
    registry: Arc<dyn ModuleRegistry>,
    items: Arc<dyn ItemStore>,
    listener: Arc<dyn PersistenceListener>,
    fetcher: Arc<dyn ResourceFetcher>,
    parser: Arc<dyn DescriptorParser>,
    record: ArtifactRecord,
    locks: IdentityLocks,
    policy: PersistencePolicy,
}

impl ModuleManager {
    /// Manager over the given registry and record, with default collaborators
    pub fn new(registry: Arc<dyn ModuleRegistry>, record: ArtifactRecord) -> Result<Self> {
        Ok(Self {
            registry,
            items: Arc::new(MemoryItemStore::new()),
            listener: Arc::new(LoggingListener),
            fetcher: Arc::new(UrlFetcher::new()?),
            parser: Arc::new(JsonDescriptorParser),
            record,
            locks: IdentityLocks::new(),
            policy: PersistencePolicy::default(),
        })
    }

    /// Manager with a directory registry and record under `config.state_dir`
    pub fn open(config: &InstallerConfig) -> Result<Self> {
        let registry = DirectoryRegistry::open(config.state_dir.join(REGISTRY_DIR))?;
        let record = ArtifactRecord::open(&config.state_dir)?;
        let policy = PersistencePolicy::new(
            config.persist_allow.as_deref(),
            config.persist_deny.as_deref(),
        )?;
        Ok(Self::new(Arc::new(registry), record)?.with_policy(policy))
    }

    pub fn with_items(mut self, items: Arc<dyn ItemStore>) -> Self {
        self.items = items;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn PersistenceListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn DescriptorParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_policy(mut self, policy: PersistencePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &dyn ModuleRegistry {
        self.registry.as_ref()
    }

    pub fn items(&self) -> &dyn ItemStore {
        self.items.as_ref()
    }

    pub fn listener(&self) -> &dyn PersistenceListener {
        self.listener.as_ref()
    }

    pub fn fetcher(&self) -> &dyn ResourceFetcher {
        self.fetcher.as_ref()
    }

    pub fn parser(&self) -> &dyn DescriptorParser {
        self.parser.as_ref()
    }

    pub fn record(&self) -> &ArtifactRecord {
        &self.record
    }

    pub fn locks(&self) -> &IdentityLocks {
        &self.locks
    }

    pub fn policy(&self) -> &PersistencePolicy {
        &self.policy
    }

    /// New installer sharing this manager
    pub fn installer(
        self: &Arc<Self>,
        artifact: ManagedArtifact,
        input: Option<Box<dyn Read + Send>>,
    ) -> ArchiveInstaller {
        ArchiveInstaller::new(Arc::clone(self), artifact, input)
    }

    /// Stop managing an artifact and remove its module and items
    pub fn uninstall(&self, name: &str, version: &str) -> Result<ManagedArtifact> {
        let identity = VersionedName::parse(name, version)?;
        let _guard = self.locks.acquire(&identity.to_string())?;

        let row = self
            .record
            .find_by_identity(&identity.name, &identity.version)?
            .ok_or_else(|| Error::Registry(format!("{} is not a managed artifact", identity)))?;
        let id = row
            .id
            .ok_or_else(|| Error::Config(format!("Recorded artifact {} has no id", identity)))?;

        let items = self.items.items_of(&identity);
        self.items.remove(&items)?;

        match self.registry.find_by_location(&row.location) {
            Some(module) => self.registry.uninstall(module.handle)?,
            None => warn!(
                "Module for {} already missing from registry at {}",
                identity, row.location
            ),
        }

        self.record.remove(id)?;

        let artifact = ManagedArtifact::from_row(&row);
        if row.persistence_needed {
            self.listener.on_unmanaged(&artifact);
        }

        info!("Uninstalled {} ({} item(s) removed)", identity, items.len());
        Ok(artifact)
    }
}
