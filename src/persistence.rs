// src/persistence.rs

//! Persistence hooks for managed artifacts
//!
//! Whenever the installer starts, changes or stops managing an artifact it
//! notifies a `PersistenceListener`, but only for artifacts the
//! `PersistencePolicy` says need persisting.

use crate::error::{Error, Result};
use crate::installer::ManagedArtifact;
use regex::Regex;
use tracing::info;

/// Receives notifications about artifacts that need persisting
pub trait PersistenceListener: Send + Sync {
    fn on_managed(&self, artifact: &ManagedArtifact);
    fn on_changed(&self, artifact: &ManagedArtifact);
    fn on_unmanaged(&self, artifact: &ManagedArtifact);
}

/// Listener that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListener;

impl PersistenceListener for LoggingListener {
    fn on_managed(&self, artifact: &ManagedArtifact) {
        info!("Persisting newly managed artifact {}", artifact);
    }

    fn on_changed(&self, artifact: &ManagedArtifact) {
        info!("Persisting changed artifact {}", artifact);
    }

    fn on_unmanaged(&self, artifact: &ManagedArtifact) {
        info!("Dropping persisted artifact {}", artifact);
    }
}

/// Decides which symbolic names need persisting
///
/// A name matching the allow pattern is always persisted. Otherwise a name
/// matching the deny pattern is not. Everything else is persisted. Patterns
/// must match the whole name.
#[derive(Debug, Clone, Default)]
pub struct PersistencePolicy {
    allow: Option<Regex>,
    deny: Option<Regex>,
}

impl PersistencePolicy {
    /// Build a policy from optional allow and deny patterns
    pub fn new(allow: Option<&str>, deny: Option<&str>) -> Result<Self> {
        Ok(Self {
            allow: allow.map(compile_full_match).transpose()?,
            deny: deny.map(compile_full_match).transpose()?,
        })
    }

    /// Whether an artifact with this symbolic name should be persisted
    pub fn should_persist(&self, symbolic_name: &str) -> bool {
        if self.allow.as_ref().is_some_and(|re| re.is_match(symbolic_name)) {
            return true;
        }
        if self.deny.as_ref().is_some_and(|re| re.is_match(symbolic_name)) {
            return false;
        }
        true
    }
}

fn compile_full_match(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| Error::Config(format!("Invalid persistence pattern '{}': {}", pattern, e)))
}
