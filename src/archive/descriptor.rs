// src/archive/descriptor.rs

//! Module descriptor parsing
//!
//! A descriptor declares a module's identity and the items it contributes.
//! Parsing is behind the `DescriptorParser` trait; the default
//! implementation reads a JSON document named `catalog.json` at the root of
//! the archive:
//!
//! ```json
//! {
//!   "name": "acme.web",
//!   "version": "1.0",
//!   "items": [
//!     { "name": "web-server", "kind": "entity", "definition": { "image": "nginx" } }
//!   ]
//! }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default descriptor file name
pub const DESCRIPTOR_FILE: &str = "catalog.json";

/// An item as declared in the descriptor, before attribution to a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDefinition {
    #[serde(alias = "id")]
    pub name: String,

    /// Falls back to the module version when absent
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub definition: serde_json::Value,
}

/// Parsed descriptor content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(default, alias = "symbolicName")]
    pub name: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub items: Vec<ItemDefinition>,
}

/// Turns descriptor bytes into a `Descriptor`
pub trait DescriptorParser: Send + Sync {
    /// Entry name of the descriptor inside an archive
    fn file_name(&self) -> &str {
        DESCRIPTOR_FILE
    }

    /// Parse descriptor bytes
    fn parse(&self, bytes: &[u8]) -> Result<Descriptor>;
}

/// Parser for JSON descriptors
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDescriptorParser;

impl DescriptorParser for JsonDescriptorParser {
    fn parse(&self, bytes: &[u8]) -> Result<Descriptor> {
        serde_json::from_slice(bytes).map_err(|e| {
            Error::InvalidArchive(format!("Error reading {}: {}", DESCRIPTOR_FILE, e))
        })
    }
}
