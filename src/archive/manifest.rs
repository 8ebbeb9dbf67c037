// src/archive/manifest.rs

//! `META-INF/MANIFEST.MF` parsing and rendering
//!
//! Only the main section is interpreted. Attribute names compare
//! case-insensitively; lines starting with a single space continue the
//! previous value.

use crate::error::{Error, Result};

/// Location of the manifest inside an archive
pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

pub const MANIFEST_VERSION: &str = "Manifest-Version";
pub const SYMBOLIC_NAME: &str = "Module-SymbolicName";
pub const VERSION: &str = "Module-Version";

/// Value written for `Manifest-Version` when the manifest lacks one
pub const MANIFEST_VERSION_VALUE: &str = "1.0";

/// Main-section attributes of a manifest, in file order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    attributes: Vec<(String, String)>,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::InvalidArchive(format!("Manifest is not UTF-8: {}", e)))?;

        let mut attributes: Vec<(String, String)> = Vec::new();
        for raw in text.split('\n') {
            let line = raw.strip_suffix('\r').unwrap_or(raw);

            if line.is_empty() {
                // End of the main section
                break;
            }

            if let Some(continuation) = line.strip_prefix(' ') {
                match attributes.last_mut() {
                    Some((_, value)) => value.push_str(continuation),
                    None => {
                        return Err(Error::InvalidArchive(
                            "Manifest starts with a continuation line".to_string(),
                        ));
                    }
                }
                continue;
            }

            let (key, value) = line.split_once(':').ok_or_else(|| {
                Error::InvalidArchive(format!("Malformed manifest line: '{}'", line))
            })?;
            attributes.push((key.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self { attributes })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing an existing value in place
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .attributes
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some((_, existing)) => *existing = value,
            None => self.attributes.push((key.to_string(), value)),
        }
    }

    pub fn symbolic_name(&self) -> Option<&str> {
        self.get(SYMBOLIC_NAME)
    }

    pub fn version(&self) -> Option<&str> {
        self.get(VERSION)
    }

    /// Render with `Manifest-Version` first, as readers expect
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(version) = self.get(MANIFEST_VERSION) {
            out.push_str(&format!("{}: {}\n", MANIFEST_VERSION, version));
        }
        for (key, value) in &self.attributes {
            if key.eq_ignore_ascii_case(MANIFEST_VERSION) {
                continue;
            }
            out.push_str(&format!("{}: {}\n", key, value));
        }
        out
    }
}
