use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use catflow_types::{CatflowError, LogStream, Result};

use crate::builtin::builtin_signatures;

/// Version tag of the signature table compiled into this crate.
pub const BUILTIN_CATALOG_VERSION: &str = "vasp-2021.1";

/// A named failure mode recognised by literal substrings in one log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSignature {
    pub name: String,
    pub source: LogStream,
    pub patterns: Vec<String>,
}

impl ErrorSignature {
    pub fn new(name: impl Into<String>, source: LogStream, patterns: &[&str]) -> Self {
        Self {
            name: name.into(),
            source,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Return the first pattern contained in `line`, if any.
    pub fn match_line(&self, line: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| line.contains(p.as_str()))
            .map(String::as_str)
    }
}

#[derive(Deserialize)]
struct RawCatalog {
    version: String,
    signatures: Vec<ErrorSignature>,
}

/// An immutable, versioned set of error signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawCatalog")]
pub struct SignatureCatalog {
    version: String,
    signatures: Vec<ErrorSignature>,
}

impl TryFrom<RawCatalog> for SignatureCatalog {
    type Error = CatflowError;

    fn try_from(raw: RawCatalog) -> Result<Self> {
        SignatureCatalog::new(raw.version, raw.signatures)
    }
}

static BUILTIN: OnceLock<SignatureCatalog> = OnceLock::new();

impl SignatureCatalog {
    /// Build a catalog, rejecting empty names, empty or blank patterns, and
    /// duplicate names.
    pub fn new(version: impl Into<String>, signatures: Vec<ErrorSignature>) -> Result<Self> {
        let mut seen = HashSet::new();
        for sig in &signatures {
            if sig.name.trim().is_empty() {
                return Err(CatflowError::CatalogError(
                    "signature with empty name".into(),
                ));
            }
            if sig.patterns.is_empty() || sig.patterns.iter().any(|p| p.trim().is_empty()) {
                return Err(CatflowError::CatalogError(format!(
                    "signature '{}' has an empty pattern list or a blank pattern",
                    sig.name
                )));
            }
            if !seen.insert(sig.name.as_str()) {
                return Err(CatflowError::CatalogError(format!(
                    "duplicate signature '{}'",
                    sig.name
                )));
            }
        }
        Ok(Self {
            version: version.into(),
            signatures,
        })
    }

    /// The VASP catalog compiled into this crate, built once per process.
    pub fn builtin() -> &'static SignatureCatalog {
        BUILTIN.get_or_init(|| SignatureCatalog {
            version: BUILTIN_CATALOG_VERSION.to_string(),
            signatures: builtin_signatures(),
        })
    }

    /// Parse a catalog from its JSON form:
    /// `{"version": "...", "signatures": [{"name", "source", "patterns"}]}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let catalog: SignatureCatalog = serde_json::from_str(json)?;
        tracing::debug!(
            version = %catalog.version,
            signatures = catalog.signatures.len(),
            "Loaded signature catalog"
        );
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn signatures(&self) -> &[ErrorSignature] {
        &self.signatures
    }

    /// Signatures that apply to `stream`, in catalog order.
    pub fn for_stream(&self, stream: LogStream) -> impl Iterator<Item = &ErrorSignature> {
        self.signatures.iter().filter(move |s| s.source == stream)
    }

    pub fn get(&self, name: &str) -> Option<&ErrorSignature> {
        self.signatures.iter().find(|s| s.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.signatures.iter().map(|s| s.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
