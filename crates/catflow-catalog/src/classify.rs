use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use catflow_types::LogStream;

use crate::catalog::SignatureCatalog;

/// Set of signature names found in one inspection of a job's logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassifiedErrors(BTreeSet<String>);

impl ClassifiedErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>) -> bool {
        self.0.insert(name.into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    /// True when any of `names` was found.
    pub fn contains_any(&self, names: &[&str]) -> bool {
        names.iter().any(|n| self.0.contains(*n))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for ClassifiedErrors {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// First line and pattern that triggered a signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureMatch {
    pub signature: String,
    pub source: LogStream,
    pub pattern: String,
    /// 1-based line number within the source stream.
    pub line: usize,
}

/// Classify a job's logs against `catalog`.
///
/// Every trimmed line of a stream is tested against every signature bound to
/// that stream. Nothing is pruned after a first hit, so the result is the full
/// set regardless of line order.
pub fn classify(stdout: &str, stderr: &str, catalog: &SignatureCatalog) -> ClassifiedErrors {
    classify_detailed(stdout, stderr, catalog)
        .into_keys()
        .collect()
}

/// Like [`classify`], but also reports where each signature first matched.
pub fn classify_detailed(
    stdout: &str,
    stderr: &str,
    catalog: &SignatureCatalog,
) -> BTreeMap<String, SignatureMatch> {
    let mut found = BTreeMap::new();
    scan(stdout, LogStream::Stdout, catalog, &mut found);
    scan(stderr, LogStream::Stderr, catalog, &mut found);
    tracing::debug!(
        catalog = catalog.version(),
        matched = found.len(),
        "Classified job logs"
    );
    found
}

fn scan(
    text: &str,
    stream: LogStream,
    catalog: &SignatureCatalog,
    found: &mut BTreeMap<String, SignatureMatch>,
) {
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        for sig in catalog.for_stream(stream) {
            if found.contains_key(&sig.name) {
                continue;
            }
            if let Some(pattern) = sig.match_line(line) {
                found.insert(
                    sig.name.clone(),
                    SignatureMatch {
                        signature: sig.name.clone(),
                        source: stream,
                        pattern: pattern.to_string(),
                        line: idx + 1,
                    },
                );
            }
        }
    }
}
