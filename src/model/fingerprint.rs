use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::ConfigurationDocument;

/// Content fingerprint of a configuration document (the "md5" carried by edit forms)
///
/// A pure function of document content: validation errors attached to nodes
/// are excluded, everything else is hashed from the canonical JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an existing token, e.g. one submitted by a client
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Compute the fingerprint of a document
    pub fn of(document: &ConfigurationDocument) -> Self {
        Self::of_bytes(&canonical_bytes(document))
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"config:");
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Serialized form used for hashing and revision payloads.
///
/// Attribute maps are `BTreeMap`s, so the JSON is stable across runs.
pub fn canonical_bytes(document: &ConfigurationDocument) -> Vec<u8> {
    let serialize = |doc: &ConfigurationDocument| {
        // A document of strings, maps and vectors always serializes
        serde_json::to_vec(doc).unwrap_or_default()
    };
    if document.has_errors() {
        let mut clean = document.clone();
        clean.clear_errors();
        serialize(&clean)
    } else {
        serialize(document)
    }
}
