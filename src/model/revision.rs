use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{canonical_bytes, generate_id, ConfigurationDocument, Fingerprint, Id};

#[derive(Debug, thiserror::Error)]
pub enum RevisionError {
    #[error("failed to compress revision payload: {0}")]
    Io(#[from] std::io::Error),
    #[error("revision payload is not a valid configuration: {0}")]
    Decode(#[from] serde_json::Error),
}

/// An immutable, persisted version of the configuration document
///
/// The payload is the gzip-compressed canonical JSON of the document, so the
/// fingerprint can be recomputed from `data` alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Revision {
    pub id: Id,
    /// Content fingerprint of the stored document
    pub fingerprint: Fingerprint,
    /// Fingerprint this revision replaced (None for the initial revision)
    pub parent_fingerprint: Option<Fingerprint>,
    pub author: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,

    /// Compressed canonical JSON
    #[serde(skip_serializing)]
    pub data: Vec<u8>,
    /// Uncompressed size for monitoring
    pub data_size: i64,
    pub node_count: i32,
}

/// Revision metadata without the payload, for history listings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RevisionSummary {
    pub fingerprint: Fingerprint,
    pub parent_fingerprint: Option<Fingerprint>,
    pub author: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub node_count: i32,
}

impl Revision {
    pub fn new(
        document: &ConfigurationDocument,
        parent_fingerprint: Option<Fingerprint>,
        author: impl Into<String>,
        message: Option<String>,
    ) -> Result<Self, RevisionError> {
        let serialized = canonical_bytes(document);
        let data = Self::compress_data(&serialized)?;

        Ok(Self {
            id: generate_id(),
            fingerprint: Fingerprint::of_bytes(&serialized),
            parent_fingerprint,
            author: author.into(),
            message,
            created_at: Utc::now(),
            data,
            data_size: serialized.len() as i64,
            node_count: document.node_count() as i32,
        })
    }

    /// First revision of a freshly initialized store
    pub fn initial(document: &ConfigurationDocument) -> Result<Self, RevisionError> {
        Self::new(
            document,
            None,
            "system",
            Some("Initial configuration".to_string()),
        )
    }

    /// Decompress and deserialize the stored document
    pub fn document(&self) -> Result<ConfigurationDocument, RevisionError> {
        let bytes = Self::decompress_data(&self.data)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn summary(&self) -> RevisionSummary {
        RevisionSummary {
            fingerprint: self.fingerprint.clone(),
            parent_fingerprint: self.parent_fingerprint.clone(),
            author: self.author.clone(),
            message: self.message.clone(),
            created_at: self.created_at,
            node_count: self.node_count,
        }
    }

    fn compress_data(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decompress_data(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        use flate2::read::GzDecoder;
        use std::io::Read;

        // Gzip magic bytes; anything else is stored uncompressed
        if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
            let mut decoder = GzDecoder::new(data);
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed)?;
            Ok(decompressed)
        } else {
            Ok(data.to_vec())
        }
    }
}
