use serde::Serialize;

use crate::model::{
    ConfigurationDocument, Fingerprint, Locator, Node, NodeKind, Revision, RevisionError,
    RevisionSummary,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("configuration storage unavailable: {0}")]
    Unavailable(String),
    #[error("revision {fingerprint} is corrupt: {reason}")]
    CorruptRevision {
        fingerprint: Fingerprint,
        reason: String,
    },
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Unavailable(format!("{:#}", err))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<RevisionError> for StoreError {
    fn from(err: RevisionError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Author and message recorded with a persisted revision
#[derive(Debug, Clone, Default)]
pub struct ChangeMetadata {
    pub author: String,
    pub message: Option<String>,
}

impl ChangeMetadata {
    pub fn new(author: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    Committed { fingerprint: Fingerprint },
    /// The stored configuration no longer matches the expected base
    Stale { current: Fingerprint },
}

/// Snapshot handed to an editor: the document, its fingerprint and the node being edited
#[derive(Debug, Clone, Serialize)]
pub struct EditingSnapshot {
    pub document: ConfigurationDocument,
    pub fingerprint: Fingerprint,
    pub locator: Locator,
    pub target: Option<Node>,
    /// Group owning the edited pipeline, if any
    pub group: Option<String>,
}

impl EditingSnapshot {
    pub fn new(document: ConfigurationDocument, fingerprint: Fingerprint, locator: &Locator) -> Self {
        let handle = locator.resolve(&document).ok();
        let target = handle.as_ref().and_then(|h| h.get(&document).cloned());
        let group = handle
            .as_ref()
            .and_then(|h| h.path().keys().first().cloned())
            .filter(|key| key.kind == NodeKind::Group)
            .and_then(|key| document.group(&key.key).and_then(|g| g.name()).map(str::to_string));

        Self {
            document,
            fingerprint,
            locator: locator.clone(),
            target,
            group,
        }
    }
}

/// Versioned storage of the single configuration document
///
/// `persist` is a compare-and-swap: it commits only when the stored
/// fingerprint still equals `expected_base`.
#[async_trait::async_trait]
pub trait ConfigStore: Send + Sync {
    async fn current(&self) -> Result<(ConfigurationDocument, Fingerprint), StoreError>;

    async fn persist(
        &self,
        document: &ConfigurationDocument,
        expected_base: &Fingerprint,
        metadata: ChangeMetadata,
    ) -> Result<PersistOutcome, StoreError>;

    async fn revision_at(&self, fingerprint: &Fingerprint) -> Result<Option<Revision>, StoreError>;

    /// Newest first
    async fn history(&self, limit: usize) -> Result<Vec<RevisionSummary>, StoreError>;

    async fn load_for_editing(&self, locator: &Locator) -> Result<EditingSnapshot, StoreError> {
        let (document, fingerprint) = self.current().await?;
        Ok(EditingSnapshot::new(document, fingerprint, locator))
    }

    /// Document stored under a fingerprint
    async fn document_at(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ConfigurationDocument>, StoreError> {
        match self.revision_at(fingerprint).await? {
            Some(revision) => revision
                .document()
                .map(Some)
                .map_err(|e| StoreError::CorruptRevision {
                    fingerprint: fingerprint.clone(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn fingerprint_matches(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let (_, current) = self.current().await?;
        Ok(&current == fingerprint)
    }
}
