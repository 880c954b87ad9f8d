use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::model::{ConfigurationDocument, Fingerprint, Revision, RevisionSummary};
use crate::store::traits::{ChangeMetadata, ConfigStore, PersistOutcome, StoreError};

#[derive(Debug)]
struct State {
    document: ConfigurationDocument,
    head: Fingerprint,
    revisions: Vec<Revision>,
    by_fingerprint: HashMap<Fingerprint, usize>,
}

/// Process-local configuration store
///
/// The write lock is held across the fingerprint comparison and the swap,
/// so concurrent persists from the same base commit exactly once.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new(document: ConfigurationDocument) -> Result<Self, StoreError> {
        let mut document = document;
        document.clear_errors();
        let initial = Revision::initial(&document)?;
        let head = initial.fingerprint.clone();

        let mut by_fingerprint = HashMap::new();
        by_fingerprint.insert(head.clone(), 0);

        Ok(Self {
            state: Arc::new(RwLock::new(State {
                document,
                head,
                revisions: vec![initial],
                by_fingerprint,
            })),
        })
    }

    pub fn empty() -> Result<Self, StoreError> {
        Self::new(ConfigurationDocument::new())
    }

    pub async fn revision_count(&self) -> usize {
        self.state.read().await.revisions.len()
    }
}

#[async_trait::async_trait]
impl ConfigStore for InMemoryStore {
    async fn current(&self) -> Result<(ConfigurationDocument, Fingerprint), StoreError> {
        let state = self.state.read().await;
        Ok((state.document.clone(), state.head.clone()))
    }

    async fn persist(
        &self,
        document: &ConfigurationDocument,
        expected_base: &Fingerprint,
        metadata: ChangeMetadata,
    ) -> Result<PersistOutcome, StoreError> {
        let mut state = self.state.write().await;

        if &state.head != expected_base {
            debug!(
                "Rejecting persist based on {}, head is {}",
                expected_base.short(),
                state.head.short()
            );
            return Ok(PersistOutcome::Stale {
                current: state.head.clone(),
            });
        }

        let mut document = document.clone();
        document.clear_errors();
        let fingerprint = Fingerprint::of(&document);
        if fingerprint == state.head {
            return Ok(PersistOutcome::Committed { fingerprint });
        }

        let revision = Revision::new(
            &document,
            Some(state.head.clone()),
            metadata.author,
            metadata.message,
        )?;
        let index = state.revisions.len();
        state.revisions.push(revision);
        state.by_fingerprint.insert(fingerprint.clone(), index);
        state.head = fingerprint.clone();
        state.document = document;

        debug!("Committed revision {} (#{})", fingerprint.short(), index);
        Ok(PersistOutcome::Committed { fingerprint })
    }

    async fn revision_at(&self, fingerprint: &Fingerprint) -> Result<Option<Revision>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .by_fingerprint
            .get(fingerprint)
            .and_then(|&i| state.revisions.get(i))
            .cloned())
    }

    async fn history(&self, limit: usize) -> Result<Vec<RevisionSummary>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .revisions
            .iter()
            .rev()
            .take(limit)
            .map(|r| r.summary())
            .collect())
    }
}
