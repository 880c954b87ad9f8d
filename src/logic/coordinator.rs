use std::sync::Arc;

use log::{error, info, warn};

use crate::logic::command::{
    Authorization, CommandError, CommandLifecycle, CommandState, UpdateCommand,
};
use crate::logic::diff::DiffEngine;
use crate::logic::outcome::{ConflictReason, UpdateResult};
use crate::logic::resolver::{ConflictResolver, ResolutionOutcome};
use crate::logic::validate::Validator;
use crate::model::{
    ConfigDiff, ConfigurationDocument, Fingerprint, Locator, Revision, RevisionSummary, UserContext,
};
use crate::store::traits::{ChangeMetadata, ConfigStore, EditingSnapshot, PersistOutcome, StoreError};

/// Engine behaviour switches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Re-apply stale commands onto the latest configuration instead of rejecting them
    pub merge_enabled: bool,
    pub history_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            merge_enabled: true,
            history_limit: 50,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ExecutionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Runs update commands against a store: validate, persist and merge on stale bases
pub struct UpdateCoordinator<S: ConfigStore> {
    store: Arc<S>,
    validator: Validator,
    resolver: ConflictResolver,
    settings: EngineSettings,
}

impl<S: ConfigStore> UpdateCoordinator<S> {
    pub fn new(store: Arc<S>, validator: Validator, settings: EngineSettings) -> Self {
        Self {
            store,
            resolver: ConflictResolver::new(validator.clone()),
            validator,
            settings,
        }
    }

    pub fn with_defaults(store: Arc<S>) -> Self {
        Self::new(store, Validator::default(), EngineSettings::default())
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Execute one command for `user`
    pub async fn execute<C: UpdateCommand>(&self, command: &C, user: &UserContext) -> UpdateResult {
        match self.try_execute(command, user).await {
            Ok(result) => result,
            Err(ExecutionError::Store(e)) => {
                error!("[Config Save] Storage failure for {}: {}", command.describe(), e);
                UpdateResult::StorageUnavailable {
                    message: e.to_string(),
                }
            }
            Err(ExecutionError::Command(e)) => {
                error!("[Config Save] Aborted {}: {}", command.describe(), e);
                UpdateResult::StorageUnavailable {
                    message: format!("Update could not be completed: {}", e),
                }
            }
        }
    }

    async fn try_execute<C: UpdateCommand>(
        &self,
        command: &C,
        user: &UserContext,
    ) -> Result<UpdateResult, ExecutionError> {
        let mut lifecycle = CommandLifecycle::new();
        let (current, current_fingerprint) = self.store.current().await?;

        // The editor's view of the configuration, when it is older than the current one
        let (base_document, base) = match command.based_on() {
            Some(based_on) if based_on != &current_fingerprint => {
                match self.store.document_at(based_on).await? {
                    Some(document) => (document, based_on.clone()),
                    None => {
                        lifecycle.advance(CommandState::Rejected)?;
                        warn!(
                            "[Config Save] Unknown base {} for {}",
                            based_on.short(),
                            command.describe()
                        );
                        return Ok(UpdateResult::conflict(
                            ConflictReason::BaseRevisionUnavailable {
                                base: based_on.clone(),
                            },
                            current,
                            current_fingerprint,
                            None,
                        ));
                    }
                }
            }
            _ => (current.clone(), current_fingerprint.clone()),
        };

        if !command.authorize(user, &current) {
            lifecycle.advance(CommandState::Rejected)?;
            info!(
                "[Config Save] {} is not allowed to run {}",
                user.display_name(),
                command.describe()
            );
            return Ok(UpdateResult::Forbidden {
                message: format!(
                    "User '{}' does not have permission to edit {}",
                    user.display_name(),
                    command.locator()
                ),
            });
        }

        let target = match command.locate(&base_document) {
            Ok(target) => target,
            Err(e) => {
                lifecycle.advance(CommandState::Rejected)?;
                return Ok(UpdateResult::NotFound {
                    locator: command.locator().clone(),
                    message: e.to_string(),
                });
            }
        };
        lifecycle.advance(CommandState::Located)?;
        lifecycle.advance(CommandState::Authorized)?;

        let mut attempted = base_document;
        let errors = command.apply(&mut attempted, &target, &self.validator);
        lifecycle.advance(CommandState::Mutated)?;
        if !errors.is_empty() {
            lifecycle.advance(CommandState::Rejected)?;
            info!(
                "[Config Save] {} failed validation with {} error(s)",
                command.describe(),
                errors.len()
            );
            return Ok(UpdateResult::ValidationFailed {
                errors,
                subject: command.subject(&attempted),
            });
        }
        lifecycle.advance(CommandState::Validated)?;

        let attempted_subject = command.subject(&attempted);
        let metadata = ChangeMetadata {
            author: user.display_name().to_string(),
            message: Some(command.describe()),
        };

        match self.store.persist(&attempted, &base, metadata.clone()).await? {
            PersistOutcome::Committed { fingerprint } => {
                lifecycle.advance(CommandState::Accepted)?;
                info!(
                    "[Config Save] Saved {} as {}",
                    command.describe(),
                    fingerprint.short()
                );
                return Ok(UpdateResult::Success {
                    fingerprint,
                    merged: false,
                    subject: attempted_subject,
                });
            }
            PersistOutcome::Stale { current } => {
                warn!(
                    "[Config Save] Stale configuration: edited {}, current is {}",
                    base.short(),
                    current.short()
                );
            }
        }

        if !self.settings.merge_enabled {
            lifecycle.advance(CommandState::Rejected)?;
            let (current, current_fingerprint) = self.store.current().await?;
            return Ok(UpdateResult::conflict(
                ConflictReason::MergeDisabled,
                current,
                current_fingerprint,
                attempted_subject,
            ));
        }

        let (document, persist_base, merged) =
            match self.resolver.resolve(self.store.as_ref(), command, &base).await? {
                ResolutionOutcome::Clean => (attempted, base, false),
                ResolutionOutcome::Merged { document, base } => (document, base, true),
                ResolutionOutcome::Conflict {
                    reason,
                    current,
                    current_fingerprint,
                } => {
                    lifecycle.advance(CommandState::Rejected)?;
                    return Ok(UpdateResult::conflict(
                        reason,
                        current,
                        current_fingerprint,
                        attempted_subject,
                    ));
                }
            };

        // Exactly one more attempt; contention beyond that is reported, not retried
        match self.store.persist(&document, &persist_base, metadata).await? {
            PersistOutcome::Committed { fingerprint } => {
                lifecycle.advance(CommandState::Accepted)?;
                info!(
                    "[Config Save] Saved {} as {} (merged: {})",
                    command.describe(),
                    fingerprint.short(),
                    merged
                );
                Ok(UpdateResult::Success {
                    fingerprint,
                    merged,
                    subject: command.subject(&document).or(attempted_subject),
                })
            }
            PersistOutcome::Stale { .. } => {
                lifecycle.advance(CommandState::Rejected)?;
                warn!("[Config Save] Configuration changed again while saving {}", command.describe());
                let (current, current_fingerprint) = self.store.current().await?;
                Ok(UpdateResult::conflict(
                    ConflictReason::Contention,
                    current,
                    current_fingerprint,
                    attempted_subject,
                ))
            }
        }
    }

    /// Snapshot for an editor, checked against the user's permissions
    pub async fn load_for_edit(
        &self,
        locator: &Locator,
        user: &UserContext,
    ) -> Result<EditingSnapshot, UpdateResult> {
        let snapshot = self.store.load_for_editing(locator).await.map_err(|e| {
            UpdateResult::StorageUnavailable {
                message: e.to_string(),
            }
        })?;

        if !Authorization::PipelineOrTemplateAdmin.permits(user, locator, &snapshot.document) {
            return Err(UpdateResult::Forbidden {
                message: format!(
                    "User '{}' does not have permission to edit {}",
                    user.display_name(),
                    locator
                ),
            });
        }
        if snapshot.target.is_none() {
            let message = locator
                .resolve(&snapshot.document)
                .err()
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("{} not found", locator));
            return Err(UpdateResult::NotFound {
                locator: locator.clone(),
                message,
            });
        }
        Ok(snapshot)
    }

    pub async fn current(&self) -> Result<(ConfigurationDocument, Fingerprint), StoreError> {
        self.store.current().await
    }

    pub async fn history(&self) -> Result<Vec<RevisionSummary>, StoreError> {
        self.store.history(self.settings.history_limit).await
    }

    pub async fn revision(&self, fingerprint: &Fingerprint) -> Result<Option<Revision>, StoreError> {
        self.store.revision_at(fingerprint).await
    }

    pub async fn fingerprint_matches(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        self.store.fingerprint_matches(fingerprint).await
    }

    /// Structural changes from `earlier` to `later`; `None` when either revision is unknown
    pub async fn changes_between(
        &self,
        later: &Fingerprint,
        earlier: &Fingerprint,
    ) -> Result<Option<ConfigDiff>, StoreError> {
        let Some(to) = self.store.document_at(later).await? else {
            return Ok(None);
        };
        let Some(from) = self.store.document_at(earlier).await? else {
            return Ok(None);
        };
        Ok(Some(DiffEngine::compute(&from, &to)))
    }
}
