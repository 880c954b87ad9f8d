use log::{debug, info};

use crate::logic::command::{Claim, UpdateCommand};
use crate::logic::diff::DiffEngine;
use crate::logic::outcome::ConflictReason;
use crate::logic::validate::Validator;
use crate::model::{ConfigurationDocument, ConflictType, Fingerprint, MergeConflict};
use crate::store::traits::{ConfigStore, StoreError};

#[derive(Debug, Clone)]
pub enum ResolutionOutcome {
    /// The store still holds the base revision
    Clean,
    /// The command re-applied cleanly on top of the latest configuration
    Merged {
        document: ConfigurationDocument,
        /// Fingerprint the merged document must be persisted against
        base: Fingerprint,
    },
    Conflict {
        reason: ConflictReason,
        current: ConfigurationDocument,
        current_fingerprint: Fingerprint,
    },
}

/// Reconciles a command built on an outdated revision with the latest configuration
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    validator: Validator,
}

impl ConflictResolver {
    pub fn new(validator: Validator) -> Self {
        Self { validator }
    }

    pub async fn resolve<S, C>(
        &self,
        store: &S,
        command: &C,
        base: &Fingerprint,
    ) -> Result<ResolutionOutcome, StoreError>
    where
        S: ConfigStore + ?Sized,
        C: UpdateCommand,
    {
        let (current, current_fingerprint) = store.current().await?;
        if &current_fingerprint == base {
            return Ok(ResolutionOutcome::Clean);
        }

        let conflict = |reason: ConflictReason, current: ConfigurationDocument| {
            info!("[Config Save] Conflict for {}: {}", command.describe(), reason.message());
            ResolutionOutcome::Conflict {
                reason,
                current,
                current_fingerprint: current_fingerprint.clone(),
            }
        };

        let Some(base_document) = store.document_at(base).await? else {
            return Ok(conflict(
                ConflictReason::BaseRevisionUnavailable { base: base.clone() },
                current,
            ));
        };

        let current_target = match command.locate(&current) {
            Ok(handle) => handle,
            Err(error) => return Ok(conflict(ConflictReason::TargetMissing { error }, current)),
        };
        let base_target = match command.locate(&base_document) {
            Ok(handle) => handle,
            Err(error) => return Ok(conflict(ConflictReason::TargetMissing { error }, current)),
        };

        // What this command changes relative to its base, and what happened upstream since
        let mut edited = base_document.clone();
        command.apply(&mut edited, &base_target, &self.validator);
        let ours = DiffEngine::compute(&base_document, &edited);
        let theirs = DiffEngine::compute(&base_document, &current);
        debug!(
            "[Config Save] Merging {} local against {} upstream operations",
            ours.operations.len(),
            theirs.operations.len()
        );

        let mut conflicts = DiffEngine::find_conflicts(&ours, &theirs);
        for claim in command.footprint(&base_document, &base_target) {
            conflicts.extend(
                theirs
                    .operations
                    .iter()
                    .filter(|op| claim.is_violated_by(op))
                    .map(|op| Self::claim_conflict(&claim, op)),
            );
        }
        if !conflicts.is_empty() {
            return Ok(conflict(ConflictReason::Overlap { conflicts }, current));
        }

        let mut merged = current.clone();
        let errors = command.apply(&mut merged, &current_target, &self.validator);
        if !errors.is_empty() {
            return Ok(conflict(ConflictReason::PostMergeValidation { errors }, current));
        }

        info!(
            "[Config Save] Merged {} onto {}",
            command.describe(),
            current_fingerprint.short()
        );
        Ok(ResolutionOutcome::Merged {
            document: merged,
            base: current_fingerprint,
        })
    }

    fn claim_conflict(claim: &Claim, op: &crate::model::ChangeOp) -> MergeConflict {
        match claim {
            Claim::Subtree(path) => MergeConflict {
                conflict_type: ConflictType::ModifyModify,
                path: path.clone(),
                description: format!("{} was concurrently changed to {}", path, op.describe()),
            },
            Claim::ChildOrder { parent, kind } => MergeConflict {
                conflict_type: ConflictType::Reordered,
                path: parent.clone(),
                description: format!(
                    "{}s of {} were concurrently changed to {}",
                    kind,
                    parent,
                    op.describe()
                ),
            },
        }
    }
}
