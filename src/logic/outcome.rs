use serde::Serialize;

use crate::logic::validate::ValidationError;
use crate::model::{
    ConfigurationDocument, Fingerprint, LocateError, Locator, MergeConflict, Node,
};

/// Why an edit could not be reconciled with concurrent changes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictReason {
    /// The addressed node no longer exists in the latest configuration
    TargetMissing { error: LocateError },
    /// The fingerprint the editor loaded is not in the revision history
    BaseRevisionUnavailable { base: Fingerprint },
    /// The edit overlaps a concurrent change
    Overlap { conflicts: Vec<MergeConflict> },
    /// The merged configuration is invalid
    PostMergeValidation { errors: Vec<ValidationError> },
    /// The configuration changed again while the merge was being saved
    Contention,
    /// Merging concurrent edits is turned off
    MergeDisabled,
}

impl ConflictReason {
    pub fn message(&self) -> String {
        match self {
            ConflictReason::TargetMissing { error } => {
                format!("Configuration was modified by someone else and {}", error)
            }
            ConflictReason::BaseRevisionUnavailable { base } => format!(
                "The configuration version {} you edited is no longer available",
                base.short()
            ),
            ConflictReason::Overlap { conflicts } => {
                let details: Vec<&str> = conflicts.iter().map(|c| c.description.as_str()).collect();
                format!(
                    "Configuration file has been modified by someone else: {}",
                    details.join("; ")
                )
            }
            ConflictReason::PostMergeValidation { errors } => {
                let details: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
                format!(
                    "Configuration file has been modified by someone else and merging produced an invalid configuration: {}",
                    details.join("; ")
                )
            }
            ConflictReason::Contention => {
                "Configuration file was modified again while saving, please retry".to_string()
            }
            ConflictReason::MergeDisabled => {
                "Configuration file has been modified by someone else".to_string()
            }
        }
    }
}

/// Final outcome of one coordinator execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateResult {
    Success {
        fingerprint: Fingerprint,
        /// Whether the edit was merged with concurrent changes
        merged: bool,
        subject: Option<Node>,
    },
    ValidationFailed {
        errors: Vec<ValidationError>,
        subject: Option<Node>,
    },
    Conflict {
        message: String,
        reason: ConflictReason,
        current_fingerprint: Fingerprint,
        current: Box<ConfigurationDocument>,
        /// The edited node as the user submitted it
        attempted: Option<Node>,
    },
    Forbidden {
        message: String,
    },
    NotFound {
        locator: Locator,
        message: String,
    },
    StorageUnavailable {
        message: String,
    },
}

impl UpdateResult {
    pub fn conflict(
        reason: ConflictReason,
        current: ConfigurationDocument,
        current_fingerprint: Fingerprint,
        attempted: Option<Node>,
    ) -> Self {
        UpdateResult::Conflict {
            message: reason.message(),
            reason,
            current_fingerprint,
            current: Box::new(current),
            attempted,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UpdateResult::Success { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, UpdateResult::Conflict { .. })
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, UpdateResult::Success { merged: true, .. })
    }

    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            UpdateResult::ValidationFailed { errors, .. } => errors,
            UpdateResult::Conflict {
                reason: ConflictReason::PostMergeValidation { errors },
                ..
            } => errors,
            _ => &[],
        }
    }

    /// Fingerprint of the persisted configuration (success) or of the one that won (conflict)
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        match self {
            UpdateResult::Success { fingerprint, .. } => Some(fingerprint),
            UpdateResult::Conflict {
                current_fingerprint,
                ..
            } => Some(current_fingerprint),
            _ => None,
        }
    }

    pub fn subject(&self) -> Option<&Node> {
        match self {
            UpdateResult::Success { subject, .. } | UpdateResult::ValidationFailed { subject, .. } => {
                subject.as_ref()
            }
            UpdateResult::Conflict { attempted, .. } => attempted.as_ref(),
            _ => None,
        }
    }

    pub fn conflict_reason(&self) -> Option<&ConflictReason> {
        match self {
            UpdateResult::Conflict { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            UpdateResult::Success { .. } => 200,
            UpdateResult::ValidationFailed { .. } => 400,
            UpdateResult::Forbidden { .. } => 403,
            UpdateResult::NotFound { .. } => 404,
            UpdateResult::Conflict { .. } => 409,
            UpdateResult::StorageUnavailable { .. } => 503,
        }
    }
}
