use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{Fingerprint, Node, NodeKind, NodePath, PathKey};

/// A structural change between two configuration documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op_type", rename_all = "snake_case")]
pub enum ChangeOp {
    AddNode {
        path: NodePath,
        node: Node,
    },
    RemoveNode {
        path: NodePath,
    },
    /// Same subtree under a new name
    RenameNode {
        path: NodePath,
        new_name: String,
    },
    PatchNode {
        path: NodePath,
        field_changes: BTreeMap<String, FieldChange>,
    },
    /// Children of `kind` under `path` were reordered, or (for tasks) inserted/removed
    ReorderChildren {
        path: NodePath,
        kind: NodeKind,
    },
}

/// Represents a field-level change; `None` means the field is absent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Represents a diff between two revisions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDiff {
    pub from: Fingerprint,
    pub to: Fingerprint,
    pub operations: Vec<ChangeOp>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Two concurrent changes that cannot both be kept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub conflict_type: ConflictType,
    pub path: NodePath,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides added a node at the same position with different content
    AddAdd,
    /// One side deleted, other side modified
    DeleteModify,
    /// Both sides modified the same field differently
    ModifyModify,
    /// One side depends on child positions the other side changed
    Reordered,
}

impl ChangeOp {
    /// Node (or parent, for reorders) this operation is anchored at
    pub fn path(&self) -> &NodePath {
        match self {
            ChangeOp::AddNode { path, .. }
            | ChangeOp::RemoveNode { path }
            | ChangeOp::RenameNode { path, .. }
            | ChangeOp::PatchNode { path, .. }
            | ChangeOp::ReorderChildren { path, .. } => path,
        }
    }

    /// One-line description for conflict messages and change listings
    pub fn describe(&self) -> String {
        match self {
            ChangeOp::AddNode { path, .. } => format!("add {}", path),
            ChangeOp::RemoveNode { path } => format!("remove {}", path),
            ChangeOp::RenameNode { path, new_name } => format!("rename {} to '{}'", path, new_name),
            ChangeOp::PatchNode {
                path,
                field_changes,
            } => {
                let fields: Vec<&str> = field_changes.keys().map(|k| k.as_str()).collect();
                format!("change {} of {}", fields.join(", "), path)
            }
            ChangeOp::ReorderChildren { path, kind } => format!("reorder {}s of {}", kind, path),
        }
    }

    /// Path a rename moves the node to
    pub fn renamed_path(&self) -> Option<NodePath> {
        match self {
            ChangeOp::RenameNode { path, new_name } => {
                let kind = path.last()?.kind;
                Some(path.parent()?.child(PathKey::named(kind, new_name)))
            }
            _ => None,
        }
    }

    /// Whether this operation adds or removes a child of `kind` directly under `parent`
    pub fn changes_children_of(&self, parent: &NodePath, kind: NodeKind) -> bool {
        let direct_child = |path: &NodePath| {
            path.parent().as_ref() == Some(parent)
                && path.last().map(|k| k.kind) == Some(kind)
        };
        match self {
            ChangeOp::AddNode { path, .. } | ChangeOp::RemoveNode { path } => direct_child(path),
            ChangeOp::RenameNode { path, .. } => direct_child(path),
            ChangeOp::ReorderChildren { path, kind: k } => path == parent && *k == kind,
            ChangeOp::PatchNode { .. } => false,
        }
    }

    /// Check if this operation conflicts with another made concurrently from the same base
    pub fn conflicts_with(&self, other: &ChangeOp) -> Option<ConflictType> {
        if let Some(conflict) = Self::removal_conflict(self, other) {
            return Some(conflict);
        }
        if let Some(conflict) = Self::removal_conflict(other, self) {
            return Some(conflict);
        }
        if self.touches_reordered_task(other) || other.touches_reordered_task(self) {
            return Some(ConflictType::Reordered);
        }

        match (self, other) {
            (
                ChangeOp::AddNode { path: p1, node: n1 },
                ChangeOp::AddNode { path: p2, node: n2 },
            ) if p1 == p2 && n1 != n2 => Some(ConflictType::AddAdd),
            (ChangeOp::AddNode { .. }, ChangeOp::AddNode { .. }) => None,

            (
                ChangeOp::PatchNode {
                    path: p1,
                    field_changes: fc1,
                },
                ChangeOp::PatchNode {
                    path: p2,
                    field_changes: fc2,
                },
            ) if p1 == p2 => {
                for (field, change1) in fc1 {
                    if let Some(change2) = fc2.get(field) {
                        if change1.new_value != change2.new_value {
                            return Some(ConflictType::ModifyModify);
                        }
                    }
                }
                None
            }

            (
                ChangeOp::RenameNode {
                    path: p1,
                    new_name: n1,
                },
                ChangeOp::RenameNode {
                    path: p2,
                    new_name: n2,
                },
            ) if p1 == p2 && !crate::model::same_name(n1, n2) => Some(ConflictType::ModifyModify),

            (
                ChangeOp::ReorderChildren { path: p1, kind: k1 },
                ChangeOp::ReorderChildren { path: p2, kind: k2 },
            ) if p1 == p2 && k1 == k2 => Some(ConflictType::Reordered),

            (ChangeOp::ReorderChildren { path, kind }, other)
            | (other, ChangeOp::ReorderChildren { path, kind })
                if other.changes_children_of(path, *kind) =>
            {
                Some(ConflictType::Reordered)
            }

            _ => Self::name_collision(self, other),
        }
    }

    /// A removed subtree against anything done inside it
    fn removal_conflict(removal: &ChangeOp, other: &ChangeOp) -> Option<ConflictType> {
        let ChangeOp::RemoveNode { path: removed } = removal else {
            return None;
        };
        match other {
            ChangeOp::RemoveNode { path } if path == removed => None,
            other if other.path().is_within(removed) => Some(ConflictType::DeleteModify),
            _ => None,
        }
    }

    /// Edit of an index-addressed task whose parent's task list the other side restructured
    fn touches_reordered_task(&self, other: &ChangeOp) -> bool {
        let ChangeOp::ReorderChildren {
            path: parent,
            kind: NodeKind::Task,
        } = other
        else {
            return false;
        };
        let path = self.path();
        path.is_within(parent)
            && path
                .keys()
                .get(parent.depth())
                .is_some_and(|key| key.kind == NodeKind::Task)
    }

    /// Both sides placing a node under the same new path
    fn name_collision(a: &ChangeOp, b: &ChangeOp) -> Option<ConflictType> {
        let target = |op: &ChangeOp| match op {
            ChangeOp::AddNode { path, .. } => Some(path.clone()),
            ChangeOp::RenameNode { .. } => op.renamed_path(),
            _ => None,
        };
        match (target(a), target(b)) {
            (Some(x), Some(y)) if x == y => Some(ConflictType::AddAdd),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(keys: &[(NodeKind, &str)]) -> NodePath {
        keys.iter().fold(NodePath::root(), |p, (kind, key)| {
            p.child(PathKey {
                kind: *kind,
                key: key.to_string(),
            })
        })
    }

    fn patch(p: NodePath, field: &str, value: &str) -> ChangeOp {
        let mut field_changes = BTreeMap::new();
        field_changes.insert(
            field.to_string(),
            FieldChange {
                old_value: None,
                new_value: Some(value.to_string()),
            },
        );
        ChangeOp::PatchNode {
            path: p,
            field_changes,
        }
    }

    #[test]
    fn test_patches_on_different_fields_do_not_conflict() {
        let p = path(&[(NodeKind::Group, "g"), (NodeKind::Pipeline, "p")]);
        let ours = patch(p.clone(), "label", "x");
        let theirs = patch(p.clone(), "timer", "y");
        assert_eq!(ours.conflicts_with(&theirs), None);
        assert_eq!(
            ours.conflicts_with(&patch(p, "label", "z")),
            Some(ConflictType::ModifyModify)
        );
    }

    #[test]
    fn test_removal_conflicts_with_changes_inside_subtree() {
        let stage = path(&[(NodeKind::Group, "g"), (NodeKind::Pipeline, "p"), (NodeKind::Stage, "s")]);
        let job = stage.child(PathKey::named(NodeKind::Job, "j"));
        let removal = ChangeOp::RemoveNode { path: stage.clone() };
        assert_eq!(
            patch(job.clone(), "timeout", "5").conflicts_with(&removal),
            Some(ConflictType::DeleteModify)
        );
        assert_eq!(removal.conflicts_with(&patch(job, "timeout", "5")), Some(ConflictType::DeleteModify));
        assert_eq!(removal.conflicts_with(&ChangeOp::RemoveNode { path: stage }), None);
    }

    #[test]
    fn test_add_with_same_name_conflicts() {
        let p = path(&[(NodeKind::Group, "g"), (NodeKind::Pipeline, "p"), (NodeKind::Stage, "deploy")]);
        let ours = ChangeOp::AddNode {
            path: p.clone(),
            node: Node::named(NodeKind::Stage, "deploy"),
        };
        let theirs = ChangeOp::AddNode {
            path: p.clone(),
            node: Node::named(NodeKind::Stage, "deploy").with_attr("approval", "manual"),
        };
        assert_eq!(ours.conflicts_with(&theirs), Some(ConflictType::AddAdd));

        let rename = ChangeOp::RenameNode {
            path: path(&[(NodeKind::Group, "g"), (NodeKind::Pipeline, "p"), (NodeKind::Stage, "ship")]),
            new_name: "Deploy".to_string(),
        };
        assert_eq!(rename.conflicts_with(&theirs), Some(ConflictType::AddAdd));
    }

    #[test]
    fn test_task_edit_conflicts_with_task_list_change() {
        let job = path(&[(NodeKind::Group, "g"), (NodeKind::Pipeline, "p"), (NodeKind::Stage, "s"), (NodeKind::Job, "j")]);
        let task = job.child(PathKey::task(1));
        let reorder = ChangeOp::ReorderChildren {
            path: job.clone(),
            kind: NodeKind::Task,
        };
        assert_eq!(
            patch(task, "command", "make").conflicts_with(&reorder),
            Some(ConflictType::Reordered)
        );
        assert_eq!(patch(job, "timeout", "1").conflicts_with(&reorder), None);
    }
}
