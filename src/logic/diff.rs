use itertools::Itertools;
use std::collections::BTreeMap;

use crate::model::{
    ChangeOp, ConfigDiff, ConfigurationDocument, FieldChange, Fingerprint, MergeConflict, Node,
    NodeKind, NodePath, PathKey,
};

/// Structural diff and overlap detection between configuration documents
pub struct DiffEngine;

impl DiffEngine {
    /// Compute the operations that turn `from` into `to`
    pub fn compute(from: &ConfigurationDocument, to: &ConfigurationDocument) -> ConfigDiff {
        let mut operations = Vec::new();

        // Security settings are reported as fields of the root node
        let mut root_changes = BTreeMap::new();
        if from.security.enabled != to.security.enabled {
            root_changes.insert(
                "security.enabled".to_string(),
                FieldChange {
                    old_value: Some(from.security.enabled.to_string()),
                    new_value: Some(to.security.enabled.to_string()),
                },
            );
        }
        if from.security.admins != to.security.admins {
            root_changes.insert(
                "security.admins".to_string(),
                FieldChange {
                    old_value: Some(from.security.admins.join(",")),
                    new_value: Some(to.security.admins.join(",")),
                },
            );
        }

        Self::diff_node(
            &from.root,
            &to.root,
            &NodePath::root(),
            root_changes,
            &mut operations,
        );

        ConfigDiff {
            from: Fingerprint::of(from),
            to: Fingerprint::of(to),
            operations,
        }
    }

    /// Pairs of operations from two diffs of the same base that cannot both be applied
    pub fn find_conflicts(ours: &ConfigDiff, theirs: &ConfigDiff) -> Vec<MergeConflict> {
        ours.operations
            .iter()
            .cartesian_product(theirs.operations.iter())
            .filter_map(|(mine, other)| {
                mine.conflicts_with(other).map(|conflict_type| MergeConflict {
                    conflict_type,
                    path: mine.path().clone(),
                    description: format!(
                        "{:?} conflict: this edit would {}, but it was concurrently changed to {}",
                        conflict_type,
                        mine.describe(),
                        other.describe()
                    ),
                })
            })
            .collect()
    }

    fn diff_node(
        from: &Node,
        to: &Node,
        path: &NodePath,
        mut field_changes: BTreeMap<String, FieldChange>,
        ops: &mut Vec<ChangeOp>,
    ) {
        // Names differing only in case share a path key and show up as a field change
        if from.name != to.name {
            field_changes.insert(
                "name".to_string(),
                FieldChange {
                    old_value: from.name.clone(),
                    new_value: to.name.clone(),
                },
            );
        }

        for key in from.attributes.keys().chain(to.attributes.keys()).unique() {
            let old_value = from.attributes.get(key);
            let new_value = to.attributes.get(key);
            if old_value != new_value {
                field_changes.insert(
                    key.clone(),
                    FieldChange {
                        old_value: old_value.cloned(),
                        new_value: new_value.cloned(),
                    },
                );
            }
        }

        if !field_changes.is_empty() {
            ops.push(ChangeOp::PatchNode {
                path: path.clone(),
                field_changes,
            });
        }

        let kinds: Vec<NodeKind> = from
            .children
            .iter()
            .chain(to.children.iter())
            .map(|c| c.kind)
            .unique()
            .collect();

        for kind in kinds {
            if kind.is_named() {
                Self::diff_named_children(from, to, kind, path, ops);
            } else {
                Self::diff_indexed_children(from, to, kind, path, ops);
            }
        }
    }

    fn keyed(node: &Node, kind: NodeKind) -> Vec<(PathKey, &Node)> {
        node.children_of(kind)
            .enumerate()
            .map(|(i, c)| (PathKey::of(c, i), c))
            .collect()
    }

    fn diff_named_children(
        from: &Node,
        to: &Node,
        kind: NodeKind,
        path: &NodePath,
        ops: &mut Vec<ChangeOp>,
    ) {
        let before = Self::keyed(from, kind);
        let after = Self::keyed(to, kind);
        let before_map: BTreeMap<&PathKey, &Node> = before.iter().map(|(k, n)| (k, *n)).collect();
        let after_map: BTreeMap<&PathKey, &Node> = after.iter().map(|(k, n)| (k, *n)).collect();

        let removed: Vec<(&PathKey, &Node)> = before
            .iter()
            .filter(|(k, _)| !after_map.contains_key(k))
            .map(|(k, n)| (k, *n))
            .collect();
        let mut added: Vec<(&PathKey, &Node)> = after
            .iter()
            .filter(|(k, _)| !before_map.contains_key(k))
            .map(|(k, n)| (k, *n))
            .collect();

        for (key, node) in removed {
            let rename = added
                .iter()
                .position(|(_, candidate)| Self::same_except_name(node, candidate));
            match rename {
                Some(pos) => {
                    let (_, target) = added.remove(pos);
                    ops.push(ChangeOp::RenameNode {
                        path: path.child(key.clone()),
                        new_name: target.name().unwrap_or_default().to_string(),
                    });
                }
                None => ops.push(ChangeOp::RemoveNode {
                    path: path.child(key.clone()),
                }),
            }
        }

        for (key, node) in added {
            ops.push(ChangeOp::AddNode {
                path: path.child(key.clone()),
                node: node.clone(),
            });
        }

        for (key, node) in &before {
            if let Some(other) = after_map.get(key) {
                Self::diff_node(node, other, &path.child(key.clone()), BTreeMap::new(), ops);
            }
        }

        let kept_before: Vec<&PathKey> = before
            .iter()
            .map(|(k, _)| k)
            .filter(|k| after_map.contains_key(k))
            .collect();
        let kept_after: Vec<&PathKey> = after
            .iter()
            .map(|(k, _)| k)
            .filter(|k| before_map.contains_key(k))
            .collect();
        if kept_before != kept_after {
            ops.push(ChangeOp::ReorderChildren {
                path: path.clone(),
                kind,
            });
        }
    }

    /// Tasks have no identity beyond their position
    fn diff_indexed_children(
        from: &Node,
        to: &Node,
        kind: NodeKind,
        path: &NodePath,
        ops: &mut Vec<ChangeOp>,
    ) {
        let before: Vec<&Node> = from.children_of(kind).collect();
        let after: Vec<&Node> = to.children_of(kind).collect();
        if before == after {
            return;
        }

        let same_members = before.len() == after.len()
            && after.iter().all(|a| before.contains(a))
            && before.iter().all(|b| after.contains(b));

        if before.len() != after.len() || same_members {
            ops.push(ChangeOp::ReorderChildren {
                path: path.clone(),
                kind,
            });
            for (i, _) in before.iter().enumerate().skip(after.len()) {
                ops.push(ChangeOp::RemoveNode {
                    path: path.child(PathKey::of(before[i], i)),
                });
            }
            for (i, node) in after.iter().enumerate().skip(before.len()) {
                ops.push(ChangeOp::AddNode {
                    path: path.child(PathKey::of(node, i)),
                    node: (*node).clone(),
                });
            }
            return;
        }

        for (i, (old, new)) in before.iter().zip(after.iter()).enumerate() {
            Self::diff_node(old, new, &path.child(PathKey::of(new, i)), BTreeMap::new(), ops);
        }
    }

    fn same_except_name(a: &Node, b: &Node) -> bool {
        a.kind == b.kind && a.attributes == b.attributes && a.children == b.children
    }
}
