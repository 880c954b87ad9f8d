use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{name_key, same_name, split_list};

/// Field-scoped validation messages attached to a node
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Field key used for errors that concern the node as a whole
pub const BASE_FIELD: &str = "base";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Root,
    Group,
    Pipeline,
    Template,
    Stage,
    Job,
    Task,
    Param,
    Variable,
}

impl NodeKind {
    /// Tasks are addressed by position, everything else below the root by name
    pub fn is_named(self) -> bool {
        !matches!(self, NodeKind::Root | NodeKind::Task)
    }

    pub fn label(self) -> &'static str {
        match self {
            NodeKind::Root => "config",
            NodeKind::Group => "group",
            NodeKind::Pipeline => "pipeline",
            NodeKind::Template => "template",
            NodeKind::Stage => "stage",
            NodeKind::Job => "job",
            NodeKind::Task => "task",
            NodeKind::Param => "param",
            NodeKind::Variable => "variable",
        }
    }

    /// Child kinds a node of this kind may hold
    pub fn allowed_children(self) -> &'static [NodeKind] {
        match self {
            NodeKind::Root => &[NodeKind::Group, NodeKind::Template],
            NodeKind::Group => &[NodeKind::Pipeline],
            NodeKind::Pipeline => &[NodeKind::Param, NodeKind::Variable, NodeKind::Stage],
            NodeKind::Template => &[NodeKind::Param, NodeKind::Stage],
            NodeKind::Stage => &[NodeKind::Variable, NodeKind::Job],
            NodeKind::Job => &[NodeKind::Variable, NodeKind::Task],
            NodeKind::Task | NodeKind::Param | NodeKind::Variable => &[],
        }
    }

    pub fn can_contain(self, child: NodeKind) -> bool {
        self.allowed_children().contains(&child)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One element of the configuration tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Node>,
    /// Validation errors from the last validation run; never part of the content
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: FieldErrors,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            name: None,
            attributes: BTreeMap::new(),
            children: Vec::new(),
            errors: BTreeMap::new(),
        }
    }

    pub fn named(kind: NodeKind, name: impl Into<String>) -> Self {
        let mut node = Self::new(kind);
        node.name = Some(name.into());
        node
    }

    /// Builder-style attribute setter
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Builder-style child append
    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.name.as_deref().is_some_and(|n| same_name(n, name))
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|v| v.as_str())
    }

    /// Set an attribute; an empty value clears it
    pub fn set_attr(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            self.attributes.remove(key);
        } else {
            self.attributes.insert(key.to_string(), value.to_string());
        }
    }

    /// Comma separated attribute as a list
    pub fn attr_list(&self, key: &str) -> Vec<String> {
        self.attr(key).map(split_list).unwrap_or_default()
    }

    pub fn children_of(&self, kind: NodeKind) -> impl Iterator<Item = &Node> {
        self.children.iter().filter(move |c| c.kind == kind)
    }

    pub fn child(&self, kind: NodeKind, name: &str) -> Option<&Node> {
        self.child_index(kind, name).map(|i| &self.children[i])
    }

    pub fn child_index(&self, kind: NodeKind, name: &str) -> Option<usize> {
        self.children
            .iter()
            .position(|c| c.kind == kind && c.has_name(name))
    }

    /// Index into `children` of the `position`-th child of `kind`
    pub fn nth_child_index(&self, kind: NodeKind, position: usize) -> Option<usize> {
        self.children
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind == kind)
            .nth(position)
            .map(|(i, _)| i)
    }

    pub fn add_error(&mut self, field: &str, message: impl Into<String>) {
        self.errors
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
        for child in &mut self.children {
            child.clear_errors();
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || self.children.iter().any(|c| c.has_errors())
    }

    /// Number of nodes in this subtree, including itself
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.node_count()).sum::<usize>()
    }

    /// Human readable label, e.g. `stage 'build'` or `task`
    pub fn describe(&self) -> String {
        match &self.name {
            Some(name) => format!("{} '{}'", self.kind, name),
            None => self.kind.to_string(),
        }
    }
}

/// Server-level security section of the configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecuritySettings {
    pub enabled: bool,
    #[serde(default)]
    pub admins: Vec<String>,
}

impl SecuritySettings {
    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admins.iter().any(|a| same_name(a, user_id))
    }
}

/// The full configuration tree: groups of pipelines plus templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationDocument {
    #[serde(default)]
    pub security: SecuritySettings,
    pub root: Node,
}

impl Default for ConfigurationDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationDocument {
    /// Empty configuration with security disabled
    pub fn new() -> Self {
        Self {
            security: SecuritySettings::default(),
            root: Node::new(NodeKind::Root),
        }
    }

    pub fn with_security(mut self, security: SecuritySettings) -> Self {
        self.security = security;
        self
    }

    pub fn groups(&self) -> impl Iterator<Item = &Node> {
        self.root.children_of(NodeKind::Group)
    }

    pub fn templates(&self) -> impl Iterator<Item = &Node> {
        self.root.children_of(NodeKind::Template)
    }

    pub fn group(&self, name: &str) -> Option<&Node> {
        self.root.child(NodeKind::Group, name)
    }

    pub fn template(&self, name: &str) -> Option<&Node> {
        self.root.child(NodeKind::Template, name)
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &Node> {
        self.groups().flat_map(|g| g.children_of(NodeKind::Pipeline))
    }

    pub fn pipeline(&self, name: &str) -> Option<&Node> {
        self.pipelines().find(|p| p.has_name(name))
    }

    /// Group that owns the named pipeline
    pub fn group_of_pipeline(&self, pipeline: &str) -> Option<&Node> {
        self.groups()
            .find(|g| g.child(NodeKind::Pipeline, pipeline).is_some())
    }

    /// Whether `user_id` may administer the named group
    pub fn is_group_admin(&self, user_id: &str, group: &str) -> bool {
        if !self.security.enabled || self.security.is_admin(user_id) {
            return true;
        }
        self.group(group)
            .map(|g| g.attr_list("admins").iter().any(|a| same_name(a, user_id)))
            .unwrap_or(false)
    }

    /// Whether `user_id` may edit the named template
    pub fn is_template_admin(&self, user_id: &str, template: &str) -> bool {
        if !self.security.enabled || self.security.is_admin(user_id) {
            return true;
        }
        self.template(template)
            .map(|t| t.attr_list("admins").iter().any(|a| same_name(a, user_id)))
            .unwrap_or(false)
    }

    pub fn is_server_admin(&self, user_id: &str) -> bool {
        !self.security.enabled || self.security.is_admin(user_id)
    }

    pub fn has_errors(&self) -> bool {
        self.root.has_errors()
    }

    pub fn clear_errors(&mut self) {
        self.root.clear_errors();
    }

    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }

    /// Lower-cased pipeline names, used for global uniqueness checks
    pub fn pipeline_keys(&self) -> Vec<String> {
        self.pipelines()
            .filter_map(|p| p.name())
            .map(name_key)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConfigurationDocument {
        let mut doc = ConfigurationDocument::new();
        doc.root.children.push(
            Node::named(NodeKind::Group, "first")
                .with_attr("admins", "alice, bob")
                .with_child(
                    Node::named(NodeKind::Pipeline, "p1")
                        .with_child(Node::named(NodeKind::Stage, "s1")),
                ),
        );
        doc.root
            .children
            .push(Node::named(NodeKind::Template, "t1").with_attr("admins", "carol"));
        doc
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let doc = sample();
        assert!(doc.pipeline("P1").is_some());
        assert_eq!(doc.group_of_pipeline("p1").and_then(|g| g.name()), Some("first"));
        assert!(doc.template("T1").is_some());
    }

    #[test]
    fn test_admin_checks_respect_security_switch() {
        let mut doc = sample();
        assert!(doc.is_group_admin("mallory", "first"));

        doc.security = SecuritySettings {
            enabled: true,
            admins: vec!["root".to_string()],
        };
        assert!(doc.is_group_admin("Alice", "first"));
        assert!(!doc.is_group_admin("mallory", "first"));
        assert!(doc.is_group_admin("root", "first"));
        assert!(doc.is_template_admin("carol", "t1"));
        assert!(!doc.is_template_admin("alice", "t1"));
        assert!(!doc.is_server_admin("alice"));
    }

    #[test]
    fn test_set_attr_with_empty_value_clears() {
        let mut node = Node::new(NodeKind::Task).with_attr("command", "ls");
        node.set_attr("command", "");
        assert_eq!(node.attr("command"), None);
    }

    #[test]
    fn test_errors_are_tracked_recursively() {
        let mut doc = sample();
        assert!(!doc.has_errors());
        doc.root.children[0].children[0].add_error("name", "bad");
        assert!(doc.has_errors());
        doc.clear_errors();
        assert!(!doc.has_errors());
    }
}
