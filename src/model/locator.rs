use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::model::{name_key, ConfigurationDocument, Node, NodeKind};

/// One step of a locator path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Group(String),
    /// Pipelines are unique across groups, so this may appear directly under the root
    Pipeline(String),
    Template(String),
    Stage(String),
    Job(String),
    Task(usize),
    Param(String),
    Variable(String),
}

impl Segment {
    pub fn kind(&self) -> NodeKind {
        match self {
            Segment::Group(_) => NodeKind::Group,
            Segment::Pipeline(_) => NodeKind::Pipeline,
            Segment::Template(_) => NodeKind::Template,
            Segment::Stage(_) => NodeKind::Stage,
            Segment::Job(_) => NodeKind::Job,
            Segment::Task(_) => NodeKind::Task,
            Segment::Param(_) => NodeKind::Param,
            Segment::Variable(_) => NodeKind::Variable,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Segment::Group(n)
            | Segment::Pipeline(n)
            | Segment::Template(n)
            | Segment::Stage(n)
            | Segment::Job(n)
            | Segment::Param(n)
            | Segment::Variable(n) => Some(n),
            Segment::Task(_) => None,
        }
    }

    /// Build a named segment for `kind`; `None` for kinds addressed by index
    pub fn named(kind: NodeKind, name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        Some(match kind {
            NodeKind::Group => Segment::Group(name),
            NodeKind::Pipeline => Segment::Pipeline(name),
            NodeKind::Template => Segment::Template(name),
            NodeKind::Stage => Segment::Stage(name),
            NodeKind::Job => Segment::Job(name),
            NodeKind::Param => Segment::Param(name),
            NodeKind::Variable => Segment::Variable(name),
            NodeKind::Root | NodeKind::Task => return None,
        })
    }

    /// Same segment carrying a different name (rename follow-up)
    pub fn renamed(&self, new_name: &str) -> Self {
        match self {
            Segment::Task(i) => Segment::Task(*i),
            other => Segment::named(other.kind(), new_name).unwrap_or_else(|| other.clone()),
        }
    }

    fn locate_in(&self, node: &Node) -> Option<usize> {
        match self {
            Segment::Task(position) => node.nth_child_index(NodeKind::Task, *position),
            named => named.name().and_then(|n| node.child_index(named.kind(), n)),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Task(i) => write!(f, "task:{}", i),
            named => write!(f, "{}:{}", named.kind(), named.name().unwrap_or_default()),
        }
    }
}

/// Path from the document root to a target node, e.g. pipeline → stage → job → task index
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator {
    segments: Vec<Segment>,
}

impl Locator {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    pub fn child(&self, segment: Segment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self { segments }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Same locator with the final segment renamed
    pub fn with_last_renamed(&self, new_name: &str) -> Self {
        let mut segments = self.segments.clone();
        if let Some(last) = segments.last_mut() {
            *last = last.renamed(new_name);
        }
        Self { segments }
    }

    pub fn group(self, name: impl Into<String>) -> Self {
        self.child(Segment::Group(name.into()))
    }

    pub fn pipeline(self, name: impl Into<String>) -> Self {
        self.child(Segment::Pipeline(name.into()))
    }

    pub fn template(self, name: impl Into<String>) -> Self {
        self.child(Segment::Template(name.into()))
    }

    pub fn stage(self, name: impl Into<String>) -> Self {
        self.child(Segment::Stage(name.into()))
    }

    pub fn job(self, name: impl Into<String>) -> Self {
        self.child(Segment::Job(name.into()))
    }

    pub fn task(self, index: usize) -> Self {
        self.child(Segment::Task(index))
    }

    pub fn param(self, name: impl Into<String>) -> Self {
        self.child(Segment::Param(name.into()))
    }

    pub fn variable(self, name: impl Into<String>) -> Self {
        self.child(Segment::Variable(name.into()))
    }

    /// First pipeline named along the path
    pub fn pipeline_name(&self) -> Option<&str> {
        self.segments.iter().find_map(|s| match s {
            Segment::Pipeline(n) => Some(n.as_str()),
            _ => None,
        })
    }

    pub fn template_name(&self) -> Option<&str> {
        self.segments.iter().find_map(|s| match s {
            Segment::Template(n) => Some(n.as_str()),
            _ => None,
        })
    }

    pub fn group_name(&self) -> Option<&str> {
        self.segments.iter().find_map(|s| match s {
            Segment::Group(n) => Some(n.as_str()),
            _ => None,
        })
    }

    /// Walk the document and return a handle to the addressed node
    pub fn resolve(&self, document: &ConfigurationDocument) -> Result<NodeHandle, LocateError> {
        let mut node = &document.root;
        let mut indices = Vec::with_capacity(self.segments.len() + 1);
        let mut path = NodePath::root();

        for segment in &self.segments {
            // A pipeline addressed from the root is looked up across all groups
            if node.kind == NodeKind::Root {
                if let Segment::Pipeline(name) = segment {
                    let (group_index, pipeline_index) = node
                        .children
                        .iter()
                        .enumerate()
                        .filter(|(_, c)| c.kind == NodeKind::Group)
                        .find_map(|(gi, g)| {
                            g.child_index(NodeKind::Pipeline, name).map(|pi| (gi, pi))
                        })
                        .ok_or_else(|| LocateError::not_found(segment, &path))?;

                    let group = &node.children[group_index];
                    indices.push(group_index);
                    path = path.child(PathKey::of(group, group_index));

                    let pipeline = &group.children[pipeline_index];
                    indices.push(pipeline_index);
                    path = path.child(PathKey::of(pipeline, 0));
                    node = pipeline;
                    continue;
                }
            }

            if !node.kind.can_contain(segment.kind()) {
                return Err(LocateError::Misplaced {
                    segment: segment.to_string(),
                    parent: node.kind.to_string(),
                });
            }

            let index = segment
                .locate_in(node)
                .ok_or_else(|| LocateError::not_found(segment, &path))?;
            let child = &node.children[index];
            let key = match segment {
                Segment::Task(position) => PathKey::task(*position),
                _ => PathKey::of(child, index),
            };
            indices.push(index);
            path = path.child(key);
            node = child;
        }

        Ok(NodeHandle { indices, path })
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        let parts: Vec<String> = self.segments.iter().map(|s| s.to_string()).collect();
        f.write_str(&parts.join("/"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocatorParseError {
    #[error("invalid locator segment '{0}', expected kind:name")]
    InvalidSegment(String),
    #[error("unknown node kind '{0}'")]
    UnknownKind(String),
    #[error("task index '{0}' is not a number")]
    InvalidIndex(String),
}

impl FromStr for Locator {
    type Err = LocatorParseError;

    /// Parse `pipeline:p1/stage:s1/job:j1/task:0`; an empty string or `/` is the root
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        for part in s.split('/').filter(|p| !p.is_empty()) {
            let (kind, key) = part
                .split_once(':')
                .ok_or_else(|| LocatorParseError::InvalidSegment(part.to_string()))?;
            let segment = match kind {
                "task" => Segment::Task(
                    key.parse()
                        .map_err(|_| LocatorParseError::InvalidIndex(key.to_string()))?,
                ),
                "group" => Segment::Group(key.to_string()),
                "pipeline" => Segment::Pipeline(key.to_string()),
                "template" => Segment::Template(key.to_string()),
                "stage" => Segment::Stage(key.to_string()),
                "job" => Segment::Job(key.to_string()),
                "param" => Segment::Param(key.to_string()),
                "variable" => Segment::Variable(key.to_string()),
                other => return Err(LocatorParseError::UnknownKind(other.to_string())),
            };
            segments.push(segment);
        }
        Ok(Self { segments })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocateError {
    /// A path segment no longer exists, typically deleted by a concurrent edit
    #[error("{segment} not found under {parent}")]
    NodeNotFound { segment: String, parent: String },
    #[error("{segment} cannot appear under {parent}")]
    Misplaced { segment: String, parent: String },
}

impl LocateError {
    fn not_found(segment: &Segment, at: &NodePath) -> Self {
        LocateError::NodeNotFound {
            segment: segment.to_string(),
            parent: at.to_string(),
        }
    }
}

/// Canonical key of a node below its parent: lower-cased name, or position for tasks
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathKey {
    pub kind: NodeKind,
    pub key: String,
}

impl PathKey {
    pub fn named(kind: NodeKind, name: &str) -> Self {
        Self {
            kind,
            key: name_key(name),
        }
    }

    pub fn task(position: usize) -> Self {
        Self {
            kind: NodeKind::Task,
            key: position.to_string(),
        }
    }

    /// Key for `node`; `fallback` is used when the node carries no name
    pub fn of(node: &Node, fallback: usize) -> Self {
        match node.name() {
            Some(name) => Self::named(node.kind, name),
            None => Self {
                kind: node.kind,
                key: fallback.to_string(),
            },
        }
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// Fully qualified position of a node (pipelines include their group)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePath(Vec<PathKey>);

impl NodePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn keys(&self) -> &[PathKey] {
        &self.0
    }

    pub fn child(&self, key: PathKey) -> Self {
        let mut keys = self.0.clone();
        keys.push(key);
        Self(keys)
    }

    /// Path extended by several keys
    pub fn descend(&self, keys: &[PathKey]) -> Self {
        let mut path = self.0.clone();
        path.extend_from_slice(keys);
        Self(path)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn last(&self) -> Option<&PathKey> {
        self.0.last()
    }

    /// True when `self` equals `ancestor` or lies below it
    pub fn is_within(&self, ancestor: &NodePath) -> bool {
        self.0.starts_with(&ancestor.0)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        let parts: Vec<String> = self.0.iter().map(|k| k.to_string()).collect();
        f.write_str(&parts.join("/"))
    }
}

/// Proof that a locator resolved against a particular document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHandle {
    indices: Vec<usize>,
    path: NodePath,
}

impl NodeHandle {
    pub fn path(&self) -> &NodePath {
        &self.path
    }

    /// Position of the node within its parent's children
    pub fn index(&self) -> Option<usize> {
        self.indices.last().copied()
    }

    pub fn parent(&self) -> Option<NodeHandle> {
        let (_, rest) = self.indices.split_last()?;
        Some(NodeHandle {
            indices: rest.to_vec(),
            path: self.path.parent()?,
        })
    }

    pub fn get<'d>(&self, document: &'d ConfigurationDocument) -> Option<&'d Node> {
        let mut node = &document.root;
        for &i in &self.indices {
            node = node.children.get(i)?;
        }
        Some(node)
    }

    pub fn get_mut<'d>(&self, document: &'d mut ConfigurationDocument) -> Option<&'d mut Node> {
        let mut node = &mut document.root;
        for &i in &self.indices {
            node = node.children.get_mut(i)?;
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> ConfigurationDocument {
        let mut doc = ConfigurationDocument::new();
        doc.root.children.push(
            Node::named(NodeKind::Group, "first").with_child(
                Node::named(NodeKind::Pipeline, "p1").with_child(
                    Node::named(NodeKind::Stage, "s1").with_child(
                        Node::named(NodeKind::Job, "j1")
                            .with_child(Node::named(NodeKind::Variable, "ENV"))
                            .with_child(Node::new(NodeKind::Task).with_attr("command", "ls"))
                            .with_child(Node::new(NodeKind::Task).with_attr("command", "make")),
                    ),
                ),
            ),
        );
        doc
    }

    #[test]
    fn test_pipeline_is_found_across_groups() {
        let doc = document();
        let handle = Locator::root()
            .pipeline("P1")
            .stage("s1")
            .resolve(&doc)
            .expect("stage should resolve");
        assert_eq!(handle.path().to_string(), "group:first/pipeline:p1/stage:s1");
        assert_eq!(handle.get(&doc).and_then(|n| n.name()), Some("s1"));
    }

    #[test]
    fn test_task_index_counts_only_tasks() {
        let doc = document();
        let handle = Locator::root()
            .pipeline("p1")
            .stage("s1")
            .job("j1")
            .task(1)
            .resolve(&doc)
            .unwrap();
        assert_eq!(handle.get(&doc).unwrap().attr("command"), Some("make"));
        assert_eq!(handle.path().last(), Some(&PathKey::task(1)));
    }

    #[test]
    fn test_missing_segment_reports_not_found() {
        let doc = document();
        let err = Locator::root()
            .pipeline("p1")
            .stage("s1")
            .job("j2")
            .resolve(&doc)
            .unwrap_err();
        assert_eq!(
            err,
            LocateError::NodeNotFound {
                segment: "job:j2".to_string(),
                parent: "group:first/pipeline:p1/stage:s1".to_string(),
            }
        );
    }

    #[test]
    fn test_misplaced_segment_is_rejected() {
        let doc = document();
        let err = Locator::root().stage("s1").resolve(&doc).unwrap_err();
        assert!(matches!(err, LocateError::Misplaced { .. }));
    }

    #[test]
    fn test_parse_and_display() {
        let locator: Locator = "pipeline:p1/stage:s1/job:j1/task:0".parse().unwrap();
        assert_eq!(locator, Locator::root().pipeline("p1").stage("s1").job("j1").task(0));
        assert_eq!(locator.to_string(), "pipeline:p1/stage:s1/job:j1/task:0");
        assert!("/".parse::<Locator>().unwrap().is_root());
        assert!("task:x".parse::<Locator>().is_err());
        assert!("bogus:x".parse::<Locator>().is_err());
    }

    #[test]
    fn test_locator_serializes_as_tagged_segments() {
        let locator = Locator::root().pipeline("p").task(0);
        let json = serde_json::to_value(&locator).unwrap();
        assert_eq!(json, serde_json::json!([{"pipeline": "p"}, {"task": 0}]));
    }

    #[test]
    fn test_with_last_renamed() {
        let locator = Locator::root().pipeline("p").stage("old");
        assert_eq!(
            locator.with_last_renamed("new"),
            Locator::root().pipeline("p").stage("new")
        );
    }

    #[test]
    fn test_node_path_containment() {
        let parent = NodePath::root().child(PathKey::named(NodeKind::Group, "g"));
        let child = parent.child(PathKey::named(NodeKind::Pipeline, "p"));
        assert!(child.is_within(&parent));
        assert!(parent.is_within(&parent));
        assert!(!parent.is_within(&child));
    }
}
