use std::fmt;
use std::sync::Arc;

use crate::logic::validate::{
    is_parameter_in_use, parameter_references_in, ValidationError, ValidationErrorType, Validator,
};
use crate::model::{
    name_key, ChangeOp, ConfigurationDocument, FieldUpdates, Fingerprint, LocateError, Locator, Node,
    NodeHandle, NodeKind, NodePath, PathKey, Segment, UserContext, BASE_FIELD,
};

/// One-off edit applied to the target node with the submitted fields
pub type CustomEdit = Arc<dyn Fn(&mut Node, &FieldUpdates) -> Result<(), String> + Send + Sync>;

/// What a command does to the node its locator points at
#[derive(Clone)]
pub enum Mutation {
    /// Set attributes from the input fields; a `name` field renames the node
    SetAttributes,
    Rename(String),
    /// Add a child of `kind` built from the input fields
    AddChild { kind: NodeKind },
    RemoveChild(Segment),
    /// Move a child among its same-kind siblings (stage/task increment and decrement)
    MoveChild { segment: Segment, delta: isize },
    ReplaceChildren { kind: NodeKind, children: Vec<Node> },
    Custom(CustomEdit),
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::SetAttributes => write!(f, "SetAttributes"),
            Mutation::Rename(name) => write!(f, "Rename({})", name),
            Mutation::AddChild { kind } => write!(f, "AddChild({})", kind),
            Mutation::RemoveChild(segment) => write!(f, "RemoveChild({})", segment),
            Mutation::MoveChild { segment, delta } => write!(f, "MoveChild({}, {})", segment, delta),
            Mutation::ReplaceChildren { kind, children } => {
                write!(f, "ReplaceChildren({}, {} nodes)", kind, children.len())
            }
            Mutation::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Who may run a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Anyone,
    ServerAdmin,
    GroupAdmin(String),
    /// Admin of the group owning the addressed pipeline, or of the addressed template
    PipelineOrTemplateAdmin,
}

impl Authorization {
    pub fn permits(&self, user: &UserContext, locator: &Locator, document: &ConfigurationDocument) -> bool {
        let user_id = user.user_id.as_str();
        match self {
            Authorization::Anyone => true,
            Authorization::ServerAdmin => document.is_server_admin(user_id),
            Authorization::GroupAdmin(group) => document.is_group_admin(user_id, group),
            Authorization::PipelineOrTemplateAdmin => {
                if let Some(pipeline) = locator.pipeline_name() {
                    match document.group_of_pipeline(pipeline).and_then(|g| g.name()) {
                        Some(group) => document.is_group_admin(user_id, group),
                        None => document.is_server_admin(user_id),
                    }
                } else if let Some(template) = locator.template_name() {
                    document.is_template_admin(user_id, template)
                } else if let Some(group) = locator.group_name() {
                    document.is_group_admin(user_id, group)
                } else {
                    document.is_server_admin(user_id)
                }
            }
        }
    }
}

/// Which node is reported back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// The addressed node, following a rename
    Target,
    Child(Segment),
    /// The node created by `AddChild`
    Created,
    Parent,
    Root,
}

/// Part of the base document a command depends on beyond its own edits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Any upstream change inside the subtree invalidates the command
    Subtree(NodePath),
    /// The set and order of `kind` children under `parent` must be unchanged
    ChildOrder { parent: NodePath, kind: NodeKind },
}

impl Claim {
    pub fn is_violated_by(&self, op: &ChangeOp) -> bool {
        match self {
            Claim::Subtree(root) => op.path().is_within(root),
            Claim::ChildOrder { parent, kind } => op.changes_children_of(parent, *kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Created,
    Located,
    Authorized,
    Mutated,
    Validated,
    Accepted,
    Rejected,
}

impl CommandState {
    pub fn can_advance_to(self, next: CommandState) -> bool {
        use CommandState::*;
        matches!(
            (self, next),
            (Created, Located)
                | (Located, Authorized)
                | (Authorized, Mutated)
                | (Mutated, Validated)
                | (Validated, Accepted)
                | (Created | Located | Authorized | Mutated | Validated, Rejected)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Accepted | CommandState::Rejected)
    }
}

/// Tracks one execution attempt of a command
#[derive(Debug)]
pub struct CommandLifecycle {
    state: CommandState,
}

impl Default for CommandLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandLifecycle {
    pub fn new() -> Self {
        Self {
            state: CommandState::Created,
        }
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn advance(&mut self, next: CommandState) -> Result<(), CommandError> {
        if !self.state.can_advance_to(next) {
            return Err(CommandError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("illegal command transition from {from:?} to {to:?}")]
    IllegalTransition { from: CommandState, to: CommandState },
    #[error(transparent)]
    Locate(#[from] LocateError),
    #[error("command has no mutation")]
    MissingMutation,
}

/// A single configuration edit, executed once by the coordinator
pub trait UpdateCommand: Send + Sync {
    fn locator(&self) -> &Locator;

    /// Fingerprint of the document the editor loaded
    fn based_on(&self) -> Option<&Fingerprint>;

    fn authorize(&self, user: &UserContext, document: &ConfigurationDocument) -> bool;

    fn locate(&self, document: &ConfigurationDocument) -> Result<NodeHandle, LocateError> {
        self.locator().resolve(document)
    }

    /// Mutate the located node and validate the whole document
    fn apply(
        &self,
        document: &mut ConfigurationDocument,
        target: &NodeHandle,
        validator: &Validator,
    ) -> Vec<ValidationError>;

    /// Node reported back after `apply` (or on conflict)
    fn subject(&self, document: &ConfigurationDocument) -> Option<Node>;

    /// Dependencies on the base document that its own diff does not express
    fn footprint(&self, _document: &ConfigurationDocument, target: &NodeHandle) -> Vec<Claim> {
        task_index_claims(target.path())
    }

    fn describe(&self) -> String;
}

/// A task addressed by index depends on its siblings staying in place
fn task_index_claims(path: &NodePath) -> Vec<Claim> {
    let keys = path.keys();
    (0..keys.len())
        .filter(|&depth| keys[depth].kind == NodeKind::Task)
        .map(|depth| Claim::ChildOrder {
            parent: NodePath::root().descend(&keys[..depth]),
            kind: NodeKind::Task,
        })
        .collect()
}

/// Generic update command built from a locator, a mutation and form fields
#[derive(Debug, Clone)]
pub struct ConfigUpdate {
    locator: Locator,
    mutation: Mutation,
    authorization: Authorization,
    subject: Subject,
    input: FieldUpdates,
    based_on: Option<Fingerprint>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdateBuilder {
    locator: Locator,
    mutation: Option<Mutation>,
    authorization: Option<Authorization>,
    subject: Option<Subject>,
    input: FieldUpdates,
    based_on: Option<Fingerprint>,
}

impl ConfigUpdateBuilder {
    pub fn locator(mut self, locator: Locator) -> Self {
        self.locator = locator;
        self
    }

    pub fn mutation(mut self, mutation: Mutation) -> Self {
        self.mutation = Some(mutation);
        self
    }

    pub fn authorization(mut self, authorization: Authorization) -> Self {
        self.authorization = Some(authorization);
        self
    }

    pub fn subject(mut self, subject: Subject) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn input(mut self, input: FieldUpdates) -> Self {
        self.input = input;
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.input.insert(key.into(), value.into());
        self
    }

    pub fn based_on(mut self, fingerprint: Option<Fingerprint>) -> Self {
        self.based_on = fingerprint;
        self
    }

    pub fn build(self) -> Result<ConfigUpdate, CommandError> {
        let mutation = self.mutation.ok_or(CommandError::MissingMutation)?;
        let subject = self.subject.unwrap_or(match &mutation {
            Mutation::AddChild { .. } => Subject::Created,
            Mutation::RemoveChild(_) | Mutation::MoveChild { .. } => Subject::Parent,
            _ => Subject::Target,
        });
        Ok(ConfigUpdate {
            locator: self.locator,
            mutation,
            authorization: self.authorization.unwrap_or(Authorization::PipelineOrTemplateAdmin),
            subject,
            input: self.input,
            based_on: self.based_on,
        })
    }
}

impl ConfigUpdate {
    pub fn builder() -> ConfigUpdateBuilder {
        ConfigUpdateBuilder::default()
    }

    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    pub fn input(&self) -> &FieldUpdates {
        &self.input
    }

    /// Locator of the node actually touched: the child for remove and move
    fn effective_locator(&self) -> Locator {
        match &self.mutation {
            Mutation::RemoveChild(segment) | Mutation::MoveChild { segment, .. } => {
                self.locator.child(segment.clone())
            }
            _ => self.locator.clone(),
        }
    }

    /// Removing or moving a pipeline is checked against the pipeline's owning group
    fn authorization_locator(&self) -> Locator {
        match &self.mutation {
            Mutation::RemoveChild(segment) | Mutation::MoveChild { segment, .. }
                if segment.kind() == NodeKind::Pipeline =>
            {
                self.effective_locator()
            }
            _ => self.locator.clone(),
        }
    }

    /// New name requested by this command, if any
    fn new_name(&self) -> Option<&str> {
        match &self.mutation {
            Mutation::Rename(name) => Some(name.as_str()),
            Mutation::SetAttributes => self.input.get("name").map(|n| n.as_str()),
            _ => None,
        }
    }

    fn mutate(
        &self,
        document: &mut ConfigurationDocument,
        target: &NodeHandle,
    ) -> Result<(), (NodeHandle, ValidationErrorType, String)> {
        let refuse = |handle: &NodeHandle, error_type, message: String| {
            Err((handle.clone(), error_type, message))
        };

        match &self.mutation {
            Mutation::SetAttributes | Mutation::Rename(_) => {
                if let Some(new_name) = self.new_name() {
                    if let Some(message) = self.rename_blocked(document, target, new_name) {
                        return refuse(target, ValidationErrorType::ParameterInUse, message);
                    }
                }
                let Some(node) = target.get_mut(document) else {
                    return refuse(target, ValidationErrorType::InvalidEdit, "target vanished".to_string());
                };
                if let Some(new_name) = self.new_name() {
                    if !node.kind.is_named() {
                        return refuse(
                            target,
                            ValidationErrorType::InvalidEdit,
                            format!("A {} has no name", node.kind),
                        );
                    }
                    node.name = Some(new_name.to_string());
                }
                if matches!(self.mutation, Mutation::SetAttributes) {
                    for (key, value) in self.input.iter().filter(|(k, _)| k.as_str() != "name") {
                        node.set_attr(key, value);
                    }
                }
                Ok(())
            }

            Mutation::AddChild { kind } => {
                let mut child = Node::new(*kind);
                for (key, value) in &self.input {
                    if key == "name" && kind.is_named() {
                        child.name = Some(value.clone());
                    } else {
                        child.set_attr(key, value);
                    }
                }
                let Some(node) = target.get_mut(document) else {
                    return refuse(target, ValidationErrorType::InvalidEdit, "target vanished".to_string());
                };
                node.children.push(child);
                Ok(())
            }

            Mutation::RemoveChild(_) => {
                if let Some(message) = self.removal_blocked(document, target) {
                    return refuse(target, ValidationErrorType::ParameterInUse, message);
                }
                let (Some(parent_handle), Some(index)) = (target.parent(), target.index()) else {
                    return refuse(target, ValidationErrorType::InvalidEdit, "cannot remove the root".to_string());
                };
                match parent_handle.get_mut(document) {
                    Some(parent) if index < parent.children.len() => {
                        parent.children.remove(index);
                        Ok(())
                    }
                    _ => refuse(target, ValidationErrorType::InvalidEdit, "target vanished".to_string()),
                }
            }

            Mutation::MoveChild { segment, delta } => {
                let (Some(parent_handle), Some(index)) = (target.parent(), target.index()) else {
                    return refuse(target, ValidationErrorType::InvalidEdit, "cannot move the root".to_string());
                };
                let Some(parent) = parent_handle.get_mut(document) else {
                    return refuse(target, ValidationErrorType::InvalidEdit, "target vanished".to_string());
                };
                let kind = segment.kind();
                let siblings: Vec<usize> = parent
                    .children
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.kind == kind)
                    .map(|(i, _)| i)
                    .collect();
                let position = siblings.iter().position(|&i| i == index).unwrap_or(0);
                let destination = (position as isize)
                    .checked_add(*delta)
                    .filter(|d| (0..siblings.len() as isize).contains(d));
                let Some(destination) = destination else {
                    return refuse(
                        target,
                        ValidationErrorType::InvalidEdit,
                        format!("Cannot move {} by {}", segment, delta),
                    );
                };
                let node = parent.children.remove(index);
                parent.children.insert(siblings[destination as usize], node);
                Ok(())
            }

            Mutation::ReplaceChildren { kind, children } => {
                let Some(node) = target.get_mut(document) else {
                    return refuse(target, ValidationErrorType::InvalidEdit, "target vanished".to_string());
                };
                let insert_at = node
                    .children
                    .iter()
                    .position(|c| c.kind == *kind)
                    .unwrap_or(node.children.len());
                node.children.retain(|c| c.kind != *kind);
                let insert_at = insert_at.min(node.children.len());
                node.children
                    .splice(insert_at..insert_at, children.iter().cloned());
                Ok(())
            }

            Mutation::Custom(edit) => {
                let Some(node) = target.get_mut(document) else {
                    return refuse(target, ValidationErrorType::InvalidEdit, "target vanished".to_string());
                };
                edit(node, &self.input)
                    .or_else(|message| refuse(target, ValidationErrorType::InvalidEdit, message))
            }
        }
    }

    /// A referenced parameter keeps its name
    fn rename_blocked(
        &self,
        document: &ConfigurationDocument,
        target: &NodeHandle,
        new_name: &str,
    ) -> Option<String> {
        let param = target.get(document)?;
        let old_name = param.name()?;
        if name_key(old_name) == name_key(new_name) {
            return None;
        }
        self.param_in_use(document, target, param)
            .then(|| format!("Cannot rename parameter '{}' because it is in use", old_name))
    }

    /// A referenced parameter cannot be removed
    fn removal_blocked(&self, document: &ConfigurationDocument, target: &NodeHandle) -> Option<String> {
        let param = target.get(document)?;
        self.param_in_use(document, target, param).then(|| {
            format!(
                "Cannot remove parameter '{}' because it is in use",
                param.name().unwrap_or_default()
            )
        })
    }

    fn param_in_use(&self, document: &ConfigurationDocument, target: &NodeHandle, param: &Node) -> bool {
        if param.kind != NodeKind::Param {
            return false;
        }
        let (Some(name), Some(owner)) = (param.name(), target.parent().and_then(|p| p.get(document).cloned())) else {
            return false;
        };
        match owner.kind {
            NodeKind::Pipeline => is_parameter_in_use(document, &owner, name),
            _ => parameter_references_in(&owner)
                .iter()
                .any(|p| name_key(p) == name_key(name)),
        }
    }

    /// Children are appended, so the created node is the last matching one
    fn created_node(&self, document: &ConfigurationDocument) -> Option<Node> {
        let Mutation::AddChild { kind } = &self.mutation else {
            return None;
        };
        let parent = self.locator.resolve(document).ok()?.get(document)?;
        let candidates = parent.children_of(*kind);
        if kind.is_named() {
            let name = self.input.get("name")?;
            candidates.filter(|c| c.has_name(name)).last().cloned()
        } else {
            candidates.last().cloned()
        }
    }
}

impl UpdateCommand for ConfigUpdate {
    fn locator(&self) -> &Locator {
        &self.locator
    }

    fn based_on(&self) -> Option<&Fingerprint> {
        self.based_on.as_ref()
    }

    fn authorize(&self, user: &UserContext, document: &ConfigurationDocument) -> bool {
        self.authorization.permits(user, &self.authorization_locator(), document)
    }

    fn locate(&self, document: &ConfigurationDocument) -> Result<NodeHandle, LocateError> {
        self.effective_locator().resolve(document)
    }

    fn apply(
        &self,
        document: &mut ConfigurationDocument,
        target: &NodeHandle,
        validator: &Validator,
    ) -> Vec<ValidationError> {
        if let Err((handle, error_type, message)) = self.mutate(document, target) {
            document.clear_errors();
            if let Some(node) = handle.get_mut(document) {
                node.add_error(BASE_FIELD, message.clone());
            }
            return vec![ValidationError {
                path: handle.path().clone(),
                field: BASE_FIELD.to_string(),
                error_type,
                message,
            }];
        }
        validator.validate(document)
    }

    fn subject(&self, document: &ConfigurationDocument) -> Option<Node> {
        let locator = match &self.subject {
            Subject::Root => return Some(document.root.clone()),
            Subject::Target => match self.new_name() {
                Some(name) => self.effective_locator().with_last_renamed(name),
                None => self.effective_locator(),
            },
            Subject::Child(segment) => self.effective_locator().child(segment.clone()),
            Subject::Created => return self.created_node(document),
            Subject::Parent => self.effective_locator().parent()?,
        };
        locator
            .resolve(document)
            .ok()
            .and_then(|handle| handle.get(document).cloned())
    }

    fn footprint(&self, document: &ConfigurationDocument, target: &NodeHandle) -> Vec<Claim> {
        let mut claims = task_index_claims(target.path());
        match &self.mutation {
            Mutation::MoveChild { segment, .. } => {
                if let Some(parent) = target.path().parent() {
                    claims.push(Claim::ChildOrder {
                        parent,
                        kind: segment.kind(),
                    });
                }
            }
            Mutation::ReplaceChildren { kind, .. } => {
                if let Some(node) = target.get(document) {
                    claims.extend(
                        node.children_of(*kind)
                            .enumerate()
                            .map(|(i, child)| Claim::Subtree(target.path().child(PathKey::of(child, i)))),
                    );
                }
                claims.push(Claim::ChildOrder {
                    parent: target.path().clone(),
                    kind: *kind,
                });
            }
            Mutation::Custom(_) => claims.push(Claim::Subtree(target.path().clone())),
            _ => {}
        }
        claims
    }

    fn describe(&self) -> String {
        format!("{:?} at {}", self.mutation, self.locator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SecuritySettings;

    fn document() -> ConfigurationDocument {
        let mut doc = ConfigurationDocument::new();
        doc.root.children.push(
            Node::named(NodeKind::Group, "first")
                .with_attr("admins", "alice")
                .with_child(
                    Node::named(NodeKind::Pipeline, "p1")
                        .with_child(Node::named(NodeKind::Param, "tool").with_attr("value", "make"))
                        .with_child(
                            Node::named(NodeKind::Stage, "build").with_child(
                                Node::named(NodeKind::Job, "compile")
                                    .with_child(Node::new(NodeKind::Task).with_attr("command", "#{tool}"))
                                    .with_child(Node::new(NodeKind::Task).with_attr("command", "test")),
                            ),
                        )
                        .with_child(Node::named(NodeKind::Stage, "deploy")),
                ),
        );
        doc
    }

    fn run(command: &ConfigUpdate, doc: &mut ConfigurationDocument) -> Vec<ValidationError> {
        let handle = command.locate(doc).expect("command should locate");
        command.apply(doc, &handle, &Validator::default())
    }

    #[test]
    fn test_set_attributes_and_rename_follow_subject() {
        let command = ConfigUpdate::builder()
            .locator(Locator::root().pipeline("p1").stage("deploy"))
            .mutation(Mutation::SetAttributes)
            .field("name", "ship")
            .field("approval", "manual")
            .build()
            .unwrap();

        let mut doc = document();
        assert!(run(&command, &mut doc).is_empty());
        let subject = command.subject(&doc).expect("renamed stage");
        assert_eq!(subject.name(), Some("ship"));
        assert_eq!(subject.attr("approval"), Some("manual"));
    }

    #[test]
    fn test_add_child_reports_created_node() {
        let command = ConfigUpdate::builder()
            .locator(Locator::root().pipeline("p1").stage("build").job("compile"))
            .mutation(Mutation::AddChild { kind: NodeKind::Task })
            .field("command", "package")
            .build()
            .unwrap();

        let mut doc = document();
        assert!(run(&command, &mut doc).is_empty());
        assert_eq!(command.subject(&doc).unwrap().attr("command"), Some("package"));
    }

    #[test]
    fn test_add_duplicate_stage_fails_validation() {
        let command = ConfigUpdate::builder()
            .locator(Locator::root().pipeline("p1"))
            .mutation(Mutation::AddChild { kind: NodeKind::Stage })
            .field("name", "Build")
            .build()
            .unwrap();

        let mut doc = document();
        let errors = run(&command, &mut doc);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, ValidationErrorType::DuplicateName);
        assert!(command.subject(&doc).unwrap().errors.contains_key("name"));
    }

    #[test]
    fn test_remove_child_and_missing_child() {
        let command = ConfigUpdate::builder()
            .locator(Locator::root().pipeline("p1"))
            .mutation(Mutation::RemoveChild(Segment::Stage("deploy".to_string())))
            .build()
            .unwrap();

        let mut doc = document();
        assert!(run(&command, &mut doc).is_empty());
        assert!(doc.pipeline("p1").unwrap().child(NodeKind::Stage, "deploy").is_none());
        assert!(command.locate(&doc).is_err());
    }

    #[test]
    fn test_parameter_in_use_cannot_be_removed_or_renamed() {
        let remove = ConfigUpdate::builder()
            .locator(Locator::root().pipeline("p1"))
            .mutation(Mutation::RemoveChild(Segment::Param("tool".to_string())))
            .build()
            .unwrap();
        let mut doc = document();
        let errors = run(&remove, &mut doc);
        assert_eq!(errors[0].error_type, ValidationErrorType::ParameterInUse);
        assert!(doc.pipeline("p1").unwrap().child(NodeKind::Param, "tool").is_some());

        let rename = ConfigUpdate::builder()
            .locator(Locator::root().pipeline("p1").param("tool"))
            .mutation(Mutation::Rename("builder".to_string()))
            .build()
            .unwrap();
        let mut doc = document();
        let errors = run(&rename, &mut doc);
        assert_eq!(errors[0].error_type, ValidationErrorType::ParameterInUse);
        assert!(doc.pipeline("p1").unwrap().child(NodeKind::Param, "tool").unwrap().errors.contains_key(BASE_FIELD));
    }

    #[test]
    fn test_move_stage_and_bounds() {
        let down = ConfigUpdate::builder()
            .locator(Locator::root().pipeline("p1"))
            .mutation(Mutation::MoveChild {
                segment: Segment::Stage("build".to_string()),
                delta: 1,
            })
            .build()
            .unwrap();
        let mut doc = document();
        assert!(run(&down, &mut doc).is_empty());
        let stages: Vec<_> = doc
            .pipeline("p1")
            .unwrap()
            .children_of(NodeKind::Stage)
            .filter_map(|s| s.name())
            .collect();
        assert_eq!(stages, vec!["deploy", "build"]);

        // build is now last
        let errors = run(&down, &mut doc);
        assert_eq!(errors[0].error_type, ValidationErrorType::InvalidEdit);
    }

    #[test]
    fn test_move_by_extreme_delta_is_refused() {
        let mut doc = document();
        for delta in [isize::MAX, isize::MIN] {
            let command = ConfigUpdate::builder()
                .locator(Locator::root().pipeline("p1"))
                .mutation(Mutation::MoveChild {
                    segment: Segment::Stage("deploy".to_string()),
                    delta,
                })
                .build()
                .unwrap();
            let errors = run(&command, &mut doc);
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].error_type, ValidationErrorType::InvalidEdit);
        }
    }

    #[test]
    fn test_replace_children_keeps_other_kinds() {
        let command = ConfigUpdate::builder()
            .locator(Locator::root().pipeline("p1").stage("build").job("compile"))
            .mutation(Mutation::ReplaceChildren {
                kind: NodeKind::Task,
                children: vec![Node::new(NodeKind::Task).with_attr("command", "bazel build")],
            })
            .build()
            .unwrap();
        let mut doc = document();
        assert!(run(&command, &mut doc).is_empty());
        let job = command.subject(&doc).unwrap();
        assert_eq!(job.children.len(), 1);
        assert_eq!(job.children[0].attr("command"), Some("bazel build"));
    }

    #[test]
    fn test_custom_edit_error_is_reported() {
        let command = ConfigUpdate::builder()
            .locator(Locator::root().pipeline("p1"))
            .mutation(Mutation::Custom(Arc::new(|_node, _input| Err("locked".to_string()))))
            .build()
            .unwrap();
        let mut doc = document();
        let errors = run(&command, &mut doc);
        assert_eq!(errors[0].message, "locked");
        assert_eq!(errors[0].error_type, ValidationErrorType::InvalidEdit);
    }

    #[test]
    fn test_authorization_uses_owning_group() {
        let command = ConfigUpdate::builder()
            .locator(Locator::root().pipeline("p1"))
            .mutation(Mutation::SetAttributes)
            .build()
            .unwrap();
        let doc = document().with_security(SecuritySettings {
            enabled: true,
            admins: vec!["root".to_string()],
        });
        assert!(command.authorize(&UserContext::new("alice"), &doc));
        assert!(command.authorize(&UserContext::new("root"), &doc));
        assert!(!command.authorize(&UserContext::new("mallory"), &doc));
        assert!(!command.authorize(&UserContext::anonymous(), &doc));
    }

    #[test]
    fn test_task_locator_claims_sibling_order() {
        let command = ConfigUpdate::builder()
            .locator(Locator::root().pipeline("p1").stage("build").job("compile").task(1))
            .mutation(Mutation::SetAttributes)
            .field("command", "cargo test")
            .build()
            .unwrap();
        let doc = document();
        let handle = command.locate(&doc).unwrap();
        let claims = command.footprint(&doc, &handle);
        assert_eq!(
            claims,
            vec![Claim::ChildOrder {
                parent: handle.path().parent().unwrap(),
                kind: NodeKind::Task,
            }]
        );
    }

    #[test]
    fn test_pipeline_removal_is_authorized_by_owning_group() {
        let command = ConfigUpdate::builder()
            .locator(Locator::root())
            .mutation(Mutation::RemoveChild(Segment::Pipeline("p1".to_string())))
            .build()
            .unwrap();
        let doc = document().with_security(SecuritySettings {
            enabled: true,
            admins: vec!["root".to_string()],
        });
        assert!(command.authorize(&UserContext::new("alice"), &doc));
        assert!(command.authorize(&UserContext::new("root"), &doc));
        assert!(!command.authorize(&UserContext::new("mallory"), &doc));
    }

    #[test]
    fn test_task_order_claim_ignores_sibling_edits() {
        let doc = document();
        let job = Locator::root().pipeline("p1").stage("build").job("compile");
        let command = ConfigUpdate::builder()
            .locator(job.clone().task(0))
            .mutation(Mutation::SetAttributes)
            .field("command", "make all")
            .build()
            .unwrap();
        let handle = command.locate(&doc).unwrap();
        let claims = command.footprint(&doc, &handle);
        let sibling = job.task(1).resolve(&doc).unwrap().path().clone();
        let parent = sibling.parent().unwrap();

        let edited = ChangeOp::PatchNode {
            path: sibling.clone(),
            field_changes: Default::default(),
        };
        assert!(!claims.iter().any(|c| c.is_violated_by(&edited)));

        let removed = ChangeOp::RemoveNode { path: sibling };
        assert!(claims.iter().any(|c| c.is_violated_by(&removed)));

        let reordered = ChangeOp::ReorderChildren {
            path: parent,
            kind: NodeKind::Task,
        };
        assert!(claims.iter().any(|c| c.is_violated_by(&reordered)));
    }

    #[test]
    fn test_lifecycle_refuses_illegal_transitions() {
        let mut lifecycle = CommandLifecycle::new();
        assert!(lifecycle.advance(CommandState::Mutated).is_err());
        lifecycle.advance(CommandState::Located).unwrap();
        lifecycle.advance(CommandState::Authorized).unwrap();
        lifecycle.advance(CommandState::Mutated).unwrap();
        lifecycle.advance(CommandState::Validated).unwrap();
        lifecycle.advance(CommandState::Accepted).unwrap();
        assert!(lifecycle.state().is_terminal());
        assert!(lifecycle.advance(CommandState::Rejected).is_err());
    }

    #[test]
    fn test_build_requires_mutation() {
        assert!(matches!(
            ConfigUpdate::builder().build(),
            Err(CommandError::MissingMutation)
        ));
    }
}
