use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::model::{
    name_key, ConfigurationDocument, Node, NodeKind, NodePath, PathKey, BASE_FIELD,
};

pub const MAX_NAME_LENGTH: usize = 255;

/// Task type used when a task carries no `type` attribute
pub const DEFAULT_TASK_TYPE: &str = "exec";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub path: NodePath,
    pub field: String,
    pub error_type: ValidationErrorType,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorType {
    MissingName,
    InvalidName,
    DuplicateName,
    InvalidPlacement,
    UnknownTaskType,
    MissingRequiredField,
    UnknownTemplate,
    TemplateWithStages,
    UndefinedParameter,
    ParameterInUse,
    /// The requested edit itself could not be carried out
    InvalidEdit,
}

struct Finding {
    indices: Vec<usize>,
    error: ValidationError,
}

#[derive(Default)]
struct Findings(Vec<Finding>);

impl Findings {
    fn push(
        &mut self,
        indices: &[usize],
        path: &NodePath,
        field: &str,
        error_type: ValidationErrorType,
        message: String,
    ) {
        self.0.push(Finding {
            indices: indices.to_vec(),
            error: ValidationError {
                path: path.clone(),
                field: field.to_string(),
                error_type,
                message,
            },
        });
    }
}

/// Domain validation of a whole configuration document
#[derive(Debug, Clone)]
pub struct Validator {
    task_types: Vec<String>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(["exec", "ant", "nant", "rake", "fetch"])
    }
}

impl Validator {
    pub fn new<I, T>(task_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            task_types: task_types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn task_types(&self) -> &[String] {
        &self.task_types
    }

    /// Clear previous errors, validate the full document and attach new errors to the offending nodes
    pub fn validate(&self, document: &mut ConfigurationDocument) -> Vec<ValidationError> {
        document.clear_errors();

        let mut findings = Findings::default();
        self.check_children(
            document,
            &document.root,
            &NodePath::root(),
            &mut Vec::new(),
            None,
            &mut findings,
        );
        Self::check_pipeline_names(document, &mut findings);

        for finding in &findings.0 {
            if let Some(node) = node_at_mut(&mut document.root, &finding.indices) {
                node.add_error(&finding.error.field, finding.error.message.clone());
            }
        }
        findings.0.into_iter().map(|f| f.error).collect()
    }

    fn check_children(
        &self,
        document: &ConfigurationDocument,
        node: &Node,
        path: &NodePath,
        indices: &mut Vec<usize>,
        params: Option<&BTreeSet<String>>,
        findings: &mut Findings,
    ) {
        let mut seen: HashSet<(NodeKind, String)> = HashSet::new();
        let mut task_position = 0;

        for (i, child) in node.children.iter().enumerate() {
            indices.push(i);
            let key = if child.kind == NodeKind::Task {
                task_position += 1;
                PathKey::task(task_position - 1)
            } else {
                PathKey::of(child, i)
            };
            let child_path = path.child(key);

            if !node.kind.can_contain(child.kind) {
                findings.push(
                    indices,
                    &child_path,
                    BASE_FIELD,
                    ValidationErrorType::InvalidPlacement,
                    format!("A {} cannot be placed inside a {}", child.kind, node.kind),
                );
            }

            if child.kind.is_named() {
                Self::check_name(child, indices, &child_path, findings);
                // Pipelines are checked for uniqueness across all groups
                if child.kind != NodeKind::Pipeline {
                    if let Some(name) = child.name().filter(|n| !n.is_empty()) {
                        if !seen.insert((child.kind, name_key(name))) {
                            findings.push(
                                indices,
                                &child_path,
                                "name",
                                ValidationErrorType::DuplicateName,
                                format!(
                                    "You have defined multiple {}s called '{}'. {} names are case-insensitive and must be unique.",
                                    child.kind,
                                    name,
                                    capitalize(child.kind.label())
                                ),
                            );
                        }
                    }
                }
            }

            if child.kind == NodeKind::Task {
                self.check_task(child, indices, &child_path, findings);
            }

            if child.kind != NodeKind::Param {
                if let Some(declared) = params {
                    Self::check_parameter_references(child, declared, indices, &child_path, findings);
                }
            }

            if child.kind == NodeKind::Pipeline {
                let declared = declared_params(child);
                Self::check_pipeline(document, child, &declared, indices, &child_path, findings);
                self.check_children(document, child, &child_path, indices, Some(&declared), findings);
            } else {
                self.check_children(document, child, &child_path, indices, params, findings);
            }

            indices.pop();
        }
    }

    fn check_name(node: &Node, indices: &[usize], path: &NodePath, findings: &mut Findings) {
        match node.name() {
            None | Some("") => findings.push(
                indices,
                path,
                "name",
                ValidationErrorType::MissingName,
                format!("{} name cannot be empty", capitalize(node.kind.label())),
            ),
            Some(name) if !is_valid_name(name) => findings.push(
                indices,
                path,
                "name",
                ValidationErrorType::InvalidName,
                format!(
                    "Invalid {} name '{}'. This must be alphanumeric and can contain underscores, hyphens and periods (however, it cannot start with a period). The maximum allowed length is {} characters.",
                    node.kind, name, MAX_NAME_LENGTH
                ),
            ),
            Some(_) => {}
        }
    }

    fn check_task(&self, task: &Node, indices: &[usize], path: &NodePath, findings: &mut Findings) {
        let task_type = task.attr("type").unwrap_or(DEFAULT_TASK_TYPE);
        if !self.task_types.iter().any(|t| t == task_type) {
            findings.push(
                indices,
                path,
                "type",
                ValidationErrorType::UnknownTaskType,
                format!("Task type '{}' is not registered", task_type),
            );
            return;
        }

        for field in required_task_fields(task_type) {
            if task.attr(field).map_or(true, |v| v.trim().is_empty()) {
                findings.push(
                    indices,
                    path,
                    field,
                    ValidationErrorType::MissingRequiredField,
                    format!("{} task must specify '{}'", task_type, field),
                );
            }
        }
    }

    fn check_pipeline(
        document: &ConfigurationDocument,
        pipeline: &Node,
        declared: &BTreeSet<String>,
        indices: &[usize],
        path: &NodePath,
        findings: &mut Findings,
    ) {
        let Some(template_name) = pipeline.attr("template") else {
            return;
        };

        if pipeline.children_of(NodeKind::Stage).next().is_some() {
            findings.push(
                indices,
                path,
                "template",
                ValidationErrorType::TemplateWithStages,
                format!(
                    "Cannot add stages to pipeline '{}' which already references template '{}'",
                    pipeline.name().unwrap_or_default(),
                    template_name
                ),
            );
        }

        match document.template(template_name) {
            None => findings.push(
                indices,
                path,
                "template",
                ValidationErrorType::UnknownTemplate,
                format!(
                    "Pipeline '{}' refers to non-existent template '{}'",
                    pipeline.name().unwrap_or_default(),
                    template_name
                ),
            ),
            Some(template) => {
                let missing: BTreeSet<String> = parameter_references_in(template)
                    .into_iter()
                    .filter(|p| !declared.contains(&name_key(p)))
                    .collect();
                for param in missing {
                    findings.push(
                        indices,
                        path,
                        "params",
                        ValidationErrorType::UndefinedParameter,
                        format!(
                            "Parameter '{}' used by template '{}' is not defined in pipeline '{}'",
                            param,
                            template_name,
                            pipeline.name().unwrap_or_default()
                        ),
                    );
                }
            }
        }
    }

    fn check_parameter_references(
        node: &Node,
        declared: &BTreeSet<String>,
        indices: &[usize],
        path: &NodePath,
        findings: &mut Findings,
    ) {
        for (field, value) in &node.attributes {
            for param in parameter_references(value) {
                if !declared.contains(&name_key(&param)) {
                    findings.push(
                        indices,
                        path,
                        field,
                        ValidationErrorType::UndefinedParameter,
                        format!("Parameter '{}' is not defined. All pipelines using this parameter directly or via a template must define it.", param),
                    );
                }
            }
        }
    }

    fn check_pipeline_names(document: &ConfigurationDocument, findings: &mut Findings) {
        let mut owners: HashMap<String, String> = HashMap::new();

        for (gi, group) in document.root.children.iter().enumerate() {
            if group.kind != NodeKind::Group {
                continue;
            }
            let group_name = group.name().unwrap_or_default();
            for (pi, pipeline) in group.children.iter().enumerate() {
                let Some(name) = pipeline.name().filter(|n| !n.is_empty()) else {
                    continue;
                };
                if pipeline.kind != NodeKind::Pipeline {
                    continue;
                }
                if let Some(owner) = owners.get(&name_key(name)) {
                    let path = NodePath::root()
                        .child(PathKey::of(group, gi))
                        .child(PathKey::of(pipeline, pi));
                    findings.push(
                        &[gi, pi],
                        &path,
                        "name",
                        ValidationErrorType::DuplicateName,
                        format!(
                            "You have defined multiple pipelines named '{}'. Pipeline names must be unique. Source(s): group '{}'",
                            name, owner
                        ),
                    );
                } else {
                    owners.insert(name_key(name), group_name.to_string());
                }
            }
        }
    }
}

/// Names: alphanumerics, underscores, hyphens and periods, not starting with a period
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn required_task_fields(task_type: &str) -> &'static [&'static str] {
    match task_type {
        "exec" => &["command"],
        "fetch" => &["stage", "job", "source"],
        _ => &[],
    }
}

/// `#{name}` references in a value; `##{` escapes a literal `#{`
pub fn parameter_references(value: &str) -> Vec<String> {
    let mut references = Vec::new();
    let mut rest = value;

    while let Some(start) = rest.find('#') {
        let after = &rest[start + 1..];
        if let Some(escaped) = after.strip_prefix('#') {
            rest = escaped;
            continue;
        }
        match after.strip_prefix('{').and_then(|body| body.find('}').map(|end| (body, end))) {
            Some((body, end)) => {
                references.push(body[..end].to_string());
                rest = &body[end + 1..];
            }
            None => rest = after,
        }
    }
    references
}

/// All parameter references anywhere in a subtree (excluding param declarations)
pub fn parameter_references_in(node: &Node) -> BTreeSet<String> {
    let mut references = BTreeSet::new();
    if node.kind != NodeKind::Param {
        for value in node.attributes.values() {
            references.extend(parameter_references(value));
        }
        for child in &node.children {
            references.extend(parameter_references_in(child));
        }
    }
    references
}

/// Whether any node of `pipeline` (or the template it uses) references the parameter
pub fn is_parameter_in_use(
    document: &ConfigurationDocument,
    pipeline: &Node,
    param: &str,
) -> bool {
    let key = name_key(param);
    let in_template = pipeline
        .attr("template")
        .and_then(|t| document.template(t))
        .map(parameter_references_in)
        .unwrap_or_default();
    parameter_references_in(pipeline)
        .iter()
        .chain(in_template.iter())
        .any(|p| name_key(p) == key)
}

fn declared_params(pipeline: &Node) -> BTreeSet<String> {
    pipeline
        .children_of(NodeKind::Param)
        .filter_map(|p| p.name())
        .map(name_key)
        .collect()
}

fn node_at_mut<'a>(root: &'a mut Node, indices: &[usize]) -> Option<&'a mut Node> {
    let mut node = root;
    for &i in indices {
        node = node.children.get_mut(i)?;
    }
    Some(node)
}

fn capitalize(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}
