use std::sync::Arc;

use indexmap::IndexMap;

use super::Fragments;
use super::TYPENAME;
use crate::error::CompileError;
use crate::ir::Expr;
use crate::json_ext::Path;
use crate::spec::ExtractedField;
use crate::spec::FieldDefinition;
use crate::spec::Schema;
use crate::spec::Variables;
use crate::value::Value;

// The RECURSION_LIMIT is chosen to be:
//   < # expected to cause stack overflow &&
//   > # expected in a legitimate selection
const RECURSION_LIMIT: usize = 512;

/// An argument as written in the selection.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentValue {
    Literal(Value),
    Variable(String),
}

impl ArgumentValue {
    /// The value of this argument, `None` when it names a variable that was not provided.
    pub fn resolve(&self, variables: &Variables) -> Option<Value> {
        match self {
            ArgumentValue::Literal(value) => Some(value.clone()),
            ArgumentValue::Variable(name) => variables.get(name).cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub name: String,
    pub arguments: IndexMap<String, ArgumentValue>,
}

impl Directive {
    pub fn new(name: impl Into<String>) -> Self {
        Directive {
            name: name.into(),
            arguments: IndexMap::new(),
        }
    }

    pub fn argument(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments
            .insert(name.into(), ArgumentValue::Literal(value.into()));
        self
    }

    pub fn variable_argument(
        mut self,
        name: impl Into<String>,
        variable: impl Into<String>,
    ) -> Self {
        self.arguments
            .insert(name.into(), ArgumentValue::Variable(variable.into()));
        self
    }

    pub fn include(condition: ArgumentValue) -> Self {
        let mut directive = Directive::new("include");
        directive.arguments.insert("if".to_string(), condition);
        directive
    }

    pub fn skip(condition: ArgumentValue) -> Self {
        let mut directive = Directive::new("skip");
        directive.arguments.insert("if".to_string(), condition);
        directive
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Scalar,
    ObjectProjection,
    ListProjection,
    /// An object field whose resolver picks one element of a collection.
    CollectionToSingle,
    /// A raw input of a service-backed field, fetched during the first phase.
    Extracted(ExtractedField),
    FragmentSpread {
        name: String,
    },
    InlineFragment {
        type_condition: Option<String>,
    },
    MutationField,
    SubscriptionField,
}

/// A node of the requested selection graph.
#[derive(Debug, Clone)]
pub struct SelectionNode {
    /// Response key.
    pub name: String,
    pub field: Option<Arc<FieldDefinition>>,
    pub arguments: IndexMap<String, ArgumentValue>,
    pub directives: Vec<Directive>,
    pub kind: NodeKind,
    pub children: Vec<SelectionNode>,
    /// Set on nodes realized from a fragment.
    pub type_condition: Option<String>,
    /// Concrete types of an interface or union field.
    pub possible_root_types: Vec<String>,
    requires_services: bool,
}

impl SelectionNode {
    fn new(name: String, kind: NodeKind) -> Self {
        SelectionNode {
            name,
            field: None,
            arguments: IndexMap::new(),
            directives: Vec::new(),
            kind,
            children: Vec::new(),
            type_condition: None,
            possible_root_types: Vec::new(),
            requires_services: false,
        }
    }

    /// Selects `field` on `type_name`.
    pub fn field(schema: &Schema, type_name: &str, field: &str) -> Result<Self, CompileError> {
        let definition =
            schema
                .field(type_name, field)
                .cloned()
                .ok_or_else(|| CompileError::UnknownField {
                    type_name: type_name.to_string(),
                    field: field.to_string(),
                })?;
        Ok(Self::from_definition(schema, definition))
    }

    pub(crate) fn from_definition(schema: &Schema, field: Arc<FieldDefinition>) -> Self {
        let kind = Self::kind_of(schema, &field);
        let mut node = SelectionNode::new(field.name.clone(), kind);
        if let Some(inner) = field.ty.inner_type_name() {
            if schema.is_abstract(inner) {
                node.possible_root_types = schema.possible_types(inner);
            }
        }
        node.requires_services = field.requires_services();
        node.field = Some(field);
        node
    }

    fn kind_of(schema: &Schema, field: &FieldDefinition) -> NodeKind {
        use crate::spec::RootOperation;

        match &field.operation {
            Some(RootOperation::Mutation(_)) => return NodeKind::MutationField,
            Some(RootOperation::Subscription(_)) => return NodeKind::SubscriptionField,
            None => {}
        }
        let composite = field
            .ty
            .inner_type_name()
            .map(|name| schema.is_composite(name))
            .unwrap_or(false);
        if !composite {
            NodeKind::Scalar
        } else if field.ty.is_list() {
            NodeKind::ListProjection
        } else if field.resolve.as_first().is_some() {
            NodeKind::CollectionToSingle
        } else {
            NodeKind::ObjectProjection
        }
    }

    /// The runtime type name of the parent record.
    pub fn typename() -> Self {
        SelectionNode::new(
            TYPENAME.to_string(),
            NodeKind::Extracted(ExtractedField {
                name: TYPENAME.to_string(),
                expr: Expr::parent().type_name(),
            }),
        )
    }

    pub fn fragment_spread(name: impl Into<String>) -> Self {
        let name = name.into();
        SelectionNode::new(name.clone(), NodeKind::FragmentSpread { name })
    }

    pub fn inline_fragment(type_condition: Option<&str>) -> Self {
        SelectionNode::new(
            String::new(),
            NodeKind::InlineFragment {
                type_condition: type_condition.map(str::to_string),
            },
        )
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.name = alias.into();
        self
    }

    pub fn argument(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments
            .insert(name.into(), ArgumentValue::Literal(value.into()));
        self
    }

    pub fn variable_argument(
        mut self,
        name: impl Into<String>,
        variable: impl Into<String>,
    ) -> Self {
        self.arguments
            .insert(name.into(), ArgumentValue::Variable(variable.into()));
        self
    }

    pub fn directive(mut self, directive: Directive) -> Self {
        self.directives.push(directive);
        self
    }

    pub fn child(mut self, child: SelectionNode) -> Self {
        if child.requires_services {
            self.mark_requires_services();
        }
        self.children.push(child);
        self
    }

    pub fn children(self, children: impl IntoIterator<Item = SelectionNode>) -> Self {
        children.into_iter().fold(self, SelectionNode::child)
    }

    /// Whether this node or a direct selection below it needs injected services.
    ///
    /// Fragment spreads are only resolved by [`SelectionNode::has_services_at_or_below`].
    pub fn requires_services(&self) -> bool {
        self.requires_services
    }

    pub fn mark_requires_services(&mut self) {
        self.requires_services = true;
    }

    /// The field's own resolver needs injected services.
    pub(crate) fn field_requires_services(&self) -> bool {
        self.field
            .as_ref()
            .map(|field| field.requires_services())
            .unwrap_or(false)
    }

    /// This selection over another definition of its field.
    pub(crate) fn with_field(&self, field: Arc<FieldDefinition>, kind: NodeKind) -> Self {
        let mut node = self.clone();
        node.requires_services = field.requires_services()
            || node.children.iter().any(SelectionNode::requires_services);
        node.field = Some(field);
        node.kind = kind;
        node
    }

    pub fn has_services_at_or_below(&self, fragments: &Fragments) -> Result<bool, CompileError> {
        self.services_below(fragments, 0)
    }

    fn services_below(&self, fragments: &Fragments, depth: usize) -> Result<bool, CompileError> {
        if depth > RECURSION_LIMIT {
            return Err(CompileError::RecursionLimitExceeded {
                path: Path::from_slice(&[self.name.as_str()]),
            });
        }
        if self.requires_services || self.field_requires_services() {
            return Ok(true);
        }
        if let NodeKind::FragmentSpread { name } = &self.kind {
            let fragment = fragments
                .get(name)
                .ok_or_else(|| CompileError::UnknownFragment {
                    name: name.clone(),
                    path: Path::empty(),
                })?;
            for child in &fragment.selections {
                if child.services_below(fragments, depth + 1)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        for child in &self.children {
            if child.services_below(fragments, depth + 1)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The fragment-free list of children.
    ///
    /// Fragments contribute their own children tagged with their type condition. With
    /// `without_service_fields`, a child whose field needs services contributes its
    /// extracted inputs instead.
    pub fn expand(
        &self,
        fragments: &Fragments,
        without_service_fields: bool,
    ) -> Result<Vec<SelectionNode>, CompileError> {
        let mut expanded = Vec::new();
        expand_into(
            &self.children,
            fragments,
            without_service_fields,
            None,
            &[],
            &mut expanded,
            0,
        )?;
        Ok(expanded)
    }

    /// The type a realized node was selected on.
    pub(crate) fn branch_type(&self) -> Option<&str> {
        self.type_condition.as_deref().or_else(|| {
            self.field
                .as_ref()
                .map(|field| field.parent_type.as_str())
        })
    }

    fn applies_to(&self, concrete: &str, schema: &Schema) -> bool {
        match self.type_condition.as_deref() {
            None => true,
            Some(condition) => condition == concrete || schema.is_subtype(condition, concrete),
        }
    }
}

fn expand_into(
    children: &[SelectionNode],
    fragments: &Fragments,
    without_service_fields: bool,
    type_condition: Option<&str>,
    inherited: &[Directive],
    expanded: &mut Vec<SelectionNode>,
    depth: usize,
) -> Result<(), CompileError> {
    if depth > RECURSION_LIMIT {
        tracing::error!("selection processing recursion limit({RECURSION_LIMIT}) exceeded");
        return Err(CompileError::RecursionLimitExceeded {
            path: Path::empty(),
        });
    }
    for child in children {
        match &child.kind {
            NodeKind::FragmentSpread { name } => {
                let fragment = fragments
                    .get(name)
                    .ok_or_else(|| CompileError::UnknownFragment {
                        name: name.clone(),
                        path: Path::empty(),
                    })?;
                let directives = combine(inherited, &child.directives, &fragment.directives);
                expand_into(
                    &fragment.selections,
                    fragments,
                    without_service_fields,
                    Some(fragment.type_condition.as_str()),
                    &directives,
                    expanded,
                    depth + 1,
                )?;
            }
            NodeKind::InlineFragment {
                type_condition: condition,
            } => {
                let directives = combine(inherited, &child.directives, &[]);
                expand_into(
                    &child.children,
                    fragments,
                    without_service_fields,
                    condition.as_deref().or(type_condition),
                    &directives,
                    expanded,
                    depth + 1,
                )?;
            }
            _ if without_service_fields && child.field_requires_services() => {
                let extracted = child
                    .field
                    .iter()
                    .flat_map(|field| field.extracted.iter());
                for field in extracted {
                    if expanded.iter().any(|node| node.name == field.name) {
                        continue;
                    }
                    let mut node =
                        SelectionNode::new(field.name.clone(), NodeKind::Extracted(field.clone()));
                    node.type_condition = type_condition
                        .map(str::to_string)
                        .or_else(|| child.type_condition.clone());
                    expanded.push(node);
                }
            }
            _ => {
                let mut node = child.clone();
                if let Some(condition) = type_condition {
                    node.type_condition.get_or_insert_with(|| condition.to_string());
                }
                if !inherited.is_empty() {
                    node.directives = combine(inherited, &child.directives, &[]);
                }
                expanded.push(node);
            }
        }
    }
    Ok(())
}

fn combine(inherited: &[Directive], own: &[Directive], fragment: &[Directive]) -> Vec<Directive> {
    inherited
        .iter()
        .chain(own)
        .chain(fragment)
        .cloned()
        .collect()
}

/// The realized fields of a selection for one concrete type.
///
/// Nodes whose type condition does not apply are dropped. When two nodes share a response
/// key, the one selected on the more precise type wins; nodes selected on the same type
/// are merged; nodes selected on unrelated types are both kept.
pub(crate) fn realize_for_type(
    nodes: &[SelectionNode],
    concrete: &str,
    schema: &Schema,
) -> Vec<SelectionNode> {
    let mut realized: Vec<SelectionNode> = Vec::new();
    for node in nodes.iter().filter(|node| node.applies_to(concrete, schema)) {
        let existing = realized.iter().position(|candidate| {
            candidate.name == node.name
                && match (candidate.branch_type(), node.branch_type()) {
                    (Some(a), Some(b)) => schema.most_precise(a, b).is_some(),
                    _ => true,
                }
        });
        let Some(index) = existing else {
            realized.push(node.clone());
            continue;
        };
        let current = &mut realized[index];
        let (Some(kept), Some(incoming)) = (current.branch_type(), node.branch_type()) else {
            current.children.extend(node.children.iter().cloned());
            continue;
        };
        if kept == incoming {
            current.children.extend(node.children.iter().cloned());
            if node.requires_services {
                current.mark_requires_services();
            }
        } else if schema.most_precise(kept, incoming) == Some(incoming) {
            *current = node.clone();
        }
    }
    realized
}
