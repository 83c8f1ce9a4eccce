use std::collections::HashMap;

use indexmap::IndexMap;

use super::Directive;
use super::FieldType;
use super::Schema;
use super::SelectionNode;
use crate::error::CompileError;
use crate::error::ExecutionError;
use crate::json_ext::Object;
use crate::value::Value;

/// Coerced operation variables.
pub type Variables = IndexMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
    FragmentDefinition,
}

#[derive(Debug, Clone)]
pub struct VariableDefinition {
    pub name: String,
    pub ty: FieldType,
    pub default: Option<Value>,
}

impl VariableDefinition {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        VariableDefinition {
            name: name.into(),
            ty,
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// One operation or fragment definition.
#[derive(Debug, Clone)]
pub struct Statement {
    pub operation_kind: OperationKind,
    pub name: Option<String>,
    pub variable_definitions: Vec<VariableDefinition>,
    pub root_selections: Vec<SelectionNode>,
    pub directives: Vec<Directive>,
    /// Only set on fragment definitions.
    pub type_condition: Option<String>,
}

impl Statement {
    fn new(operation_kind: OperationKind) -> Self {
        Statement {
            operation_kind,
            name: None,
            variable_definitions: Vec::new(),
            root_selections: Vec::new(),
            directives: Vec::new(),
            type_condition: None,
        }
    }

    pub fn query() -> Self {
        Self::new(OperationKind::Query)
    }

    pub fn mutation() -> Self {
        Self::new(OperationKind::Mutation)
    }

    pub fn subscription() -> Self {
        Self::new(OperationKind::Subscription)
    }

    pub fn fragment(name: impl Into<String>, type_condition: impl Into<String>) -> Self {
        let mut statement = Self::new(OperationKind::FragmentDefinition);
        statement.name = Some(name.into());
        statement.type_condition = Some(type_condition.into());
        statement
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn variable(mut self, definition: VariableDefinition) -> Self {
        self.variable_definitions.push(definition);
        self
    }

    pub fn select(mut self, node: SelectionNode) -> Self {
        self.root_selections.push(node);
        self
    }

    pub fn directive(mut self, directive: Directive) -> Self {
        self.directives.push(directive);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Fragment {
    pub name: String,
    pub type_condition: String,
    pub directives: Vec<Directive>,
    pub selections: Vec<SelectionNode>,
}

#[derive(Debug, Clone, Default)]
pub struct Fragments {
    map: HashMap<String, Fragment>,
}

impl Fragments {
    pub fn get(&self, name: &str) -> Option<&Fragment> {
        self.map.get(name)
    }

    pub fn insert(&mut self, fragment: Fragment) {
        self.map.insert(fragment.name.clone(), fragment);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    pub statements: Vec<Statement>,
    pub fragments: Fragments,
}

impl Document {
    /// Fragment definitions are moved to the fragment lookup.
    pub fn new(statements: impl IntoIterator<Item = Statement>) -> Self {
        let mut fragments = Fragments::default();
        let mut operations = Vec::new();
        for statement in statements {
            if statement.operation_kind != OperationKind::FragmentDefinition {
                operations.push(statement);
                continue;
            }
            let (Some(name), Some(type_condition)) = (statement.name, statement.type_condition)
            else {
                continue;
            };
            fragments.insert(Fragment {
                name,
                type_condition,
                directives: statement.directives,
                selections: statement.root_selections,
            });
        }
        Document {
            statements: operations,
            fragments,
        }
    }

    /// The operation to run: the named one, or the only one when no name is given.
    pub fn operation(&self, name: Option<&str>) -> Result<&Statement, ExecutionError> {
        match name {
            Some(name) => self
                .statements
                .iter()
                .find(|statement| statement.name.as_deref() == Some(name))
                .ok_or_else(|| ExecutionError::UnknownOperation(name.to_string())),
            None => match self.statements.as_slice() {
                [statement] => Ok(statement),
                [] => Err(ExecutionError::UnknownOperation(String::new())),
                _ => Err(ExecutionError::OperationNameRequired),
            },
        }
    }
}

/// Applies declared defaults and checks provided values against their declared types.
///
/// Variables that are not declared by the statement are ignored.
pub(crate) fn coerce_variables(
    statement: &Statement,
    provided: &Object,
    schema: &Schema,
) -> Result<Variables, CompileError> {
    let mut variables = Variables::new();
    for definition in &statement.variable_definitions {
        let value = match provided.get(definition.name.as_str()) {
            Some(value) => Value::from(value.clone()),
            None => match &definition.default {
                Some(default) => default.clone(),
                None if definition.ty.is_non_null() => {
                    return Err(CompileError::MissingVariable {
                        name: definition.name.clone(),
                    });
                }
                None => continue,
            },
        };
        definition
            .ty
            .validate_input_value(&value, schema)
            .map_err(|_| CompileError::InvalidVariable {
                name: definition.name.clone(),
                expected: definition.ty.to_string(),
            })?;
        variables.insert(definition.name.clone(), value);
    }
    Ok(variables)
}
