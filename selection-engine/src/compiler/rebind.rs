//! Rebinds the selection of a mutation or subscription field to what its resolver produced.

use std::sync::Arc;

use crate::error::CompileError;
use crate::ir::Expr;
use crate::json_ext::Path;
use crate::spec::Cardinality;
use crate::spec::DerivedView;
use crate::spec::FieldDefinition;
use crate::spec::NodeKind;
use crate::spec::OperationOutcome;
use crate::spec::Schema;
use crate::spec::SelectionNode;
use crate::value::Value;

#[derive(Debug)]
pub(crate) enum Rebound {
    /// Nothing left to select: a leaf value or null.
    Value(Value),
    /// A query field reading the outcome, with the constants it is bound to.
    Node {
        node: SelectionNode,
        constants: Vec<Value>,
    },
}

pub(crate) fn rebind(
    schema: &Schema,
    node: &SelectionNode,
    outcome: OperationOutcome,
) -> Result<Rebound, CompileError> {
    let field = node
        .field
        .as_ref()
        .ok_or_else(|| CompileError::Unsupported {
            reason: "only fields can be rebound".to_string(),
            path: Path::from_slice(&[node.name.as_str()]),
        })?;
    let composite = field
        .ty
        .inner_type_name()
        .map(|name| schema.is_composite(name))
        .unwrap_or(false);

    match outcome {
        OperationOutcome::Value(value) if !composite || value.is_null() => {
            Ok(Rebound::Value(value))
        }
        OperationOutcome::Value(value) => {
            let kind = match &value {
                Value::List(_) => NodeKind::ListProjection,
                Value::Record(_) => NodeKind::ObjectProjection,
                _ if field.ty.is_list() => NodeKind::ListProjection,
                _ => NodeKind::ObjectProjection,
            };
            Ok(Rebound::Node {
                node: node.with_field(query_field(field, Expr::constant(0)), kind),
                constants: vec![value],
            })
        }
        OperationOutcome::View(DerivedView { expr, cardinality }) => {
            let (resolve, kind) = match cardinality {
                Cardinality::Many if field.ty.is_list() => (expr, NodeKind::ListProjection),
                Cardinality::Many => (expr.first(), NodeKind::CollectionToSingle),
                Cardinality::One => (expr, NodeKind::ObjectProjection),
            };
            let kind = if composite { kind } else { NodeKind::Scalar };
            Ok(Rebound::Node {
                node: node.with_field(query_field(field, resolve), kind),
                constants: Vec::new(),
            })
        }
    }
}

/// The field as a plain query field computed by `resolve`.
fn query_field(field: &FieldDefinition, resolve: Expr) -> Arc<FieldDefinition> {
    Arc::new(FieldDefinition {
        resolve,
        services: Vec::new(),
        is_async: false,
        extracted: Vec::new(),
        bulk: None,
        operation: None,
        ..field.clone()
    })
}
