//! The dual-pass selection compiler.
//!
//! A root selection is compiled into an [`Expr`] over the root context. When a subtree
//! needs injected services, the compiler first builds a phase-one operation that only
//! reads what the query provider can compute (service fields are replaced by the raw
//! inputs they need), and after the provider ran, a phase-two operation bound to the
//! materialized value that replays the service-backed resolvers on top of it.

pub(crate) mod bulk;
pub(crate) mod rebind;

use indexmap::IndexMap;
use indexmap::IndexSet;

use self::bulk::Registration;
use self::bulk::Step;
use crate::error::CompileError;
use crate::error::ValidationErrors;
use crate::ir::Expr;
use crate::ir::ParamId;
use crate::ir::ProjectedField;
use crate::ir::TypeCase;
use crate::ir::rewrite::extracted_name;
use crate::json_ext::Path;
use crate::spec::DirectiveEvaluator;
use crate::spec::FieldDefinition;
use crate::spec::Fragments;
use crate::spec::NodeKind;
use crate::spec::Schema;
use crate::spec::SelectionNode;
use crate::spec::Variables;
use crate::spec::realize_for_type;
use crate::value::Value;

// Deeper selections are rejected before they can overflow the stack.
const RECURSION_LIMIT: usize = 512;

/// Read-only inputs shared by every compilation of one statement.
#[derive(Clone, Copy)]
pub(crate) struct Compiler<'a> {
    pub(crate) schema: &'a Schema,
    pub(crate) fragments: &'a Fragments,
    pub(crate) variables: &'a Variables,
    pub(crate) directives: &'a dyn DirectiveEvaluator,
}

/// What one compilation of a root field accumulated.
#[derive(Debug, Default)]
pub(crate) struct CompileContext {
    /// Services referenced by the calls of the compiled operation.
    pub(crate) services: IndexSet<String>,
    pub(crate) constants: Vec<Value>,
    pub(crate) registrations: Vec<Registration>,
    /// Set when the operation calls an asynchronous resolver.
    pub(crate) has_async: bool,
    loaded: IndexSet<String>,
    next_param: ParamId,
    ancestors: Vec<Step>,
    root_is_collection: bool,
}

impl CompileContext {
    pub(crate) fn new(constants: Vec<Value>) -> Self {
        CompileContext {
            constants,
            ..Default::default()
        }
    }

    /// Bulk resolvers whose data is bound alongside the operation.
    pub(crate) fn with_loaded(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.loaded.extend(names);
        self
    }

    fn fresh(&mut self) -> ParamId {
        let param = self.next_param;
        self.next_param += 1;
        param
    }

    fn record_calls(&mut self, expr: &Expr) {
        for call in expr.calls() {
            self.services.extend(call.services.iter().cloned());
            self.has_async |= call.resolver.is_async();
        }
    }

    fn register(&mut self, registration: Registration) {
        if !self
            .registrations
            .iter()
            .any(|existing| existing.name == registration.name)
        {
            self.registrations.push(registration);
        }
    }
}

/// The member names found in a materialized value, merged across list elements.
#[derive(Debug, Default, Clone)]
pub(crate) struct MaterializedShape {
    members: IndexMap<String, MaterializedShape>,
}

impl MaterializedShape {
    pub(crate) fn of(value: &Value) -> Self {
        let mut shape = MaterializedShape::default();
        shape.absorb(value);
        shape
    }

    fn absorb(&mut self, value: &Value) {
        match value {
            Value::Record(record) => {
                for (name, value) in record.iter() {
                    self.members
                        .entry(name.to_string())
                        .or_default()
                        .absorb(value);
                }
            }
            Value::List(items) => items.iter().for_each(|item| self.absorb(item)),
            _ => {}
        }
    }

    pub(crate) fn has(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub(crate) fn child(&self, name: &str) -> Option<&MaterializedShape> {
        self.members.get(name)
    }
}

/// Where a compiled node reads its parent from.
#[derive(Clone, Copy)]
struct Pass<'s> {
    without_service_fields: bool,
    /// Shape of the materialized parent, when the parent was materialized.
    replacement: Option<&'s MaterializedShape>,
    context_changed: bool,
}

impl<'a> Compiler<'a> {
    /// Compiles one root field. `None` means every selected field was pruned from the
    /// phase-one operation.
    pub(crate) fn compile_root(
        &self,
        node: &SelectionNode,
        ctx: &mut CompileContext,
        without_service_fields: bool,
        replacement: Option<&MaterializedShape>,
        context_changed: bool,
    ) -> Result<Option<Expr>, CompileError> {
        let path = Path::from_slice(&[node.name.as_str()]);
        let pass = Pass {
            without_service_fields,
            replacement,
            context_changed,
        };
        let compiled = self.compile(node, ctx, &Expr::root(), pass, true, &path)?;
        if let Some(expr) = &compiled {
            ctx.record_calls(expr);
            tracing::debug!(
                root = %path,
                phase_one = without_service_fields,
                "compiled root field"
            );
            tracing::trace!(operation = ?expr);
        }
        Ok(compiled)
    }

    fn compile(
        &self,
        node: &SelectionNode,
        ctx: &mut CompileContext,
        parent: &Expr,
        pass: Pass<'_>,
        is_root: bool,
        path: &Path,
    ) -> Result<Option<Expr>, CompileError> {
        if path.len() > RECURSION_LIMIT {
            tracing::error!("selection processing recursion limit({RECURSION_LIMIT}) exceeded");
            return Err(CompileError::RecursionLimitExceeded { path: path.clone() });
        }
        let field = match &node.kind {
            NodeKind::Extracted(extracted) => {
                let materialized = pass.context_changed
                    && pass
                        .replacement
                        .map(|shape| shape.has(&node.name))
                        .unwrap_or(false);
                return Ok(Some(if materialized {
                    parent.clone().member(node.name.clone())
                } else {
                    extracted.expr.substitute_parent(parent)
                }));
            }
            NodeKind::FragmentSpread { .. } | NodeKind::InlineFragment { .. } => {
                return Err(unsupported("fragments are expanded before compilation", path));
            }
            NodeKind::MutationField | NodeKind::SubscriptionField => {
                return Err(unsupported(
                    "root operations are resolved before compilation",
                    path,
                ));
            }
            _ => node
                .field
                .as_deref()
                .ok_or_else(|| unsupported("selection has no field definition", path))?,
        };
        let arguments = self.arguments(node, field, path)?;

        let materialized = pass.context_changed
            && (is_root
                || pass
                    .replacement
                    .map(|shape| shape.has(&node.name))
                    .unwrap_or(false));
        let source = if pass.context_changed && is_root {
            parent.clone()
        } else if materialized {
            parent.clone().member(node.name.clone())
        } else if let Some(bulk) = &field.bulk {
            let key = self.rebase(&bulk.data_selector, ctx, parent, pass);
            let name = bulk::registration_name(path, field);
            if ctx.loaded.contains(&name) {
                Expr::BulkLookup {
                    name,
                    key: Box::new(key),
                }
            } else {
                bulk::per_row_call(field, bulk, key)
            }
        } else {
            let resolve = field.resolve.substitute_arguments(&arguments);
            self.rebase(&resolve, ctx, parent, pass)
        };

        let children_pass = Pass {
            without_service_fields: pass.without_service_fields,
            replacement: match (materialized, is_root) {
                (false, _) => None,
                (true, true) => pass.replacement,
                (true, false) => pass.replacement.and_then(|shape| shape.child(&node.name)),
            },
            context_changed: materialized,
        };

        let composite = matches!(
            node.kind,
            NodeKind::ObjectProjection | NodeKind::ListProjection | NodeKind::CollectionToSingle
        );
        if !composite {
            return Ok(Some(source));
        }
        if is_root {
            ctx.root_is_collection = matches!(node.kind, NodeKind::ListProjection);
        } else {
            ctx.ancestors.push(Step {
                name: node.name.clone(),
                collection: matches!(node.kind, NodeKind::ListProjection),
            });
        }
        let compiled = self.wrap(node, field, ctx, source, materialized, children_pass, path);
        if !is_root {
            ctx.ancestors.pop();
        }
        let (expr, projected) = compiled?;
        if is_root && pass.without_service_fields && projected == 0 {
            return Ok(None);
        }
        Ok(Some(expr))
    }

    /// Null-checks the source of a composite field and projects its children.
    #[allow(clippy::too_many_arguments)]
    fn wrap(
        &self,
        node: &SelectionNode,
        field: &FieldDefinition,
        ctx: &mut CompileContext,
        source: Expr,
        materialized: bool,
        pass: Pass<'_>,
        path: &Path,
    ) -> Result<(Expr, usize), CompileError> {
        match &node.kind {
            NodeKind::ListProjection => {
                let item = ctx.fresh();
                let (body, projected) =
                    self.null_checked(node, field, ctx, Expr::param(item), pass, path)?;
                Ok((source.map(item, body), projected))
            }
            NodeKind::CollectionToSingle if !materialized && source.as_first().is_some() => {
                let Some((input, kind)) = source.as_first() else {
                    return Err(unsupported("expected a collection", path));
                };
                let item = ctx.fresh();
                let (body, projected) =
                    self.null_checked(node, field, ctx, Expr::param(item), pass, path)?;
                Ok((
                    Expr::First {
                        input: Box::new(input.clone().map(item, body)),
                        kind,
                    },
                    projected,
                ))
            }
            _ if node.requires_services() || source.contains_call() => {
                // evaluated once, read by every child
                let value = ctx.fresh();
                let (body, projected) =
                    self.null_checked(node, field, ctx, Expr::param(value), pass, path)?;
                Ok((Expr::let_in(value, source, body), projected))
            }
            _ => self.null_checked(node, field, ctx, source, pass, path),
        }
    }

    fn null_checked(
        &self,
        node: &SelectionNode,
        field: &FieldDefinition,
        ctx: &mut CompileContext,
        value: Expr,
        pass: Pass<'_>,
        path: &Path,
    ) -> Result<(Expr, usize), CompileError> {
        let (projection, projected) = self.project(node, field, ctx, value.clone(), pass, path)?;
        Ok((
            Expr::conditional(value.is_null(), Expr::null(), projection),
            projected,
        ))
    }

    /// Projects the children of a composite node over `value`, switching on the runtime
    /// type for interfaces and unions.
    fn project(
        &self,
        node: &SelectionNode,
        field: &FieldDefinition,
        ctx: &mut CompileContext,
        value: Expr,
        pass: Pass<'_>,
        path: &Path,
    ) -> Result<(Expr, usize), CompileError> {
        let Some(declared) = field.ty.inner_type_name() else {
            return Err(unsupported("scalar fields have no selections", path));
        };
        let children = node.expand(self.fragments, pass.without_service_fields)?;
        let all = if pass.without_service_fields {
            node.expand(self.fragments, false)?
        } else {
            Vec::new()
        };
        if !self.schema.is_abstract(declared) {
            return self.fields_for(declared, None, &children, &all, ctx, value, pass, path);
        }

        let param = ctx.fresh();
        let mut cases = Vec::new();
        let mut projected = 0;
        for concrete in self.schema.possible_types(declared) {
            let (body, count) = self.fields_for(
                &concrete,
                Some(&concrete),
                &children,
                &all,
                ctx,
                Expr::param(param),
                pass,
                path,
            )?;
            projected += count;
            cases.push(TypeCase {
                type_name: concrete,
                body,
            });
        }
        let (default, count) = self.fields_for(
            declared,
            None,
            &children,
            &all,
            ctx,
            Expr::param(param),
            pass,
            path,
        )?;
        Ok((
            Expr::TypeSwitch {
                input: Box::new(value),
                param,
                cases,
                default: Some(Box::new(default)),
            },
            projected + count,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn fields_for(
        &self,
        type_name: &str,
        row_type: Option<&str>,
        children: &[SelectionNode],
        all: &[SelectionNode],
        ctx: &mut CompileContext,
        value: Expr,
        pass: Pass<'_>,
        path: &Path,
    ) -> Result<(Expr, usize), CompileError> {
        if pass.without_service_fields {
            for child in realize_for_type(all, type_name, self.schema) {
                let Some(field) = child.field.as_deref() else {
                    continue;
                };
                let Some(bulk) = &field.bulk else {
                    continue;
                };
                let child_path = path.with_key(child.name.clone());
                if !self
                    .directives
                    .keep(&child.directives, self.variables, &child_path)?
                {
                    continue;
                }
                // Fields declared on an interface share one name across every
                // concrete case, so their registration has to see all rows.
                let row_type = row_type
                    .filter(|_| !self.schema.is_abstract(&field.parent_type))
                    .map(str::to_string);
                ctx.register(Registration::new(
                    bulk::registration_name(&child_path, field),
                    field,
                    bulk,
                    ctx.ancestors.clone(),
                    ctx.root_is_collection,
                    row_type,
                ));
            }
        }

        let mut fields = Vec::new();
        for child in realize_for_type(children, type_name, self.schema) {
            let child_path = path.with_key(child.name.clone());
            if !self
                .directives
                .keep(&child.directives, self.variables, &child_path)?
            {
                continue;
            }
            if let Some(compiled) = self.compile(&child, ctx, &value, pass, false, &child_path)? {
                fields.push(ProjectedField {
                    name: child.name.clone(),
                    declared: child.field.as_ref().map(|field| field.ty.clone()),
                    value: compiled,
                });
            }
        }
        let projected = fields.len();
        Ok((
            Expr::Project {
                type_from: Some(Box::new(value)),
                fields,
            },
            projected,
        ))
    }

    /// Rewrites a field-level template to read from `parent`.
    ///
    /// On a materialized parent, member chains that were extracted during phase one are
    /// read from their extracted members.
    fn rebase(
        &self,
        template: &Expr,
        ctx: &mut CompileContext,
        parent: &Expr,
        pass: Pass<'_>,
    ) -> Expr {
        let template = template.rename_params(&mut || ctx.fresh());
        let template = match (pass.context_changed, pass.replacement) {
            (true, Some(shape)) => template.replace_parent_chains(parent, &|chain| {
                let name = extracted_name(chain);
                shape.has(&name).then_some(name)
            }),
            _ => template,
        };
        template.substitute_parent(parent)
    }

    /// Resolves the arguments of a field from literals, variables and declared defaults.
    pub(crate) fn arguments(
        &self,
        node: &SelectionNode,
        field: &FieldDefinition,
        path: &Path,
    ) -> Result<IndexMap<String, Value>, CompileError> {
        let mut errors = ValidationErrors::default();
        for name in node.arguments.keys() {
            if field.argument(name).is_none() {
                errors.push(
                    format!(
                        "unknown argument '{name}' on field '{}'",
                        field.coordinate()
                    ),
                    path.clone(),
                );
            }
        }
        let mut values = IndexMap::new();
        for definition in &field.arguments {
            let value = node
                .arguments
                .get(&definition.name)
                .and_then(|argument| argument.resolve(self.variables))
                .or_else(|| definition.default.clone());
            let Some(value) = value else {
                if definition.ty.is_non_null() {
                    return Err(CompileError::MissingArgument {
                        field: field.coordinate(),
                        argument: definition.name.clone(),
                        path: path.clone(),
                    });
                }
                continue;
            };
            if definition
                .ty
                .validate_input_value(&value, self.schema)
                .is_err()
            {
                errors.push(
                    format!(
                        "argument '{}' on field '{}' expects type '{}'",
                        definition.name,
                        field.coordinate(),
                        definition.ty
                    ),
                    path.clone(),
                );
            }
            values.insert(definition.name.clone(), value);
        }
        if errors.is_empty() {
            Ok(values)
        } else {
            Err(CompileError::Validation {
                field: field.coordinate(),
                path: path.clone(),
                errors,
            })
        }
    }
}

fn unsupported(reason: &str, path: &Path) -> CompileError {
    CompileError::Unsupported {
        reason: reason.to_string(),
        path: path.clone(),
    }
}
