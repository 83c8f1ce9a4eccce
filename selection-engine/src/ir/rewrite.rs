//! Rewrites over [`Expr`] trees used while compiling.

use std::collections::HashMap;

use indexmap::IndexMap;

use super::Call;
use super::CallSite;
use super::Expr;
use super::ParamId;
use super::ProjectedField;
use super::TypeCase;
use super::Var;
use crate::value::Value;

impl Expr {
    /// Rebuilds this node with every direct child replaced by `f(child)`.
    pub(crate) fn map_children(&self, f: &mut dyn FnMut(&Expr) -> Expr) -> Expr {
        let mut child = |expr: &Expr| Box::new(f(expr));
        match self {
            Expr::Var(_) | Expr::Literal(_) => self.clone(),
            Expr::Member { object, name } => Expr::Member {
                object: child(object),
                name: name.clone(),
            },
            Expr::TypeName(object) => Expr::TypeName(child(object)),
            Expr::IsNull(object) => Expr::IsNull(child(object)),
            Expr::Compare { op, left, right } => Expr::Compare {
                op: *op,
                left: child(left),
                right: child(right),
            },
            Expr::And(left, right) => Expr::And(child(left), child(right)),
            Expr::Or(left, right) => Expr::Or(child(left), child(right)),
            Expr::Not(inner) => Expr::Not(child(inner)),
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => Expr::Conditional {
                condition: child(condition),
                then: child(then),
                otherwise: child(otherwise),
            },
            Expr::Let { param, value, body } => Expr::Let {
                param: *param,
                value: child(value),
                body: child(body),
            },
            Expr::Project { type_from, fields } => Expr::Project {
                type_from: type_from.as_ref().map(|type_from| child(type_from)),
                fields: fields
                    .iter()
                    .map(|field| ProjectedField {
                        name: field.name.clone(),
                        declared: field.declared.clone(),
                        value: *child(&field.value),
                    })
                    .collect(),
            },
            Expr::Map { input, param, body } => Expr::Map {
                input: child(input),
                param: *param,
                body: child(body),
            },
            Expr::Filter {
                input,
                param,
                predicate,
            } => Expr::Filter {
                input: child(input),
                param: *param,
                predicate: child(predicate),
            },
            Expr::FlatMap { input, param, body } => Expr::FlatMap {
                input: child(input),
                param: *param,
                body: child(body),
            },
            Expr::OrderBy {
                input,
                param,
                key,
                descending,
            } => Expr::OrderBy {
                input: child(input),
                param: *param,
                key: child(key),
                descending: *descending,
            },
            Expr::Take { input, count } => Expr::Take {
                input: child(input),
                count: child(count),
            },
            Expr::Skip { input, count } => Expr::Skip {
                input: child(input),
                count: child(count),
            },
            Expr::First { input, kind } => Expr::First {
                input: child(input),
                kind: *kind,
            },
            Expr::TypeSwitch {
                input,
                param,
                cases,
                default,
            } => Expr::TypeSwitch {
                input: child(input),
                param: *param,
                cases: cases
                    .iter()
                    .map(|case| TypeCase {
                        type_name: case.type_name.clone(),
                        body: *child(&case.body),
                    })
                    .collect(),
                default: default.as_ref().map(|default| child(default)),
            },
            Expr::BulkLookup { name, key } => Expr::BulkLookup {
                name: name.clone(),
                key: child(key),
            },
            Expr::Call(call) => Expr::Call(Call {
                site: call.site.clone(),
                services: call.services.clone(),
                args: call.args.iter().map(|arg| *child(arg)).collect(),
                resolver: call.resolver.clone(),
            }),
        }
    }

    /// Top-down rewrite: wherever `f` returns a replacement it is used as is, otherwise
    /// the node is rebuilt from its rewritten children.
    pub(crate) fn transform(&self, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Expr {
        match f(self) {
            Some(replacement) => replacement,
            None => self.map_children(&mut |child| child.transform(f)),
        }
    }

    /// Visits every node, parents before children.
    pub(crate) fn visit(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        self.for_each_child_ref(&mut |child| child.visit(f));
    }

    /// Every external call in this tree.
    pub(crate) fn calls(&self) -> Vec<&Call> {
        fn collect<'a>(expr: &'a Expr, calls: &mut Vec<&'a Call>) {
            if let Expr::Call(call) = expr {
                calls.push(call);
            }
            expr.for_each_child_ref(&mut |child| collect(child, calls));
        }
        let mut calls = Vec::new();
        collect(self, &mut calls);
        calls
    }

    fn for_each_child_ref<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        match self {
            Expr::Var(_) | Expr::Literal(_) => {}
            Expr::Member { object, .. } | Expr::TypeName(object) | Expr::IsNull(object) => {
                f(object)
            }
            Expr::Not(inner) => f(inner),
            Expr::Compare { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
                f(left);
                f(right);
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                f(condition);
                f(then);
                f(otherwise);
            }
            Expr::Let { value, body, .. } => {
                f(value);
                f(body);
            }
            Expr::Project { type_from, fields } => {
                if let Some(type_from) = type_from {
                    f(type_from);
                }
                for field in fields {
                    f(&field.value);
                }
            }
            Expr::Map { input, body, .. } | Expr::FlatMap { input, body, .. } => {
                f(input);
                f(body);
            }
            Expr::Filter {
                input, predicate, ..
            } => {
                f(input);
                f(predicate);
            }
            Expr::OrderBy { input, key, .. } => {
                f(input);
                f(key);
            }
            Expr::Take { input, count } | Expr::Skip { input, count } => {
                f(input);
                f(count);
            }
            Expr::First { input, .. } => f(input),
            Expr::TypeSwitch {
                input,
                cases,
                default,
                ..
            } => {
                f(input);
                for case in cases {
                    f(&case.body);
                }
                if let Some(default) = default {
                    f(default);
                }
            }
            Expr::BulkLookup { key, .. } => f(key),
            Expr::Call(call) => call.args.iter().for_each(|arg| f(arg)),
        }
    }

    pub(crate) fn contains_call(&self) -> bool {
        !self.calls().is_empty()
    }

    /// The member names read from [`Var::Parent`] when this node is a member chain on it.
    ///
    /// `parent.address.city` gives `["address", "city"]`.
    pub(crate) fn parent_chain(&self) -> Option<Vec<String>> {
        match self {
            Expr::Member { object, name } => match object.as_ref() {
                Expr::Var(Var::Parent) => Some(vec![name.clone()]),
                object => {
                    let mut chain = object.parent_chain()?;
                    chain.push(name.clone());
                    Some(chain)
                }
            },
            _ => None,
        }
    }

    /// Every maximal member chain on [`Var::Parent`] in this tree.
    pub(crate) fn parent_chains(&self) -> Vec<Vec<String>> {
        let mut chains: Vec<Vec<String>> = Vec::new();
        self.transform(&mut |expr| {
            let chain = expr.parent_chain()?;
            if !chains.contains(&chain) {
                chains.push(chain);
            }
            Some(expr.clone())
        });
        chains
    }

    pub(crate) fn substitute_parent(&self, replacement: &Expr) -> Expr {
        self.transform(&mut |expr| match expr {
            Expr::Var(Var::Parent) => Some(replacement.clone()),
            _ => None,
        })
    }

    pub(crate) fn substitute_arguments(&self, arguments: &IndexMap<String, Value>) -> Expr {
        self.transform(&mut |expr| match expr {
            Expr::Var(Var::Argument(name)) => Some(Expr::Literal(
                arguments.get(name).cloned().unwrap_or_default(),
            )),
            _ => None,
        })
    }

    /// Replaces member chains on the parent with reads of their extracted members.
    ///
    /// `extracted` returns the extracted member name for a chain when the new context
    /// carries it.
    pub(crate) fn replace_parent_chains(
        &self,
        context: &Expr,
        extracted: &dyn Fn(&[String]) -> Option<String>,
    ) -> Expr {
        self.transform(&mut |expr| {
            let chain = expr.parent_chain()?;
            extracted(&chain).map(|name| context.clone().member(name))
        })
    }

    /// Gives every binder in this tree a fresh parameter so that templates can be inlined
    /// more than once in the same operation.
    pub(crate) fn rename_params(&self, fresh: &mut dyn FnMut() -> ParamId) -> Expr {
        let mut renamed: HashMap<ParamId, ParamId> = HashMap::new();
        self.visit(&mut |expr| {
            if let Some(param) = expr.binder() {
                renamed.entry(param).or_insert_with(|| fresh());
            }
        });
        if renamed.is_empty() {
            return self.clone();
        }
        self.rebind(&renamed)
    }

    fn rebind(&self, renamed: &HashMap<ParamId, ParamId>) -> Expr {
        let rename = |param: &ParamId| renamed.get(param).copied().unwrap_or(*param);
        let rebuilt = self.map_children(&mut |child| child.rebind(renamed));
        match rebuilt {
            Expr::Var(Var::Param(param)) => Expr::Var(Var::Param(rename(&param))),
            Expr::Let { param, value, body } => Expr::Let {
                param: rename(&param),
                value,
                body,
            },
            Expr::Map { input, param, body } => Expr::Map {
                input,
                param: rename(&param),
                body,
            },
            Expr::Filter {
                input,
                param,
                predicate,
            } => Expr::Filter {
                input,
                param: rename(&param),
                predicate,
            },
            Expr::FlatMap { input, param, body } => Expr::FlatMap {
                input,
                param: rename(&param),
                body,
            },
            Expr::OrderBy {
                input,
                param,
                key,
                descending,
            } => Expr::OrderBy {
                input,
                param: rename(&param),
                key,
                descending,
            },
            Expr::TypeSwitch {
                input,
                param,
                cases,
                default,
            } => Expr::TypeSwitch {
                input,
                param: rename(&param),
                cases,
                default,
            },
            other => other,
        }
    }

    fn binder(&self) -> Option<ParamId> {
        match self {
            Expr::Let { param, .. }
            | Expr::Map { param, .. }
            | Expr::Filter { param, .. }
            | Expr::FlatMap { param, .. }
            | Expr::OrderBy { param, .. }
            | Expr::TypeSwitch { param, .. } => Some(*param),
            _ => None,
        }
    }

    /// Stamps the call site on every call in this tree.
    pub(crate) fn with_call_site(&self, site: &CallSite) -> Expr {
        self.transform(&mut |expr| match expr {
            Expr::Call(call) => Some(Expr::Call(Call {
                site: site.clone(),
                services: call.services.clone(),
                args: call.args.iter().map(|arg| arg.with_call_site(site)).collect(),
                resolver: call.resolver.clone(),
            })),
            _ => None,
        })
    }

    /// The form of the expression under its `First`, when it has one.
    pub(crate) fn as_first(&self) -> Option<(&Expr, super::FirstKind)> {
        match self {
            Expr::First { input, kind } => Some((input.as_ref(), *kind)),
            _ => None,
        }
    }
}

/// Name of the member holding an extracted parent chain.
pub(crate) fn extracted_name(chain: &[String]) -> String {
    format!("__{}", chain.join("_"))
}
