//! The in-process interpreter for compiled operations.
//!
//! Evaluation is synchronous. Asynchronous resolvers produce [`Pending`] values, and any
//! operation whose input is pending is deferred as a continuation on that value, so the
//! result may contain pending values at any depth. The flattener awaits them.

use std::any::Any;
use std::cmp::Ordering;
use std::sync::Arc;

use futures::future;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use super::Call;
use super::CallInput;
use super::CompareOp;
use super::Expr;
use super::FirstKind;
use super::InjectedServices;
use super::ParamId;
use super::ProjectedField;
use super::Resolver;
use super::TypeCase;
use super::Var;
use crate::error::ResolveError;
use crate::limiter::LimitScope;
use crate::value::Pending;
use crate::value::PendingStream;
use crate::value::RecordBuilder;
use crate::value::Value;

/// The free bindings of a compiled operation.
#[derive(Default)]
pub struct Bindings {
    pub(crate) root: Value,
    pub(crate) services: IndexMap<String, Arc<dyn Any + Send + Sync>>,
    pub(crate) constants: Vec<Value>,
    pub(crate) bulk: IndexMap<String, Value>,
    pub(crate) limits: Option<LimitScope>,
    pub(crate) cancel: CancellationToken,
}

impl Bindings {
    pub fn new(root: Value) -> Self {
        Bindings {
            root,
            ..Default::default()
        }
    }

    pub fn service(mut self, name: impl Into<String>, service: Arc<dyn Any + Send + Sync>) -> Self {
        self.services.insert(name.into(), service);
        self
    }

    pub fn constants(mut self, constants: Vec<Value>) -> Self {
        self.constants = constants;
        self
    }

    pub fn bulk(mut self, bulk: IndexMap<String, Value>) -> Self {
        self.bulk = bulk;
        self
    }

    pub fn limits(mut self, limits: Option<LimitScope>) -> Self {
        self.limits = limits;
        self
    }

    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

struct Frame {
    param: ParamId,
    value: Value,
    next: Option<Arc<Frame>>,
}

/// Evaluation environment: the bindings plus the parameters in scope.
#[derive(Clone)]
pub struct Env {
    bindings: Arc<Bindings>,
    frame: Option<Arc<Frame>>,
}

impl Env {
    pub fn new(bindings: Bindings) -> Self {
        Env {
            bindings: Arc::new(bindings),
            frame: None,
        }
    }

    fn bind(&self, param: ParamId, value: Value) -> Env {
        Env {
            bindings: self.bindings.clone(),
            frame: Some(Arc::new(Frame {
                param,
                value,
                next: self.frame.clone(),
            })),
        }
    }

    fn lookup(&self, param: ParamId) -> Option<&Value> {
        let mut frame = self.frame.as_deref();
        while let Some(current) = frame {
            if current.param == param {
                return Some(&current.value);
            }
            frame = current.next.as_deref();
        }
        None
    }

    fn var(&self, var: &Var) -> Result<Value, ResolveError> {
        match var {
            Var::Root => Ok(self.bindings.root.clone()),
            Var::Param(param) => self
                .lookup(*param)
                .cloned()
                .ok_or_else(|| ResolveError::evaluation(format!("unbound parameter #{param}"))),
            Var::Constant(index) => self
                .bindings
                .constants
                .get(*index)
                .cloned()
                .ok_or_else(|| ResolveError::evaluation(format!("unbound constant #{index}"))),
            Var::Parent => Err(ResolveError::evaluation(
                "the parent placeholder was not substituted",
            )),
            Var::Argument(name) => Err(ResolveError::evaluation(format!(
                "argument '{name}' was not substituted"
            ))),
        }
    }
}

/// Evaluates an operation once against its bindings.
pub fn evaluate(expr: &Expr, env: &Env) -> Result<Value, ResolveError> {
    match expr {
        Expr::Var(var) => env.var(var),
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Member { object, name } => member(evaluate(object, env)?, name),
        Expr::TypeName(object) => after(evaluate(object, env)?, |value| {
            Ok(match value {
                Value::Record(record) => record.type_name_bytes().cloned().into(),
                _ => Value::Null,
            })
        }),
        Expr::IsNull(object) => after(evaluate(object, env)?, |value| {
            Ok(Value::Bool(value.is_null()))
        }),
        Expr::Compare { op, left, right } => {
            let op = *op;
            join(
                vec![evaluate(left, env)?, evaluate(right, env)?],
                move |values| {
                    let [left, right] = <[Value; 2]>::try_from(values)
                        .map_err(|_| ResolveError::evaluation("comparison needs two operands"))?;
                    Ok(Value::Bool(compare(op, &left, &right)))
                },
            )
        }
        Expr::And(left, right) => match evaluate(left, env)? {
            Value::Pending(pending) => {
                let (right, env) = (right.clone(), env.clone());
                Ok(defer(pending, move |left| {
                    if truthy(&left) {
                        boolean(evaluate(&right, &env)?)
                    } else {
                        Ok(Value::Bool(false))
                    }
                }))
            }
            left if truthy(&left) => boolean(evaluate(right, env)?),
            _ => Ok(Value::Bool(false)),
        },
        Expr::Or(left, right) => match evaluate(left, env)? {
            Value::Pending(pending) => {
                let (right, env) = (right.clone(), env.clone());
                Ok(defer(pending, move |left| {
                    if truthy(&left) {
                        Ok(Value::Bool(true))
                    } else {
                        boolean(evaluate(&right, &env)?)
                    }
                }))
            }
            left if truthy(&left) => Ok(Value::Bool(true)),
            _ => boolean(evaluate(right, env)?),
        },
        Expr::Not(inner) => after(evaluate(inner, env)?, |value| {
            Ok(Value::Bool(!truthy(&value)))
        }),
        Expr::Conditional {
            condition,
            then,
            otherwise,
        } => match evaluate(condition, env)? {
            Value::Pending(pending) => {
                let (then, otherwise, env) = (then.clone(), otherwise.clone(), env.clone());
                Ok(defer(pending, move |condition| {
                    if truthy(&condition) {
                        evaluate(&then, &env)
                    } else {
                        evaluate(&otherwise, &env)
                    }
                }))
            }
            condition if truthy(&condition) => evaluate(then, env),
            _ => evaluate(otherwise, env),
        },
        Expr::Let { param, value, body } => match evaluate(value, env)? {
            Value::Pending(pending) => {
                let (param, body, env) = (*param, body.clone(), env.clone());
                Ok(defer(pending, move |value| {
                    evaluate(&body, &env.bind(param, value))
                }))
            }
            value => evaluate(body, &env.bind(*param, value)),
        },
        Expr::Project { type_from, fields } => {
            let source = type_from
                .as_ref()
                .map(|type_from| evaluate(type_from, env))
                .transpose()?;
            match source {
                Some(Value::Pending(pending)) => {
                    let (fields, env) = (fields.clone(), env.clone());
                    Ok(defer(pending, move |source| {
                        project(Some(source), &fields, &env)
                    }))
                }
                source => project(source, fields, env),
            }
        }
        Expr::Map { input, param, body } => match evaluate(input, env)? {
            Value::Pending(pending) => {
                let (param, body, env) = (*param, body.clone(), env.clone());
                Ok(defer(pending, move |input| map_items(input, param, &body, &env)))
            }
            input => map_items(input, *param, body, env),
        },
        Expr::Filter {
            input,
            param,
            predicate,
        } => match evaluate(input, env)? {
            Value::Pending(pending) => {
                let (param, predicate, env) = (*param, predicate.clone(), env.clone());
                Ok(defer(pending, move |input| {
                    filter_items(input, param, &predicate, &env)
                }))
            }
            input => filter_items(input, *param, predicate, env),
        },
        Expr::FlatMap { input, param, body } => match evaluate(input, env)? {
            Value::Pending(pending) => {
                let (param, body, env) = (*param, body.clone(), env.clone());
                Ok(defer(pending, move |input| {
                    flat_map_items(input, param, &body, &env)
                }))
            }
            input => flat_map_items(input, *param, body, env),
        },
        Expr::OrderBy {
            input,
            param,
            key,
            descending,
        } => match evaluate(input, env)? {
            Value::Pending(pending) => {
                let (param, key, descending, env) = (*param, key.clone(), *descending, env.clone());
                Ok(defer(pending, move |input| {
                    order_items(input, param, &key, descending, &env)
                }))
            }
            input => order_items(input, *param, key, *descending, env),
        },
        Expr::Take { input, count } => join(
            vec![evaluate(input, env)?, evaluate(count, env)?],
            |values| slice(values, true),
        ),
        Expr::Skip { input, count } => join(
            vec![evaluate(input, env)?, evaluate(count, env)?],
            |values| slice(values, false),
        ),
        Expr::First { input, kind } => {
            let kind = *kind;
            after(evaluate(input, env)?, move |input| first(input, kind))
        }
        Expr::TypeSwitch {
            input,
            param,
            cases,
            default,
        } => match evaluate(input, env)? {
            Value::Pending(pending) => {
                let (param, cases, default, env) =
                    (*param, cases.clone(), default.clone(), env.clone());
                Ok(defer(pending, move |input| {
                    switch(input, param, &cases, default.as_deref(), &env)
                }))
            }
            input => switch(input, *param, cases, default.as_deref(), env),
        },
        Expr::BulkLookup { name, key } => {
            let (name, bindings) = (name.clone(), env.bindings.clone());
            after(evaluate(key, env)?, move |key| {
                Ok(bulk_lookup(&bindings, &name, &key))
            })
        }
        Expr::Call(call) => {
            let args = call
                .args
                .iter()
                .map(|arg| evaluate(arg, env))
                .collect::<Result<Vec<_>, _>>()?;
            let (call, env) = (call_without_args(call), env.clone());
            join(args, move |args| invoke(&call, args, &env))
        }
    }
}

/// Runs `continuation` once `value` is available.
fn after<F>(value: Value, continuation: F) -> Result<Value, ResolveError>
where
    F: FnOnce(Value) -> Result<Value, ResolveError> + Send + 'static,
{
    match value {
        Value::Pending(pending) => Ok(defer(pending, continuation)),
        value => continuation(value),
    }
}

/// Runs `continuation` once every value is available.
fn join<F>(values: Vec<Value>, continuation: F) -> Result<Value, ResolveError>
where
    F: FnOnce(Vec<Value>) -> Result<Value, ResolveError> + Send + 'static,
{
    if !values.iter().any(|value| matches!(value, Value::Pending(_))) {
        return continuation(values);
    }
    Ok(Value::Pending(Pending::new(async move {
        let resolved = future::try_join_all(values.into_iter().map(|value| async move {
            match value {
                Value::Pending(pending) => pending.resolve().await,
                value => Ok(value),
            }
        }))
        .await?;
        match continuation(resolved)? {
            Value::Pending(next) => next.resolve().await,
            value => Ok(value),
        }
    })))
}

fn defer<F>(pending: Pending, continuation: F) -> Value
where
    F: FnOnce(Value) -> Result<Value, ResolveError> + Send + 'static,
{
    Value::Pending(pending.map(continuation))
}

fn truthy(value: &Value) -> bool {
    value.as_bool().unwrap_or(false)
}

fn boolean(value: Value) -> Result<Value, ResolveError> {
    after(value, |value| Ok(Value::Bool(truthy(&value))))
}

fn member(value: Value, name: &str) -> Result<Value, ResolveError> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Record(record) => Ok(record.get(name).cloned().unwrap_or_default()),
        Value::Pending(pending) => {
            let name = name.to_string();
            Ok(defer(pending, move |value| member(value, &name)))
        }
        other => Err(ResolveError::evaluation(format!(
            "cannot read member '{name}' of a {}",
            other.tag()
        ))),
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> bool {
    match op {
        CompareOp::Eq => left.loose_eq(right),
        CompareOp::NotEq => !left.loose_eq(right),
        CompareOp::Lt => left.compare(right) == Some(Ordering::Less),
        CompareOp::Lte => matches!(
            left.compare(right),
            Some(Ordering::Less | Ordering::Equal)
        ),
        CompareOp::Gt => left.compare(right) == Some(Ordering::Greater),
        CompareOp::Gte => matches!(
            left.compare(right),
            Some(Ordering::Greater | Ordering::Equal)
        ),
    }
}

fn project(
    source: Option<Value>,
    fields: &[ProjectedField],
    env: &Env,
) -> Result<Value, ResolveError> {
    let type_name = match source {
        Some(Value::Record(record)) => record.type_name_bytes().cloned(),
        Some(Value::String(name)) => Some(name),
        _ => None,
    };
    let mut builder = RecordBuilder::synthesized().maybe_type_name(type_name);
    for field in fields {
        builder.push(
            field.name.clone(),
            field.declared.clone(),
            evaluate(&field.value, env)?,
        );
    }
    Ok(Value::Record(builder.build()))
}

fn items_of(value: Value, operation: &str) -> Result<Option<Vec<Value>>, ResolveError> {
    match value {
        Value::Null => Ok(None),
        Value::List(items) => Ok(Some(items)),
        other => Err(ResolveError::evaluation(format!(
            "cannot {operation} a {}",
            other.tag()
        ))),
    }
}

fn map_items(input: Value, param: ParamId, body: &Expr, env: &Env) -> Result<Value, ResolveError> {
    let Some(items) = items_of(input, "map over")? else {
        return Ok(Value::Null);
    };
    items
        .into_iter()
        .map(|item| evaluate(body, &env.bind(param, item)))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::List)
}

fn filter_items(
    input: Value,
    param: ParamId,
    predicate: &Expr,
    env: &Env,
) -> Result<Value, ResolveError> {
    let Some(items) = items_of(input, "filter")? else {
        return Ok(Value::Null);
    };
    let verdicts = items
        .iter()
        .map(|item| evaluate(predicate, &env.bind(param, item.clone())))
        .collect::<Result<Vec<_>, _>>()?;
    join(verdicts, move |verdicts| {
        Ok(Value::List(
            items
                .into_iter()
                .zip(verdicts)
                .filter_map(|(item, verdict)| truthy(&verdict).then_some(item))
                .collect(),
        ))
    })
}

fn flat_map_items(
    input: Value,
    param: ParamId,
    body: &Expr,
    env: &Env,
) -> Result<Value, ResolveError> {
    let Some(items) = items_of(input, "flatten")? else {
        return Ok(Value::List(Vec::new()));
    };
    let batches = items
        .into_iter()
        .map(|item| evaluate(body, &env.bind(param, item)))
        .collect::<Result<Vec<_>, _>>()?;
    join(batches, |batches| {
        let mut flattened = Vec::new();
        for batch in batches {
            match batch {
                Value::Null => {}
                Value::List(items) => flattened.extend(items),
                other => flattened.push(other),
            }
        }
        Ok(Value::List(flattened))
    })
}

fn order_items(
    input: Value,
    param: ParamId,
    key: &Expr,
    descending: bool,
    env: &Env,
) -> Result<Value, ResolveError> {
    let Some(items) = items_of(input, "order")? else {
        return Ok(Value::Null);
    };
    let keys = items
        .iter()
        .map(|item| evaluate(key, &env.bind(param, item.clone())))
        .collect::<Result<Vec<_>, _>>()?;
    join(keys, move |keys| {
        let mut keyed: Vec<(Value, Value)> = keys.into_iter().zip(items).collect();
        keyed.sort_by(|(a, _), (b, _)| {
            let ordering = a.compare(b).unwrap_or(Ordering::Equal);
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
        Ok(Value::List(keyed.into_iter().map(|(_, item)| item).collect()))
    })
}

fn slice(values: Vec<Value>, take: bool) -> Result<Value, ResolveError> {
    let [input, count] = <[Value; 2]>::try_from(values)
        .map_err(|_| ResolveError::evaluation("slicing needs an input and a count"))?;
    let Some(items) = items_of(input, if take { "take from" } else { "skip in" })? else {
        return Ok(Value::Null);
    };
    let count = match count {
        Value::Null => return Ok(Value::List(items)),
        count => count
            .as_i64()
            .and_then(|count| usize::try_from(count).ok())
            .ok_or_else(|| ResolveError::evaluation("slice count must be a positive integer"))?,
    };
    Ok(Value::List(if take {
        items.into_iter().take(count).collect()
    } else {
        items.into_iter().skip(count).collect()
    }))
}

fn first(input: Value, kind: FirstKind) -> Result<Value, ResolveError> {
    let Some(items) = items_of(input, "take the first element of")? else {
        return Ok(Value::Null);
    };
    if kind == FirstKind::Single && items.len() > 1 {
        return Err(ResolveError::evaluation(
            "expected at most one element but found several",
        ));
    }
    Ok(items.into_iter().next().unwrap_or_default())
}

fn switch(
    input: Value,
    param: ParamId,
    cases: &[TypeCase],
    default: Option<&Expr>,
    env: &Env,
) -> Result<Value, ResolveError> {
    let type_name = match &input {
        Value::Null => return Ok(Value::Null),
        Value::Record(record) => record.type_name().map(str::to_string),
        _ => None,
    };
    let body = type_name
        .and_then(|type_name| cases.iter().find(|case| case.type_name == type_name))
        .map(|case| &case.body)
        .or(default);
    match body {
        Some(body) => evaluate(body, &env.bind(param, input)),
        None => Ok(Value::Null),
    }
}

fn bulk_lookup(bindings: &Bindings, name: &str, key: &Value) -> Value {
    let Some(key) = key.key_string() else {
        return Value::Null;
    };
    bindings
        .bulk
        .get(name)
        .and_then(|loaded| loaded.get(&key))
        .cloned()
        .unwrap_or_default()
}

fn call_without_args(call: &Call) -> Call {
    Call {
        site: call.site.clone(),
        services: call.services.clone(),
        args: Vec::new(),
        resolver: call.resolver.clone(),
    }
}

fn invoke(call: &Call, args: Vec<Value>, env: &Env) -> Result<Value, ResolveError> {
    let services = call
        .services
        .iter()
        .map(|name| {
            env.bindings
                .services
                .get(name)
                .cloned()
                .ok_or_else(|| ResolveError::MissingService {
                    service: name.clone(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let input = CallInput {
        args,
        services: InjectedServices(services),
    };
    let field = call.site.coordinate.clone();
    match &call.resolver {
        Resolver::Sync(resolver) => resolver(input).map_err(|error| ResolveError::Resolver {
            field,
            reason: error.to_string(),
        }),
        Resolver::Async(resolver) => {
            let resolver = resolver.clone();
            let (site, service_names) = (call.site.clone(), call.services.clone());
            let (limits, cancel) = (env.bindings.limits.clone(), env.bindings.cancel.clone());
            Ok(Value::Pending(Pending::new(async move {
                let _permits = match &limits {
                    Some(limits) => Some(limits.acquire(&site, &service_names).await?),
                    None => None,
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ResolveError::Cancelled),
                    result = resolver(input) => result.map_err(|error| ResolveError::Resolver {
                        field,
                        reason: error.to_string(),
                    }),
                }
            })))
        }
        Resolver::Stream(resolver) => {
            use futures::StreamExt;

            let stream = resolver(input).map(move |item| {
                item.map_err(|error| ResolveError::Resolver {
                    field: field.clone(),
                    reason: error.to_string(),
                })
            });
            Ok(Value::Stream(PendingStream::new(stream)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering as AtomicOrdering;

    use serde_json_bytes::json;

    use super::*;

    fn root() -> Value {
        Value::from(json!({
            "users": [
                {"__typename": "Admin", "id": 1, "name": "ada", "age": 36},
                {"__typename": "Guest", "id": 2, "name": "bob", "age": null},
                {"__typename": "Admin", "id": 3, "name": "cy", "age": 20},
            ],
            "owner": null,
        }))
    }

    fn run(expr: &Expr) -> Value {
        evaluate(expr, &Env::new(Bindings::new(root()))).unwrap()
    }

    #[test]
    fn member_access_is_null_safe() {
        assert_eq!(run(&Expr::root().member("owner").member("name")), Value::Null);
        assert_eq!(run(&Expr::root().member("missing")), Value::Null);
        assert!(
            evaluate(
                &Expr::literal(3).member("name"),
                &Env::new(Bindings::new(Value::Null))
            )
            .is_err()
        );
    }

    #[test]
    fn filter_order_and_slice() {
        let expr = Expr::root()
            .member("users")
            .filter(0, Expr::param(0).member("age").is_null().negate())
            .order_by(1, Expr::param(1).member("age"), false)
            .map(2, Expr::param(2).member("name"))
            .take(Expr::literal(5));
        assert_eq!(run(&expr).to_json().unwrap(), json!(["cy", "ada"]));

        let skipped = Expr::root()
            .member("users")
            .skip(Expr::literal(2))
            .map(0, Expr::param(0).member("id"));
        assert_eq!(run(&skipped).to_json().unwrap(), json!([3]));
    }

    #[test]
    fn first_and_single() {
        let admins = Expr::root().member("users").filter(
            0,
            Expr::param(0)
                .type_name()
                .compare(CompareOp::Eq, Expr::literal("Admin")),
        );
        assert_eq!(
            run(&admins.clone().first().member("name")),
            Value::from("ada")
        );
        assert!(evaluate(&admins.single(), &Env::new(Bindings::new(root()))).is_err());
        let none = Expr::root()
            .member("users")
            .filter(0, Expr::literal(false))
            .single();
        assert_eq!(run(&none), Value::Null);
    }

    #[test]
    fn type_switch_and_projection() {
        let expr = Expr::root().member("users").map(
            0,
            Expr::TypeSwitch {
                input: Box::new(Expr::param(0)),
                param: 1,
                cases: vec![TypeCase {
                    type_name: "Admin".to_string(),
                    body: Expr::Project {
                        type_from: Some(Box::new(Expr::param(1))),
                        fields: vec![ProjectedField {
                            name: "admin".to_string(),
                            declared: None,
                            value: Expr::param(1).member("name"),
                        }],
                    },
                }],
                default: None,
            },
        );
        let value = run(&expr);
        assert_eq!(
            value.to_json().unwrap(),
            json!([{"admin": "ada"}, null, {"admin": "cy"}])
        );
        let first = &value.as_list().unwrap()[0];
        assert_eq!(first.as_record().unwrap().type_name(), Some("Admin"));
    }

    #[test]
    fn flat_map_flattens_one_level() {
        let root = Value::from(json!({
            "teams": [
                {"members": [{"id": 1}, {"id": 2}]},
                {"members": null},
                {"members": [{"id": 3}]},
            ]
        }));
        let expr = Expr::root()
            .member("teams")
            .flat_map(0, Expr::param(0).member("members"))
            .map(1, Expr::param(1).member("id"));
        let value = evaluate(&expr, &Env::new(Bindings::new(root))).unwrap();
        assert_eq!(value.to_json().unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn let_evaluates_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let call = Expr::call(
            Resolver::sync(move |_| {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(Value::from(json!({"a": 1, "b": 2})))
            }),
            Vec::<String>::new(),
            vec![],
        );
        let expr = Expr::let_in(
            7,
            call,
            Expr::Project {
                type_from: None,
                fields: vec![
                    ProjectedField {
                        name: "a".to_string(),
                        declared: None,
                        value: Expr::param(7).member("a"),
                    },
                    ProjectedField {
                        name: "b".to_string(),
                        declared: None,
                        value: Expr::param(7).member("b"),
                    },
                ],
            },
        );
        assert_eq!(run(&expr).to_json().unwrap(), json!({"a": 1, "b": 2}));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn async_results_are_deferred() {
        let call = Expr::call(
            Resolver::future(|input: CallInput| async move {
                let id = input.arg(0).and_then(Value::as_i64).unwrap_or_default();
                Ok(Value::from(json!({"score": id * 10})))
            }),
            Vec::<String>::new(),
            vec![Expr::param(0).member("id")],
        );
        let expr = Expr::root()
            .member("users")
            .filter(
                0,
                call.member("score")
                    .compare(CompareOp::Gt, Expr::literal(15)),
            )
            .map(1, Expr::param(1).member("name"));
        let value = run(&expr);
        let Value::Pending(pending) = value else {
            panic!("expected a pending value, got {value:?}");
        };
        assert_eq!(
            pending.resolve().await.unwrap().to_json().unwrap(),
            json!(["bob", "cy"])
        );
    }

    #[test]
    fn missing_services_are_reported() {
        let expr = Expr::call(Resolver::sync(|_| Ok(Value::Null)), ["clock"], vec![]);
        assert_eq!(
            evaluate(&expr, &Env::new(Bindings::new(Value::Null))).unwrap_err(),
            ResolveError::MissingService {
                service: "clock".to_string()
            }
        );
    }

    #[test]
    fn bulk_lookup_reads_loaded_data() {
        let loaded = Value::Record(
            RecordBuilder::synthesized()
                .member("1", "one")
                .member("3", "three")
                .build(),
        );
        let bindings =
            Bindings::new(root()).bulk(IndexMap::from([("users.label".to_string(), loaded)]));
        let expr = Expr::root().member("users").map(
            0,
            Expr::BulkLookup {
                name: "users.label".to_string(),
                key: Box::new(Expr::param(0).member("id")),
            },
        );
        let value = evaluate(&expr, &Env::new(bindings)).unwrap();
        assert_eq!(value.to_json().unwrap(), json!(["one", null, "three"]));
    }
}
