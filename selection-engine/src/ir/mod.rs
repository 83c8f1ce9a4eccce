//! The compiled operation representation.
//!
//! An [`Expr`] is a tree of composable operations over named free bindings: the root
//! context, injected services, constants and bulk data. Field definitions describe their
//! resolvers with the same tree, using [`Var::Parent`] and [`Var::Argument`] as
//! placeholders that the compiler substitutes.

mod eval;
pub(crate) mod rewrite;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::Stream;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tower::BoxError;

pub use self::eval::Bindings;
pub use self::eval::Env;
pub use self::eval::evaluate;
use crate::spec::FieldType;
use crate::value::Value;

/// Identifies a parameter introduced by a binder (`Let`, `Map`, `Filter`, ...).
pub type ParamId = usize;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Var {
    /// The root context of the operation.
    Root,
    /// The parent value of a field resolver. Only valid inside field definitions.
    Parent,
    /// A value bound by an enclosing binder.
    Param(ParamId),
    /// A field argument. Only valid inside field definitions.
    Argument(String),
    /// A constant bound alongside the operation.
    Constant(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirstKind {
    /// The first element, or null for an empty list.
    First,
    /// The only element, or null for an empty list. More than one element is an error.
    Single,
}

/// A member of a record projection.
#[derive(Clone, Debug)]
pub struct ProjectedField {
    pub name: String,
    pub declared: Option<FieldType>,
    pub value: Expr,
}

/// One branch of a [`Expr::TypeSwitch`].
#[derive(Clone, Debug)]
pub struct TypeCase {
    pub type_name: String,
    pub body: Expr,
}

#[derive(Clone, Debug)]
pub enum Expr {
    Var(Var),
    Literal(Value),
    /// Reads a member of a record. Null records and missing members read as null.
    Member {
        object: Box<Expr>,
        name: String,
    },
    /// The runtime type name of a record.
    TypeName(Box<Expr>),
    IsNull(Box<Expr>),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// Evaluates `value` once and binds it for `body`.
    Let {
        param: ParamId,
        value: Box<Expr>,
        body: Box<Expr>,
    },
    /// Builds a record. The type name is copied from the value of `type_from`.
    Project {
        type_from: Option<Box<Expr>>,
        fields: Vec<ProjectedField>,
    },
    Map {
        input: Box<Expr>,
        param: ParamId,
        body: Box<Expr>,
    },
    Filter {
        input: Box<Expr>,
        param: ParamId,
        predicate: Box<Expr>,
    },
    /// Maps every element to a list and concatenates the results.
    FlatMap {
        input: Box<Expr>,
        param: ParamId,
        body: Box<Expr>,
    },
    OrderBy {
        input: Box<Expr>,
        param: ParamId,
        key: Box<Expr>,
        descending: bool,
    },
    Take {
        input: Box<Expr>,
        count: Box<Expr>,
    },
    Skip {
        input: Box<Expr>,
        count: Box<Expr>,
    },
    First {
        input: Box<Expr>,
        kind: FirstKind,
    },
    /// Dispatches on the runtime type name of a record.
    TypeSwitch {
        input: Box<Expr>,
        param: ParamId,
        cases: Vec<TypeCase>,
        default: Option<Box<Expr>>,
    },
    /// Reads the value loaded by a bulk resolver for `key`.
    BulkLookup {
        name: String,
        key: Box<Expr>,
    },
    Call(Call),
}

impl Expr {
    pub fn root() -> Self {
        Expr::Var(Var::Root)
    }

    pub fn parent() -> Self {
        Expr::Var(Var::Parent)
    }

    pub fn param(param: ParamId) -> Self {
        Expr::Var(Var::Param(param))
    }

    pub fn argument(name: impl Into<String>) -> Self {
        Expr::Var(Var::Argument(name.into()))
    }

    pub fn constant(index: usize) -> Self {
        Expr::Var(Var::Constant(index))
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn null() -> Self {
        Expr::Literal(Value::Null)
    }

    pub fn member(self, name: impl Into<String>) -> Self {
        Expr::Member {
            object: Box::new(self),
            name: name.into(),
        }
    }

    pub fn type_name(self) -> Self {
        Expr::TypeName(Box::new(self))
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull(Box::new(self))
    }

    pub fn compare(self, op: CompareOp, other: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn and(self, other: Expr) -> Self {
        Expr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expr) -> Self {
        Expr::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Expr::Not(Box::new(self))
    }

    pub fn conditional(condition: Expr, then: Expr, otherwise: Expr) -> Self {
        Expr::Conditional {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    pub fn let_in(param: ParamId, value: Expr, body: Expr) -> Self {
        Expr::Let {
            param,
            value: Box::new(value),
            body: Box::new(body),
        }
    }

    pub fn map(self, param: ParamId, body: Expr) -> Self {
        Expr::Map {
            input: Box::new(self),
            param,
            body: Box::new(body),
        }
    }

    pub fn filter(self, param: ParamId, predicate: Expr) -> Self {
        Expr::Filter {
            input: Box::new(self),
            param,
            predicate: Box::new(predicate),
        }
    }

    pub fn flat_map(self, param: ParamId, body: Expr) -> Self {
        Expr::FlatMap {
            input: Box::new(self),
            param,
            body: Box::new(body),
        }
    }

    pub fn order_by(self, param: ParamId, key: Expr, descending: bool) -> Self {
        Expr::OrderBy {
            input: Box::new(self),
            param,
            key: Box::new(key),
            descending,
        }
    }

    pub fn take(self, count: Expr) -> Self {
        Expr::Take {
            input: Box::new(self),
            count: Box::new(count),
        }
    }

    pub fn skip(self, count: Expr) -> Self {
        Expr::Skip {
            input: Box::new(self),
            count: Box::new(count),
        }
    }

    pub fn first(self) -> Self {
        Expr::First {
            input: Box::new(self),
            kind: FirstKind::First,
        }
    }

    pub fn single(self) -> Self {
        Expr::First {
            input: Box::new(self),
            kind: FirstKind::Single,
        }
    }

    /// A call to an external resolver with the named injected services.
    ///
    /// The call site is filled in when the call becomes part of a field definition.
    pub fn call<S>(
        resolver: Resolver,
        services: impl IntoIterator<Item = S>,
        args: Vec<Expr>,
    ) -> Self
    where
        S: Into<String>,
    {
        Expr::Call(Call {
            site: CallSite::default(),
            services: services.into_iter().map(Into::into).collect(),
            args,
            resolver,
        })
    }
}

/// Where a call comes from, used to pick its concurrency limits.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CallSite {
    /// `Type.field`
    pub coordinate: String,
    pub max_concurrency: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct Call {
    pub site: CallSite,
    /// Injected services, passed to the resolver in this order.
    pub services: Vec<String>,
    pub args: Vec<Expr>,
    pub resolver: Resolver,
}

/// Services handed to a resolver, in the order the call declared them.
#[derive(Clone, Default)]
pub struct InjectedServices(pub(crate) Vec<Arc<dyn Any + Send + Sync>>);

impl InjectedServices {
    pub fn get<S>(&self, index: usize) -> Result<Arc<S>, BoxError>
    where
        S: Any + Send + Sync,
    {
        let service = self
            .0
            .get(index)
            .cloned()
            .ok_or_else(|| format!("no service injected at position {index}"))?;
        service.downcast::<S>().map_err(|_| {
            BoxError::from(format!(
                "service at position {index} is not a {}",
                std::any::type_name::<S>()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for InjectedServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InjectedServices({})", self.0.len())
    }
}

/// The input of a resolver call.
#[derive(Debug)]
pub struct CallInput {
    pub args: Vec<Value>,
    pub services: InjectedServices,
}

impl CallInput {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }
}

pub type SyncResolverFn = dyn Fn(CallInput) -> Result<Value, BoxError> + Send + Sync;
pub type AsyncResolverFn =
    dyn Fn(CallInput) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync;
pub type StreamResolverFn =
    dyn Fn(CallInput) -> BoxStream<'static, Result<Value, BoxError>> + Send + Sync;

/// An external resolver.
#[derive(Clone)]
pub enum Resolver {
    Sync(Arc<SyncResolverFn>),
    Async(Arc<AsyncResolverFn>),
    Stream(Arc<StreamResolverFn>),
}

impl Resolver {
    pub fn sync<F>(resolver: F) -> Self
    where
        F: Fn(CallInput) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        Resolver::Sync(Arc::new(resolver))
    }

    pub fn future<F, Fut>(resolver: F) -> Self
    where
        F: Fn(CallInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        Resolver::Async(Arc::new(move |input| resolver(input).boxed()))
    }

    pub fn stream<F, S>(resolver: F) -> Self
    where
        F: Fn(CallInput) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value, BoxError>> + Send + 'static,
    {
        Resolver::Stream(Arc::new(move |input| resolver(input).boxed()))
    }

    pub fn is_async(&self) -> bool {
        !matches!(self, Resolver::Sync(_))
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolver::Sync(_) => f.write_str("Resolver::Sync"),
            Resolver::Async(_) => f.write_str("Resolver::Async"),
            Resolver::Stream(_) => f.write_str("Resolver::Stream"),
        }
    }
}
