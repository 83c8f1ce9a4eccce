//! Schema metadata: types, fields, arguments and resolvers.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::Stream;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use indexmap::IndexMap;
use indexmap::IndexSet;
use tower::BoxError;

use crate::ir::CallSite;
use crate::ir::Expr;
use crate::ir::InjectedServices;
use crate::ir::rewrite::extracted_name;
use crate::spec::FieldType;
use crate::spec::OperationKind;
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Object,
    Interface,
    Union,
    Scalar,
    Enum,
    InputObject,
}

#[derive(Clone, Debug)]
pub struct TypeDefinition {
    pub name: String,
    pub kind: TypeKind,
    pub fields: IndexMap<String, Arc<FieldDefinition>>,
    /// Interfaces implemented by an object or interface.
    pub implements: Vec<String>,
    /// Members of a union.
    pub members: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ArgumentDefinition {
    pub name: String,
    pub ty: FieldType,
    pub default: Option<Value>,
}

/// A parent member chain a service-backed field reads, projected on its own so the query
/// provider can fetch it before the services run.
#[derive(Clone, Debug)]
pub struct ExtractedField {
    pub name: String,
    pub expr: Expr,
}

#[derive(Debug)]
pub struct BulkInput {
    /// Distinct, non-null keys selected from every row.
    pub keys: Vec<Value>,
    pub services: InjectedServices,
}

pub type SyncBulkFn = dyn Fn(BulkInput) -> Result<Vec<(Value, Value)>, BoxError> + Send + Sync;
pub type AsyncBulkFn =
    dyn Fn(BulkInput) -> BoxFuture<'static, Result<Vec<(Value, Value)>, BoxError>> + Send + Sync;

/// Loads the values of a field for a whole batch of keys at once, as `(key, value)` pairs.
#[derive(Clone)]
pub enum BulkLoader {
    Sync(Arc<SyncBulkFn>),
    Async(Arc<AsyncBulkFn>),
}

impl BulkLoader {
    pub fn sync<F>(loader: F) -> Self
    where
        F: Fn(BulkInput) -> Result<Vec<(Value, Value)>, BoxError> + Send + Sync + 'static,
    {
        BulkLoader::Sync(Arc::new(loader))
    }

    pub fn future<F, Fut>(loader: F) -> Self
    where
        F: Fn(BulkInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<(Value, Value)>, BoxError>> + Send + 'static,
    {
        BulkLoader::Async(Arc::new(move |input| loader(input).boxed()))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, BulkLoader::Async(_))
    }
}

impl fmt::Debug for BulkLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkLoader::Sync(_) => f.write_str("BulkLoader::Sync"),
            BulkLoader::Async(_) => f.write_str("BulkLoader::Async"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BulkResolverDefinition {
    /// Selects the batch key from a row, written over [`crate::ir::Var::Parent`].
    pub data_selector: Expr,
    pub loader: BulkLoader,
    pub services: Vec<String>,
}

/// Input of a mutation or subscription resolver.
pub struct ResolverInput {
    pub arguments: IndexMap<String, Value>,
    /// The root context of the operation.
    pub root: Value,
    services: IndexMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ResolverInput {
    pub(crate) fn new(
        arguments: IndexMap<String, Value>,
        root: Value,
        services: IndexMap<String, Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            arguments,
            root,
            services,
        }
    }

    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }

    pub fn service<S>(&self, name: &str) -> Result<Arc<S>, BoxError>
    where
        S: Any + Send + Sync,
    {
        let service = self
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| format!("service '{name}' was not injected"))?;
        service.downcast::<S>().map_err(|_| {
            BoxError::from(format!(
                "service '{name}' is not a {}",
                std::any::type_name::<S>()
            ))
        })
    }
}

impl fmt::Debug for ResolverInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverInput")
            .field("arguments", &self.arguments)
            .field("root", &self.root)
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

/// An operation over the root context, returned by a mutation instead of a value so the
/// requested selection can still be pushed down to the query provider.
#[derive(Clone, Debug)]
pub struct DerivedView {
    /// Written over [`crate::ir::Var::Root`].
    pub expr: Expr,
    pub cardinality: Cardinality,
}

/// What a mutation or a subscription event produced.
#[derive(Clone, Debug)]
pub enum OperationOutcome {
    Value(Value),
    View(DerivedView),
}

impl From<Value> for OperationOutcome {
    fn from(value: Value) -> Self {
        OperationOutcome::Value(value)
    }
}

impl From<DerivedView> for OperationOutcome {
    fn from(view: DerivedView) -> Self {
        OperationOutcome::View(view)
    }
}

pub type MutationFn = dyn Fn(
        ResolverInput,
    ) -> BoxFuture<'static, Result<OperationOutcome, BoxError>>
    + Send
    + Sync;
pub type SubscriptionFn = dyn Fn(
        ResolverInput,
    ) -> Result<BoxStream<'static, Result<OperationOutcome, BoxError>>, BoxError>
    + Send
    + Sync;

#[derive(Clone)]
pub enum RootOperation {
    Mutation(Arc<MutationFn>),
    Subscription(Arc<SubscriptionFn>),
}

impl fmt::Debug for RootOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootOperation::Mutation(_) => f.write_str("RootOperation::Mutation"),
            RootOperation::Subscription(_) => f.write_str("RootOperation::Subscription"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FieldDefinition {
    pub name: String,
    pub parent_type: String,
    pub ty: FieldType,
    pub arguments: Vec<ArgumentDefinition>,
    /// How the field is computed from its parent, over [`crate::ir::Var::Parent`] and
    /// [`crate::ir::Var::Argument`].
    pub resolve: Expr,
    /// Injected services needed by the resolver, the bulk loader or the root operation.
    pub services: Vec<String>,
    pub is_async: bool,
    pub extracted: Vec<ExtractedField>,
    pub bulk: Option<BulkResolverDefinition>,
    pub max_concurrency: Option<usize>,
    pub operation: Option<RootOperation>,
}

impl FieldDefinition {
    /// `Type.field`
    pub fn coordinate(&self) -> String {
        format!("{}.{}", self.parent_type, self.name)
    }

    /// Whether the provider cannot compute this field on its own.
    pub fn requires_services(&self) -> bool {
        !self.services.is_empty() || self.bulk.is_some()
    }

    pub fn argument(&self, name: &str) -> Option<&ArgumentDefinition> {
        self.arguments.iter().find(|argument| argument.name == name)
    }
}

pub struct FieldBuilder {
    name: String,
    ty: FieldType,
    arguments: Vec<ArgumentDefinition>,
    resolve: Option<Expr>,
    bulk: Option<BulkResolverDefinition>,
    services: Vec<String>,
    max_concurrency: Option<usize>,
    operation: Option<RootOperation>,
}

impl FieldBuilder {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            arguments: Vec::new(),
            resolve: None,
            bulk: None,
            services: Vec::new(),
            max_concurrency: None,
            operation: None,
        }
    }

    pub fn argument(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.arguments.push(ArgumentDefinition {
            name: name.into(),
            ty,
            default: None,
        });
        self
    }

    pub fn argument_with_default(
        mut self,
        name: impl Into<String>,
        ty: FieldType,
        default: impl Into<Value>,
    ) -> Self {
        self.arguments.push(ArgumentDefinition {
            name: name.into(),
            ty,
            default: Some(default.into()),
        });
        self
    }

    /// Defaults to reading the member with the field name from the parent.
    pub fn resolve(mut self, resolve: Expr) -> Self {
        self.resolve = Some(resolve);
        self
    }

    pub fn bulk<S>(
        mut self,
        data_selector: Expr,
        loader: BulkLoader,
        services: impl IntoIterator<Item = S>,
    ) -> Self
    where
        S: Into<String>,
    {
        self.bulk = Some(BulkResolverDefinition {
            data_selector,
            loader,
            services: services.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Injects a service into the mutation or subscription resolver.
    pub fn service(mut self, name: impl Into<String>) -> Self {
        self.services.push(name.into());
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn mutation<F, Fut>(mut self, resolver: F) -> Self
    where
        F: Fn(ResolverInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<OperationOutcome, BoxError>> + Send + 'static,
    {
        self.operation = Some(RootOperation::Mutation(Arc::new(move |input| {
            resolver(input).boxed()
        })));
        self
    }

    pub fn subscription<F, S>(mut self, resolver: F) -> Self
    where
        F: Fn(ResolverInput) -> Result<S, BoxError> + Send + Sync + 'static,
        S: Stream<Item = Result<OperationOutcome, BoxError>> + Send + 'static,
    {
        self.operation = Some(RootOperation::Subscription(Arc::new(move |input| {
            resolver(input).map(StreamExt::boxed)
        })));
        self
    }

    fn build(self, parent_type: &str) -> FieldDefinition {
        let site = CallSite {
            coordinate: format!("{parent_type}.{}", self.name),
            max_concurrency: self.max_concurrency,
        };
        let resolve = self
            .resolve
            .unwrap_or_else(|| Expr::parent().member(self.name.clone()))
            .with_call_site(&site);
        let bulk = self.bulk.map(|bulk| BulkResolverDefinition {
            data_selector: bulk.data_selector.with_call_site(&site),
            ..bulk
        });

        let mut services: IndexSet<String> = IndexSet::new();
        let mut is_async = false;
        for call in resolve.calls() {
            services.extend(call.services.iter().cloned());
            is_async |= call.resolver.is_async();
        }
        if let Some(bulk) = &bulk {
            services.extend(bulk.services.iter().cloned());
            is_async |= bulk.loader.is_async();
        }
        services.extend(self.services);

        let mut extracted: Vec<ExtractedField> = Vec::new();
        if !services.is_empty() || bulk.is_some() {
            let chains = match &bulk {
                Some(bulk) => bulk.data_selector.parent_chains(),
                None => resolve.parent_chains(),
            };
            for chain in chains {
                let name = extracted_name(&chain);
                if extracted.iter().any(|field| field.name == name) {
                    continue;
                }
                let expr = chain
                    .iter()
                    .fold(Expr::parent(), |expr, member| expr.member(member.clone()));
                extracted.push(ExtractedField { name, expr });
            }
        }

        FieldDefinition {
            name: self.name,
            parent_type: parent_type.to_string(),
            ty: self.ty,
            arguments: self.arguments,
            resolve,
            services: services.into_iter().collect(),
            is_async,
            extracted,
            bulk,
            max_concurrency: self.max_concurrency,
            operation: self.operation,
        }
    }
}

pub struct TypeBuilder {
    name: String,
    kind: TypeKind,
    fields: Vec<FieldBuilder>,
    implements: Vec<String>,
    members: Vec<String>,
}

impl TypeBuilder {
    fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            fields: Vec::new(),
            implements: Vec::new(),
            members: Vec::new(),
        }
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::Object)
    }

    pub fn interface(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::Interface)
    }

    pub fn union(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::Union)
    }

    pub fn scalar(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::Scalar)
    }

    pub fn enumeration(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::Enum)
    }

    pub fn input_object(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::InputObject)
    }

    pub fn field(mut self, field: FieldBuilder) -> Self {
        self.fields.push(field);
        self
    }

    pub fn input_field(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.field(FieldBuilder::new(name, ty))
    }

    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.implements.push(interface.into());
        self
    }

    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.members.push(member.into());
        self
    }

    pub fn build(self) -> TypeDefinition {
        let name = self.name;
        let fields = self
            .fields
            .into_iter()
            .map(|field| {
                let field = field.build(&name);
                (field.name.clone(), Arc::new(field))
            })
            .collect();
        TypeDefinition {
            name,
            kind: self.kind,
            fields,
            implements: self.implements,
            members: self.members,
        }
    }
}

#[derive(Debug)]
pub struct Schema {
    types: IndexMap<String, TypeDefinition>,
    query: String,
    mutation: Option<String>,
    subscription: Option<String>,
}

#[derive(Default)]
pub struct SchemaBuilder {
    types: IndexMap<String, TypeDefinition>,
    query: Option<String>,
    mutation: Option<String>,
    subscription: Option<String>,
}

impl SchemaBuilder {
    pub fn query(mut self, name: impl Into<String>) -> Self {
        self.query = Some(name.into());
        self
    }

    pub fn mutation(mut self, name: impl Into<String>) -> Self {
        self.mutation = Some(name.into());
        self
    }

    pub fn subscription(mut self, name: impl Into<String>) -> Self {
        self.subscription = Some(name.into());
        self
    }

    pub fn ty(mut self, ty: TypeDefinition) -> Self {
        self.types.insert(ty.name.clone(), ty);
        self
    }

    pub fn build(self) -> Schema {
        Schema {
            types: self.types,
            query: self.query.unwrap_or_else(|| "Query".to_string()),
            mutation: self.mutation,
            subscription: self.subscription,
        }
    }
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn type_definition(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.get(name)
    }

    pub fn field(&self, type_name: &str, field: &str) -> Option<&Arc<FieldDefinition>> {
        self.types.get(type_name)?.fields.get(field)
    }

    /// The root type of an operation kind.
    pub fn root_type(&self, kind: OperationKind) -> Option<&str> {
        match kind {
            OperationKind::Query => Some(self.query.as_str()),
            OperationKind::Mutation => self.mutation.as_deref(),
            OperationKind::Subscription => self.subscription.as_deref(),
            OperationKind::FragmentDefinition => None,
        }
    }

    pub fn is_abstract(&self, name: &str) -> bool {
        matches!(
            self.types.get(name).map(|ty| ty.kind),
            Some(TypeKind::Interface | TypeKind::Union)
        )
    }

    /// Whether selections on this type produce records.
    pub fn is_composite(&self, name: &str) -> bool {
        matches!(
            self.types.get(name).map(|ty| ty.kind),
            Some(TypeKind::Object | TypeKind::Interface | TypeKind::Union)
        )
    }

    /// The concrete object types a value of this type can have.
    pub fn possible_types(&self, name: &str) -> Vec<String> {
        match self.types.get(name).map(|ty| ty.kind) {
            Some(TypeKind::Object) => vec![name.to_string()],
            Some(TypeKind::Union) => self.types[name].members.clone(),
            Some(TypeKind::Interface) => self
                .types
                .values()
                .filter(|ty| ty.kind == TypeKind::Object && self.is_subtype(name, &ty.name))
                .map(|ty| ty.name.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_subtype(&self, abstract_type: &str, maybe_subtype: &str) -> bool {
        match self.types.get(abstract_type).map(|ty| ty.kind) {
            Some(TypeKind::Union) => self.types[abstract_type]
                .members
                .iter()
                .any(|member| member == maybe_subtype),
            Some(TypeKind::Interface) => self
                .types
                .get(maybe_subtype)
                .map(|ty| {
                    ty.implements.iter().any(|interface| {
                        interface == abstract_type || self.is_subtype(abstract_type, interface)
                    })
                })
                .unwrap_or(false),
            _ => false,
        }
    }

    // given two types, returns the one that implements the other, if applicable
    pub fn most_precise<'f>(&self, a: &'f str, b: &'f str) -> Option<&'f str> {
        if a == b {
            return Some(a);
        }
        if self.is_subtype(a, b) {
            Some(b)
        } else if self.is_subtype(b, a) {
            Some(a)
        } else {
            // No relationship between a and b
            None
        }
    }
}
